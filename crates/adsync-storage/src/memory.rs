//! In-process [`MetricsStore`] used by tests and the fixture-backed CLI mode.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use adsync_core::{
    AdAccount, Campaign, CampaignStatus, CampaignUpsert, Client, ConnectedAccount, DailyMetric,
    DailyMetricUpsert, DateRange, NewNotification, NewSyncLogEntry, Notification, SyncLogEntry,
    SyncSchedule,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::store::{dedup_campaign_batch, dedup_metric_batch, MetricsStore, RunLease, StoreError};

#[derive(Debug, Default)]
struct State {
    clients: Vec<Client>,
    accounts: Vec<AdAccount>,
    campaigns: HashMap<(String, Uuid), Campaign>,
    daily_metrics: HashMap<(Uuid, NaiveDate), DailyMetric>,
    sync_logs: Vec<SyncLogEntry>,
    notifications: Vec<Notification>,
    schedules: HashMap<Uuid, SyncSchedule>,
}

impl State {
    fn user_account_ids(&self, user_id: Uuid) -> Vec<Uuid> {
        self.accounts
            .iter()
            .filter(|a| a.active)
            .filter(|a| {
                self.clients
                    .iter()
                    .any(|c| c.id == a.client_id && c.user_id == user_id && c.active)
            })
            .map(|a| a.id)
            .collect()
    }
}

type RunLocks = Arc<std::sync::Mutex<HashSet<Uuid>>>;

struct MemoryRunLease {
    locks: RunLocks,
    user_id: Uuid,
}

#[async_trait]
impl RunLease for MemoryRunLease {
    async fn release(self: Box<Self>) {}
}

impl Drop for MemoryRunLease {
    fn drop(&mut self) {
        self.locks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.user_id);
    }
}

/// Mirrors the Postgres store's keyed-upsert and dedup semantics in memory.
#[derive(Debug, Default)]
pub struct InMemoryMetricsStore {
    state: Mutex<State>,
    run_locks: RunLocks,
    unavailable: AtomicBool,
    failures_left: AtomicUsize,
}

impl InMemoryMetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// When set, every operation fails with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// The next `count` operations fail with [`StoreError::Unavailable`].
    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store switched off".into()));
        }
        let consumed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if consumed.is_ok() {
            return Err(StoreError::Unavailable("injected store failure".into()));
        }
        Ok(())
    }

    pub async fn insert_client(&self, client: Client) {
        self.state.lock().await.clients.push(client);
    }

    pub async fn insert_account(&self, account: AdAccount) {
        self.state.lock().await.accounts.push(account);
    }

    pub async fn campaign_count(&self) -> usize {
        self.state.lock().await.campaigns.len()
    }

    pub async fn campaign(&self, ad_account_id: Uuid, external_id: &str) -> Option<Campaign> {
        self.state
            .lock()
            .await
            .campaigns
            .get(&(external_id.to_string(), ad_account_id))
            .cloned()
    }

    pub async fn daily_metric_count(&self) -> usize {
        self.state.lock().await.daily_metrics.len()
    }

    pub async fn daily_metric(&self, campaign_id: Uuid, date: NaiveDate) -> Option<DailyMetric> {
        self.state
            .lock()
            .await
            .daily_metrics
            .get(&(campaign_id, date))
            .cloned()
    }

    /// Every sync log entry in append order.
    pub async fn sync_logs(&self) -> Vec<SyncLogEntry> {
        self.state.lock().await.sync_logs.clone()
    }

    /// Every notification, including soft-deleted ones, in insertion order.
    pub async fn notifications(&self) -> Vec<Notification> {
        self.state.lock().await.notifications.clone()
    }
}

#[async_trait]
impl MetricsStore for InMemoryMetricsStore {
    /// Run locks ignore the availability switches.
    async fn try_lock_user_run(&self, user_id: Uuid) -> Result<Option<Box<dyn RunLease>>, StoreError> {
        let mut locks = self.run_locks.lock().unwrap_or_else(|p| p.into_inner());
        if !locks.insert(user_id) {
            return Ok(None);
        }
        Ok(Some(Box::new(MemoryRunLease {
            locks: Arc::clone(&self.run_locks),
            user_id,
        })))
    }

    async fn list_connected_accounts(&self, user_id: Uuid) -> Result<Vec<ConnectedAccount>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut out = Vec::new();
        for client in state.clients.iter().filter(|c| c.user_id == user_id && c.active) {
            for account in state
                .accounts
                .iter()
                .filter(|a| a.client_id == client.id && a.active)
            {
                out.push(ConnectedAccount {
                    client: client.clone(),
                    account: account.clone(),
                });
            }
        }
        out.sort_by(|a, b| {
            a.client
                .name
                .cmp(&b.client.name)
                .then_with(|| a.account.external_account_id.cmp(&b.account.external_account_id))
        });
        Ok(out)
    }

    async fn upsert_campaigns(&self, campaigns: &[CampaignUpsert]) -> Result<Vec<Campaign>, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let mut out = Vec::new();
        for upsert in dedup_campaign_batch(campaigns) {
            if !state.accounts.iter().any(|a| a.id == upsert.ad_account_id) {
                return Err(StoreError::NotFound {
                    entity: "ad account",
                    id: upsert.ad_account_id,
                });
            }
            let key = (upsert.external_id.clone(), upsert.ad_account_id);
            let stored = match state.campaigns.get(&key) {
                Some(existing) => Campaign {
                    name: upsert.name,
                    status: upsert.status,
                    objective: upsert.objective,
                    previous_spend: Some(existing.spend),
                    spend: upsert.spend,
                    reach: upsert.reach,
                    impressions: upsert.impressions,
                    clicks: upsert.clicks,
                    ctr: upsert.ctr,
                    last_synced_at: upsert.synced_at,
                    ..existing.clone()
                },
                None => Campaign {
                    id: Uuid::new_v4(),
                    ad_account_id: upsert.ad_account_id,
                    external_id: upsert.external_id,
                    name: upsert.name,
                    status: upsert.status,
                    objective: upsert.objective,
                    spend: upsert.spend,
                    reach: upsert.reach,
                    impressions: upsert.impressions,
                    clicks: upsert.clicks,
                    ctr: upsert.ctr,
                    previous_spend: None,
                    last_synced_at: upsert.synced_at,
                    created_at: Utc::now(),
                },
            };
            state.campaigns.insert(key, stored.clone());
            out.push(stored);
        }
        Ok(out)
    }

    async fn upsert_daily_metrics(&self, metrics: &[DailyMetricUpsert]) -> Result<usize, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let batch = dedup_metric_batch(metrics);
        for upsert in &batch {
            if !state.campaigns.values().any(|c| c.id == upsert.campaign_id) {
                return Err(StoreError::NotFound {
                    entity: "campaign",
                    id: upsert.campaign_id,
                });
            }
        }
        let now = Utc::now();
        for upsert in &batch {
            let key = (upsert.campaign_id, upsert.date);
            let id = state
                .daily_metrics
                .get(&key)
                .map(|m| m.id)
                .unwrap_or_else(Uuid::new_v4);
            state.daily_metrics.insert(
                key,
                DailyMetric {
                    id,
                    campaign_id: upsert.campaign_id,
                    date: upsert.date,
                    spend: upsert.spend,
                    impressions: upsert.impressions,
                    clicks: upsert.clicks,
                    leads: upsert.leads,
                    ctr: upsert.ctr,
                    cpc: upsert.cpc,
                    cpm: upsert.cpm,
                    updated_at: now,
                },
            );
        }
        Ok(batch.len())
    }

    async fn list_campaigns_for_user(
        &self,
        user_id: Uuid,
        statuses: &[CampaignStatus],
    ) -> Result<Vec<Campaign>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let account_ids = state.user_account_ids(user_id);
        let mut out: Vec<Campaign> = state
            .campaigns
            .values()
            .filter(|c| account_ids.contains(&c.ad_account_id) && statuses.contains(&c.status))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn daily_metrics_in_range(
        &self,
        campaign_id: Uuid,
        range: DateRange,
    ) -> Result<Vec<DailyMetric>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut out: Vec<DailyMetric> = state
            .daily_metrics
            .values()
            .filter(|m| m.campaign_id == campaign_id && range.contains(m.date))
            .cloned()
            .collect();
        out.sort_by_key(|m| m.date);
        Ok(out)
    }

    async fn append_sync_log(&self, entry: &NewSyncLogEntry) -> Result<SyncLogEntry, StoreError> {
        self.check_available()?;
        let stored = SyncLogEntry {
            id: Uuid::new_v4(),
            run_id: entry.run_id,
            user_id: entry.user_id,
            client_id: entry.client_id,
            ad_account_id: entry.ad_account_id,
            status: entry.status,
            campaigns_synced: entry.campaigns_synced,
            metrics_synced: entry.metrics_synced,
            duration_ms: entry.duration_ms,
            error_kind: entry.error_kind,
            error_message: entry.error_message.clone(),
            created_at: Utc::now(),
        };
        self.state.lock().await.sync_logs.push(stored.clone());
        Ok(stored)
    }

    async fn list_sync_logs(&self, user_id: Uuid, limit: i64) -> Result<Vec<SyncLogEntry>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .sync_logs
            .iter()
            .rev()
            .filter(|e| e.user_id == user_id)
            .take(limit.max(1) as usize)
            .cloned()
            .collect())
    }

    async fn insert_notification_deduplicated(
        &self,
        notification: &NewNotification,
        created_at: DateTime<Utc>,
        window_start: DateTime<Utc>,
    ) -> Result<Option<Notification>, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let kind = notification.kind();
        let duplicate = state.notifications.iter().any(|n| {
            n.active
                && n.user_id == notification.user_id
                && n.campaign_id == notification.campaign_id
                && n.kind == kind
                && n.created_at >= window_start
        });
        if duplicate {
            return Ok(None);
        }
        let stored = Notification {
            id: Uuid::new_v4(),
            user_id: notification.user_id,
            campaign_id: notification.campaign_id,
            kind,
            severity: notification.severity,
            title: notification.title.clone(),
            message: notification.message.clone(),
            read: false,
            active: true,
            context: notification.context.clone(),
            created_at,
        };
        state.notifications.push(stored.clone());
        Ok(Some(stored))
    }

    async fn list_notifications(
        &self,
        user_id: Uuid,
        unread_only: bool,
        limit: i64,
    ) -> Result<Vec<Notification>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut out: Vec<Notification> = state
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id && n.active && (!unread_only || !n.read))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(limit.max(1) as usize);
        Ok(out)
    }

    async fn mark_notification_read(&self, user_id: Uuid, notification_id: Uuid) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        match state
            .notifications
            .iter_mut()
            .find(|n| n.id == notification_id && n.user_id == user_id && n.active && !n.read)
        {
            Some(n) => {
                n.read = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_all_notifications_read(&self, user_id: Uuid) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let mut updated = 0u64;
        for n in state
            .notifications
            .iter_mut()
            .filter(|n| n.user_id == user_id && n.active && !n.read)
        {
            n.read = true;
            updated += 1;
        }
        Ok(updated)
    }

    async fn deactivate_notification(&self, user_id: Uuid, notification_id: Uuid) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        match state
            .notifications
            .iter_mut()
            .find(|n| n.id == notification_id && n.user_id == user_id && n.active)
        {
            Some(n) => {
                n.active = false;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_schedule(&self, user_id: Uuid) -> Result<Option<SyncSchedule>, StoreError> {
        self.check_available()?;
        Ok(self.state.lock().await.schedules.get(&user_id).cloned())
    }

    async fn save_schedule(&self, schedule: &SyncSchedule) -> Result<SyncSchedule, StoreError> {
        self.check_available()?;
        self.state
            .lock()
            .await
            .schedules
            .insert(schedule.user_id, schedule.clone());
        Ok(schedule.clone())
    }

    async fn insert_schedule_if_absent(&self, schedule: &SyncSchedule) -> Result<SyncSchedule, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        Ok(state
            .schedules
            .entry(schedule.user_id)
            .or_insert_with(|| schedule.clone())
            .clone())
    }

    async fn list_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<SyncSchedule>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut out: Vec<SyncSchedule> = state
            .schedules
            .values()
            .filter(|s| s.enabled && s.next_run_at.map_or(true, |at| at <= now))
            .cloned()
            .collect();
        out.sort_by_key(|s| s.next_run_at);
        Ok(out)
    }
}
