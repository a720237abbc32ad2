//! Persistence contract between the sync engine and the metrics store.

use std::collections::HashMap;

use adsync_core::{
    Campaign, CampaignStatus, CampaignUpsert, ConnectedAccount, DailyMetric, DailyMetricUpsert,
    DateRange, NewNotification, NewSyncLogEntry, Notification, SyncError, SyncLogEntry,
    SyncSchedule,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("metrics store unavailable: {0}")]
    Unavailable(String),
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("corrupt row: {0}")]
    Decode(String),
}

impl StoreError {
    /// Connection-level failures; keyed upserts may be retried safely.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db)
                if db.is_unique_violation()
                    || db.is_foreign_key_violation()
                    || db.is_check_violation() =>
            {
                StoreError::Constraint(db.message().to_string())
            }
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::TypeNotFound { .. } => StoreError::Decode(err.to_string()),
            _ => StoreError::Unavailable(err.to_string()),
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        SyncError::Storage(err.to_string())
    }
}

/// Proof that this process owns a user's sync slot. Dropping a lease
/// without releasing it still gives the slot up, possibly later.
#[async_trait]
pub trait RunLease: Send {
    async fn release(self: Box<Self>);
}

/// Everything the engine reads from and writes to the relational store.
///
/// Campaigns and daily metrics are keyed upserts (last write wins); sync log
/// entries are append-only; notifications are only ever soft-deleted.
#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Claim the user's sync slot across every process sharing this store.
    /// `None` when another holder has it.
    async fn try_lock_user_run(&self, user_id: Uuid) -> Result<Option<Box<dyn RunLease>>, StoreError>;

    /// Active accounts of the user's active clients.
    async fn list_connected_accounts(&self, user_id: Uuid) -> Result<Vec<ConnectedAccount>, StoreError>;

    /// Upsert on (external id, ad account); returns the stored rows.
    async fn upsert_campaigns(&self, campaigns: &[CampaignUpsert]) -> Result<Vec<Campaign>, StoreError>;

    /// Upsert on (campaign id, date); returns the number of rows written.
    async fn upsert_daily_metrics(&self, metrics: &[DailyMetricUpsert]) -> Result<usize, StoreError>;

    async fn list_campaigns_for_user(
        &self,
        user_id: Uuid,
        statuses: &[CampaignStatus],
    ) -> Result<Vec<Campaign>, StoreError>;

    /// Metrics of one campaign within `range`, oldest first.
    async fn daily_metrics_in_range(
        &self,
        campaign_id: Uuid,
        range: DateRange,
    ) -> Result<Vec<DailyMetric>, StoreError>;

    async fn append_sync_log(&self, entry: &NewSyncLogEntry) -> Result<SyncLogEntry, StoreError>;

    /// Most recent entries first.
    async fn list_sync_logs(&self, user_id: Uuid, limit: i64) -> Result<Vec<SyncLogEntry>, StoreError>;

    /// Insert unless an active notification for the same (user, campaign,
    /// alert type) was created at or after `window_start`. Returns `None`
    /// when suppressed.
    async fn insert_notification_deduplicated(
        &self,
        notification: &NewNotification,
        created_at: DateTime<Utc>,
        window_start: DateTime<Utc>,
    ) -> Result<Option<Notification>, StoreError>;

    /// Active notifications, newest first.
    async fn list_notifications(
        &self,
        user_id: Uuid,
        unread_only: bool,
        limit: i64,
    ) -> Result<Vec<Notification>, StoreError>;

    async fn mark_notification_read(&self, user_id: Uuid, notification_id: Uuid) -> Result<bool, StoreError>;

    async fn mark_all_notifications_read(&self, user_id: Uuid) -> Result<u64, StoreError>;

    /// Soft delete: flips `active` to false.
    async fn deactivate_notification(&self, user_id: Uuid, notification_id: Uuid) -> Result<bool, StoreError>;

    async fn get_schedule(&self, user_id: Uuid) -> Result<Option<SyncSchedule>, StoreError>;

    /// Insert or replace the user's schedule.
    async fn save_schedule(&self, schedule: &SyncSchedule) -> Result<SyncSchedule, StoreError>;

    /// Store `schedule` only if the user has none; returns whichever row is stored.
    async fn insert_schedule_if_absent(&self, schedule: &SyncSchedule) -> Result<SyncSchedule, StoreError>;

    /// Enabled schedules whose next run is unset or at/before `now`.
    async fn list_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<SyncSchedule>, StoreError>;
}

/// Collapse repeated natural keys within one batch, keeping the last write.
pub fn dedup_campaign_batch(campaigns: &[CampaignUpsert]) -> Vec<CampaignUpsert> {
    let mut order: Vec<(String, Uuid)> = Vec::new();
    let mut latest: HashMap<(String, Uuid), CampaignUpsert> = HashMap::new();
    for campaign in campaigns {
        let key = (campaign.external_id.clone(), campaign.ad_account_id);
        if latest.insert(key.clone(), campaign.clone()).is_none() {
            order.push(key);
        }
    }
    order
        .into_iter()
        .filter_map(|key| latest.remove(&key))
        .collect()
}

pub fn dedup_metric_batch(metrics: &[DailyMetricUpsert]) -> Vec<DailyMetricUpsert> {
    let mut order: Vec<(Uuid, NaiveDate)> = Vec::new();
    let mut latest: HashMap<(Uuid, NaiveDate), DailyMetricUpsert> = HashMap::new();
    for metric in metrics {
        let key = (metric.campaign_id, metric.date);
        if latest.insert(key, metric.clone()).is_none() {
            order.push(key);
        }
    }
    order
        .into_iter()
        .filter_map(|key| latest.remove(&key))
        .collect()
}
