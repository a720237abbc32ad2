//! Alert evaluation over stored campaigns and their recent daily metrics.

use std::path::Path;
use std::sync::Arc;

use adsync_core::{
    AlertContext, Campaign, CampaignStatus, DailyMetric, DateRange, NewNotification, Notification,
    Severity, SyncError,
};
use adsync_storage::MetricsStore;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Means at or below this are treated as zero.
const CTR_EPSILON: f64 = 1e-9;
const DEFAULT_NOTIFICATION_LIMIT: i64 = 50;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PerformanceRule {
    pub window_days: u32,
    pub half_window_days: usize,
    pub min_points: usize,
    pub drop_percent_threshold: f64,
}

impl Default for PerformanceRule {
    fn default() -> Self {
        Self {
            window_days: 7,
            half_window_days: 3,
            min_points: 2,
            drop_percent_threshold: 30.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BudgetRule {
    pub overrun_multiplier: f64,
}

impl Default for BudgetRule {
    fn default() -> Self {
        Self { overrun_multiplier: 1.2 }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StatusRule {
    pub recent_pause_minutes: i64,
}

impl Default for StatusRule {
    fn default() -> Self {
        Self { recent_pause_minutes: 60 }
    }
}

/// Detector thresholds, loaded from `rules/alerts.yaml`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AlertRules {
    pub version: u32,
    pub dedup_window_hours: i64,
    pub performance: PerformanceRule,
    pub budget: BudgetRule,
    pub status: StatusRule,
}

impl Default for AlertRules {
    fn default() -> Self {
        Self {
            version: 1,
            dedup_window_hours: 24,
            performance: PerformanceRule::default(),
            budget: BudgetRule::default(),
            status: StatusRule::default(),
        }
    }
}

impl AlertRules {
    /// Built-in defaults apply when `rules/alerts.yaml` does not exist.
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join("rules").join("alerts.yaml");
        if !path.exists() {
            debug!(path = %path.display(), "no alert rules file; using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// A detector hit, before it is addressed to a user.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertSignal {
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub context: AlertContext,
}

impl AlertSignal {
    fn into_notification(self, user_id: Uuid, campaign_id: Uuid) -> NewNotification {
        NewNotification {
            user_id,
            campaign_id,
            severity: self.severity,
            title: self.title,
            message: self.message,
            context: self.context,
        }
    }
}

fn mean_ctr(metrics: &[DailyMetric]) -> f64 {
    if metrics.is_empty() {
        return 0.0;
    }
    metrics.iter().map(|m| m.ctr).sum::<f64>() / metrics.len() as f64
}

/// CTR collapse between the first and last days of the window. `metrics`
/// must be ordered oldest first; the two halves may overlap on short series.
pub fn detect_performance_drop(
    campaign: &Campaign,
    metrics: &[DailyMetric],
    rule: &PerformanceRule,
) -> Option<AlertSignal> {
    if metrics.len() < rule.min_points.max(2) {
        return None;
    }
    let half = rule.half_window_days.clamp(1, metrics.len());
    let first = mean_ctr(&metrics[..half]);
    let second = mean_ctr(&metrics[metrics.len() - half..]);
    if !first.is_finite() || !second.is_finite() || first <= CTR_EPSILON {
        return None;
    }
    let drop_percent = (first - second) / first * 100.0;
    if drop_percent <= rule.drop_percent_threshold {
        return None;
    }
    Some(AlertSignal {
        severity: Severity::Warning,
        title: format!("CTR drop on {}", campaign.name),
        message: format!(
            "CTR fell {drop_percent:.1}% over the last {} days ({first:.2}% to {second:.2}%)",
            rule.window_days
        ),
        context: AlertContext::Performance {
            ctr_first_half: first,
            ctr_second_half: second,
            drop_percent,
        },
    })
}

/// Spend beyond the baseline plus headroom. The baseline is the spend held
/// before the latest sync; without one the campaign is compared to itself.
pub fn detect_budget_overrun(campaign: &Campaign, rule: &BudgetRule) -> Option<AlertSignal> {
    let baseline = campaign.previous_spend.unwrap_or(campaign.spend);
    if !baseline.is_finite() || baseline <= 0.0 {
        return None;
    }
    let threshold = baseline * rule.overrun_multiplier;
    if campaign.spend <= threshold {
        return None;
    }
    Some(AlertSignal {
        severity: Severity::Error,
        title: format!("Budget overrun on {}", campaign.name),
        message: format!(
            "Spend reached {:.2}, above the {:.2} threshold",
            campaign.spend, threshold
        ),
        context: AlertContext::Budget {
            spend: campaign.spend,
            baseline,
            threshold,
        },
    })
}

/// A paused campaign whose status was refreshed within the recent window.
pub fn detect_status_change(campaign: &Campaign, now: DateTime<Utc>, rule: &StatusRule) -> Option<AlertSignal> {
    if campaign.status != CampaignStatus::Paused {
        return None;
    }
    if now - campaign.last_synced_at >= Duration::minutes(rule.recent_pause_minutes) {
        return None;
    }
    Some(AlertSignal {
        severity: Severity::Info,
        title: format!("{} was paused", campaign.name),
        message: format!("Campaign {} changed from ACTIVE to PAUSED", campaign.name),
        context: AlertContext::Status {
            previous_status: CampaignStatus::Active,
            current_status: CampaignStatus::Paused,
        },
    })
}

#[derive(Clone)]
pub struct AlertEvaluator {
    store: Arc<dyn MetricsStore>,
    rules: AlertRules,
}

impl AlertEvaluator {
    pub fn new(store: Arc<dyn MetricsStore>, rules: AlertRules) -> Self {
        Self { store, rules }
    }

    pub fn rules(&self) -> &AlertRules {
        &self.rules
    }

    /// Evaluate every non-archived campaign the user owns.
    pub async fn evaluate_user(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<Vec<Notification>, SyncError> {
        let campaigns = self
            .store
            .list_campaigns_for_user(user_id, &[CampaignStatus::Active, CampaignStatus::Paused])
            .await?;
        self.evaluate_campaigns(user_id, &campaigns, now).await
    }

    /// Run the detectors and insert deduplicated notifications. A failed read
    /// or insert for one signal is logged and does not stop the others.
    pub async fn evaluate_campaigns(
        &self,
        user_id: Uuid,
        campaigns: &[Campaign],
        now: DateTime<Utc>,
    ) -> Result<Vec<Notification>, SyncError> {
        let window = DateRange::trailing(now.date_naive(), self.rules.performance.window_days);
        let mut signals: Vec<(Uuid, AlertSignal)> = Vec::new();

        for campaign in campaigns {
            match campaign.status {
                CampaignStatus::Active => {
                    match self.store.daily_metrics_in_range(campaign.id, window).await {
                        Ok(metrics) => {
                            if let Some(signal) =
                                detect_performance_drop(campaign, &metrics, &self.rules.performance)
                            {
                                signals.push((campaign.id, signal));
                            }
                        }
                        Err(err) => {
                            warn!(campaign_id = %campaign.id, error = %err, "skipping performance check");
                        }
                    }
                    if let Some(signal) = detect_budget_overrun(campaign, &self.rules.budget) {
                        signals.push((campaign.id, signal));
                    }
                }
                CampaignStatus::Paused => {
                    if let Some(signal) = detect_status_change(campaign, now, &self.rules.status) {
                        signals.push((campaign.id, signal));
                    }
                }
                CampaignStatus::Archived => {}
            }
        }

        let window_start = now - Duration::hours(self.rules.dedup_window_hours);
        let mut created = Vec::new();
        for (campaign_id, signal) in signals {
            let kind = signal.context.kind();
            let notification = signal.into_notification(user_id, campaign_id);
            match self
                .store
                .insert_notification_deduplicated(&notification, now, window_start)
                .await
            {
                Ok(Some(stored)) => created.push(stored),
                Ok(None) => debug!(%campaign_id, alert = %kind, "suppressed duplicate alert"),
                Err(err) => warn!(%campaign_id, alert = %kind, error = %err, "alert not stored"),
            }
        }
        if !created.is_empty() {
            info!(%user_id, created = created.len(), "alerts raised");
        }
        Ok(created)
    }

    pub async fn list_notifications(
        &self,
        user_id: Uuid,
        unread_only: bool,
        limit: Option<i64>,
    ) -> Result<Vec<Notification>, SyncError> {
        let limit = limit.unwrap_or(DEFAULT_NOTIFICATION_LIMIT).clamp(1, 500);
        Ok(self.store.list_notifications(user_id, unread_only, limit).await?)
    }

    pub async fn mark_read(&self, user_id: Uuid, notification_id: Uuid) -> Result<bool, SyncError> {
        Ok(self.store.mark_notification_read(user_id, notification_id).await?)
    }

    pub async fn mark_all_read(&self, user_id: Uuid) -> Result<u64, SyncError> {
        Ok(self.store.mark_all_notifications_read(user_id).await?)
    }

    /// Soft delete; the row stays with `active = false`.
    pub async fn dismiss(&self, user_id: Uuid, notification_id: Uuid) -> Result<bool, SyncError> {
        Ok(self.store.deactivate_notification(user_id, notification_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adsync_core::{AdAccount, AlertKind, CampaignUpsert, Client, DailyMetricUpsert, Platform};
    use adsync_storage::InMemoryMetricsStore;
    use chrono::NaiveDate;

    fn campaign(status: CampaignStatus, spend: f64, previous_spend: Option<f64>) -> Campaign {
        Campaign {
            id: Uuid::new_v4(),
            ad_account_id: Uuid::new_v4(),
            external_id: "c1".into(),
            name: "Spring".into(),
            status,
            objective: None,
            spend,
            reach: 0,
            impressions: 0,
            clicks: 0,
            ctr: 0.0,
            previous_spend,
            last_synced_at: Utc::now(),
            created_at: Utc::now(),
        }
    }

    fn series(campaign_id: Uuid, ctrs: &[f64]) -> Vec<DailyMetric> {
        let start = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        ctrs.iter()
            .enumerate()
            .map(|(i, ctr)| DailyMetric {
                id: Uuid::new_v4(),
                campaign_id,
                date: start + Duration::days(i as i64),
                spend: 1.0,
                impressions: 100,
                clicks: 1,
                leads: 0,
                ctr: *ctr,
                cpc: 0.0,
                cpm: 0.0,
                updated_at: Utc::now(),
            })
            .collect()
    }

    #[test]
    fn fifty_percent_ctr_drop_raises_a_warning() {
        let c = campaign(CampaignStatus::Active, 0.0, None);
        let metrics = series(c.id, &[2.0, 2.0, 2.0, 1.5, 1.0, 1.0, 1.0]);
        let signal = detect_performance_drop(&c, &metrics, &PerformanceRule::default()).unwrap();
        assert_eq!(signal.severity, Severity::Warning);
        match signal.context {
            AlertContext::Performance { drop_percent, .. } => assert!((drop_percent - 50.0).abs() < 1e-9),
            other => panic!("unexpected context {other:?}"),
        }
    }

    #[test]
    fn twenty_percent_drop_and_exact_threshold_stay_quiet() {
        let c = campaign(CampaignStatus::Active, 0.0, None);
        let rule = PerformanceRule::default();
        assert!(detect_performance_drop(&c, &series(c.id, &[2.0, 2.0, 2.0, 1.6, 1.6, 1.6]), &rule).is_none());
        let at_threshold = PerformanceRule {
            drop_percent_threshold: 25.0,
            ..PerformanceRule::default()
        };
        assert!(detect_performance_drop(&c, &series(c.id, &[1.0, 1.0, 1.0, 0.75, 0.75, 0.75]), &at_threshold).is_none());
    }

    #[test]
    fn zero_baseline_ctr_and_short_series_never_alert() {
        let c = campaign(CampaignStatus::Active, 0.0, None);
        let rule = PerformanceRule::default();
        assert!(detect_performance_drop(&c, &series(c.id, &[0.0, 0.0, 0.0, 0.0]), &rule).is_none());
        assert!(detect_performance_drop(&c, &series(c.id, &[3.0]), &rule).is_none());
        assert!(detect_performance_drop(&c, &[], &rule).is_none());
    }

    #[test]
    fn two_point_series_compares_overlapping_halves() {
        let c = campaign(CampaignStatus::Active, 0.0, None);
        let signal = detect_performance_drop(&c, &series(c.id, &[4.0, 1.0]), &PerformanceRule::default());
        // both halves cover both days, so the means match
        assert!(signal.is_none());
    }

    #[test]
    fn budget_overrun_uses_previous_spend_as_baseline() {
        let rule = BudgetRule::default();
        let over = campaign(CampaignStatus::Active, 130.0, Some(100.0));
        let signal = detect_budget_overrun(&over, &rule).unwrap();
        assert_eq!(signal.severity, Severity::Error);
        assert_eq!(
            signal.context,
            AlertContext::Budget {
                spend: 130.0,
                baseline: 100.0,
                threshold: 100.0 * 1.2
            }
        );

        assert!(detect_budget_overrun(&campaign(CampaignStatus::Active, 110.0, Some(100.0)), &rule).is_none());
        assert!(detect_budget_overrun(&campaign(CampaignStatus::Active, 500.0, None), &rule).is_none());
        assert!(detect_budget_overrun(&campaign(CampaignStatus::Active, 50.0, Some(0.0)), &rule).is_none());
    }

    #[test]
    fn recently_paused_campaign_raises_info() {
        let rule = StatusRule::default();
        let now = Utc::now();
        let mut paused = campaign(CampaignStatus::Paused, 0.0, None);
        paused.last_synced_at = now - Duration::minutes(10);
        let signal = detect_status_change(&paused, now, &rule).unwrap();
        assert_eq!(signal.severity, Severity::Info);

        paused.last_synced_at = now - Duration::hours(2);
        assert!(detect_status_change(&paused, now, &rule).is_none());

        let active = campaign(CampaignStatus::Active, 0.0, None);
        assert!(detect_status_change(&active, now, &rule).is_none());
    }

    #[test]
    fn rules_file_overrides_defaults_and_absent_file_uses_them() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(AlertRules::from_workspace_root(dir.path()).unwrap(), AlertRules::default());

        std::fs::create_dir_all(dir.path().join("rules")).unwrap();
        std::fs::write(
            dir.path().join("rules/alerts.yaml"),
            "version: 1\nperformance:\n  drop_percent_threshold: 10\n",
        )
        .unwrap();
        let rules = AlertRules::from_workspace_root(dir.path()).unwrap();
        assert_eq!(rules.performance.drop_percent_threshold, 10.0);
        assert_eq!(rules.performance.window_days, 7);
        assert_eq!(rules.dedup_window_hours, 24);
    }

    async fn seeded_store() -> (Arc<InMemoryMetricsStore>, Uuid, Campaign) {
        let store = Arc::new(InMemoryMetricsStore::new());
        let user_id = Uuid::new_v4();
        let client = Client {
            id: Uuid::new_v4(),
            user_id,
            name: "Acme".into(),
            active: true,
        };
        let account = AdAccount {
            id: Uuid::new_v4(),
            client_id: client.id,
            platform: Platform::MetaAds,
            external_account_id: "act_1".into(),
            access_token: "token".into(),
            refresh_token: None,
            token_expires_at: None,
            active: true,
        };
        let account_id = account.id;
        store.insert_client(client).await;
        store.insert_account(account).await;
        let stored = store
            .upsert_campaigns(&[CampaignUpsert {
                ad_account_id: account_id,
                external_id: "c1".into(),
                name: "Spring".into(),
                status: CampaignStatus::Active,
                objective: None,
                spend: 10.0,
                reach: 0,
                impressions: 0,
                clicks: 0,
                ctr: 0.0,
                synced_at: Utc::now(),
            }])
            .await
            .unwrap();
        (store, user_id, stored[0].clone())
    }

    #[tokio::test]
    async fn repeated_evaluation_is_deduplicated_within_the_window() {
        let (store, user_id, campaign) = seeded_store().await;
        let today = Utc::now().date_naive();
        let rows: Vec<DailyMetricUpsert> = [3.0, 3.0, 3.0, 1.0, 1.0, 1.0]
            .iter()
            .enumerate()
            .map(|(i, ctr)| DailyMetricUpsert {
                campaign_id: campaign.id,
                date: today - Duration::days(5 - i as i64),
                spend: 1.0,
                impressions: 100,
                clicks: 2,
                leads: 0,
                ctr: *ctr,
                cpc: 0.0,
                cpm: 0.0,
            })
            .collect();
        store.upsert_daily_metrics(&rows).await.unwrap();

        let evaluator = AlertEvaluator::new(store.clone(), AlertRules::default());
        let now = Utc::now();
        let first = evaluator.evaluate_user(user_id, now).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].kind, AlertKind::Performance);

        let second = evaluator
            .evaluate_user(user_id, now + Duration::hours(1))
            .await
            .unwrap();
        assert!(second.is_empty());
        assert_eq!(store.notifications().await.len(), 1);

        let later = evaluator
            .evaluate_user(user_id, now + Duration::hours(25))
            .await
            .unwrap();
        assert_eq!(later.len(), 1);
    }

    #[tokio::test]
    async fn failed_insert_does_not_drop_the_remaining_alerts() {
        let store = Arc::new(InMemoryMetricsStore::new());
        let evaluator = AlertEvaluator::new(store.clone(), AlertRules::default());
        let user_id = Uuid::new_v4();
        let now = Utc::now();
        let mut first = campaign(CampaignStatus::Paused, 0.0, None);
        first.last_synced_at = now - Duration::minutes(5);
        let mut second = campaign(CampaignStatus::Paused, 0.0, None);
        second.last_synced_at = now - Duration::minutes(5);

        store.fail_next(1);
        let created = evaluator
            .evaluate_campaigns(user_id, &[first, second.clone()], now)
            .await
            .unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].campaign_id, second.id);
    }

    #[tokio::test]
    async fn notification_maintenance_round() {
        let (store, user_id, campaign) = seeded_store().await;
        let evaluator = AlertEvaluator::new(store.clone(), AlertRules::default());
        let now = Utc::now();
        for kind_context in [
            AlertContext::Budget {
                spend: 2.0,
                baseline: 1.0,
                threshold: 1.2,
            },
            AlertContext::Status {
                previous_status: CampaignStatus::Active,
                current_status: CampaignStatus::Paused,
            },
        ] {
            store
                .insert_notification_deduplicated(
                    &NewNotification {
                        user_id,
                        campaign_id: campaign.id,
                        severity: Severity::Info,
                        title: "t".into(),
                        message: "m".into(),
                        context: kind_context,
                    },
                    now,
                    now - Duration::hours(24),
                )
                .await
                .unwrap();
        }

        let all = evaluator.list_notifications(user_id, false, None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(evaluator.mark_read(user_id, all[0].id).await.unwrap());
        assert_eq!(evaluator.list_notifications(user_id, true, None).await.unwrap().len(), 1);
        assert_eq!(evaluator.mark_all_read(user_id).await.unwrap(), 1);
        assert!(evaluator.dismiss(user_id, all[1].id).await.unwrap());
        assert_eq!(evaluator.list_notifications(user_id, false, None).await.unwrap().len(), 1);
        assert!(!evaluator.dismiss(Uuid::new_v4(), all[0].id).await.unwrap());
    }
}
