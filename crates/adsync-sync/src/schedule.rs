//! Per-user sync cadence: when the last run happened and when the next is due.

use std::sync::Arc;

use adsync_core::{SyncError, SyncSchedule};
use adsync_storage::MetricsStore;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

/// Time of day (UTC) used when a schedule carries none or an unparseable one.
pub const DEFAULT_RUN_TIME: &str = "07:00";
pub const DEFAULT_INTERVAL_HOURS: i32 = 24;

pub fn parse_run_time(raw: &str) -> Result<NaiveTime, SyncError> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|_| SyncError::Config(format!("invalid run time `{raw}`, expected HH:MM")))
}

/// The day after `now`, at `run_time`.
pub fn next_run_after(now: DateTime<Utc>, run_time: &str) -> Result<DateTime<Utc>, SyncError> {
    let time = parse_run_time(run_time)?;
    let tomorrow = now.date_naive() + Duration::days(1);
    Ok(tomorrow.and_time(time).and_utc())
}

pub fn default_schedule(user_id: Uuid) -> SyncSchedule {
    SyncSchedule {
        user_id,
        enabled: true,
        run_time: DEFAULT_RUN_TIME.to_string(),
        interval_hours: DEFAULT_INTERVAL_HOURS,
        last_run_at: None,
        next_run_at: None,
    }
}

/// Partial update; absent fields keep their stored value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScheduleSettings {
    pub enabled: Option<bool>,
    pub run_time: Option<String>,
    pub interval_hours: Option<i32>,
}

#[derive(Clone)]
pub struct ScheduleTracker {
    store: Arc<dyn MetricsStore>,
}

impl ScheduleTracker {
    pub fn new(store: Arc<dyn MetricsStore>) -> Self {
        Self { store }
    }

    pub async fn get_schedule(&self, user_id: Uuid) -> Result<Option<SyncSchedule>, SyncError> {
        Ok(self.store.get_schedule(user_id).await?)
    }

    /// Enabled, every 24 h at 07:00. An existing schedule is returned as is.
    pub async fn create_default_schedule(&self, user_id: Uuid) -> Result<SyncSchedule, SyncError> {
        Ok(self
            .store
            .insert_schedule_if_absent(&default_schedule(user_id))
            .await?)
    }

    pub async fn get_or_create(&self, user_id: Uuid) -> Result<SyncSchedule, SyncError> {
        match self.get_schedule(user_id).await? {
            Some(schedule) => Ok(schedule),
            None => self.create_default_schedule(user_id).await,
        }
    }

    /// Record a finished run at `now` and push the next run to tomorrow.
    pub async fn update_after_run(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<SyncSchedule, SyncError> {
        let mut schedule = self
            .get_schedule(user_id)
            .await?
            .unwrap_or_else(|| default_schedule(user_id));

        let next_run_at = match next_run_after(now, &schedule.run_time) {
            Ok(at) => at,
            Err(err) => {
                warn!(%user_id, run_time = %schedule.run_time, error = %err, "falling back to default run time");
                next_run_after(now, DEFAULT_RUN_TIME)?
            }
        };
        schedule.last_run_at = Some(now);
        schedule.next_run_at = Some(next_run_at);
        Ok(self.store.save_schedule(&schedule).await?)
    }

    /// Validate and persist settings, recomputing the next due time.
    pub async fn update_settings(
        &self,
        user_id: Uuid,
        settings: ScheduleSettings,
        now: DateTime<Utc>,
    ) -> Result<SyncSchedule, SyncError> {
        let mut schedule = self.get_or_create(user_id).await?;

        if let Some(run_time) = settings.run_time {
            let parsed = parse_run_time(&run_time)?;
            schedule.run_time = parsed.format("%H:%M").to_string();
        }
        if let Some(hours) = settings.interval_hours {
            if hours < 1 {
                return Err(SyncError::Config(format!(
                    "interval_hours must be at least 1, got {hours}"
                )));
            }
            schedule.interval_hours = hours;
        }
        if let Some(enabled) = settings.enabled {
            schedule.enabled = enabled;
        }
        schedule.next_run_at = Some(next_run_after(now, &schedule.run_time)?);
        Ok(self.store.save_schedule(&schedule).await?)
    }

    pub async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<SyncSchedule>, SyncError> {
        Ok(self.store.list_due_schedules(now).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adsync_core::ErrorKind;
    use adsync_storage::InMemoryMetricsStore;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).single().unwrap()
    }

    #[test]
    fn next_run_rolls_over_to_tomorrow() {
        let next = next_run_after(at(2024, 1, 1, 8, 0), "07:00").unwrap();
        assert_eq!(next, at(2024, 1, 2, 7, 0));

        let year_end = next_run_after(at(2024, 12, 31, 23, 59), "00:30").unwrap();
        assert_eq!(year_end, at(2025, 1, 1, 0, 30));
    }

    #[test]
    fn malformed_run_time_is_a_config_error() {
        for raw in ["25:00", "7am", "", "07:60"] {
            let err = next_run_after(at(2024, 1, 1, 8, 0), raw).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Config, "{raw}");
        }
    }

    #[tokio::test]
    async fn update_after_run_creates_default_schedule() {
        let store = Arc::new(InMemoryMetricsStore::new());
        let tracker = ScheduleTracker::new(store);
        let user = Uuid::new_v4();

        let schedule = tracker.update_after_run(user, at(2024, 1, 1, 8, 0)).await.unwrap();
        assert!(schedule.enabled);
        assert_eq!(schedule.interval_hours, 24);
        assert_eq!(schedule.last_run_at, Some(at(2024, 1, 1, 8, 0)));
        assert_eq!(schedule.next_run_at, Some(at(2024, 1, 2, 7, 0)));
    }

    #[tokio::test]
    async fn default_creation_leaves_an_existing_schedule_alone() {
        let store = Arc::new(InMemoryMetricsStore::new());
        let tracker = ScheduleTracker::new(store);
        let user = Uuid::new_v4();
        let ran = tracker.update_after_run(user, at(2024, 2, 1, 9, 0)).await.unwrap();

        let again = tracker.create_default_schedule(user).await.unwrap();
        assert_eq!(again, ran);
        assert_eq!(again.last_run_at, Some(at(2024, 2, 1, 9, 0)));
        assert_eq!(again.next_run_at, Some(at(2024, 2, 2, 7, 0)));
    }

    #[tokio::test]
    async fn stored_malformed_time_falls_back_to_default() {
        let store = Arc::new(InMemoryMetricsStore::new());
        let user = Uuid::new_v4();
        let mut broken = default_schedule(user);
        broken.run_time = "lunchtime".into();
        store.save_schedule(&broken).await.unwrap();

        let tracker = ScheduleTracker::new(store);
        let schedule = tracker.update_after_run(user, at(2024, 3, 10, 12, 0)).await.unwrap();
        assert_eq!(schedule.next_run_at, Some(at(2024, 3, 11, 7, 0)));
    }

    #[tokio::test]
    async fn settings_are_validated_before_persisting() {
        let store = Arc::new(InMemoryMetricsStore::new());
        let tracker = ScheduleTracker::new(store.clone());
        let user = Uuid::new_v4();
        let now = at(2024, 5, 1, 9, 0);

        let bad = ScheduleSettings {
            run_time: Some("99:99".into()),
            ..Default::default()
        };
        assert!(tracker.update_settings(user, bad, now).await.is_err());
        assert_eq!(
            tracker.get_schedule(user).await.unwrap().unwrap().run_time,
            DEFAULT_RUN_TIME
        );

        let good = ScheduleSettings {
            enabled: Some(true),
            run_time: Some("6:15".into()),
            interval_hours: Some(12),
        };
        let saved = tracker.update_settings(user, good, now).await.unwrap();
        assert_eq!(saved.run_time, "06:15");
        assert_eq!(saved.interval_hours, 12);
        assert_eq!(saved.next_run_at, Some(at(2024, 5, 2, 6, 15)));
    }

    #[tokio::test]
    async fn due_schedules_skip_disabled_and_future() {
        let store = Arc::new(InMemoryMetricsStore::new());
        let tracker = ScheduleTracker::new(store.clone());
        let now = at(2024, 1, 2, 7, 0);

        let due = Uuid::new_v4();
        tracker.update_after_run(due, at(2024, 1, 1, 8, 0)).await.unwrap();
        let future = Uuid::new_v4();
        tracker.update_after_run(future, at(2024, 1, 2, 6, 0)).await.unwrap();
        let disabled = Uuid::new_v4();
        let mut off = default_schedule(disabled);
        off.enabled = false;
        store.save_schedule(&off).await.unwrap();

        let found: Vec<Uuid> = tracker
            .due_schedules(now)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.user_id)
            .collect();
        assert_eq!(found, vec![due]);
    }
}
