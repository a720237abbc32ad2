//! Postgres-backed [`MetricsStore`] using sqlx.

use std::str::FromStr;
use std::time::Duration;

use adsync_core::{
    AdAccount, AlertContext, AlertKind, Campaign, CampaignStatus, CampaignUpsert, Client,
    ConnectedAccount, DailyMetric, DailyMetricUpsert, DateRange, ErrorKind, NewNotification,
    NewSyncLogEntry, Notification, Platform, Severity, SyncLogEntry, SyncSchedule, SyncStatus,
};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::warn;
use uuid::Uuid;

use crate::store::{dedup_campaign_batch, dedup_metric_batch, MetricsStore, RunLease, StoreError};

/// Rows per multi-value INSERT; keeps bind parameters well under the protocol limit.
const UPSERT_CHUNK: usize = 500;

const CAMPAIGN_COLUMNS: &str = "id, ad_account_id, external_id, name, status, objective, \
     spend, reach, impressions, clicks, ctr, previous_spend, last_synced_at, created_at";

const METRIC_COLUMNS: &str =
    "id, campaign_id, date, spend, impressions, clicks, leads, ctr, cpc, cpm, updated_at";

const SYNC_LOG_COLUMNS: &str = "id, run_id, user_id, client_id, ad_account_id, status, \
     campaigns_synced, metrics_synced, duration_ms, error_kind, error_message, created_at";

const NOTIFICATION_COLUMNS: &str = "id, user_id, campaign_id, alert_type, severity, title, \
     message, read, active, context, created_at";

const SCHEDULE_COLUMNS: &str = "user_id, enabled, run_time, interval_hours, last_run_at, next_run_at";

const RUN_LOCK_SQL: &str = "SELECT pg_try_advisory_lock(hashtext('adsync-run:' || $1)::bigint)";
const RUN_UNLOCK_SQL: &str = "SELECT pg_advisory_unlock(hashtext('adsync-run:' || $1)::bigint)";

#[derive(Debug, Clone)]
pub struct PgMetricsStore {
    pool: PgPool,
}

impl PgMetricsStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running database migrations")?;
        Ok(())
    }
}

/// Session advisory lock pinned to one pooled connection for the whole run.
struct PgRunLease {
    conn: Option<PoolConnection<Postgres>>,
    user_id: Uuid,
}

#[async_trait]
impl RunLease for PgRunLease {
    async fn release(mut self: Box<Self>) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        let unlocked = sqlx::query_scalar::<_, bool>(RUN_UNLOCK_SQL)
            .bind(self.user_id.to_string())
            .fetch_one(&mut *conn)
            .await;
        match unlocked {
            Ok(true) => {}
            Ok(false) => warn!(user_id = %self.user_id, "run lock was no longer held at release"),
            Err(err) => {
                warn!(user_id = %self.user_id, error = %err, "run unlock failed; closing its session");
                drop(conn.detach());
            }
        }
    }
}

impl Drop for PgRunLease {
    fn drop(&mut self) {
        // ending the session frees its advisory locks
        if let Some(conn) = self.conn.take() {
            drop(conn.detach());
        }
    }
}

fn parse_column<T: FromStr>(row: &PgRow, column: &str) -> Result<T, StoreError> {
    let raw: String = row.try_get(column)?;
    raw.parse::<T>()
        .map_err(|_| StoreError::Decode(format!("unexpected {column} value `{raw}`")))
}

fn connected_account_from_row(row: &PgRow) -> Result<ConnectedAccount, StoreError> {
    let client_id: Uuid = row.try_get("client_id")?;
    Ok(ConnectedAccount {
        client: Client {
            id: client_id,
            user_id: row.try_get("user_id")?,
            name: row.try_get("client_name")?,
            active: row.try_get("client_active")?,
        },
        account: AdAccount {
            id: row.try_get("id")?,
            client_id,
            platform: parse_column::<Platform>(row, "platform")?,
            external_account_id: row.try_get("external_account_id")?,
            access_token: row.try_get("access_token")?,
            refresh_token: row.try_get("refresh_token")?,
            token_expires_at: row.try_get("token_expires_at")?,
            active: row.try_get("active")?,
        },
    })
}

fn campaign_from_row(row: &PgRow) -> Result<Campaign, StoreError> {
    Ok(Campaign {
        id: row.try_get("id")?,
        ad_account_id: row.try_get("ad_account_id")?,
        external_id: row.try_get("external_id")?,
        name: row.try_get("name")?,
        status: parse_column::<CampaignStatus>(row, "status")?,
        objective: row.try_get("objective")?,
        spend: row.try_get("spend")?,
        reach: row.try_get("reach")?,
        impressions: row.try_get("impressions")?,
        clicks: row.try_get("clicks")?,
        ctr: row.try_get("ctr")?,
        previous_spend: row.try_get("previous_spend")?,
        last_synced_at: row.try_get("last_synced_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn metric_from_row(row: &PgRow) -> Result<DailyMetric, StoreError> {
    Ok(DailyMetric {
        id: row.try_get("id")?,
        campaign_id: row.try_get("campaign_id")?,
        date: row.try_get("date")?,
        spend: row.try_get("spend")?,
        impressions: row.try_get("impressions")?,
        clicks: row.try_get("clicks")?,
        leads: row.try_get("leads")?,
        ctr: row.try_get("ctr")?,
        cpc: row.try_get("cpc")?,
        cpm: row.try_get("cpm")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn sync_log_from_row(row: &PgRow) -> Result<SyncLogEntry, StoreError> {
    let error_kind: Option<String> = row.try_get("error_kind")?;
    let error_kind = error_kind
        .map(|raw| {
            raw.parse::<ErrorKind>()
                .map_err(|_| StoreError::Decode(format!("unexpected error_kind value `{raw}`")))
        })
        .transpose()?;
    Ok(SyncLogEntry {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        user_id: row.try_get("user_id")?,
        client_id: row.try_get("client_id")?,
        ad_account_id: row.try_get("ad_account_id")?,
        status: parse_column::<SyncStatus>(row, "status")?,
        campaigns_synced: row.try_get("campaigns_synced")?,
        metrics_synced: row.try_get("metrics_synced")?,
        duration_ms: row.try_get("duration_ms")?,
        error_kind,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
    })
}

fn notification_from_row(row: &PgRow) -> Result<Notification, StoreError> {
    let context: serde_json::Value = row.try_get("context")?;
    let context: AlertContext =
        serde_json::from_value(context).map_err(|e| StoreError::Decode(format!("notification context: {e}")))?;
    Ok(Notification {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        campaign_id: row.try_get("campaign_id")?,
        kind: parse_column::<AlertKind>(row, "alert_type")?,
        severity: parse_column::<Severity>(row, "severity")?,
        title: row.try_get("title")?,
        message: row.try_get("message")?,
        read: row.try_get("read")?,
        active: row.try_get("active")?,
        context,
        created_at: row.try_get("created_at")?,
    })
}

fn schedule_from_row(row: &PgRow) -> Result<SyncSchedule, StoreError> {
    Ok(SyncSchedule {
        user_id: row.try_get("user_id")?,
        enabled: row.try_get("enabled")?,
        run_time: row.try_get("run_time")?,
        interval_hours: row.try_get("interval_hours")?,
        last_run_at: row.try_get("last_run_at")?,
        next_run_at: row.try_get("next_run_at")?,
    })
}

#[async_trait]
impl MetricsStore for PgMetricsStore {
    async fn try_lock_user_run(&self, user_id: Uuid) -> Result<Option<Box<dyn RunLease>>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let locked: bool = sqlx::query_scalar(RUN_LOCK_SQL)
            .bind(user_id.to_string())
            .fetch_one(&mut *conn)
            .await?;
        if !locked {
            return Ok(None);
        }
        Ok(Some(Box::new(PgRunLease {
            conn: Some(conn),
            user_id,
        })))
    }

    async fn list_connected_accounts(&self, user_id: Uuid) -> Result<Vec<ConnectedAccount>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT c.id AS client_id,
                   c.user_id,
                   c.name AS client_name,
                   c.active AS client_active,
                   a.id,
                   a.platform,
                   a.external_account_id,
                   a.access_token,
                   a.refresh_token,
                   a.token_expires_at,
                   a.active
              FROM ad_accounts a
              JOIN clients c ON c.id = a.client_id
             WHERE c.user_id = $1
               AND c.active
               AND a.active
             ORDER BY c.name, a.external_account_id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(connected_account_from_row).collect()
    }

    async fn upsert_campaigns(&self, campaigns: &[CampaignUpsert]) -> Result<Vec<Campaign>, StoreError> {
        let batch = dedup_campaign_batch(campaigns);
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        let mut out = Vec::with_capacity(batch.len());
        for chunk in batch.chunks(UPSERT_CHUNK) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO campaigns (id, ad_account_id, external_id, name, status, objective, \
                 spend, reach, impressions, clicks, ctr, last_synced_at) ",
            );
            qb.push_values(chunk, |mut b, c| {
                b.push_bind(Uuid::new_v4())
                    .push_bind(c.ad_account_id)
                    .push_bind(c.external_id.clone())
                    .push_bind(c.name.clone())
                    .push_bind(c.status.as_str())
                    .push_bind(c.objective.clone())
                    .push_bind(c.spend)
                    .push_bind(c.reach)
                    .push_bind(c.impressions)
                    .push_bind(c.clicks)
                    .push_bind(c.ctr)
                    .push_bind(c.synced_at);
            });
            qb.push(
                " ON CONFLICT (external_id, ad_account_id) DO UPDATE SET \
                   name = EXCLUDED.name, \
                   status = EXCLUDED.status, \
                   objective = EXCLUDED.objective, \
                   previous_spend = campaigns.spend, \
                   spend = EXCLUDED.spend, \
                   reach = EXCLUDED.reach, \
                   impressions = EXCLUDED.impressions, \
                   clicks = EXCLUDED.clicks, \
                   ctr = EXCLUDED.ctr, \
                   last_synced_at = EXCLUDED.last_synced_at \
                 RETURNING ",
            );
            qb.push(CAMPAIGN_COLUMNS);

            let rows = qb.build().fetch_all(&mut *tx).await?;
            for row in &rows {
                out.push(campaign_from_row(row)?);
            }
        }
        tx.commit().await?;
        Ok(out)
    }

    async fn upsert_daily_metrics(&self, metrics: &[DailyMetricUpsert]) -> Result<usize, StoreError> {
        let batch = dedup_metric_batch(metrics);
        if batch.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut written = 0usize;
        for chunk in batch.chunks(UPSERT_CHUNK) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO daily_metrics (id, campaign_id, date, spend, impressions, clicks, \
                 leads, ctr, cpc, cpm) ",
            );
            qb.push_values(chunk, |mut b, m| {
                b.push_bind(Uuid::new_v4())
                    .push_bind(m.campaign_id)
                    .push_bind(m.date)
                    .push_bind(m.spend)
                    .push_bind(m.impressions)
                    .push_bind(m.clicks)
                    .push_bind(m.leads)
                    .push_bind(m.ctr)
                    .push_bind(m.cpc)
                    .push_bind(m.cpm);
            });
            qb.push(
                " ON CONFLICT (campaign_id, date) DO UPDATE SET \
                   spend = EXCLUDED.spend, \
                   impressions = EXCLUDED.impressions, \
                   clicks = EXCLUDED.clicks, \
                   leads = EXCLUDED.leads, \
                   ctr = EXCLUDED.ctr, \
                   cpc = EXCLUDED.cpc, \
                   cpm = EXCLUDED.cpm, \
                   updated_at = NOW()",
            );
            let result = qb.build().execute(&mut *tx).await?;
            written += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(written)
    }

    async fn list_campaigns_for_user(
        &self,
        user_id: Uuid,
        statuses: &[CampaignStatus],
    ) -> Result<Vec<Campaign>, StoreError> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let query = format!(
            "SELECT {cols} FROM campaigns \
              WHERE ad_account_id IN ( \
                    SELECT a.id FROM ad_accounts a \
                      JOIN clients c ON c.id = a.client_id \
                     WHERE c.user_id = $1 AND c.active AND a.active) \
                AND status = ANY($2) \
              ORDER BY name",
            cols = CAMPAIGN_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(user_id)
            .bind(statuses)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(campaign_from_row).collect()
    }

    async fn daily_metrics_in_range(
        &self,
        campaign_id: Uuid,
        range: DateRange,
    ) -> Result<Vec<DailyMetric>, StoreError> {
        let query = format!(
            "SELECT {METRIC_COLUMNS} FROM daily_metrics \
              WHERE campaign_id = $1 AND date BETWEEN $2 AND $3 \
              ORDER BY date ASC"
        );
        let rows = sqlx::query(&query)
            .bind(campaign_id)
            .bind(range.since)
            .bind(range.until)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(metric_from_row).collect()
    }

    async fn append_sync_log(&self, entry: &NewSyncLogEntry) -> Result<SyncLogEntry, StoreError> {
        let query = format!(
            "INSERT INTO sync_logs (id, run_id, user_id, client_id, ad_account_id, status, \
                 campaigns_synced, metrics_synced, duration_ms, error_kind, error_message) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             RETURNING {SYNC_LOG_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(Uuid::new_v4())
            .bind(entry.run_id)
            .bind(entry.user_id)
            .bind(entry.client_id)
            .bind(entry.ad_account_id)
            .bind(entry.status.as_str())
            .bind(entry.campaigns_synced)
            .bind(entry.metrics_synced)
            .bind(entry.duration_ms)
            .bind(entry.error_kind.map(|k| k.as_str()))
            .bind(entry.error_message.clone())
            .fetch_one(&self.pool)
            .await?;
        sync_log_from_row(&row)
    }

    async fn list_sync_logs(&self, user_id: Uuid, limit: i64) -> Result<Vec<SyncLogEntry>, StoreError> {
        let query = format!(
            "SELECT {SYNC_LOG_COLUMNS} FROM sync_logs \
              WHERE user_id = $1 \
              ORDER BY created_at DESC \
              LIMIT $2"
        );
        let rows = sqlx::query(&query)
            .bind(user_id)
            .bind(limit.max(1))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(sync_log_from_row).collect()
    }

    async fn insert_notification_deduplicated(
        &self,
        notification: &NewNotification,
        created_at: DateTime<Utc>,
        window_start: DateTime<Utc>,
    ) -> Result<Option<Notification>, StoreError> {
        let context = serde_json::to_value(&notification.context)
            .map_err(|e| StoreError::Decode(format!("notification context: {e}")))?;
        let kind = notification.kind();

        // Concurrent evaluations of the same (user, campaign, type) queue here,
        // so the NOT EXISTS check below sees the winner's committed row.
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1)::bigint)")
            .bind(format!(
                "adsync-alert:{}:{}:{}",
                notification.user_id,
                notification.campaign_id,
                kind.as_str()
            ))
            .execute(&mut *tx)
            .await?;
        let query = format!(
            "INSERT INTO notifications (id, user_id, campaign_id, alert_type, severity, title, \
                 message, context, created_at) \
             SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9 \
              WHERE NOT EXISTS ( \
                    SELECT 1 FROM notifications \
                     WHERE user_id = $2 \
                       AND campaign_id = $3 \
                       AND alert_type = $4 \
                       AND active \
                       AND created_at >= $10) \
             RETURNING {NOTIFICATION_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(Uuid::new_v4())
            .bind(notification.user_id)
            .bind(notification.campaign_id)
            .bind(kind.as_str())
            .bind(notification.severity.as_str())
            .bind(notification.title.clone())
            .bind(notification.message.clone())
            .bind(context)
            .bind(created_at)
            .bind(window_start)
            .fetch_optional(&mut *tx)
            .await?;
        tx.commit().await?;
        row.as_ref().map(notification_from_row).transpose()
    }

    async fn list_notifications(
        &self,
        user_id: Uuid,
        unread_only: bool,
        limit: i64,
    ) -> Result<Vec<Notification>, StoreError> {
        let query = format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications \
              WHERE user_id = $1 AND active AND ($2 = FALSE OR read = FALSE) \
              ORDER BY created_at DESC \
              LIMIT $3"
        );
        let rows = sqlx::query(&query)
            .bind(user_id)
            .bind(unread_only)
            .bind(limit.max(1))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(notification_from_row).collect()
    }

    async fn mark_notification_read(&self, user_id: Uuid, notification_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE notifications SET read = TRUE \
              WHERE id = $1 AND user_id = $2 AND active AND read = FALSE",
        )
        .bind(notification_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_all_notifications_read(&self, user_id: Uuid) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE notifications SET read = TRUE \
              WHERE user_id = $1 AND active AND read = FALSE",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn deactivate_notification(&self, user_id: Uuid, notification_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE notifications SET active = FALSE \
              WHERE id = $1 AND user_id = $2 AND active",
        )
        .bind(notification_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_schedule(&self, user_id: Uuid) -> Result<Option<SyncSchedule>, StoreError> {
        let query = format!("SELECT {SCHEDULE_COLUMNS} FROM sync_schedules WHERE user_id = $1");
        let row = sqlx::query(&query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(schedule_from_row).transpose()
    }

    async fn save_schedule(&self, schedule: &SyncSchedule) -> Result<SyncSchedule, StoreError> {
        let query = format!(
            "INSERT INTO sync_schedules ({SCHEDULE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (user_id) DO UPDATE SET \
                enabled = EXCLUDED.enabled, \
                run_time = EXCLUDED.run_time, \
                interval_hours = EXCLUDED.interval_hours, \
                last_run_at = EXCLUDED.last_run_at, \
                next_run_at = EXCLUDED.next_run_at \
             RETURNING {SCHEDULE_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(schedule.user_id)
            .bind(schedule.enabled)
            .bind(schedule.run_time.clone())
            .bind(schedule.interval_hours)
            .bind(schedule.last_run_at)
            .bind(schedule.next_run_at)
            .fetch_one(&self.pool)
            .await?;
        schedule_from_row(&row)
    }

    async fn insert_schedule_if_absent(&self, schedule: &SyncSchedule) -> Result<SyncSchedule, StoreError> {
        let query = format!(
            "INSERT INTO sync_schedules ({SCHEDULE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (user_id) DO NOTHING"
        );
        sqlx::query(&query)
            .bind(schedule.user_id)
            .bind(schedule.enabled)
            .bind(schedule.run_time.clone())
            .bind(schedule.interval_hours)
            .bind(schedule.last_run_at)
            .bind(schedule.next_run_at)
            .execute(&self.pool)
            .await?;
        self.get_schedule(schedule.user_id)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "schedule",
                id: schedule.user_id,
            })
    }

    async fn list_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<SyncSchedule>, StoreError> {
        let query = format!(
            "SELECT {SCHEDULE_COLUMNS} FROM sync_schedules \
              WHERE enabled AND (next_run_at IS NULL OR next_run_at <= $1) \
              ORDER BY next_run_at NULLS FIRST"
        );
        let rows = sqlx::query(&query).bind(now).fetch_all(&self.pool).await?;
        rows.iter().map(schedule_from_row).collect()
    }
}
