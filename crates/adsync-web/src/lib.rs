//! Axum JSON surface for triggering syncs and reading their outcomes.

use std::sync::Arc;

use adsync_core::{
    AlertContext, AlertKind, DateRange, Notification, Severity, SyncLogEntry, SyncResult,
    SyncSchedule,
};
use adsync_sync::{ScheduleSettings, SyncEngine};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

pub mod error;

pub use error::{ApiError, ApiResult};

pub const CRATE_NAME: &str = "adsync-web";

const DEFAULT_LOG_LIMIT: i64 = 20;
const MAX_LOG_LIMIT: i64 = 200;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
    /// Shared with the process shutdown signal; stops in-flight runs.
    pub cancel: CancellationToken,
}

impl AppState {
    pub fn new(engine: Arc<SyncEngine>, cancel: CancellationToken) -> Self {
        Self { engine, cancel }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub success: bool,
    pub run_id: Uuid,
    pub campaigns_synced: usize,
    pub metrics_synced: usize,
    pub period: DateRange,
    pub accounts_processed: usize,
    pub accounts_failed: usize,
    pub notifications_created: usize,
    pub duration_ms: u64,
    pub cancelled: bool,
    pub reauth_required: Vec<Uuid>,
}

impl From<SyncResult> for SyncResponse {
    fn from(result: SyncResult) -> Self {
        Self {
            success: result.success,
            run_id: result.run_id,
            campaigns_synced: result.campaigns_written,
            metrics_synced: result.metrics_written,
            period: result.period,
            accounts_processed: result.accounts_processed,
            accounts_failed: result.accounts_failed,
            notifications_created: result.notifications_created,
            duration_ms: result.duration_ms,
            cancelled: result.cancelled,
            reauth_required: result.reauth_required,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLogView {
    pub id: Uuid,
    pub run_id: Uuid,
    pub client_id: Uuid,
    pub ad_account_id: Uuid,
    pub status: String,
    pub campaigns_synced: i64,
    pub metrics_synced: i64,
    pub duration_ms: i64,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<SyncLogEntry> for SyncLogView {
    fn from(entry: SyncLogEntry) -> Self {
        Self {
            id: entry.id,
            run_id: entry.run_id,
            client_id: entry.client_id,
            ad_account_id: entry.ad_account_id,
            status: entry.status.as_str().to_string(),
            campaigns_synced: entry.campaigns_synced,
            metrics_synced: entry.metrics_synced,
            duration_ms: entry.duration_ms,
            error_kind: entry.error_kind.map(|k| k.as_str().to_string()),
            error_message: entry.error_message,
            created_at: entry.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleView {
    pub enabled: bool,
    pub run_time: String,
    pub interval_hours: i32,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
}

impl From<SyncSchedule> for ScheduleView {
    fn from(schedule: SyncSchedule) -> Self {
        Self {
            enabled: schedule.enabled,
            run_time: schedule.run_time,
            interval_hours: schedule.interval_hours,
            last_run_at: schedule.last_run_at,
            next_run_at: schedule.next_run_at,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleUpdate {
    pub enabled: Option<bool>,
    pub run_time: Option<String>,
    pub interval_hours: Option<i32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationView {
    pub id: Uuid,
    pub campaign_id: Uuid,
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub read: bool,
    pub context: AlertContext,
    pub created_at: DateTime<Utc>,
}

impl From<Notification> for NotificationView {
    fn from(n: Notification) -> Self {
        Self {
            id: n.id,
            campaign_id: n.campaign_id,
            kind: n.kind,
            severity: n.severity,
            title: n.title,
            message: n.message,
            read: n.read,
            context: n.context,
            created_at: n.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResponse {
    pub notifications_created: usize,
    pub notifications: Vec<NotificationView>,
}

#[derive(Debug, Deserialize, Default)]
struct LogsQuery {
    limit: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
struct NotificationsQuery {
    unread_only: Option<bool>,
    limit: Option<i64>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/sync/{user_id}", post(run_sync_handler))
        .route("/api/sync/{user_id}/logs", get(sync_logs_handler))
        .route("/api/schedule/{user_id}", get(get_schedule_handler).put(update_schedule_handler))
        .route("/api/alerts/{user_id}/evaluate", post(evaluate_handler))
        .route("/api/notifications/{user_id}", get(list_notifications_handler))
        .route("/api/notifications/{user_id}/read-all", post(mark_all_read_handler))
        .route("/api/notifications/{user_id}/{id}/read", post(mark_read_handler))
        .route("/api/notifications/{user_id}/{id}", delete(dismiss_handler))
        .with_state(Arc::new(state))
}

/// Bind `0.0.0.0:port` and serve until `cancel` fires.
pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let cancel = state.cancel.clone();
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http server listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn run_sync_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<SyncResponse>> {
    let result = state.engine.run_sync(user_id, &state.cancel).await;
    if let Some(failure) = result.error.clone().filter(|_| !result.success) {
        return Err(failure.into());
    }
    Ok(Json(SyncResponse::from(result)))
}

async fn sync_logs_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<Vec<SyncLogView>>> {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT);
    let logs = state.engine.sync_logs(user_id, limit).await?;
    Ok(Json(logs.into_iter().map(SyncLogView::from).collect()))
}

async fn get_schedule_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<ScheduleView>> {
    let schedule = state.engine.schedules().get_or_create(user_id).await?;
    Ok(Json(schedule.into()))
}

async fn update_schedule_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
    Json(update): Json<ScheduleUpdate>,
) -> ApiResult<Json<ScheduleView>> {
    let settings = ScheduleSettings {
        enabled: update.enabled,
        run_time: update.run_time,
        interval_hours: update.interval_hours,
    };
    let schedule = state
        .engine
        .schedules()
        .update_settings(user_id, settings, Utc::now())
        .await?;
    Ok(Json(schedule.into()))
}

async fn evaluate_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<EvaluateResponse>> {
    let created = state.engine.evaluate_user(user_id, Utc::now()).await?;
    Ok(Json(EvaluateResponse {
        notifications_created: created.len(),
        notifications: created.into_iter().map(NotificationView::from).collect(),
    }))
}

async fn list_notifications_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<NotificationsQuery>,
) -> ApiResult<Json<Vec<NotificationView>>> {
    let notifications = state
        .engine
        .evaluator()
        .list_notifications(user_id, query.unread_only.unwrap_or(false), query.limit)
        .await?;
    Ok(Json(notifications.into_iter().map(NotificationView::from).collect()))
}

async fn mark_all_read_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let updated = state.engine.evaluator().mark_all_read(user_id).await?;
    Ok(Json(serde_json::json!({ "updated": updated })))
}

async fn mark_read_handler(
    State(state): State<Arc<AppState>>,
    Path((user_id, id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    if state.engine.evaluator().mark_read(user_id, id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound {
            entity: "notification",
            id: id.to_string(),
        })
    }
}

async fn dismiss_handler(
    State(state): State<Arc<AppState>>,
    Path((user_id, id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    if state.engine.evaluator().dismiss(user_id, id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound {
            entity: "notification",
            id: id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use adsync_adapters::{FixtureAccount, FixtureProvider, ProviderRegistry};
    use adsync_core::{AdAccount, Client, DailyInsight, Platform, ProviderCampaign};
    use adsync_storage::{BackoffPolicy, InMemoryMetricsStore};
    use adsync_sync::{AlertRules, EngineOptions};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    struct Fixture {
        app: Router,
        store: Arc<InMemoryMetricsStore>,
        engine: Arc<SyncEngine>,
        user_id: Uuid,
    }

    async fn fixture() -> Fixture {
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
            external_account_id: "act_7".into(),
            access_token: "token".into(),
            refresh_token: None,
            token_expires_at: None,
            active: true,
        };
        store.insert_client(client).await;
        store.insert_account(account).await;

        let today = Utc::now().date_naive();
        let meta = Arc::new(FixtureProvider::in_memory(Platform::MetaAds));
        meta.insert_account(
            "act_7",
            FixtureAccount {
                campaigns: vec![ProviderCampaign {
                    external_id: "c1".into(),
                    name: "Paused promo".into(),
                    status: "PAUSED".into(),
                    objective: None,
                    spend: Some(20.0),
                    reach: None,
                    impressions: Some(800),
                    clicks: Some(16),
                    ctr: Some(2.0),
                }],
                daily: [(
                    "c1".to_string(),
                    vec![DailyInsight {
                        date: today,
                        spend: Some(20.0),
                        impressions: Some(800),
                        clicks: Some(16),
                        ctr: Some(2.0),
                        cpc: None,
                        cpm: None,
                        conversions: None,
                    }],
                )]
                .into_iter()
                .collect(),
                ..Default::default()
            },
        );

        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            ProviderRegistry::new().with(meta),
            AlertRules::default(),
            EngineOptions {
                lookback_days: 7,
                provider_timeout: Duration::from_secs(5),
                store_backoff: BackoffPolicy::none(),
            },
        ));
        Fixture {
            app: app(AppState::new(engine.clone(), CancellationToken::new())),
            store,
            engine,
            user_id,
        }
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn healthz_responds_ok() {
        let f = fixture().await;
        let (status, body) = send(&f.app, "GET", "/healthz", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn sync_trigger_returns_camel_case_summary_and_logs() {
        let f = fixture().await;
        let (status, body) = send(&f.app, "POST", &format!("/api/sync/{}", f.user_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["campaignsSynced"], 1);
        assert_eq!(body["metricsSynced"], 1);
        assert_eq!(body["notificationsCreated"], 1);
        assert!(body["period"]["since"].is_string());

        let (status, logs) = send(&f.app, "GET", &format!("/api/sync/{}/logs?limit=5", f.user_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(logs.as_array().unwrap().len(), 1);
        assert_eq!(logs[0]["status"], "success");
    }

    #[tokio::test]
    async fn concurrent_trigger_maps_to_conflict() {
        let f = fixture().await;
        let _held = f.engine.runs().try_acquire(f.user_id).unwrap();
        let (status, body) = send(&f.app, "POST", &format!("/api/sync/{}", f.user_id), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "already_running");
    }

    #[tokio::test]
    async fn unavailable_store_maps_to_service_unavailable() {
        let f = fixture().await;
        f.store.set_unavailable(true);
        let (status, body) = send(&f.app, "POST", &format!("/api/sync/{}", f.user_id), None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], "storage");
    }

    #[tokio::test]
    async fn schedule_defaults_and_rejects_bad_time() {
        let f = fixture().await;
        let uri = format!("/api/schedule/{}", f.user_id);
        let (status, body) = send(&f.app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["runTime"], "07:00");
        assert_eq!(body["intervalHours"], 24);

        let (status, body) = send(&f.app, "PUT", &uri, Some(serde_json::json!({ "runTime": "31:00" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "config");

        let (status, body) = send(
            &f.app,
            "PUT",
            &uri,
            Some(serde_json::json!({ "runTime": "05:30", "enabled": false })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["runTime"], "05:30");
        assert_eq!(body["enabled"], false);
    }

    #[tokio::test]
    async fn notifications_can_be_listed_read_and_dismissed() {
        let f = fixture().await;
        send(&f.app, "POST", &format!("/api/sync/{}", f.user_id), None).await;

        let list_uri = format!("/api/notifications/{}?unread_only=true", f.user_id);
        let (_, list) = send(&f.app, "GET", &list_uri, None).await;
        let items = list.as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["type"], "status");
        assert_eq!(items[0]["context"]["alert"], "status");
        let id = items[0]["id"].as_str().unwrap().to_string();

        let (status, _) = send(&f.app, "POST", &format!("/api/notifications/{}/{id}/read", f.user_id), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, unread) = send(&f.app, "GET", &list_uri, None).await;
        assert!(unread.as_array().unwrap().is_empty());

        let (status, _) = send(&f.app, "DELETE", &format!("/api/notifications/{}/{id}", f.user_id), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, all) = send(&f.app, "GET", &format!("/api/notifications/{}", f.user_id), None).await;
        assert!(all.as_array().unwrap().is_empty());

        let (status, body) = send(
            &f.app,
            "POST",
            &format!("/api/notifications/{}/{}/read", f.user_id, Uuid::new_v4()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");
    }

    #[tokio::test]
    async fn on_demand_evaluation_is_deduplicated() {
        let f = fixture().await;
        send(&f.app, "POST", &format!("/api/sync/{}", f.user_id), None).await;
        let (status, body) = send(&f.app, "POST", &format!("/api/alerts/{}/evaluate", f.user_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["notificationsCreated"], 0);

        let (_, body) = send(&f.app, "POST", &format!("/api/notifications/{}/read-all", f.user_id), None).await;
        assert_eq!(body["updated"], 1);
    }

    #[tokio::test]
    async fn evaluation_during_a_sync_maps_to_conflict() {
        let f = fixture().await;
        let held = f.engine.runs().try_acquire(f.user_id).unwrap();
        let uri = format!("/api/alerts/{}/evaluate", f.user_id);
        let (status, body) = send(&f.app, "POST", &uri, None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "already_running");

        drop(held);
        let (status, _) = send(&f.app, "POST", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
    }
}
