//! Core domain model, provider handoff types and error taxonomy for adsync.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "adsync-core";

/// Share of clicks booked as leads when the platform reports no conversions.
pub const LEADS_CLICK_RATIO: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    MetaAds,
    GoogleAnalytics,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::MetaAds => "meta_ads",
            Platform::GoogleAnalytics => "google_analytics",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "meta_ads" | "meta" => Ok(Platform::MetaAds),
            "google_analytics" | "google" => Ok(Platform::GoogleAnalytics),
            other => Err(SyncError::Config(format!("unknown platform `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub active: bool,
}

/// A client's connected identity on an external advertising platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdAccount {
    pub id: Uuid,
    pub client_id: Uuid,
    pub platform: Platform,
    pub external_account_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub active: bool,
}

/// Explicit credentials handed to a provider for a single account.
#[derive(Clone, PartialEq, Eq)]
pub struct AccountCredentials {
    pub external_account_id: String,
    pub access_token: String,
}

impl fmt::Debug for AccountCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountCredentials")
            .field("external_account_id", &self.external_account_id)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

impl AdAccount {
    /// Resolve credentials usable at `now`.
    ///
    /// An expired token is still handed out when a refresh token exists; the
    /// provider reports an auth error if the refresh has not happened yet.
    pub fn credentials(&self, now: DateTime<Utc>) -> Result<AccountCredentials, SyncError> {
        if self.access_token.trim().is_empty() {
            return Err(SyncError::Config(format!(
                "ad account {} has no access token",
                self.external_account_id
            )));
        }
        let expired = self.token_expires_at.is_some_and(|at| at <= now);
        let refreshable = self
            .refresh_token
            .as_deref()
            .is_some_and(|t| !t.trim().is_empty());
        if expired && !refreshable {
            return Err(SyncError::Auth(format!(
                "access token for ad account {} expired and cannot be refreshed",
                self.external_account_id
            )));
        }
        Ok(AccountCredentials {
            external_account_id: self.external_account_id.clone(),
            access_token: self.access_token.clone(),
        })
    }
}

/// An account together with the owning client, as enumerated for a sync run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedAccount {
    pub client: Client,
    pub account: AdAccount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CampaignStatus {
    Active,
    Paused,
    Archived,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Active => "ACTIVE",
            CampaignStatus::Paused => "PAUSED",
            CampaignStatus::Archived => "ARCHIVED",
        }
    }

    /// Map a platform's raw status onto the three lifecycle states.
    ///
    /// Anything that is not plainly running or gone counts as paused.
    pub fn from_platform(raw: &str) -> Self {
        let upper = raw.trim().to_ascii_uppercase();
        match upper.as_str() {
            "ACTIVE" | "ENABLED" => CampaignStatus::Active,
            "ARCHIVED" | "DELETED" | "REMOVED" => CampaignStatus::Archived,
            _ => CampaignStatus::Paused,
        }
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CampaignStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(CampaignStatus::Active),
            "PAUSED" => Ok(CampaignStatus::Paused),
            "ARCHIVED" => Ok(CampaignStatus::Archived),
            other => Err(SyncError::Config(format!("unknown campaign status `{other}`"))),
        }
    }
}

/// Inclusive calendar date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub since: NaiveDate,
    pub until: NaiveDate,
}

impl DateRange {
    /// The `days` calendar days ending at (and including) `until`.
    pub fn trailing(until: NaiveDate, days: u32) -> Self {
        let span = i64::from(days.max(1)) - 1;
        Self {
            since: until - Duration::days(span),
            until,
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.since && date <= self.until
    }
}

/// Campaign record as returned by a provider, before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderCampaign {
    pub external_id: String,
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub objective: Option<String>,
    #[serde(default)]
    pub spend: Option<f64>,
    #[serde(default)]
    pub reach: Option<i64>,
    #[serde(default)]
    pub impressions: Option<i64>,
    #[serde(default)]
    pub clicks: Option<i64>,
    #[serde(default)]
    pub ctr: Option<f64>,
}

/// One day of provider-reported insights for a campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyInsight {
    pub date: NaiveDate,
    #[serde(default)]
    pub spend: Option<f64>,
    #[serde(default)]
    pub impressions: Option<i64>,
    #[serde(default)]
    pub clicks: Option<i64>,
    #[serde(default)]
    pub ctr: Option<f64>,
    #[serde(default)]
    pub cpc: Option<f64>,
    #[serde(default)]
    pub cpm: Option<f64>,
    #[serde(default)]
    pub conversions: Option<i64>,
}

pub fn finite_or_zero(value: Option<f64>) -> f64 {
    match value {
        Some(v) if v.is_finite() => v,
        _ => 0.0,
    }
}

pub fn estimate_leads(clicks: i64) -> i64 {
    (clicks.max(0) as f64 * LEADS_CLICK_RATIO).round() as i64
}

/// Normalized campaign shape written by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignUpsert {
    pub ad_account_id: Uuid,
    pub external_id: String,
    pub name: String,
    pub status: CampaignStatus,
    pub objective: Option<String>,
    pub spend: f64,
    pub reach: i64,
    pub impressions: i64,
    pub clicks: i64,
    pub ctr: f64,
    pub synced_at: DateTime<Utc>,
}

impl CampaignUpsert {
    pub fn from_provider(ad_account_id: Uuid, source: &ProviderCampaign, synced_at: DateTime<Utc>) -> Self {
        Self {
            ad_account_id,
            external_id: source.external_id.clone(),
            name: source.name.clone(),
            status: CampaignStatus::from_platform(&source.status),
            objective: source.objective.clone(),
            spend: finite_or_zero(source.spend),
            reach: source.reach.unwrap_or(0),
            impressions: source.impressions.unwrap_or(0),
            clicks: source.clicks.unwrap_or(0),
            ctr: finite_or_zero(source.ctr),
            synced_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub ad_account_id: Uuid,
    pub external_id: String,
    pub name: String,
    pub status: CampaignStatus,
    pub objective: Option<String>,
    pub spend: f64,
    pub reach: i64,
    pub impressions: i64,
    pub clicks: i64,
    pub ctr: f64,
    /// Spend held by the row before the most recent upsert overwrote it.
    pub previous_spend: Option<f64>,
    pub last_synced_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyMetricUpsert {
    pub campaign_id: Uuid,
    pub date: NaiveDate,
    pub spend: f64,
    pub impressions: i64,
    pub clicks: i64,
    pub leads: i64,
    pub ctr: f64,
    pub cpc: f64,
    pub cpm: f64,
}

impl DailyMetricUpsert {
    pub fn from_insight(campaign_id: Uuid, insight: &DailyInsight) -> Self {
        let clicks = insight.clicks.unwrap_or(0);
        Self {
            campaign_id,
            date: insight.date,
            spend: finite_or_zero(insight.spend),
            impressions: insight.impressions.unwrap_or(0),
            clicks,
            leads: insight.conversions.unwrap_or_else(|| estimate_leads(clicks)),
            ctr: finite_or_zero(insight.ctr),
            cpc: finite_or_zero(insight.cpc),
            cpm: finite_or_zero(insight.cpm),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyMetric {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub date: NaiveDate,
    pub spend: f64,
    pub impressions: i64,
    pub clicks: i64,
    pub leads: i64,
    pub ctr: f64,
    pub cpc: f64,
    pub cpm: f64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Success,
    Error,
    InProgress,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Success => "success",
            SyncStatus::Error => "error",
            SyncStatus::InProgress => "in_progress",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(SyncStatus::Success),
            "error" => Ok(SyncStatus::Error),
            "in_progress" => Ok(SyncStatus::InProgress),
            other => Err(SyncError::Config(format!("unknown sync status `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSyncLogEntry {
    pub run_id: Uuid,
    pub user_id: Uuid,
    pub client_id: Uuid,
    pub ad_account_id: Uuid,
    pub status: SyncStatus,
    pub campaigns_synced: i64,
    pub metrics_synced: i64,
    pub duration_ms: i64,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
}

/// Append-only audit record of one account's sync within one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub id: Uuid,
    pub run_id: Uuid,
    pub user_id: Uuid,
    pub client_id: Uuid,
    pub ad_account_id: Uuid,
    pub status: SyncStatus,
    pub campaigns_synced: i64,
    pub metrics_synced: i64,
    pub duration_ms: i64,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSchedule {
    pub user_id: Uuid,
    pub enabled: bool,
    /// Time of day in `HH:MM`, interpreted in UTC.
    pub run_time: String,
    pub interval_hours: i32,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Success,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Success => "success",
        }
    }
}

impl FromStr for Severity {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            "success" => Ok(Severity::Success),
            other => Err(SyncError::Config(format!("unknown severity `{other}`"))),
        }
    }
}

/// Alert type; the serialized names are the persisted `alert_type` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertKind {
    #[serde(rename = "performance")]
    Performance,
    #[serde(rename = "orcamento")]
    Budget,
    #[serde(rename = "status")]
    Status,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Performance => "performance",
            AlertKind::Budget => "orcamento",
            AlertKind::Status => "status",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "performance" => Ok(AlertKind::Performance),
            "orcamento" => Ok(AlertKind::Budget),
            "status" => Ok(AlertKind::Status),
            other => Err(SyncError::Config(format!("unknown alert type `{other}`"))),
        }
    }
}

/// Structured payload attached to a notification, one variant per alert type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "alert", rename_all = "snake_case")]
pub enum AlertContext {
    Performance {
        ctr_first_half: f64,
        ctr_second_half: f64,
        #[serde(rename = "queda_percentual")]
        drop_percent: f64,
    },
    Budget {
        spend: f64,
        baseline: f64,
        threshold: f64,
    },
    Status {
        previous_status: CampaignStatus,
        current_status: CampaignStatus,
    },
}

impl AlertContext {
    pub fn kind(&self) -> AlertKind {
        match self {
            AlertContext::Performance { .. } => AlertKind::Performance,
            AlertContext::Budget { .. } => AlertKind::Budget,
            AlertContext::Status { .. } => AlertKind::Status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewNotification {
    pub user_id: Uuid,
    pub campaign_id: Uuid,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub context: AlertContext,
}

impl NewNotification {
    pub fn kind(&self) -> AlertKind {
        self.context.kind()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub campaign_id: Uuid,
    pub kind: AlertKind,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub read: bool,
    pub active: bool,
    pub context: AlertContext,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Auth,
    Upstream,
    Storage,
    Config,
    AlreadyRunning,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Auth => "auth",
            ErrorKind::Upstream => "upstream",
            ErrorKind::Storage => "storage",
            ErrorKind::Config => "config",
            ErrorKind::AlreadyRunning => "already_running",
        }
    }
}

impl FromStr for ErrorKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(ErrorKind::Transient),
            "auth" => Ok(ErrorKind::Auth),
            "upstream" => Ok(ErrorKind::Upstream),
            "storage" => Ok(ErrorKind::Storage),
            "config" => Ok(ErrorKind::Config),
            "already_running" => Ok(ErrorKind::AlreadyRunning),
            other => Err(SyncError::Config(format!("unknown error kind `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    #[error("transient network error: {0}")]
    Transient(String),
    #[error("authorization failed: {0}")]
    Auth(String),
    #[error("upstream api error: {message}")]
    Upstream { code: Option<i64>, message: String },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("a sync run is already in progress for user {0}")]
    AlreadyRunning(Uuid),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Transient(_) => ErrorKind::Transient,
            SyncError::Auth(_) => ErrorKind::Auth,
            SyncError::Upstream { .. } => ErrorKind::Upstream,
            SyncError::Storage(_) => ErrorKind::Storage,
            SyncError::Config(_) => ErrorKind::Config,
            SyncError::AlreadyRunning(_) => ErrorKind::AlreadyRunning,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&SyncError> for RunFailure {
    fn from(err: &SyncError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Aggregate outcome of one sync run; returned even when sub-steps failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub run_id: Uuid,
    pub user_id: Uuid,
    pub success: bool,
    pub campaigns_written: usize,
    pub metrics_written: usize,
    pub accounts_processed: usize,
    pub accounts_failed: usize,
    pub notifications_created: usize,
    pub duration_ms: u64,
    pub period: DateRange,
    pub cancelled: bool,
    pub reauth_required: Vec<Uuid>,
    pub error: Option<RunFailure>,
}

impl SyncResult {
    pub fn empty(run_id: Uuid, user_id: Uuid, period: DateRange) -> Self {
        Self {
            run_id,
            user_id,
            success: true,
            campaigns_written: 0,
            metrics_written: 0,
            accounts_processed: 0,
            accounts_failed: 0,
            notifications_created: 0,
            duration_ms: 0,
            period,
            cancelled: false,
            reauth_required: Vec::new(),
            error: None,
        }
    }
}
