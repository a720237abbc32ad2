//! Ad platform provider contracts, live providers and the fixture provider.

use std::collections::HashMap;
use std::sync::Arc;

use adsync_core::{AccountCredentials, DailyInsight, DateRange, Platform, ProviderCampaign, SyncError};
use adsync_storage::{is_retryable_status, FetchError, HttpFetcher};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod fixture;
pub mod google;
pub mod meta;

pub use fixture::{FixtureAccount, FixtureProvider};
pub use google::GoogleAnalyticsProvider;
pub use meta::MetaAdsProvider;

pub const CRATE_NAME: &str = "adsync-adapters";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    #[error("transient provider failure: {0}")]
    Transient(String),
    #[error("provider rejected credentials: {0}")]
    Auth(String),
    #[error("{message}")]
    Upstream { code: Option<i64>, message: String },
    #[error("unexpected provider payload: {0}")]
    Decode(String),
}

impl From<ProviderError> for SyncError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Transient(message) => SyncError::Transient(message),
            ProviderError::Auth(message) => SyncError::Auth(message),
            ProviderError::Upstream { code, message } => SyncError::Upstream { code, message },
            ProviderError::Decode(message) => SyncError::Upstream { code: None, message },
        }
    }
}

/// Map a fetch failure to the provider taxonomy. `classify_body` gets first
/// pick at platform error payloads; anything it declines falls back to the
/// HTTP status.
pub(crate) fn provider_error_from_fetch<F>(err: FetchError, classify_body: F) -> ProviderError
where
    F: Fn(u16, &JsonValue) -> Option<ProviderError>,
{
    match err {
        FetchError::Status {
            status, url, body, ..
        } => {
            if let Ok(payload) = serde_json::from_str::<JsonValue>(&body) {
                if let Some(mapped) = classify_body(status, &payload) {
                    return mapped;
                }
            }
            match status {
                401 | 403 => ProviderError::Auth(format!("http {status} from {url}")),
                _ if is_retryable_status(status) => ProviderError::Transient(format!("http {status} from {url}")),
                _ => ProviderError::Upstream {
                    code: Some(i64::from(status)),
                    message: if body.is_empty() {
                        format!("http {status} from {url}")
                    } else {
                        body
                    },
                },
            }
        }
        err @ (FetchError::Transport { .. } | FetchError::ShutDown) => {
            if err.is_retryable() || matches!(err, FetchError::ShutDown) {
                ProviderError::Transient(err.to_string())
            } else {
                ProviderError::Upstream {
                    code: None,
                    message: err.to_string(),
                }
            }
        }
        FetchError::Decode { url, message } => ProviderError::Decode(format!("{url}: {message}")),
    }
}

/// Capability every ad platform sits behind. Credentials are passed per call.
#[async_trait]
pub trait MetricsProvider: Send + Sync {
    fn platform(&self) -> Platform;

    /// Campaigns of the account, each with its summary insights embedded.
    async fn list_campaigns(&self, credentials: &AccountCredentials) -> Result<Vec<ProviderCampaign>, ProviderError>;

    /// Per-day insights for one campaign, one record per day in `range`.
    async fn list_daily_metrics(
        &self,
        credentials: &AccountCredentials,
        campaign_external_id: &str,
        range: DateRange,
    ) -> Result<Vec<DailyInsight>, ProviderError>;
}

#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<Platform, Arc<dyn MetricsProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: Arc<dyn MetricsProvider>) -> Self {
        self.register(provider);
        self
    }

    /// Replaces any provider already registered for the same platform.
    pub fn register(&mut self, provider: Arc<dyn MetricsProvider>) {
        self.providers.insert(provider.platform(), provider);
    }

    pub fn provider_for(&self, platform: Platform) -> Option<Arc<dyn MetricsProvider>> {
        self.providers.get(&platform).cloned()
    }

    pub fn platforms(&self) -> Vec<Platform> {
        let mut platforms: Vec<Platform> = self.providers.keys().copied().collect();
        platforms.sort_by_key(|p| p.as_str());
        platforms
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("platforms", &self.platforms())
            .finish()
    }
}

/// Live Meta Ads + Google Analytics providers sharing one fetcher.
pub fn live_registry(http: Arc<HttpFetcher>, meta_base_url: &str, ga_base_url: &str) -> ProviderRegistry {
    ProviderRegistry::new()
        .with(Arc::new(MetaAdsProvider::new(http.clone(), meta_base_url)))
        .with(Arc::new(GoogleAnalyticsProvider::new(http, ga_base_url)))
}

/// Fixture providers for every platform, reading `<root>/<platform>/<account>.json`.
pub fn fixture_registry(root: impl Into<std::path::PathBuf>) -> ProviderRegistry {
    let root = root.into();
    ProviderRegistry::new()
        .with(Arc::new(FixtureProvider::from_dir(Platform::MetaAds, root.clone())))
        .with(Arc::new(FixtureProvider::from_dir(Platform::GoogleAnalytics, root)))
}

pub(crate) fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

/// Numbers arrive as JSON numbers or decimal strings depending on the platform.
pub(crate) fn lenient_f64(value: Option<&JsonValue>) -> Option<f64> {
    let parsed = match value? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

pub(crate) fn lenient_i64(value: Option<&JsonValue>) -> Option<i64> {
    match value? {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        JsonValue::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f.round() as i64))
        }
        _ => None,
    }
}
