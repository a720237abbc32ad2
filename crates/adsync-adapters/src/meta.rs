//! Meta Ads (Facebook Graph API) provider.

use std::sync::Arc;

use adsync_core::{AccountCredentials, DailyInsight, DateRange, Platform, ProviderCampaign};
use adsync_storage::HttpFetcher;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, warn};

use crate::{json_str, lenient_f64, lenient_i64, provider_error_from_fetch, MetricsProvider, ProviderError};

pub const META_GRAPH_BASE_URL: &str = "https://graph.facebook.com";
pub const META_API_VERSION: &str = "v20.0";

const CAMPAIGN_FIELDS: &str = "id,name,status,objective,insights{spend,reach,impressions,clicks,ctr}";
const INSIGHT_FIELDS: &str = "spend,impressions,clicks,ctr,cpc,cpm,actions";
const PAGE_LIMIT: &str = "100";
pub const DEFAULT_MAX_PAGES: usize = 25;

/// Graph error codes that signal an invalid or expired access token.
const AUTH_ERROR_CODES: &[i64] = &[102, 190];
/// Throttling and temporary-unavailability codes.
const TRANSIENT_ERROR_CODES: &[i64] = &[1, 2, 4, 17, 32, 341, 613];

pub struct MetaAdsProvider {
    http: Arc<HttpFetcher>,
    base_url: String,
    max_pages: usize,
}

impl MetaAdsProvider {
    /// `base_url` is the Graph host; the API version is appended here.
    pub fn new(http: Arc<HttpFetcher>, base_url: &str) -> Self {
        Self {
            http,
            base_url: format!("{}/{}", base_url.trim_end_matches('/'), META_API_VERSION),
            max_pages: DEFAULT_MAX_PAGES,
        }
    }

    /// Follow `paging.next` up to `max_pages`, collecting each page's `data`.
    async fn fetch_paged(
        &self,
        credentials: &AccountCredentials,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<JsonValue>, ProviderError> {
        let account_key = credentials.external_account_id.as_str();
        let token = credentials.access_token.as_str();

        let mut page = self
            .http
            .get_json(account_key, url, query, token, is_graph_retryable)
            .await
            .map_err(|e| provider_error_from_fetch(e, classify_graph_error))?;
        let mut rows = Vec::new();
        let mut pages = 1usize;
        loop {
            if let Some(mapped) = classify_graph_error(200, &page) {
                return Err(mapped);
            }
            rows.extend(page_rows(&page)?);

            let Some(next) = next_page_url(&page) else {
                break;
            };
            if pages >= self.max_pages {
                warn!(account = account_key, pages, "meta pagination limit reached; remaining pages skipped");
                break;
            }
            debug!(account = account_key, pages, "following meta paging.next");
            page = self
                .http
                .get_json(account_key, &next, &[], token, is_graph_retryable)
                .await
                .map_err(|e| provider_error_from_fetch(e, classify_graph_error))?;
            pages += 1;
        }
        Ok(rows)
    }
}

pub fn act_path(external_account_id: &str) -> String {
    format!("act_{}", external_account_id.trim().trim_start_matches("act_"))
}

fn page_rows(page: &JsonValue) -> Result<Vec<JsonValue>, ProviderError> {
    match page.get("data") {
        Some(JsonValue::Array(rows)) => Ok(rows.clone()),
        Some(_) => Err(ProviderError::Decode("`data` is not an array".into())),
        None => Err(ProviderError::Decode("response has no `data` field".into())),
    }
}

fn next_page_url(page: &JsonValue) -> Option<String> {
    json_str(page, &["paging", "next"])
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

/// Graph reports failures as `{"error": {"message", "code", ...}}`.
pub fn classify_graph_error(status: u16, payload: &JsonValue) -> Option<ProviderError> {
    let error = payload.get("error")?;
    let code = error.get("code").and_then(JsonValue::as_i64);
    let message = error
        .get("message")
        .and_then(JsonValue::as_str)
        .unwrap_or("meta graph api error")
        .to_string();
    let is_transient_flag = error
        .get("is_transient")
        .and_then(JsonValue::as_bool)
        .unwrap_or(false);

    let mapped = match code {
        Some(c) if AUTH_ERROR_CODES.contains(&c) => ProviderError::Auth(message),
        Some(c) if TRANSIENT_ERROR_CODES.contains(&c) => ProviderError::Transient(message),
        _ if is_transient_flag => ProviderError::Transient(message),
        _ if status == 401 => ProviderError::Auth(message),
        _ => ProviderError::Upstream { code, message },
    };
    Some(mapped)
}

/// Graph throttling arrives as HTTP 400 with a transient error code.
pub fn is_graph_retryable(status: u16, body: &str) -> bool {
    serde_json::from_str::<JsonValue>(body)
        .ok()
        .and_then(|payload| classify_graph_error(status, &payload))
        .is_some_and(|err| matches!(err, ProviderError::Transient(_)))
}

pub fn parse_campaign(row: &JsonValue) -> Result<ProviderCampaign, ProviderError> {
    let external_id = json_str(row, &["id"])
        .ok_or_else(|| ProviderError::Decode("campaign without id".into()))?
        .to_string();
    let insights = row
        .get("insights")
        .and_then(|i| i.get("data"))
        .and_then(|d| d.get(0))
        .unwrap_or(&JsonValue::Null);

    Ok(ProviderCampaign {
        name: json_str(row, &["name"]).unwrap_or(external_id.as_str()).to_string(),
        status: json_str(row, &["status"]).unwrap_or("PAUSED").to_string(),
        objective: json_str(row, &["objective"]).map(ToString::to_string),
        spend: lenient_f64(insights.get("spend")),
        reach: lenient_i64(insights.get("reach")),
        impressions: lenient_i64(insights.get("impressions")),
        clicks: lenient_i64(insights.get("clicks")),
        ctr: lenient_f64(insights.get("ctr")),
        external_id,
    })
}

/// Lead count from the `actions` breakdown, if the platform reported one.
fn lead_actions(row: &JsonValue) -> Option<i64> {
    row.get("actions")?
        .as_array()?
        .iter()
        .find(|action| json_str(action, &["action_type"]) == Some("lead"))
        .and_then(|action| lenient_i64(action.get("value")))
}

pub fn parse_daily_insight(row: &JsonValue) -> Result<DailyInsight, ProviderError> {
    let raw_date = json_str(row, &["date_start"])
        .ok_or_else(|| ProviderError::Decode("insight row without date_start".into()))?;
    let date = NaiveDate::parse_from_str(raw_date, "%Y-%m-%d")
        .map_err(|e| ProviderError::Decode(format!("date_start `{raw_date}`: {e}")))?;
    Ok(DailyInsight {
        date,
        spend: lenient_f64(row.get("spend")),
        impressions: lenient_i64(row.get("impressions")),
        clicks: lenient_i64(row.get("clicks")),
        ctr: lenient_f64(row.get("ctr")),
        cpc: lenient_f64(row.get("cpc")),
        cpm: lenient_f64(row.get("cpm")),
        conversions: lead_actions(row),
    })
}

#[async_trait]
impl MetricsProvider for MetaAdsProvider {
    fn platform(&self) -> Platform {
        Platform::MetaAds
    }

    async fn list_campaigns(&self, credentials: &AccountCredentials) -> Result<Vec<ProviderCampaign>, ProviderError> {
        let url = format!("{}/{}/campaigns", self.base_url, act_path(&credentials.external_account_id));
        let query = [
            ("fields", CAMPAIGN_FIELDS.to_string()),
            ("limit", PAGE_LIMIT.to_string()),
        ];
        let rows = self.fetch_paged(credentials, &url, &query).await?;
        rows.iter().map(parse_campaign).collect()
    }

    async fn list_daily_metrics(
        &self,
        credentials: &AccountCredentials,
        campaign_external_id: &str,
        range: DateRange,
    ) -> Result<Vec<DailyInsight>, ProviderError> {
        let url = format!("{}/{}/insights", self.base_url, campaign_external_id);
        let time_range = json!({
            "since": range.since.format("%Y-%m-%d").to_string(),
            "until": range.until.format("%Y-%m-%d").to_string(),
        });
        let query = [
            ("fields", INSIGHT_FIELDS.to_string()),
            ("time_range", time_range.to_string()),
            ("time_increment", "1".to_string()),
            ("limit", PAGE_LIMIT.to_string()),
        ];
        let rows = self.fetch_paged(credentials, &url, &query).await?;
        rows.iter().map(parse_daily_insight).collect()
    }
}
