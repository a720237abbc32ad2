//! Google Analytics 4 Data API provider (`properties/{id}:runReport`).

use std::sync::Arc;

use adsync_core::{AccountCredentials, DailyInsight, DateRange, Platform, ProviderCampaign};
use adsync_storage::{status_only, HttpFetcher};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{json, Value as JsonValue};

use crate::{json_str, lenient_f64, lenient_i64, provider_error_from_fetch, MetricsProvider, ProviderError};

pub const GA_DATA_BASE_URL: &str = "https://analyticsdata.googleapis.com/v1beta";

/// GA4 has no campaign lifecycle; anything reported is treated as running.
const REPORTED_STATUS: &str = "ACTIVE";
const NOT_SET: &str = "(not set)";
const CAMPAIGN_LOOKBACK: &str = "30daysAgo";

pub struct GoogleAnalyticsProvider {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl GoogleAnalyticsProvider {
    pub fn new(http: Arc<HttpFetcher>, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn run_report(&self, credentials: &AccountCredentials, body: &JsonValue) -> Result<Report, ProviderError> {
        let property = credentials
            .external_account_id
            .trim()
            .trim_start_matches("properties/");
        let url = format!("{}/properties/{}:runReport", self.base_url, property);
        let payload = self
            .http
            .post_json(
                &credentials.external_account_id,
                &url,
                body,
                &credentials.access_token,
                status_only,
            )
            .await
            .map_err(|e| provider_error_from_fetch(e, classify_google_error))?;
        Report::parse(&payload)
    }
}

/// Google APIs report failures as `{"error": {"code", "message", "status"}}`.
pub fn classify_google_error(_status: u16, payload: &JsonValue) -> Option<ProviderError> {
    let error = payload.get("error")?;
    let code = error.get("code").and_then(JsonValue::as_i64);
    let message = json_str(error, &["message"])
        .unwrap_or("google analytics api error")
        .to_string();
    let mapped = match json_str(error, &["status"]).unwrap_or_default() {
        "UNAUTHENTICATED" | "PERMISSION_DENIED" => ProviderError::Auth(message),
        "RESOURCE_EXHAUSTED" | "UNAVAILABLE" | "DEADLINE_EXCEEDED" | "INTERNAL" => {
            ProviderError::Transient(message)
        }
        _ => ProviderError::Upstream { code, message },
    };
    Some(mapped)
}

/// Column-addressable view over a runReport response.
#[derive(Debug, Default)]
pub struct Report {
    dimensions: Vec<String>,
    metrics: Vec<String>,
    rows: Vec<(Vec<String>, Vec<JsonValue>)>,
}

impl Report {
    pub fn parse(payload: &JsonValue) -> Result<Self, ProviderError> {
        let headers = |key: &str| -> Vec<String> {
            payload
                .get(key)
                .and_then(JsonValue::as_array)
                .map(|hs| {
                    hs.iter()
                        .filter_map(|h| json_str(h, &["name"]).map(ToString::to_string))
                        .collect()
                })
                .unwrap_or_default()
        };
        let dimensions = headers("dimensionHeaders");
        let metrics = headers("metricHeaders");

        let mut rows = Vec::new();
        if let Some(raw_rows) = payload.get("rows") {
            let raw_rows = raw_rows
                .as_array()
                .ok_or_else(|| ProviderError::Decode("`rows` is not an array".into()))?;
            for row in raw_rows {
                let dims = row
                    .get("dimensionValues")
                    .and_then(JsonValue::as_array)
                    .map(|vs| {
                        vs.iter()
                            .map(|v| json_str(v, &["value"]).unwrap_or_default().to_string())
                            .collect()
                    })
                    .unwrap_or_default();
                let mets = row
                    .get("metricValues")
                    .and_then(JsonValue::as_array)
                    .map(|vs| vs.iter().map(|v| v.get("value").cloned().unwrap_or(JsonValue::Null)).collect())
                    .unwrap_or_default();
                rows.push((dims, mets));
            }
        }
        Ok(Self {
            dimensions,
            metrics,
            rows,
        })
    }

    fn dimension<'a>(&self, row: &'a (Vec<String>, Vec<JsonValue>), name: &str) -> Option<&'a str> {
        let idx = self.dimensions.iter().position(|d| d == name)?;
        row.0.get(idx).map(String::as_str)
    }

    fn metric<'a>(&self, row: &'a (Vec<String>, Vec<JsonValue>), name: &str) -> Option<&'a JsonValue> {
        let idx = self.metrics.iter().position(|m| m == name)?;
        row.1.get(idx)
    }

    pub fn campaigns(&self) -> Vec<ProviderCampaign> {
        self.rows
            .iter()
            .filter_map(|row| {
                let id = self.dimension(row, "sessionCampaignId")?;
                if id.is_empty() || id == NOT_SET {
                    return None;
                }
                let name = self
                    .dimension(row, "sessionCampaignName")
                    .filter(|n| !n.is_empty() && *n != NOT_SET)
                    .unwrap_or(id);
                Some(ProviderCampaign {
                    external_id: id.to_string(),
                    name: name.to_string(),
                    status: REPORTED_STATUS.to_string(),
                    objective: None,
                    spend: lenient_f64(self.metric(row, "advertiserAdCost")),
                    reach: lenient_i64(self.metric(row, "totalUsers")),
                    impressions: lenient_i64(self.metric(row, "advertiserAdImpressions")),
                    clicks: lenient_i64(self.metric(row, "advertiserAdClicks")),
                    ctr: None,
                })
            })
            .collect()
    }

    pub fn daily_insights(&self) -> Result<Vec<DailyInsight>, ProviderError> {
        let mut out = Vec::with_capacity(self.rows.len());
        for row in &self.rows {
            let raw = self
                .dimension(row, "date")
                .ok_or_else(|| ProviderError::Decode("report row without date dimension".into()))?;
            let date = NaiveDate::parse_from_str(raw, "%Y%m%d")
                .map_err(|e| ProviderError::Decode(format!("date `{raw}`: {e}")))?;
            out.push(DailyInsight {
                date,
                spend: lenient_f64(self.metric(row, "advertiserAdCost")),
                impressions: lenient_i64(self.metric(row, "advertiserAdImpressions")),
                clicks: lenient_i64(self.metric(row, "advertiserAdClicks")),
                ctr: None,
                cpc: lenient_f64(self.metric(row, "advertiserAdCostPerClick")),
                cpm: None,
                conversions: lenient_i64(self.metric(row, "conversions")),
            });
        }
        out.sort_by_key(|i| i.date);
        Ok(out)
    }
}

fn metric_list(names: &[&str]) -> JsonValue {
    JsonValue::Array(names.iter().map(|n| json!({ "name": n })).collect())
}

#[async_trait]
impl MetricsProvider for GoogleAnalyticsProvider {
    fn platform(&self) -> Platform {
        Platform::GoogleAnalytics
    }

    async fn list_campaigns(&self, credentials: &AccountCredentials) -> Result<Vec<ProviderCampaign>, ProviderError> {
        let body = json!({
            "dateRanges": [{"startDate": CAMPAIGN_LOOKBACK, "endDate": "today"}],
            "dimensions": metric_list(&["sessionCampaignId", "sessionCampaignName"]),
            "metrics": metric_list(&[
                "advertiserAdCost",
                "advertiserAdImpressions",
                "advertiserAdClicks",
                "totalUsers",
            ]),
        });
        Ok(self.run_report(credentials, &body).await?.campaigns())
    }

    async fn list_daily_metrics(
        &self,
        credentials: &AccountCredentials,
        campaign_external_id: &str,
        range: DateRange,
    ) -> Result<Vec<DailyInsight>, ProviderError> {
        let body = json!({
            "dateRanges": [{
                "startDate": range.since.format("%Y-%m-%d").to_string(),
                "endDate": range.until.format("%Y-%m-%d").to_string(),
            }],
            "dimensions": metric_list(&["date"]),
            "metrics": metric_list(&[
                "advertiserAdCost",
                "advertiserAdImpressions",
                "advertiserAdClicks",
                "advertiserAdCostPerClick",
                "conversions",
            ]),
            "dimensionFilter": {
                "filter": {
                    "fieldName": "sessionCampaignId",
                    "stringFilter": {"matchType": "EXACT", "value": campaign_external_id}
                }
            },
        });
        self.run_report(credentials, &body).await?.daily_insights()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn campaign_report() -> JsonValue {
        json!({
            "dimensionHeaders": [{"name": "sessionCampaignId"}, {"name": "sessionCampaignName"}],
            "metricHeaders": [
                {"name": "advertiserAdCost", "type": "TYPE_CURRENCY"},
                {"name": "advertiserAdImpressions", "type": "TYPE_INTEGER"},
                {"name": "advertiserAdClicks", "type": "TYPE_INTEGER"},
                {"name": "totalUsers", "type": "TYPE_INTEGER"}
            ],
            "rows": [
                {
                    "dimensionValues": [{"value": "2001"}, {"value": "brand_search"}],
                    "metricValues": [{"value": "88.5"}, {"value": "3200"}, {"value": "96"}, {"value": "1400"}]
                },
                {
                    "dimensionValues": [{"value": "(not set)"}, {"value": "(not set)"}],
                    "metricValues": [{"value": "0"}, {"value": "0"}, {"value": "0"}, {"value": "50"}]
                }
            ]
        })
    }

    #[test]
    fn campaign_report_skips_unattributed_rows_and_reports_active() {
        let report = Report::parse(&campaign_report()).unwrap();
        let campaigns = report.campaigns();
        assert_eq!(campaigns.len(), 1);
        assert_eq!(campaigns[0].external_id, "2001");
        assert_eq!(campaigns[0].name, "brand_search");
        assert_eq!(campaigns[0].status, "ACTIVE");
        assert_eq!(campaigns[0].spend, Some(88.5));
        assert_eq!(campaigns[0].reach, Some(1400));
        assert_eq!(campaigns[0].ctr, None);
    }

    #[test]
    fn daily_report_parses_compact_dates_in_order() {
        let payload = json!({
            "dimensionHeaders": [{"name": "date"}],
            "metricHeaders": [{"name": "advertiserAdCost"}, {"name": "advertiserAdClicks"}, {"name": "conversions"}],
            "rows": [
                {"dimensionValues": [{"value": "20240305"}], "metricValues": [{"value": "4"}, {"value": "10"}, {"value": "2"}]},
                {"dimensionValues": [{"value": "20240304"}], "metricValues": [{"value": "3"}, {"value": "8"}, {"value": "0"}]}
            ]
        });
        let insights = Report::parse(&payload).unwrap().daily_insights().unwrap();
        assert_eq!(insights.len(), 2);
        assert_eq!(insights[0].date, NaiveDate::from_ymd_opt(2024, 3, 4).unwrap());
        assert_eq!(insights[1].clicks, Some(10));
        assert_eq!(insights[1].conversions, Some(2));
    }

    #[test]
    fn empty_report_has_no_rows() {
        let report = Report::parse(&json!({"dimensionHeaders": [], "metricHeaders": []})).unwrap();
        assert!(report.campaigns().is_empty());
        assert!(report.daily_insights().unwrap().is_empty());
    }

    #[test]
    fn google_error_statuses_map_onto_the_taxonomy() {
        let unauthenticated = json!({"error": {"code": 401, "message": "Request had invalid authentication credentials.", "status": "UNAUTHENTICATED"}});
        assert!(matches!(classify_google_error(401, &unauthenticated), Some(ProviderError::Auth(_))));
        let quota = json!({"error": {"code": 429, "message": "Exhausted property tokens", "status": "RESOURCE_EXHAUSTED"}});
        assert!(matches!(classify_google_error(429, &quota), Some(ProviderError::Transient(_))));
        let bad = json!({"error": {"code": 400, "message": "Field foo is not valid", "status": "INVALID_ARGUMENT"}});
        assert!(matches!(
            classify_google_error(400, &bad),
            Some(ProviderError::Upstream { code: Some(400), .. })
        ));
    }
}
