//! Fixture-backed provider: canned campaign and daily-insight payloads served
//! from JSON files or from memory, with optional failure injection.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use adsync_core::{AccountCredentials, DailyInsight, DateRange, Platform, ProviderCampaign};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{MetricsProvider, ProviderError};

/// Everything one account returns: its campaigns and, per campaign external
/// id, the daily insight rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixtureAccount {
    #[serde(default)]
    pub campaigns: Vec<ProviderCampaign>,
    #[serde(default)]
    pub daily: HashMap<String, Vec<DailyInsight>>,
    /// Shift each campaign's series so its newest row falls on the last day
    /// of the requested range, keeping the gaps between rows.
    #[serde(default)]
    pub replay: bool,
}

fn replay_onto(rows: Vec<DailyInsight>, until: NaiveDate) -> Vec<DailyInsight> {
    let Some(newest) = rows.iter().map(|r| r.date).max() else {
        return rows;
    };
    let shift = until - newest;
    rows.into_iter()
        .map(|mut row| {
            row.date = row.date.checked_add_signed(shift).unwrap_or(row.date);
            row
        })
        .collect()
}

#[derive(Debug, Default)]
struct Failures {
    accounts: HashMap<String, ProviderError>,
    campaigns: HashMap<String, ProviderError>,
}

#[derive(Debug)]
pub struct FixtureProvider {
    platform: Platform,
    root: Option<PathBuf>,
    accounts: Mutex<HashMap<String, FixtureAccount>>,
    failures: Mutex<Failures>,
}

pub fn load_fixture_account(path: impl AsRef<Path>) -> Result<FixtureAccount> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

impl FixtureProvider {
    /// Reads `<root>/<platform>/<external_account_id>.json` on every call.
    pub fn from_dir(platform: Platform, root: impl Into<PathBuf>) -> Self {
        Self {
            platform,
            root: Some(root.into()),
            accounts: Mutex::new(HashMap::new()),
            failures: Mutex::new(Failures::default()),
        }
    }

    pub fn in_memory(platform: Platform) -> Self {
        Self {
            platform,
            root: None,
            accounts: Mutex::new(HashMap::new()),
            failures: Mutex::new(Failures::default()),
        }
    }

    pub fn fixture_path(&self, external_account_id: &str) -> Option<PathBuf> {
        self.root.as_ref().map(|root| {
            root.join(self.platform.as_str())
                .join(format!("{external_account_id}.json"))
        })
    }

    /// Register or replace an account's payload (takes precedence over files).
    pub fn insert_account(&self, external_account_id: &str, account: FixtureAccount) {
        if let Ok(mut accounts) = self.accounts.lock() {
            accounts.insert(external_account_id.to_string(), account);
        }
    }

    /// Every call for this account fails with `error` until cleared.
    pub fn fail_account(&self, external_account_id: &str, error: ProviderError) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.accounts.insert(external_account_id.to_string(), error);
        }
    }

    /// Daily-insight calls for this campaign fail with `error`.
    pub fn fail_campaign(&self, campaign_external_id: &str, error: ProviderError) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.campaigns.insert(campaign_external_id.to_string(), error);
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut failures) = self.failures.lock() {
            *failures = Failures::default();
        }
    }

    fn injected_failure(&self, account: &str, campaign: Option<&str>) -> Option<ProviderError> {
        let failures = self.failures.lock().ok()?;
        if let Some(err) = failures.accounts.get(account) {
            return Some(err.clone());
        }
        campaign.and_then(|c| failures.campaigns.get(c).cloned())
    }

    fn account(&self, external_account_id: &str) -> Result<FixtureAccount, ProviderError> {
        let in_memory = self
            .accounts
            .lock()
            .map_err(|_| ProviderError::Transient("fixture state poisoned".into()))?
            .get(external_account_id)
            .cloned();
        if let Some(account) = in_memory {
            return Ok(account);
        }
        match self.fixture_path(external_account_id) {
            Some(path) if path.exists() => {
                load_fixture_account(&path).map_err(|e| ProviderError::Decode(format!("{e:#}")))
            }
            _ => Err(ProviderError::Upstream {
                code: None,
                message: format!(
                    "no {} fixture for account {external_account_id}",
                    self.platform
                ),
            }),
        }
    }
}

#[async_trait]
impl MetricsProvider for FixtureProvider {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn list_campaigns(&self, credentials: &AccountCredentials) -> Result<Vec<ProviderCampaign>, ProviderError> {
        if let Some(err) = self.injected_failure(&credentials.external_account_id, None) {
            return Err(err);
        }
        Ok(self.account(&credentials.external_account_id)?.campaigns)
    }

    async fn list_daily_metrics(
        &self,
        credentials: &AccountCredentials,
        campaign_external_id: &str,
        range: DateRange,
    ) -> Result<Vec<DailyInsight>, ProviderError> {
        if let Some(err) = self.injected_failure(&credentials.external_account_id, Some(campaign_external_id)) {
            return Err(err);
        }
        let account = self.account(&credentials.external_account_id)?;
        let mut rows = account.daily.get(campaign_external_id).cloned().unwrap_or_default();
        if account.replay {
            rows = replay_onto(rows, range.until);
        }
        rows.retain(|r| range.contains(r.date));
        rows.sort_by_key(|r| r.date);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials(account: &str) -> AccountCredentials {
        AccountCredentials {
            external_account_id: account.into(),
            access_token: "token".into(),
        }
    }

    fn insight(day: u32, clicks: i64) -> DailyInsight {
        DailyInsight {
            date: NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
            spend: Some(1.0),
            impressions: Some(100),
            clicks: Some(clicks),
            ctr: None,
            cpc: None,
            cpm: None,
            conversions: None,
        }
    }

    #[tokio::test]
    async fn loads_accounts_from_platform_directory() {
        let dir = tempfile::tempdir().unwrap();
        let platform_dir = dir.path().join("meta_ads");
        fs::create_dir_all(&platform_dir).unwrap();
        let account = FixtureAccount {
            campaigns: vec![ProviderCampaign {
                external_id: "c1".into(),
                name: "Spring".into(),
                status: "ACTIVE".into(),
                objective: None,
                spend: Some(12.0),
                reach: None,
                impressions: None,
                clicks: None,
                ctr: None,
            }],
            daily: HashMap::from([("c1".to_string(), vec![insight(1, 3), insight(9, 4)])]),
            replay: false,
        };
        fs::write(
            platform_dir.join("act_1.json"),
            serde_json::to_string_pretty(&account).unwrap(),
        )
        .unwrap();

        let provider = FixtureProvider::from_dir(Platform::MetaAds, dir.path());
        let campaigns = provider.list_campaigns(&credentials("act_1")).await.unwrap();
        assert_eq!(campaigns.len(), 1);

        let range = DateRange {
            since: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            until: NaiveDate::from_ymd_opt(2024, 3, 7).unwrap(),
        };
        let daily = provider
            .list_daily_metrics(&credentials("act_1"), "c1", range)
            .await
            .unwrap();
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].clicks, Some(3));
    }

    #[tokio::test]
    async fn replayed_series_ends_on_the_last_requested_day() {
        let provider = FixtureProvider::in_memory(Platform::MetaAds);
        provider.insert_account(
            "a",
            FixtureAccount {
                daily: HashMap::from([(
                    "c1".to_string(),
                    vec![insight(1, 1), insight(2, 2), insight(4, 4), insight(5, 5)],
                )]),
                replay: true,
                ..Default::default()
            },
        );

        let until = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        let range = DateRange::trailing(until, 7);
        let daily = provider
            .list_daily_metrics(&credentials("a"), "c1", range)
            .await
            .unwrap();
        let dates: Vec<NaiveDate> = daily.iter().map(|r| r.date).collect();
        assert_eq!(
            dates,
            vec![
                NaiveDate::from_ymd_opt(2026, 10, 14).unwrap(),
                NaiveDate::from_ymd_opt(2026, 10, 15).unwrap(),
                NaiveDate::from_ymd_opt(2026, 10, 17).unwrap(),
                until,
            ]
        );
        assert_eq!(daily[3].clicks, Some(5));
    }

    #[tokio::test]
    async fn missing_fixture_is_an_upstream_error() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FixtureProvider::from_dir(Platform::GoogleAnalytics, dir.path());
        let err = provider.list_campaigns(&credentials("404")).await.unwrap_err();
        assert!(matches!(err, ProviderError::Upstream { .. }));
    }

    #[tokio::test]
    async fn injected_failures_apply_per_account_and_campaign() {
        let provider = FixtureProvider::in_memory(Platform::MetaAds);
        provider.insert_account("a", FixtureAccount::default());
        provider.fail_campaign("c9", ProviderError::Transient("timeout".into()));
        provider.fail_account("b", ProviderError::Auth("expired".into()));

        assert!(provider.list_campaigns(&credentials("a")).await.unwrap().is_empty());
        let range = DateRange::trailing(NaiveDate::from_ymd_opt(2024, 3, 7).unwrap(), 7);
        assert!(matches!(
            provider.list_daily_metrics(&credentials("a"), "c9", range).await,
            Err(ProviderError::Transient(_))
        ));
        assert!(matches!(
            provider.list_campaigns(&credentials("b")).await,
            Err(ProviderError::Auth(_))
        ));

        provider.clear_failures();
        assert!(provider.list_daily_metrics(&credentials("a"), "c9", range).await.unwrap().is_empty());
    }
}
