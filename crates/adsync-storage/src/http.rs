//! JSON client shared by the live providers: bounded in-flight requests per
//! process and per ad account, an optional request rate limit, and retries
//! that honor `Retry-After`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::header::RETRY_AFTER;
use reqwest::RequestBuilder;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};

/// Upper bound on a server-requested pause.
const RETRY_AFTER_CAP: Duration = Duration::from_secs(60);

/// 408, 429 and every 5xx are worth repeating.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500..=599)
}

pub fn is_retryable_transport(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Second opinion on a failed response, for platforms that report throttling
/// inside a 4xx body. Receives the status and the raw body.
pub type BodyRetry = fn(u16, &str) -> bool;

/// The status alone decides.
pub fn status_only(_status: u16, _body: &str) -> bool {
    false
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// No retries, no waiting.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// `base_delay * 2^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = attempt.min(20) as u32;
        self.base_delay
            .saturating_mul(2u32.pow(exponent))
            .min(self.max_delay)
    }

    /// A server-provided pause wins over the computed one when it is longer.
    pub fn delay_with_hint(&self, attempt: usize, retry_after: Option<Duration>) -> Duration {
        let computed = self.delay_for_attempt(attempt);
        match retry_after {
            Some(hint) => computed.max(hint.min(RETRY_AFTER_CAP)),
            None => computed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    pub burst: u32,
    pub per_second: f64,
}

/// Token bucket refilled continuously at `per_second`.
#[derive(Debug)]
pub struct RateLimiter {
    limit: RateLimit,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    available: f64,
    updated: Instant,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self::starting_at(limit, Instant::now())
    }

    fn starting_at(limit: RateLimit, now: Instant) -> Self {
        Self {
            limit,
            bucket: Mutex::new(Bucket {
                available: f64::from(limit.burst.max(1)),
                updated: now,
            }),
        }
    }

    /// Take a token at `now`, or report how long until one is available.
    fn reserve(&self, now: Instant) -> Option<Duration> {
        if self.limit.per_second <= 0.0 {
            return None;
        }
        let mut bucket = self.bucket.lock().unwrap_or_else(|p| p.into_inner());
        let elapsed = now.saturating_duration_since(bucket.updated).as_secs_f64();
        bucket.available =
            (bucket.available + elapsed * self.limit.per_second).min(f64::from(self.limit.burst.max(1)));
        bucket.updated = now;

        if bucket.available >= 1.0 {
            bucket.available -= 1.0;
            None
        } else {
            Some(Duration::from_secs_f64(
                (1.0 - bucket.available) / self.limit.per_second,
            ))
        }
    }

    pub async fn acquire(&self) {
        while let Some(wait) = self.reserve(Instant::now()) {
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    pub per_account_in_flight: usize,
    pub backoff: BackoffPolicy,
    pub rate_limit: Option<RateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_in_flight: 16,
            per_account_in_flight: 2,
            backoff: BackoffPolicy::default(),
            rate_limit: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered http {status}")]
    Status {
        status: u16,
        url: String,
        body: String,
        retry_after: Option<Duration>,
    },
    #[error("{url} returned malformed json: {message}")]
    Decode { url: String, message: String },
    #[error("http client is shutting down")]
    ShutDown,
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Transport { source, .. } => is_retryable_transport(source),
            FetchError::Status { status, .. } => is_retryable_status(*status),
            FetchError::Decode { .. } | FetchError::ShutDown => false,
        }
    }

    /// Like [`FetchError::is_retryable`], but a non-retryable status may still
    /// be repeated when `body_retry` recognises its body.
    pub fn is_retryable_with(&self, body_retry: BodyRetry) -> bool {
        match self {
            FetchError::Status { status, body, .. } if !is_retryable_status(*status) => {
                body_retry(*status, body)
            }
            _ => self.is_retryable(),
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

fn parse_retry_after(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Semaphore,
    per_account_in_flight: usize,
    accounts: Mutex<HashMap<String, Arc<Semaphore>>>,
    limiter: Option<RateLimiter>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .gzip(true)
            .brotli(true);
        if let Some(agent) = config.user_agent.as_deref() {
            builder = builder.user_agent(agent);
        }
        let client = builder.build().context("building provider http client")?;

        Ok(Self {
            client,
            in_flight: Semaphore::new(config.max_in_flight.max(1)),
            per_account_in_flight: config.per_account_in_flight.max(1),
            accounts: Mutex::new(HashMap::new()),
            limiter: config.rate_limit.map(RateLimiter::new),
            backoff: config.backoff,
        })
    }

    fn account_slots(&self, account_key: &str) -> Arc<Semaphore> {
        let mut accounts = self.accounts.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(
            accounts
                .entry(account_key.to_owned())
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_account_in_flight))),
        )
    }

    pub async fn get_json(
        &self,
        account_key: &str,
        url: &str,
        query: &[(&str, String)],
        bearer_token: &str,
        body_retry: BodyRetry,
    ) -> Result<JsonValue, FetchError> {
        self.execute(account_key, url, body_retry, || {
            self.client.get(url).query(query).bearer_auth(bearer_token)
        })
        .await
    }

    pub async fn post_json(
        &self,
        account_key: &str,
        url: &str,
        body: &JsonValue,
        bearer_token: &str,
        body_retry: BodyRetry,
    ) -> Result<JsonValue, FetchError> {
        self.execute(account_key, url, body_retry, || {
            self.client.post(url).json(body).bearer_auth(bearer_token)
        })
        .await
    }

    async fn execute<F>(
        &self,
        account_key: &str,
        url: &str,
        body_retry: BodyRetry,
        request: F,
    ) -> Result<JsonValue, FetchError>
    where
        F: Fn() -> RequestBuilder,
    {
        let _process_slot = self.in_flight.acquire().await.map_err(|_| FetchError::ShutDown)?;
        let account_slots = self.account_slots(account_key);
        let _account_slot = account_slots.acquire().await.map_err(|_| FetchError::ShutDown)?;

        let span = info_span!("provider_request", account = account_key, url);
        async {
            let mut attempt = 0;
            loop {
                match self.attempt(url, &request).await {
                    Ok(payload) => return Ok(payload),
                    Err(err) if err.is_retryable_with(body_retry) && attempt < self.backoff.max_retries => {
                        let wait = self.backoff.delay_with_hint(attempt, err.retry_after());
                        debug!(attempt, ?wait, error = %err, "retrying provider request");
                        tokio::time::sleep(wait).await;
                        attempt += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn attempt<F>(&self, url: &str, request: &F) -> Result<JsonValue, FetchError>
    where
        F: Fn() -> RequestBuilder,
    {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }
        let transport = |source| FetchError::Transport {
            url: url.to_owned(),
            source,
        };
        let resp = request().send().await.map_err(transport)?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let retry_after = parse_retry_after(&resp);
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                status,
                url: url.to_owned(),
                body,
                retry_after,
            });
        }
        let bytes = resp.bytes().await.map_err(transport)?;
        serde_json::from_slice(&bytes).map_err(|e| FetchError::Decode {
            url: url.to_owned(),
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = BackoffPolicy {
            max_retries: 4,
            base_delay: Duration::from_millis(40),
            max_delay: Duration::from_millis(150),
        };
        let delays: Vec<u128> = (0..4).map(|a| policy.delay_for_attempt(a).as_millis()).collect();
        assert_eq!(delays, vec![40, 80, 150, 150]);
        assert_eq!(policy.delay_for_attempt(60), policy.max_delay);
        assert_eq!(BackoffPolicy::none().delay_for_attempt(3), Duration::ZERO);
    }

    #[test]
    fn retry_after_extends_but_is_bounded() {
        let policy = BackoffPolicy::default();
        assert_eq!(
            policy.delay_with_hint(0, Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
        assert_eq!(
            policy.delay_with_hint(0, Some(Duration::from_secs(3600))),
            RETRY_AFTER_CAP
        );
        assert_eq!(policy.delay_with_hint(1, None), Duration::from_millis(500));
    }

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        for status in [408, 429, 500, 503] {
            assert!(is_retryable_status(status), "{status}");
        }
        for status in [400, 401, 403, 404] {
            assert!(!is_retryable_status(status), "{status}");
        }
        let throttled = FetchError::Status {
            status: 429,
            url: "https://graph.example/v20.0/act_1/campaigns".into(),
            body: String::new(),
            retry_after: Some(Duration::from_secs(1)),
        };
        assert!(throttled.is_retryable());
        assert_eq!(throttled.retry_after(), Some(Duration::from_secs(1)));
        assert!(!FetchError::ShutDown.is_retryable());
    }

    #[test]
    fn body_classifier_can_promote_a_client_error() {
        let limited = FetchError::Status {
            status: 400,
            url: "https://graph.example/v20.0/act_1/insights".into(),
            body: r#"{"error":{"code":17}}"#.into(),
            retry_after: None,
        };
        assert!(!limited.is_retryable());
        assert!(!limited.is_retryable_with(status_only));
        assert!(limited.is_retryable_with(|_, body| body.contains("\"code\":17")));
        assert!(!FetchError::ShutDown.is_retryable_with(|_, _| true));
    }

    #[test]
    fn rate_limiter_spends_burst_then_waits_for_refill() {
        let start = Instant::now();
        let limiter = RateLimiter::starting_at(RateLimit { burst: 2, per_second: 4.0 }, start);
        assert_eq!(limiter.reserve(start), None);
        assert_eq!(limiter.reserve(start), None);

        let wait = limiter.reserve(start).unwrap();
        assert_eq!(wait, Duration::from_millis(250));

        assert_eq!(limiter.reserve(start + Duration::from_millis(250)), None);
        assert!(limiter.reserve(start + Duration::from_millis(300)).is_some());
    }

    #[test]
    fn unlimited_rate_never_waits() {
        let limiter = RateLimiter::new(RateLimit { burst: 1, per_second: 0.0 });
        for _ in 0..10 {
            assert_eq!(limiter.reserve(Instant::now()), None);
        }
    }
}
