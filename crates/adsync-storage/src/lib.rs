//! Persistence and provider transport for adsync: the `MetricsStore` seam
//! with its Postgres and in-memory backends, and the shared HTTP client.

pub mod http;
pub mod memory;
pub mod postgres;
pub mod store;

pub use http::{
    is_retryable_status, is_retryable_transport, status_only, BackoffPolicy, BodyRetry, FetchError,
    HttpClientConfig, HttpFetcher, RateLimit, RateLimiter,
};
pub use memory::InMemoryMetricsStore;
pub use postgres::PgMetricsStore;
pub use store::{MetricsStore, RunLease, StoreError};

pub const CRATE_NAME: &str = "adsync-storage";
