//! Enrichment passes over already-imported listings.
//!
//! A pass selects a set of units from the database, works them through a
//! bounded pool of concurrent workers that share one rate limiter, retries
//! transient failures with exponential backoff, and writes results back by
//! primary key. Responses are cached on disk so a re-run costs nothing for
//! units already looked up.

pub mod cache;
pub mod geocode;
pub mod rate_limit;
pub mod runner;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::repository::DbError;

pub use cache::ResponseCache;
pub use geocode::{CachedGeocoder, GeocodePass, Geocoder, NominatimGeocoder};
pub use rate_limit::{IntervalLimiter, RateLimitError};
pub use runner::{PassRunner, PassSummary, RetryPolicy, UnitOutcome};

/// Settings for enrichment passes (the `[enrich]` config section).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichConfig {
    /// Concurrent workers.
    pub concurrency: usize,
    /// Minimum spacing between any two outbound requests.
    pub min_interval_ms: u64,
    /// Retries per unit after the first attempt.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub timeout_secs: u64,
    /// Nominatim-compatible search endpoint.
    pub endpoint: String,
    pub user_agent: String,
    /// Units selected per pass.
    pub limit: usize,
    pub cache: bool,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            min_interval_ms: 1_000,
            max_retries: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            timeout_secs: 30,
            endpoint: "https://nominatim.openstreetmap.org/search".to_string(),
            user_agent: concat!("listing-import/", env!("CARGO_PKG_VERSION")).to_string(),
            limit: 1_000,
            cache: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status} from {url}")]
    Status {
        status: u16,
        url: String,
        retry_after: Option<Duration>,
    },

    #[error("invalid endpoint '{0}'")]
    Endpoint(String),

    #[error("unexpected response: {0}")]
    Parse(String),

    #[error("database error: {0}")]
    Database(#[from] DbError),

    #[error("cache I/O error: {0}")]
    Cache(#[from] std::io::Error),

    #[error("cancelled")]
    Cancelled,
}

impl From<RateLimitError> for EnrichError {
    fn from(e: RateLimitError) -> Self {
        match e {
            RateLimitError::Cancelled => Self::Cancelled,
        }
    }
}

impl EnrichError {
    /// Connection failures, timeouts, 429 and 5xx are worth another try.
    /// Any other 4xx will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Server-requested delay, when one was sent.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> EnrichError {
        EnrichError::Status {
            status: code,
            url: "https://geo.invalid/search".to_string(),
            retry_after: None,
        }
    }

    #[test]
    fn test_retry_classification() {
        assert!(status(429).is_retryable());
        assert!(status(503).is_retryable());
        assert!(status(500).is_retryable());
        assert!(!status(404).is_retryable());
        assert!(!status(400).is_retryable());
        assert!(!EnrichError::Cancelled.is_retryable());
        assert!(!EnrichError::Parse("bad json".to_string()).is_retryable());
    }

    #[test]
    fn test_config_defaults() {
        let config: EnrichConfig = toml::from_str("concurrency = 2").unwrap();
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.min_interval_ms, 1_000);
        assert_eq!(config.max_retries, 3);
        assert!(config.cache);
    }
}
