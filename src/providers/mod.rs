// =============================================================================
// Market-data providers — pluggable HTTP back-ends behind one trait
// =============================================================================
//
// Each provider implements the same narrow capability set so the fetcher can
// rotate between them on typed failures instead of thrown errors. A provider
// without an API key reports `is_configured() == false` and is never
// selected.
// =============================================================================

pub mod alpha_vantage;
pub mod finnhub;
pub mod polygon;
pub mod synthetic;
pub mod twelve_data;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{Bar, Pair, Quote, Timeframe};

// =============================================================================
// Error taxonomy
// =============================================================================

/// Default cooldown applied to HTTP 429 without a retry-after header.
pub const DEFAULT_429_COOLDOWN_SECS: u64 = 600;
/// Default cooldown applied to HTTP 403.
pub const DEFAULT_403_COOLDOWN_SECS: u64 = 1800;

/// Typed failure from a single provider call. The fetcher rotates to the
/// next provider on any variant; `RateLimited`/`Forbidden` additionally
/// register a cooldown.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("provider not configured")]
    NotConfigured,

    #[error("rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("forbidden by provider")]
    Forbidden,

    #[error("http {status}: {body}")]
    Http { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("empty response")]
    Empty,

    #[error("unsupported by provider: {0}")]
    Unsupported(String),
}

impl ProviderError {
    /// Whether this failure should register a quota cooldown.
    pub fn is_quota(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Forbidden)
    }

    /// Cooldown to apply for quota failures. Retry-after headers are honored
    /// exactly; missing headers fall back to the 429/403 defaults.
    pub fn backoff_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } => {
                Some(retry_after_secs.unwrap_or(DEFAULT_429_COOLDOWN_SECS))
            }
            Self::Forbidden => Some(DEFAULT_403_COOLDOWN_SECS),
            _ => None,
        }
    }
}

// =============================================================================
// Provider trait
// =============================================================================

/// Capability set every market-data provider exposes.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Stable provider id used in metrics and bar sources.
    fn id(&self) -> &'static str;

    /// True when credentials are present.
    fn is_configured(&self) -> bool;

    /// Requests per minute allowed by the provider's plan. Used to size the
    /// fetcher-side token bucket.
    fn quota_per_minute(&self) -> u32;

    /// Fetch up to `bar_count` historical bars, oldest first.
    async fn fetch_bars(
        &self,
        pair: &Pair,
        timeframe: Timeframe,
        bar_count: usize,
        timeout: Duration,
    ) -> Result<Vec<Bar>, ProviderError>;

    /// Fetch the current quote.
    async fn fetch_quote(&self, pair: &Pair, timeout: Duration) -> Result<Quote, ProviderError>;
}

// =============================================================================
// Shared HTTP helpers
// =============================================================================

/// Translate a reqwest transport error into the provider taxonomy.
pub(crate) fn classify_transport(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Network(err.to_string())
    }
}

/// Map a non-success HTTP status (plus headers) into the provider taxonomy.
/// `retry-after` is parsed as whole seconds when present.
pub(crate) fn classify_status(
    status: reqwest::StatusCode,
    headers: &reqwest::header::HeaderMap,
    body: &str,
) -> ProviderError {
    match status.as_u16() {
        429 => {
            let retry_after_secs = headers
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok());
            ProviderError::RateLimited { retry_after_secs }
        }
        403 => ProviderError::Forbidden,
        code => ProviderError::Http {
            status: code,
            body: body.chars().take(200).collect(),
        },
    }
}

/// Parse a JSON value that may be either a string or a number into `f64`.
pub(crate) fn parse_str_f64(val: &serde_json::Value, name: &str) -> Result<f64, ProviderError> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .map_err(|_| ProviderError::Malformed(format!("field {name} not parseable: {s}"))),
        serde_json::Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| ProviderError::Malformed(format!("field {name} not a valid f64"))),
        _ => Err(ProviderError::Malformed(format!(
            "field {name} has unexpected JSON type"
        ))),
    }
}

/// Build a reqwest client with the given timeout. Construction only fails on
/// TLS backend misconfiguration, which is unrecoverable at startup.
pub(crate) fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .expect("failed to build reqwest client")
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_honors_retry_after_exactly() {
        let err = ProviderError::RateLimited {
            retry_after_secs: Some(30),
        };
        assert_eq!(err.backoff_secs(), Some(30));
    }

    #[test]
    fn backoff_defaults() {
        let limited = ProviderError::RateLimited {
            retry_after_secs: None,
        };
        assert_eq!(limited.backoff_secs(), Some(DEFAULT_429_COOLDOWN_SECS));
        assert_eq!(
            ProviderError::Forbidden.backoff_secs(),
            Some(DEFAULT_403_COOLDOWN_SECS)
        );
        assert_eq!(ProviderError::Timeout.backoff_secs(), None);
    }

    #[test]
    fn quota_classification() {
        assert!(ProviderError::RateLimited {
            retry_after_secs: None
        }
        .is_quota());
        assert!(ProviderError::Forbidden.is_quota());
        assert!(!ProviderError::Timeout.is_quota());
        assert!(!ProviderError::Empty.is_quota());
    }

    #[test]
    fn parse_str_f64_both_shapes() {
        let s = serde_json::json!("1.0852");
        let n = serde_json::json!(1.0852);
        assert!((parse_str_f64(&s, "x").unwrap() - 1.0852).abs() < 1e-9);
        assert!((parse_str_f64(&n, "x").unwrap() - 1.0852).abs() < 1e-9);
        assert!(parse_str_f64(&serde_json::json!(null), "x").is_err());
    }
}
