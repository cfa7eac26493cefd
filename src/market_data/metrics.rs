// =============================================================================
// Provider metrics registry — rolling quality accounting per provider
// =============================================================================
//
// Tracks success/failure/rate-limit counts, a running mean latency, a
// token-bucket quota, a per-provider circuit breaker and a strict backoff
// deadline. Recomputed on every request outcome; the fetcher consults it for
// provider ordering and the availability classifier for fleet health.
//
// Breaker life-cycle: Closed -> Open (repeated failures or quota bursts)
// -> HalfOpen (after cooldown, one probe allowed) -> Closed on success.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::providers::ProviderError;

/// Consecutive failures that trip the breaker.
const BREAKER_FAILURE_THRESHOLD: u32 = 5;
/// Rate-limit hits inside the rolling window that trip the breaker.
const BREAKER_QUOTA_THRESHOLD: u32 = 3;
/// How long an open breaker blocks before allowing a half-open probe.
const BREAKER_COOLDOWN_SECS: i64 = 60;
/// Latency at (or above) which the latency component of quality reaches zero.
const LATENCY_NORM_MS: f64 = 2000.0;

// ---------------------------------------------------------------------------
// Public snapshot types
// ---------------------------------------------------------------------------

/// Circuit breaker state for a single provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "halfOpen"),
        }
    }
}

/// Serialisable rolling metric for one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderMetric {
    pub provider: String,
    pub success: u64,
    pub failed: u64,
    pub rate_limited: u64,
    pub avg_latency_ms: f64,
    pub success_rate_pct: f64,
    pub quality_score: f64,
    pub normalized_quality: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<i64>,
    pub circuit_breaker_state: BreakerState,
    pub remaining_quota: u32,
    pub backoff_seconds: u64,
}

// ---------------------------------------------------------------------------
// Internal per-provider state
// ---------------------------------------------------------------------------

/// Token bucket refilled continuously at the provider's per-minute rate.
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill_ms: i64,
}

impl TokenBucket {
    fn new(per_minute: u32) -> Self {
        let capacity = per_minute.max(1) as f64;
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: capacity / 60.0,
            last_refill_ms: 0,
        }
    }

    fn refill(&mut self, now_ms: i64) {
        if self.last_refill_ms == 0 {
            self.last_refill_ms = now_ms;
            return;
        }
        let elapsed_secs = (now_ms - self.last_refill_ms).max(0) as f64 / 1000.0;
        self.tokens = (self.tokens + elapsed_secs * self.refill_per_sec).min(self.capacity);
        self.last_refill_ms = now_ms;
    }

    fn try_consume(&mut self, now_ms: i64) -> bool {
        self.refill(now_ms);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn remaining(&mut self, now_ms: i64) -> u32 {
        self.refill(now_ms);
        self.tokens.floor().max(0.0) as u32
    }
}

#[derive(Debug)]
struct ProviderStats {
    success: u64,
    failed: u64,
    rate_limited: u64,
    mean_latency_ms: f64,
    latency_samples: u64,
    consecutive_failures: u32,
    recent_quota_hits: u32,
    breaker: BreakerState,
    breaker_opened_at_ms: i64,
    backoff_until_ms: i64,
    last_success_at_ms: Option<i64>,
    last_failure_at_ms: Option<i64>,
    bucket: TokenBucket,
}

impl ProviderStats {
    fn new(quota_per_minute: u32) -> Self {
        Self {
            success: 0,
            failed: 0,
            rate_limited: 0,
            mean_latency_ms: 0.0,
            latency_samples: 0,
            consecutive_failures: 0,
            recent_quota_hits: 0,
            breaker: BreakerState::Closed,
            breaker_opened_at_ms: 0,
            backoff_until_ms: 0,
            last_success_at_ms: None,
            last_failure_at_ms: None,
            bucket: TokenBucket::new(quota_per_minute),
        }
    }

    fn success_rate_pct(&self) -> f64 {
        let total = self.success + self.failed;
        if total == 0 {
            100.0
        } else {
            self.success as f64 / total as f64 * 100.0
        }
    }

    /// Quality in [0,100]: success rate (70%) plus inverse normalised
    /// latency (30%).
    fn quality_score(&self) -> f64 {
        let latency_component = if self.latency_samples == 0 {
            1.0
        } else {
            1.0 - (self.mean_latency_ms / LATENCY_NORM_MS).min(1.0)
        };
        (self.success_rate_pct() * 0.7 + latency_component * 30.0).clamp(0.0, 100.0)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Thread-safe registry keyed by provider id.
pub struct ProviderMetricsRegistry {
    stats: RwLock<HashMap<String, ProviderStats>>,
}

impl ProviderMetricsRegistry {
    pub fn new() -> Self {
        Self {
            stats: RwLock::new(HashMap::new()),
        }
    }

    /// Ensure a provider entry exists with its quota bucket sized.
    pub fn register(&self, provider: &str, quota_per_minute: u32) {
        self.stats
            .write()
            .entry(provider.to_string())
            .or_insert_with(|| ProviderStats::new(quota_per_minute));
    }

    /// Record a successful call with its observed latency.
    pub fn record_success(&self, provider: &str, latency_ms: f64, now_ms: i64) {
        let mut map = self.stats.write();
        let s = map
            .entry(provider.to_string())
            .or_insert_with(|| ProviderStats::new(60));

        s.success += 1;
        s.consecutive_failures = 0;
        s.recent_quota_hits = 0;
        s.last_success_at_ms = Some(now_ms);

        // Running mean latency.
        s.latency_samples += 1;
        s.mean_latency_ms += (latency_ms - s.mean_latency_ms) / s.latency_samples as f64;

        if s.breaker != BreakerState::Closed {
            debug!(provider, "circuit breaker closed after successful probe");
            s.breaker = BreakerState::Closed;
        }
    }

    /// Record a failed call, registering cooldowns and possibly tripping the
    /// breaker.
    pub fn record_failure(&self, provider: &str, err: &ProviderError, now_ms: i64) {
        let mut map = self.stats.write();
        let s = map
            .entry(provider.to_string())
            .or_insert_with(|| ProviderStats::new(60));

        s.failed += 1;
        s.consecutive_failures += 1;
        s.last_failure_at_ms = Some(now_ms);

        if err.is_quota() {
            s.rate_limited += 1;
            s.recent_quota_hits += 1;
            if let Some(secs) = err.backoff_secs() {
                s.backoff_until_ms = s.backoff_until_ms.max(now_ms + secs as i64 * 1000);
                warn!(provider, backoff_secs = secs, "provider placed in backoff");
            }
        }

        let tripped = s.consecutive_failures >= BREAKER_FAILURE_THRESHOLD
            || s.recent_quota_hits >= BREAKER_QUOTA_THRESHOLD
            || s.breaker == BreakerState::HalfOpen;
        if tripped && s.breaker != BreakerState::Open {
            s.breaker = BreakerState::Open;
            s.breaker_opened_at_ms = now_ms;
            warn!(
                provider,
                consecutive_failures = s.consecutive_failures,
                quota_hits = s.recent_quota_hits,
                "provider circuit breaker opened"
            );
        }
    }

    /// True when the provider's backoff deadline has not yet passed.
    pub fn in_backoff(&self, provider: &str, now_ms: i64) -> bool {
        self.stats
            .read()
            .get(provider)
            .map(|s| now_ms < s.backoff_until_ms)
            .unwrap_or(false)
    }

    /// True when the breaker blocks this provider. An open breaker past its
    /// cooldown transitions to half-open and allows a single probe.
    pub fn breaker_blocks(&self, provider: &str, now_ms: i64) -> bool {
        let mut map = self.stats.write();
        let Some(s) = map.get_mut(provider) else {
            return false;
        };
        match s.breaker {
            BreakerState::Closed | BreakerState::HalfOpen => false,
            BreakerState::Open => {
                if now_ms >= s.breaker_opened_at_ms + BREAKER_COOLDOWN_SECS * 1000 {
                    s.breaker = BreakerState::HalfOpen;
                    debug!(provider, "circuit breaker half-open — allowing probe");
                    false
                } else {
                    true
                }
            }
        }
    }

    /// Consume one quota token; false when the bucket is empty.
    pub fn try_consume_quota(&self, provider: &str, now_ms: i64) -> bool {
        let mut map = self.stats.write();
        match map.get_mut(provider) {
            Some(s) => s.bucket.try_consume(now_ms),
            None => true,
        }
    }

    /// Composite quality score for ordering.
    pub fn quality(&self, provider: &str) -> f64 {
        self.stats
            .read()
            .get(provider)
            .map(ProviderStats::quality_score)
            .unwrap_or(100.0)
    }

    /// Mean latency for ordering tie-breaks.
    pub fn mean_latency_ms(&self, provider: &str) -> f64 {
        self.stats
            .read()
            .get(provider)
            .map(|s| s.mean_latency_ms)
            .unwrap_or(0.0)
    }

    /// Serialisable snapshot for one provider.
    pub fn snapshot(&self, provider: &str, now_ms: i64) -> Option<ProviderMetric> {
        let mut map = self.stats.write();
        let s = map.get_mut(provider)?;
        Some(Self::metric_from(provider, s, now_ms))
    }

    /// Snapshot of all registered providers, sorted by id for stable output.
    pub fn snapshot_all(&self, now_ms: i64) -> Vec<ProviderMetric> {
        let mut map = self.stats.write();
        let mut out: Vec<ProviderMetric> = map
            .iter_mut()
            .map(|(id, s)| Self::metric_from(id, s, now_ms))
            .collect();
        out.sort_by(|a, b| a.provider.cmp(&b.provider));
        out
    }

    fn metric_from(provider: &str, s: &mut ProviderStats, now_ms: i64) -> ProviderMetric {
        let quality = s.quality_score();
        ProviderMetric {
            provider: provider.to_string(),
            success: s.success,
            failed: s.failed,
            rate_limited: s.rate_limited,
            avg_latency_ms: s.mean_latency_ms,
            success_rate_pct: s.success_rate_pct(),
            quality_score: quality,
            normalized_quality: quality / 100.0,
            last_success_at: s.last_success_at_ms,
            last_failure_at: s.last_failure_at_ms,
            circuit_breaker_state: s.breaker,
            remaining_quota: s.bucket.remaining(now_ms),
            backoff_seconds: ((s.backoff_until_ms - now_ms).max(0) / 1000) as u64,
        }
    }
}

impl Default for ProviderMetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProviderMetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderMetricsRegistry")
            .field("providers", &self.stats.read().len())
            .finish()
    }
}
