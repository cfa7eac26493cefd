// =============================================================================
// Provider availability classifier — fleet health with rolling history & SLO
// =============================================================================
//
// Every tick the provider fleet is classified as operational / degraded /
// critical from the metrics registry. Classification itself is a pure
// function of its input sample, so identical inputs always produce the same
// state. Samples land in a bounded ring; uptime, quality averages and SLO
// badges are derived from the ring. State transitions are published on the
// alert bus and samples are persisted best-effort.
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::alerts::{Alert, AlertBus, Severity};
use crate::market_data::metrics::{BreakerState, ProviderMetricsRegistry};
use crate::persistence::PersistenceAdapter;
use crate::types::now_ms;

/// Bounded history ring size.
const HISTORY_LIMIT: usize = 1000;
/// SLO target for the uptime ratio.
pub const SLO_UPTIME_TARGET: f64 = 99.0;
/// Margin below target that still reports `warn` rather than `breach`.
pub const SLO_WARN_MARGIN: f64 = 0.5;

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// Fleet-level availability state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AvailabilityState {
    Operational,
    Degraded,
    Critical,
    Unknown,
}

impl std::fmt::Display for AvailabilityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Operational => write!(f, "operational"),
            Self::Degraded => write!(f, "degraded"),
            Self::Critical => write!(f, "critical"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A single availability observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilitySample {
    pub captured_at: i64,
    pub state: AvailabilityState,
    pub severity: Severity,
    pub reason: String,
    pub aggregate_quality: f64,
    pub normalized_quality: f64,
    pub unavailable_providers: Vec<String>,
    pub breaker_providers: Vec<String>,
    pub blocked_timeframes: Vec<String>,
}

/// Input to the pure classification function.
#[derive(Debug, Clone)]
pub struct ClassifierInput {
    /// (provider id, configured, normalized quality, in backoff, breaker open)
    pub providers: Vec<ProviderObservation>,
    pub blocked_timeframes: Vec<String>,
    pub total_timeframes: usize,
}

#[derive(Debug, Clone)]
pub struct ProviderObservation {
    pub id: String,
    pub configured: bool,
    pub quality: f64,
    pub in_backoff: bool,
    pub breaker_open: bool,
}

/// Derived metrics over the history window.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilitySummary {
    pub state: AvailabilityState,
    pub uptime_ratio_pct: f64,
    pub average_aggregate_quality: f64,
    pub degraded_last_hour: usize,
    pub critical_last_hour: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_degraded_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_critical_at: Option<i64>,
    pub slo_badge: SloBadge,
    pub history_len: usize,
}

/// SLO compliance badge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SloBadge {
    Ok,
    Warn,
    Breach,
}

// ---------------------------------------------------------------------------
// Pure classification
// ---------------------------------------------------------------------------

/// Classify one observation of the fleet. Deterministic: the output depends
/// only on the input.
pub fn classify(input: &ClassifierInput, captured_at: i64) -> AvailabilitySample {
    let total = input.providers.len().max(1);

    let unavailable: Vec<String> = input
        .providers
        .iter()
        .filter(|p| !p.configured || p.in_backoff || p.breaker_open)
        .map(|p| p.id.clone())
        .collect();
    let breakers: Vec<String> = input
        .providers
        .iter()
        .filter(|p| p.breaker_open)
        .map(|p| p.id.clone())
        .collect();

    let configured: Vec<&ProviderObservation> =
        input.providers.iter().filter(|p| p.configured).collect();
    let aggregate_quality = if configured.is_empty() {
        0.0
    } else {
        configured.iter().map(|p| p.quality).sum::<f64>() / configured.len() as f64
    };

    let blocked_provider_ratio = unavailable.len() as f64 / total as f64;
    let blocked_tf_ratio = if input.total_timeframes == 0 {
        0.0
    } else {
        input.blocked_timeframes.len() as f64 / input.total_timeframes as f64
    };

    let (state, severity, reason) = if blocked_provider_ratio >= 0.5
        || blocked_tf_ratio >= 0.5
        || aggregate_quality < 40.0
    {
        (
            AvailabilityState::Critical,
            Severity::Critical,
            format!(
                "blocked providers {:.0}%, blocked timeframes {:.0}%, aggregate quality {:.1}",
                blocked_provider_ratio * 100.0,
                blocked_tf_ratio * 100.0,
                aggregate_quality
            ),
        )
    } else if blocked_provider_ratio >= 0.25
        || (40.0..70.0).contains(&aggregate_quality)
        || !breakers.is_empty()
        || !input.blocked_timeframes.is_empty()
    {
        (
            AvailabilityState::Degraded,
            Severity::Warning,
            format!(
                "blocked providers {:.0}%, breakers [{}], blocked timeframes [{}], aggregate quality {:.1}",
                blocked_provider_ratio * 100.0,
                breakers.join(","),
                input.blocked_timeframes.join(","),
                aggregate_quality
            ),
        )
    } else {
        (
            AvailabilityState::Operational,
            Severity::Info,
            format!("aggregate quality {aggregate_quality:.1}"),
        )
    };

    AvailabilitySample {
        captured_at,
        state,
        severity,
        reason,
        aggregate_quality,
        normalized_quality: aggregate_quality / 100.0,
        unavailable_providers: unavailable,
        breaker_providers: breakers,
        blocked_timeframes: input.blocked_timeframes.clone(),
    }
}

// ---------------------------------------------------------------------------
// Classifier service
// ---------------------------------------------------------------------------

/// Owns the history ring and drives periodic classification.
pub struct AvailabilityClassifier {
    metrics: Arc<ProviderMetricsRegistry>,
    /// (provider id, configured) as registered by the fetcher.
    provider_states: Vec<(String, bool)>,
    bus: Arc<AlertBus>,
    persistence: Option<Arc<PersistenceAdapter>>,
    history: RwLock<VecDeque<AvailabilitySample>>,
    last_state: RwLock<AvailabilityState>,
}

impl AvailabilityClassifier {
    pub fn new(
        metrics: Arc<ProviderMetricsRegistry>,
        provider_states: Vec<(String, bool)>,
        bus: Arc<AlertBus>,
        persistence: Option<Arc<PersistenceAdapter>>,
    ) -> Self {
        Self {
            metrics,
            provider_states,
            bus,
            persistence,
            history: RwLock::new(VecDeque::with_capacity(HISTORY_LIMIT)),
            last_state: RwLock::new(AvailabilityState::Unknown),
        }
    }

    /// Current state — `Unknown` before the first tick.
    pub fn current_state(&self) -> AvailabilityState {
        *self.last_state.read()
    }

    /// Run one classification tick. `blocked_timeframes` comes from the
    /// data-quality guard's view of the configured timeframe set.
    pub fn tick(&self, blocked_timeframes: Vec<String>, total_timeframes: usize) -> AvailabilitySample {
        let now = now_ms();

        let providers = self
            .provider_states
            .iter()
            .map(|(id, configured)| {
                let metric = self.metrics.snapshot(id, now);
                let (quality, breaker_open) = metric
                    .as_ref()
                    .map(|m| {
                        (
                            m.quality_score,
                            m.circuit_breaker_state == BreakerState::Open,
                        )
                    })
                    .unwrap_or((100.0, false));
                ProviderObservation {
                    id: id.clone(),
                    configured: *configured,
                    quality,
                    in_backoff: self.metrics.in_backoff(id, now),
                    breaker_open,
                }
            })
            .collect();

        let sample = classify(
            &ClassifierInput {
                providers,
                blocked_timeframes,
                total_timeframes,
            },
            now,
        );

        // Publish transitions.
        let previous = {
            let mut last = self.last_state.write();
            std::mem::replace(&mut *last, sample.state)
        };
        if previous != sample.state {
            info!(
                from = %previous,
                to = %sample.state,
                reason = %sample.reason,
                "provider availability transition"
            );
            self.bus.publish(
                Alert::new(
                    "provider.availability",
                    sample.severity,
                    format!("provider availability {} -> {}", previous, sample.state),
                )
                .with_context(serde_json::json!({
                    "state": sample.state,
                    "reason": sample.reason,
                    "aggregateQuality": sample.aggregate_quality,
                })),
            );
        } else {
            debug!(state = %sample.state, "availability tick");
        }

        // Record history.
        {
            let mut history = self.history.write();
            history.push_back(sample.clone());
            while history.len() > HISTORY_LIMIT {
                history.pop_front();
            }
        }

        // Best-effort persistence.
        if let Some(persistence) = &self.persistence {
            let _ = persistence.record_provider_availability_snapshot(&sample);
        }

        sample
    }

    /// Most recent `limit` samples, newest last.
    pub fn history(&self, limit: usize) -> Vec<AvailabilitySample> {
        let history = self.history.read();
        let start = history.len().saturating_sub(limit);
        history.iter().skip(start).cloned().collect()
    }

    /// Derived metrics over the full ring.
    pub fn summary(&self) -> AvailabilitySummary {
        let history = self.history.read();
        let now = now_ms();
        let hour_ago = now - 3_600_000;

        let total = history.len();
        let operational = history
            .iter()
            .filter(|s| s.state == AvailabilityState::Operational)
            .count();
        let uptime_ratio_pct = if total == 0 {
            100.0
        } else {
            operational as f64 / total as f64 * 100.0
        };

        let average_aggregate_quality = if total == 0 {
            0.0
        } else {
            history.iter().map(|s| s.aggregate_quality).sum::<f64>() / total as f64
        };

        let degraded_last_hour = history
            .iter()
            .filter(|s| s.state == AvailabilityState::Degraded && s.captured_at >= hour_ago)
            .count();
        let critical_last_hour = history
            .iter()
            .filter(|s| s.state == AvailabilityState::Critical && s.captured_at >= hour_ago)
            .count();

        let last_degraded_at = history
            .iter()
            .rev()
            .find(|s| s.state == AvailabilityState::Degraded)
            .map(|s| s.captured_at);
        let last_critical_at = history
            .iter()
            .rev()
            .find(|s| s.state == AvailabilityState::Critical)
            .map(|s| s.captured_at);

        let slo_badge = if uptime_ratio_pct >= SLO_UPTIME_TARGET {
            SloBadge::Ok
        } else if uptime_ratio_pct >= SLO_UPTIME_TARGET - SLO_WARN_MARGIN {
            SloBadge::Warn
        } else {
            SloBadge::Breach
        };

        AvailabilitySummary {
            state: self.current_state(),
            uptime_ratio_pct,
            average_aggregate_quality,
            degraded_last_hour,
            critical_last_hour,
            last_degraded_at,
            last_critical_at,
            slo_badge,
            history_len: total,
        }
    }
}

impl std::fmt::Debug for AvailabilityClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AvailabilityClassifier")
            .field("state", &self.current_state())
            .field("history_len", &self.history.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn obs(id: &str, quality: f64, in_backoff: bool, breaker_open: bool) -> ProviderObservation {
        ProviderObservation {
            id: id.to_string(),
            configured: true,
            quality,
            in_backoff,
            breaker_open,
        }
    }

    #[test]
    fn classification_is_deterministic() {
        let input = ClassifierInput {
            providers: vec![obs("a", 95.0, false, false), obs("b", 85.0, false, false)],
            blocked_timeframes: vec![],
            total_timeframes: 6,
        };
        let s1 = classify(&input, 1_000);
        let s2 = classify(&input, 1_000);
        assert_eq!(s1.state, s2.state);
        assert_eq!(s1.reason, s2.reason);
        assert!((s1.aggregate_quality - s2.aggregate_quality).abs() < f64::EPSILON);
    }

    #[test]
    fn operational_when_healthy() {
        let input = ClassifierInput {
            providers: vec![obs("a", 95.0, false, false), obs("b", 88.0, false, false)],
            blocked_timeframes: vec![],
            total_timeframes: 6,
        };
        let s = classify(&input, 0);
        assert_eq!(s.state, AvailabilityState::Operational);
        assert!(s.unavailable_providers.is_empty());
    }

    // Scenario F: qualities [0.9, 0.88, 0.3] normalized, two of six
    // timeframes blocked -> degraded with blockedTimeframeRatio ~ 0.33.
    #[test]
    fn scenario_f_degraded_classification() {
        let input = ClassifierInput {
            providers: vec![
                obs("a", 90.0, false, false),
                obs("b", 88.0, false, false),
                obs("c", 30.0, false, false),
            ],
            blocked_timeframes: vec!["M15".into(), "H1".into()],
            total_timeframes: 6,
        };
        let s = classify(&input, 0);
        assert_eq!(s.state, AvailabilityState::Degraded);
        assert_eq!(s.blocked_timeframes.len(), 2);
        // Aggregate = (90 + 88 + 30) / 3 ~ 69.3 < 70.
        assert!(s.aggregate_quality > 69.0 && s.aggregate_quality < 70.0);
    }

    #[test]
    fn critical_when_half_blocked() {
        let input = ClassifierInput {
            providers: vec![
                obs("a", 90.0, true, false),
                obs("b", 90.0, false, true),
                obs("c", 90.0, false, false),
                obs("d", 90.0, false, false),
            ],
            blocked_timeframes: vec![],
            total_timeframes: 6,
        };
        let s = classify(&input, 0);
        assert_eq!(s.state, AvailabilityState::Critical);
        assert_eq!(s.unavailable_providers.len(), 2);
        assert_eq!(s.breaker_providers, vec!["b".to_string()]);
    }

    #[test]
    fn critical_on_low_quality() {
        let input = ClassifierInput {
            providers: vec![obs("a", 35.0, false, false)],
            blocked_timeframes: vec![],
            total_timeframes: 6,
        };
        assert_eq!(classify(&input, 0).state, AvailabilityState::Critical);
    }

    #[test]
    fn degraded_on_any_open_breaker() {
        let input = ClassifierInput {
            providers: vec![
                obs("a", 95.0, false, false),
                obs("b", 92.0, false, false),
                obs("c", 91.0, false, false),
                obs("d", 90.0, false, true),
            ],
            blocked_timeframes: vec![],
            total_timeframes: 6,
        };
        assert_eq!(classify(&input, 0).state, AvailabilityState::Degraded);
    }

    #[tokio::test]
    async fn tick_records_history_and_transitions() {
        let metrics = Arc::new(ProviderMetricsRegistry::new());
        metrics.register("a", 60);
        let bus = AlertBus::new();
        let mut rx = bus.subscribe("test", "provider.");

        let classifier = AvailabilityClassifier::new(
            metrics,
            vec![("a".to_string(), true)],
            bus.clone(),
            None,
        );

        assert_eq!(classifier.current_state(), AvailabilityState::Unknown);
        let sample = classifier.tick(vec![], 6);
        assert_eq!(sample.state, AvailabilityState::Operational);
        assert_eq!(classifier.history(10).len(), 1);

        // The unknown -> operational transition was published.
        let alert = rx.recv().await.unwrap();
        assert_eq!(alert.topic, "provider.availability");
    }

    #[test]
    fn slo_badges() {
        let metrics = Arc::new(ProviderMetricsRegistry::new());
        let bus = AlertBus::new();
        let classifier =
            AvailabilityClassifier::new(metrics, vec![], bus, None);

        // Seed history manually: 989 operational + 11 degraded = 98.9%.
        {
            let mut history = classifier.history.write();
            for i in 0..1000 {
                let state = if i < 11 {
                    AvailabilityState::Degraded
                } else {
                    AvailabilityState::Operational
                };
                history.push_back(AvailabilitySample {
                    captured_at: i,
                    state,
                    severity: Severity::Info,
                    reason: String::new(),
                    aggregate_quality: 90.0,
                    normalized_quality: 0.9,
                    unavailable_providers: vec![],
                    breaker_providers: vec![],
                    blocked_timeframes: vec![],
                });
            }
        }
        let summary = classifier.summary();
        assert!((summary.uptime_ratio_pct - 98.9).abs() < 1e-9);
        assert_eq!(summary.slo_badge, SloBadge::Warn);
    }
}
