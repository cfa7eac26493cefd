// =============================================================================
// Data-quality guard — per-pair feed scoring and circuit breaker
// =============================================================================
//
// For each configured timeframe the guard fetches bars (purpose
// `quality-check`) and scores spikes, gaps, timezone misalignment,
// staleness and sanity. Timeframe scores are averaged and a spread penalty
// (by pair category) is deducted. A critical report — or a critical spread
// or weekend gap on its own — activates a per-pair circuit breaker and
// returns `recommendation = block`.
//
// Reports are cached per pair; repeat reads within the TTL return the same
// shared report object without recomputation. Breakers expire on read.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::market_data::fetcher::{FetchOpts, MarketDataFetcher};
use crate::persistence::PersistenceAdapter;
use crate::types::{now_ms, AssetClass, Bar, Pair, Quote, Timeframe};

/// Report cache TTL.
const CACHE_TTL_MS: i64 = 5 * 60 * 1000;
/// Default and minimum breaker durations.
const BREAKER_DEFAULT_MS: i64 = 10 * 60 * 1000;
const BREAKER_MIN_MS: i64 = 2 * 60 * 1000;
/// Bars fetched per timeframe for scoring.
const QUALITY_BAR_COUNT: usize = 120;
/// Gap threshold as a multiple of the expected interval.
const GAP_FACTOR: f64 = 1.75;
/// Staleness threshold as a multiple of the expected interval.
const STALE_FACTOR: f64 = 3.0;
/// Confidence floor imposed when the spread is critical.
const SPREAD_CRITICAL_CONFIDENCE_FLOOR: f64 = 65.0;
/// Confidence floor imposed when the feed is degraded.
const DEGRADED_CONFIDENCE_FLOOR: f64 = 55.0;

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityStatus {
    Healthy,
    Degraded,
    Critical,
}

impl std::fmt::Display for QualityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recommendation {
    Proceed,
    Caution,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpreadClass {
    Normal,
    Elevated,
    Critical,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeekendGapClass {
    None,
    Minor,
    Elevated,
    Critical,
}

/// Per-timeframe scoring breakdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeframeQuality {
    pub timeframe: Timeframe,
    pub score: f64,
    pub spike_penalty: f64,
    pub gap_penalty: f64,
    pub misalignment_penalty: f64,
    pub staleness_penalty: f64,
    pub sanity_penalty: f64,
    pub stale: bool,
    pub bar_count: usize,
}

/// Full quality report for one pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityReport {
    pub pair: Pair,
    pub generated_at: i64,
    pub timeframes: Vec<TimeframeQuality>,
    pub overall_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spread_pips: Option<f64>,
    pub spread_class: SpreadClass,
    pub weekend_gap: WeekendGapClass,
    pub weekend_gap_pips: f64,
    pub status: QualityStatus,
    pub recommendation: Recommendation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_floor: Option<f64>,
    pub breaker_activated: bool,
}

/// A timed per-pair lockout. Live iff `now < expires_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerRecord {
    pub reason: String,
    pub activated_at: i64,
    pub expires_at: i64,
    pub context: BreakerContext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerContext {
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spread_pips: Option<f64>,
    pub weekend_gap_pips: f64,
}

// ---------------------------------------------------------------------------
// Spread categories
// ---------------------------------------------------------------------------

const MAJORS: &[&str] = &["EURUSD", "GBPUSD", "AUDUSD", "NZDUSD", "USDCAD", "USDCHF"];

/// (elevated, critical) spread thresholds in pips for a pair.
fn spread_thresholds(pair: &Pair) -> (f64, f64) {
    if pair.asset_class() != AssetClass::Forex {
        return (350.0, 700.0);
    }
    if MAJORS.contains(&pair.as_str()) {
        (1.8, 3.0)
    } else if pair.quote() == "JPY" {
        (2.5, 4.0)
    } else {
        (3.5, 6.0)
    }
}

fn classify_spread(pair: &Pair, spread_pips: f64) -> SpreadClass {
    let (elevated, critical) = spread_thresholds(pair);
    if spread_pips >= critical {
        SpreadClass::Critical
    } else if spread_pips >= elevated {
        SpreadClass::Elevated
    } else {
        SpreadClass::Normal
    }
}

/// Spike threshold: maximum plausible bar-over-bar move per timeframe.
fn spike_threshold(timeframe: Timeframe) -> f64 {
    match timeframe {
        Timeframe::M1 => 0.002,
        Timeframe::M5 => 0.003,
        Timeframe::M15 => 0.004,
        Timeframe::M30 => 0.006,
        Timeframe::H1 => 0.008,
        Timeframe::H4 => 0.015,
        Timeframe::D1 => 0.03,
    }
}

// ---------------------------------------------------------------------------
// Pure scoring
// ---------------------------------------------------------------------------

/// Score one timeframe's bar series. Pure: output depends only on inputs.
pub fn score_timeframe(bars: &[Bar], timeframe: Timeframe, now: i64) -> TimeframeQuality {
    let period = timeframe.period_ms() as f64;

    if bars.len() < 3 {
        return TimeframeQuality {
            timeframe,
            score: 0.0,
            spike_penalty: 0.0,
            gap_penalty: 0.0,
            misalignment_penalty: 0.0,
            staleness_penalty: 30.0,
            sanity_penalty: 50.0,
            stale: true,
            bar_count: bars.len(),
        };
    }

    // Spikes: bar-over-bar close moves beyond the timeframe threshold.
    let threshold = spike_threshold(timeframe);
    let mut spikes = 0usize;
    for w in bars.windows(2) {
        if w[0].close > 0.0 {
            let change = (w[1].close / w[0].close - 1.0).abs();
            if change > threshold {
                spikes += 1;
            }
        }
    }
    let spike_penalty = (spikes as f64 * 8.0).min(40.0);

    // Gaps and misalignment over inter-bar intervals.
    let mut gaps = 0usize;
    let mut misaligned = 0usize;
    let interval_count = bars.len() - 1;
    for w in bars.windows(2) {
        let dt = (w[1].timestamp_ms - w[0].timestamp_ms) as f64;
        if dt > period * GAP_FACTOR {
            gaps += 1;
        } else if dt < period * 0.8 || dt > period * 1.2 {
            misaligned += 1;
        }
    }
    let gap_rate = gaps as f64 / interval_count as f64;
    // The gap *rate* penalises more strongly than the raw count.
    let gap_penalty = (gaps as f64 * 3.0 + gap_rate * 60.0).min(35.0);
    let misalignment_penalty = (misaligned as f64 * 4.0).min(25.0);

    // Staleness: last bar older than STALE_FACTOR periods.
    let last_ts = bars.last().map(|b| b.timestamp_ms).unwrap_or(0);
    let stale = (now - last_ts) as f64 > period * STALE_FACTOR;
    let staleness_penalty = if stale { 30.0 } else { 0.0 };

    // Sanity: insane bars, or a price range implausible for one window.
    let insane = bars.iter().any(|b| !b.is_sane());
    let (min_low, max_high) = bars.iter().fold((f64::MAX, f64::MIN), |(lo, hi), b| {
        (lo.min(b.low), hi.max(b.high))
    });
    let range_implausible = min_low > 0.0 && max_high / min_low > 1.5;
    let sanity_penalty = if insane || range_implausible { 50.0 } else { 0.0 };

    let score = (100.0
        - spike_penalty
        - gap_penalty
        - misalignment_penalty
        - staleness_penalty
        - sanity_penalty)
        .max(0.0);

    TimeframeQuality {
        timeframe,
        score,
        spike_penalty,
        gap_penalty,
        misalignment_penalty,
        staleness_penalty,
        sanity_penalty,
        stale,
        bar_count: bars.len(),
    }
}

/// Find the largest weekend gap (interval > 40h) and classify it by pips.
pub fn classify_weekend_gap(bars: &[Bar], pair: &Pair) -> (WeekendGapClass, f64) {
    const WEEKEND_MS: i64 = 40 * 3_600_000;

    let mut largest_pips = 0.0f64;
    for w in bars.windows(2) {
        if w[1].timestamp_ms - w[0].timestamp_ms > WEEKEND_MS {
            let gap_pips = pair.price_to_pips(w[1].open - w[0].close);
            largest_pips = largest_pips.max(gap_pips);
        }
    }

    let class = if largest_pips == 0.0 {
        WeekendGapClass::None
    } else if largest_pips < 30.0 {
        WeekendGapClass::Minor
    } else if largest_pips < 80.0 {
        WeekendGapClass::Elevated
    } else {
        WeekendGapClass::Critical
    };
    (class, largest_pips)
}

// ---------------------------------------------------------------------------
// Guard
// ---------------------------------------------------------------------------

pub struct DataQualityGuard {
    fetcher: Arc<MarketDataFetcher>,
    persistence: Option<Arc<PersistenceAdapter>>,
    timeframes: Vec<Timeframe>,
    cache: RwLock<HashMap<Pair, Arc<QualityReport>>>,
    breakers: RwLock<HashMap<Pair, CircuitBreakerRecord>>,
    breaker_duration_ms: i64,
}

impl DataQualityGuard {
    pub fn new(
        fetcher: Arc<MarketDataFetcher>,
        persistence: Option<Arc<PersistenceAdapter>>,
    ) -> Self {
        Self {
            fetcher,
            persistence,
            timeframes: vec![Timeframe::M15, Timeframe::H1, Timeframe::H4],
            cache: RwLock::new(HashMap::new()),
            breakers: RwLock::new(HashMap::new()),
            breaker_duration_ms: BREAKER_DEFAULT_MS,
        }
    }

    /// Override the breaker duration (clamped to the minimum).
    pub fn with_breaker_duration_ms(mut self, duration_ms: i64) -> Self {
        self.breaker_duration_ms = duration_ms.max(BREAKER_MIN_MS);
        self
    }

    /// Assess the pair's feed, serving the cached report while fresh. The
    /// returned Arc is shared: repeat reads within the TTL observe the same
    /// report object.
    pub async fn assess_market_data(
        &self,
        pair: &Pair,
        quote: Option<&Quote>,
    ) -> Arc<QualityReport> {
        let now = now_ms();

        if let Some(cached) = self.cache.read().get(pair) {
            if now - cached.generated_at < CACHE_TTL_MS {
                debug!(pair = %pair, "quality report served from cache");
                return cached.clone();
            }
        }

        let report = Arc::new(self.build_report(pair, quote, now).await);
        self.cache.write().insert(pair.clone(), report.clone());

        if let Some(persistence) = &self.persistence {
            let payload = serde_json::to_value(report.as_ref())
                .unwrap_or(serde_json::Value::Null);
            let _ = persistence.record_data_quality_metric(
                pair.as_str(),
                report.overall_score,
                &report.status.to_string(),
                &payload,
                report.generated_at,
            );
        }

        report
    }

    async fn build_report(&self, pair: &Pair, quote: Option<&Quote>, now: i64) -> QualityReport {
        let opts = FetchOpts::with_purpose("quality-check");

        let mut tf_scores = Vec::with_capacity(self.timeframes.len());
        let mut weekend_gap = (WeekendGapClass::None, 0.0);

        for timeframe in &self.timeframes {
            match self
                .fetcher
                .fetch_bars(pair, *timeframe, QUALITY_BAR_COUNT, &opts)
                .await
            {
                Ok(bars) => {
                    // Use the hourly series for weekend-gap detection.
                    if *timeframe == Timeframe::H1 {
                        weekend_gap = classify_weekend_gap(&bars, pair);
                    }
                    tf_scores.push(score_timeframe(&bars, *timeframe, now));
                }
                Err(e) => {
                    warn!(pair = %pair, timeframe = %timeframe, error = %e, "quality-check fetch failed");
                    tf_scores.push(TimeframeQuality {
                        timeframe: *timeframe,
                        score: 0.0,
                        spike_penalty: 0.0,
                        gap_penalty: 0.0,
                        misalignment_penalty: 0.0,
                        staleness_penalty: 30.0,
                        sanity_penalty: 50.0,
                        stale: true,
                        bar_count: 0,
                    });
                }
            }
        }

        let mean_score = if tf_scores.is_empty() {
            0.0
        } else {
            tf_scores.iter().map(|t| t.score).sum::<f64>() / tf_scores.len() as f64
        };

        // Spread classification from the supplied quote.
        let (spread_pips, spread_class) = match quote {
            Some(q) => {
                let pips = q.spread_pips();
                (Some(pips), classify_spread(pair, pips))
            }
            None => (None, SpreadClass::Unknown),
        };
        let spread_penalty = match spread_class {
            SpreadClass::Critical => 25.0,
            SpreadClass::Elevated => 10.0,
            _ => 0.0,
        };

        let overall_score = (mean_score - spread_penalty).max(0.0);

        let (gap_class, gap_pips) = weekend_gap;
        let spread_critical = spread_class == SpreadClass::Critical;
        let gap_critical = gap_class == WeekendGapClass::Critical;

        let status = if overall_score < 50.0 || spread_critical || gap_critical {
            QualityStatus::Critical
        } else if overall_score < 75.0 {
            QualityStatus::Degraded
        } else {
            QualityStatus::Healthy
        };

        let recommendation = match status {
            QualityStatus::Healthy => Recommendation::Proceed,
            QualityStatus::Degraded => Recommendation::Caution,
            QualityStatus::Critical => Recommendation::Block,
        };

        let confidence_floor = if spread_critical {
            Some(SPREAD_CRITICAL_CONFIDENCE_FLOOR)
        } else if status == QualityStatus::Degraded {
            Some(DEGRADED_CONFIDENCE_FLOOR)
        } else {
            None
        };

        let breaker_activated = status == QualityStatus::Critical;
        if breaker_activated {
            let reason = if spread_critical {
                format!("spread:critical ({:.1} pips)", spread_pips.unwrap_or(0.0))
            } else if gap_critical {
                format!("weekend_gap:critical ({gap_pips:.1} pips)")
            } else {
                format!("data_quality:critical (score {overall_score:.1})")
            };
            self.activate_breaker(pair, &reason, overall_score, spread_pips, gap_pips, now);
        }

        QualityReport {
            pair: pair.clone(),
            generated_at: now,
            timeframes: tf_scores,
            overall_score,
            spread_pips,
            spread_class,
            weekend_gap: gap_class,
            weekend_gap_pips: gap_pips,
            status,
            recommendation,
            confidence_floor,
            breaker_activated,
        }
    }

    // -------------------------------------------------------------------------
    // Circuit breakers
    // -------------------------------------------------------------------------

    fn activate_breaker(
        &self,
        pair: &Pair,
        reason: &str,
        score: f64,
        spread_pips: Option<f64>,
        weekend_gap_pips: f64,
        now: i64,
    ) {
        let record = CircuitBreakerRecord {
            reason: reason.to_string(),
            activated_at: now,
            expires_at: now + self.breaker_duration_ms,
            context: BreakerContext {
                score,
                spread_pips,
                weekend_gap_pips,
            },
        };
        info!(
            pair = %pair,
            reason,
            expires_in_secs = self.breaker_duration_ms / 1000,
            "pair circuit breaker activated"
        );
        self.breakers.write().insert(pair.clone(), record);
    }

    /// The live breaker for a pair, if any. Expired records are purged on
    /// read.
    pub fn active_breaker(&self, pair: &Pair) -> Option<CircuitBreakerRecord> {
        let now = now_ms();
        let mut breakers = self.breakers.write();
        match breakers.get(pair) {
            Some(record) if now < record.expires_at => Some(record.clone()),
            Some(_) => {
                breakers.remove(pair);
                None
            }
            None => None,
        }
    }

    /// All live breakers (expired entries purged).
    pub fn active_breakers(&self) -> Vec<(Pair, CircuitBreakerRecord)> {
        let now = now_ms();
        let mut breakers = self.breakers.write();
        breakers.retain(|_, r| now < r.expires_at);
        breakers
            .iter()
            .map(|(p, r)| (p.clone(), r.clone()))
            .collect()
    }

    /// Timeframes scored critically in any fresh cached report. Feeds the
    /// availability classifier's blocked-timeframe ratio.
    pub fn blocked_timeframes(&self) -> Vec<String> {
        let now = now_ms();
        let cache = self.cache.read();
        let mut blocked: Vec<String> = Vec::new();
        for report in cache.values() {
            if now - report.generated_at >= CACHE_TTL_MS {
                continue;
            }
            for tf in &report.timeframes {
                let name = tf.timeframe.to_string();
                if tf.score < 40.0 && !blocked.contains(&name) {
                    blocked.push(name);
                }
            }
        }
        blocked.sort();
        blocked
    }

    /// The configured quality-check timeframes.
    pub fn timeframes(&self) -> &[Timeframe] {
        &self.timeframes
    }
}

impl std::fmt::Debug for DataQualityGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataQualityGuard")
            .field("cached_reports", &self.cache.read().len())
            .field("active_breakers", &self.breakers.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::metrics::ProviderMetricsRegistry;
    use crate::types::BarSource;

    fn eurusd() -> Pair {
        Pair::parse("EURUSD").unwrap()
    }

    fn clean_bars(count: usize, timeframe: Timeframe, now: i64) -> Vec<Bar> {
        let period = timeframe.period_ms();
        let start = now - period * count as i64;
        (0..count)
            .map(|i| Bar {
                timestamp_ms: start + period * i as i64,
                open: 1.0850,
                high: 1.0856,
                low: 1.0845,
                close: 1.0852,
                volume: Some(900.0),
                source: BarSource::Provider("test".into()),
            })
            .collect()
    }

    fn synthetic_only_guard() -> DataQualityGuard {
        let metrics = Arc::new(ProviderMetricsRegistry::new());
        let fetcher = Arc::new(MarketDataFetcher::new(vec![], metrics, true, false));
        DataQualityGuard::new(fetcher, None)
    }

    // -----------------------------------------------------------------------
    // Pure scoring
    // -----------------------------------------------------------------------

    #[test]
    fn clean_series_scores_high() {
        let now = 1_700_000_000_000;
        let bars = clean_bars(100, Timeframe::M15, now);
        let q = score_timeframe(&bars, Timeframe::M15, now);
        assert!(q.score >= 95.0, "expected high score, got {}", q.score);
        assert!(!q.stale);
    }

    #[test]
    fn spikes_are_penalised() {
        let now = 1_700_000_000_000;
        let mut bars = clean_bars(100, Timeframe::M15, now);
        // Two 1% jumps — far beyond the 0.4% M15 threshold.
        bars[50].close = bars[49].close * 1.01;
        bars[70].close = bars[69].close * 0.99;
        let q = score_timeframe(&bars, Timeframe::M15, now);
        assert!(q.spike_penalty > 0.0);
        assert!(q.score < 100.0);
    }

    #[test]
    fn gaps_are_penalised() {
        let now = 1_700_000_000_000;
        let mut bars = clean_bars(100, Timeframe::M15, now);
        for b in bars.iter_mut().skip(60) {
            b.timestamp_ms += 2 * Timeframe::M15.period_ms();
        }
        let q = score_timeframe(&bars, Timeframe::M15, now);
        assert!(q.gap_penalty > 0.0);
    }

    #[test]
    fn stale_series_flagged() {
        let now = 1_700_000_000_000;
        let old = now - 10 * Timeframe::M15.period_ms();
        let bars = clean_bars(50, Timeframe::M15, old);
        let q = score_timeframe(&bars, Timeframe::M15, now);
        assert!(q.stale);
        assert!((q.staleness_penalty - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn weekend_gap_classification() {
        let pair = eurusd();
        let now = 1_700_000_000_000;
        let mut bars = clean_bars(50, Timeframe::H1, now);
        // 48h gap with a 100-pip jump.
        for b in bars.iter_mut().skip(25) {
            b.timestamp_ms += 48 * 3_600_000;
        }
        bars[25].open = bars[24].close + 0.0100;
        let (class, pips) = classify_weekend_gap(&bars, &pair);
        assert_eq!(class, WeekendGapClass::Critical);
        assert!((pips - 100.0).abs() < 1.0);
    }

    #[test]
    fn spread_categories() {
        assert_eq!(classify_spread(&eurusd(), 0.8), SpreadClass::Normal);
        assert_eq!(classify_spread(&eurusd(), 2.0), SpreadClass::Elevated);
        assert_eq!(classify_spread(&eurusd(), 4.5), SpreadClass::Critical);
        // Yen pairs tolerate slightly wider spreads.
        let gbpjpy = Pair::parse("GBPJPY").unwrap();
        assert_eq!(classify_spread(&gbpjpy, 3.0), SpreadClass::Elevated);
    }

    // -----------------------------------------------------------------------
    // Guard behaviour (synthetic fetcher backend)
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn cached_report_is_same_object() {
        let guard = synthetic_only_guard();
        let pair = eurusd();
        let first = guard.assess_market_data(&pair, None).await;
        let second = guard.assess_market_data(&pair, None).await;
        // Invariant 2: identical object identity within the TTL.
        assert!(Arc::ptr_eq(&first, &second));
    }

    // Scenario B: 4.5-pip spread on EURUSD (majors) is critical, trips the
    // breaker and blocks.
    #[tokio::test]
    async fn spread_veto_activates_breaker() {
        let guard = synthetic_only_guard();
        let pair = eurusd();
        let quote = Quote {
            pair: pair.clone(),
            bid: 1.08500,
            ask: 1.08545,
            timestamp_ms: now_ms(),
            provider: "test".into(),
        };
        assert!((quote.spread_pips() - 4.5).abs() < 0.01);

        let report = guard.assess_market_data(&pair, Some(&quote)).await;
        assert_eq!(report.spread_class, SpreadClass::Critical);
        assert_eq!(report.status, QualityStatus::Critical);
        assert_eq!(report.recommendation, Recommendation::Block);
        assert!(report.breaker_activated);
        assert_eq!(
            report.confidence_floor,
            Some(SPREAD_CRITICAL_CONFIDENCE_FLOOR)
        );

        let breaker = guard.active_breaker(&pair).expect("breaker should be live");
        assert!(breaker.reason.contains("spread:critical"));
        assert!(breaker.expires_at > breaker.activated_at);
    }

    #[tokio::test]
    async fn healthy_feed_proceeds() {
        let guard = synthetic_only_guard();
        let pair = eurusd();
        let quote = Quote {
            pair: pair.clone(),
            bid: 1.08500,
            ask: 1.08510,
            timestamp_ms: now_ms(),
            provider: "test".into(),
        };
        let report = guard.assess_market_data(&pair, Some(&quote)).await;
        assert_eq!(report.status, QualityStatus::Healthy);
        assert_eq!(report.recommendation, Recommendation::Proceed);
        assert!(!report.breaker_activated);
        assert!(guard.active_breaker(&pair).is_none());
    }

    #[tokio::test]
    async fn breaker_expires_on_read() {
        let guard = synthetic_only_guard();
        let pair = eurusd();
        // Activate with an already-expired window by writing directly.
        guard.activate_breaker(&pair, "test", 10.0, None, 0.0, now_ms() - BREAKER_DEFAULT_MS * 2);
        assert!(guard.active_breaker(&pair).is_none());
        assert!(guard.breakers.read().is_empty());
    }
}
