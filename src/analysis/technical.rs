// =============================================================================
// Technical analyzer — multi-timeframe indicators, patterns and direction
// votes
// =============================================================================
//
// For each configured timeframe the analyzer fetches bars and computes the
// indicator set (EMA stack, RSI, ADX, ATR, Bollinger, ROC), candlestick
// patterns, support/resistance, regime, volatility, volume pressure and
// RSI divergences. Each timeframe casts a direction vote; the aggregate
// score in [-150, 150] combines votes through the configured timeframe
// weight vector.
//
// Results are cached per pair with a short TTL so repeated signal
// generations within one cycle reuse the same analysis.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::analysis::{MarketRegime, VolatilityRegime};
use crate::indicators::{adx, atr, bollinger, ema, roc, rsi};
use crate::market_data::fetcher::{FetchOpts, MarketDataFetcher};
use crate::types::{now_ms, Bar, BarSource, Direction, Pair, Timeframe};

/// Cache TTL for technical analyses.
const CACHE_TTL_MS: i64 = 60 * 1000;
/// Bars fetched per timeframe.
const ANALYSIS_BAR_COUNT: usize = 200;
/// Aggregate score magnitude bound.
const SCORE_BOUND: f64 = 150.0;
/// Minimum |score| for a directional verdict.
const DIRECTION_DEADBAND: f64 = 20.0;

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

/// Per-timeframe analysis detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeframeAnalysis {
    pub timeframe: Timeframe,
    pub indicators: BTreeMap<String, f64>,
    pub patterns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub support: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resistance: Option<f64>,
    pub regime: MarketRegime,
    pub regime_confidence: f64,
    pub volatility: VolatilityRegime,
    /// Buy/sell volume balance in [-1, 1].
    pub volume_pressure: f64,
    /// Net RSI divergence count (bullish positive).
    pub divergence: i32,
    pub vote: Direction,
    /// Vote conviction in [0, 1].
    pub vote_strength: f64,
}

/// Aggregated technical analysis for one pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TechnicalAnalysis {
    pub pair: Pair,
    pub generated_at: i64,
    pub timeframes: Vec<TimeframeAnalysis>,
    /// Aggregate score in [-150, 150].
    pub score: f64,
    /// Strength in [0, 100] derived from |score|.
    pub strength: f64,
    pub direction: Direction,
    /// ATR of the primary (shortest) timeframe, for entry planning.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atr: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_close: Option<f64>,
    pub volatility: VolatilityRegime,
    pub regime: MarketRegime,
    pub regime_confidence: f64,
    pub volume_pressure: f64,
    pub divergence_count: u32,
    /// True when any timeframe was served synthetic bars.
    pub synthetic: bool,
}

impl TechnicalAnalysis {
    /// A neutral analysis carrying an error reason in no timeframes.
    pub fn neutral(pair: &Pair) -> Self {
        Self {
            pair: pair.clone(),
            generated_at: now_ms(),
            timeframes: Vec::new(),
            score: 0.0,
            strength: 0.0,
            direction: Direction::Neutral,
            atr: None,
            last_close: None,
            volatility: VolatilityRegime::Normal,
            regime: MarketRegime::Ranging,
            regime_confidence: 0.0,
            volume_pressure: 0.0,
            divergence_count: 0,
            synthetic: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Analyzer
// ---------------------------------------------------------------------------

pub struct TechnicalAnalyzer {
    fetcher: Arc<MarketDataFetcher>,
    /// (timeframe, weight) pairs; weights need not sum to 1.
    timeframe_weights: Vec<(Timeframe, f64)>,
    cache: RwLock<HashMap<Pair, Arc<TechnicalAnalysis>>>,
}

impl TechnicalAnalyzer {
    pub fn new(fetcher: Arc<MarketDataFetcher>) -> Self {
        Self {
            fetcher,
            timeframe_weights: vec![
                (Timeframe::M15, 0.20),
                (Timeframe::H1, 0.30),
                (Timeframe::H4, 0.30),
                (Timeframe::D1, 0.20),
            ],
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_weights(mut self, weights: Vec<(Timeframe, f64)>) -> Self {
        self.timeframe_weights = weights;
        self
    }

    /// Analyze a pair, serving a fresh cached result when available.
    pub async fn analyze(&self, pair: &Pair) -> Arc<TechnicalAnalysis> {
        let now = now_ms();
        if let Some(cached) = self.cache.read().get(pair) {
            if now - cached.generated_at < CACHE_TTL_MS {
                return cached.clone();
            }
        }

        let analysis = Arc::new(self.build(pair, now).await);
        self.cache.write().insert(pair.clone(), analysis.clone());
        analysis
    }

    async fn build(&self, pair: &Pair, now: i64) -> TechnicalAnalysis {
        let opts = FetchOpts::with_purpose("technical-analysis");

        let mut per_tf = Vec::new();
        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;
        let mut primary_atr = None;
        let mut last_close = None;
        let mut synthetic = false;

        for (timeframe, weight) in &self.timeframe_weights {
            let bars = match self
                .fetcher
                .fetch_bars(pair, *timeframe, ANALYSIS_BAR_COUNT, &opts)
                .await
            {
                Ok(bars) => bars,
                Err(e) => {
                    warn!(pair = %pair, timeframe = %timeframe, error = %e, "technical fetch failed");
                    continue;
                }
            };

            if bars.iter().any(|b| b.source == BarSource::Synthetic) {
                synthetic = true;
            }
            if primary_atr.is_none() {
                primary_atr = atr::calculate_atr(&bars, 14);
                last_close = bars.last().map(|b| b.close);
            }

            let tf_analysis = analyze_timeframe(&bars, *timeframe);
            weighted_sum += tf_analysis.vote.sign() * tf_analysis.vote_strength * weight;
            weight_total += weight;
            per_tf.push(tf_analysis);
        }

        if per_tf.is_empty() {
            return TechnicalAnalysis::neutral(pair);
        }

        let score = if weight_total > 0.0 {
            (weighted_sum / weight_total * SCORE_BOUND).clamp(-SCORE_BOUND, SCORE_BOUND)
        } else {
            0.0
        };

        let direction = if score >= DIRECTION_DEADBAND {
            Direction::Buy
        } else if score <= -DIRECTION_DEADBAND {
            Direction::Sell
        } else {
            Direction::Neutral
        };

        // Fleet-level regime/volatility from the dominant (highest weight)
        // timeframe that produced data.
        let (volatility, regime, regime_confidence) = {
            let lead = per_tf
                .iter()
                .max_by(|a, b| {
                    let wa = self.weight_of(a.timeframe);
                    let wb = self.weight_of(b.timeframe);
                    wa.partial_cmp(&wb).unwrap_or(std::cmp::Ordering::Equal)
                })
                .expect("per_tf is non-empty");
            (lead.volatility, lead.regime, lead.regime_confidence)
        };

        let divergence_count = per_tf.iter().map(|t| t.divergence.unsigned_abs()).sum();
        let volume_pressure =
            per_tf.iter().map(|t| t.volume_pressure).sum::<f64>() / per_tf.len() as f64;

        let analysis = TechnicalAnalysis {
            pair: pair.clone(),
            generated_at: now,
            score,
            strength: (score.abs() / SCORE_BOUND * 100.0).min(100.0),
            direction,
            atr: primary_atr,
            last_close,
            volatility,
            regime,
            regime_confidence,
            volume_pressure,
            divergence_count,
            synthetic,
            timeframes: per_tf,
        };

        debug!(
            pair = %pair,
            score = analysis.score,
            direction = %analysis.direction,
            regime = %analysis.regime,
            synthetic = analysis.synthetic,
            "technical analysis complete"
        );
        analysis
    }

    fn weight_of(&self, timeframe: Timeframe) -> f64 {
        self.timeframe_weights
            .iter()
            .find(|(tf, _)| *tf == timeframe)
            .map(|(_, w)| *w)
            .unwrap_or(0.0)
    }
}

impl std::fmt::Debug for TechnicalAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TechnicalAnalyzer")
            .field("timeframes", &self.timeframe_weights)
            .field("cached", &self.cache.read().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Per-timeframe analysis (pure)
// ---------------------------------------------------------------------------

/// Analyze one timeframe's bar series.
pub fn analyze_timeframe(bars: &[Bar], timeframe: Timeframe) -> TimeframeAnalysis {
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();

    let mut indicators = BTreeMap::new();
    let rsi_14 = rsi::current_rsi(&closes, 14);
    let roc_14 = roc::current_roc(&closes, 14);
    let adx_14 = adx::calculate_adx(bars, 14);
    let atr_14 = atr::calculate_atr(bars, 14);
    let atr_pct = atr::calculate_atr_pct(bars, 14);
    let bb = bollinger::calculate_bollinger(&closes, 20, 2.0);
    let e9 = ema::calculate_ema(&closes, 9).last().copied();
    let e21 = ema::calculate_ema(&closes, 21).last().copied();
    let e55 = ema::calculate_ema(&closes, 55).last().copied();

    if let Some(v) = rsi_14 {
        indicators.insert("rsi14".into(), v);
    }
    if let Some(v) = roc_14 {
        indicators.insert("roc14".into(), v);
    }
    if let Some(v) = adx_14 {
        indicators.insert("adx14".into(), v);
    }
    if let Some(v) = atr_14 {
        indicators.insert("atr14".into(), v);
    }
    if let Some(v) = e9 {
        indicators.insert("ema9".into(), v);
    }
    if let Some(v) = e21 {
        indicators.insert("ema21".into(), v);
    }
    if let Some(v) = e55 {
        indicators.insert("ema55".into(), v);
    }
    if let Some(ref b) = bb {
        indicators.insert("bbWidth".into(), b.width);
    }

    let patterns = detect_patterns(bars);
    let (support, resistance) = support_resistance(bars, 50);

    // Regime: ADX-led, Bollinger width override for volatility.
    let bb_width = bb.as_ref().map(|b| b.width).unwrap_or(0.0);
    let (regime, regime_confidence) = match adx_14 {
        Some(a) if bb_width > 2.0 => (MarketRegime::Volatile, (bb_width / 4.0).min(1.0).max(a / 100.0)),
        Some(a) if a > 25.0 => (MarketRegime::Trending, (a / 50.0).min(1.0)),
        Some(a) => (MarketRegime::Ranging, ((25.0 - a) / 25.0).clamp(0.0, 1.0)),
        None => (MarketRegime::Ranging, 0.0),
    };

    let volatility = match atr_pct {
        Some(p) if p < 0.15 => VolatilityRegime::Low,
        Some(p) if p < 0.50 => VolatilityRegime::Normal,
        Some(_) => VolatilityRegime::High,
        None => VolatilityRegime::Normal,
    };

    let volume_pressure = volume_pressure(bars);
    let divergence = rsi_divergence(bars, &closes);

    let (vote, vote_strength) = cast_vote(&closes, bars, rsi_14, roc_14, &bb, e9, e21, e55);

    TimeframeAnalysis {
        timeframe,
        indicators,
        patterns,
        support,
        resistance,
        regime,
        regime_confidence,
        volatility,
        volume_pressure,
        divergence,
        vote,
        vote_strength,
    }
}

/// Simple candlestick patterns over the last closed bars.
fn detect_patterns(bars: &[Bar]) -> Vec<String> {
    let mut patterns = Vec::new();
    let n = bars.len();
    if n < 2 {
        return patterns;
    }
    let prev = &bars[n - 2];
    let last = &bars[n - 1];

    let body = (last.close - last.open).abs();
    let range = last.high - last.low;
    let prev_body = (prev.close - prev.open).abs();

    if range > 0.0 && body / range < 0.1 {
        patterns.push("doji".to_string());
    }
    // Bullish engulfing: down bar fully engulfed by an up bar.
    if prev.close < prev.open
        && last.close > last.open
        && last.close > prev.open
        && last.open < prev.close
        && body > prev_body
    {
        patterns.push("bullish_engulfing".to_string());
    }
    if prev.close > prev.open
        && last.close < last.open
        && last.open > prev.close
        && last.close < prev.open
        && body > prev_body
    {
        patterns.push("bearish_engulfing".to_string());
    }
    // Hammer: long lower wick, small body near the top.
    if range > 0.0 {
        let lower_wick = last.open.min(last.close) - last.low;
        let upper_wick = last.high - last.open.max(last.close);
        if lower_wick > body * 2.0 && upper_wick < body {
            patterns.push("hammer".to_string());
        }
        if upper_wick > body * 2.0 && lower_wick < body {
            patterns.push("shooting_star".to_string());
        }
    }
    patterns
}

/// Swing support/resistance over the trailing window.
fn support_resistance(bars: &[Bar], window: usize) -> (Option<f64>, Option<f64>) {
    if bars.is_empty() {
        return (None, None);
    }
    let start = bars.len().saturating_sub(window);
    let slice = &bars[start..];
    let support = slice.iter().map(|b| b.low).fold(f64::MAX, f64::min);
    let resistance = slice.iter().map(|b| b.high).fold(f64::MIN, f64::max);
    (
        support.is_finite().then_some(support),
        resistance.is_finite().then_some(resistance),
    )
}

/// Buy/sell volume balance in [-1, 1] using up-bar vs down-bar volume.
fn volume_pressure(bars: &[Bar]) -> f64 {
    let mut up = 0.0;
    let mut down = 0.0;
    for b in bars.iter().rev().take(50) {
        let volume = b.volume.unwrap_or(1.0);
        if b.close >= b.open {
            up += volume;
        } else {
            down += volume;
        }
    }
    let total = up + down;
    if total == 0.0 {
        0.0
    } else {
        (up - down) / total
    }
}

/// Net RSI divergence over the last swings: price high without RSI high is
/// bearish (-1), price low without RSI low is bullish (+1).
fn rsi_divergence(bars: &[Bar], closes: &[f64]) -> i32 {
    let series = rsi::calculate_rsi(closes, 14);
    if series.len() < 20 || bars.len() < series.len() {
        return 0;
    }

    let recent = &series[series.len() - 10..];
    let earlier = &series[series.len() - 20..series.len() - 10];
    let price_recent = &closes[closes.len() - 10..];
    let price_earlier = &closes[closes.len() - 20..closes.len() - 10];

    let max = |xs: &[f64]| xs.iter().fold(f64::MIN, |a, &b| a.max(b));
    let min = |xs: &[f64]| xs.iter().fold(f64::MAX, |a, &b| a.min(b));

    let mut divergence = 0;
    if max(price_recent) > max(price_earlier) && max(recent) < max(earlier) {
        divergence -= 1;
    }
    if min(price_recent) < min(price_earlier) && min(recent) > min(earlier) {
        divergence += 1;
    }
    divergence
}

/// Cast a timeframe direction vote from the indicator ensemble.
#[allow(clippy::too_many_arguments)]
fn cast_vote(
    closes: &[f64],
    bars: &[Bar],
    rsi_14: Option<f64>,
    roc_14: Option<f64>,
    bb: &Option<bollinger::BollingerResult>,
    e9: Option<f64>,
    e21: Option<f64>,
    e55: Option<f64>,
) -> (Direction, f64) {
    let last_close = match bars.last() {
        Some(b) => b.close,
        None => return (Direction::Neutral, 0.0),
    };

    let mut score = 0.0;
    let mut max_score = 0.0;

    // EMA stack alignment (weight 0.35).
    if let (Some(e9), Some(e21), Some(e55)) = (e9, e21, e55) {
        max_score += 0.35;
        if e9 > e21 && e21 > e55 && last_close > e9 {
            score += 0.35;
        } else if e9 < e21 && e21 < e55 && last_close < e9 {
            score -= 0.35;
        }
    }

    // RSI mean-reversion edges (weight 0.2).
    if let Some(rsi) = rsi_14 {
        max_score += 0.2;
        if rsi < 30.0 {
            score += 0.2 * ((30.0 - rsi) / 30.0);
        } else if rsi > 70.0 {
            score -= 0.2 * ((rsi - 70.0) / 30.0);
        }
    }

    // Momentum (weight 0.25).
    if let Some(roc) = roc_14 {
        max_score += 0.25;
        score += 0.25 * (roc / 2.0).clamp(-1.0, 1.0);
    }

    // Price vs Bollinger envelope (weight 0.2).
    if let Some(b) = bb {
        max_score += 0.2;
        if last_close < b.lower {
            score += 0.2;
        } else if last_close > b.upper {
            score -= 0.2;
        }
    }

    if max_score == 0.0 || closes.len() < 30 {
        return (Direction::Neutral, 0.0);
    }

    let normalized = (score / max_score).clamp(-1.0, 1.0);
    let direction = if normalized > 0.15 {
        Direction::Buy
    } else if normalized < -0.15 {
        Direction::Sell
    } else {
        Direction::Neutral
    };
    (direction, normalized.abs())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::metrics::ProviderMetricsRegistry;

    fn bar_at(i: i64, open: f64, close: f64, volume: f64) -> Bar {
        Bar {
            timestamp_ms: i * Timeframe::M15.period_ms(),
            open,
            high: open.max(close) + 0.0004,
            low: open.min(close) - 0.0004,
            close,
            volume: Some(volume),
            source: BarSource::Provider("test".into()),
        }
    }

    fn trending_up(count: usize) -> Vec<Bar> {
        (0..count)
            .map(|i| {
                let base = 1.0500 + i as f64 * 0.0008;
                bar_at(i as i64, base, base + 0.0007, 1200.0)
            })
            .collect()
    }

    fn trending_down(count: usize) -> Vec<Bar> {
        (0..count)
            .map(|i| {
                let base = 1.2000 - i as f64 * 0.0008;
                bar_at(i as i64, base, base - 0.0007, 1200.0)
            })
            .collect()
    }

    #[test]
    fn uptrend_votes_buy() {
        let bars = trending_up(120);
        let tf = analyze_timeframe(&bars, Timeframe::M15);
        assert_eq!(tf.vote, Direction::Buy);
        assert!(tf.vote_strength > 0.2);
        assert_eq!(tf.regime, MarketRegime::Trending);
        assert!(tf.volume_pressure > 0.9);
    }

    #[test]
    fn downtrend_votes_sell() {
        let bars = trending_down(120);
        let tf = analyze_timeframe(&bars, Timeframe::M15);
        assert_eq!(tf.vote, Direction::Sell);
        assert!(tf.volume_pressure < -0.9);
    }

    #[test]
    fn flat_series_neutral() {
        let bars: Vec<Bar> = (0..120).map(|i| bar_at(i, 1.0850, 1.0850, 900.0)).collect();
        let tf = analyze_timeframe(&bars, Timeframe::M15);
        assert_eq!(tf.vote, Direction::Neutral);
    }

    #[test]
    fn support_resistance_brackets_prices() {
        let bars = trending_up(100);
        let tf = analyze_timeframe(&bars, Timeframe::M15);
        let support = tf.support.unwrap();
        let resistance = tf.resistance.unwrap();
        assert!(support < resistance);
        let last = bars.last().unwrap().close;
        assert!(last <= resistance && last >= support - 0.01);
    }

    #[test]
    fn engulfing_pattern_detected() {
        let mut bars = trending_up(60);
        let n = bars.len();
        // Down bar then a larger engulfing up bar.
        bars[n - 2].open = 1.0900;
        bars[n - 2].close = 1.0880;
        bars[n - 2].high = 1.0905;
        bars[n - 2].low = 1.0875;
        bars[n - 1].open = 1.0875;
        bars[n - 1].close = 1.0910;
        bars[n - 1].high = 1.0915;
        bars[n - 1].low = 1.0870;
        let patterns = detect_patterns(&bars);
        assert!(patterns.contains(&"bullish_engulfing".to_string()));
    }

    #[test]
    fn indicator_map_populated() {
        let bars = trending_up(120);
        let tf = analyze_timeframe(&bars, Timeframe::M15);
        for key in ["rsi14", "ema9", "ema21", "ema55", "adx14", "atr14", "bbWidth"] {
            assert!(tf.indicators.contains_key(key), "missing {key}");
        }
    }

    #[tokio::test]
    async fn analyzer_caches_results() {
        let metrics = Arc::new(ProviderMetricsRegistry::new());
        let fetcher = Arc::new(MarketDataFetcher::new(vec![], metrics, true, false));
        let analyzer = TechnicalAnalyzer::new(fetcher);
        let pair = Pair::parse("EURUSD").unwrap();

        let first = analyzer.analyze(&pair).await;
        let second = analyzer.analyze(&pair).await;
        assert!(Arc::ptr_eq(&first, &second));
        // Synthetic feed is flagged.
        assert!(first.synthetic);
        assert!(!first.timeframes.is_empty());
    }
}
