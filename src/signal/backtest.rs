// =============================================================================
// Live backtest validator — vectorized replay gate for borderline signals
// =============================================================================
//
// Given a directional signal, fetch a lookback window of M15 bars (default
// 30 days, capped at 3200 bars) and synthesize same-direction entries at a
// fixed stride. Each entry is replayed with fixed TP/SL (the signal's, or
// the 40/22-pip defaults) and a maximum hold; the aggregate statistics must
// clear every threshold for the gate to pass.
//
// The gate is *skipped* — not failed — when bars cannot be fetched, the
// window is too small, or the signal is non-directional.
// =============================================================================

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::LiveBacktestConfig;
use crate::market_data::fetcher::{FetchOpts, MarketDataFetcher};
use crate::signal::TradingSignal;
use crate::types::{Bar, Direction, Pair, Timeframe};

/// Minimum bars required to attempt a replay.
const MIN_WINDOW_BARS: usize = 200;

// ---------------------------------------------------------------------------
// Report model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestMetrics {
    pub trades: usize,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub max_drawdown_pct: f64,
    pub sharpe: f64,
    pub expectancy_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestWindow {
    pub bars: usize,
    pub from_ts: i64,
    pub to_ts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestReport {
    pub passed: bool,
    pub skipped: bool,
    pub reasons: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<BacktestMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window: Option<BacktestWindow>,
    pub thresholds: LiveBacktestConfig,
}

impl BacktestReport {
    fn skipped(reason: impl Into<String>, thresholds: &LiveBacktestConfig) -> Self {
        Self {
            passed: false,
            skipped: true,
            reasons: vec![reason.into()],
            metrics: None,
            window: None,
            thresholds: thresholds.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

pub struct LiveBacktestValidator {
    fetcher: Arc<MarketDataFetcher>,
    config: LiveBacktestConfig,
}

impl LiveBacktestValidator {
    pub fn new(fetcher: Arc<MarketDataFetcher>, config: LiveBacktestConfig) -> Self {
        Self { fetcher, config }
    }

    pub fn config(&self) -> &LiveBacktestConfig {
        &self.config
    }

    /// Replay the signal's direction over the lookback window.
    pub async fn validate_signal(&self, signal: &TradingSignal, pair: &Pair) -> BacktestReport {
        if !signal.direction.is_directional() {
            return BacktestReport::skipped("signal is non-directional", &self.config);
        }

        // 30 days of M15 bars, capped.
        let bars_per_day = 86_400 / Timeframe::M15.period_secs() as usize;
        let bar_count = (self.config.lookback_days as usize * bars_per_day)
            .min(self.config.max_bars);

        let bars = match self
            .fetcher
            .fetch_bars(
                pair,
                Timeframe::M15,
                bar_count,
                &FetchOpts::with_purpose("live-backtest"),
            )
            .await
        {
            Ok(bars) => bars,
            Err(e) => {
                warn!(pair = %pair, error = %e, "backtest window fetch failed — gate skipped");
                return BacktestReport::skipped(format!("bar fetch failed: {e}"), &self.config);
            }
        };

        if bars.len() < MIN_WINDOW_BARS {
            return BacktestReport::skipped(
                format!("insufficient bars: {} < {MIN_WINDOW_BARS}", bars.len()),
                &self.config,
            );
        }

        // Use the signal's own stop/target distances when present.
        let (tp_pips, sl_pips) = match &signal.entry {
            Some(entry) => (
                pair.price_to_pips(entry.take_profit - entry.price),
                pair.price_to_pips(entry.price - entry.stop_loss),
            ),
            None => (self.config.default_tp_pips, self.config.default_sl_pips),
        };

        let metrics = run_backtest(
            &bars,
            signal.direction,
            pair.pip_size(),
            tp_pips,
            sl_pips,
            self.config.entry_stride,
            self.config.hold_bars,
        );

        let window = BacktestWindow {
            bars: bars.len(),
            from_ts: bars.first().map(|b| b.timestamp_ms).unwrap_or(0),
            to_ts: bars.last().map(|b| b.timestamp_ms).unwrap_or(0),
        };

        let mut reasons = Vec::new();
        if metrics.trades < self.config.min_trades {
            reasons.push(format!(
                "min_trades: {} < {}",
                metrics.trades, self.config.min_trades
            ));
        }
        if metrics.win_rate < self.config.min_win_rate {
            reasons.push(format!(
                "min_win_rate: {:.2} < {:.2}",
                metrics.win_rate, self.config.min_win_rate
            ));
        }
        if metrics.profit_factor < self.config.min_profit_factor {
            reasons.push(format!(
                "min_profit_factor: {:.2} < {:.2}",
                metrics.profit_factor, self.config.min_profit_factor
            ));
        }
        if metrics.max_drawdown_pct > self.config.max_drawdown_pct {
            reasons.push(format!(
                "max_drawdown: {:.1}% > {:.1}%",
                metrics.max_drawdown_pct, self.config.max_drawdown_pct
            ));
        }
        if metrics.expectancy_pct < self.config.min_expectancy_pct {
            reasons.push(format!(
                "min_expectancy: {:.2}% < {:.2}%",
                metrics.expectancy_pct, self.config.min_expectancy_pct
            ));
        }

        let passed = reasons.is_empty();
        debug!(
            pair = %pair,
            direction = %signal.direction,
            trades = metrics.trades,
            win_rate = metrics.win_rate,
            profit_factor = metrics.profit_factor,
            passed,
            "live backtest gate evaluated"
        );

        BacktestReport {
            passed,
            skipped: false,
            reasons,
            metrics: Some(metrics),
            window: Some(window),
            thresholds: self.config.clone(),
        }
    }
}

impl std::fmt::Debug for LiveBacktestValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveBacktestValidator")
            .field("config", &self.config)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Vectorized replay (pure)
// ---------------------------------------------------------------------------

/// Replay stride-synthesized entries with fixed TP/SL and a maximum hold.
/// When a bar touches both levels the stop is assumed to fill first.
pub fn run_backtest(
    bars: &[Bar],
    direction: Direction,
    pip_size: f64,
    tp_pips: f64,
    sl_pips: f64,
    stride: usize,
    hold_bars: usize,
) -> BacktestMetrics {
    let stride = stride.max(1);
    let sign = direction.sign();
    let tp_dist = tp_pips * pip_size;
    let sl_dist = sl_pips * pip_size;

    let mut results_pct: Vec<f64> = Vec::new();

    let mut i = 0;
    while i + 1 < bars.len() {
        let entry = bars[i].close;
        if entry <= 0.0 {
            i += stride;
            continue;
        }
        let tp = entry + tp_dist * sign;
        let sl = entry - sl_dist * sign;

        let mut outcome_pct: Option<f64> = None;
        let last = (i + hold_bars).min(bars.len() - 1);
        for bar in &bars[i + 1..=last] {
            let sl_hit = if sign > 0.0 { bar.low <= sl } else { bar.high >= sl };
            let tp_hit = if sign > 0.0 { bar.high >= tp } else { bar.low <= tp };
            if sl_hit {
                outcome_pct = Some(-sl_dist / entry * 100.0);
                break;
            }
            if tp_hit {
                outcome_pct = Some(tp_dist / entry * 100.0);
                break;
            }
        }

        let pct = outcome_pct
            .unwrap_or_else(|| (bars[last].close - entry) * sign / entry * 100.0);
        results_pct.push(pct);
        i += stride;
    }

    summarize(&results_pct)
}

fn summarize(results_pct: &[f64]) -> BacktestMetrics {
    let trades = results_pct.len();
    if trades == 0 {
        return BacktestMetrics {
            trades: 0,
            win_rate: 0.0,
            profit_factor: 0.0,
            max_drawdown_pct: 0.0,
            sharpe: 0.0,
            expectancy_pct: 0.0,
        };
    }

    let wins = results_pct.iter().filter(|r| **r > 0.0).count();
    let gross_profit: f64 = results_pct.iter().filter(|r| **r > 0.0).sum();
    let gross_loss: f64 = results_pct.iter().filter(|r| **r < 0.0).map(|r| -r).sum();

    let profit_factor = if gross_loss > 0.0 {
        gross_profit / gross_loss
    } else if gross_profit > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };

    // Max drawdown on the cumulative return curve.
    let mut equity = 0.0f64;
    let mut peak = 0.0f64;
    let mut max_drawdown = 0.0f64;
    for r in results_pct {
        equity += r;
        peak = peak.max(equity);
        max_drawdown = max_drawdown.max(peak - equity);
    }

    let n = trades as f64;
    let mean = results_pct.iter().sum::<f64>() / n;
    let variance = results_pct.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    let std_dev = variance.sqrt();
    let sharpe = if std_dev > 0.0 { mean / std_dev } else { 0.0 };

    BacktestMetrics {
        trades,
        win_rate: wins as f64 / n,
        profit_factor,
        max_drawdown_pct: max_drawdown,
        sharpe,
        expectancy_pct: mean,
    }
}
