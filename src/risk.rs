// =============================================================================
// Risk engine & trade manager — sizing, exposure limits and the kill switch
// =============================================================================
//
// Pre-trade gates, checked in order:
//   1. Kill switch       — operator flag; blocks everything instantly.
//   2. Daily risk budget — cumulative risk committed today vs the cap.
//   3. Currency exposure — summed lot exposure per currency leg.
//   4. Correlation load  — open positions inside the same cluster.
//   5. VaR guard         — parametric VaR over the rolling daily P&L.
//
// Position size = balance * risk% / (stopLossPips * pipValue).
// Daily counters reset automatically when the UTC date rolls over.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::types::{Direction, Pair};

/// Pip value per standard lot in account currency. Quote-currency accounts
/// net out to ~10 units per pip per lot for the supported universe.
const PIP_VALUE_PER_LOT: f64 = 10.0;
/// z-score for the 95% parametric VaR.
const VAR_Z_95: f64 = 1.645;

/// Correlated pair clusters; positions inside one cluster share risk.
const CORRELATION_CLUSTERS: &[&[&str]] = &[
    &["EURUSD", "GBPUSD", "EURGBP", "EURCHF"],
    &["AUDUSD", "NZDUSD", "AUDNZD"],
    &["USDJPY", "EURJPY", "GBPJPY"],
    &["XAUUSD", "XAGUSD"],
];

// ---------------------------------------------------------------------------
// Config & snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskConfig {
    pub account_balance: f64,
    /// Risk per trade as percent of balance.
    pub account_risk_pct: f64,
    /// Cumulative daily risk cap as percent of balance.
    pub max_daily_risk_pct: f64,
    /// Maximum summed lot exposure per currency.
    pub max_currency_exposure_lots: f64,
    /// Maximum simultaneous positions within one correlation cluster.
    pub max_correlated_positions: usize,
    /// Rolling window for the VaR guard, in days.
    pub var_lookback_days: usize,
    /// VaR cap as percent of balance.
    pub max_var_pct: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            account_balance: 10_000.0,
            account_risk_pct: 1.0,
            max_daily_risk_pct: 5.0,
            max_currency_exposure_lots: 3.0,
            max_correlated_positions: 2,
            var_lookback_days: 14,
            max_var_pct: 4.0,
        }
    }
}

/// Sizing and authorization attached to every signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskManagement {
    pub position_size: f64,
    pub risk_amount: f64,
    pub account_risk_pct: f64,
    pub can_trade: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RiskManagement {
    pub fn blocked(reason: impl Into<String>) -> Self {
        Self {
            position_size: 0.0,
            risk_amount: 0.0,
            account_risk_pct: 0.0,
            can_trade: false,
            reason: Some(reason.into()),
        }
    }
}

/// Serialisable snapshot for dashboards and the daily risk report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskStateSnapshot {
    pub account_balance: f64,
    pub daily_risk_used_pct: f64,
    pub daily_realized_pnl: f64,
    pub open_positions: usize,
    pub currency_exposure: HashMap<String, f64>,
    pub var_pct: f64,
    pub kill_switch_engaged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kill_switch_reason: Option<String>,
    pub current_date: String,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct OpenRisk {
    pair: Pair,
    #[allow(dead_code)]
    direction: Direction,
    size_lots: f64,
    risk_amount: f64,
}

struct Inner {
    balance: f64,
    daily_risk_used_pct: f64,
    daily_realized_pnl: f64,
    current_date: String,
    /// (date, realized pnl) per day for the VaR window.
    pnl_history: VecDeque<(String, f64)>,
    open: HashMap<String, OpenRisk>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct RiskEngine {
    config: RiskConfig,
    state: RwLock<Inner>,
    kill_switch: AtomicBool,
    kill_reason: RwLock<Option<String>>,
}

impl RiskEngine {
    pub fn new(config: RiskConfig) -> Self {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        info!(
            balance = config.account_balance,
            risk_pct = config.account_risk_pct,
            daily_cap_pct = config.max_daily_risk_pct,
            "risk engine initialised"
        );
        Self {
            config,
            state: RwLock::new(Inner {
                balance: 0.0,
                daily_risk_used_pct: 0.0,
                daily_realized_pnl: 0.0,
                current_date: today,
                pnl_history: VecDeque::new(),
                open: HashMap::new(),
            }),
            kill_switch: AtomicBool::new(false),
            kill_reason: RwLock::new(None),
        }
    }

    fn balance(&self) -> f64 {
        let s = self.state.read();
        if s.balance > 0.0 {
            s.balance
        } else {
            self.config.account_balance
        }
    }

    /// Update the account balance from broker reconciliation.
    pub fn set_balance(&self, balance: f64) {
        if balance > 0.0 {
            self.state.write().balance = balance;
        }
    }

    // -------------------------------------------------------------------------
    // Kill switch
    // -------------------------------------------------------------------------

    pub fn engage_kill_switch(&self, reason: &str) {
        self.kill_switch.store(true, Ordering::SeqCst);
        *self.kill_reason.write() = Some(reason.to_string());
        warn!(reason, "kill switch engaged — all order flow halted");
    }

    pub fn release_kill_switch(&self) {
        self.kill_switch.store(false, Ordering::SeqCst);
        *self.kill_reason.write() = None;
        info!("kill switch released");
    }

    pub fn kill_switch_engaged(&self) -> bool {
        self.kill_switch.load(Ordering::SeqCst)
    }

    pub fn kill_switch_reason(&self) -> Option<String> {
        self.kill_reason.read().clone()
    }

    // -------------------------------------------------------------------------
    // Sizing & pre-trade checks
    // -------------------------------------------------------------------------

    /// Size a position and run every pre-trade gate.
    pub fn calculate_risk_management(
        &self,
        pair: &Pair,
        direction: Direction,
        entry_price: f64,
        stop_loss: f64,
        account_risk_pct: f64,
    ) -> RiskManagement {
        self.maybe_reset_daily();

        if self.kill_switch_engaged() {
            let reason = self
                .kill_switch_reason()
                .unwrap_or_else(|| "unspecified".to_string());
            return RiskManagement::blocked(format!("Kill switch engaged: {reason}"));
        }

        let sl_pips = pair.price_to_pips(entry_price - stop_loss);
        if sl_pips <= 0.0 || !sl_pips.is_finite() {
            return RiskManagement::blocked("invalid stop-loss distance");
        }

        let balance = self.balance();
        let risk_amount = balance * account_risk_pct / 100.0;
        let position_size = risk_amount / (sl_pips * PIP_VALUE_PER_LOT);

        if position_size <= 0.0 || !position_size.is_finite() {
            return RiskManagement::blocked("computed position size is zero");
        }

        let s = self.state.read();

        // Daily risk budget.
        if s.daily_risk_used_pct + account_risk_pct > self.config.max_daily_risk_pct {
            return RiskManagement::blocked(format!(
                "daily risk limit reached: {:.2}% used of {:.2}%",
                s.daily_risk_used_pct, self.config.max_daily_risk_pct
            ));
        }

        // Per-currency exposure.
        for leg in [pair.base(), pair.quote()] {
            let current: f64 = s
                .open
                .values()
                .filter(|o| o.pair.base() == leg || o.pair.quote() == leg)
                .map(|o| o.size_lots)
                .sum();
            if current + position_size > self.config.max_currency_exposure_lots {
                return RiskManagement::blocked(format!(
                    "currency exposure limit for {leg}: {:.2} + {:.2} lots exceeds {:.2}",
                    current, position_size, self.config.max_currency_exposure_lots
                ));
            }
        }

        // Correlation cluster load.
        if let Some(cluster) = CORRELATION_CLUSTERS
            .iter()
            .find(|c| c.contains(&pair.as_str()))
        {
            let cluster_open = s
                .open
                .values()
                .filter(|o| cluster.contains(&o.pair.as_str()))
                .count();
            if cluster_open >= self.config.max_correlated_positions {
                return RiskManagement::blocked(format!(
                    "correlation cluster limit: {cluster_open} open positions correlated with {pair}"
                ));
            }
        }

        // VaR guard over the rolling daily P&L window.
        let var_pct = Self::parametric_var_pct(&s.pnl_history, balance, self.config.var_lookback_days);
        if var_pct > self.config.max_var_pct {
            return RiskManagement::blocked(format!(
                "VaR guard: {var_pct:.2}% exceeds cap {:.2}%",
                self.config.max_var_pct
            ));
        }

        drop(s);

        debug!(
            pair = %pair,
            direction = %direction,
            sl_pips,
            position_size,
            risk_amount,
            "risk management computed"
        );

        RiskManagement {
            position_size,
            risk_amount,
            account_risk_pct,
            can_trade: true,
            reason: None,
        }
    }

    /// 95% parametric VaR of daily P&L as a percent of balance.
    fn parametric_var_pct(
        history: &VecDeque<(String, f64)>,
        balance: f64,
        lookback: usize,
    ) -> f64 {
        if balance <= 0.0 || history.len() < 3 {
            return 0.0;
        }
        let window: Vec<f64> = history
            .iter()
            .rev()
            .take(lookback)
            .map(|(_, pnl)| pnl / balance * 100.0)
            .collect();
        let n = window.len() as f64;
        let mean = window.iter().sum::<f64>() / n;
        let variance = window.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        let std_dev = variance.sqrt();
        (-(mean - VAR_Z_95 * std_dev)).max(0.0)
    }

    // -------------------------------------------------------------------------
    // Trade lifecycle accounting
    // -------------------------------------------------------------------------

    /// Register a filled trade against the daily budget and exposure book.
    pub fn register_open_trade(
        &self,
        trade_id: &str,
        pair: &Pair,
        direction: Direction,
        size_lots: f64,
        risk_amount: f64,
        account_risk_pct: f64,
    ) {
        self.maybe_reset_daily();
        let mut s = self.state.write();
        s.daily_risk_used_pct += account_risk_pct;
        s.open.insert(
            trade_id.to_string(),
            OpenRisk {
                pair: pair.clone(),
                direction,
                size_lots,
                risk_amount,
            },
        );
        debug!(
            trade_id,
            pair = %pair,
            size_lots,
            risk_amount,
            daily_risk_used_pct = s.daily_risk_used_pct,
            "trade registered with risk engine"
        );
    }

    /// Record a closed trade's realized P&L.
    pub fn on_trade_closed(&self, trade_id: &str, pnl: f64) {
        self.maybe_reset_daily();
        let mut s = self.state.write();
        s.open.remove(trade_id);
        s.daily_realized_pnl += pnl;
        let base = if s.balance > 0.0 {
            s.balance
        } else {
            self.config.account_balance
        };
        s.balance = base + pnl;

        let today = s.current_date.clone();
        match s.pnl_history.back_mut() {
            Some((date, total)) if *date == today => *total += pnl,
            _ => s.pnl_history.push_back((today, pnl)),
        }
        while s.pnl_history.len() > self.config.var_lookback_days * 4 {
            s.pnl_history.pop_front();
        }
    }

    // -------------------------------------------------------------------------
    // Snapshot
    // -------------------------------------------------------------------------

    pub fn snapshot(&self) -> RiskStateSnapshot {
        self.maybe_reset_daily();
        let s = self.state.read();
        let balance = if s.balance > 0.0 {
            s.balance
        } else {
            self.config.account_balance
        };

        let mut currency_exposure: HashMap<String, f64> = HashMap::new();
        for open in s.open.values() {
            *currency_exposure
                .entry(open.pair.base().to_string())
                .or_default() += open.size_lots;
            *currency_exposure
                .entry(open.pair.quote().to_string())
                .or_default() += open.size_lots;
        }

        RiskStateSnapshot {
            account_balance: balance,
            daily_risk_used_pct: s.daily_risk_used_pct,
            daily_realized_pnl: s.daily_realized_pnl,
            open_positions: s.open.len(),
            currency_exposure,
            var_pct: Self::parametric_var_pct(&s.pnl_history, balance, self.config.var_lookback_days),
            kill_switch_engaged: self.kill_switch_engaged(),
            kill_switch_reason: self.kill_switch_reason(),
            current_date: s.current_date.clone(),
        }
    }

    // -------------------------------------------------------------------------
    // Daily reset
    // -------------------------------------------------------------------------

    /// Reset the daily accumulators when the UTC date rolls over.
    fn maybe_reset_daily(&self) {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        {
            let s = self.state.read();
            if s.current_date == today {
                return;
            }
        }
        let mut s = self.state.write();
        if s.current_date != today {
            info!(
                old_date = %s.current_date,
                new_date = %today,
                "UTC date rolled — resetting daily risk accumulators"
            );
            s.daily_risk_used_pct = 0.0;
            s.daily_realized_pnl = 0.0;
            s.current_date = today;
        }
    }
}

impl std::fmt::Debug for RiskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskEngine")
            .field("config", &self.config)
            .field("kill_switch", &self.kill_switch_engaged())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn eurusd() -> Pair {
        Pair::parse("EURUSD").unwrap()
    }

    fn engine() -> RiskEngine {
        RiskEngine::new(RiskConfig::default())
    }

    #[test]
    fn position_sizing_formula() {
        let engine = engine();
        // 10_000 * 1% = 100 risk; 25 pip stop at $10/pip/lot => 0.4 lots.
        let rm = engine.calculate_risk_management(&eurusd(), Direction::Buy, 1.0850, 1.0825, 1.0);
        assert!(rm.can_trade);
        assert!((rm.risk_amount - 100.0).abs() < 1e-9);
        assert!((rm.position_size - 0.4).abs() < 1e-9);
    }

    #[test]
    fn invalid_stop_blocks() {
        let engine = engine();
        let rm = engine.calculate_risk_management(&eurusd(), Direction::Buy, 1.0850, 1.0850, 1.0);
        assert!(!rm.can_trade);
        assert!(rm.reason.unwrap().contains("stop-loss"));
    }

    #[test]
    fn kill_switch_blocks_sizing() {
        let engine = engine();
        engine.engage_kill_switch("maintenance");
        let rm = engine.calculate_risk_management(&eurusd(), Direction::Buy, 1.0850, 1.0825, 1.0);
        assert!(!rm.can_trade);
        assert!(rm.reason.unwrap().contains("Kill switch"));

        engine.release_kill_switch();
        let rm = engine.calculate_risk_management(&eurusd(), Direction::Buy, 1.0850, 1.0825, 1.0);
        assert!(rm.can_trade);
    }

    #[test]
    fn daily_risk_budget_enforced() {
        let engine = engine();
        for i in 0..5 {
            engine.register_open_trade(
                &format!("t{i}"),
                &Pair::parse("USDCAD").unwrap(),
                Direction::Buy,
                0.1,
                100.0,
                1.0,
            );
        }
        // 5% already committed; the next 1% breaches the cap.
        let rm = engine.calculate_risk_management(&eurusd(), Direction::Buy, 1.0850, 1.0825, 1.0);
        assert!(!rm.can_trade);
        assert!(rm.reason.unwrap().contains("daily risk limit"));
    }

    #[test]
    fn currency_exposure_enforced() {
        let engine = engine();
        engine.register_open_trade("t1", &eurusd(), Direction::Buy, 2.9, 50.0, 0.5);
        // Next EURUSD trade pushes USD leg past 3.0 lots.
        let rm = engine.calculate_risk_management(&eurusd(), Direction::Buy, 1.0850, 1.0825, 1.0);
        assert!(!rm.can_trade);
        assert!(rm.reason.unwrap().contains("exposure limit"));
    }

    #[test]
    fn correlation_cluster_enforced() {
        let engine = engine();
        engine.register_open_trade("t1", &eurusd(), Direction::Buy, 0.1, 50.0, 0.5);
        engine.register_open_trade(
            "t2",
            &Pair::parse("GBPUSD").unwrap(),
            Direction::Buy,
            0.1,
            50.0,
            0.5,
        );
        // Third trade in the EUR/GBP cluster is blocked.
        let rm = engine.calculate_risk_management(
            &Pair::parse("EURGBP").unwrap(),
            Direction::Buy,
            0.8550,
            0.8530,
            1.0,
        );
        assert!(!rm.can_trade);
        assert!(rm.reason.unwrap().contains("correlation"));
    }

    #[test]
    fn trade_close_updates_pnl_and_exposure() {
        let engine = engine();
        engine.register_open_trade("t1", &eurusd(), Direction::Buy, 0.4, 100.0, 1.0);
        assert_eq!(engine.snapshot().open_positions, 1);

        engine.on_trade_closed("t1", 75.0);
        let snap = engine.snapshot();
        assert_eq!(snap.open_positions, 0);
        assert!((snap.daily_realized_pnl - 75.0).abs() < 1e-9);
        assert!(snap.currency_exposure.is_empty());
    }

    #[test]
    fn var_guard_blocks_after_volatile_losses() {
        let engine = engine();
        {
            // Seed a losing, volatile P&L history directly.
            let mut s = engine.state.write();
            for i in 0..10 {
                let pnl = if i % 2 == 0 { -450.0 } else { -150.0 };
                s.pnl_history.push_back((format!("2026-07-{:02}", i + 1), pnl));
            }
        }
        let rm = engine.calculate_risk_management(&eurusd(), Direction::Buy, 1.0850, 1.0825, 1.0);
        assert!(!rm.can_trade);
        assert!(rm.reason.unwrap().contains("VaR"));
    }

    #[test]
    fn jpy_pair_sizing_uses_pip_size() {
        let engine = engine();
        let usdjpy = Pair::parse("USDJPY").unwrap();
        // 25-pip stop on USDJPY: 149.50 -> 149.25.
        let rm = engine.calculate_risk_management(&usdjpy, Direction::Buy, 149.50, 149.25, 1.0);
        assert!(rm.can_trade);
        assert!((rm.position_size - 0.4).abs() < 1e-6);
    }
}
