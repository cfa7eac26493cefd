// =============================================================================
// Trading signal model
// =============================================================================
//
// The typed signal emitted by the pipeline. Invariants:
//   - BUY:  entry.stop_loss < entry.price < entry.take_profit
//   - SELL: entry.take_profit < entry.price < entry.stop_loss
//   - NEUTRAL implies entry == None
//   - strength and confidence live in [0, 100]
// Invalid signals are still emitted — carrying their failed checks — but
// the router refuses to act on them.

pub mod backtest;
pub mod combiner;
pub mod coordinator;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::risk::RiskManagement;
use crate::types::{now_ms, Direction, Pair};

pub use backtest::{BacktestReport, LiveBacktestValidator};
pub use combiner::SignalCombiner;
pub use coordinator::{GenerateOpts, GenerationResult, SignalCoordinator};

// ---------------------------------------------------------------------------
// Entry plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryPlan {
    pub price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub risk_reward: f64,
    pub trailing_stop: bool,
}

impl EntryPlan {
    /// Check the directional ordering invariant.
    pub fn is_coherent(&self, direction: Direction) -> bool {
        match direction {
            Direction::Buy => self.stop_loss < self.price && self.price < self.take_profit,
            Direction::Sell => self.take_profit < self.price && self.price < self.stop_loss,
            Direction::Neutral => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Components & validity
// ---------------------------------------------------------------------------

/// Summary of the evidence that went into the signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalComponents {
    pub technical_score: f64,
    pub economic_score: f64,
    pub news_sentiment: f64,
    pub scorer_probability: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_quality_score: Option<f64>,
}

/// Decision summary attached to the validity block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    /// `allowed` or `blocked`.
    pub state: String,
    pub blockers: Vec<String>,
    pub missing: Vec<String>,
}

impl Decision {
    pub fn allowed() -> Self {
        Self {
            state: "allowed".to_string(),
            blockers: Vec::new(),
            missing: Vec::new(),
        }
    }

    pub fn blocked(blockers: Vec<String>, missing: Vec<String>) -> Self {
        Self {
            state: "blocked".to_string(),
            blockers,
            missing,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Validity {
    pub is_valid: bool,
    /// Check name -> passed.
    pub checks: BTreeMap<String, bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub decision: Decision,
}

impl Validity {
    pub fn failed(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            is_valid: false,
            checks: BTreeMap::new(),
            reason: Some(reason.clone()),
            decision: Decision::blocked(vec![reason], Vec::new()),
        }
    }
}

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradingSignal {
    pub id: String,
    pub pair: Pair,
    pub ts_ms: i64,
    pub direction: Direction,
    /// [0, 100]
    pub strength: f64,
    /// [0, 100]
    pub confidence: f64,
    /// [-100, 100]
    pub final_score: f64,
    pub components: SignalComponents,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry: Option<EntryPlan>,
    pub risk_management: RiskManagement,
    pub validity: Validity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explainability: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub reasoning: Vec<String>,
}

impl TradingSignal {
    /// The safe default the coordinator returns on any pipeline failure:
    /// NEUTRAL, invalid, carrying the failure reason.
    pub fn neutral(pair: &Pair, reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            pair: pair.clone(),
            ts_ms: now_ms(),
            direction: Direction::Neutral,
            strength: 0.0,
            confidence: 0.0,
            final_score: 0.0,
            components: SignalComponents {
                technical_score: 0.0,
                economic_score: 0.0,
                news_sentiment: 0.0,
                scorer_probability: 0.5,
                data_quality_score: None,
            },
            entry: None,
            risk_management: RiskManagement::blocked("signal is neutral"),
            validity: Validity::failed(reason),
            explainability: None,
            reasoning: Vec::new(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_plan_coherence() {
        let buy = EntryPlan {
            price: 1.0850,
            stop_loss: 1.0825,
            take_profit: 1.0890,
            risk_reward: 1.6,
            trailing_stop: true,
        };
        assert!(buy.is_coherent(Direction::Buy));
        assert!(!buy.is_coherent(Direction::Sell));
        assert!(!buy.is_coherent(Direction::Neutral));

        let sell = EntryPlan {
            price: 1.0850,
            stop_loss: 1.0875,
            take_profit: 1.0810,
            risk_reward: 1.6,
            trailing_stop: false,
        };
        assert!(sell.is_coherent(Direction::Sell));
        assert!(!sell.is_coherent(Direction::Buy));
    }

    #[test]
    fn neutral_default_is_safely_invalid() {
        let pair = Pair::parse("EURUSD").unwrap();
        let signal = TradingSignal::neutral(&pair, "analyzer failure: timeout");
        assert_eq!(signal.direction, Direction::Neutral);
        assert!(signal.entry.is_none());
        assert!(!signal.validity.is_valid);
        assert!(!signal.risk_management.can_trade);
        assert_eq!(signal.validity.decision.state, "blocked");
        assert!(signal
            .validity
            .reason
            .as_ref()
            .unwrap()
            .contains("analyzer failure"));
    }

    #[test]
    fn signal_serialises_with_camel_case() {
        let pair = Pair::parse("EURUSD").unwrap();
        let signal = TradingSignal::neutral(&pair, "x");
        let json = serde_json::to_string(&signal).unwrap();
        assert!(json.contains("\"finalScore\""));
        assert!(json.contains("\"riskManagement\""));
        assert!(json.contains("\"isValid\""));
    }
}
