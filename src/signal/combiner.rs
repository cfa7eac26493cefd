// =============================================================================
// Signal combiner — merges analyses, quality and the scorer into one signal
// =============================================================================
//
// The combiner consumes the analyzer artifacts (shapes only, never the
// analyzer types), runs the adaptive scorer, builds the ATR-based entry
// plan and evaluates the validity checks:
//
//   1. direction is not NEUTRAL
//   2. strength >= min_strength and confidence >= min_confidence
//   3. entry risk/reward >= min_risk_reward
//   4. riskManagement.canTrade
//   5. no confidence-floor breach from the quality guard
//   6. no live pair circuit breaker
//   7. no conflicting high-impact news in the imminent/during window
//
// A failed check is recorded in `checks` with a human-readable reason; the
// signal is still emitted with `isValid = false`.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::analysis::economic::EconomicAnalysis;
use crate::analysis::news::NewsAnalysis;
use crate::analysis::scorer::AdaptiveScorer;
use crate::analysis::technical::TechnicalAnalysis;
use crate::analysis::VolatilityRegime;
use crate::market_data::quality::{CircuitBreakerRecord, QualityReport};
use crate::risk::{RiskEngine, RiskManagement};
use crate::signal::{Decision, EntryPlan, SignalComponents, TradingSignal, Validity};
use crate::types::{now_ms, Direction, Pair, Quote};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CombinerConfig {
    pub min_strength: f64,
    pub min_confidence: f64,
    pub min_risk_reward: f64,
    /// Strict mode raises the risk/reward bar to 2.5.
    pub strict_mode: bool,
    pub account_risk_pct: f64,
}

impl Default for CombinerConfig {
    fn default() -> Self {
        Self {
            min_strength: 35.0,
            min_confidence: 45.0,
            min_risk_reward: 1.6,
            strict_mode: false,
            account_risk_pct: 1.0,
        }
    }
}

impl CombinerConfig {
    fn effective_min_risk_reward(&self) -> f64 {
        if self.strict_mode {
            2.5
        } else {
            self.min_risk_reward
        }
    }
}

/// (k_sl, k_tp) ATR multipliers per volatility regime; the spread between
/// them keeps the default plan above the 1.6 risk/reward target.
fn atr_multipliers(volatility: VolatilityRegime) -> (f64, f64) {
    match volatility {
        VolatilityRegime::Low => (1.2, 2.0),
        VolatilityRegime::Normal => (1.5, 2.6),
        VolatilityRegime::High => (2.0, 3.4),
    }
}

// ---------------------------------------------------------------------------
// Combiner
// ---------------------------------------------------------------------------

pub struct SignalCombiner {
    scorer: Arc<AdaptiveScorer>,
    config: CombinerConfig,
}

impl SignalCombiner {
    pub fn new(scorer: Arc<AdaptiveScorer>, config: CombinerConfig) -> Self {
        Self { scorer, config }
    }

    pub fn config(&self) -> &CombinerConfig {
        &self.config
    }

    /// Build the full trading signal from the gathered evidence.
    #[allow(clippy::too_many_arguments)]
    pub fn combine(
        &self,
        pair: &Pair,
        technical: &TechnicalAnalysis,
        economic: &EconomicAnalysis,
        news: &NewsAnalysis,
        quality: &QualityReport,
        quote: Option<&Quote>,
        breaker: Option<&CircuitBreakerRecord>,
        risk: &RiskEngine,
    ) -> TradingSignal {
        let score = self.scorer.score(pair, technical, economic, news);
        let direction = score.direction;

        let strength = (score.final_score.abs() * 1.25).min(100.0);
        let confidence = score.confidence;

        // ── Entry plan ──────────────────────────────────────────────────
        let entry_price = quote.map(Quote::mid).or(technical.last_close);
        let entry = if direction.is_directional() {
            entry_price.and_then(|price| {
                let atr = technical.atr.filter(|a| *a > 0.0)?;
                let (k_sl, k_tp) = atr_multipliers(technical.volatility);
                let sl_dist = atr * k_sl;
                let tp_dist = atr * k_tp;

                let (stop_loss, take_profit) = match direction {
                    Direction::Buy => (price - sl_dist, price + tp_dist),
                    Direction::Sell => (price + sl_dist, price - tp_dist),
                    Direction::Neutral => unreachable!("guarded by is_directional"),
                };

                Some(EntryPlan {
                    price,
                    stop_loss,
                    take_profit,
                    risk_reward: tp_dist / sl_dist,
                    trailing_stop: matches!(
                        technical.volatility,
                        VolatilityRegime::Normal | VolatilityRegime::High
                    ),
                })
            })
        } else {
            None
        };

        // ── Risk management ─────────────────────────────────────────────
        let risk_management = match &entry {
            Some(plan) => risk.calculate_risk_management(
                pair,
                direction,
                plan.price,
                plan.stop_loss,
                self.config.account_risk_pct,
            ),
            None => RiskManagement::blocked("no entry plan"),
        };

        // ── Validity checks ─────────────────────────────────────────────
        let mut checks = BTreeMap::new();
        let mut failures: Vec<String> = Vec::new();
        let mut missing: Vec<String> = Vec::new();

        let directional = direction.is_directional();
        checks.insert("direction".to_string(), directional);
        if !directional {
            failures.push("direction is NEUTRAL".to_string());
        }

        let strong_enough = strength >= self.config.min_strength;
        checks.insert("min_strength".to_string(), strong_enough);
        if !strong_enough {
            failures.push(format!(
                "strength {strength:.1} below minimum {:.1}",
                self.config.min_strength
            ));
        }

        let confident_enough = confidence >= self.config.min_confidence;
        checks.insert("min_confidence".to_string(), confident_enough);
        if !confident_enough {
            failures.push(format!(
                "confidence {confidence:.1} below minimum {:.1}",
                self.config.min_confidence
            ));
        }

        let min_rr = self.config.effective_min_risk_reward();
        let rr_ok = entry.as_ref().map(|e| e.risk_reward >= min_rr).unwrap_or(false);
        checks.insert("min_risk_reward".to_string(), rr_ok);
        if !rr_ok {
            match &entry {
                Some(e) => failures.push(format!(
                    "risk/reward {:.2} below minimum {min_rr:.2}",
                    e.risk_reward
                )),
                None => {
                    if directional {
                        missing.push("entry_plan".to_string());
                        failures.push("no entry plan available".to_string());
                    }
                }
            }
        }

        checks.insert("risk_can_trade".to_string(), risk_management.can_trade);
        if !risk_management.can_trade {
            if let Some(reason) = &risk_management.reason {
                failures.push(format!("risk engine: {reason}"));
            }
        }

        let floor_ok = quality
            .confidence_floor
            .map(|floor| confidence >= floor)
            .unwrap_or(true);
        checks.insert("confidence_floor".to_string(), floor_ok);
        if !floor_ok {
            failures.push(format!(
                "confidence {confidence:.1} below data-quality floor {:.1}",
                quality.confidence_floor.unwrap_or(0.0)
            ));
        }

        let breaker_clear = breaker.is_none() && !quality.breaker_activated;
        checks.insert("circuit_breaker".to_string(), breaker_clear);
        if !breaker_clear {
            let reason = breaker
                .map(|b| b.reason.clone())
                .unwrap_or_else(|| "data quality critical".to_string());
            failures.push(format!("pair circuit_breaker active: {reason}"));
        }

        // Conflicting high-impact news: anything imminent/during that does
        // not agree with the signal direction blocks entry.
        let news_clear = !news.high_impact_imminent
            || (directional && news.direction == direction && !news.is_synthetic());
        checks.insert("news_conflict".to_string(), news_clear);
        if !news_clear {
            failures.push("high-impact news imminent or in progress".to_string());
        }

        if quote.is_none() {
            missing.push("fresh_quote".to_string());
        }
        if score.diagnostics.is_some() {
            missing.push("trained_model".to_string());
        }

        let is_valid = checks.values().all(|passed| *passed);
        let reason = failures.first().cloned();
        let decision = if is_valid {
            Decision::allowed()
        } else {
            Decision::blocked(
                checks
                    .iter()
                    .filter(|(_, passed)| !**passed)
                    .map(|(name, _)| name.clone())
                    .collect(),
                missing,
            )
        };

        debug!(
            pair = %pair,
            direction = %direction,
            strength,
            confidence,
            is_valid,
            reason = reason.as_deref().unwrap_or(""),
            "signal combined"
        );

        TradingSignal {
            id: Uuid::new_v4().to_string(),
            pair: pair.clone(),
            ts_ms: now_ms(),
            direction,
            strength,
            confidence,
            final_score: score.final_score,
            components: SignalComponents {
                technical_score: technical.score,
                economic_score: economic.score,
                news_sentiment: news.sentiment,
                scorer_probability: score.probability,
                data_quality_score: Some(quality.overall_score),
            },
            entry,
            risk_management,
            validity: Validity {
                is_valid,
                checks,
                reason,
                decision,
            },
            explainability: Some(score.explanations),
            reasoning: failures,
        }
    }
}

impl std::fmt::Debug for SignalCombiner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalCombiner")
            .field("config", &self.config)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::economic::EconomicSentiment;
    use crate::analysis::news::NewsImpact;
    use crate::analysis::{MarketRegime, VolatilityRegime};
    use crate::market_data::quality::{
        QualityStatus, Recommendation, SpreadClass, WeekendGapClass,
    };
    use crate::risk::RiskConfig;

    fn eurusd() -> Pair {
        Pair::parse("EURUSD").unwrap()
    }

    fn technical(score: f64) -> TechnicalAnalysis {
        let direction = if score >= 20.0 {
            Direction::Buy
        } else if score <= -20.0 {
            Direction::Sell
        } else {
            Direction::Neutral
        };
        TechnicalAnalysis {
            pair: eurusd(),
            generated_at: now_ms(),
            timeframes: Vec::new(),
            score,
            strength: (score.abs() / 1.5).min(100.0),
            direction,
            atr: Some(0.0012),
            last_close: Some(1.0850),
            volatility: VolatilityRegime::Normal,
            regime: MarketRegime::Trending,
            regime_confidence: 0.7,
            volume_pressure: 0.4,
            divergence_count: 0,
            synthetic: false,
        }
    }

    fn economic(score: f64) -> EconomicAnalysis {
        let mut a = EconomicAnalysis::neutral(&eurusd());
        a.score = score;
        a.direction = if score >= 15.0 {
            Direction::Buy
        } else if score <= -15.0 {
            Direction::Sell
        } else {
            Direction::Neutral
        };
        a.sentiment = EconomicSentiment::Neutral;
        a.source = "alphaVantage".into();
        a
    }

    fn news(sentiment: f64, confidence: f64) -> NewsAnalysis {
        let mut a = NewsAnalysis::neutral(&eurusd());
        a.sentiment = sentiment;
        a.confidence = confidence;
        a.direction = if sentiment >= 0.25 {
            Direction::Buy
        } else if sentiment <= -0.25 {
            Direction::Sell
        } else {
            Direction::Neutral
        };
        a.source = "finnhub".into();
        a
    }

    fn healthy_quality() -> QualityReport {
        QualityReport {
            pair: eurusd(),
            generated_at: now_ms(),
            timeframes: Vec::new(),
            overall_score: 95.0,
            spread_pips: Some(0.9),
            spread_class: SpreadClass::Normal,
            weekend_gap: WeekendGapClass::None,
            weekend_gap_pips: 0.0,
            status: QualityStatus::Healthy,
            recommendation: Recommendation::Proceed,
            confidence_floor: None,
            breaker_activated: false,
        }
    }

    fn quote() -> Quote {
        Quote {
            pair: eurusd(),
            bid: 1.08495,
            ask: 1.08505,
            timestamp_ms: now_ms(),
            provider: "test".into(),
        }
    }

    fn combiner() -> (SignalCombiner, Arc<RiskEngine>) {
        let risk = Arc::new(RiskEngine::new(RiskConfig::default()));
        let combiner = SignalCombiner::new(
            Arc::new(AdaptiveScorer::new()),
            CombinerConfig::default(),
        );
        (combiner, risk)
    }

    // Scenario A: strong bullish evidence everywhere and healthy quality
    // yields a valid BUY with RR >= 1.6 and strength >= 70.
    #[test]
    fn happy_buy_signal() {
        let (combiner, risk) = combiner();
        let signal = combiner.combine(
            &eurusd(),
            &technical(80.0),
            &economic(25.0),
            &news(0.7, 70.0),
            &healthy_quality(),
            Some(&quote()),
            None,
            &risk,
        );

        assert_eq!(signal.direction, Direction::Buy);
        assert!(signal.validity.is_valid, "reason: {:?}", signal.validity.reason);
        assert!(signal.strength >= 70.0, "strength {}", signal.strength);
        let entry = signal.entry.as_ref().unwrap();
        assert!(entry.risk_reward >= 1.6);
        assert!(entry.is_coherent(Direction::Buy));
        assert!(entry.trailing_stop);
        assert!(signal.risk_management.can_trade);
        assert_eq!(signal.validity.decision.state, "allowed");
    }

    #[test]
    fn sell_entry_plan_is_reversed() {
        let (combiner, risk) = combiner();
        let signal = combiner.combine(
            &eurusd(),
            &technical(-80.0),
            &economic(-25.0),
            &news(-0.7, 70.0),
            &healthy_quality(),
            Some(&quote()),
            None,
            &risk,
        );
        assert_eq!(signal.direction, Direction::Sell);
        let entry = signal.entry.as_ref().unwrap();
        assert!(entry.is_coherent(Direction::Sell));
    }

    #[test]
    fn neutral_signal_has_no_entry() {
        let (combiner, risk) = combiner();
        let signal = combiner.combine(
            &eurusd(),
            &technical(5.0),
            &economic(0.0),
            &news(0.0, 0.0),
            &healthy_quality(),
            Some(&quote()),
            None,
            &risk,
        );
        assert_eq!(signal.direction, Direction::Neutral);
        assert!(signal.entry.is_none());
        assert!(!signal.validity.is_valid);
        assert_eq!(signal.validity.checks.get("direction"), Some(&false));
    }

    #[test]
    fn confidence_floor_breach_invalidates() {
        let (combiner, risk) = combiner();
        let mut quality = healthy_quality();
        // Spread-critical floor above what the evidence can reach.
        quality.confidence_floor = Some(65.0);

        let signal = combiner.combine(
            &eurusd(),
            &technical(80.0),
            &economic(25.0),
            &news(0.7, 70.0),
            &quality,
            Some(&quote()),
            None,
            &risk,
        );
        assert!(!signal.validity.is_valid);
        assert_eq!(signal.validity.checks.get("confidence_floor"), Some(&false));
        assert!(signal.validity.reason.unwrap().contains("floor"));
    }

    // Invariant 4 at the combiner level: a live breaker invalidates with a
    // circuit_breaker reason.
    #[test]
    fn live_breaker_invalidates() {
        let (combiner, risk) = combiner();
        let breaker = CircuitBreakerRecord {
            reason: "spread:critical (4.5 pips)".into(),
            activated_at: now_ms(),
            expires_at: now_ms() + 600_000,
            context: crate::market_data::quality::BreakerContext {
                score: 40.0,
                spread_pips: Some(4.5),
                weekend_gap_pips: 0.0,
            },
        };
        let signal = combiner.combine(
            &eurusd(),
            &technical(80.0),
            &economic(25.0),
            &news(0.7, 70.0),
            &healthy_quality(),
            Some(&quote()),
            Some(&breaker),
            &risk,
        );
        assert!(!signal.validity.is_valid);
        assert!(signal.validity.reason.unwrap().contains("circuit_breaker"));
        assert_eq!(signal.validity.checks.get("circuit_breaker"), Some(&false));
    }

    #[test]
    fn imminent_conflicting_news_blocks() {
        let (combiner, risk) = combiner();
        let mut conflicted = news(-0.4, 60.0);
        conflicted.high_impact_imminent = true;
        conflicted.impact = NewsImpact::High;

        let signal = combiner.combine(
            &eurusd(),
            &technical(80.0),
            &economic(25.0),
            &conflicted,
            &healthy_quality(),
            Some(&quote()),
            None,
            &risk,
        );
        assert!(!signal.validity.is_valid);
        assert_eq!(signal.validity.checks.get("news_conflict"), Some(&false));
    }

    #[test]
    fn aligned_imminent_news_is_allowed() {
        let (combiner, risk) = combiner();
        let mut aligned = news(0.7, 70.0);
        aligned.high_impact_imminent = true;
        aligned.impact = NewsImpact::High;

        let signal = combiner.combine(
            &eurusd(),
            &technical(80.0),
            &economic(25.0),
            &aligned,
            &healthy_quality(),
            Some(&quote()),
            None,
            &risk,
        );
        assert_eq!(signal.validity.checks.get("news_conflict"), Some(&true));
    }

    #[test]
    fn kill_switch_fails_risk_check() {
        let (combiner, risk) = combiner();
        risk.engage_kill_switch("maintenance");

        let signal = combiner.combine(
            &eurusd(),
            &technical(80.0),
            &economic(25.0),
            &news(0.7, 70.0),
            &healthy_quality(),
            Some(&quote()),
            None,
            &risk,
        );
        assert!(!signal.validity.is_valid);
        assert_eq!(signal.validity.checks.get("risk_can_trade"), Some(&false));
        assert!(!signal.risk_management.can_trade);
    }

    #[test]
    fn strict_mode_raises_rr_bar() {
        let risk = Arc::new(RiskEngine::new(RiskConfig::default()));
        let combiner = SignalCombiner::new(
            Arc::new(AdaptiveScorer::new()),
            CombinerConfig {
                strict_mode: true,
                ..Default::default()
            },
        );
        // Normal-volatility plan has RR ~1.73 which fails the 2.5 bar.
        let signal = combiner.combine(
            &eurusd(),
            &technical(80.0),
            &economic(25.0),
            &news(0.7, 70.0),
            &healthy_quality(),
            Some(&quote()),
            None,
            &risk,
        );
        assert!(!signal.validity.is_valid);
        assert_eq!(signal.validity.checks.get("min_risk_reward"), Some(&false));
    }

    #[test]
    fn missing_model_reported_in_decision() {
        let (combiner, risk) = combiner();
        let signal = combiner.combine(
            &eurusd(),
            &technical(5.0),
            &economic(0.0),
            &news(0.0, 0.0),
            &healthy_quality(),
            None,
            None,
            &risk,
        );
        assert!(signal
            .validity
            .decision
            .missing
            .contains(&"trained_model".to_string()));
        assert!(signal
            .validity
            .decision
            .missing
            .contains(&"fresh_quote".to_string()));
    }
}
