// =============================================================================
// Adaptive scorer — rule/model ensemble with per-pair thresholds
// =============================================================================
//
// A fixed feature vector is extracted from the analysis artifacts. The rule
// path combines economic, news and technical evidence (default weights
// 20/20/60) through a temperature sigmoid; when trained tree geometry is
// loaded, the model probability is blended in. Per-pair thresholds map the
// final probability onto BUY / SELL / NEUTRAL.
//
//   confidence = min(99.5, |p - 0.5| * 190)
//   finalScore = (p - 0.5) * 200
//
// Missing model geometry degrades to rule-only mode and is reported via
// `diagnostics.reason = model_untrained`. Thresholds are bounded and
// optimised offline by an F1-maximising grid search over labeled history.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::analysis::economic::EconomicAnalysis;
use crate::analysis::news::{NewsAnalysis, NewsImpact};
use crate::analysis::technical::TechnicalAnalysis;
use crate::types::{Direction, Pair};

/// Fixed feature ordering shared by the rule path, the tree model and any
/// offline training pipeline.
pub const FEATURE_KEYS: &[&str] = &[
    "economic_direction",
    "economic_score",
    "news_sentiment",
    "news_impact",
    "news_direction",
    "technical_score",
    "technical_strength",
    "technical_direction",
    "regime_confidence",
    "regime_slope",
    "volatility",
    "volume_pressure",
    "divergence_load",
    "direction_consensus",
];

/// Threshold bounds.
const BUY_MIN: f64 = 0.52;
const BUY_MAX: f64 = 0.75;
const SELL_MIN: f64 = 0.25;
const SELL_MAX: f64 = 0.48;

// ---------------------------------------------------------------------------
// Model geometry (JSON-persisted)
// ---------------------------------------------------------------------------

/// One node of a decision tree. Negative child indices mark leaves whose
/// value is in `leaf`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeNode {
    pub feature: usize,
    pub threshold: f64,
    pub left: i32,
    pub right: i32,
    #[serde(default)]
    pub leaf: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tree {
    pub nodes: Vec<TreeNode>,
}

impl Tree {
    /// Walk the tree for one feature vector.
    fn predict(&self, features: &[f64]) -> f64 {
        let mut idx = 0usize;
        loop {
            let Some(node) = self.nodes.get(idx) else {
                return 0.0;
            };
            if let Some(leaf) = node.leaf {
                return leaf;
            }
            let value = features.get(node.feature).copied().unwrap_or(0.0);
            let next = if value <= node.threshold {
                node.left
            } else {
                node.right
            };
            if next < 0 {
                return 0.0;
            }
            idx = next as usize;
        }
    }
}

/// Learned ensemble geometry, persisted as a JSON blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScorerModel {
    pub trees: Vec<Tree>,
    pub learning_rate: f64,
    pub base_score: f64,
    pub feature_keys: Vec<String>,
}

impl ScorerModel {
    /// Raw-margin prediction mapped through a sigmoid.
    pub fn predict_probability(&self, features: &[f64]) -> f64 {
        let margin: f64 = self
            .trees
            .iter()
            .map(|t| t.predict(features) * self.learning_rate)
            .sum::<f64>()
            + self.base_score;
        sigmoid(margin)
    }
}

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

/// Per-pair probability thresholds with the F1 score achieved during
/// optimisation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairThresholds {
    pub buy: f64,
    pub sell: f64,
    pub score: f64,
}

impl Default for PairThresholds {
    fn default() -> Self {
        Self {
            buy: 0.58,
            sell: 0.42,
            score: 0.0,
        }
    }
}

impl PairThresholds {
    /// Clamp into the configured bounds.
    fn bounded(self) -> Self {
        Self {
            buy: self.buy.clamp(BUY_MIN, BUY_MAX),
            sell: self.sell.clamp(SELL_MIN, SELL_MAX),
            score: self.score,
        }
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScorerDiagnostics {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreOutput {
    pub probability: f64,
    pub direction: Direction,
    /// Calibrated confidence in [0, 99.5].
    pub confidence: f64,
    /// Final score in [-100, 100].
    pub final_score: f64,
    pub thresholds: PairThresholds,
    pub explanations: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<ScorerDiagnostics>,
}

// ---------------------------------------------------------------------------
// Scorer
// ---------------------------------------------------------------------------

/// Rule-path weights.
#[derive(Debug, Clone, Copy)]
pub struct RuleWeights {
    pub economic: f64,
    pub news: f64,
    pub technical: f64,
}

impl Default for RuleWeights {
    fn default() -> Self {
        Self {
            economic: 0.20,
            news: 0.20,
            technical: 0.60,
        }
    }
}

pub struct AdaptiveScorer {
    weights: RuleWeights,
    /// Sigmoid steepness for the rule score (rule score lives in [-1, 1]).
    temperature: f64,
    /// Ensemble blend weights.
    w_rule: f64,
    w_model: f64,
    model: RwLock<Option<ScorerModel>>,
    thresholds: RwLock<HashMap<Pair, PairThresholds>>,
}

impl AdaptiveScorer {
    pub fn new() -> Self {
        Self {
            weights: RuleWeights::default(),
            temperature: 3.0,
            w_rule: 0.6,
            w_model: 0.4,
            model: RwLock::new(None),
            thresholds: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_weights(mut self, weights: RuleWeights) -> Self {
        self.weights = weights;
        self
    }

    /// Lazily load tree geometry from a JSON file. Missing or malformed
    /// files leave the scorer in rule-only mode.
    pub fn load_model(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read scorer model from {}", path.display()))?;
        let model: ScorerModel = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse scorer model from {}", path.display()))?;
        info!(
            path = %path.display(),
            trees = model.trees.len(),
            "scorer model loaded"
        );
        *self.model.write() = Some(model);
        Ok(())
    }

    /// Install model geometry directly (used by tests and training jobs).
    pub fn set_model(&self, model: ScorerModel) {
        *self.model.write() = Some(model);
    }

    /// Whether tree geometry is loaded (rule-only mode otherwise).
    pub fn model_loaded(&self) -> bool {
        self.model
            .read()
            .as_ref()
            .map(|m| !m.trees.is_empty())
            .unwrap_or(false)
    }

    /// Install optimised thresholds for a pair (bounded).
    pub fn set_thresholds(&self, pair: &Pair, thresholds: PairThresholds) {
        self.thresholds
            .write()
            .insert(pair.clone(), thresholds.bounded());
    }

    pub fn thresholds_for(&self, pair: &Pair) -> PairThresholds {
        self.thresholds
            .read()
            .get(pair)
            .copied()
            .unwrap_or_default()
    }

    // -------------------------------------------------------------------------
    // Scoring
    // -------------------------------------------------------------------------

    /// Score the combined evidence for a pair.
    pub fn score(
        &self,
        pair: &Pair,
        technical: &TechnicalAnalysis,
        economic: &EconomicAnalysis,
        news: &NewsAnalysis,
    ) -> ScoreOutput {
        let features = extract_features(technical, economic, news);

        // Rule path: normalised component scores, synthetic evidence
        // contributes nothing.
        let economic_norm = if economic.is_synthetic() {
            0.0
        } else {
            economic.score / 100.0
        };
        let news_norm = if news.is_synthetic() { 0.0 } else { news.sentiment };
        let technical_norm = technical.score / 150.0;

        let rule_score = self.weights.economic * economic_norm
            + self.weights.news * news_norm
            + self.weights.technical * technical_norm;
        let rule_prob = sigmoid(rule_score * self.temperature);

        let mut explanations = vec![
            format!("economic {economic_norm:+.2} (w {:.2})", self.weights.economic),
            format!("news {news_norm:+.2} (w {:.2})", self.weights.news),
            format!("technical {technical_norm:+.2} (w {:.2})", self.weights.technical),
        ];

        // Ensemble with the learned model when geometry is available.
        let model_guard = self.model.read();
        let (probability, diagnostics) = match model_guard.as_ref() {
            Some(model) if !model.trees.is_empty() => {
                let model_prob = model.predict_probability(&features);
                explanations.push(format!(
                    "ensemble rule {rule_prob:.3} / model {model_prob:.3}"
                ));
                let blended = (self.w_rule * rule_prob + self.w_model * model_prob)
                    / (self.w_rule + self.w_model);
                (blended, None)
            }
            _ => (
                rule_prob,
                Some(ScorerDiagnostics {
                    reason: "model_untrained".to_string(),
                }),
            ),
        };
        drop(model_guard);

        let thresholds = self.thresholds_for(pair);
        let direction = if probability >= thresholds.buy {
            Direction::Buy
        } else if probability <= thresholds.sell {
            Direction::Sell
        } else {
            Direction::Neutral
        };

        let confidence = ((probability - 0.5).abs() * 190.0).min(99.5);
        let final_score = (probability - 0.5) * 200.0;

        debug!(
            pair = %pair,
            probability,
            direction = %direction,
            confidence,
            "scoring complete"
        );

        ScoreOutput {
            probability,
            direction,
            confidence,
            final_score,
            thresholds,
            explanations,
            diagnostics,
        }
    }
}

impl Default for AdaptiveScorer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AdaptiveScorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveScorer")
            .field("model_loaded", &self.model.read().is_some())
            .field("pairs_with_thresholds", &self.thresholds.read().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Feature extraction
// ---------------------------------------------------------------------------

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Extract the fixed feature vector in `FEATURE_KEYS` order.
pub fn extract_features(
    technical: &TechnicalAnalysis,
    economic: &EconomicAnalysis,
    news: &NewsAnalysis,
) -> Vec<f64> {
    let news_impact = match news.impact {
        NewsImpact::Low => 0.0,
        NewsImpact::Medium => 0.5,
        NewsImpact::High => 1.0,
    };

    let volatility = match technical.volatility {
        crate::analysis::VolatilityRegime::Low => 0.0,
        crate::analysis::VolatilityRegime::Normal => 0.5,
        crate::analysis::VolatilityRegime::High => 1.0,
    };

    // Slope proxy: signed regime confidence in the technical direction.
    let regime_slope = technical.regime_confidence * technical.direction.sign();

    let votes = [
        economic.direction.sign(),
        news.direction.sign(),
        technical.direction.sign(),
    ];
    let direction_consensus = votes.iter().sum::<f64>() / votes.len() as f64;

    vec![
        economic.direction.sign(),
        economic.score / 100.0,
        news.sentiment,
        news_impact,
        news.direction.sign(),
        technical.score / 150.0,
        technical.strength / 100.0,
        technical.direction.sign(),
        technical.regime_confidence,
        regime_slope,
        volatility,
        technical.volume_pressure,
        technical.divergence_count as f64,
        direction_consensus,
    ]
}

// ---------------------------------------------------------------------------
// Offline threshold optimisation
// ---------------------------------------------------------------------------

/// One labeled sample: the scored probability and whether a BUY (or SELL)
/// at that moment would have won.
#[derive(Debug, Clone, Copy)]
pub struct LabeledSample {
    pub probability: f64,
    pub outcome: Direction,
}

/// F1-maximising grid search over the bounded threshold ranges.
pub fn optimize_thresholds(samples: &[LabeledSample]) -> PairThresholds {
    if samples.is_empty() {
        return PairThresholds::default();
    }

    let mut best = PairThresholds::default();
    let mut best_f1 = -1.0;

    let mut buy = BUY_MIN;
    while buy <= BUY_MAX + 1e-9 {
        let mut sell = SELL_MIN;
        while sell <= SELL_MAX + 1e-9 {
            let f1 = combined_f1(samples, buy, sell);
            if f1 > best_f1 {
                best_f1 = f1;
                best = PairThresholds {
                    buy,
                    sell,
                    score: f1,
                };
            }
            sell += 0.01;
        }
        buy += 0.01;
    }

    if best_f1 <= 0.0 {
        warn!("threshold optimisation found no predictive cut — keeping defaults");
        return PairThresholds::default();
    }
    best.bounded()
}

/// Mean of the BUY-side and SELL-side F1 scores for one threshold pair.
fn combined_f1(samples: &[LabeledSample], buy: f64, sell: f64) -> f64 {
    let f1_side = |predict: &dyn Fn(f64) -> bool, truth: Direction| {
        let mut tp = 0.0;
        let mut fp = 0.0;
        let mut fn_ = 0.0;
        for s in samples {
            let predicted = predict(s.probability);
            let actual = s.outcome == truth;
            match (predicted, actual) {
                (true, true) => tp += 1.0,
                (true, false) => fp += 1.0,
                (false, true) => fn_ += 1.0,
                (false, false) => {}
            }
        }
        if tp == 0.0 {
            return 0.0;
        }
        let precision = tp / (tp + fp);
        let recall = tp / (tp + fn_);
        2.0 * precision * recall / (precision + recall)
    };

    let buy_f1 = f1_side(&|p| p >= buy, Direction::Buy);
    let sell_f1 = f1_side(&|p| p <= sell, Direction::Sell);
    (buy_f1 + sell_f1) / 2.0
}
