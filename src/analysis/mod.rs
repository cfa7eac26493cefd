// =============================================================================
// Analysis Module — technical / economic / news analyzers and the adaptive
// scorer
// =============================================================================
//
// Each analyzer is an independent collaborator with its own cache and TTL.
// The signal combiner consumes only the result shapes defined here, never
// the analyzer types themselves.

pub mod economic;
pub mod news;
pub mod scorer;
pub mod technical;

use serde::{Deserialize, Serialize};

pub use economic::{EconomicAnalysis, EconomicAnalyzer, EconomicSentiment};
pub use news::{NewsAnalysis, NewsAnalyzer, NewsImpact, NewsTiming};
pub use scorer::{AdaptiveScorer, PairThresholds, ScoreOutput};
pub use technical::{TechnicalAnalysis, TechnicalAnalyzer};

/// Volatility regime derived from ATR relative to price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolatilityRegime {
    Low,
    Normal,
    High,
}

impl std::fmt::Display for VolatilityRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Price-structure regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketRegime {
    Trending,
    Ranging,
    Volatile,
}

impl std::fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trending => write!(f, "trending"),
            Self::Ranging => write!(f, "ranging"),
            Self::Volatile => write!(f, "volatile"),
        }
    }
}
