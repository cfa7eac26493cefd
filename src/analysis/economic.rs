// =============================================================================
// Economic analyzer — macro indicator differential per currency
// =============================================================================
//
// Six macro series per currency (GDP growth, inflation, interest rate,
// unemployment, retail sales, manufacturing) each pass through a specific
// impact function; the weighted sum is clipped to [-100, 100]. A pair's
// score is the base-minus-quote differential.
//
// US series come from the Alpha Vantage economic endpoints. Currencies
// without a configured source produce a synthetic neutral result tagged
// `source: synthetic:economic` which downstream logic treats as
// non-confirming evidence.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{now_ms, Direction, Pair};

/// Cache TTL for economic analyses.
const CACHE_TTL_MS: i64 = 3600 * 1000;

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EconomicSentiment {
    StronglyBearish,
    Bearish,
    Neutral,
    Bullish,
    StronglyBullish,
}

impl EconomicSentiment {
    fn from_score(score: f64) -> Self {
        if score >= 50.0 {
            Self::StronglyBullish
        } else if score >= 15.0 {
            Self::Bullish
        } else if score > -15.0 {
            Self::Neutral
        } else if score > -50.0 {
            Self::Bearish
        } else {
            Self::StronglyBearish
        }
    }
}

/// One macro indicator reading with its computed impact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EconomicIndicator {
    pub name: String,
    pub value: f64,
    pub impact: f64,
}

/// Indicator set and aggregate score for one currency.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrencyIndicators {
    pub currency: String,
    pub indicators: Vec<EconomicIndicator>,
    /// Weighted impact sum in [-100, 100].
    pub score: f64,
    pub synthetic: bool,
}

/// Economic analysis of one pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EconomicAnalysis {
    pub pair: Pair,
    pub generated_at: i64,
    pub base: CurrencyIndicators,
    pub quote: CurrencyIndicators,
    /// Base-minus-quote differential, clipped to [-100, 100].
    pub score: f64,
    pub sentiment: EconomicSentiment,
    pub direction: Direction,
    /// `alphaVantage`, `synthetic:economic`, or a mix marker.
    pub source: String,
}

impl EconomicAnalysis {
    pub fn is_synthetic(&self) -> bool {
        self.source.starts_with("synthetic")
    }

    /// A fully neutral synthetic analysis.
    pub fn neutral(pair: &Pair) -> Self {
        Self {
            pair: pair.clone(),
            generated_at: now_ms(),
            base: neutral_currency(pair.base()),
            quote: neutral_currency(pair.quote()),
            score: 0.0,
            sentiment: EconomicSentiment::Neutral,
            direction: Direction::Neutral,
            source: "synthetic:economic".to_string(),
        }
    }
}

fn neutral_currency(currency: &str) -> CurrencyIndicators {
    CurrencyIndicators {
        currency: currency.to_string(),
        indicators: Vec::new(),
        score: 0.0,
        synthetic: true,
    }
}

// ---------------------------------------------------------------------------
// Impact functions
// ---------------------------------------------------------------------------

/// (name, Alpha Vantage function, weight, impact function)
type ImpactFn = fn(f64) -> f64;

const SERIES: &[(&str, &str, f64, ImpactFn)] = &[
    ("gdp_growth", "REAL_GDP", 0.20, impact_gdp),
    ("inflation", "INFLATION", 0.15, impact_inflation),
    ("interest_rate", "FEDERAL_FUNDS_RATE", 0.30, impact_interest_rate),
    ("unemployment", "UNEMPLOYMENT", 0.15, impact_unemployment),
    ("retail_sales", "RETAIL_SALES", 0.10, impact_retail_sales),
    ("manufacturing", "DURABLES", 0.10, impact_manufacturing),
];

/// Growth above a 2% baseline strengthens the currency.
fn impact_gdp(growth_pct: f64) -> f64 {
    ((growth_pct - 2.0) * 15.0).clamp(-40.0, 40.0)
}

/// Distance from the 2% target is destabilising either way.
fn impact_inflation(inflation_pct: f64) -> f64 {
    let deviation = (inflation_pct - 2.0).abs();
    ((1.0 - deviation) * 12.0).clamp(-30.0, 12.0)
}

/// Higher policy rates attract carry flows.
fn impact_interest_rate(rate_pct: f64) -> f64 {
    ((rate_pct - 2.5) * 10.0).clamp(-40.0, 40.0)
}

/// Lower unemployment strengthens the currency.
fn impact_unemployment(unemployment_pct: f64) -> f64 {
    ((4.5 - unemployment_pct) * 8.0).clamp(-35.0, 35.0)
}

/// Year-over-year retail sales growth.
fn impact_retail_sales(growth_pct: f64) -> f64 {
    (growth_pct * 4.0).clamp(-25.0, 25.0)
}

/// Durable-goods orders growth as a manufacturing proxy.
fn impact_manufacturing(growth_pct: f64) -> f64 {
    (growth_pct * 3.0).clamp(-20.0, 20.0)
}

/// Combine indicator impacts into the currency score.
pub fn score_currency(indicators: &[EconomicIndicator]) -> f64 {
    if indicators.is_empty() {
        return 0.0;
    }
    let mut total = 0.0;
    let mut weight_sum = 0.0;
    for ind in indicators {
        let weight = SERIES
            .iter()
            .find(|(name, ..)| *name == ind.name)
            .map(|(_, _, w, _)| *w)
            .unwrap_or(0.1);
        total += ind.impact * weight;
        weight_sum += weight;
    }
    if weight_sum == 0.0 {
        return 0.0;
    }
    // Impacts are bounded around ±40; the weighted mean scales into ±100.
    (total / weight_sum * 2.5).clamp(-100.0, 100.0)
}

// ---------------------------------------------------------------------------
// Analyzer
// ---------------------------------------------------------------------------

pub struct EconomicAnalyzer {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    cache: RwLock<HashMap<Pair, Arc<EconomicAnalysis>>>,
}

impl EconomicAnalyzer {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client"),
            api_key,
            base_url: "https://www.alphavantage.co".to_string(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Analyze the macro backdrop of a pair, cached for an hour.
    pub async fn analyze(&self, pair: &Pair) -> Arc<EconomicAnalysis> {
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

    async fn build(&self, pair: &Pair, now: i64) -> EconomicAnalysis {
        let base = self.currency_indicators(pair.base()).await;
        let quote = self.currency_indicators(pair.quote()).await;

        // Fully synthetic inputs yield a neutral, clearly-tagged result.
        if base.synthetic && quote.synthetic {
            return EconomicAnalysis::neutral(pair);
        }

        let score = (base.score - quote.score).clamp(-100.0, 100.0);
        let direction = if score >= 15.0 {
            Direction::Buy
        } else if score <= -15.0 {
            Direction::Sell
        } else {
            Direction::Neutral
        };

        let source = if base.synthetic || quote.synthetic {
            "alphaVantage+synthetic".to_string()
        } else {
            "alphaVantage".to_string()
        };

        debug!(pair = %pair, score, source = %source, "economic analysis complete");

        EconomicAnalysis {
            pair: pair.clone(),
            generated_at: now,
            sentiment: EconomicSentiment::from_score(score),
            base,
            quote,
            score,
            direction,
            source,
        }
    }

    /// Fetch the macro indicator set for one currency. Only USD has a
    /// configured source; everything else is synthetic-neutral.
    async fn currency_indicators(&self, currency: &str) -> CurrencyIndicators {
        let Some(key) = self.api_key.as_deref() else {
            return neutral_currency(currency);
        };
        if currency != "USD" {
            return neutral_currency(currency);
        }

        let mut indicators = Vec::new();
        for (name, function, _, impact_fn) in SERIES {
            match self.fetch_latest_value(function, key).await {
                Some(value) => indicators.push(EconomicIndicator {
                    name: name.to_string(),
                    value,
                    impact: impact_fn(value),
                }),
                None => {
                    warn!(currency, series = name, "economic series unavailable");
                }
            }
        }

        if indicators.is_empty() {
            return neutral_currency(currency);
        }

        let score = score_currency(&indicators);
        CurrencyIndicators {
            currency: currency.to_string(),
            indicators,
            score,
            synthetic: false,
        }
    }

    /// Latest data point of an Alpha Vantage economic series.
    async fn fetch_latest_value(&self, function: &str, key: &str) -> Option<f64> {
        let url = format!("{}/query?function={}&apikey={}", self.base_url, function, key);
        let resp = self.client.get(&url).send().await.ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let body: serde_json::Value = resp.json().await.ok()?;
        body.get("data")?
            .as_array()?
            .first()?
            .get("value")?
            .as_str()?
            .parse()
            .ok()
    }
}

impl std::fmt::Debug for EconomicAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EconomicAnalyzer")
            .field("api_key", &"<redacted>")
            .field("cached", &self.cache.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn impact_functions_signs() {
        assert!(impact_gdp(3.5) > 0.0);
        assert!(impact_gdp(0.5) < 0.0);
        assert!(impact_interest_rate(5.0) > 0.0);
        assert!(impact_interest_rate(0.5) < 0.0);
        assert!(impact_unemployment(3.5) > 0.0);
        assert!(impact_unemployment(7.0) < 0.0);
        assert!(impact_inflation(2.0) > 0.0);
        assert!(impact_inflation(8.0) < 0.0);
        assert!(impact_retail_sales(-3.0) < 0.0);
        assert!(impact_manufacturing(2.0) > 0.0);
    }

    #[test]
    fn impacts_are_bounded() {
        for v in [-100.0, -10.0, 0.0, 10.0, 100.0] {
            assert!(impact_gdp(v).abs() <= 40.0);
            assert!(impact_interest_rate(v).abs() <= 40.0);
            assert!(impact_unemployment(v).abs() <= 35.0);
            assert!(impact_retail_sales(v).abs() <= 25.0);
        }
    }

    #[test]
    fn currency_score_clipped() {
        let strong: Vec<EconomicIndicator> = vec![
            EconomicIndicator { name: "gdp_growth".into(), value: 6.0, impact: 40.0 },
            EconomicIndicator { name: "interest_rate".into(), value: 7.0, impact: 40.0 },
            EconomicIndicator { name: "unemployment".into(), value: 3.0, impact: 35.0 },
        ];
        let score = score_currency(&strong);
        assert!(score > 50.0 && score <= 100.0);
        assert_eq!(score_currency(&[]), 0.0);
    }

    #[test]
    fn sentiment_buckets() {
        assert_eq!(EconomicSentiment::from_score(60.0), EconomicSentiment::StronglyBullish);
        assert_eq!(EconomicSentiment::from_score(20.0), EconomicSentiment::Bullish);
        assert_eq!(EconomicSentiment::from_score(0.0), EconomicSentiment::Neutral);
        assert_eq!(EconomicSentiment::from_score(-20.0), EconomicSentiment::Bearish);
        assert_eq!(EconomicSentiment::from_score(-80.0), EconomicSentiment::StronglyBearish);
    }

    #[tokio::test]
    async fn unconfigured_analyzer_is_synthetic_neutral() {
        let analyzer = EconomicAnalyzer::new(None);
        let pair = Pair::parse("EURUSD").unwrap();
        let analysis = analyzer.analyze(&pair).await;
        assert!(analysis.is_synthetic());
        assert_eq!(analysis.direction, Direction::Neutral);
        assert_eq!(analysis.score, 0.0);
        assert_eq!(analysis.sentiment, EconomicSentiment::Neutral);
    }

    #[tokio::test]
    async fn cache_returns_same_object() {
        let analyzer = EconomicAnalyzer::new(None);
        let pair = Pair::parse("EURUSD").unwrap();
        let a = analyzer.analyze(&pair).await;
        let b = analyzer.analyze(&pair).await;
        assert!(Arc::ptr_eq(&a, &b));
    }
}
