// =============================================================================
// News & sentiment analyzer — headline classification and composite score
// =============================================================================
//
// Headlines are classified into {type, impact, timing, recommended actions,
// volatility multiplier} by keyword rules, then aggregated per pair into a
// composite sentiment: social 30%, COT positioning 40%, options flow 30%,
// confidence-weighted by each component's own confidence.
//
// When the news source key is missing or the source is in backoff the
// analyzer emits a synthetic neutral result tagged `source: synthetic:news`.
// Downstream logic treats synthetic results as non-confirming evidence.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::persistence::{NewsRecord, PersistenceAdapter};
use crate::types::{now_ms, Direction, Pair};

/// Cache TTL for news analyses.
const CACHE_TTL_MS: i64 = 10 * 60 * 1000;
/// Headlines considered per analysis.
const MAX_HEADLINES: usize = 30;

// ---------------------------------------------------------------------------
// Classification model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NewsImpact {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NewsTiming {
    Past,
    Imminent,
    During,
    Scheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NewsKind {
    RateDecision,
    EconomicData,
    CentralBankSpeech,
    Geopolitical,
    MarketSentiment,
    Other,
}

/// Classification of one headline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeadlineClassification {
    #[serde(rename = "type")]
    pub kind: NewsKind,
    pub impact_level: NewsImpact,
    pub timing: NewsTiming,
    pub recommended_actions: Vec<String>,
    pub volatility_multiplier: f64,
}

/// One analyzed headline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzedHeadline {
    pub headline: String,
    pub published_at: i64,
    pub classification: HeadlineClassification,
    /// Sentiment in [-1, 1].
    pub sentiment: f64,
}

/// A scored composite component (social / COT / options flow).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentimentComponent {
    /// Score in [-1, 1].
    pub score: f64,
    /// Confidence in [0, 1].
    pub confidence: f64,
    pub synthetic: bool,
}

impl SentimentComponent {
    fn synthetic_neutral() -> Self {
        Self {
            score: 0.0,
            confidence: 0.0,
            synthetic: true,
        }
    }
}

/// News analysis of one pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewsAnalysis {
    pub pair: Pair,
    pub generated_at: i64,
    pub items: Vec<AnalyzedHeadline>,
    /// Composite sentiment in [-1, 1].
    pub sentiment: f64,
    /// Confidence in [0, 100].
    pub confidence: f64,
    pub direction: Direction,
    pub impact: NewsImpact,
    /// True when a high-impact item is imminent or in progress.
    pub high_impact_imminent: bool,
    pub social: SentimentComponent,
    pub cot: SentimentComponent,
    pub options_flow: SentimentComponent,
    pub volatility_multiplier: f64,
    pub source: String,
}

impl NewsAnalysis {
    pub fn is_synthetic(&self) -> bool {
        self.source.starts_with("synthetic")
    }

    pub fn neutral(pair: &Pair) -> Self {
        Self {
            pair: pair.clone(),
            generated_at: now_ms(),
            items: Vec::new(),
            sentiment: 0.0,
            confidence: 0.0,
            direction: Direction::Neutral,
            impact: NewsImpact::Low,
            high_impact_imminent: false,
            social: SentimentComponent::synthetic_neutral(),
            cot: SentimentComponent::synthetic_neutral(),
            options_flow: SentimentComponent::synthetic_neutral(),
            volatility_multiplier: 1.0,
            source: "synthetic:news".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Pure classification
// ---------------------------------------------------------------------------

const HIGH_IMPACT_KEYWORDS: &[&str] = &[
    "rate decision", "interest rate", "fomc", "ecb", "boe", "boj", "nfp",
    "non-farm", "nonfarm", "cpi", "inflation", "gdp",
];
const MEDIUM_IMPACT_KEYWORDS: &[&str] = &[
    "retail sales", "unemployment", "pmi", "trade balance", "sentiment",
    "confidence", "manufacturing",
];
const BULLISH_KEYWORDS: &[&str] = &[
    "beats", "beat", "surges", "rallies", "strong", "hawkish", "raises",
    "growth", "higher than expected", "upbeat",
];
const BEARISH_KEYWORDS: &[&str] = &[
    "misses", "miss", "plunges", "falls", "weak", "dovish", "cuts",
    "recession", "lower than expected", "downbeat", "crisis", "war",
];

/// Classify one headline by keyword rules. Pure.
pub fn classify_headline(headline: &str, published_at: i64, now: i64) -> HeadlineClassification {
    let lower = headline.to_lowercase();

    let kind = if lower.contains("rate decision")
        || lower.contains("fomc")
        || ((lower.contains("rate") || lower.contains("rates")) && lower.contains("decision"))
    {
        NewsKind::RateDecision
    } else if lower.contains("speech")
        || lower.contains("testimony")
        || lower.contains("powell")
        || lower.contains("lagarde")
    {
        NewsKind::CentralBankSpeech
    } else if lower.contains("war")
        || lower.contains("election")
        || lower.contains("sanctions")
        || lower.contains("crisis")
    {
        NewsKind::Geopolitical
    } else if HIGH_IMPACT_KEYWORDS.iter().any(|k| lower.contains(k))
        || MEDIUM_IMPACT_KEYWORDS.iter().any(|k| lower.contains(k))
    {
        NewsKind::EconomicData
    } else if lower.contains("sentiment") || lower.contains("positioning") {
        NewsKind::MarketSentiment
    } else {
        NewsKind::Other
    };

    let impact_level = if matches!(kind, NewsKind::RateDecision | NewsKind::Geopolitical)
        || HIGH_IMPACT_KEYWORDS.iter().any(|k| lower.contains(k))
    {
        NewsImpact::High
    } else if MEDIUM_IMPACT_KEYWORDS.iter().any(|k| lower.contains(k))
        || kind == NewsKind::CentralBankSpeech
    {
        NewsImpact::Medium
    } else {
        NewsImpact::Low
    };

    // Timing relative to publication: events published in the future are
    // scheduled; within the last 30 minutes they are in progress; within
    // the next 2 hours imminent.
    let age_ms = now - published_at;
    let timing = if age_ms < -2 * 3600 * 1000 {
        NewsTiming::Scheduled
    } else if age_ms < 0 {
        NewsTiming::Imminent
    } else if age_ms < 30 * 60 * 1000 {
        NewsTiming::During
    } else {
        NewsTiming::Past
    };

    let volatility_multiplier = match impact_level {
        NewsImpact::High => 1.8,
        NewsImpact::Medium => 1.3,
        NewsImpact::Low => 1.0,
    };

    let mut recommended_actions = Vec::new();
    if impact_level == NewsImpact::High
        && matches!(timing, NewsTiming::Imminent | NewsTiming::During)
    {
        recommended_actions.push("suspend_new_entries".to_string());
        recommended_actions.push("widen_stops".to_string());
    } else if impact_level == NewsImpact::High {
        recommended_actions.push("reduce_position_size".to_string());
    }

    HeadlineClassification {
        kind,
        impact_level,
        timing,
        recommended_actions,
        volatility_multiplier,
    }
}

/// Keyword sentiment in [-1, 1]. Pure.
pub fn headline_sentiment(headline: &str) -> f64 {
    let lower = headline.to_lowercase();
    let bullish = BULLISH_KEYWORDS.iter().filter(|k| lower.contains(*k)).count() as f64;
    let bearish = BEARISH_KEYWORDS.iter().filter(|k| lower.contains(*k)).count() as f64;
    let total = bullish + bearish;
    if total == 0.0 {
        0.0
    } else {
        ((bullish - bearish) / total).clamp(-1.0, 1.0)
    }
}

/// Composite: social 30%, COT 40%, options flow 30%, each weighted by its
/// own confidence. Synthetic components contribute nothing.
pub fn composite_sentiment(
    social: &SentimentComponent,
    cot: &SentimentComponent,
    options_flow: &SentimentComponent,
) -> (f64, f64) {
    let parts = [(social, 0.30), (cot, 0.40), (options_flow, 0.30)];
    let mut weighted = 0.0;
    let mut confidence_mass = 0.0;
    let mut weight_mass = 0.0;

    for (component, weight) in parts {
        if component.synthetic {
            continue;
        }
        weighted += component.score * component.confidence * weight;
        confidence_mass += component.confidence * weight;
        weight_mass += weight;
    }

    if confidence_mass == 0.0 {
        return (0.0, 0.0);
    }
    let sentiment = (weighted / confidence_mass).clamp(-1.0, 1.0);
    let confidence = (confidence_mass / weight_mass * 100.0).clamp(0.0, 100.0);
    (sentiment, confidence)
}

// ---------------------------------------------------------------------------
// Analyzer
// ---------------------------------------------------------------------------

pub struct NewsAnalyzer {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    persistence: Option<Arc<PersistenceAdapter>>,
    cache: RwLock<HashMap<Pair, Arc<NewsAnalysis>>>,
}

impl NewsAnalyzer {
    pub fn new(api_key: Option<String>, persistence: Option<Arc<PersistenceAdapter>>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client"),
            api_key,
            base_url: "https://finnhub.io/api/v1".to_string(),
            persistence,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Analyze news flow for a pair, cached for 10 minutes.
    pub async fn analyze(&self, pair: &Pair) -> Arc<NewsAnalysis> {
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

    async fn build(&self, pair: &Pair, now: i64) -> NewsAnalysis {
        let headlines = match self.fetch_headlines(pair).await {
            Some(h) if !h.is_empty() => h,
            _ => return NewsAnalysis::neutral(pair),
        };

        let items: Vec<AnalyzedHeadline> = headlines
            .into_iter()
            .take(MAX_HEADLINES)
            .map(|(headline, published_at)| AnalyzedHeadline {
                classification: classify_headline(&headline, published_at, now),
                sentiment: headline_sentiment(&headline),
                headline,
                published_at,
            })
            .collect();

        // Persist raw events best-effort.
        if let Some(persistence) = &self.persistence {
            let records: Vec<NewsRecord> = items
                .iter()
                .map(|item| NewsRecord {
                    id: news_id(&item.headline, item.published_at),
                    pair: pair.to_string(),
                    headline: item.headline.clone(),
                    payload: serde_json::to_value(&item.classification)
                        .unwrap_or(serde_json::Value::Null),
                    published_at: item.published_at,
                })
                .collect();
            let _ = persistence.record_news_items(&records);
        }

        // Social component from headline sentiment; COT and options flow
        // have no configured source and stay synthetic-neutral.
        let mean_sentiment =
            items.iter().map(|i| i.sentiment).sum::<f64>() / items.len().max(1) as f64;
        let opinionated = items.iter().filter(|i| i.sentiment != 0.0).count();
        let social = SentimentComponent {
            score: mean_sentiment,
            confidence: (opinionated as f64 / items.len().max(1) as f64).min(1.0),
            synthetic: false,
        };
        let cot = SentimentComponent::synthetic_neutral();
        let options_flow = SentimentComponent::synthetic_neutral();

        let (sentiment, confidence) = composite_sentiment(&social, &cot, &options_flow);

        let impact = items
            .iter()
            .map(|i| i.classification.impact_level)
            .max()
            .unwrap_or(NewsImpact::Low);
        let high_impact_imminent = items.iter().any(|i| {
            i.classification.impact_level == NewsImpact::High
                && matches!(
                    i.classification.timing,
                    NewsTiming::Imminent | NewsTiming::During
                )
        });
        let volatility_multiplier = items
            .iter()
            .map(|i| i.classification.volatility_multiplier)
            .fold(1.0, f64::max);

        let direction = if sentiment >= 0.25 {
            Direction::Buy
        } else if sentiment <= -0.25 {
            Direction::Sell
        } else {
            Direction::Neutral
        };

        debug!(
            pair = %pair,
            items = items.len(),
            sentiment,
            confidence,
            high_impact_imminent,
            "news analysis complete"
        );

        NewsAnalysis {
            pair: pair.clone(),
            generated_at: now,
            items,
            sentiment,
            confidence,
            direction,
            impact,
            high_impact_imminent,
            social,
            cot,
            options_flow,
            volatility_multiplier,
            source: "finnhub".to_string(),
        }
    }

    /// Fetch (headline, published_at_ms) pairs from the news endpoint.
    async fn fetch_headlines(&self, pair: &Pair) -> Option<Vec<(String, i64)>> {
        let key = self.api_key.as_deref()?;
        let url = format!("{}/news?category=forex&token={}", self.base_url, key);

        let resp = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(pair = %pair, error = %e, "news fetch failed");
                return None;
            }
        };
        if !resp.status().is_success() {
            warn!(pair = %pair, status = %resp.status(), "news endpoint returned error");
            return None;
        }

        let body: serde_json::Value = resp.json().await.ok()?;
        let items = body.as_array()?;

        let base = pair.base().to_lowercase();
        let quote = pair.quote().to_lowercase();
        let mut headlines = Vec::new();
        for item in items {
            let Some(headline) = item.get("headline").and_then(|v| v.as_str()) else {
                continue;
            };
            let headline = headline.to_string();
            let published_at = item
                .get("datetime")
                .and_then(|v| v.as_i64())
                .map(|secs| secs * 1000)
                .unwrap_or_else(now_ms);

            // Keep pair-relevant and broad-market headlines.
            let lower = headline.to_lowercase();
            let relevant = lower.contains(&base)
                || lower.contains(&quote)
                || HIGH_IMPACT_KEYWORDS.iter().any(|k| lower.contains(k));
            if relevant {
                headlines.push((headline, published_at));
            }
        }
        Some(headlines)
    }
}

fn news_id(headline: &str, published_at: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(headline.as_bytes());
    hasher.update(published_at.to_le_bytes());
    hex::encode(&hasher.finalize()[..16])
}

impl std::fmt::Debug for NewsAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewsAnalyzer")
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
    fn rate_decision_is_high_impact() {
        let c = classify_headline("ECB rate decision due Thursday", now_ms() + 3600_000, now_ms());
        assert_eq!(c.kind, NewsKind::RateDecision);
        assert_eq!(c.impact_level, NewsImpact::High);
        assert_eq!(c.timing, NewsTiming::Imminent);
        assert!((c.volatility_multiplier - 1.8).abs() < f64::EPSILON);
        assert!(c.recommended_actions.contains(&"suspend_new_entries".to_string()));
    }

    #[test]
    fn past_data_release_classification() {
        let now = now_ms();
        let c = classify_headline("US CPI beats expectations", now - 2 * 3600 * 1000, now);
        assert_eq!(c.impact_level, NewsImpact::High);
        assert_eq!(c.timing, NewsTiming::Past);
    }

    #[test]
    fn geopolitical_headlines() {
        let now = now_ms();
        let c = classify_headline("Sanctions escalate regional crisis", now - 1000, now);
        assert_eq!(c.kind, NewsKind::Geopolitical);
        assert_eq!(c.impact_level, NewsImpact::High);
        assert_eq!(c.timing, NewsTiming::During);
    }

    #[test]
    fn mundane_headline_low_impact() {
        let now = now_ms();
        let c = classify_headline("Broker launches new platform feature", now - 86_400_000, now);
        assert_eq!(c.impact_level, NewsImpact::Low);
        assert!((c.volatility_multiplier - 1.0).abs() < f64::EPSILON);
        assert!(c.recommended_actions.is_empty());
    }

    #[test]
    fn sentiment_keywords() {
        assert!(headline_sentiment("Euro surges on strong GDP growth") > 0.0);
        assert!(headline_sentiment("Pound plunges as retail sales miss") < 0.0);
        assert_eq!(headline_sentiment("Calendar for next week"), 0.0);
    }

    #[test]
    fn composite_weighting() {
        let social = SentimentComponent { score: 0.8, confidence: 1.0, synthetic: false };
        let cot = SentimentComponent { score: -0.5, confidence: 1.0, synthetic: false };
        let options = SentimentComponent { score: 0.2, confidence: 1.0, synthetic: false };
        let (sentiment, confidence) = composite_sentiment(&social, &cot, &options);
        // 0.3*0.8 - 0.4*0.5 + 0.3*0.2 = 0.10
        assert!((sentiment - 0.10).abs() < 1e-9);
        assert!((confidence - 100.0).abs() < 1e-9);
    }

    #[test]
    fn synthetic_components_never_confirm() {
        let social = SentimentComponent { score: 0.9, confidence: 0.9, synthetic: false };
        let cot = SentimentComponent::synthetic_neutral();
        let options = SentimentComponent::synthetic_neutral();
        let (sentiment, confidence) = composite_sentiment(&social, &cot, &options);
        assert!(sentiment > 0.0);
        // Confidence reflects that only 30% of the weight mass is real.
        assert!(confidence <= 90.0 + 1e-9);

        let (s, c) = composite_sentiment(
            &SentimentComponent::synthetic_neutral(),
            &SentimentComponent::synthetic_neutral(),
            &SentimentComponent::synthetic_neutral(),
        );
        assert_eq!((s, c), (0.0, 0.0));
    }

    #[tokio::test]
    async fn unconfigured_analyzer_is_synthetic_neutral() {
        let analyzer = NewsAnalyzer::new(None, None);
        let pair = Pair::parse("EURUSD").unwrap();
        let analysis = analyzer.analyze(&pair).await;
        assert!(analysis.is_synthetic());
        assert_eq!(analysis.direction, Direction::Neutral);
        assert!(!analysis.high_impact_imminent);
    }

    #[test]
    fn news_id_is_stable() {
        assert_eq!(news_id("ECB holds", 1000), news_id("ECB holds", 1000));
        assert_ne!(news_id("ECB holds", 1000), news_id("ECB holds", 2000));
    }
}
