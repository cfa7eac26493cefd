// =============================================================================
// Orchestration coordinator — the per-pair signal lifecycle
// =============================================================================
//
// One generation runs: purge expired features -> run the three analyzers and
// the quote fetch concurrently -> consult the data-quality guard -> combine
// -> attach risk management -> live-backtest gate for borderline directional
// signals -> optionally execute through the broker router.
//
// Generations are serialized per pair: while one is in flight, concurrent
// requests for the same pair coalesce onto its result instead of queueing
// new work. A live pair circuit breaker refuses generation outright with
// `rejected:pair_circuit_breaker_active`. Every failure path degrades to a
// safe NEUTRAL signal carrying the reason — the coordinator never throws.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::analysis::technical::TechnicalAnalysis;
use crate::analysis::{EconomicAnalyzer, NewsAnalyzer, TechnicalAnalyzer};
use crate::broker::{BrokerRouter, OrderEnvelope, RouterOutcome};
use crate::events::{EventBroadcaster, EventType};
use crate::features::{FeatureStore, FeatureValue};
use crate::market_data::fetcher::{FetchOpts, MarketDataFetcher};
use crate::market_data::quality::DataQualityGuard;
use crate::risk::RiskEngine;
use crate::signal::backtest::LiveBacktestValidator;
use crate::signal::combiner::SignalCombiner;
use crate::signal::{Decision, TradingSignal};
use crate::types::{now_ms, Pair, Timeframe, TradingScope};

/// Signals at or above this confidence skip the live-backtest gate.
const BORDERLINE_CONFIDENCE: f64 = 70.0;

// ---------------------------------------------------------------------------
// Options & result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct GenerateOpts {
    pub auto_execute: bool,
    pub preferred_broker: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub signal: TradingSignal,
    pub execution: Option<RouterOutcome>,
    /// True when this caller received an in-flight generation's result.
    pub coalesced: bool,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct SignalCoordinator {
    features: Arc<FeatureStore>,
    technical: Arc<TechnicalAnalyzer>,
    economic: Arc<EconomicAnalyzer>,
    news: Arc<NewsAnalyzer>,
    quality: Arc<DataQualityGuard>,
    combiner: SignalCombiner,
    backtest: Arc<LiveBacktestValidator>,
    risk: Arc<RiskEngine>,
    router: Arc<BrokerRouter>,
    fetcher: Arc<MarketDataFetcher>,
    events: EventBroadcaster,
    trading_scope: TradingScope,
    ea_only_mode: bool,
    quote_max_age_ms: i64,
    in_flight: Mutex<HashMap<Pair, broadcast::Sender<TradingSignal>>>,
}

impl SignalCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        features: Arc<FeatureStore>,
        technical: Arc<TechnicalAnalyzer>,
        economic: Arc<EconomicAnalyzer>,
        news: Arc<NewsAnalyzer>,
        quality: Arc<DataQualityGuard>,
        combiner: SignalCombiner,
        backtest: Arc<LiveBacktestValidator>,
        risk: Arc<RiskEngine>,
        router: Arc<BrokerRouter>,
        fetcher: Arc<MarketDataFetcher>,
        events: EventBroadcaster,
        trading_scope: TradingScope,
        ea_only_mode: bool,
        quote_max_age_ms: i64,
    ) -> Self {
        Self {
            features,
            technical,
            economic,
            news,
            quality,
            combiner,
            backtest,
            risk,
            router,
            fetcher,
            events,
            trading_scope,
            ea_only_mode,
            quote_max_age_ms,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Generate a signal for one pair, optionally executing it.
    pub async fn generate_signal(&self, pair: &Pair, opts: &GenerateOpts) -> GenerationResult {
        // Coalesce onto an in-flight generation for this pair.
        let mut waiter = None;
        {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.get(pair) {
                Some(tx) => waiter = Some(tx.subscribe()),
                None => {
                    let (tx, _rx) = broadcast::channel(1);
                    in_flight.insert(pair.clone(), tx);
                }
            }
        }

        if let Some(mut rx) = waiter {
            debug!(pair = %pair, "coalescing onto in-flight generation");
            let signal = match rx.recv().await {
                Ok(signal) => signal,
                Err(_) => TradingSignal::neutral(pair, "in-flight generation aborted"),
            };
            return GenerationResult {
                signal,
                execution: None,
                coalesced: true,
            };
        }

        let signal = self.run_pipeline(pair).await;

        // Release waiters before any execution work.
        {
            let mut in_flight = self.in_flight.lock().await;
            if let Some(tx) = in_flight.remove(pair) {
                let _ = tx.send(signal.clone());
            }
        }

        let execution = if opts.auto_execute {
            Some(self.execute(&signal, opts).await)
        } else {
            None
        };

        GenerationResult {
            signal,
            execution,
            coalesced: false,
        }
    }

    // -------------------------------------------------------------------------
    // Pipeline
    // -------------------------------------------------------------------------

    async fn run_pipeline(&self, pair: &Pair) -> TradingSignal {
        // Backpressure: a live breaker refuses generation outright.
        if let Some(breaker) = self.quality.active_breaker(pair) {
            let signal = TradingSignal::neutral(
                pair,
                format!("rejected:pair_circuit_breaker_active ({})", breaker.reason),
            );
            self.publish_signal(&signal);
            return signal;
        }

        // 1. Retention pass on the feature store.
        self.features.purge_expired();

        // 2 & 3. Analyzers and the quote fetch run concurrently.
        let quote_opts = FetchOpts::with_purpose("signal-quote");
        let (economic, news, technical, quote_result) = tokio::join!(
            self.economic.analyze(pair),
            self.news.analyze(pair),
            self.technical.analyze(pair),
            self.fetcher.fetch_quote(pair, &quote_opts),
        );

        let quote = match quote_result {
            Ok(q) => q.filter(|q| q.is_fresh(now_ms(), self.quote_max_age_ms)),
            Err(e) => {
                warn!(pair = %pair, error = %e, "quote fetch failed — continuing without quote");
                None
            }
        };

        // 4. Data-quality guard (cached within its TTL).
        let quality = self.quality.assess_market_data(pair, quote.as_ref()).await;
        let breaker = self.quality.active_breaker(pair);

        // 5 & 6. Combine; the scorer and risk sizing run inside.
        let mut signal = self.combiner.combine(
            pair,
            &technical,
            &economic,
            &news,
            &quality,
            quote.as_ref(),
            breaker.as_ref(),
            &self.risk,
        );

        // Record the evidence snapshot out-of-band.
        self.record_features(pair, &technical, &signal);

        // 7. Live-backtest gate for borderline directional signals.
        if signal.validity.is_valid
            && signal.direction.is_directional()
            && self.backtest.config().enabled
            && signal.confidence < BORDERLINE_CONFIDENCE
        {
            let report = self.backtest.validate_signal(&signal, pair).await;
            if report.skipped {
                debug!(pair = %pair, reasons = ?report.reasons, "live backtest gate skipped");
            } else if report.passed {
                signal.validity.checks.insert("live_backtest".to_string(), true);
            } else {
                signal.validity.checks.insert("live_backtest".to_string(), false);
                signal.validity.is_valid = false;
                let summary = report.reasons.join("; ");
                signal.validity.reason = Some(format!("live backtest gate failed: {summary}"));
                signal.validity.decision = Decision::blocked(
                    vec!["live_backtest".to_string()],
                    signal.validity.decision.missing.clone(),
                );
                signal.reasoning.extend(report.reasons);
            }
        }

        self.publish_signal(&signal);
        signal
    }

    fn publish_signal(&self, signal: &TradingSignal) {
        self.events.publish(
            EventType::Signal,
            serde_json::to_value(signal).unwrap_or(serde_json::Value::Null),
        );
    }

    /// Persist the scoring evidence into the feature store.
    fn record_features(&self, pair: &Pair, technical: &TechnicalAnalysis, signal: &TradingSignal) {
        let mut features: BTreeMap<String, FeatureValue> = BTreeMap::new();
        if let Some(price) = technical.last_close {
            features.insert("price".to_string(), price.into());
        }
        features.insert("score".to_string(), signal.final_score.into());
        features.insert(
            "direction".to_string(),
            signal.direction.to_string().as_str().into(),
        );
        features.insert("confidence".to_string(), signal.confidence.into());
        features.insert("strength".to_string(), signal.strength.into());
        features.insert(
            "probability".to_string(),
            signal.components.scorer_probability.into(),
        );
        features.insert(
            "technicalScore".to_string(),
            signal.components.technical_score.into(),
        );
        features.insert(
            "economicScore".to_string(),
            signal.components.economic_score.into(),
        );
        features.insert(
            "newsSentiment".to_string(),
            signal.components.news_sentiment.into(),
        );
        features.insert("synthetic".to_string(), technical.synthetic.into());

        self.features.record_features(pair, Timeframe::M15, features);
    }

    // -------------------------------------------------------------------------
    // Execution
    // -------------------------------------------------------------------------

    async fn execute(&self, signal: &TradingSignal, opts: &GenerateOpts) -> RouterOutcome {
        if !signal.validity.is_valid {
            let reason = signal
                .validity
                .reason
                .clone()
                .unwrap_or_else(|| "signal invalid".to_string());
            self.events.publish(
                EventType::AutoTradeRejected,
                serde_json::json!({"pair": signal.pair, "error": reason}),
            );
            return RouterOutcome::failure(format!("signal not executable: {reason}"));
        }
        if self.trading_scope == TradingScope::Signals {
            return RouterOutcome::failure("trading scope is signals-only");
        }
        if self.ea_only_mode {
            // EA bridge consumers receive the broadcast; no broker routing.
            return RouterOutcome::failure("ea_only_mode: execution delegated to EA bridge");
        }

        let Some(entry) = &signal.entry else {
            return RouterOutcome::failure("signal has no entry plan");
        };

        let envelope = OrderEnvelope {
            broker: opts.preferred_broker.clone(),
            pair: Some(signal.pair.to_string()),
            direction: Some(signal.direction.to_string()),
            volume: Some(signal.risk_management.position_size),
            price: Some(entry.price),
            stop_loss: Some(entry.stop_loss),
            take_profit: Some(entry.take_profit),
            id: None,
            comment: Some(format!("meridian signal {}", signal.id)),
            source: Some("auto-trader".to_string()),
            trade_id: Some(signal.id.clone()),
            reason: None,
        };

        let outcome = self.router.open_position(&envelope).await;
        if let Some(trade) = &outcome.trade {
            self.risk.register_open_trade(
                &trade.id,
                &trade.pair,
                trade.direction,
                trade.position_size,
                signal.risk_management.risk_amount,
                signal.risk_management.account_risk_pct,
            );
            info!(
                pair = %trade.pair,
                direction = %trade.direction,
                size = trade.position_size,
                broker = trade.broker.as_deref().unwrap_or(""),
                "signal executed"
            );
        }
        outcome
    }
}

impl std::fmt::Debug for SignalCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalCoordinator")
            .field("trading_scope", &self.trading_scope)
            .field("ea_only_mode", &self.ea_only_mode)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertBus;
    use crate::analysis::scorer::AdaptiveScorer;
    use crate::config::LiveBacktestConfig;
    use crate::market_data::metrics::ProviderMetricsRegistry;
    use crate::risk::RiskConfig;
    use crate::signal::combiner::CombinerConfig;
    use crate::types::{Direction, Quote};

    fn eurusd() -> Pair {
        Pair::parse("EURUSD").unwrap()
    }

    /// A self-contained coordinator over the synthetic data path.
    fn coordinator() -> (Arc<SignalCoordinator>, Arc<DataQualityGuard>) {
        let metrics = Arc::new(ProviderMetricsRegistry::new());
        let fetcher = Arc::new(MarketDataFetcher::new(vec![], metrics, true, false));
        let quality = Arc::new(DataQualityGuard::new(fetcher.clone(), None));
        let risk = Arc::new(RiskEngine::new(RiskConfig::default()));
        let events = EventBroadcaster::new();
        let router = Arc::new(BrokerRouter::new(
            vec![Arc::new(crate::broker::paper::PaperConnector::new())],
            risk.clone(),
            events.clone(),
            AlertBus::new(),
        ));

        let coordinator = Arc::new(SignalCoordinator::new(
            Arc::new(FeatureStore::new(None)),
            Arc::new(TechnicalAnalyzer::new(fetcher.clone())),
            Arc::new(EconomicAnalyzer::new(None)),
            Arc::new(NewsAnalyzer::new(None, None)),
            quality.clone(),
            SignalCombiner::new(Arc::new(AdaptiveScorer::new()), CombinerConfig::default()),
            Arc::new(LiveBacktestValidator::new(
                fetcher.clone(),
                LiveBacktestConfig::default(),
            )),
            risk,
            router,
            fetcher,
            events,
            TradingScope::Signals,
            false,
            600_000,
        ));
        (coordinator, quality)
    }

    #[tokio::test]
    async fn generation_returns_complete_signal() {
        let (coordinator, _quality) = coordinator();
        let result = coordinator
            .generate_signal(&eurusd(), &GenerateOpts::default())
            .await;
        assert!(!result.coalesced);
        assert!(result.execution.is_none());
        // The synthetic path produces a well-formed signal either way.
        let signal = result.signal;
        assert_eq!(signal.pair, eurusd());
        assert!(signal.confidence >= 0.0 && signal.confidence <= 100.0);
        assert!(signal.strength >= 0.0 && signal.strength <= 100.0);
        if signal.direction == Direction::Neutral {
            assert!(signal.entry.is_none());
        }
    }

    // Invariant 4: a live pair breaker makes generation invalid with a
    // circuit_breaker reason.
    #[tokio::test]
    async fn live_breaker_short_circuits_generation() {
        let (coordinator, quality) = coordinator();
        let pair = eurusd();

        // Force a spread-critical report to trip the breaker.
        let wide_quote = Quote {
            pair: pair.clone(),
            bid: 1.08500,
            ask: 1.08545,
            timestamp_ms: now_ms(),
            provider: "test".into(),
        };
        let report = quality.assess_market_data(&pair, Some(&wide_quote)).await;
        assert!(report.breaker_activated);

        let result = coordinator
            .generate_signal(&pair, &GenerateOpts::default())
            .await;
        assert_eq!(result.signal.direction, Direction::Neutral);
        assert!(!result.signal.validity.is_valid);
        assert!(result
            .signal
            .validity
            .reason
            .as_ref()
            .unwrap()
            .contains("circuit_breaker"));
    }

    #[tokio::test]
    async fn concurrent_generations_coalesce() {
        let (coordinator, _quality) = coordinator();
        let pair = eurusd();

        let opts = GenerateOpts::default();
        let a = coordinator.generate_signal(&pair, &opts);
        let b = coordinator.generate_signal(&pair, &opts);
        let (ra, rb) = tokio::join!(a, b);

        // Exactly one ran the pipeline; the other coalesced onto its result.
        assert_ne!(ra.coalesced, rb.coalesced);
        assert_eq!(ra.signal.id, rb.signal.id);
    }

    #[tokio::test]
    async fn signals_scope_blocks_execution() {
        let (coordinator, _quality) = coordinator();
        let result = coordinator
            .generate_signal(
                &eurusd(),
                &GenerateOpts {
                    auto_execute: true,
                    preferred_broker: None,
                },
            )
            .await;
        let execution = result.execution.unwrap();
        assert!(!execution.success);
        // Either invalid-signal or scope rejection — never a broker call.
        let error = execution.error.unwrap();
        assert!(
            error.contains("signals-only") || error.contains("not executable"),
            "unexpected error: {error}"
        );
    }

    #[tokio::test]
    async fn signal_event_is_broadcast() {
        let (coordinator, _quality) = coordinator();
        let mut rx = coordinator.events.subscribe();

        coordinator
            .generate_signal(&eurusd(), &GenerateOpts::default())
            .await;

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.event_type, EventType::Signal);
        assert_eq!(frame.payload["pair"], "EURUSD");
    }

    #[tokio::test]
    async fn features_recorded_during_generation() {
        let (coordinator, _quality) = coordinator();
        coordinator
            .generate_signal(&eurusd(), &GenerateOpts::default())
            .await;
        let latest = coordinator
            .features
            .get_latest(&eurusd(), Timeframe::M15)
            .expect("features recorded");
        assert!(latest.features.contains_key("probability"));
        assert!(latest.features.contains_key("direction"));
    }
}
