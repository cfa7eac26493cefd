// =============================================================================
// Central application state — Meridian FX engine
// =============================================================================
//
// The single assembly point for the engine. Subsystems are constructed here
// from the environment configuration, own their interior mutability, and
// are shared through `Arc<AppState>` with every async task and HTTP
// handler. The strong ownership graph stays a DAG: components receive their
// dependencies at construction and never reach back into AppState.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::alerts::{self, AlertBus};
use crate::analysis::scorer::AdaptiveScorer;
use crate::analysis::{EconomicAnalyzer, NewsAnalyzer, TechnicalAnalyzer};
use crate::broker::{
    ibkr::IbkrConnector, mt_bridge::MtBridgeConnector, oanda::OandaConnector,
    paper::PaperConnector, BrokerConnector, BrokerRouter,
};
use crate::config::{AppConfig, AutoTraderConfig};
use crate::events::EventBroadcaster;
use crate::features::FeatureStore;
use crate::market_data::availability::AvailabilityClassifier;
use crate::market_data::fetcher::MarketDataFetcher;
use crate::market_data::metrics::ProviderMetricsRegistry;
use crate::market_data::quality::DataQualityGuard;
use crate::persistence::PersistenceAdapter;
use crate::providers::{
    alpha_vantage::AlphaVantageProvider, finnhub::FinnhubProvider, polygon::PolygonProvider,
    twelve_data::TwelveDataProvider, MarketDataProvider,
};
use crate::risk::{RiskConfig, RiskEngine};
use crate::signal::combiner::{CombinerConfig, SignalCombiner};
use crate::signal::{LiveBacktestValidator, SignalCoordinator};

/// Central application state shared across all async tasks.
pub struct AppState {
    pub config: AppConfig,
    pub auto_trader: RwLock<AutoTraderConfig>,

    pub persistence: Option<Arc<PersistenceAdapter>>,
    pub provider_metrics: Arc<ProviderMetricsRegistry>,
    pub fetcher: Arc<MarketDataFetcher>,
    pub availability: Arc<AvailabilityClassifier>,
    pub quality: Arc<DataQualityGuard>,
    pub features: Arc<FeatureStore>,
    pub scorer: Arc<AdaptiveScorer>,
    pub risk: Arc<RiskEngine>,
    pub router: Arc<BrokerRouter>,
    pub coordinator: Arc<SignalCoordinator>,
    pub backtest: Arc<LiveBacktestValidator>,
    pub bus: Arc<AlertBus>,
    pub events: EventBroadcaster,

    pub start_time: Instant,
}

impl AppState {
    /// Assemble every subsystem from the environment configuration.
    pub fn build(config: AppConfig) -> Arc<Self> {
        // ── Persistence (optional, self-disabling) ──────────────────────
        let persistence = match PersistenceAdapter::open(&config.db.sqlite_path()) {
            Ok(adapter) => Some(Arc::new(adapter)),
            Err(e) => {
                warn!(error = %e, "persistence unavailable — running in-memory only");
                None
            }
        };

        // ── Alert bus & event feed ──────────────────────────────────────
        let bus = AlertBus::new();
        alerts::spawn_log_channel(&bus);
        if let Some(url) = &config.alert_webhook_url {
            alerts::spawn_webhook_channel(&bus, url.clone());
        }
        let events = EventBroadcaster::new();

        // ── Market data ─────────────────────────────────────────────────
        let provider_metrics = Arc::new(ProviderMetricsRegistry::new());
        let providers: Vec<Arc<dyn MarketDataProvider>> = vec![
            Arc::new(TwelveDataProvider::new(config.provider_keys.twelve_data.clone())),
            Arc::new(FinnhubProvider::new(config.provider_keys.finnhub.clone())),
            Arc::new(PolygonProvider::new(config.provider_keys.polygon.clone())),
            Arc::new(AlphaVantageProvider::new(
                config.provider_keys.alpha_vantage.clone(),
            )),
        ];
        let fetcher = Arc::new(MarketDataFetcher::new(
            providers,
            provider_metrics.clone(),
            config.allow_synthetic_data,
            config.require_realtime_data,
        ));

        let availability = Arc::new(AvailabilityClassifier::new(
            provider_metrics.clone(),
            fetcher.provider_states(),
            bus.clone(),
            persistence.clone(),
        ));
        let quality = Arc::new(DataQualityGuard::new(fetcher.clone(), persistence.clone()));

        // ── Stores & analyzers ──────────────────────────────────────────
        let features = Arc::new(FeatureStore::new(persistence.clone()));
        let technical = Arc::new(TechnicalAnalyzer::new(fetcher.clone()));
        let economic = Arc::new(EconomicAnalyzer::new(
            config.provider_keys.alpha_vantage.clone(),
        ));
        let news = Arc::new(NewsAnalyzer::new(
            config.provider_keys.finnhub.clone(),
            persistence.clone(),
        ));

        // ── Scorer (model loaded lazily when present) ───────────────────
        let scorer = Arc::new(AdaptiveScorer::new());
        if let Err(e) = scorer.load_model("models/scorer.json") {
            info!(reason = %e, "scorer running rule-only");
        }

        // ── Risk & brokers ──────────────────────────────────────────────
        let auto_trader = AutoTraderConfig {
            enabled: config.auto_trading_autostart,
            ..Default::default()
        };
        let risk = Arc::new(RiskEngine::new(RiskConfig {
            account_risk_pct: auto_trader.account_risk_pct,
            ..Default::default()
        }));

        let mut connectors: Vec<Arc<dyn BrokerConnector>> = Vec::new();
        if config.broker.routing_enabled && config.broker.oanda_enabled {
            connectors.push(Arc::new(OandaConnector::new(
                config.broker.oanda_api_key.clone().unwrap_or_default(),
                config.broker.oanda_account_id.clone().unwrap_or_default(),
                config.broker.oanda_practice,
            )));
        }
        if config.broker.routing_enabled && config.broker.mt5_enabled {
            connectors.push(Arc::new(MtBridgeConnector::new(
                "mt5",
                config.broker.mt5_bridge_url.clone(),
            )));
        }
        if config.broker.routing_enabled && config.broker.ibkr_enabled {
            connectors.push(Arc::new(IbkrConnector::new(
                config.broker.ibkr_gateway_url.clone(),
            )));
        }
        // The paper connector backstops routing in every configuration.
        connectors.push(Arc::new(PaperConnector::new()));

        let router = Arc::new(BrokerRouter::new(
            connectors,
            risk.clone(),
            events.clone(),
            bus.clone(),
        ));

        // ── Signal pipeline ─────────────────────────────────────────────
        let combiner = SignalCombiner::new(
            scorer.clone(),
            CombinerConfig {
                min_strength: auto_trader.min_strength,
                min_confidence: auto_trader.min_confidence,
                min_risk_reward: auto_trader.min_risk_reward,
                strict_mode: false,
                account_risk_pct: auto_trader.account_risk_pct,
            },
        );
        let backtest = Arc::new(LiveBacktestValidator::new(
            fetcher.clone(),
            config.live_backtest.clone(),
        ));
        let coordinator = Arc::new(SignalCoordinator::new(
            features.clone(),
            technical,
            economic,
            news,
            quality.clone(),
            combiner,
            backtest.clone(),
            risk.clone(),
            router.clone(),
            fetcher.clone(),
            events.clone(),
            config.trading_scope,
            config.ea_only_mode,
            config.quote_max_age_ms,
        ));

        info!(
            environment = %config.environment,
            trading_scope = %config.trading_scope,
            persistence = persistence.is_some(),
            "application state assembled"
        );

        Arc::new(Self {
            auto_trader: RwLock::new(auto_trader),
            config,
            persistence,
            provider_metrics,
            fetcher,
            availability,
            quality,
            features,
            scorer,
            risk,
            router,
            coordinator,
            backtest,
            bus,
            events,
            start_time: Instant::now(),
        })
    }

    /// Uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("environment", &self.config.environment)
            .field("uptime_secs", &self.uptime_secs())
            .finish()
    }
}
