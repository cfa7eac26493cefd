// =============================================================================
// Configuration — environment-driven settings plus hot-reloadable auto-trader
// config
// =============================================================================
//
// `AppConfig` is read once at startup from the process environment. Boolean
// feature flags default to OFF when NODE_ENV=production; the development
// preset enables synthetic data and websockets so the engine runs without
// any provider keys.
//
// `AutoTraderConfig` is the hot-reloadable portion exposed through
// `PUT /api/auto-trader/config`. All fields carry `#[serde(default)]` so
// partial payloads never break deserialisation.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{Pair, TradingScope};

// =============================================================================
// Environment helpers
// =============================================================================

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_string(key) {
        Some(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

fn env_u16(key: &str, default: u16) -> u16 {
    env_string(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_string(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env_string(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// =============================================================================
// Environment mode
// =============================================================================

/// Deployment environment, parsed from NODE_ENV.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_env() -> Self {
        match env_string("NODE_ENV").as_deref() {
            Some("production") => Self::Production,
            Some("test") => Self::Test,
            _ => Self::Development,
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Development => write!(f, "development"),
            Self::Production => write!(f, "production"),
            Self::Test => write!(f, "test"),
        }
    }
}

// =============================================================================
// Database config
// =============================================================================

/// Connection settings for the persistence adapter.
///
/// The bundled-SQLite adapter derives its file path from `db_name`; host,
/// port, user, password and ssl are recognised for operational compatibility
/// and surfaced in the runtime health payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub ssl: bool,
}

impl DbConfig {
    fn from_env() -> Self {
        Self {
            host: env_string("DB_HOST").unwrap_or_else(|| "localhost".into()),
            port: env_u16("DB_PORT", 5432),
            name: env_string("DB_NAME").unwrap_or_else(|| "meridian".into()),
            user: env_string("DB_USER").unwrap_or_default(),
            password: env_string("DB_PASSWORD").unwrap_or_default(),
            ssl: env_bool("DB_SSL", false),
        }
    }

    /// SQLite file path derived from the logical database name.
    pub fn sqlite_path(&self) -> String {
        format!("{}.db", self.name)
    }
}

// =============================================================================
// Provider credentials
// =============================================================================

/// API keys for the market-data providers. A missing key means the provider
/// reports `is_configured() == false` and is skipped by the fetcher.
#[derive(Debug, Clone, Default)]
pub struct ProviderKeys {
    pub twelve_data: Option<String>,
    pub finnhub: Option<String>,
    pub polygon: Option<String>,
    pub alpha_vantage: Option<String>,
}

impl ProviderKeys {
    fn from_env() -> Self {
        Self {
            twelve_data: env_string("TWELVE_DATA_API_KEY"),
            finnhub: env_string("FINNHUB_API_KEY"),
            polygon: env_string("POLYGON_API_KEY"),
            alpha_vantage: env_string("ALPHA_VANTAGE_API_KEY"),
        }
    }
}

// =============================================================================
// Broker credentials
// =============================================================================

/// Per-broker connection settings; each connector is behind an enable flag.
#[derive(Debug, Clone, Default)]
pub struct BrokerConfig {
    pub routing_enabled: bool,
    pub oanda_enabled: bool,
    pub oanda_api_key: Option<String>,
    pub oanda_account_id: Option<String>,
    pub oanda_practice: bool,
    pub mt5_enabled: bool,
    pub mt5_bridge_url: Option<String>,
    pub ibkr_enabled: bool,
    pub ibkr_gateway_url: Option<String>,
}

impl BrokerConfig {
    fn from_env() -> Self {
        Self {
            routing_enabled: env_bool("ENABLE_BROKER_ROUTING", false),
            oanda_enabled: env_bool("ENABLE_BROKER_OANDA", false),
            oanda_api_key: env_string("OANDA_API_KEY"),
            oanda_account_id: env_string("OANDA_ACCOUNT_ID"),
            oanda_practice: env_bool("OANDA_PRACTICE", true),
            mt5_enabled: env_bool("ENABLE_BROKER_MT5", false),
            mt5_bridge_url: env_string("MT5_BRIDGE_URL"),
            ibkr_enabled: env_bool("ENABLE_BROKER_IBKR", false),
            ibkr_gateway_url: env_string("IBKR_GATEWAY_URL"),
        }
    }
}

// =============================================================================
// Live backtest config
// =============================================================================

/// Thresholds for the live backtest gate. Overridable via LIVE_BACKTEST_*.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveBacktestConfig {
    pub enabled: bool,
    pub lookback_days: u32,
    pub max_bars: usize,
    pub entry_stride: usize,
    pub hold_bars: usize,
    pub default_tp_pips: f64,
    pub default_sl_pips: f64,
    pub min_trades: usize,
    pub min_win_rate: f64,
    pub min_profit_factor: f64,
    pub max_drawdown_pct: f64,
    pub min_expectancy_pct: f64,
}

impl Default for LiveBacktestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lookback_days: 30,
            max_bars: 3200,
            entry_stride: 6,
            hold_bars: 12,
            default_tp_pips: 40.0,
            default_sl_pips: 22.0,
            min_trades: 20,
            min_win_rate: 0.62,
            min_profit_factor: 1.1,
            max_drawdown_pct: 18.0,
            min_expectancy_pct: 0.2,
        }
    }
}

impl LiveBacktestConfig {
    fn from_env() -> Self {
        let d = Self::default();
        Self {
            enabled: env_bool("LIVE_BACKTEST_ENABLED", d.enabled),
            lookback_days: env_u64("LIVE_BACKTEST_LOOKBACK_DAYS", d.lookback_days as u64) as u32,
            max_bars: env_u64("LIVE_BACKTEST_MAX_BARS", d.max_bars as u64) as usize,
            entry_stride: env_u64("LIVE_BACKTEST_ENTRY_STRIDE", d.entry_stride as u64) as usize,
            hold_bars: env_u64("LIVE_BACKTEST_HOLD_BARS", d.hold_bars as u64) as usize,
            default_tp_pips: env_f64("LIVE_BACKTEST_TP_PIPS", d.default_tp_pips),
            default_sl_pips: env_f64("LIVE_BACKTEST_SL_PIPS", d.default_sl_pips),
            min_trades: env_u64("LIVE_BACKTEST_MIN_TRADES", d.min_trades as u64) as usize,
            min_win_rate: env_f64("LIVE_BACKTEST_MIN_WIN_RATE", d.min_win_rate),
            min_profit_factor: env_f64("LIVE_BACKTEST_MIN_PROFIT_FACTOR", d.min_profit_factor),
            max_drawdown_pct: env_f64("LIVE_BACKTEST_MAX_DRAWDOWN_PCT", d.max_drawdown_pct),
            min_expectancy_pct: env_f64("LIVE_BACKTEST_MIN_EXPECTANCY_PCT", d.min_expectancy_pct),
        }
    }
}

// =============================================================================
// AppConfig
// =============================================================================

/// Immutable process-level configuration assembled from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: Environment,
    pub port: u16,
    /// When true, provider failure surfaces instead of synthesising bars.
    pub require_realtime_data: bool,
    /// When true, a deterministic synthetic walk backstops provider outages.
    pub allow_synthetic_data: bool,
    pub trading_scope: TradingScope,
    /// Signals are only broadcast to EA bridge consumers; no broker routing.
    pub ea_only_mode: bool,
    pub enable_websockets: bool,
    pub enable_risk_reports: bool,
    pub enable_performance_digests: bool,
    pub enable_prefetch_scheduler: bool,
    pub auto_trading_autostart: bool,
    pub db: DbConfig,
    pub provider_keys: ProviderKeys,
    pub broker: BrokerConfig,
    pub live_backtest: LiveBacktestConfig,
    /// Maximum quote age before it is considered stale (milliseconds).
    pub quote_max_age_ms: i64,
    /// Alert webhook URL, when the webhook channel is configured.
    pub alert_webhook_url: Option<String>,
    pub risk_report_hour_utc: u32,
    pub digest_hour_utc: u32,
}

impl AppConfig {
    /// Assemble configuration from the process environment.
    ///
    /// In production all feature flags default to off; in development the
    /// engine is self-contained (synthetic data + websockets on).
    pub fn from_env() -> Self {
        let environment = Environment::from_env();
        let is_dev = environment == Environment::Development;

        let config = Self {
            environment,
            port: env_u16("PORT", 8089),
            require_realtime_data: env_bool("REQUIRE_REALTIME_DATA", !is_dev),
            allow_synthetic_data: env_bool("ALLOW_SYNTHETIC_DATA", is_dev),
            trading_scope: match env_string("TRADING_SCOPE").as_deref() {
                Some("execution") => TradingScope::Execution,
                _ => TradingScope::Signals,
            },
            ea_only_mode: env_bool("EA_ONLY_MODE", false),
            enable_websockets: env_bool("ENABLE_WEBSOCKETS", is_dev),
            enable_risk_reports: env_bool("ENABLE_RISK_REPORTS", false),
            enable_performance_digests: env_bool("ENABLE_PERFORMANCE_DIGESTS", false),
            enable_prefetch_scheduler: env_bool("ENABLE_PREFETCH_SCHEDULER", false),
            auto_trading_autostart: env_bool("AUTO_TRADING_AUTOSTART", false),
            db: DbConfig::from_env(),
            provider_keys: ProviderKeys::from_env(),
            broker: BrokerConfig::from_env(),
            live_backtest: LiveBacktestConfig::from_env(),
            quote_max_age_ms: env_u64("QUOTE_MAX_AGE_MS", if is_dev { 600_000 } else { 120_000 })
                as i64,
            alert_webhook_url: env_string("ALERT_WEBHOOK_URL"),
            risk_report_hour_utc: env_u64("RISK_REPORT_HOUR_UTC", 21) as u32,
            digest_hour_utc: env_u64("DIGEST_HOUR_UTC", 22) as u32,
        };

        info!(
            environment = %config.environment,
            port = config.port,
            trading_scope = %config.trading_scope,
            require_realtime = config.require_realtime_data,
            allow_synthetic = config.allow_synthetic_data,
            "configuration loaded"
        );

        config
    }
}

// =============================================================================
// AutoTraderConfig (hot-reloadable)
// =============================================================================

fn default_pairs() -> Vec<String> {
    vec![
        "EURUSD".to_string(),
        "GBPUSD".to_string(),
        "USDJPY".to_string(),
        "AUDUSD".to_string(),
        "XAUUSD".to_string(),
    ]
}

fn default_interval_secs() -> u64 {
    300
}

fn default_account_risk_pct() -> f64 {
    1.0
}

fn default_min_strength() -> f64 {
    35.0
}

fn default_min_confidence() -> f64 {
    45.0
}

fn default_min_risk_reward() -> f64 {
    1.6
}

/// Hot-reloadable auto-trader settings, updated via the REST API.
///
/// Every field has a serde default so partial JSON payloads deserialise.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoTraderConfig {
    /// Whether the auto-trader loop is running.
    #[serde(default)]
    pub enabled: bool,

    /// Pairs evaluated on each cycle.
    #[serde(default = "default_pairs")]
    pub pairs: Vec<String>,

    /// Seconds between evaluation cycles.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Account risk per trade, percent of balance.
    #[serde(default = "default_account_risk_pct")]
    pub account_risk_pct: f64,

    /// Minimum signal strength for validity.
    #[serde(default = "default_min_strength")]
    pub min_strength: f64,

    /// Minimum calibrated confidence for validity.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    /// Minimum entry-plan risk/reward for validity.
    #[serde(default = "default_min_risk_reward")]
    pub min_risk_reward: f64,

    /// Preferred broker id, or None for the router default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_broker: Option<String>,
}

impl Default for AutoTraderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            pairs: default_pairs(),
            interval_secs: default_interval_secs(),
            account_risk_pct: default_account_risk_pct(),
            min_strength: default_min_strength(),
            min_confidence: default_min_confidence(),
            min_risk_reward: default_min_risk_reward(),
            preferred_broker: None,
        }
    }
}

impl AutoTraderConfig {
    /// Parse the configured pair list, skipping invalid symbols.
    pub fn parsed_pairs(&self) -> Vec<Pair> {
        self.pairs
            .iter()
            .filter_map(|s| Pair::parse(s).ok())
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_trader_defaults() {
        let cfg = AutoTraderConfig::default();
        assert!(!cfg.enabled);
        assert_eq!(cfg.pairs.len(), 5);
        assert_eq!(cfg.interval_secs, 300);
        assert!((cfg.min_risk_reward - 1.6).abs() < f64::EPSILON);
        assert!(cfg.preferred_broker.is_none());
    }

    #[test]
    fn auto_trader_partial_json_fills_defaults() {
        let json = r#"{ "enabled": true, "pairs": ["EURUSD"] }"#;
        let cfg: AutoTraderConfig = serde_json::from_str(json).unwrap();
        assert!(cfg.enabled);
        assert_eq!(cfg.pairs, vec!["EURUSD"]);
        assert_eq!(cfg.interval_secs, 300);
        assert!((cfg.min_strength - 35.0).abs() < f64::EPSILON);
    }

    #[test]
    fn auto_trader_roundtrip() {
        let cfg = AutoTraderConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: AutoTraderConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.pairs, cfg2.pairs);
        assert_eq!(cfg.interval_secs, cfg2.interval_secs);
    }

    #[test]
    fn parsed_pairs_skips_invalid() {
        let cfg = AutoTraderConfig {
            pairs: vec!["EURUSD".into(), "??".into(), "usdjpy".into()],
            ..Default::default()
        };
        let parsed = cfg.parsed_pairs();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].as_str(), "EURUSD");
        assert_eq!(parsed[1].as_str(), "USDJPY");
    }

    #[test]
    fn live_backtest_defaults() {
        let cfg = LiveBacktestConfig::default();
        assert_eq!(cfg.min_trades, 20);
        assert!((cfg.min_win_rate - 0.62).abs() < f64::EPSILON);
        assert!((cfg.min_profit_factor - 1.1).abs() < f64::EPSILON);
        assert!((cfg.max_drawdown_pct - 18.0).abs() < f64::EPSILON);
        assert_eq!(cfg.max_bars, 3200);
    }

    #[test]
    fn db_config_sqlite_path() {
        let db = DbConfig {
            host: "localhost".into(),
            port: 5432,
            name: "meridian".into(),
            user: String::new(),
            password: String::new(),
            ssl: false,
        };
        assert_eq!(db.sqlite_path(), "meridian.db");
    }
}
