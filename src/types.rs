// =============================================================================
// Shared types used across the Meridian FX engine
// =============================================================================

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Asset class & pair
// ---------------------------------------------------------------------------

/// Broad asset category of a tradable symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetClass {
    Forex,
    Metal,
    Index,
    Crypto,
}

impl std::fmt::Display for AssetClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Forex => write!(f, "forex"),
            Self::Metal => write!(f, "metal"),
            Self::Index => write!(f, "index"),
            Self::Crypto => write!(f, "crypto"),
        }
    }
}

/// A validated trading pair, e.g. `EURUSD` or `XAUUSD`.
///
/// The base/quote split is lexical: the first three characters are the base
/// currency and the remainder is the quote currency. Metals keep the same
/// convention (`XAU` / `USD`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pair(String);

/// Known metal prefixes (gold, silver, platinum, palladium).
const METAL_PREFIXES: &[&str] = &["XAU", "XAG", "XPT", "XPD"];
/// Known index symbols.
const INDEX_SYMBOLS: &[&str] = &["US30", "SPX500", "NAS100", "GER40", "UK100"];
/// Known crypto bases.
const CRYPTO_PREFIXES: &[&str] = &["BTC", "ETH", "LTC", "XRP", "SOL"];

impl Pair {
    /// Parse and validate a pair symbol.
    ///
    /// Rules: 6-8 characters after upper-casing, alphanumeric only. Known
    /// index symbols are accepted as-is.
    pub fn parse(raw: &str) -> Result<Self> {
        let sym = raw.trim().to_uppercase();

        if INDEX_SYMBOLS.contains(&sym.as_str()) {
            return Ok(Self(sym));
        }
        if sym.len() < 6 || sym.len() > 8 {
            bail!("invalid pair symbol '{raw}': expected 6-8 characters");
        }
        if !sym.chars().all(|c| c.is_ascii_alphanumeric()) {
            bail!("invalid pair symbol '{raw}': non-alphanumeric characters");
        }
        Ok(Self(sym))
    }

    /// The raw upper-case symbol.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Base currency (first three characters).
    pub fn base(&self) -> &str {
        &self.0[..3.min(self.0.len())]
    }

    /// Quote currency (everything after the base).
    pub fn quote(&self) -> &str {
        &self.0[3.min(self.0.len())..]
    }

    /// Asset class derived from the symbol.
    pub fn asset_class(&self) -> AssetClass {
        if INDEX_SYMBOLS.contains(&self.0.as_str()) {
            AssetClass::Index
        } else if METAL_PREFIXES.iter().any(|p| self.0.starts_with(p)) {
            AssetClass::Metal
        } else if CRYPTO_PREFIXES.iter().any(|p| self.0.starts_with(p)) {
            AssetClass::Crypto
        } else {
            AssetClass::Forex
        }
    }

    /// Minimum price increment: 0.01 for JPY-quoted pairs, 0.0001 otherwise.
    pub fn pip_size(&self) -> f64 {
        if self.quote() == "JPY" {
            0.01
        } else {
            0.0001
        }
    }

    /// Convert an absolute price distance into pips for this pair.
    pub fn price_to_pips(&self, distance: f64) -> f64 {
        distance.abs() / self.pip_size()
    }
}

impl std::fmt::Display for Pair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Timeframe
// ---------------------------------------------------------------------------

/// Chart timeframe with a canonical period in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
}

impl Timeframe {
    /// Canonical bar period in seconds.
    pub fn period_secs(&self) -> u64 {
        match self {
            Self::M1 => 60,
            Self::M5 => 300,
            Self::M15 => 900,
            Self::M30 => 1800,
            Self::H1 => 3600,
            Self::H4 => 14_400,
            Self::D1 => 86_400,
        }
    }

    /// Canonical bar period in milliseconds.
    pub fn period_ms(&self) -> i64 {
        self.period_secs() as i64 * 1000
    }

    /// Parse from the wire representation (`"M15"`, `"H1"`, ...).
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_uppercase().as_str() {
            "M1" => Ok(Self::M1),
            "M5" => Ok(Self::M5),
            "M15" => Ok(Self::M15),
            "M30" => Ok(Self::M30),
            "H1" => Ok(Self::H1),
            "H4" => Ok(Self::H4),
            "D1" => Ok(Self::D1),
            other => bail!("unknown timeframe '{other}'"),
        }
    }

    /// All supported timeframes, shortest first.
    pub fn all() -> &'static [Timeframe] {
        &[
            Self::M1,
            Self::M5,
            Self::M15,
            Self::M30,
            Self::H1,
            Self::H4,
            Self::D1,
        ]
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::M1 => "M1",
            Self::M5 => "M5",
            Self::M15 => "M15",
            Self::M30 => "M30",
            Self::H1 => "H1",
            Self::H4 => "H4",
            Self::D1 => "D1",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Bars & quotes
// ---------------------------------------------------------------------------

/// Where a bar came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BarSource {
    Provider(String),
    Synthetic,
}

impl std::fmt::Display for BarSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provider(name) => write!(f, "{name}"),
            Self::Synthetic => write!(f, "synthetic"),
        }
    }
}

/// A single immutable OHLCV price bar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    pub source: BarSource,
}

impl Bar {
    /// True when all price fields are finite and strictly positive, and the
    /// high/low bracket the open/close.
    pub fn is_sane(&self) -> bool {
        let prices = [self.open, self.high, self.low, self.close];
        prices.iter().all(|p| p.is_finite() && *p > 0.0)
            && self.high >= self.low
            && self.high >= self.open.min(self.close)
            && self.low <= self.open.max(self.close)
    }
}

/// A bid/ask quote snapshot from a single provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub pair: Pair,
    pub bid: f64,
    pub ask: f64,
    pub timestamp_ms: i64,
    pub provider: String,
}

impl Quote {
    /// Age of the quote relative to `now_ms`.
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        (now_ms - self.timestamp_ms).max(0)
    }

    /// A quote is fresh iff its age does not exceed `max_age_ms`.
    pub fn is_fresh(&self, now_ms: i64, max_age_ms: i64) -> bool {
        self.age_ms(now_ms) <= max_age_ms
    }

    /// Mid price.
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    /// Spread expressed in pips for this pair.
    pub fn spread_pips(&self) -> f64 {
        self.pair.price_to_pips(self.ask - self.bid)
    }
}

// ---------------------------------------------------------------------------
// Direction & trading scope
// ---------------------------------------------------------------------------

/// Directional verdict of the signal pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Buy,
    Sell,
    Neutral,
}

impl Direction {
    pub fn is_directional(&self) -> bool {
        !matches!(self, Self::Neutral)
    }

    /// +1.0 for BUY, -1.0 for SELL, 0.0 for NEUTRAL.
    pub fn sign(&self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
            Self::Neutral => 0.0,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::Neutral => write!(f, "NEUTRAL"),
        }
    }
}

/// Whether the engine emits signals only or also submits orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingScope {
    Signals,
    Execution,
}

impl Default for TradingScope {
    fn default() -> Self {
        Self::Signals
    }
}

impl std::fmt::Display for TradingScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Signals => write!(f, "signals"),
            Self::Execution => write!(f, "execution"),
        }
    }
}

// ---------------------------------------------------------------------------
// Trades
// ---------------------------------------------------------------------------

/// Life-cycle status of a broker trade. Transitions are monotone:
/// Open -> Closed | Cancelled | Error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeStatus {
    Open,
    Closed,
    Cancelled,
    Error,
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::Closed => write!(f, "CLOSED"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// A broker-filled trade tracked by the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub id: String,
    pub pair: Pair,
    pub direction: Direction,
    pub position_size: f64,
    pub entry_price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
    pub open_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_time: Option<String>,
    pub status: TradeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_pnl: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_pnl: Option<f64>,
}

// ---------------------------------------------------------------------------
// Time helper
// ---------------------------------------------------------------------------

/// Current UNIX timestamp in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_parse_and_split() {
        let p = Pair::parse("eurusd").unwrap();
        assert_eq!(p.as_str(), "EURUSD");
        assert_eq!(p.base(), "EUR");
        assert_eq!(p.quote(), "USD");
        assert_eq!(p.asset_class(), AssetClass::Forex);
    }

    #[test]
    fn pair_rejects_garbage() {
        assert!(Pair::parse("EUR").is_err());
        assert!(Pair::parse("EUR-USD!").is_err());
        assert!(Pair::parse("").is_err());
    }

    #[test]
    fn pair_asset_classes() {
        assert_eq!(Pair::parse("XAUUSD").unwrap().asset_class(), AssetClass::Metal);
        assert_eq!(Pair::parse("BTCUSD").unwrap().asset_class(), AssetClass::Crypto);
        assert_eq!(Pair::parse("US30").unwrap().asset_class(), AssetClass::Index);
        assert_eq!(Pair::parse("GBPJPY").unwrap().asset_class(), AssetClass::Forex);
    }

    #[test]
    fn pip_size_jpy_vs_major() {
        assert!((Pair::parse("USDJPY").unwrap().pip_size() - 0.01).abs() < f64::EPSILON);
        assert!((Pair::parse("EURUSD").unwrap().pip_size() - 0.0001).abs() < f64::EPSILON);
    }

    #[test]
    fn price_to_pips() {
        let eurusd = Pair::parse("EURUSD").unwrap();
        assert!((eurusd.price_to_pips(0.0025) - 25.0).abs() < 1e-9);
        let usdjpy = Pair::parse("USDJPY").unwrap();
        assert!((usdjpy.price_to_pips(0.25) - 25.0).abs() < 1e-9);
    }

    #[test]
    fn timeframe_roundtrip() {
        for tf in Timeframe::all() {
            let parsed = Timeframe::parse(&tf.to_string()).unwrap();
            assert_eq!(parsed, *tf);
        }
        assert!(Timeframe::parse("M7").is_err());
    }

    #[test]
    fn timeframe_periods() {
        assert_eq!(Timeframe::M15.period_secs(), 900);
        assert_eq!(Timeframe::H4.period_ms(), 14_400_000);
    }

    #[test]
    fn quote_freshness_and_spread() {
        let q = Quote {
            pair: Pair::parse("EURUSD").unwrap(),
            bid: 1.0850,
            ask: 1.0852,
            timestamp_ms: 1_000_000,
            provider: "twelveData".to_string(),
        };
        assert!(q.is_fresh(1_000_500, 600_000));
        assert!(!q.is_fresh(1_700_001, 600_000));
        assert!((q.spread_pips() - 2.0).abs() < 1e-6);
        assert!((q.mid() - 1.0851).abs() < 1e-9);
    }

    #[test]
    fn bar_sanity() {
        let good = Bar {
            timestamp_ms: 0,
            open: 1.0,
            high: 1.1,
            low: 0.9,
            close: 1.05,
            volume: Some(100.0),
            source: BarSource::Provider("finnhub".into()),
        };
        assert!(good.is_sane());

        let bad = Bar {
            high: 0.8,
            ..good.clone()
        };
        assert!(!bad.is_sane());

        let zero = Bar { open: 0.0, ..good };
        assert!(!zero.is_sane());
    }

    #[test]
    fn direction_sign() {
        assert_eq!(Direction::Buy.sign(), 1.0);
        assert_eq!(Direction::Sell.sign(), -1.0);
        assert!(!Direction::Neutral.is_directional());
    }
}
