// =============================================================================
// Market-data fetcher — provider fan-out with validation and failover
// =============================================================================
//
// For every request the configured preference list is filtered down to
// providers that are configured, not in backoff and not breaker-blocked,
// then sorted by composite quality (descending) with mean latency as the
// tie-break. Providers are tried in order until one returns a response that
// passes bar validation; every outcome is recorded against the responsible
// provider.
//
// When all providers fail and synthetic data is allowed, a deterministic
// walk is returned tagged `source=synthetic`. Under REQUIRE_REALTIME_DATA
// the failure surfaces instead.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use tracing::{debug, warn};

use crate::market_data::metrics::ProviderMetricsRegistry;
use crate::providers::{synthetic, MarketDataProvider, ProviderError};
use crate::types::{now_ms, Bar, Pair, Quote, Timeframe};

/// Allowed bar-count request range.
pub const MIN_BAR_COUNT: usize = 1;
pub const MAX_BAR_COUNT: usize = 5000;

/// Default network timeouts.
const BARS_TIMEOUT: Duration = Duration::from_secs(10);
const QUOTE_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval tolerance for bar validation (±20% of the timeframe period).
const INTERVAL_TOLERANCE: f64 = 0.20;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Per-call options. `purpose` is a free-form label used in metric
/// attribution and logs.
#[derive(Debug, Clone)]
pub struct FetchOpts {
    pub purpose: String,
    pub timeout: Option<Duration>,
    pub disabled_providers: Vec<String>,
    /// Overrides the fetcher-level synthetic policy when set.
    pub allow_synthetic: Option<bool>,
}

impl Default for FetchOpts {
    fn default() -> Self {
        Self {
            purpose: "unspecified".to_string(),
            timeout: None,
            disabled_providers: Vec::new(),
            allow_synthetic: None,
        }
    }
}

impl FetchOpts {
    pub fn with_purpose(purpose: &str) -> Self {
        Self {
            purpose: purpose.to_string(),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------------------

pub struct MarketDataFetcher {
    providers: Vec<Arc<dyn MarketDataProvider>>,
    metrics: Arc<ProviderMetricsRegistry>,
    allow_synthetic: bool,
    require_realtime: bool,
    /// Most recent quote per pair, served to bridge read endpoints.
    last_quotes: parking_lot::RwLock<std::collections::HashMap<Pair, Quote>>,
}

impl MarketDataFetcher {
    /// Build a fetcher over the given preference-ordered provider list.
    pub fn new(
        providers: Vec<Arc<dyn MarketDataProvider>>,
        metrics: Arc<ProviderMetricsRegistry>,
        allow_synthetic: bool,
        require_realtime: bool,
    ) -> Self {
        for p in &providers {
            metrics.register(p.id(), p.quota_per_minute());
        }
        Self {
            providers,
            metrics,
            allow_synthetic,
            require_realtime,
            last_quotes: parking_lot::RwLock::new(std::collections::HashMap::new()),
        }
    }

    /// Cached quotes not older than `max_age_ms`.
    pub fn cached_quotes(&self, max_age_ms: i64) -> Vec<Quote> {
        let now = now_ms();
        let mut quotes: Vec<Quote> = self
            .last_quotes
            .read()
            .values()
            .filter(|q| q.is_fresh(now, max_age_ms))
            .cloned()
            .collect();
        quotes.sort_by(|a, b| a.pair.as_str().cmp(b.pair.as_str()));
        quotes
    }

    /// Ids of all registered providers with their configuration status.
    pub fn provider_states(&self) -> Vec<(String, bool)> {
        self.providers
            .iter()
            .map(|p| (p.id().to_string(), p.is_configured()))
            .collect()
    }

    /// Whether synthetic fallback would be used for a fully-failed call.
    pub fn synthetic_allowed(&self, opts: &FetchOpts) -> bool {
        opts.allow_synthetic.unwrap_or(self.allow_synthetic) && !self.require_realtime
    }

    // -------------------------------------------------------------------------
    // Bars
    // -------------------------------------------------------------------------

    /// Fetch `bar_count` historical bars, trying providers in quality order.
    pub async fn fetch_bars(
        &self,
        pair: &Pair,
        timeframe: Timeframe,
        bar_count: usize,
        opts: &FetchOpts,
    ) -> Result<Vec<Bar>> {
        if !(MIN_BAR_COUNT..=MAX_BAR_COUNT).contains(&bar_count) {
            bail!(
                "bar_count {} out of range [{}, {}]",
                bar_count,
                MIN_BAR_COUNT,
                MAX_BAR_COUNT
            );
        }

        let timeout = opts.timeout.unwrap_or(BARS_TIMEOUT);
        let candidates = self.ordered_candidates(opts);

        for provider in &candidates {
            let id = provider.id();
            if !self.metrics.try_consume_quota(id, now_ms()) {
                debug!(provider = id, purpose = %opts.purpose, "quota exhausted — skipping");
                continue;
            }

            let started = Instant::now();
            match provider.fetch_bars(pair, timeframe, bar_count, timeout).await {
                Ok(bars) => {
                    let latency = started.elapsed().as_millis() as f64;
                    match validate_bars(&bars, timeframe) {
                        Ok(()) => {
                            self.metrics.record_success(id, latency, now_ms());
                            debug!(
                                provider = id,
                                pair = %pair,
                                timeframe = %timeframe,
                                count = bars.len(),
                                purpose = %opts.purpose,
                                "bars fetched"
                            );
                            return Ok(bars);
                        }
                        Err(reason) => {
                            // Invalid payloads count as failures against the
                            // responsible provider.
                            let err = ProviderError::Malformed(reason.clone());
                            self.metrics.record_failure(id, &err, now_ms());
                            warn!(provider = id, pair = %pair, reason, "bar validation failed");
                        }
                    }
                }
                Err(err) => {
                    self.metrics.record_failure(id, &err, now_ms());
                    debug!(provider = id, pair = %pair, error = %err, "provider call failed");
                }
            }
        }

        if self.synthetic_allowed(opts) {
            warn!(pair = %pair, timeframe = %timeframe, purpose = %opts.purpose, "all providers failed — returning synthetic bars");
            return Ok(synthetic::synthetic_bars(pair, timeframe, bar_count, now_ms()));
        }

        bail!("no_providers_available: {pair} {timeframe} ({})", opts.purpose);
    }

    // -------------------------------------------------------------------------
    // Quotes
    // -------------------------------------------------------------------------

    /// Fetch the current quote, or None when no provider can supply one and
    /// synthetic data is disallowed.
    pub async fn fetch_quote(&self, pair: &Pair, opts: &FetchOpts) -> Result<Option<Quote>> {
        let timeout = opts.timeout.unwrap_or(QUOTE_TIMEOUT);
        let candidates = self.ordered_candidates(opts);

        for provider in &candidates {
            let id = provider.id();
            if !self.metrics.try_consume_quota(id, now_ms()) {
                continue;
            }

            let started = Instant::now();
            match provider.fetch_quote(pair, timeout).await {
                Ok(quote) => {
                    if quote.bid > 0.0 && quote.ask >= quote.bid {
                        let latency = started.elapsed().as_millis() as f64;
                        self.metrics.record_success(id, latency, now_ms());
                        self.last_quotes
                            .write()
                            .insert(pair.clone(), quote.clone());
                        return Ok(Some(quote));
                    }
                    let err = ProviderError::Malformed("inverted or non-positive quote".into());
                    self.metrics.record_failure(id, &err, now_ms());
                }
                Err(err) => {
                    self.metrics.record_failure(id, &err, now_ms());
                    debug!(provider = id, pair = %pair, error = %err, "quote fetch failed");
                }
            }
        }

        if self.synthetic_allowed(opts) {
            let quote = synthetic::synthetic_quote(pair, now_ms());
            self.last_quotes
                .write()
                .insert(pair.clone(), quote.clone());
            return Ok(Some(quote));
        }
        Ok(None)
    }

    // -------------------------------------------------------------------------
    // Provider ordering
    // -------------------------------------------------------------------------

    /// Preference list filtered by availability, sorted by quality then
    /// latency.
    fn ordered_candidates(&self, opts: &FetchOpts) -> Vec<Arc<dyn MarketDataProvider>> {
        let now = now_ms();
        let mut eligible: Vec<Arc<dyn MarketDataProvider>> = self
            .providers
            .iter()
            .filter(|p| {
                let id = p.id();
                p.is_configured()
                    && !opts.disabled_providers.iter().any(|d| d == id)
                    && !self.metrics.in_backoff(id, now)
                    && !self.metrics.breaker_blocks(id, now)
            })
            .cloned()
            .collect();

        eligible.sort_by(|a, b| {
            let qa = self.metrics.quality(a.id());
            let qb = self.metrics.quality(b.id());
            qb.partial_cmp(&qa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let la = self.metrics.mean_latency_ms(a.id());
                    let lb = self.metrics.mean_latency_ms(b.id());
                    la.partial_cmp(&lb).unwrap_or(std::cmp::Ordering::Equal)
                })
        });
        eligible
    }
}

impl std::fmt::Debug for MarketDataFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<&str> = self.providers.iter().map(|p| p.id()).collect();
        f.debug_struct("MarketDataFetcher")
            .field("providers", &ids)
            .field("allow_synthetic", &self.allow_synthetic)
            .field("require_realtime", &self.require_realtime)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Bar validation
// ---------------------------------------------------------------------------

/// Validate a provider bar series: non-empty, strictly increasing
/// timestamps, sane prices, and intervals consistent with the timeframe
/// period (±20%). Larger gaps (weekends, holidays) are tolerated as long as
/// the typical interval matches.
pub fn validate_bars(bars: &[Bar], timeframe: Timeframe) -> std::result::Result<(), String> {
    if bars.is_empty() {
        return Err("empty bar series".to_string());
    }
    if let Some(bad) = bars.iter().find(|b| !b.is_sane()) {
        return Err(format!(
            "insane bar at ts {} (zero/negative or inverted prices)",
            bad.timestamp_ms
        ));
    }
    if bars.len() == 1 {
        return Ok(());
    }

    let period = timeframe.period_ms() as f64;
    let min_allowed = period * (1.0 - INTERVAL_TOLERANCE);
    let max_allowed = period * (1.0 + INTERVAL_TOLERANCE);

    let mut intervals = Vec::with_capacity(bars.len() - 1);
    for w in bars.windows(2) {
        let dt = (w[1].timestamp_ms - w[0].timestamp_ms) as f64;
        if dt <= 0.0 {
            return Err("non-monotonic timestamps".to_string());
        }
        if dt < min_allowed {
            return Err(format!(
                "interval {dt}ms below tolerance for {timeframe}"
            ));
        }
        intervals.push(dt);
    }

    // The typical (median) interval must match the timeframe period even if
    // individual gaps are larger.
    intervals.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let median = intervals[intervals.len() / 2];
    if median > max_allowed {
        return Err(format!(
            "median interval {median}ms exceeds tolerance for {timeframe}"
        ));
    }

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BarSource;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    // -----------------------------------------------------------------------
    // Mock provider
    // -----------------------------------------------------------------------

    struct MockProvider {
        id: &'static str,
        configured: bool,
        bars_script: Mutex<VecDeque<Result<Vec<Bar>, ProviderError>>>,
        calls: Mutex<u32>,
    }

    impl MockProvider {
        fn new(id: &'static str, script: Vec<Result<Vec<Bar>, ProviderError>>) -> Arc<Self> {
            Arc::new(Self {
                id,
                configured: true,
                bars_script: Mutex::new(script.into()),
                calls: Mutex::new(0),
            })
        }

        fn call_count(&self) -> u32 {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl MarketDataProvider for MockProvider {
        fn id(&self) -> &'static str {
            self.id
        }

        fn is_configured(&self) -> bool {
            self.configured
        }

        fn quota_per_minute(&self) -> u32 {
            1000
        }

        async fn fetch_bars(
            &self,
            _pair: &Pair,
            _timeframe: Timeframe,
            _bar_count: usize,
            _timeout: Duration,
        ) -> Result<Vec<Bar>, ProviderError> {
            *self.calls.lock() += 1;
            self.bars_script
                .lock()
                .pop_front()
                .unwrap_or(Err(ProviderError::Empty))
        }

        async fn fetch_quote(
            &self,
            pair: &Pair,
            _timeout: Duration,
        ) -> Result<Quote, ProviderError> {
            *self.calls.lock() += 1;
            Ok(Quote {
                pair: pair.clone(),
                bid: 1.0850,
                ask: 1.0852,
                timestamp_ms: now_ms(),
                provider: self.id.to_string(),
            })
        }
    }

    fn good_bars(count: usize, timeframe: Timeframe) -> Vec<Bar> {
        let period = timeframe.period_ms();
        let start = (now_ms() / period) * period - period * count as i64;
        (0..count)
            .map(|i| Bar {
                timestamp_ms: start + period * i as i64,
                open: 1.0850,
                high: 1.0860,
                low: 1.0840,
                close: 1.0855,
                volume: Some(1000.0),
                source: BarSource::Provider("mock".into()),
            })
            .collect()
    }

    fn eurusd() -> Pair {
        Pair::parse("EURUSD").unwrap()
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    #[test]
    fn validation_accepts_clean_series() {
        let bars = good_bars(50, Timeframe::M15);
        assert!(validate_bars(&bars, Timeframe::M15).is_ok());
    }

    #[test]
    fn validation_rejects_non_monotonic() {
        let mut bars = good_bars(10, Timeframe::M15);
        bars.swap(3, 4);
        assert!(validate_bars(&bars, Timeframe::M15).is_err());
    }

    #[test]
    fn validation_rejects_zero_prices() {
        let mut bars = good_bars(10, Timeframe::M15);
        bars[5].close = 0.0;
        bars[5].low = 0.0;
        assert!(validate_bars(&bars, Timeframe::M15).is_err());
    }

    #[test]
    fn validation_tolerates_weekend_gaps() {
        let mut bars = good_bars(50, Timeframe::M15);
        // Inject one 48h gap by shifting the tail.
        for b in bars.iter_mut().skip(25) {
            b.timestamp_ms += 48 * 3_600_000;
        }
        assert!(validate_bars(&bars, Timeframe::M15).is_ok());
    }

    #[test]
    fn validation_rejects_wrong_period() {
        let bars = good_bars(50, Timeframe::M5);
        assert!(validate_bars(&bars, Timeframe::M15).is_err());
    }

    // -----------------------------------------------------------------------
    // Failover (scenario C)
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn failover_after_rate_limit() {
        let p1 = MockProvider::new(
            "first",
            vec![Err(ProviderError::RateLimited {
                retry_after_secs: Some(30),
            })],
        );
        let p2 = MockProvider::new("second", vec![Ok(good_bars(30, Timeframe::M15))]);

        let metrics = Arc::new(ProviderMetricsRegistry::new());
        let fetcher = MarketDataFetcher::new(
            vec![p1.clone(), p2.clone()],
            metrics.clone(),
            false,
            true,
        );

        let bars = fetcher
            .fetch_bars(&eurusd(), Timeframe::M15, 30, &FetchOpts::with_purpose("test"))
            .await
            .unwrap();
        assert_eq!(bars.len(), 30);
        assert_eq!(p1.call_count(), 1);
        assert_eq!(p2.call_count(), 1);

        // Provider 1 recorded the rate limit with ~30s backoff.
        let m1 = metrics.snapshot("first", now_ms()).unwrap();
        assert_eq!(m1.failed, 1);
        assert_eq!(m1.rate_limited, 1);
        assert!(m1.backoff_seconds >= 29 && m1.backoff_seconds <= 30);

        // Next call selects provider 2 directly (provider 1 in backoff).
        let _ = fetcher
            .fetch_bars(&eurusd(), Timeframe::M15, 30, &FetchOpts::with_purpose("test"))
            .await;
        assert_eq!(p1.call_count(), 1);
        assert_eq!(p2.call_count(), 2);
    }

    #[tokio::test]
    async fn strict_mode_surfaces_failure() {
        let p1 = MockProvider::new("only", vec![Err(ProviderError::Timeout)]);
        let metrics = Arc::new(ProviderMetricsRegistry::new());
        let fetcher = MarketDataFetcher::new(vec![p1], metrics, false, true);

        let err = fetcher
            .fetch_bars(&eurusd(), Timeframe::M15, 30, &FetchOpts::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no_providers_available"));
    }

    #[tokio::test]
    async fn synthetic_fallback_when_allowed() {
        let p1 = MockProvider::new("only", vec![Err(ProviderError::Timeout)]);
        let metrics = Arc::new(ProviderMetricsRegistry::new());
        let fetcher = MarketDataFetcher::new(vec![p1], metrics, true, false);

        let bars = fetcher
            .fetch_bars(&eurusd(), Timeframe::M15, 40, &FetchOpts::default())
            .await
            .unwrap();
        assert_eq!(bars.len(), 40);
        assert!(bars.iter().all(|b| b.source == BarSource::Synthetic));
    }

    #[tokio::test]
    async fn bar_count_bounds_enforced() {
        let metrics = Arc::new(ProviderMetricsRegistry::new());
        let fetcher = MarketDataFetcher::new(vec![], metrics, true, false);
        assert!(fetcher
            .fetch_bars(&eurusd(), Timeframe::M15, 0, &FetchOpts::default())
            .await
            .is_err());
        assert!(fetcher
            .fetch_bars(&eurusd(), Timeframe::M15, 5001, &FetchOpts::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn unconfigured_providers_are_skipped() {
        let p1 = Arc::new(MockProvider {
            id: "unconfigured",
            configured: false,
            bars_script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(0),
        });
        let p2 = MockProvider::new("ready", vec![Ok(good_bars(20, Timeframe::H1))]);
        let metrics = Arc::new(ProviderMetricsRegistry::new());
        let fetcher = MarketDataFetcher::new(vec![p1.clone(), p2], metrics, false, true);

        let bars = fetcher
            .fetch_bars(&eurusd(), Timeframe::H1, 20, &FetchOpts::default())
            .await
            .unwrap();
        assert_eq!(bars.len(), 20);
        assert_eq!(p1.call_count(), 0);
    }
}
