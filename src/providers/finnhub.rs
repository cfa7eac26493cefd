// =============================================================================
// Finnhub provider — forex candle and quote endpoints
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::providers::{
    classify_status, classify_transport, http_client, MarketDataProvider, ProviderError,
};
use crate::types::{now_ms, Bar, BarSource, Pair, Quote, Timeframe};

const BASE_URL: &str = "https://finnhub.io/api/v1";

pub struct FinnhubProvider {
    api_key: Option<String>,
    client: reqwest::Client,
    base_url: String,
}

impl FinnhubProvider {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key,
            client: http_client(Duration::from_secs(10)),
            base_url: BASE_URL.to_string(),
        }
    }

    /// Finnhub forex symbols are venue-prefixed with an underscore split.
    fn symbol(pair: &Pair) -> String {
        format!("OANDA:{}_{}", pair.base(), pair.quote())
    }

    fn resolution(timeframe: Timeframe) -> &'static str {
        match timeframe {
            Timeframe::M1 => "1",
            Timeframe::M5 => "5",
            Timeframe::M15 => "15",
            Timeframe::M30 => "30",
            Timeframe::H1 => "60",
            Timeframe::H4 => "240",
            Timeframe::D1 => "D",
        }
    }

    async fn get_json(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<serde_json::Value, ProviderError> {
        let resp = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let text = resp.text().await.map_err(classify_transport)?;

        if !status.is_success() {
            return Err(classify_status(status, &headers, &text));
        }

        serde_json::from_str(&text)
            .map_err(|e| ProviderError::Malformed(format!("invalid JSON: {e}")))
    }
}

#[async_trait]
impl MarketDataProvider for FinnhubProvider {
    fn id(&self) -> &'static str {
        "finnhub"
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    fn quota_per_minute(&self) -> u32 {
        60
    }

    async fn fetch_bars(
        &self,
        pair: &Pair,
        timeframe: Timeframe,
        bar_count: usize,
        timeout: Duration,
    ) -> Result<Vec<Bar>, ProviderError> {
        let key = self.api_key.as_deref().ok_or(ProviderError::NotConfigured)?;

        let to_secs = now_ms() / 1000;
        // Pad the window slightly so weekend gaps still yield enough bars.
        let span_secs = timeframe.period_secs() as i64 * bar_count as i64;
        let from_secs = to_secs - span_secs - span_secs / 2;

        let url = format!(
            "{}/forex/candle?symbol={}&resolution={}&from={}&to={}&token={}",
            self.base_url,
            Self::symbol(pair),
            Self::resolution(timeframe),
            from_secs,
            to_secs,
            key
        );

        let body = self.get_json(&url, timeout).await?;

        match body.get("s").and_then(|v| v.as_str()) {
            Some("ok") => {}
            Some("no_data") => return Err(ProviderError::Empty),
            other => {
                return Err(ProviderError::Malformed(format!(
                    "unexpected status field: {other:?}"
                )))
            }
        }

        let t = body["t"]
            .as_array()
            .ok_or_else(|| ProviderError::Malformed("missing 't' array".into()))?;
        let o = body["o"]
            .as_array()
            .ok_or_else(|| ProviderError::Malformed("missing 'o' array".into()))?;
        let h = body["h"]
            .as_array()
            .ok_or_else(|| ProviderError::Malformed("missing 'h' array".into()))?;
        let l = body["l"]
            .as_array()
            .ok_or_else(|| ProviderError::Malformed("missing 'l' array".into()))?;
        let c = body["c"]
            .as_array()
            .ok_or_else(|| ProviderError::Malformed("missing 'c' array".into()))?;
        let v = body.get("v").and_then(|x| x.as_array());

        let len = t.len();
        if len == 0 {
            return Err(ProviderError::Empty);
        }
        if [o.len(), h.len(), l.len(), c.len()].iter().any(|&n| n != len) {
            return Err(ProviderError::Malformed("mismatched candle arrays".into()));
        }

        let mut bars = Vec::with_capacity(len.min(bar_count));
        let start = len.saturating_sub(bar_count);
        for i in start..len {
            let ts = t[i]
                .as_i64()
                .ok_or_else(|| ProviderError::Malformed("non-integer timestamp".into()))?;
            bars.push(Bar {
                timestamp_ms: ts * 1000,
                open: o[i].as_f64().unwrap_or(0.0),
                high: h[i].as_f64().unwrap_or(0.0),
                low: l[i].as_f64().unwrap_or(0.0),
                close: c[i].as_f64().unwrap_or(0.0),
                volume: v.and_then(|arr| arr.get(i)).and_then(|x| x.as_f64()),
                source: BarSource::Provider(self.id().to_string()),
            });
        }

        debug!(pair = %pair, timeframe = %timeframe, count = bars.len(), "finnhub bars fetched");
        Ok(bars)
    }

    async fn fetch_quote(&self, pair: &Pair, timeout: Duration) -> Result<Quote, ProviderError> {
        let key = self.api_key.as_deref().ok_or(ProviderError::NotConfigured)?;
        let url = format!(
            "{}/quote?symbol={}&token={}",
            self.base_url,
            Self::symbol(pair),
            key
        );

        let body = self.get_json(&url, timeout).await?;

        let current = body["c"]
            .as_f64()
            .filter(|p| *p > 0.0)
            .ok_or_else(|| ProviderError::Malformed("missing current price".into()))?;
        let timestamp_ms = body["t"].as_i64().map(|s| s * 1000).unwrap_or_else(now_ms);

        // Finnhub's quote endpoint carries a single price; bid == ask.
        Ok(Quote {
            pair: pair.clone(),
            bid: current,
            ask: current,
            timestamp_ms,
            provider: self.id().to_string(),
        })
    }
}

impl std::fmt::Debug for FinnhubProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinnhubProvider")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
