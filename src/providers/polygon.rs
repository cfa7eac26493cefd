// =============================================================================
// Polygon provider — aggregate bars and last-quote endpoints
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::providers::{
    classify_status, classify_transport, http_client, MarketDataProvider, ProviderError,
};
use crate::types::{now_ms, Bar, BarSource, Pair, Quote, Timeframe};

const BASE_URL: &str = "https://api.polygon.io";

pub struct PolygonProvider {
    api_key: Option<String>,
    client: reqwest::Client,
    base_url: String,
}

impl PolygonProvider {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key,
            client: http_client(Duration::from_secs(10)),
            base_url: BASE_URL.to_string(),
        }
    }

    /// Polygon forex tickers carry the `C:` prefix.
    fn ticker(pair: &Pair) -> String {
        format!("C:{}", pair.as_str())
    }

    /// (multiplier, timespan) for the aggregates endpoint.
    fn range(timeframe: Timeframe) -> (u32, &'static str) {
        match timeframe {
            Timeframe::M1 => (1, "minute"),
            Timeframe::M5 => (5, "minute"),
            Timeframe::M15 => (15, "minute"),
            Timeframe::M30 => (30, "minute"),
            Timeframe::H1 => (1, "hour"),
            Timeframe::H4 => (4, "hour"),
            Timeframe::D1 => (1, "day"),
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
impl MarketDataProvider for PolygonProvider {
    fn id(&self) -> &'static str {
        "polygon"
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    fn quota_per_minute(&self) -> u32 {
        5
    }

    async fn fetch_bars(
        &self,
        pair: &Pair,
        timeframe: Timeframe,
        bar_count: usize,
        timeout: Duration,
    ) -> Result<Vec<Bar>, ProviderError> {
        let key = self.api_key.as_deref().ok_or(ProviderError::NotConfigured)?;

        let (mult, span) = Self::range(timeframe);
        let to_ms = now_ms();
        let window_ms = timeframe.period_ms() * bar_count as i64;
        let from_ms = to_ms - window_ms - window_ms / 2;

        let url = format!(
            "{}/v2/aggs/ticker/{}/range/{}/{}/{}/{}?adjusted=true&sort=asc&limit={}&apiKey={}",
            self.base_url,
            Self::ticker(pair),
            mult,
            span,
            from_ms,
            to_ms,
            bar_count.max(50),
            key
        );

        let body = self.get_json(&url, timeout).await?;

        let results = body
            .get("results")
            .and_then(|v| v.as_array())
            .ok_or(ProviderError::Empty)?;

        if results.is_empty() {
            return Err(ProviderError::Empty);
        }

        let mut bars = Vec::with_capacity(results.len().min(bar_count));
        let start = results.len().saturating_sub(bar_count);
        for entry in &results[start..] {
            let ts = entry["t"]
                .as_i64()
                .ok_or_else(|| ProviderError::Malformed("missing 't' field".into()))?;
            bars.push(Bar {
                timestamp_ms: ts,
                open: entry["o"].as_f64().unwrap_or(0.0),
                high: entry["h"].as_f64().unwrap_or(0.0),
                low: entry["l"].as_f64().unwrap_or(0.0),
                close: entry["c"].as_f64().unwrap_or(0.0),
                volume: entry.get("v").and_then(|v| v.as_f64()),
                source: BarSource::Provider(self.id().to_string()),
            });
        }

        debug!(pair = %pair, timeframe = %timeframe, count = bars.len(), "polygon bars fetched");
        Ok(bars)
    }

    async fn fetch_quote(&self, pair: &Pair, timeout: Duration) -> Result<Quote, ProviderError> {
        let key = self.api_key.as_deref().ok_or(ProviderError::NotConfigured)?;
        let url = format!(
            "{}/v1/last_quote/currencies/{}/{}?apiKey={}",
            self.base_url,
            pair.base(),
            pair.quote(),
            key
        );

        let body = self.get_json(&url, timeout).await?;

        let last = body
            .get("last")
            .ok_or_else(|| ProviderError::Malformed("missing 'last' object".into()))?;
        let bid = last["bid"]
            .as_f64()
            .filter(|p| *p > 0.0)
            .ok_or_else(|| ProviderError::Malformed("missing bid".into()))?;
        let ask = last["ask"]
            .as_f64()
            .filter(|p| *p > 0.0)
            .ok_or_else(|| ProviderError::Malformed("missing ask".into()))?;
        let timestamp_ms = last["timestamp"].as_i64().unwrap_or_else(now_ms);

        Ok(Quote {
            pair: pair.clone(),
            bid,
            ask,
            timestamp_ms,
            provider: self.id().to_string(),
        })
    }
}

impl std::fmt::Debug for PolygonProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolygonProvider")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
