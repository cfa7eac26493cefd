// =============================================================================
// Twelve Data provider — time_series bars and quote endpoint
// =============================================================================
//
// Twelve Data reports quota errors as HTTP 200 with a JSON `code` field, so
// the body is inspected before parsing values.
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::providers::{
    classify_status, classify_transport, http_client, parse_str_f64, MarketDataProvider,
    ProviderError,
};
use crate::types::{Bar, BarSource, Pair, Quote, Timeframe};

const BASE_URL: &str = "https://api.twelvedata.com";

pub struct TwelveDataProvider {
    api_key: Option<String>,
    client: reqwest::Client,
    base_url: String,
}

impl TwelveDataProvider {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key,
            client: http_client(Duration::from_secs(10)),
            base_url: BASE_URL.to_string(),
        }
    }

    /// Twelve Data symbols carry a slash between base and quote.
    fn symbol(pair: &Pair) -> String {
        format!("{}/{}", pair.base(), pair.quote())
    }

    fn interval(timeframe: Timeframe) -> &'static str {
        match timeframe {
            Timeframe::M1 => "1min",
            Timeframe::M5 => "5min",
            Timeframe::M15 => "15min",
            Timeframe::M30 => "30min",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1day",
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

        let body: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| ProviderError::Malformed(format!("invalid JSON: {e}")))?;

        // Quota errors arrive with HTTP 200 and a numeric `code` field.
        if let Some(code) = body.get("code").and_then(|c| c.as_u64()) {
            return Err(match code {
                429 => ProviderError::RateLimited {
                    retry_after_secs: None,
                },
                403 => ProviderError::Forbidden,
                other => ProviderError::Http {
                    status: other as u16,
                    body: body
                        .get("message")
                        .and_then(|m| m.as_str())
                        .unwrap_or("")
                        .chars()
                        .take(200)
                        .collect(),
                },
            });
        }

        Ok(body)
    }
}

#[async_trait]
impl MarketDataProvider for TwelveDataProvider {
    fn id(&self) -> &'static str {
        "twelveData"
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    fn quota_per_minute(&self) -> u32 {
        8
    }

    async fn fetch_bars(
        &self,
        pair: &Pair,
        timeframe: Timeframe,
        bar_count: usize,
        timeout: Duration,
    ) -> Result<Vec<Bar>, ProviderError> {
        let key = self.api_key.as_deref().ok_or(ProviderError::NotConfigured)?;
        let url = format!(
            "{}/time_series?symbol={}&interval={}&outputsize={}&apikey={}",
            self.base_url,
            Self::symbol(pair),
            Self::interval(timeframe),
            bar_count,
            key
        );

        let body = self.get_json(&url, timeout).await?;

        let values = body
            .get("values")
            .and_then(|v| v.as_array())
            .ok_or_else(|| ProviderError::Malformed("missing 'values' array".into()))?;

        if values.is_empty() {
            return Err(ProviderError::Empty);
        }

        // Values arrive newest-first; reverse into oldest-first order.
        let mut bars = Vec::with_capacity(values.len());
        for entry in values.iter().rev() {
            let datetime = entry
                .get("datetime")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ProviderError::Malformed("missing 'datetime'".into()))?;

            let timestamp_ms = parse_datetime_ms(datetime)?;
            let open = parse_str_f64(&entry["open"], "open")?;
            let high = parse_str_f64(&entry["high"], "high")?;
            let low = parse_str_f64(&entry["low"], "low")?;
            let close = parse_str_f64(&entry["close"], "close")?;
            let volume = entry
                .get("volume")
                .and_then(|v| parse_str_f64(v, "volume").ok());

            bars.push(Bar {
                timestamp_ms,
                open,
                high,
                low,
                close,
                volume,
                source: BarSource::Provider(self.id().to_string()),
            });
        }

        debug!(pair = %pair, timeframe = %timeframe, count = bars.len(), "twelveData bars fetched");
        Ok(bars)
    }

    async fn fetch_quote(&self, pair: &Pair, timeout: Duration) -> Result<Quote, ProviderError> {
        let key = self.api_key.as_deref().ok_or(ProviderError::NotConfigured)?;
        let url = format!(
            "{}/quote?symbol={}&apikey={}",
            self.base_url,
            Self::symbol(pair),
            key
        );

        let body = self.get_json(&url, timeout).await?;

        let close = parse_str_f64(&body["close"], "close")?;
        let timestamp_ms = body
            .get("timestamp")
            .and_then(|v| v.as_i64())
            .map(|secs| secs * 1000)
            .unwrap_or_else(crate::types::now_ms);

        // Bid/ask are plan-dependent; fall back to the last close when absent.
        let bid = body
            .get("bid")
            .and_then(|v| parse_str_f64(v, "bid").ok())
            .unwrap_or(close);
        let ask = body
            .get("ask")
            .and_then(|v| parse_str_f64(v, "ask").ok())
            .unwrap_or(close);

        Ok(Quote {
            pair: pair.clone(),
            bid,
            ask,
            timestamp_ms,
            provider: self.id().to_string(),
        })
    }
}

/// Parse Twelve Data's `YYYY-MM-DD HH:MM:SS` (or date-only) timestamps.
fn parse_datetime_ms(raw: &str) -> Result<i64, ProviderError> {
    use chrono::{NaiveDate, NaiveDateTime};

    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Ok(dt.and_utc().timestamp_millis());
    }
    if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(d
            .and_hms_opt(0, 0, 0)
            .expect("midnight is always valid")
            .and_utc()
            .timestamp_millis());
    }
    Err(ProviderError::Malformed(format!(
        "unparseable datetime '{raw}'"
    )))
}

impl std::fmt::Debug for TwelveDataProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwelveDataProvider")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
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
    fn symbol_format() {
        let pair = Pair::parse("EURUSD").unwrap();
        assert_eq!(TwelveDataProvider::symbol(&pair), "EUR/USD");
    }

    #[test]
    fn interval_mapping() {
        assert_eq!(TwelveDataProvider::interval(Timeframe::M15), "15min");
        assert_eq!(TwelveDataProvider::interval(Timeframe::H4), "4h");
        assert_eq!(TwelveDataProvider::interval(Timeframe::D1), "1day");
    }

    #[test]
    fn datetime_parsing() {
        let ms = parse_datetime_ms("2024-03-01 12:15:00").unwrap();
        assert_eq!(ms, 1_709_295_300_000);
        assert!(parse_datetime_ms("2024-03-01").is_ok());
        assert!(parse_datetime_ms("noon").is_err());
    }

    #[test]
    fn unconfigured_provider() {
        let p = TwelveDataProvider::new(None);
        assert!(!p.is_configured());
        assert_eq!(p.id(), "twelveData");
        assert_eq!(p.quota_per_minute(), 8);
    }
}
