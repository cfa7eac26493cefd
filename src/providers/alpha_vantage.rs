// =============================================================================
// Alpha Vantage provider — FX intraday/daily series and exchange-rate quote
// =============================================================================
//
// Alpha Vantage signals quota exhaustion with HTTP 200 and a `Note` or
// `Information` field in the body. Its intraday endpoint stops at 60min, so
// H4 requests are reported as unsupported and the fetcher rotates onward.
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::providers::{
    classify_status, classify_transport, http_client, parse_str_f64, MarketDataProvider,
    ProviderError,
};
use crate::types::{now_ms, Bar, BarSource, Pair, Quote, Timeframe};

const BASE_URL: &str = "https://www.alphavantage.co";

pub struct AlphaVantageProvider {
    api_key: Option<String>,
    client: reqwest::Client,
    base_url: String,
}

impl AlphaVantageProvider {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key,
            client: http_client(Duration::from_secs(10)),
            base_url: BASE_URL.to_string(),
        }
    }

    fn interval(timeframe: Timeframe) -> Option<&'static str> {
        match timeframe {
            Timeframe::M1 => Some("1min"),
            Timeframe::M5 => Some("5min"),
            Timeframe::M15 => Some("15min"),
            Timeframe::M30 => Some("30min"),
            Timeframe::H1 => Some("60min"),
            Timeframe::H4 => None,
            Timeframe::D1 => None,
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

        // Quota exhaustion arrives as HTTP 200 with a prose field.
        if body.get("Note").is_some() || body.get("Information").is_some() {
            return Err(ProviderError::RateLimited {
                retry_after_secs: None,
            });
        }
        if let Some(msg) = body.get("Error Message").and_then(|v| v.as_str()) {
            return Err(ProviderError::Malformed(msg.chars().take(200).collect()));
        }

        Ok(body)
    }

    /// Parse one `"1. open" / "2. high" / ...` series entry into a Bar.
    fn parse_series_entry(
        &self,
        datetime: &str,
        fields: &serde_json::Value,
    ) -> Result<Bar, ProviderError> {
        use chrono::{NaiveDate, NaiveDateTime};

        let timestamp_ms = NaiveDateTime::parse_from_str(datetime, "%Y-%m-%d %H:%M:%S")
            .map(|dt| dt.and_utc().timestamp_millis())
            .or_else(|_| {
                NaiveDate::parse_from_str(datetime, "%Y-%m-%d")
                    .map(|d| {
                        d.and_hms_opt(0, 0, 0)
                            .expect("midnight is always valid")
                            .and_utc()
                            .timestamp_millis()
                    })
            })
            .map_err(|_| ProviderError::Malformed(format!("unparseable datetime '{datetime}'")))?;

        Ok(Bar {
            timestamp_ms,
            open: parse_str_f64(&fields["1. open"], "1. open")?,
            high: parse_str_f64(&fields["2. high"], "2. high")?,
            low: parse_str_f64(&fields["3. low"], "3. low")?,
            close: parse_str_f64(&fields["4. close"], "4. close")?,
            volume: None,
            source: BarSource::Provider(self.id().to_string()),
        })
    }
}

#[async_trait]
impl MarketDataProvider for AlphaVantageProvider {
    fn id(&self) -> &'static str {
        "alphaVantage"
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

        let (url, series_key) = if timeframe == Timeframe::D1 {
            (
                format!(
                    "{}/query?function=FX_DAILY&from_symbol={}&to_symbol={}&outputsize=compact&apikey={}",
                    self.base_url,
                    pair.base(),
                    pair.quote(),
                    key
                ),
                "Time Series FX (Daily)".to_string(),
            )
        } else {
            let interval = Self::interval(timeframe)
                .ok_or_else(|| ProviderError::Unsupported(format!("interval {timeframe}")))?;
            (
                format!(
                    "{}/query?function=FX_INTRADAY&from_symbol={}&to_symbol={}&interval={}&outputsize=full&apikey={}",
                    self.base_url,
                    pair.base(),
                    pair.quote(),
                    interval,
                    key
                ),
                format!("Time Series FX ({interval})"),
            )
        };

        let body = self.get_json(&url, timeout).await?;

        let series = body
            .get(&series_key)
            .and_then(|v| v.as_object())
            .ok_or_else(|| ProviderError::Malformed(format!("missing '{series_key}'")))?;

        if series.is_empty() {
            return Err(ProviderError::Empty);
        }

        // Object keys are datetimes, newest first once sorted descending;
        // sort ascending and take the most recent `bar_count`.
        let mut entries: Vec<(&String, &serde_json::Value)> = series.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        let start = entries.len().saturating_sub(bar_count);
        let mut bars = Vec::with_capacity(entries.len() - start);
        for (datetime, fields) in &entries[start..] {
            bars.push(self.parse_series_entry(datetime, fields)?);
        }

        debug!(pair = %pair, timeframe = %timeframe, count = bars.len(), "alphaVantage bars fetched");
        Ok(bars)
    }

    async fn fetch_quote(&self, pair: &Pair, timeout: Duration) -> Result<Quote, ProviderError> {
        let key = self.api_key.as_deref().ok_or(ProviderError::NotConfigured)?;
        let url = format!(
            "{}/query?function=CURRENCY_EXCHANGE_RATE&from_currency={}&to_currency={}&apikey={}",
            self.base_url,
            pair.base(),
            pair.quote(),
            key
        );

        let body = self.get_json(&url, timeout).await?;

        let rate = body
            .get("Realtime Currency Exchange Rate")
            .ok_or_else(|| ProviderError::Malformed("missing exchange rate object".into()))?;

        let mid = parse_str_f64(&rate["5. Exchange Rate"], "5. Exchange Rate")?;
        let bid = rate
            .get("8. Bid Price")
            .and_then(|v| parse_str_f64(v, "8. Bid Price").ok())
            .unwrap_or(mid);
        let ask = rate
            .get("9. Ask Price")
            .and_then(|v| parse_str_f64(v, "9. Ask Price").ok())
            .unwrap_or(mid);

        Ok(Quote {
            pair: pair.clone(),
            bid,
            ask,
            timestamp_ms: now_ms(),
            provider: self.id().to_string(),
        })
    }
}

impl std::fmt::Debug for AlphaVantageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlphaVantageProvider")
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
    fn interval_mapping() {
        assert_eq!(AlphaVantageProvider::interval(Timeframe::M15), Some("15min"));
        assert_eq!(AlphaVantageProvider::interval(Timeframe::H1), Some("60min"));
        assert_eq!(AlphaVantageProvider::interval(Timeframe::H4), None);
    }

    #[test]
    fn series_entry_parsing() {
        let p = AlphaVantageProvider::new(Some("k".into()));
        let fields = serde_json::json!({
            "1. open": "1.0850",
            "2. high": "1.0860",
            "3. low": "1.0840",
            "4. close": "1.0855"
        });
        let bar = p.parse_series_entry("2024-03-01 12:15:00", &fields).unwrap();
        assert!((bar.close - 1.0855).abs() < 1e-9);
        assert!(bar.is_sane());
        assert_eq!(bar.source, BarSource::Provider("alphaVantage".into()));
    }

    #[test]
    fn unconfigured_provider() {
        let p = AlphaVantageProvider::new(None);
        assert!(!p.is_configured());
        assert_eq!(p.quota_per_minute(), 5);
    }
}
