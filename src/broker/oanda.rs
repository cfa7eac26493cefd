// =============================================================================
// OANDA connector — v20 REST API with bearer authentication
// =============================================================================
//
// Instruments use the underscore form (`EUR_USD`); volumes are converted
// from lots to signed units (negative = short). Practice and live hosts are
// selected at construction.
// =============================================================================

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::broker::{
    AccountInfo, AccountMode, BrokerConnector, BrokerFill, BrokerPosition, NormalizedOrder,
};
use crate::types::{Direction, Pair};

const PRACTICE_URL: &str = "https://api-fxpractice.oanda.com";
const LIVE_URL: &str = "https://api-fxtrade.oanda.com";
/// Units per standard lot.
const UNITS_PER_LOT: f64 = 100_000.0;

pub struct OandaConnector {
    api_key: String,
    account_id: String,
    practice: bool,
    client: reqwest::Client,
    base_url: String,
}

impl OandaConnector {
    pub fn new(api_key: String, account_id: String, practice: bool) -> Self {
        let base_url = if practice { PRACTICE_URL } else { LIVE_URL };
        Self {
            api_key,
            account_id,
            practice,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .expect("failed to build reqwest client"),
            base_url: base_url.to_string(),
        }
    }

    /// `EURUSD` -> `EUR_USD`.
    fn instrument(pair: &Pair) -> String {
        format!("{}_{}", pair.base(), pair.quote())
    }

    fn auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.bearer_auth(&self.api_key)
    }

    async fn get_json(&self, path: &str) -> Result<serde_json::Value> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .auth(self.client.get(&url))
            .send()
            .await
            .with_context(|| format!("GET {path} failed"))?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("GET {path}: unparseable body"))?;
        if !status.is_success() {
            bail!("OANDA GET {path} returned {status}: {body}");
        }
        Ok(body)
    }

    fn parse_f64(val: &serde_json::Value) -> f64 {
        match val {
            serde_json::Value::String(s) => s.parse().unwrap_or(0.0),
            serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
            _ => 0.0,
        }
    }
}

#[async_trait]
impl BrokerConnector for OandaConnector {
    fn id(&self) -> &str {
        "oanda"
    }

    fn is_enabled(&self) -> bool {
        !self.api_key.is_empty() && !self.account_id.is_empty()
    }

    async fn is_connected(&self) -> bool {
        if !self.is_enabled() {
            return false;
        }
        self.get_json(&format!("/v3/accounts/{}/summary", self.account_id))
            .await
            .is_ok()
    }

    fn account_mode(&self) -> AccountMode {
        if self.practice {
            AccountMode::Demo
        } else {
            AccountMode::Live
        }
    }

    async fn get_account_info(&self) -> Result<AccountInfo> {
        let body = self
            .get_json(&format!("/v3/accounts/{}/summary", self.account_id))
            .await?;
        let account = body
            .get("account")
            .context("summary response missing 'account'")?;

        Ok(AccountInfo {
            account_id: self.account_id.clone(),
            balance: Self::parse_f64(&account["balance"]),
            equity: Self::parse_f64(&account["NAV"]),
            currency: account["currency"].as_str().unwrap_or("USD").to_string(),
            mode: self.account_mode(),
        })
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>> {
        let body = self
            .get_json(&format!("/v3/accounts/{}/openTrades", self.account_id))
            .await?;
        let trades = body
            .get("trades")
            .and_then(|v| v.as_array())
            .context("openTrades response missing 'trades'")?;

        let mut positions = Vec::with_capacity(trades.len());
        for trade in trades {
            let units = Self::parse_f64(&trade["currentUnits"]);
            let instrument = trade["instrument"].as_str().unwrap_or_default();
            positions.push(BrokerPosition {
                id: trade["id"].as_str().unwrap_or_default().to_string(),
                pair: instrument.replace('_', ""),
                direction: if units >= 0.0 {
                    Direction::Buy
                } else {
                    Direction::Sell
                },
                volume: units.abs() / UNITS_PER_LOT,
                entry_price: Self::parse_f64(&trade["price"]),
                stop_loss: trade
                    .get("stopLossOrder")
                    .map(|o| Self::parse_f64(&o["price"])),
                take_profit: trade
                    .get("takeProfitOrder")
                    .map(|o| Self::parse_f64(&o["price"])),
                current_pnl: Some(Self::parse_f64(&trade["unrealizedPL"])),
            });
        }
        Ok(positions)
    }

    async fn open_position(&self, order: &NormalizedOrder) -> Result<BrokerFill> {
        let units = (order.volume * UNITS_PER_LOT).round() * order.direction.sign();
        if units == 0.0 {
            bail!("order volume rounds to zero units");
        }

        let mut market_order = serde_json::json!({
            "type": "MARKET",
            "instrument": Self::instrument(&order.pair),
            "units": format!("{units}"),
            "timeInForce": "FOK",
            "positionFill": "DEFAULT",
        });
        if let Some(sl) = order.stop_loss {
            market_order["stopLossOnFill"] = serde_json::json!({"price": format!("{sl:.5}")});
        }
        if let Some(tp) = order.take_profit {
            market_order["takeProfitOnFill"] = serde_json::json!({"price": format!("{tp:.5}")});
        }

        let url = format!("{}/v3/accounts/{}/orders", self.base_url, self.account_id);
        let resp = self
            .auth(self.client.post(&url))
            .json(&serde_json::json!({"order": market_order}))
            .send()
            .await
            .context("POST /orders failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("unparseable order response")?;
        if !status.is_success() {
            bail!("OANDA order rejected ({status}): {body}");
        }

        let fill = body
            .get("orderFillTransaction")
            .context("order response missing fill transaction")?;
        let fill_price = Self::parse_f64(&fill["price"]);
        let broker_trade_id = fill
            .get("tradeOpened")
            .and_then(|t| t["tradeID"].as_str())
            .context("fill missing tradeOpened.tradeID")?
            .to_string();

        let slippage_pips = order
            .price
            .map(|requested| order.pair.price_to_pips(fill_price - requested));

        debug!(
            trade_id = %broker_trade_id,
            fill_price,
            ?slippage_pips,
            "OANDA order filled"
        );

        Ok(BrokerFill {
            broker_trade_id,
            fill_price,
            slippage_pips,
        })
    }

    async fn close_position(&self, broker_trade_id: &str) -> Result<Option<f64>> {
        let url = format!(
            "{}/v3/accounts/{}/trades/{}/close",
            self.base_url, self.account_id, broker_trade_id
        );
        let resp = self
            .auth(self.client.put(&url))
            .json(&serde_json::json!({"units": "ALL"}))
            .send()
            .await
            .context("PUT /close failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("unparseable close response")?;
        if !status.is_success() {
            bail!("OANDA close rejected ({status}): {body}");
        }

        let pnl = body
            .get("orderFillTransaction")
            .map(|f| Self::parse_f64(&f["pl"]));
        Ok(pnl)
    }

    async fn modify_position(
        &self,
        broker_trade_id: &str,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Result<()> {
        let mut payload = serde_json::Map::new();
        if let Some(sl) = stop_loss {
            payload.insert(
                "stopLoss".to_string(),
                serde_json::json!({"price": format!("{sl:.5}"), "timeInForce": "GTC"}),
            );
        }
        if let Some(tp) = take_profit {
            payload.insert(
                "takeProfit".to_string(),
                serde_json::json!({"price": format!("{tp:.5}"), "timeInForce": "GTC"}),
            );
        }
        if payload.is_empty() {
            warn!(trade_id = broker_trade_id, "modify called with no changes");
            return Ok(());
        }

        let url = format!(
            "{}/v3/accounts/{}/trades/{}/orders",
            self.base_url, self.account_id, broker_trade_id
        );
        let resp = self
            .auth(self.client.put(&url))
            .json(&serde_json::Value::Object(payload))
            .send()
            .await
            .context("PUT /trades/{id}/orders failed")?;
        let status = resp.status();
        if !status.is_success() {
            let body: serde_json::Value = resp.json().await.unwrap_or_default();
            bail!("OANDA modify rejected ({status}): {body}");
        }
        Ok(())
    }
}

impl std::fmt::Debug for OandaConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OandaConnector")
            .field("api_key", &"<redacted>")
            .field("account_id", &self.account_id)
            .field("practice", &self.practice)
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
    fn instrument_format() {
        let pair = Pair::parse("EURUSD").unwrap();
        assert_eq!(OandaConnector::instrument(&pair), "EUR_USD");
    }

    #[test]
    fn enablement_requires_credentials() {
        let enabled = OandaConnector::new("key".into(), "001-001".into(), true);
        assert!(enabled.is_enabled());
        assert_eq!(enabled.account_mode(), AccountMode::Demo);

        let disabled = OandaConnector::new(String::new(), String::new(), false);
        assert!(!disabled.is_enabled());
        assert_eq!(disabled.account_mode(), AccountMode::Live);
    }

    #[test]
    fn parse_f64_string_and_number() {
        assert_eq!(OandaConnector::parse_f64(&serde_json::json!("1.0850")), 1.0850);
        assert_eq!(OandaConnector::parse_f64(&serde_json::json!(1.0850)), 1.0850);
        assert_eq!(OandaConnector::parse_f64(&serde_json::json!(null)), 0.0);
    }
}
