// =============================================================================
// MetaTrader bridge connector — local HTTP bridge for MT4/MT5 terminals
// =============================================================================
//
// The Expert Advisor side exposes a small JSON bridge on localhost; this
// connector is instantiated once per terminal flavour (`mt4` / `mt5`)
// against the terminal's bridge URL. Tickets are numeric on the wire and
// carried as strings here.
// =============================================================================

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::broker::{
    AccountInfo, AccountMode, BrokerConnector, BrokerFill, BrokerPosition, NormalizedOrder,
};
use crate::types::Direction;

pub struct MtBridgeConnector {
    id: String,
    bridge_url: String,
    client: reqwest::Client,
    enabled: bool,
}

impl MtBridgeConnector {
    /// `flavour` is `mt4` or `mt5`.
    pub fn new(flavour: &str, bridge_url: Option<String>) -> Self {
        let enabled = bridge_url.is_some();
        Self {
            id: flavour.to_string(),
            bridge_url: bridge_url.unwrap_or_else(|| "http://127.0.0.1:8077".to_string()),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .expect("failed to build reqwest client"),
            enabled,
        }
    }

    async fn post_json(
        &self,
        path: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let url = format!("{}{}", self.bridge_url, path);
        let resp = self
            .client
            .post(&url)
            .json(payload)
            .send()
            .await
            .with_context(|| format!("POST {path} to MT bridge failed"))?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("POST {path}: unparseable bridge response"))?;
        if !status.is_success() || body.get("success").and_then(|v| v.as_bool()) == Some(false) {
            bail!("MT bridge {path} failed ({status}): {body}");
        }
        Ok(body)
    }

    async fn get_json(&self, path: &str) -> Result<serde_json::Value> {
        let url = format!("{}{}", self.bridge_url, path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {path} from MT bridge failed"))?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("GET {path}: unparseable bridge response"))?;
        if !status.is_success() {
            bail!("MT bridge GET {path} returned {status}");
        }
        Ok(body)
    }
}

#[async_trait]
impl BrokerConnector for MtBridgeConnector {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn is_connected(&self) -> bool {
        if !self.enabled {
            return false;
        }
        self.get_json("/ping").await.is_ok()
    }

    fn account_mode(&self) -> AccountMode {
        AccountMode::Live
    }

    async fn get_account_info(&self) -> Result<AccountInfo> {
        let body = self.get_json("/account").await?;
        Ok(AccountInfo {
            account_id: body["login"]
                .as_i64()
                .map(|v| v.to_string())
                .unwrap_or_default(),
            balance: body["balance"].as_f64().unwrap_or(0.0),
            equity: body["equity"].as_f64().unwrap_or(0.0),
            currency: body["currency"].as_str().unwrap_or("USD").to_string(),
            mode: if body["demo"].as_bool().unwrap_or(true) {
                AccountMode::Demo
            } else {
                AccountMode::Live
            },
        })
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>> {
        let body = self.get_json("/positions").await?;
        let raw = body["positions"]
            .as_array()
            .context("bridge /positions missing 'positions'")?;

        let mut positions = Vec::with_capacity(raw.len());
        for p in raw {
            positions.push(BrokerPosition {
                id: p["ticket"]
                    .as_i64()
                    .map(|t| t.to_string())
                    .unwrap_or_default(),
                pair: p["symbol"].as_str().unwrap_or_default().to_string(),
                direction: if p["type"].as_str() == Some("SELL") {
                    Direction::Sell
                } else {
                    Direction::Buy
                },
                volume: p["volume"].as_f64().unwrap_or(0.0),
                entry_price: p["openPrice"].as_f64().unwrap_or(0.0),
                stop_loss: p["sl"].as_f64().filter(|v| *v > 0.0),
                take_profit: p["tp"].as_f64().filter(|v| *v > 0.0),
                current_pnl: p["profit"].as_f64(),
            });
        }
        Ok(positions)
    }

    async fn open_position(&self, order: &NormalizedOrder) -> Result<BrokerFill> {
        let payload = serde_json::json!({
            "symbol": order.pair.as_str(),
            "type": order.direction.to_string(),
            "volume": order.volume,
            "sl": order.stop_loss,
            "tp": order.take_profit,
            "comment": order.comment,
        });
        let body = self.post_json("/trade/open", &payload).await?;

        let ticket = body["ticket"]
            .as_i64()
            .context("bridge open response missing ticket")?;
        let fill_price = body["price"].as_f64().unwrap_or(0.0);

        let slippage_pips = order
            .price
            .filter(|_| fill_price > 0.0)
            .map(|requested| order.pair.price_to_pips(fill_price - requested));

        debug!(ticket, fill_price, "MT bridge order filled");

        Ok(BrokerFill {
            broker_trade_id: ticket.to_string(),
            fill_price,
            slippage_pips,
        })
    }

    async fn close_position(&self, broker_trade_id: &str) -> Result<Option<f64>> {
        let ticket: i64 = broker_trade_id
            .parse()
            .with_context(|| format!("non-numeric MT ticket '{broker_trade_id}'"))?;
        let body = self
            .post_json("/trade/close", &serde_json::json!({"ticket": ticket}))
            .await?;
        Ok(body["profit"].as_f64())
    }

    async fn modify_position(
        &self,
        broker_trade_id: &str,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Result<()> {
        let ticket: i64 = broker_trade_id
            .parse()
            .with_context(|| format!("non-numeric MT ticket '{broker_trade_id}'"))?;
        self.post_json(
            "/trade/modify",
            &serde_json::json!({"ticket": ticket, "sl": stop_loss, "tp": take_profit}),
        )
        .await?;
        Ok(())
    }
}

impl std::fmt::Debug for MtBridgeConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MtBridgeConnector")
            .field("id", &self.id)
            .field("bridge_url", &self.bridge_url)
            .field("enabled", &self.enabled)
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
    fn flavours_and_enablement() {
        let mt5 = MtBridgeConnector::new("mt5", Some("http://127.0.0.1:9000".into()));
        assert_eq!(mt5.id(), "mt5");
        assert!(mt5.is_enabled());

        let mt4 = MtBridgeConnector::new("mt4", None);
        assert_eq!(mt4.id(), "mt4");
        assert!(!mt4.is_enabled());
    }
}
