// =============================================================================
// Broker router — normalized order flow across pluggable connectors
// =============================================================================
//
// Every inbound order envelope is alias-normalized (id/ticket, pair/symbol,
// sl/tp) before dispatch. Routing honours an optional preferred broker and
// falls back to any connected connector; with none connected the call fails
// with `no_connected_brokers`.
//
// The risk engine's kill switch is checked before any connector call — an
// engaged switch rejects opens and modifications without touching a
// connector. Every call records a metric and emits a WebSocket event;
// periodic reconciliation compares the local open-trade set against each
// connector's positions and publishes drift alerts.
// =============================================================================

pub mod ibkr;
pub mod mt_bridge;
pub mod oanda;
pub mod paper;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::alerts::{Alert, AlertBus, Severity};
use crate::events::{EventBroadcaster, EventType};
use crate::risk::RiskEngine;
use crate::types::{Direction, Pair, Trade, TradeStatus};

/// Bounded ring of broker-call metrics.
const METRICS_LIMIT: usize = 500;

// ---------------------------------------------------------------------------
// Connector contract
// ---------------------------------------------------------------------------

/// Whether a connector trades real funds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountMode {
    Demo,
    Live,
}

/// Broker account summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    pub account_id: String,
    pub balance: f64,
    pub equity: f64,
    pub currency: String,
    pub mode: AccountMode,
}

/// A position as reported by a connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerPosition {
    pub id: String,
    pub pair: String,
    pub direction: Direction,
    pub volume: f64,
    pub entry_price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_pnl: Option<f64>,
}

/// Result of a filled open order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerFill {
    /// Broker-side position/trade id.
    pub broker_trade_id: String,
    pub fill_price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slippage_pips: Option<f64>,
}

/// Capability set every broker connector exposes.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Stable connector id (`paper`, `oanda`, `mt4`, `mt5`, `ibkr`).
    fn id(&self) -> &str;

    fn is_enabled(&self) -> bool;

    async fn is_connected(&self) -> bool;

    fn account_mode(&self) -> AccountMode;

    async fn get_account_info(&self) -> Result<AccountInfo>;

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>>;

    async fn open_position(&self, order: &NormalizedOrder) -> Result<BrokerFill>;

    /// Close by broker trade id; returns the realized P&L when known.
    async fn close_position(&self, broker_trade_id: &str) -> Result<Option<f64>>;

    async fn modify_position(
        &self,
        broker_trade_id: &str,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Order envelope & normalization
// ---------------------------------------------------------------------------

/// Raw router input with alias fields as they arrive off the wire.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderEnvelope {
    pub broker: Option<String>,
    #[serde(alias = "symbol")]
    pub pair: Option<String>,
    #[serde(alias = "type")]
    pub direction: Option<String>,
    pub volume: Option<f64>,
    pub price: Option<f64>,
    #[serde(alias = "sl")]
    pub stop_loss: Option<f64>,
    #[serde(alias = "tp")]
    pub take_profit: Option<f64>,
    /// `id` or a numeric `ticket`.
    #[serde(alias = "ticket")]
    pub id: Option<serde_json::Value>,
    pub comment: Option<String>,
    pub source: Option<String>,
    pub trade_id: Option<String>,
    pub reason: Option<String>,
}

/// Canonical order after alias normalization.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedOrder {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker: Option<String>,
    pub pair: Pair,
    pub direction: Direction,
    pub volume: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trade_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl OrderEnvelope {
    /// Map alias fields onto canonical names and validate.
    pub fn normalize(&self) -> Result<NormalizedOrder> {
        let raw_pair = self
            .pair
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("order missing pair/symbol"))?;
        let pair = Pair::parse(raw_pair)?;

        let direction = match self
            .direction
            .as_deref()
            .map(|d| d.to_uppercase())
            .as_deref()
        {
            Some("BUY") | Some("LONG") => Direction::Buy,
            Some("SELL") | Some("SHORT") => Direction::Sell,
            other => bail!("order has invalid direction/type: {other:?}"),
        };

        let volume = self.volume.unwrap_or(0.0);
        if volume <= 0.0 || !volume.is_finite() {
            bail!("order volume must be positive, got {volume}");
        }

        let id = self.id.as_ref().map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        });

        Ok(NormalizedOrder {
            broker: self.broker.clone(),
            pair,
            direction,
            volume,
            price: self.price,
            stop_loss: self.stop_loss,
            take_profit: self.take_profit,
            id,
            comment: self.comment.clone(),
            source: self.source.clone().unwrap_or_else(|| "api".to_string()),
            trade_id: self.trade_id.clone(),
            reason: self.reason.clone(),
        })
    }

    /// Id-only normalization for close/modify calls.
    pub fn normalized_id(&self) -> Option<String> {
        self.id.as_ref().map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Router results & metrics
// ---------------------------------------------------------------------------

/// JSON-shaped router outcome (`success` envelope per the REST contract).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trade: Option<Trade>,
}

impl RouterOutcome {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            broker: None,
            trade: None,
        }
    }
}

/// One recorded broker call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerCallMetric {
    pub broker: String,
    pub operation: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slippage_pips: Option<f64>,
    pub at: i64,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub struct BrokerRouter {
    connectors: Vec<Arc<dyn BrokerConnector>>,
    default_broker: Option<String>,
    risk: Arc<RiskEngine>,
    events: EventBroadcaster,
    bus: Arc<AlertBus>,
    /// C10 owns the open-position set.
    open_trades: RwLock<HashMap<String, Trade>>,
    metrics: RwLock<VecDeque<BrokerCallMetric>>,
}

impl BrokerRouter {
    pub fn new(
        connectors: Vec<Arc<dyn BrokerConnector>>,
        risk: Arc<RiskEngine>,
        events: EventBroadcaster,
        bus: Arc<AlertBus>,
    ) -> Self {
        let default_broker = connectors
            .iter()
            .find(|c| c.is_enabled())
            .map(|c| c.id().to_string());
        info!(
            connectors = ?connectors.iter().map(|c| c.id().to_string()).collect::<Vec<_>>(),
            default = ?default_broker,
            "broker router initialised"
        );
        Self {
            connectors,
            default_broker,
            risk,
            events,
            bus,
            open_trades: RwLock::new(HashMap::new()),
            metrics: RwLock::new(VecDeque::with_capacity(METRICS_LIMIT)),
        }
    }

    pub fn connector_ids(&self) -> Vec<String> {
        self.connectors.iter().map(|c| c.id().to_string()).collect()
    }

    /// Select a connector: preferred if connected, else the default, else
    /// any connected connector.
    async fn choose(&self, preferred: Option<&str>) -> Result<Arc<dyn BrokerConnector>> {
        if let Some(id) = preferred {
            for c in &self.connectors {
                if c.id() == id && c.is_enabled() && c.is_connected().await {
                    return Ok(c.clone());
                }
            }
            warn!(preferred = id, "preferred broker unavailable — falling back");
        }

        if let Some(default) = &self.default_broker {
            for c in &self.connectors {
                if c.id() == default && c.is_enabled() && c.is_connected().await {
                    return Ok(c.clone());
                }
            }
        }

        for c in &self.connectors {
            if c.is_enabled() && c.is_connected().await {
                return Ok(c.clone());
            }
        }

        bail!("no_connected_brokers");
    }

    fn record_metric(&self, broker: &str, operation: &str, status: &str, slippage: Option<f64>) {
        let mut metrics = self.metrics.write();
        metrics.push_back(BrokerCallMetric {
            broker: broker.to_string(),
            operation: operation.to_string(),
            status: status.to_string(),
            slippage_pips: slippage,
            at: crate::types::now_ms(),
        });
        while metrics.len() > METRICS_LIMIT {
            metrics.pop_front();
        }
    }

    pub fn metrics_snapshot(&self, limit: usize) -> Vec<BrokerCallMetric> {
        let metrics = self.metrics.read();
        let start = metrics.len().saturating_sub(limit);
        metrics.iter().skip(start).cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Open
    // -------------------------------------------------------------------------

    pub async fn open_position(&self, envelope: &OrderEnvelope) -> RouterOutcome {
        let order = match envelope.normalize() {
            Ok(o) => o,
            Err(e) => return RouterOutcome::failure(format!("invalid order: {e}")),
        };

        self.events.publish(
            EventType::AutoTradeAttempt,
            serde_json::to_value(&order).unwrap_or(serde_json::Value::Null),
        );

        if self.risk.kill_switch_engaged() {
            let reason = self
                .risk
                .kill_switch_reason()
                .unwrap_or_else(|| "unspecified".to_string());
            let error = format!("Kill switch engaged: {reason}");
            self.events.publish(
                EventType::AutoTradeRejected,
                serde_json::json!({"pair": order.pair, "error": error}),
            );
            return RouterOutcome::failure(error);
        }

        let connector = match self.choose(order.broker.as_deref()).await {
            Ok(c) => c,
            Err(e) => {
                self.events.publish(
                    EventType::AutoTradeRejected,
                    serde_json::json!({"pair": order.pair, "error": e.to_string()}),
                );
                return RouterOutcome::failure(e.to_string());
            }
        };
        let broker_id = connector.id().to_string();

        match connector.open_position(&order).await {
            Ok(fill) => {
                self.record_metric(&broker_id, "open", "ok", fill.slippage_pips);

                let trade = Trade {
                    id: order
                        .trade_id
                        .clone()
                        .unwrap_or_else(|| Uuid::new_v4().to_string()),
                    pair: order.pair.clone(),
                    direction: order.direction,
                    position_size: order.volume,
                    entry_price: fill.fill_price,
                    stop_loss: order.stop_loss,
                    take_profit: order.take_profit,
                    open_time: chrono::Utc::now().to_rfc3339(),
                    close_time: None,
                    status: TradeStatus::Open,
                    close_reason: None,
                    broker: Some(broker_id.clone()),
                    current_pnl: None,
                    final_pnl: None,
                };

                self.open_trades
                    .write()
                    .insert(fill.broker_trade_id.clone(), trade.clone());

                self.events.publish(
                    EventType::TradeOpened,
                    serde_json::json!({
                        "trade": trade,
                        "brokerTradeId": fill.broker_trade_id,
                        "slippagePips": fill.slippage_pips,
                    }),
                );

                info!(
                    broker = %broker_id,
                    pair = %trade.pair,
                    direction = %trade.direction,
                    volume = trade.position_size,
                    fill_price = fill.fill_price,
                    "position opened"
                );

                RouterOutcome {
                    success: true,
                    error: None,
                    broker: Some(broker_id),
                    trade: Some(trade),
                }
            }
            Err(e) => {
                self.record_metric(&broker_id, "open", "error", None);
                self.events.publish(
                    EventType::AutoTradeRejected,
                    serde_json::json!({"pair": order.pair, "broker": broker_id, "error": e.to_string()}),
                );
                RouterOutcome::failure(format!("open failed on {broker_id}: {e}"))
            }
        }
    }

    // -------------------------------------------------------------------------
    // Close
    // -------------------------------------------------------------------------

    pub async fn close_position(&self, envelope: &OrderEnvelope) -> RouterOutcome {
        let Some(id) = envelope.normalized_id() else {
            return RouterOutcome::failure("close requires id or ticket");
        };

        if self.risk.kill_switch_engaged() {
            // Closing reduces exposure; permitted under the kill switch only
            // when an operator supplies an explicit reason.
            if envelope.reason.as_deref() != Some("kill_switch_flatten") {
                let reason = self
                    .risk
                    .kill_switch_reason()
                    .unwrap_or_else(|| "unspecified".to_string());
                return RouterOutcome::failure(format!("Kill switch engaged: {reason}"));
            }
        }

        // Prefer the explicit broker, else the one that opened this trade.
        let broker_hint = {
            let trades = self.open_trades.read();
            trades.get(&id).and_then(|t| t.broker.clone())
        };
        let connector = match self
            .choose(envelope.broker.as_deref().or(broker_hint.as_deref()))
            .await
        {
            Ok(c) => c,
            Err(e) => return RouterOutcome::failure(e.to_string()),
        };
        let broker_id = connector.id().to_string();

        match connector.close_position(&id).await {
            Ok(pnl) => {
                self.record_metric(&broker_id, "close", "ok", None);

                let trade = {
                    let mut trades = self.open_trades.write();
                    trades.remove(&id).map(|mut t| {
                        t.status = TradeStatus::Closed;
                        t.close_time = Some(chrono::Utc::now().to_rfc3339());
                        t.close_reason = envelope.reason.clone();
                        t.final_pnl = pnl;
                        t
                    })
                };

                if let (Some(t), Some(p)) = (&trade, pnl) {
                    self.risk.on_trade_closed(&t.id, p);
                }

                self.events.publish(
                    EventType::TradeClosed,
                    serde_json::json!({"brokerTradeId": id, "trade": trade, "pnl": pnl}),
                );

                RouterOutcome {
                    success: true,
                    error: None,
                    broker: Some(broker_id),
                    trade,
                }
            }
            Err(e) => {
                self.record_metric(&broker_id, "close", "error", None);
                RouterOutcome::failure(format!("close failed on {broker_id}: {e}"))
            }
        }
    }

    /// Close every locally-tracked open trade (auto-trader `close-all`).
    pub async fn close_all(&self, reason: &str) -> Vec<RouterOutcome> {
        let ids: Vec<String> = self.open_trades.read().keys().cloned().collect();
        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
            let envelope = OrderEnvelope {
                id: Some(serde_json::Value::String(id)),
                reason: Some(reason.to_string()),
                ..Default::default()
            };
            outcomes.push(self.close_position(&envelope).await);
        }
        outcomes
    }

    // -------------------------------------------------------------------------
    // Modify
    // -------------------------------------------------------------------------

    pub async fn modify_position(&self, envelope: &OrderEnvelope) -> RouterOutcome {
        let Some(id) = envelope.normalized_id() else {
            return RouterOutcome::failure("modify requires id or ticket");
        };

        // The kill switch rejects modifications before any connector call.
        if self.risk.kill_switch_engaged() {
            let reason = self
                .risk
                .kill_switch_reason()
                .unwrap_or_else(|| "unspecified".to_string());
            let error = format!("Kill switch engaged: {reason}");
            self.events.publish(
                EventType::TradeStopModifyFailed,
                serde_json::json!({"id": id, "error": error}),
            );
            return RouterOutcome::failure(error);
        }

        let broker_hint = {
            let trades = self.open_trades.read();
            trades.get(&id).and_then(|t| t.broker.clone())
        };
        let connector = match self
            .choose(envelope.broker.as_deref().or(broker_hint.as_deref()))
            .await
        {
            Ok(c) => c,
            Err(e) => return RouterOutcome::failure(e.to_string()),
        };
        let broker_id = connector.id().to_string();

        match connector
            .modify_position(&id, envelope.stop_loss, envelope.take_profit)
            .await
        {
            Ok(()) => {
                self.record_metric(&broker_id, "modify", "ok", None);

                if let Some(trade) = self.open_trades.write().get_mut(&id) {
                    if envelope.stop_loss.is_some() {
                        trade.stop_loss = envelope.stop_loss;
                    }
                    if envelope.take_profit.is_some() {
                        trade.take_profit = envelope.take_profit;
                    }
                }

                self.events.publish(
                    EventType::TradeStopModified,
                    serde_json::json!({
                        "id": id,
                        "stopLoss": envelope.stop_loss,
                        "takeProfit": envelope.take_profit,
                        "broker": broker_id,
                    }),
                );

                RouterOutcome {
                    success: true,
                    error: None,
                    broker: Some(broker_id),
                    trade: None,
                }
            }
            Err(e) => {
                self.record_metric(&broker_id, "modify", "error", None);
                self.events.publish(
                    EventType::TradeStopModifyFailed,
                    serde_json::json!({"id": id, "broker": broker_id, "error": e.to_string()}),
                );
                RouterOutcome::failure(format!("modify failed on {broker_id}: {e}"))
            }
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Locally-tracked open trades.
    pub fn open_trades(&self) -> Vec<Trade> {
        self.open_trades.read().values().cloned().collect()
    }

    /// Account info from the chosen broker.
    pub async fn get_account_info(&self, preferred: Option<&str>) -> Result<AccountInfo> {
        let connector = self.choose(preferred).await?;
        connector.get_account_info().await
    }

    /// Positions as reported by a specific broker.
    pub async fn get_positions(&self, broker: &str) -> Result<Vec<BrokerPosition>> {
        for c in &self.connectors {
            if c.id() == broker {
                return c.get_positions().await;
            }
        }
        bail!("unknown broker '{broker}'")
    }

    // -------------------------------------------------------------------------
    // Reconciliation
    // -------------------------------------------------------------------------

    /// Compare local open trades with every connector's reported positions
    /// and publish drift alerts on mismatch. Returns drift descriptions.
    pub async fn reconcile(&self) -> Vec<String> {
        let mut drifts = Vec::new();

        for connector in &self.connectors {
            if !connector.is_enabled() || !connector.is_connected().await {
                continue;
            }
            let broker_id = connector.id().to_string();

            let remote = match connector.get_positions().await {
                Ok(p) => p,
                Err(e) => {
                    warn!(broker = %broker_id, error = %e, "reconciliation fetch failed");
                    continue;
                }
            };

            let local: Vec<(String, Trade)> = {
                let trades = self.open_trades.read();
                trades
                    .iter()
                    .filter(|(_, t)| t.broker.as_deref() == Some(broker_id.as_str()))
                    .map(|(id, t)| (id.clone(), t.clone()))
                    .collect()
            };

            for (id, trade) in &local {
                if !remote.iter().any(|p| &p.id == id) {
                    drifts.push(format!(
                        "{broker_id}: local trade {id} ({}) missing at broker",
                        trade.pair
                    ));
                }
            }
            for position in &remote {
                if !local.iter().any(|(id, _)| id == &position.id) {
                    drifts.push(format!(
                        "{broker_id}: broker position {} ({}) unknown locally",
                        position.id, position.pair
                    ));
                }
            }
        }

        for drift in &drifts {
            warn!(drift = %drift, "position drift detected");
            self.bus.publish(
                Alert::new("broker.drift", Severity::Error, drift.clone())
                    .with_context(serde_json::json!({"kind": "position_drift"})),
            );
        }
        if drifts.is_empty() {
            debug!("reconciliation clean");
        }
        drifts
    }
}

impl std::fmt::Debug for BrokerRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerRouter")
            .field("connectors", &self.connector_ids())
            .field("open_trades", &self.open_trades.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::RiskConfig;
    use parking_lot::Mutex;

    // -----------------------------------------------------------------------
    // Mock connector
    // -----------------------------------------------------------------------

    struct MockConnector {
        id: String,
        connected: bool,
        open_calls: Mutex<u32>,
        modify_calls: Mutex<u32>,
        close_calls: Mutex<u32>,
        positions: Mutex<Vec<BrokerPosition>>,
    }

    impl MockConnector {
        fn new(id: &str, connected: bool) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                connected,
                open_calls: Mutex::new(0),
                modify_calls: Mutex::new(0),
                close_calls: Mutex::new(0),
                positions: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl BrokerConnector for MockConnector {
        fn id(&self) -> &str {
            &self.id
        }

        fn is_enabled(&self) -> bool {
            true
        }

        async fn is_connected(&self) -> bool {
            self.connected
        }

        fn account_mode(&self) -> AccountMode {
            AccountMode::Demo
        }

        async fn get_account_info(&self) -> Result<AccountInfo> {
            Ok(AccountInfo {
                account_id: "mock-1".into(),
                balance: 10_000.0,
                equity: 10_000.0,
                currency: "USD".into(),
                mode: AccountMode::Demo,
            })
        }

        async fn get_positions(&self) -> Result<Vec<BrokerPosition>> {
            Ok(self.positions.lock().clone())
        }

        async fn open_position(&self, order: &NormalizedOrder) -> Result<BrokerFill> {
            *self.open_calls.lock() += 1;
            Ok(BrokerFill {
                broker_trade_id: "12345".into(),
                fill_price: order.price.unwrap_or(1.0850),
                slippage_pips: Some(0.2),
            })
        }

        async fn close_position(&self, _broker_trade_id: &str) -> Result<Option<f64>> {
            *self.close_calls.lock() += 1;
            Ok(Some(42.0))
        }

        async fn modify_position(
            &self,
            _broker_trade_id: &str,
            _stop_loss: Option<f64>,
            _take_profit: Option<f64>,
        ) -> Result<()> {
            *self.modify_calls.lock() += 1;
            Ok(())
        }
    }

    fn router_with(connectors: Vec<Arc<dyn BrokerConnector>>) -> (BrokerRouter, Arc<RiskEngine>) {
        let risk = Arc::new(RiskEngine::new(RiskConfig::default()));
        let router = BrokerRouter::new(
            connectors,
            risk.clone(),
            EventBroadcaster::new(),
            AlertBus::new(),
        );
        (router, risk)
    }

    fn open_envelope() -> OrderEnvelope {
        OrderEnvelope {
            pair: Some("EURUSD".into()),
            direction: Some("BUY".into()),
            volume: Some(0.4),
            price: Some(1.0850),
            stop_loss: Some(1.0825),
            take_profit: Some(1.0890),
            source: Some("test".into()),
            ..Default::default()
        }
    }

    // -----------------------------------------------------------------------
    // Normalization
    // -----------------------------------------------------------------------

    #[test]
    fn alias_normalization() {
        let raw = serde_json::json!({
            "broker": "mt5",
            "symbol": "eurusd",
            "type": "buy",
            "volume": 0.5,
            "sl": 1.0800,
            "tp": 1.0950,
            "ticket": 987654,
            "source": "ea"
        });
        let envelope: OrderEnvelope = serde_json::from_value(raw).unwrap();
        let order = envelope.normalize().unwrap();
        assert_eq!(order.pair.as_str(), "EURUSD");
        assert_eq!(order.direction, Direction::Buy);
        assert_eq!(order.stop_loss, Some(1.0800));
        assert_eq!(order.take_profit, Some(1.0950));
        assert_eq!(order.id.as_deref(), Some("987654"));
        assert_eq!(order.broker.as_deref(), Some("mt5"));
    }

    #[test]
    fn normalization_rejects_bad_orders() {
        let mut envelope = open_envelope();
        envelope.volume = Some(0.0);
        assert!(envelope.normalize().is_err());

        let mut envelope = open_envelope();
        envelope.direction = Some("HOLD".into());
        assert!(envelope.normalize().is_err());

        let mut envelope = open_envelope();
        envelope.pair = None;
        assert!(envelope.normalize().is_err());
    }

    // -----------------------------------------------------------------------
    // Routing
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn open_routes_to_connected_broker() {
        let mock = MockConnector::new("paper", true);
        let (router, _risk) = router_with(vec![mock.clone()]);

        let outcome = router.open_position(&open_envelope()).await;
        assert!(outcome.success);
        assert_eq!(outcome.broker.as_deref(), Some("paper"));
        let trade = outcome.trade.unwrap();
        assert_eq!(trade.status, TradeStatus::Open);
        assert_eq!(*mock.open_calls.lock(), 1);
        assert_eq!(router.open_trades().len(), 1);
    }

    #[tokio::test]
    async fn no_connected_brokers_fails() {
        let mock = MockConnector::new("oanda", false);
        let (router, _risk) = router_with(vec![mock]);

        let outcome = router.open_position(&open_envelope()).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("no_connected_brokers"));
    }

    #[tokio::test]
    async fn preferred_broker_with_fallback() {
        let down = MockConnector::new("oanda", false);
        let up = MockConnector::new("mt5", true);
        let (router, _risk) = router_with(vec![down.clone(), up.clone()]);

        let mut envelope = open_envelope();
        envelope.broker = Some("oanda".into());
        let outcome = router.open_position(&envelope).await;
        assert!(outcome.success);
        assert_eq!(outcome.broker.as_deref(), Some("mt5"));
        assert_eq!(*down.open_calls.lock(), 0);
        assert_eq!(*up.open_calls.lock(), 1);
    }

    // Scenario E: kill switch rejects the modify and the connector is never
    // invoked.
    #[tokio::test]
    async fn kill_switch_blocks_modify_before_connector() {
        let mock = MockConnector::new("mt5", true);
        let (router, risk) = router_with(vec![mock.clone()]);
        risk.engage_kill_switch("maintenance");

        let raw = serde_json::json!({
            "broker": "mt5",
            "id": "12345",
            "pair": "EURUSD",
            "sl": 1.2345,
            "tp": 1.3456
        });
        let envelope: OrderEnvelope = serde_json::from_value(raw).unwrap();
        let outcome = router.modify_position(&envelope).await;

        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("Kill switch engaged"));
        assert_eq!(*mock.modify_calls.lock(), 0);
    }

    #[tokio::test]
    async fn kill_switch_blocks_open() {
        let mock = MockConnector::new("paper", true);
        let (router, risk) = router_with(vec![mock.clone()]);
        risk.engage_kill_switch("maintenance");

        let outcome = router.open_position(&open_envelope()).await;
        assert!(!outcome.success);
        assert_eq!(*mock.open_calls.lock(), 0);
    }

    #[tokio::test]
    async fn close_updates_trade_state() {
        let mock = MockConnector::new("paper", true);
        let (router, _risk) = router_with(vec![mock.clone()]);

        let opened = router.open_position(&open_envelope()).await;
        assert!(opened.success);

        let close = OrderEnvelope {
            id: Some(serde_json::Value::String("12345".into())),
            reason: Some("take_profit".into()),
            ..Default::default()
        };
        let outcome = router.close_position(&close).await;
        assert!(outcome.success);
        let trade = outcome.trade.unwrap();
        assert_eq!(trade.status, TradeStatus::Closed);
        assert_eq!(trade.final_pnl, Some(42.0));
        assert!(router.open_trades().is_empty());
        assert_eq!(*mock.close_calls.lock(), 1);
    }

    #[tokio::test]
    async fn modify_updates_local_trade() {
        let mock = MockConnector::new("paper", true);
        let (router, _risk) = router_with(vec![mock]);

        router.open_position(&open_envelope()).await;
        let modify = OrderEnvelope {
            id: Some(serde_json::Value::String("12345".into())),
            stop_loss: Some(1.0830),
            ..Default::default()
        };
        let outcome = router.modify_position(&modify).await;
        assert!(outcome.success);

        let trades = router.open_trades();
        assert_eq!(trades[0].stop_loss, Some(1.0830));
    }

    #[tokio::test]
    async fn reconciliation_detects_drift() {
        let mock = MockConnector::new("paper", true);
        let (router, _risk) = router_with(vec![mock.clone()]);

        // Local trade exists; broker reports nothing.
        router.open_position(&open_envelope()).await;
        let drifts = router.reconcile().await;
        assert_eq!(drifts.len(), 1);
        assert!(drifts[0].contains("missing at broker"));

        // Broker also reports an unknown position.
        mock.positions.lock().push(BrokerPosition {
            id: "999".into(),
            pair: "GBPUSD".into(),
            direction: Direction::Sell,
            volume: 0.2,
            entry_price: 1.2700,
            stop_loss: None,
            take_profit: None,
            current_pnl: None,
        });
        let drifts = router.reconcile().await;
        assert_eq!(drifts.len(), 2);
    }

    #[tokio::test]
    async fn metrics_are_recorded() {
        let mock = MockConnector::new("paper", true);
        let (router, _risk) = router_with(vec![mock]);

        router.open_position(&open_envelope()).await;
        let metrics = router.metrics_snapshot(10);
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].operation, "open");
        assert_eq!(metrics[0].status, "ok");
        assert_eq!(metrics[0].slippage_pips, Some(0.2));
    }
}
