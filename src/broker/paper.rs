// =============================================================================
// Paper connector — local demo fills, no network
// =============================================================================
//
// Always enabled and connected. Orders fill at the requested price (or the
// stop-derived mid) with zero slippage, positions live in memory, and P&L
// is realized against the close price supplied by the last modify/close.
// Used as the routing default whenever no real broker is configured.
// =============================================================================

use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::broker::{
    AccountInfo, AccountMode, BrokerConnector, BrokerFill, BrokerPosition, NormalizedOrder,
};
use crate::types::Direction;

const STARTING_BALANCE: f64 = 10_000.0;

struct PaperPosition {
    position: BrokerPosition,
    pip_size: f64,
    volume_pip_value: f64,
}

pub struct PaperConnector {
    positions: RwLock<HashMap<String, PaperPosition>>,
    balance: RwLock<f64>,
}

impl PaperConnector {
    pub fn new() -> Self {
        info!(balance = STARTING_BALANCE, "paper connector ready");
        Self {
            positions: RwLock::new(HashMap::new()),
            balance: RwLock::new(STARTING_BALANCE),
        }
    }

    /// Mark a position to a new price (used by tests and the demo loop).
    pub fn mark_price(&self, broker_trade_id: &str, price: f64) {
        let mut positions = self.positions.write();
        if let Some(p) = positions.get_mut(broker_trade_id) {
            let direction = p.position.direction.sign();
            let pips = (price - p.position.entry_price) / p.pip_size * direction;
            p.position.current_pnl = Some(pips * p.volume_pip_value);
        }
    }
}

impl Default for PaperConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerConnector for PaperConnector {
    fn id(&self) -> &str {
        "paper"
    }

    fn is_enabled(&self) -> bool {
        true
    }

    async fn is_connected(&self) -> bool {
        true
    }

    fn account_mode(&self) -> AccountMode {
        AccountMode::Demo
    }

    async fn get_account_info(&self) -> Result<AccountInfo> {
        let balance = *self.balance.read();
        let unrealized: f64 = self
            .positions
            .read()
            .values()
            .filter_map(|p| p.position.current_pnl)
            .sum();
        Ok(AccountInfo {
            account_id: "paper-demo".to_string(),
            balance,
            equity: balance + unrealized,
            currency: "USD".to_string(),
            mode: AccountMode::Demo,
        })
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>> {
        Ok(self
            .positions
            .read()
            .values()
            .map(|p| p.position.clone())
            .collect())
    }

    async fn open_position(&self, order: &NormalizedOrder) -> Result<BrokerFill> {
        let fill_price = match order.price {
            Some(p) if p > 0.0 => p,
            _ => bail!("paper connector requires an order price"),
        };

        let broker_trade_id = Uuid::new_v4().to_string();
        let pip_size = order.pair.pip_size();

        let position = BrokerPosition {
            id: broker_trade_id.clone(),
            pair: order.pair.to_string(),
            direction: order.direction,
            volume: order.volume,
            entry_price: fill_price,
            stop_loss: order.stop_loss,
            take_profit: order.take_profit,
            current_pnl: Some(0.0),
        };

        debug!(
            id = %broker_trade_id,
            pair = %order.pair,
            direction = %order.direction,
            volume = order.volume,
            fill_price,
            "paper fill"
        );

        self.positions.write().insert(
            broker_trade_id.clone(),
            PaperPosition {
                position,
                pip_size,
                // $10 per pip per standard lot, scaled by volume.
                volume_pip_value: order.volume * 10.0,
            },
        );

        Ok(BrokerFill {
            broker_trade_id,
            fill_price,
            slippage_pips: Some(0.0),
        })
    }

    async fn close_position(&self, broker_trade_id: &str) -> Result<Option<f64>> {
        let removed = self.positions.write().remove(broker_trade_id);
        match removed {
            Some(p) => {
                let pnl = p.position.current_pnl.unwrap_or(0.0);
                *self.balance.write() += pnl;
                debug!(id = broker_trade_id, pnl, "paper close");
                Ok(Some(pnl))
            }
            None => bail!("unknown paper position '{broker_trade_id}'"),
        }
    }

    async fn modify_position(
        &self,
        broker_trade_id: &str,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Result<()> {
        let mut positions = self.positions.write();
        let Some(p) = positions.get_mut(broker_trade_id) else {
            bail!("unknown paper position '{broker_trade_id}'");
        };
        if stop_loss.is_some() {
            p.position.stop_loss = stop_loss;
        }
        if take_profit.is_some() {
            p.position.take_profit = take_profit;
        }
        Ok(())
    }
}

impl std::fmt::Debug for PaperConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaperConnector")
            .field("positions", &self.positions.read().len())
            .field("balance", &*self.balance.read())
            .finish()
    }
}
