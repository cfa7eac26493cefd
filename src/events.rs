// =============================================================================
// Trading event broadcaster — fan-out for the /ws/trading feed
// =============================================================================
//
// A tokio broadcast channel carries `{type, payload, timestamp}` frames from
// the router, coordinator and availability classifier to every connected
// WebSocket client. Slow clients lag and drop frames on their own receiver;
// publishers never block. Frames from one publisher are delivered to each
// subscriber in publication order.
// =============================================================================

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::now_ms;

/// Channel capacity per subscriber before lagging clients drop frames.
const CHANNEL_CAPACITY: usize = 256;

/// Closed set of frame types emitted on /ws/trading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Connected,
    Signal,
    AutoTradeAttempt,
    AutoTradeRejected,
    TradeOpened,
    TradeClosed,
    TradeStopModified,
    TradeStopModifyFailed,
    ProviderAvailability,
}

/// One outbound frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub timestamp: i64,
}

impl WsEvent {
    pub fn new(event_type: EventType, payload: serde_json::Value) -> Self {
        Self {
            event_type,
            payload,
            timestamp: now_ms(),
        }
    }
}

/// Cheap-to-clone broadcaster handle.
#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<WsEvent>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish a frame; returns the number of live subscribers.
    pub fn publish(&self, event_type: EventType, payload: serde_json::Value) -> usize {
        self.tx.send(WsEvent::new(event_type, payload)).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WsEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBroadcaster")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_delivered_in_order() {
        let broadcaster = EventBroadcaster::new();
        let mut rx = broadcaster.subscribe();

        broadcaster.publish(EventType::Signal, serde_json::json!({"n": 1}));
        broadcaster.publish(EventType::TradeOpened, serde_json::json!({"n": 2}));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.event_type, EventType::Signal);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.event_type, EventType::TradeOpened);
        assert_eq!(second.payload["n"], 2);
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let broadcaster = EventBroadcaster::new();
        assert_eq!(
            broadcaster.publish(EventType::Connected, serde_json::Value::Null),
            0
        );
    }

    #[test]
    fn frame_type_wire_names() {
        let event = WsEvent::new(EventType::TradeStopModifyFailed, serde_json::Value::Null);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"trade_stop_modify_failed\""));
    }
}
