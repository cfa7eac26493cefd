// =============================================================================
// WebSocket handler — /ws/trading event feed
// =============================================================================
//
// Clients receive an immediate `connected` frame, then every trading event
// (`signal`, `auto_trade_*`, `trade_*`, `provider_availability`) in
// publication order. A lagging client loses frames on its own receiver and
// is told so via a fresh `connected` frame carrying a `resynced` marker;
// publishers are never blocked.
//
// The handler answers Ping with Pong and treats inbound text as heartbeat.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::events::{EventType, WsEvent};

/// Axum handler for the WebSocket upgrade request.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    if !state.config.enable_websockets {
        return (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            "websockets disabled",
        )
            .into_response();
    }
    info!("WebSocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_connection(socket, state))
        .into_response()
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.events.subscribe();

    // Immediate connected frame.
    let hello = WsEvent::new(
        EventType::Connected,
        serde_json::json!({
            "environment": state.config.environment.to_string(),
            "tradingScope": state.config.trading_scope.to_string(),
        }),
    );
    if send_frame(&mut sender, &hello).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            // ── Outbound: forward broadcast events ──────────────────────
            event = events.recv() => {
                match event {
                    Ok(frame) => {
                        if send_frame(&mut sender, &frame).await.is_err() {
                            debug!("WebSocket send failed — disconnecting");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "WebSocket client lagged — frames dropped");
                        let resync = WsEvent::new(
                            EventType::Connected,
                            serde_json::json!({"resynced": true, "skipped": skipped}),
                        );
                        if send_frame(&mut sender, &resync).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            // ── Inbound: heartbeats and control frames ──────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!(msg = %text, "WebSocket heartbeat received");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket close frame received");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!("WebSocket binary message ignored");
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    info!("WebSocket connection closed");
}

async fn send_frame<S>(sender: &mut S, frame: &WsEvent) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    match serde_json::to_string(frame) {
        Ok(json) => sender.send(Message::Text(json)).await,
        Err(e) => {
            // Serialisation failures are not transport failures.
            warn!(error = %e, "failed to serialise WebSocket frame");
            Ok(())
        }
    }
}
