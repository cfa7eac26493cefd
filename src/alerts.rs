// =============================================================================
// Alert bus — topic-keyed publish/subscribe with channel fan-out
// =============================================================================
//
// Publications carry a topic, severity and free-form context and are fanned
// out to every subscriber over bounded queues. Publishing never blocks: a
// full subscriber queue drops the publication for that subscriber and bumps
// a drop counter. Delivery to each subscriber preserves publication order.
//
// Built-in channel subscribers:
//   log     — re-emits every publication through tracing.
//   webhook — POSTs the publication JSON to a configured URL.
// Slack and email channels share the webhook delivery path when configured.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Queue depth per subscriber; overflow drops rather than blocking.
const SUBSCRIBER_QUEUE_DEPTH: usize = 256;

// ---------------------------------------------------------------------------
// Publication model
// ---------------------------------------------------------------------------

/// Severity of a published alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Delivery channel requested by a publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Log,
    Slack,
    Email,
    Webhook,
}

/// A single alert publication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub topic: String,
    pub severity: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    pub channels: Vec<Channel>,
    pub published_at: String,
}

impl Alert {
    /// Minimal log-channel alert.
    pub fn new(topic: &str, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            topic: topic.to_string(),
            severity,
            message: message.into(),
            body: None,
            subject: None,
            context: None,
            channels: vec![Channel::Log],
            published_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_channels(mut self, channels: Vec<Channel>) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_body(mut self, subject: impl Into<String>, body: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self.body = Some(body.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

struct Subscriber {
    name: String,
    /// Topic prefix filter; empty subscribes to everything.
    topic_prefix: String,
    tx: mpsc::Sender<Alert>,
}

/// Topic-keyed pub/sub hub. Cheap to clone via Arc.
pub struct AlertBus {
    subscribers: RwLock<Vec<Subscriber>>,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl AlertBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: RwLock::new(Vec::new()),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    /// Register a subscriber and receive its bounded queue.
    ///
    /// The caller owns the receiving task; a subscriber that stops draining
    /// only loses its own deliveries.
    pub fn subscribe(&self, name: &str, topic_prefix: &str) -> mpsc::Receiver<Alert> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        self.subscribers.write().push(Subscriber {
            name: name.to_string(),
            topic_prefix: topic_prefix.to_string(),
            tx,
        });
        debug!(subscriber = name, topic_prefix, "alert subscriber registered");
        rx
    }

    /// Publish to all matching subscribers without blocking.
    pub fn publish(&self, alert: Alert) {
        self.published.fetch_add(1, Ordering::Relaxed);

        let mut stale: Vec<usize> = Vec::new();
        {
            let subs = self.subscribers.read();
            for (idx, sub) in subs.iter().enumerate() {
                if !alert.topic.starts_with(&sub.topic_prefix) {
                    continue;
                }
                match sub.tx.try_send(alert.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            subscriber = %sub.name,
                            topic = %alert.topic,
                            "alert dropped — subscriber queue full"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        stale.push(idx);
                    }
                }
            }
        }

        // Remove subscribers whose receivers were dropped.
        if !stale.is_empty() {
            let mut subs = self.subscribers.write();
            for idx in stale.into_iter().rev() {
                if idx < subs.len() {
                    let removed = subs.remove(idx);
                    debug!(subscriber = %removed.name, "alert subscriber removed (closed)");
                }
            }
        }
    }

    /// Counters for the metrics endpoint.
    pub fn counters(&self) -> (u64, u64) {
        (
            self.published.load(Ordering::Relaxed),
            self.dropped.load(Ordering::Relaxed),
        )
    }
}

impl std::fmt::Debug for AlertBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertBus")
            .field("subscribers", &self.subscribers.read().len())
            .field("published", &self.published.load(Ordering::Relaxed))
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Built-in channel workers
// ---------------------------------------------------------------------------

/// Spawn the log-channel worker: every publication is re-emitted through
/// tracing at its severity.
pub fn spawn_log_channel(bus: &Arc<AlertBus>) {
    let mut rx = bus.subscribe("log-channel", "");
    tokio::spawn(async move {
        while let Some(alert) = rx.recv().await {
            if !alert.channels.contains(&Channel::Log) {
                continue;
            }
            match alert.severity {
                Severity::Info => {
                    info!(topic = %alert.topic, "{}", alert.message)
                }
                Severity::Warning => {
                    warn!(topic = %alert.topic, "{}", alert.message)
                }
                Severity::Error | Severity::Critical => {
                    error!(topic = %alert.topic, "{}", alert.message)
                }
            }
        }
    });
}

/// Spawn the webhook-channel worker: publications requesting slack, email or
/// webhook delivery are POSTed to the configured URL as JSON.
pub fn spawn_webhook_channel(bus: &Arc<AlertBus>, webhook_url: String) {
    let mut rx = bus.subscribe("webhook-channel", "");
    tokio::spawn(async move {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        while let Some(alert) = rx.recv().await {
            let wants_remote = alert
                .channels
                .iter()
                .any(|c| matches!(c, Channel::Slack | Channel::Email | Channel::Webhook));
            if !wants_remote {
                continue;
            }
            if let Err(e) = client.post(&webhook_url).json(&alert).send().await {
                warn!(topic = %alert.topic, error = %e, "webhook delivery failed");
            }
        }
    });
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fan_out_preserves_order() {
        let bus = AlertBus::new();
        let mut rx = bus.subscribe("test", "");

        for i in 0..5 {
            bus.publish(Alert::new("risk.daily", Severity::Info, format!("msg-{i}")));
        }

        for i in 0..5 {
            let alert = rx.recv().await.unwrap();
            assert_eq!(alert.message, format!("msg-{i}"));
        }
    }

    #[tokio::test]
    async fn topic_prefix_filtering() {
        let bus = AlertBus::new();
        let mut risk_rx = bus.subscribe("risk-only", "risk.");
        let mut all_rx = bus.subscribe("all", "");

        bus.publish(Alert::new("provider.availability", Severity::Warning, "a"));
        bus.publish(Alert::new("risk.daily", Severity::Info, "b"));

        let got = risk_rx.recv().await.unwrap();
        assert_eq!(got.topic, "risk.daily");

        assert_eq!(all_rx.recv().await.unwrap().topic, "provider.availability");
        assert_eq!(all_rx.recv().await.unwrap().topic, "risk.daily");
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        let bus = AlertBus::new();
        let _rx = bus.subscribe("slow", "");

        // Overfill the bounded queue; publish must not block or panic.
        for i in 0..(SUBSCRIBER_QUEUE_DEPTH + 50) {
            bus.publish(Alert::new("t", Severity::Info, format!("{i}")));
        }

        let (published, dropped) = bus.counters();
        assert_eq!(published, (SUBSCRIBER_QUEUE_DEPTH + 50) as u64);
        assert_eq!(dropped, 50);
    }

    #[tokio::test]
    async fn closed_subscribers_are_pruned() {
        let bus = AlertBus::new();
        {
            let _rx = bus.subscribe("ephemeral", "");
            // Receiver dropped here.
        }
        bus.publish(Alert::new("t", Severity::Info, "x"));
        bus.publish(Alert::new("t", Severity::Info, "y"));
        assert_eq!(bus.subscribers.read().len(), 0);
    }

    #[test]
    fn alert_builder() {
        let a = Alert::new("broker.drift", Severity::Error, "drift detected")
            .with_context(serde_json::json!({"broker": "oanda"}))
            .with_channels(vec![Channel::Log, Channel::Webhook]);
        assert_eq!(a.channels.len(), 2);
        assert!(a.context.is_some());
        let json = serde_json::to_string(&a).unwrap();
        assert!(json.contains("\"severity\":\"error\""));
    }
}
