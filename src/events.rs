//! Server-wide event bus.
//!
//! A single tokio broadcast channel carries structured [`ServerEvent`]s:
//! readiness transitions, unloads, compatibility rows, agent-run updates.
//! Publishing never blocks and never propagates errors to the caller — a bus
//! with no subscribers simply drops the event, and a lagging subscriber loses
//! the oldest events, not the publisher's time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// One structured event on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEvent {
    pub event_type: String,
    pub data: Value,
    pub ts: DateTime<Utc>,
}

impl ServerEvent {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            ts: Utc::now(),
        }
    }
}

/// Cloneable handle to the broadcast bus.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ServerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(16));
        Self { sender }
    }

    /// Fire-and-forget publish. Send failures (no subscribers) are expected
    /// and ignored; anything else is logged, never propagated.
    pub fn publish(&self, event_type: &str, data: Value) {
        let event = ServerEvent::new(event_type, data);
        if self.sender.send(event).is_err() {
            tracing::trace!(event_type, "event dropped — no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish("model_unloaded", json!({"model_id": "m", "reason": "ttl"}));

        let event = rx.recv().await.expect("event should arrive");
        assert_eq!(event.event_type, "model_unloaded");
        assert_eq!(event.data["reason"], "ttl");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new(16);
        // Must not panic or block.
        bus.publish("model_readiness_changed", json!({"state": "routable"}));
    }

    #[tokio::test]
    async fn each_subscriber_gets_every_event() {
        let bus = EventBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish("model_canary_passed", json!({"model_id": "m"}));

        assert_eq!(a.recv().await.unwrap().event_type, "model_canary_passed");
        assert_eq!(b.recv().await.unwrap().event_type, "model_canary_passed");
    }
}
