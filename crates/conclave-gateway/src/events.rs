//! Event bus: fan runtime events out to every observer

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error};

use conclave_core::{EventSink, RuntimeEvent};

use crate::protocol::GatewayEvent;

/// Broadcast event bus for the gateway
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<GatewayEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Subscribe to events (each observer gets its own receiver)
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.sender.subscribe()
    }

    /// Broadcast an event to all observers
    pub fn broadcast(&self, event: GatewayEvent) {
        let receivers = self.sender.receiver_count();
        if receivers > 0 {
            debug!("Broadcasting event '{}' to {} receivers", event.event, receivers);
            // No receivers left is fine
            let _ = self.sender.send(event);
        }
    }

    /// Number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Sink that tags every runtime event with `session_id`
    pub fn session_sink(&self, session_id: impl Into<String>) -> Arc<dyn EventSink> {
        Arc::new(SessionEvents {
            session_id: session_id.into(),
            bus: self.clone(),
        })
    }
}

struct SessionEvents {
    session_id: String,
    bus: EventBus,
}

impl EventSink for SessionEvents {
    fn publish(&self, event: RuntimeEvent) {
        let name = event.name();
        match serde_json::to_value(&event) {
            Ok(data) => self
                .bus
                .broadcast(GatewayEvent::new(name, data).for_session(self.session_id.clone())),
            Err(e) => error!("Failed to serialize event '{}': {}", name, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_bus_broadcast() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let event = GatewayEvent::new("test.event", serde_json::json!({"key": "value"}));
        bus.broadcast(event);

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();
        assert_eq!(e1.event, "test.event");
        assert_eq!(e2.event, "test.event");
    }

    #[test]
    fn test_event_bus_no_receivers() {
        let bus = EventBus::new(16);
        bus.broadcast(GatewayEvent::new("test", serde_json::json!({})));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_session_sink_tags_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let sink = bus.session_sink("s1");

        sink.publish(RuntimeEvent::AgentSwitched {
            from: None,
            to: "a".into(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event, "agent_switched");
        assert_eq!(event.session_id.as_deref(), Some("s1"));
        assert_eq!(event.data["to"], "a");
    }
}
