//! Event bus for real-time route event streaming.
//!
//! Single producer side (the engine and its services), many consumers (SSE
//! clients). Events emitted before the first client ever connects are held in
//! a bounded FIFO and replayed, in order, into the first registered sink.
//! A sink whose channel has closed is evicted on the next broadcast; other
//! sinks are unaffected, and producers are never backpressured.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Capacity of the pre-initialization buffer.
const BUFFER_CAPACITY: usize = 1_000;

/// Domain event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    ExchangeCreated,
    ExchangeStarted,
    ExchangeCheckpoint,
    ExchangePaused,
    ExchangeResumed,
    ExchangeWaitingApproval,
    ExchangeCancelled,
    ExchangeCompleted,
    ExchangeFailed,
    ExchangeRecovering,
    ExchangeStalled,
    ApprovalRequested,
    ApprovalGranted,
    ApprovalRejected,
}

impl EventType {
    /// SSE event name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExchangeCreated => "EXCHANGE_CREATED",
            Self::ExchangeStarted => "EXCHANGE_STARTED",
            Self::ExchangeCheckpoint => "EXCHANGE_CHECKPOINT",
            Self::ExchangePaused => "EXCHANGE_PAUSED",
            Self::ExchangeResumed => "EXCHANGE_RESUMED",
            Self::ExchangeWaitingApproval => "EXCHANGE_WAITING_APPROVAL",
            Self::ExchangeCancelled => "EXCHANGE_CANCELLED",
            Self::ExchangeCompleted => "EXCHANGE_COMPLETED",
            Self::ExchangeFailed => "EXCHANGE_FAILED",
            Self::ExchangeRecovering => "EXCHANGE_RECOVERING",
            Self::ExchangeStalled => "EXCHANGE_STALLED",
            Self::ApprovalRequested => "APPROVAL_REQUESTED",
            Self::ApprovalGranted => "APPROVAL_GRANTED",
            Self::ApprovalRejected => "APPROVAL_REJECTED",
        }
    }
}

/// One domain event, serialized to SSE clients as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub route_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange_id: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub data: HashMap<String, String>,
}

impl RouteEvent {
    /// Create an event tied to an exchange.
    #[must_use]
    pub fn exchange(event_type: EventType, route_id: &str, exchange_id: &str) -> Self {
        Self {
            event_type,
            route_id: route_id.to_string(),
            exchange_id: Some(exchange_id.to_string()),
            data: HashMap::new(),
        }
    }

    /// Attach a key/value pair to the event payload.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }
}

/// In-process fan-out of [`RouteEvent`]s to SSE sinks.
#[derive(Debug)]
pub struct EventBus {
    /// Registered sinks keyed by client id.
    sinks: RwLock<HashMap<String, mpsc::UnboundedSender<RouteEvent>>>,
    /// Events emitted before the first sink registered.
    buffer: Mutex<VecDeque<RouteEvent>>,
    /// Set once the first sink has registered; buffering stops for good.
    initialized: AtomicBool,
}

impl EventBus {
    /// Create a new event bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sinks: RwLock::new(HashMap::new()),
            buffer: Mutex::new(VecDeque::new()),
            initialized: AtomicBool::new(false),
        }
    }

    /// Publish an event to every registered sink.
    ///
    /// Before the first sink ever registers, events are buffered (bounded;
    /// newest dropped with a warning once full). Dead sinks are evicted.
    pub fn broadcast(&self, event: RouteEvent) {
        if !self.initialized.load(Ordering::Acquire) {
            let mut buffer = self.buffer.lock();
            // Re-check under the lock so a racing first registration cannot
            // strand this event in the buffer after the drain.
            if !self.initialized.load(Ordering::Acquire) {
                if buffer.len() >= BUFFER_CAPACITY {
                    tracing::warn!(
                        event_type = event.event_type.as_str(),
                        "Event buffer full, dropping event"
                    );
                } else {
                    buffer.push_back(event);
                }
                return;
            }
        }

        let mut dead: Vec<String> = Vec::new();
        {
            let sinks = self.sinks.read();
            for (client_id, sink) in sinks.iter() {
                if sink.send(event.clone()).is_err() {
                    dead.push(client_id.clone());
                }
            }
        }

        if !dead.is_empty() {
            let mut sinks = self.sinks.write();
            for client_id in dead {
                tracing::debug!(client_id = %client_id, "Evicting dead event sink");
                sinks.remove(&client_id);
            }
        }
    }

    /// Register a new sink and return its receiving end.
    ///
    /// The first successful registration drains the pre-initialization buffer
    /// into the new sink, preserving emission order.
    pub fn register(&self, client_id: &str) -> mpsc::UnboundedReceiver<RouteEvent> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut buffer = self.buffer.lock();
        if !self.initialized.swap(true, Ordering::AcqRel) {
            for event in buffer.drain(..) {
                // The receiver cannot be gone yet; ignore the impossible.
                let _ = tx.send(event);
            }
        }
        drop(buffer);

        self.sinks.write().insert(client_id.to_string(), tx);
        rx
    }

    /// Remove a sink explicitly (client disconnect).
    pub fn unregister(&self, client_id: &str) {
        self.sinks.write().remove(client_id);
    }

    /// Number of connected sinks.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.sinks.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: EventType, exchange_id: &str) -> RouteEvent {
        RouteEvent::exchange(event_type, "chat-durable", exchange_id)
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_sinks() {
        let bus = EventBus::new();
        let mut rx1 = bus.register("client-1");
        let mut rx2 = bus.register("client-2");

        bus.broadcast(event(EventType::ExchangeCreated, "ex-1"));

        assert_eq!(rx1.recv().await.unwrap().exchange_id.as_deref(), Some("ex-1"));
        assert_eq!(rx2.recv().await.unwrap().exchange_id.as_deref(), Some("ex-1"));
    }

    #[tokio::test]
    async fn test_pre_init_buffering_preserves_order() {
        let bus = EventBus::new();

        bus.broadcast(event(EventType::ExchangeCreated, "ex-1"));
        bus.broadcast(event(EventType::ExchangeStarted, "ex-1"));
        bus.broadcast(event(EventType::ExchangeCompleted, "ex-1"));

        let mut rx = bus.register("client-1");
        assert_eq!(rx.recv().await.unwrap().event_type, EventType::ExchangeCreated);
        assert_eq!(rx.recv().await.unwrap().event_type, EventType::ExchangeStarted);
        assert_eq!(
            rx.recv().await.unwrap().event_type,
            EventType::ExchangeCompleted
        );
    }

    #[tokio::test]
    async fn test_buffer_is_bounded() {
        let bus = EventBus::new();
        for i in 0..(BUFFER_CAPACITY + 50) {
            bus.broadcast(event(EventType::ExchangeCheckpoint, &format!("ex-{i}")));
        }

        let mut rx = bus.register("client-1");
        let mut received = 0;
        while let Ok(e) = rx.try_recv() {
            // The oldest events survive; the overflow was dropped.
            assert_eq!(
                e.exchange_id.as_deref(),
                Some(format!("ex-{received}").as_str())
            );
            received += 1;
        }
        assert_eq!(received, BUFFER_CAPACITY);
    }

    #[tokio::test]
    async fn test_no_buffering_after_first_registration() {
        let bus = EventBus::new();
        let rx = bus.register("client-1");
        drop(rx);

        // Sink is dead: broadcast evicts it and the event is simply gone.
        bus.broadcast(event(EventType::ExchangeCreated, "ex-1"));
        assert_eq!(bus.client_count(), 0);

        // A late subscriber sees only future events.
        let mut rx = bus.register("client-2");
        bus.broadcast(event(EventType::ExchangeStarted, "ex-2"));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, EventType::ExchangeStarted);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dead_sink_eviction_leaves_others() {
        let bus = EventBus::new();
        let rx1 = bus.register("client-1");
        let mut rx2 = bus.register("client-2");
        drop(rx1);

        bus.broadcast(event(EventType::ExchangeCreated, "ex-1"));

        assert_eq!(bus.client_count(), 1);
        assert!(rx2.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_unregister() {
        let bus = EventBus::new();
        let _rx = bus.register("client-1");
        assert_eq!(bus.client_count(), 1);
        bus.unregister("client-1");
        assert_eq!(bus.client_count(), 0);
    }

    #[test]
    fn test_event_serialization_shape() {
        let e = event(EventType::ExchangeFailed, "ex-1").with("error", "boom");
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["type"], "EXCHANGE_FAILED");
        assert_eq!(json["routeId"], "chat-durable");
        assert_eq!(json["exchangeId"], "ex-1");
        assert_eq!(json["data"]["error"], "boom");
    }
}
