//! Broadcast of request-lifecycle events
//!
//! A `tokio::sync::broadcast` channel wrapped so that emission never blocks
//! the proxy engine and subscriber overflow surfaces as an explicit
//! `Lag` event instead of silently losing the stream.

use crate::schema::ProxyEvent;
use tokio::sync::broadcast;

/// Per-subscriber buffer; events past this are dropped oldest-first.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProxyEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            tx: broadcast::channel(capacity).0,
        }
    }

    /// Broadcast an event. A send with no subscribers is a no-op.
    pub fn emit(&self, event: ProxyEvent) {
        let _ = self.tx.send(event);
    }

    /// Start receiving events emitted after this point.
    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct EventStream {
    rx: broadcast::Receiver<ProxyEvent>,
}

impl EventStream {
    /// Next event, or `None` once every bus handle is gone. A subscriber
    /// that fell behind gets a `Lag` event counting what it missed, then
    /// resumes from the oldest retained event.
    pub async fn recv(&mut self) -> Option<ProxyEvent> {
        match self.rx.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(dropped)) => {
                Some(ProxyEvent::Lag { dropped })
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ErrorKind;

    fn failed(id: i64) -> ProxyEvent {
        ProxyEvent::RequestFailed {
            id,
            error: ErrorKind::Timeout,
        }
    }

    #[tokio::test]
    async fn subscriber_receives_events_in_order() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe();

        bus.emit(failed(1));
        bus.emit(failed(2));

        match stream.recv().await {
            Some(ProxyEvent::RequestFailed { id, .. }) => assert_eq!(id, 1),
            other => panic!("unexpected event: {other:?}"),
        }
        match stream.recv().await {
            Some(ProxyEvent::RequestFailed { id, .. }) => assert_eq!(id, 2),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_a_noop() {
        let bus = EventBus::new();
        bus.emit(failed(1));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_sees_lag_event() {
        let bus = EventBus::with_capacity(4);
        let mut stream = bus.subscribe();

        for id in 0..10 {
            bus.emit(failed(id));
        }

        match stream.recv().await {
            Some(ProxyEvent::Lag { dropped }) => assert_eq!(dropped, 6),
            other => panic!("expected lag, got {other:?}"),
        }
        // stream resumes with the oldest retained event
        match stream.recv().await {
            Some(ProxyEvent::RequestFailed { id, .. }) => assert_eq!(id, 6),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_ends_when_bus_dropped() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe();
        drop(bus);
        assert!(stream.recv().await.is_none());
    }
}
