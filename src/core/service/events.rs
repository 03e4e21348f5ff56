//! Broadcast bus for oracle lifecycle events.

use tokio::sync::broadcast;

use crate::core::domain::OracleEvent;

/// Fan-out bus for [`OracleEvent`]s.
///
/// Subscribers hold a [`broadcast::Receiver`]; dropping it unsubscribes.
/// Publishing with no subscribers is not an error.
pub struct EventBus {
    tx: broadcast::Sender<OracleEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<OracleEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: OracleEvent) {
        // No receivers is fine; events are advisory.
        let _ = self.tx.send(event);
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
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

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(OracleEvent::SourceUnhealthy { source: "binance".into() });
        let event = rx.recv().await.unwrap();
        assert_eq!(event, OracleEvent::SourceUnhealthy { source: "binance".into() });
    }

    #[tokio::test]
    async fn test_dropping_receiver_unsubscribes() {
        let bus = EventBus::new(8);
        let rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(rx);
        assert_eq!(bus.subscriber_count(), 0);
        // Publishing into the void must not panic.
        bus.publish(OracleEvent::SourceUnhealthy { source: "kraken".into() });
    }
}
