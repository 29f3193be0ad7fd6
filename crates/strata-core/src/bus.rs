//! In-process change notification for committed events.
//!
//! Stores publish every successfully appended event here. Projectors use a
//! notification only as a wake-up signal and re-read the store from their
//! checkpoint, so a lagging or missed notification never loses data. Saga
//! steps wait on the bus for the event that confirms their command and
//! settle a lagged or timed-out wait against the store.

use tokio::sync::broadcast;

use crate::repository::StoredEvent;

const DEFAULT_CAPACITY: usize = 1024;

/// Broadcast channel of committed events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<StoredEvent>,
}

impl EventBus {
    /// Creates a bus that buffers up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes committed events in order.
    pub fn publish(&self, events: &[StoredEvent]) {
        for event in events {
            // No subscribers is not an error: the store remains the source of truth.
            let _ = self.sender.send(event.clone());
        }
    }

    /// Subscribes to events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StoredEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_subscriber_receives_published_events_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let aggregate_id = Uuid::new_v4();
        let events: Vec<StoredEvent> = (1..=2)
            .map(|seq| StoredEvent {
                event_id: Uuid::new_v4(),
                aggregate_id,
                aggregate_type: "test".to_owned(),
                event_type: "test.happened".to_owned(),
                payload: serde_json::json!({}),
                schema_version: 1,
                sequence_number: seq,
                correlation_id: Uuid::new_v4(),
                causation_id: Uuid::new_v4(),
                occurred_at: Utc::now(),
                position: seq,
            })
            .collect();

        bus.publish(&events);

        assert_eq!(rx.recv().await.unwrap().sequence_number, 1);
        assert_eq!(rx.recv().await.unwrap().sequence_number, 2);
    }

    #[test]
    fn test_publish_without_subscribers_does_not_panic() {
        EventBus::new(4).publish(&[]);
    }
}
