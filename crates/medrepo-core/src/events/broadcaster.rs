//! Event broadcaster and the sink abstraction writes publish through.
//!
//! The repository publishes every committed change to a set of
//! [`ChangeEventSink`]s. `EventBroadcaster` is the in-process fan-out sink
//! (tokio broadcast channel) for observers that tolerate lag; the
//! subscription dispatcher registers its own lossless sink.

use std::sync::Arc;
use tokio::sync::broadcast;

use super::types::ChangeEvent;

/// Default buffer size for the broadcast channel.
/// Events beyond this limit will cause older events to be dropped for slow receivers.
const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Error returned when a sink cannot accept an event.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// The receiving side of the sink has gone away.
    #[error("Event sink closed: {0}")]
    Closed(String),
}

/// Destination for committed change events.
///
/// `publish` must not block: it is called on the write path right after
/// commit. A failure is reported to the caller, which logs it; the write is
/// never rolled back because of it.
pub trait ChangeEventSink: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    fn publish(&self, event: ChangeEvent) -> Result<(), EventError>;
}

/// Broadcaster for change events.
///
/// This is a thread-safe broadcaster that can be cloned and shared across the application.
/// Multiple subscribers can receive events from a single sender.
#[derive(Clone)]
pub struct EventBroadcaster {
    sender: broadcast::Sender<ChangeEvent>,
}

impl EventBroadcaster {
    /// Create a new broadcaster with default buffer size.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    /// Create a new broadcaster with custom buffer size.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Create a new broadcaster wrapped in an Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Send a change event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event.
    /// Returns 0 if there are no active subscribers.
    pub fn send(&self, event: ChangeEvent) -> usize {
        self.sender.send(event).unwrap_or_default()
    }

    /// Subscribe to events.
    ///
    /// Returns a receiver that will receive all events broadcast after subscription.
    /// Note: Events sent before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Check if there are any active subscribers.
    pub fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
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
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

impl ChangeEventSink for EventBroadcaster {
    fn name(&self) -> &str {
        "broadcast"
    }

    fn publish(&self, event: ChangeEvent) -> Result<(), EventError> {
        let delivered = self.send(event);
        tracing::trace!(receivers = delivered, "change event broadcast");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::ChangeKind;
    use crate::shard::ShardId;

    fn created_event(
        shard: ShardId,
        resource_type: &str,
        id: &str,
        resource: serde_json::Value,
    ) -> ChangeEvent {
        ChangeEvent::new(ChangeKind::Created, shard, resource_type, id, 1)
            .with_resource(Some(resource))
    }

    #[test]
    fn test_broadcaster_creation() {
        let broadcaster = EventBroadcaster::new();
        assert_eq!(broadcaster.subscriber_count(), 0);
        assert!(!broadcaster.has_subscribers());
    }

    #[test]
    fn test_broadcaster_no_subscribers_is_not_an_error() {
        let broadcaster = EventBroadcaster::new();
        let event = created_event(ShardId::global(), "Patient", "123", serde_json::json!({}));
        assert_eq!(broadcaster.send(event.clone()), 0);
        assert!(broadcaster.publish(event).is_ok());
    }

    #[tokio::test]
    async fn test_broadcaster_send_receive() {
        let broadcaster = EventBroadcaster::new();
        let mut receiver = broadcaster.subscribe();

        broadcaster
            .publish(created_event(
                ShardId::global(),
                "Patient",
                "123",
                serde_json::json!({"id": "123"}),
            ))
            .unwrap();

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.resource_type, "Patient");
        assert_eq!(event.resource_id, "123");
        assert_eq!(event.change_kind, ChangeKind::Created);
    }

    #[tokio::test]
    async fn test_broadcaster_multiple_subscribers() {
        let broadcaster = EventBroadcaster::new();
        let mut receiver1 = broadcaster.subscribe();
        let mut receiver2 = broadcaster.subscribe();

        assert_eq!(broadcaster.subscriber_count(), 2);

        let count = broadcaster.send(created_event(
            ShardId::global(),
            "Patient",
            "123",
            serde_json::json!({}),
        ));
        assert_eq!(count, 2);

        assert_eq!(receiver1.recv().await.unwrap().resource_id, "123");
        assert_eq!(receiver2.recv().await.unwrap().resource_id, "123");
    }
}
