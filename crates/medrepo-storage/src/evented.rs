//! Post-commit change event fan-out.
//!
//! The repository hands every committed mutation to an [`EventPublisher`],
//! which forwards it to all registered sinks. Events are emitted **after** the
//! commit succeeds, so they only describe changes that are durable.
//!
//! # Example
//!
//! ```ignore
//! use medrepo_core::events::EventBroadcaster;
//! use medrepo_storage::EventPublisher;
//!
//! let broadcaster = EventBroadcaster::new_shared();
//! let publisher = EventPublisher::new().with_sink(broadcaster);
//! ```

use std::sync::Arc;

use medrepo_core::ChangeEvent;
use medrepo_core::events::ChangeEventSink;
use tracing::{debug, warn};

/// Forwards committed change events to every registered sink.
#[derive(Clone, Default)]
pub struct EventPublisher {
    sinks: Vec<Arc<dyn ChangeEventSink>>,
}

impl EventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn ChangeEventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn add_sink(&mut self, sink: Arc<dyn ChangeEventSink>) {
        self.sinks.push(sink);
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Publishes to each sink in registration order.
    ///
    /// Returns the number of sinks that accepted the event. A sink failure is
    /// logged and does not stop delivery to the remaining sinks.
    pub fn publish(&self, event: &ChangeEvent) -> usize {
        let mut delivered = 0;
        for sink in &self.sinks {
            match sink.publish(event.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    sink = sink.name(),
                    resource_type = %event.resource_type,
                    id = %event.resource_id,
                    version_id = event.version_id,
                    error = %e,
                    "Failed to publish change event"
                ),
            }
        }
        debug!(
            resource_type = %event.resource_type,
            id = %event.resource_id,
            version_id = event.version_id,
            kind = %event.change_kind,
            sinks = delivered,
            "Emitted change event"
        );
        delivered
    }
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("sinks", &self.sinks.iter().map(|s| s.name()).collect::<Vec<_>>())
            .finish()
    }
}
