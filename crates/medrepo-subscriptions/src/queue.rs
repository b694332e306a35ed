//! Delivery queue contract and its in-process implementation.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::{DispatchError, DispatchResult};
use crate::session::SessionTable;
use crate::types::Delivery;

/// Hands a delivery to the worker of a session.
///
/// Implementations must keep FIFO order per session and must not drop a
/// delivery silently: a delivery they cannot accept is reported as
/// [`DispatchError::QueueFull`] or [`DispatchError::SessionNotFound`].
#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    async fn enqueue(&self, delivery: Delivery, session_id: &str) -> DispatchResult<()>;
}

/// Bounded per-session queues drained by the session tasks.
#[derive(Clone)]
pub struct InProcessQueue {
    sessions: Arc<SessionTable>,
}

impl InProcessQueue {
    pub(crate) fn new(sessions: Arc<SessionTable>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl DeliveryQueue for InProcessQueue {
    async fn enqueue(&self, delivery: Delivery, session_id: &str) -> DispatchResult<()> {
        let sender = self
            .sessions
            .get(session_id)
            .map(|session| session.queue.clone())
            .ok_or_else(|| DispatchError::SessionNotFound(session_id.to_string()))?;

        match sender.try_send(delivery) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DispatchError::QueueFull(session_id.to_string())),
            Err(TrySendError::Closed(_)) => {
                Err(DispatchError::SessionNotFound(session_id.to_string()))
            }
        }
    }
}

impl std::fmt::Debug for InProcessQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessQueue")
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
