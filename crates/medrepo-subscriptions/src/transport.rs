//! Outbound channel of a session.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{DispatchError, DispatchResult};
use crate::types::OutboundMessage;

/// Writes messages to a session's client.
///
/// A failed send is a delivery failure; the dispatcher retries
/// notifications and treats other failed messages as a lost client.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    async fn send(&self, message: OutboundMessage) -> DispatchResult<()>;
}

/// Transport backed by a channel drained by the connection's writer task.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    sender: mpsc::Sender<OutboundMessage>,
}

impl ChannelTransport {
    pub fn new(sender: mpsc::Sender<OutboundMessage>) -> Self {
        Self { sender }
    }

    /// Creates a transport and the receiver its writer task drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OutboundMessage>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self::new(sender), receiver)
    }
}

#[async_trait]
impl SessionTransport for ChannelTransport {
    async fn send(&self, message: OutboundMessage) -> DispatchResult<()> {
        self.sender
            .send(message)
            .await
            .map_err(|_| DispatchError::channel_unreachable("connection writer has stopped"))
    }
}
