//! Subscription dispatch error types.

use medrepo_storage::StorageError;

/// Result type for dispatcher operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Errors that can occur while attaching, refreshing or delivering.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The binding token passed its expiry; the client must reattach.
    #[error("Token expired")]
    TokenExpired,

    /// The binding token is unknown.
    #[error("Invalid token")]
    InvalidToken,

    /// The session's channel could not be written to.
    #[error("Channel unreachable: {message}")]
    ChannelUnreachable { message: String },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// The subscription is unknown, belongs to another tenant, or is not active.
    #[error("Subscription not active: {0}")]
    SubscriptionNotActive(String),

    #[error("Invalid subscription {id}: {message}")]
    InvalidSubscription { id: String, message: String },

    /// The session's delivery queue is at capacity.
    #[error("Delivery queue full for session {0}")]
    QueueFull(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl DispatchError {
    #[must_use]
    pub fn channel_unreachable(message: impl Into<String>) -> Self {
        Self::ChannelUnreachable {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn invalid_subscription(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidSubscription {
            id: id.into(),
            message: message.into(),
        }
    }

    pub fn is_token_expired(&self) -> bool {
        matches!(self, Self::TokenExpired)
    }

    pub fn is_channel_unreachable(&self) -> bool {
        matches!(self, Self::ChannelUnreachable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(DispatchError::TokenExpired.to_string(), "Token expired");
        assert_eq!(
            DispatchError::channel_unreachable("socket closed").to_string(),
            "Channel unreachable: socket closed"
        );
        assert_eq!(
            DispatchError::invalid_subscription("s1", "bad criteria").to_string(),
            "Invalid subscription s1: bad criteria"
        );
    }

    #[test]
    fn test_storage_conversion() {
        let err: DispatchError = StorageError::not_found("Subscription", "s1").into();
        assert!(matches!(err, DispatchError::Storage(_)));
        assert!(!err.is_token_expired());
    }
}
