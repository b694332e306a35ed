//! Session binding tokens.

use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::time::Instant;

/// Opaque token binding a client to its session.
///
/// `deadline` tracks expiry on the tokio clock so that timers and the
/// expiry check agree; the wall-clock fields are for the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingToken {
    pub value: String,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(skip)]
    pub deadline: Instant,
}

impl BindingToken {
    /// Issues a fresh token valid for `ttl`.
    pub fn issue(ttl: Duration) -> Self {
        let issued_at = OffsetDateTime::now_utc();
        Self {
            value: uuid::Uuid::new_v4().to_string(),
            issued_at,
            expires_at: issued_at + ttl,
            deadline: Instant::now() + ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Time left before expiry.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}
