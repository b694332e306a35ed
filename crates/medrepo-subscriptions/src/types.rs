//! Core subscription types.
//!
//! These are parsed from `Subscription` resources for runtime matching, plus
//! the messages exchanged with a session's client.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use medrepo_core::{ChangeEvent, ChangeKind};
use medrepo_search::{SearchIndexRow, SearchQuery};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use time::OffsetDateTime;

use crate::error::{DispatchError, DispatchResult};
use crate::token::BindingToken;

/// Extension overriding how many consecutive delivery failures a subscription tolerates.
pub const MAX_ATTEMPTS_EXTENSION: &str =
    "https://medplum.com/fhir/StructureDefinition/subscription-max-attempts";

/// Extension restricting a subscription to one interaction (`create`, `update` or `delete`).
pub const SUPPORTED_INTERACTION_EXTENSION: &str =
    "https://medplum.com/fhir/StructureDefinition/subscription-supported-interaction";

/// The only channel the dispatcher delivers on.
pub const WEBSOCKET_CHANNEL: &str = "websocket";

/// Status of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Requested,
    Active,
    Error,
    Off,
}

impl SubscriptionStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "requested" => Some(Self::Requested),
            "active" => Some(Self::Active),
            "error" => Some(Self::Error),
            "off" => Some(Self::Off),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Active => "active",
            Self::Error => "error",
            Self::Off => "off",
        }
    }
}

/// An active subscription, parsed for matching.
#[derive(Debug, Clone)]
pub struct ActiveSubscription {
    pub id: String,
    pub tenant: String,
    /// Criteria as written on the resource, e.g. `Observation?code=1234-5`
    pub criteria_text: String,
    pub criteria: SearchQuery,
    /// Only changes of this kind are delivered when set
    pub interaction: Option<ChangeKind>,
    /// Per-subscription override of the dispatcher's max delivery attempts
    pub max_attempts: Option<u32>,
    events_since_start: Arc<AtomicU64>,
}

impl ActiveSubscription {
    /// Parses a `Subscription` resource.
    ///
    /// Returns `Ok(None)` when the subscription is not active or does not use
    /// the websocket channel, and an error when it is active but its criteria
    /// or interaction filter cannot be evaluated.
    pub fn from_resource(tenant: &str, resource: &Value) -> DispatchResult<Option<Self>> {
        let id = resource
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| DispatchError::invalid_subscription("?", "missing id"))?
            .to_string();

        let status = resource
            .get("status")
            .and_then(Value::as_str)
            .and_then(SubscriptionStatus::parse);
        if status != Some(SubscriptionStatus::Active) {
            return Ok(None);
        }

        if resource.pointer("/channel/type").and_then(Value::as_str) != Some(WEBSOCKET_CHANNEL) {
            return Ok(None);
        }

        let criteria_text = resource
            .get("criteria")
            .and_then(Value::as_str)
            .ok_or_else(|| DispatchError::invalid_subscription(&id, "missing criteria"))?
            .to_string();
        let criteria = SearchQuery::parse(&criteria_text)
            .map_err(|e| DispatchError::invalid_subscription(&id, e.to_string()))?;

        let interaction = interaction_extension(&id, resource)?;

        Ok(Some(Self {
            id,
            tenant: tenant.to_string(),
            criteria_text,
            criteria,
            interaction,
            max_attempts: max_attempts_extension(resource),
            events_since_start: Arc::new(AtomicU64::new(0)),
        }))
    }

    /// Keeps the event counter of `previous` when a subscription is re-read.
    pub(crate) fn continue_from(mut self, previous: &ActiveSubscription) -> Self {
        self.events_since_start = previous.events_since_start.clone();
        self
    }

    /// Tenant, type, interaction and criteria match against the event's indexed content.
    pub fn matches(&self, event: &ChangeEvent, rows: &[SearchIndexRow]) -> bool {
        event.tenant.as_deref() == Some(self.tenant.as_str())
            && event.resource_type == self.criteria.resource_type
            && self.interaction.is_none_or(|kind| kind == event.change_kind)
            && self.criteria.matches(&event.resource_id, rows)
    }

    /// Assigns the next event number.
    pub(crate) fn next_event_number(&self) -> u64 {
        self.events_since_start.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn events_since_start(&self) -> u64 {
        self.events_since_start.load(Ordering::SeqCst)
    }

    pub fn reference(&self) -> String {
        format!("Subscription/{}", self.id)
    }
}

fn extension<'a>(resource: &'a Value, url: &str) -> Option<&'a Value> {
    resource
        .get("extension")
        .and_then(Value::as_array)?
        .iter()
        .find(|ext| ext.get("url").and_then(Value::as_str) == Some(url))
}

fn interaction_extension(id: &str, resource: &Value) -> DispatchResult<Option<ChangeKind>> {
    let Some(ext) = extension(resource, SUPPORTED_INTERACTION_EXTENSION) else {
        return Ok(None);
    };
    match ext.get("valueCode").and_then(Value::as_str) {
        Some("create") => Ok(Some(ChangeKind::Created)),
        Some("update") => Ok(Some(ChangeKind::Updated)),
        Some("delete") => Ok(Some(ChangeKind::Deleted)),
        other => Err(DispatchError::invalid_subscription(
            id,
            format!("unsupported interaction {}", other.unwrap_or("<missing>")),
        )),
    }
}

fn max_attempts_extension(resource: &Value) -> Option<u32> {
    extension(resource, MAX_ATTEMPTS_EXTENSION)
        .and_then(|ext| ext.get("valueInteger"))
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .filter(|n| *n > 0)
}

/// One queued notification for a session.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub event: ChangeEvent,
    /// Position of the event in the subscription's notification stream
    pub event_number: u64,
}

/// Server to client message.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    /// Handshake bundle sent right after attach
    Handshake(Value),
    /// Event notification bundle
    Notification(Value),
    Ping,
    /// The token is inside its grace window
    RefreshPrompt { expires_at: OffsetDateTime },
    /// A newly issued binding token
    Token(BindingToken),
    Close { reason: String },
}

impl OutboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Handshake(_) => "handshake",
            Self::Notification(_) => "notification",
            Self::Ping => "ping",
            Self::RefreshPrompt { .. } => "refresh-token-required",
            Self::Token(_) => "token",
            Self::Close { .. } => "close",
        }
    }

    /// Wire form of the message.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Handshake(bundle) | Self::Notification(bundle) => bundle.clone(),
            Self::Ping => json!({"type": "ping"}),
            Self::RefreshPrompt { expires_at } => json!({
                "type": "refresh-token-required",
                "expiresAt": rfc3339(*expires_at),
            }),
            Self::Token(token) => json!({
                "type": "token",
                "token": token.value,
                "expiresAt": rfc3339(token.expires_at),
            }),
            Self::Close { reason } => json!({"type": "close", "reason": reason}),
        }
    }
}

/// Client to server message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum InboundMessage {
    Pong,
    RefreshToken { token: String },
}

pub(crate) fn rfc3339(at: OffsetDateTime) -> String {
    at.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| at.to_string())
}
