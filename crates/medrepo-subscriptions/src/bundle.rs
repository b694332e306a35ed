//! Notification bundles sent over a session.

use medrepo_core::ChangeKind;
use serde_json::{Value, json};
use time::OffsetDateTime;

use crate::types::{ActiveSubscription, Delivery, rfc3339};

fn status_entry(subscription: &ActiveSubscription, kind: &str, events: u64) -> Value {
    json!({
        "resourceType": "SubscriptionStatus",
        "status": "active",
        "type": kind,
        "subscription": {"reference": subscription.reference()},
        "eventsSinceSubscriptionStart": events.to_string(),
    })
}

/// Bundle announcing that a session is bound to its subscription.
pub fn handshake(subscription: &ActiveSubscription) -> Value {
    json!({
        "resourceType": "Bundle",
        "type": "subscription-notification",
        "timestamp": rfc3339(OffsetDateTime::now_utc()),
        "entry": [{
            "resource": status_entry(subscription, "handshake", subscription.events_since_start()),
        }]
    })
}

/// Bundle carrying one change event.
///
/// The first entry is the status with the event's number and focus; the
/// second the resource itself. Deletes carry the last live content and a
/// `DELETE` request so clients can tell them apart.
pub fn notification(subscription: &ActiveSubscription, delivery: &Delivery) -> Value {
    let event = &delivery.event;
    let focus = format!(
        "{}/{}/_history/{}",
        event.resource_type, event.resource_id, event.version_id
    );

    let mut status = status_entry(subscription, "event-notification", delivery.event_number);
    status["notificationEvent"] = json!([{
        "eventNumber": delivery.event_number.to_string(),
        "timestamp": rfc3339(event.timestamp),
        "focus": {"reference": focus},
    }]);

    let mut entry = json!({
        "fullUrl": format!("{}/{}", event.resource_type, event.resource_id),
        "resource": event.resource.clone().unwrap_or(Value::Null),
    });
    if event.change_kind == ChangeKind::Deleted {
        entry["request"] = json!({"method": "DELETE", "url": focus});
    }

    json!({
        "resourceType": "Bundle",
        "type": "subscription-notification",
        "timestamp": rfc3339(OffsetDateTime::now_utc()),
        "entry": [{"resource": status}, entry],
    })
}
