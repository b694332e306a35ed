//! In-memory registry of active subscriptions.

use std::sync::Arc;

use dashmap::DashMap;
use medrepo_core::ChangeEvent;
use medrepo_search::SearchIndexRow;

use crate::types::ActiveSubscription;

/// Active subscriptions keyed by id.
///
/// Ids are lineage ids of `Subscription` resources; a tenant's ids never
/// collide with another's because ids are generated globally.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    subscriptions: DashMap<String, Arc<ActiveSubscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a subscription, keeping its event counter.
    pub fn upsert(&self, subscription: ActiveSubscription) -> Arc<ActiveSubscription> {
        let subscription = match self.subscriptions.get(&subscription.id) {
            Some(previous) => subscription.continue_from(&previous),
            None => subscription,
        };
        let subscription = Arc::new(subscription);
        self.subscriptions
            .insert(subscription.id.clone(), subscription.clone());
        tracing::debug!(
            subscription_id = %subscription.id,
            tenant = %subscription.tenant,
            criteria = %subscription.criteria_text,
            "Subscription registered"
        );
        subscription
    }

    pub fn remove(&self, id: &str) -> Option<Arc<ActiveSubscription>> {
        let removed = self.subscriptions.remove(id).map(|(_, sub)| sub);
        if removed.is_some() {
            tracing::debug!(subscription_id = id, "Subscription unregistered");
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<Arc<ActiveSubscription>> {
        self.subscriptions.get(id).map(|entry| entry.clone())
    }

    /// Subscriptions whose tenant, type and criteria match the event.
    pub fn matching(
        &self,
        event: &ChangeEvent,
        rows: &[SearchIndexRow],
    ) -> Vec<Arc<ActiveSubscription>> {
        let mut matched: Vec<_> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.matches(event, rows))
            .map(|entry| entry.clone())
            .collect();
        // stable fan-out order keeps per-session ordering independent of shard layout
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        matched
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medrepo_core::{ChangeKind, ShardId};
    use medrepo_search::SearchIndexer;
    use serde_json::json;

    fn sub(id: &str, tenant: &str, criteria: &str) -> ActiveSubscription {
        ActiveSubscription::from_resource(
            tenant,
            &json!({
                "id": id,
                "status": "active",
                "criteria": criteria,
                "channel": {"type": "websocket"}
            }),
        )
        .unwrap()
        .unwrap()
    }

    #[test]
    fn test_registry_upsert_and_remove() {
        let registry = SubscriptionRegistry::new();
        assert!(registry.is_empty());

        let first = registry.upsert(sub("s1", "acme", "Patient"));
        first.next_event_number();
        let replaced = registry.upsert(sub("s1", "acme", "Patient?gender=male"));
        assert_eq!(registry.len(), 1);
        assert_eq!(replaced.events_since_start(), 1);
        assert_eq!(registry.get("s1").unwrap().criteria_text, "Patient?gender=male");

        assert!(registry.remove("s1").is_some());
        assert!(registry.remove("s1").is_none());
        assert!(registry.get("s1").is_none());
    }

    #[test]
    fn test_registry_matching() {
        let registry = SubscriptionRegistry::new();
        registry.upsert(sub("b", "acme", "Patient?gender=male"));
        registry.upsert(sub("a", "acme", "Patient"));
        registry.upsert(sub("c", "acme", "Patient?gender=female"));
        registry.upsert(sub("d", "globex", "Patient"));
        registry.upsert(sub("e", "acme", "Observation"));

        let content = json!({"resourceType": "Patient", "gender": "male"});
        let rows = SearchIndexer::new().index("Patient", "p1", 1, &content);
        let event = ChangeEvent::new(ChangeKind::Created, ShardId::global(), "Patient", "p1", 1)
            .with_tenant(Some("acme".into()))
            .with_resource(Some(content));

        let ids: Vec<_> = registry
            .matching(&event, &rows)
            .iter()
            .map(|s| s.id.clone())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
