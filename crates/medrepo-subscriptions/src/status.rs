//! Writes subscription status changes back to the repository.

use std::sync::Arc;

use async_trait::async_trait;
use medrepo_core::TenantContext;
use medrepo_storage::ResourceRepository;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::DispatchResult;
use crate::types::SubscriptionStatus;

const MAX_CONFLICT_RETRIES: usize = 3;

/// Persists a subscription's transition to `error`.
#[async_trait]
pub trait SubscriptionStatusWriter: Send + Sync {
    async fn mark_error(&self, tenant: &str, subscription_id: &str, reason: &str)
    -> DispatchResult<()>;
}

/// Status writer that updates the `Subscription` resource through the
/// repository, so the change is versioned like any other write.
pub struct RepositoryStatusWriter {
    repository: Arc<ResourceRepository>,
}

impl RepositoryStatusWriter {
    pub fn new(repository: Arc<ResourceRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl SubscriptionStatusWriter for RepositoryStatusWriter {
    async fn mark_error(
        &self,
        tenant: &str,
        subscription_id: &str,
        reason: &str,
    ) -> DispatchResult<()> {
        let ctx = TenantContext::tenant(tenant);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self
                .repository
                .read(&ctx, "Subscription", subscription_id)
                .await?;
            if current.content.get("status").and_then(Value::as_str)
                == Some(SubscriptionStatus::Error.as_str())
            {
                debug!(subscription_id, "Subscription already in error");
                return Ok(());
            }

            let mut content = current.content;
            content["status"] = Value::from(SubscriptionStatus::Error.as_str());
            content["error"] = Value::from(reason);

            match self
                .repository
                .update(&ctx, "Subscription", subscription_id, current.version_id, content)
                .await
            {
                Ok(stored) => {
                    warn!(
                        subscription_id,
                        version_id = stored.version_id,
                        reason,
                        "Subscription set to error"
                    );
                    return Ok(());
                }
                Err(e) if e.is_version_conflict() && attempt < MAX_CONFLICT_RETRIES => {
                    debug!(subscription_id, attempt, "Concurrent subscription write; retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
