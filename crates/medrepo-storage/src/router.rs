//! Shard routing for tenant-scoped and platform-scoped resources.

use std::sync::Arc;

use medrepo_core::{ResourceScope, ShardId, TenantContext, scope_of};
use tracing::{debug, info, instrument};

use crate::error::StorageError;
use crate::traits::{ShardDirectory, StorageEngine};
use crate::types::{AssignmentState, ShardAssignment};
use crate::StorageResult;

/// Kind of operation being routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

enum Placement {
    Platform,
    Assigned(ShardAssignment),
}

/// Resolves which shard holds a resource.
///
/// Platform-scoped types always live on the global shard. Tenant-scoped types
/// follow the tenant's assignment row; a tenant that is unassigned, or whose
/// shard is not provisioned, is `ShardUnavailable`. Unassigned tenants never
/// fall back to the global shard.
#[derive(Clone)]
pub struct ShardRouter {
    directory: Arc<dyn ShardDirectory>,
    engine: Arc<dyn StorageEngine>,
}

impl ShardRouter {
    pub fn new(directory: Arc<dyn ShardDirectory>, engine: Arc<dyn StorageEngine>) -> Self {
        Self { directory, engine }
    }

    /// Resolves the shard for `(resource_type, id)` under the given context.
    ///
    /// `id` does not influence the result today; all of a tenant's data lives
    /// on one shard. A tenant that is being moved resolves to the provisional
    /// shard; use [`ShardRouter::route`] to learn where its data can be read
    /// or written.
    #[instrument(skip(self), fields(ctx = %ctx))]
    pub async fn resolve_shard(
        &self,
        ctx: &TenantContext,
        resource_type: &str,
        id: Option<&str>,
    ) -> StorageResult<ShardId> {
        let placement = self.placement(ctx, resource_type).await?;
        let shard = match placement {
            Placement::Platform => ShardId::global(),
            Placement::Assigned(assignment) => match assignment.state {
                AssignmentState::Moving => ShardId::provisional(),
                AssignmentState::Active => assignment.shard,
            },
        };
        self.ensure_provisioned(ctx, &shard)?;
        debug!(shard = %shard, "Resolved shard");
        Ok(shard)
    }

    /// Resolves the shard an operation of the given kind runs on.
    ///
    /// While a tenant is moving, its lineages stay on the source shard: reads
    /// are served from there and writes fail with `ShardUnavailable` on the
    /// provisional shard until the move completes. No lineage is ever written
    /// to the provisional shard.
    #[instrument(skip(self), fields(ctx = %ctx))]
    pub async fn route(
        &self,
        ctx: &TenantContext,
        resource_type: &str,
        access: Access,
    ) -> StorageResult<ShardId> {
        let shard = match self.placement(ctx, resource_type).await? {
            Placement::Platform => ShardId::global(),
            Placement::Assigned(assignment) => match (assignment.state, access) {
                (AssignmentState::Active, _) | (AssignmentState::Moving, Access::Read) => {
                    assignment.shard
                }
                (AssignmentState::Moving, Access::Write) => {
                    return Err(StorageError::shard_unavailable(
                        Some(ShardId::provisional()),
                        format!(
                            "tenant {} is moving off shard {}; writes resume when the move completes",
                            assignment.tenant_id, assignment.shard
                        ),
                    ));
                }
            },
        };
        self.ensure_provisioned(ctx, &shard)?;
        debug!(shard = %shard, ?access, "Routed");
        Ok(shard)
    }

    async fn placement(&self, ctx: &TenantContext, resource_type: &str) -> StorageResult<Placement> {
        if scope_of(resource_type)? == ResourceScope::Platform {
            return Ok(Placement::Platform);
        }

        let Some(tenant) = ctx.tenant_id() else {
            return Err(StorageError::shard_unavailable(
                None,
                format!("{resource_type} is tenant-scoped and no tenant was given"),
            ));
        };

        let assignment = self.directory.lookup(tenant).await?.ok_or_else(|| {
            StorageError::shard_unavailable(None, format!("tenant {tenant} has no shard assignment"))
        })?;
        Ok(Placement::Assigned(assignment))
    }

    fn ensure_provisioned(&self, ctx: &TenantContext, shard: &ShardId) -> StorageResult<()> {
        if self.engine.has_shard(shard) {
            return Ok(());
        }
        Err(StorageError::shard_unavailable(
            Some(shard.clone()),
            format!("shard for {ctx} is not provisioned"),
        ))
    }

    /// Assigns (or reassigns) a tenant to a provisioned shard.
    pub async fn assign_tenant(
        &self,
        tenant_id: &str,
        shard: ShardId,
    ) -> StorageResult<ShardAssignment> {
        if !self.engine.has_shard(&shard) {
            return Err(StorageError::shard_unavailable(
                Some(shard),
                "cannot assign a tenant to an unprovisioned shard",
            ));
        }
        let assignment = ShardAssignment::active(tenant_id, shard);
        self.directory.upsert(&assignment).await?;
        info!(tenant = tenant_id, shard = %assignment.shard, "Tenant assigned to shard");
        Ok(assignment)
    }

    /// Marks a tenant as moving.
    ///
    /// Until `complete_move`, the tenant's lineages are readable on the source
    /// shard and writes are refused, so the data can be copied to the target
    /// shard without losing versions.
    pub async fn begin_move(&self, tenant_id: &str) -> StorageResult<ShardAssignment> {
        let current = self
            .directory
            .lookup(tenant_id)
            .await?
            .ok_or_else(|| StorageError::not_found("ShardAssignment", tenant_id))?;
        let moving = current.with_state(AssignmentState::Moving);
        self.directory.upsert(&moving).await?;
        info!(tenant = tenant_id, from = %moving.shard, "Tenant move started");
        Ok(moving)
    }

    /// Ends a move by assigning the tenant to `target`; writes resume there.
    ///
    /// The tenant's lineages must already be present on `target` when it
    /// differs from the source shard.
    pub async fn complete_move(
        &self,
        tenant_id: &str,
        target: ShardId,
    ) -> StorageResult<ShardAssignment> {
        match self.directory.lookup(tenant_id).await? {
            Some(a) if a.state == AssignmentState::Moving => {}
            Some(_) => {
                return Err(StorageError::validation(format!(
                    "tenant {tenant_id} is not being moved"
                )));
            }
            None => return Err(StorageError::not_found("ShardAssignment", tenant_id)),
        }
        self.assign_tenant(tenant_id, target).await
    }

    pub async fn list_assignments(&self) -> StorageResult<Vec<ShardAssignment>> {
        self.directory.list().await
    }
}

impl std::fmt::Debug for ShardRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardRouter")
            .field("engine", &self.engine.name())
            .finish()
    }
}
