//! Storage traits implemented by every engine backend.
//!
//! The repository, router and migration runner only talk to these traits; the
//! in-memory and PostgreSQL crates provide the implementations.

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use medrepo_core::ShardId;
use medrepo_search::{SearchIndexRow, SearchQuery};

use crate::StorageResult;
use crate::migration::MigrationError;
use crate::types::{AppliedState, ShardAssignment, StoredResource};

/// Per-shard resource storage.
///
/// Implementations must be thread-safe (`Send + Sync`). Every operation is
/// addressed to one shard; an engine that has not provisioned the shard
/// returns `StorageError::ShardUnavailable`.
///
/// # Example
///
/// ```ignore
/// use medrepo_storage::{StorageEngine, StorageError, StoredResource};
///
/// async fn current(engine: &dyn StorageEngine, shard: &ShardId) -> Result<StoredResource, StorageError> {
///     engine
///         .read_current(shard, "Patient", "p1")
///         .await?
///         .ok_or_else(|| StorageError::not_found("Patient", "p1"))
/// }
/// ```
#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Short backend name used in logs (`memory`, `postgres`).
    fn name(&self) -> &'static str;

    /// Returns `true` if the shard is provisioned on this engine.
    fn has_shard(&self, shard: &ShardId) -> bool;

    /// All provisioned shards, well-known shards first.
    fn shards(&self) -> Vec<ShardId>;

    /// Opens a write transaction on a shard.
    async fn begin(&self, shard: &ShardId) -> StorageResult<Box<dyn EngineTransaction>>;

    /// Reads the current version of a lineage, tombstones included.
    ///
    /// Returns `None` if the lineage was never written.
    async fn read_current(
        &self,
        shard: &ShardId,
        resource_type: &str,
        id: &str,
    ) -> StorageResult<Option<StoredResource>>;

    /// Reads one specific version of a lineage.
    async fn read_version(
        &self,
        shard: &ShardId,
        resource_type: &str,
        id: &str,
        version_id: u64,
    ) -> StorageResult<Option<StoredResource>>;

    /// Returns up to `limit` versions with `after < version_id <= up_to`,
    /// oldest first.
    async fn history_page(
        &self,
        shard: &ShardId,
        resource_type: &str,
        id: &str,
        after: u64,
        up_to: u64,
        limit: usize,
    ) -> StorageResult<Vec<StoredResource>>;

    /// Current index rows of a lineage.
    async fn index_rows(
        &self,
        shard: &ShardId,
        resource_type: &str,
        id: &str,
    ) -> StorageResult<Vec<SearchIndexRow>>;

    /// Evaluates a query against the current index and returns the matching
    /// current versions, ordered by id.
    async fn search(
        &self,
        shard: &ShardId,
        query: &SearchQuery,
    ) -> StorageResult<Vec<StoredResource>>;
}

/// A write transaction on one shard.
///
/// Writes are invisible to readers until `commit`. Dropping a transaction
/// without committing discards it.
#[async_trait]
pub trait EngineTransaction: Send {
    /// Locks the lineage for the rest of the transaction and returns its
    /// current version, if any.
    ///
    /// A concurrent transaction locking the same lineage waits until this one
    /// ends.
    async fn lock_lineage(
        &mut self,
        resource_type: &str,
        id: &str,
    ) -> StorageResult<Option<StoredResource>>;

    /// Appends a version and moves the lineage's current pointer to it.
    async fn insert_version(&mut self, resource: &StoredResource) -> StorageResult<()>;

    /// Replaces every index row of the lineage with `rows`.
    async fn replace_index_rows(
        &mut self,
        resource_type: &str,
        id: &str,
        rows: &[SearchIndexRow],
    ) -> StorageResult<()>;

    async fn commit(self: Box<Self>) -> StorageResult<()>;

    async fn rollback(self: Box<Self>) -> StorageResult<()>;
}

/// Tenant to shard assignments, stored on the global shard.
#[async_trait]
pub trait ShardDirectory: Send + Sync {
    async fn lookup(&self, tenant_id: &str) -> StorageResult<Option<ShardAssignment>>;

    /// Inserts or replaces the tenant's assignment.
    async fn upsert(&self, assignment: &ShardAssignment) -> StorageResult<()>;

    async fn list(&self) -> StorageResult<Vec<ShardAssignment>>;
}

/// One forward-only migration step.
pub type StepFn<H> = for<'a> fn(&'a mut H) -> BoxFuture<'a, Result<(), MigrationError>>;

/// Engine side of the migration runner.
#[async_trait]
pub trait MigrationBackend: Send + Sync {
    /// What a step receives to apply its changes (a connection, a schema).
    type Handle: Send;
    type Tx: MigrationTransaction<Handle = Self::Handle>;

    /// Creates the shard's record table if missing. Safe to repeat.
    async fn bootstrap(&self, shard: &ShardId) -> Result<(), MigrationError>;

    /// Opens a transaction holding the shard's migration lock, waiting while
    /// another runner holds it.
    async fn begin(&self, shard: &ShardId) -> Result<Self::Tx, MigrationError>;
}

/// A migration transaction holding the shard's advisory lock.
#[async_trait]
pub trait MigrationTransaction: Send {
    type Handle: Send;

    /// Re-reads the record table.
    async fn applied(&mut self) -> Result<AppliedState, MigrationError>;

    fn handle(&mut self) -> &mut Self::Handle;

    /// Appends a migration record inside this transaction.
    async fn record(&mut self, version: u32, first_boot: bool) -> Result<(), MigrationError>;

    async fn commit(self) -> Result<(), MigrationError>;

    async fn rollback(self) -> Result<(), MigrationError>;
}
