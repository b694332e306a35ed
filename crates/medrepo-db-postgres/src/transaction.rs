//! PostgreSQL write transaction.
//!
//! Wraps one sqlx transaction on a shard pool. Lineage locks taken through
//! [`EngineTransaction::lock_lineage`] are transaction-scoped and released on
//! commit, rollback or drop.

use async_trait::async_trait;
use medrepo_core::ShardId;
use medrepo_search::SearchIndexRow;
use medrepo_storage::{EngineTransaction, StorageError, StorageResult, StoredResource};
use sqlx_postgres::PgTransaction;
use tracing::debug;

use crate::queries;

/// PostgreSQL transaction wrapper bound to one shard.
///
/// The transaction automatically rolls back on drop if not explicitly
/// committed.
pub struct PostgresTransaction {
    shard: ShardId,
    tx: PgTransaction<'static>,
}

impl PostgresTransaction {
    pub fn new(shard: ShardId, tx: PgTransaction<'static>) -> Self {
        Self { shard, tx }
    }
}

#[async_trait]
impl EngineTransaction for PostgresTransaction {
    async fn lock_lineage(
        &mut self,
        resource_type: &str,
        id: &str,
    ) -> StorageResult<Option<StoredResource>> {
        let current =
            queries::crud::lock_current(&mut self.tx, self.shard.as_str(), resource_type, id)
                .await?;
        Ok(current)
    }

    async fn insert_version(&mut self, resource: &StoredResource) -> StorageResult<()> {
        queries::crud::insert_version(&mut self.tx, resource).await?;
        Ok(())
    }

    async fn replace_index_rows(
        &mut self,
        resource_type: &str,
        id: &str,
        rows: &[SearchIndexRow],
    ) -> StorageResult<()> {
        queries::index::replace_index_rows(&mut self.tx, resource_type, id, rows).await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StorageResult<()> {
        let Self { shard, tx } = *self;
        tx.commit().await.map_err(|e| {
            StorageError::transaction_error(format!("Failed to commit transaction: {e}"))
        })?;
        debug!(shard = %shard, "Transaction committed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StorageResult<()> {
        let Self { shard, tx } = *self;
        tx.rollback().await.map_err(|e| {
            StorageError::transaction_error(format!("Failed to rollback transaction: {e}"))
        })?;
        debug!(shard = %shard, "Transaction rolled back");
        Ok(())
    }
}
