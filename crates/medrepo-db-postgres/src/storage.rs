//! PostgreSQL implementation of the storage engine traits.

use std::collections::HashMap;

use async_trait::async_trait;
use medrepo_core::ShardId;
use medrepo_search::{SearchIndexRow, SearchQuery};
use medrepo_storage::{
    EngineTransaction, ShardAssignment, ShardDirectory, StorageEngine, StorageError,
    StorageResult, StoredResource,
};
use sqlx_postgres::PgPool;
use tracing::{info, instrument};

use crate::config::PostgresConfig;
use crate::error::Result;
use crate::pool;
use crate::queries;
use crate::transaction::PostgresTransaction;

/// One provisioned shard: its pool and the schema the pool is pinned to.
#[derive(Debug, Clone)]
pub struct ShardPool {
    pub shard: ShardId,
    pub schema: String,
    pub pool: PgPool,
}

/// PostgreSQL storage engine.
///
/// Each shard is a schema with its own pool; the well-known shards live on
/// the default database and tenant shards wherever their configuration points.
/// The shard directory is the `shard_assignment` table of the global shard.
#[derive(Debug, Clone)]
pub struct PostgresStorage {
    order: Vec<ShardId>,
    shards: HashMap<ShardId, ShardPool>,
}

impl PostgresStorage {
    /// Connects a pool per configured shard.
    ///
    /// Schemas are not created here; the migration runner bootstraps them.
    ///
    /// # Errors
    ///
    /// Returns an error if the shard configuration is invalid or a pool
    /// cannot be created.
    #[instrument(skip(config), fields(shards = config.shards.len() + 3))]
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        let mut pools = Vec::new();
        for (shard, url, schema) in config.resolved_shards()? {
            let pool = pool::create_pool(config, &url, &schema).await?;
            pools.push(ShardPool {
                shard,
                schema,
                pool,
            });
        }
        info!(shards = pools.len(), "PostgreSQL storage connected");
        Ok(Self::from_pools(pools))
    }

    /// Builds the engine from existing pools, in the given order.
    #[must_use]
    pub fn from_pools(pools: Vec<ShardPool>) -> Self {
        let order = pools.iter().map(|p| p.shard.clone()).collect();
        let shards = pools.into_iter().map(|p| (p.shard.clone(), p)).collect();
        Self { order, shards }
    }

    /// Returns the pool of a shard.
    pub fn shard_pool(&self, shard: &ShardId) -> StorageResult<&ShardPool> {
        self.shards.get(shard).ok_or_else(|| {
            StorageError::shard_unavailable(Some(shard.clone()), "shard is not provisioned")
        })
    }

    fn pool(&self, shard: &ShardId) -> StorageResult<&PgPool> {
        Ok(&self.shard_pool(shard)?.pool)
    }

    /// Closes every pool.
    pub async fn close(&self) {
        for pool in self.shards.values() {
            pool.pool.close().await;
        }
    }
}

#[async_trait]
impl StorageEngine for PostgresStorage {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn has_shard(&self, shard: &ShardId) -> bool {
        self.shards.contains_key(shard)
    }

    fn shards(&self) -> Vec<ShardId> {
        self.order.clone()
    }

    async fn begin(&self, shard: &ShardId) -> StorageResult<Box<dyn EngineTransaction>> {
        let tx = self.pool(shard)?.begin().await.map_err(|e| {
            StorageError::transaction_error(format!("Failed to begin transaction: {e}"))
        })?;
        Ok(Box::new(PostgresTransaction::new(shard.clone(), tx)))
    }

    async fn read_current(
        &self,
        shard: &ShardId,
        resource_type: &str,
        id: &str,
    ) -> StorageResult<Option<StoredResource>> {
        let pool = self.pool(shard)?;
        Ok(queries::crud::read_current(pool, resource_type, id).await?)
    }

    async fn read_version(
        &self,
        shard: &ShardId,
        resource_type: &str,
        id: &str,
        version_id: u64,
    ) -> StorageResult<Option<StoredResource>> {
        let pool = self.pool(shard)?;
        Ok(queries::crud::read_version(pool, resource_type, id, version_id).await?)
    }

    async fn history_page(
        &self,
        shard: &ShardId,
        resource_type: &str,
        id: &str,
        after: u64,
        up_to: u64,
        limit: usize,
    ) -> StorageResult<Vec<StoredResource>> {
        let pool = self.pool(shard)?;
        Ok(queries::history::history_page(pool, resource_type, id, after, up_to, limit).await?)
    }

    async fn index_rows(
        &self,
        shard: &ShardId,
        resource_type: &str,
        id: &str,
    ) -> StorageResult<Vec<SearchIndexRow>> {
        let pool = self.pool(shard)?;
        Ok(queries::index::index_rows(pool, resource_type, id).await?)
    }

    async fn search(
        &self,
        shard: &ShardId,
        query: &SearchQuery,
    ) -> StorageResult<Vec<StoredResource>> {
        let pool = self.pool(shard)?;
        Ok(queries::search::search(pool, query).await?)
    }
}

#[async_trait]
impl ShardDirectory for PostgresStorage {
    async fn lookup(&self, tenant_id: &str) -> StorageResult<Option<ShardAssignment>> {
        let pool = self.pool(&ShardId::global())?;
        Ok(queries::directory::lookup(pool, tenant_id).await?)
    }

    async fn upsert(&self, assignment: &ShardAssignment) -> StorageResult<()> {
        let pool = self.pool(&ShardId::global())?;
        Ok(queries::directory::upsert(pool, assignment).await?)
    }

    async fn list(&self) -> StorageResult<Vec<ShardAssignment>> {
        let pool = self.pool(&ShardId::global())?;
        Ok(queries::directory::list(pool).await?)
    }
}
