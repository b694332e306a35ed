//! Schema bookkeeping and migration steps for the in-memory engine.
//!
//! The in-memory engine has no real DDL, but it tracks a table/column catalog
//! per shard so migration steps behave like their PostgreSQL counterparts:
//! they check for the target state before mutating and can fail.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use medrepo_core::ShardId;
use medrepo_search::SearchIndexer;
use medrepo_storage::{
    AppliedState, MigrationBackend, MigrationError, MigrationRecord, MigrationStep,
    MigrationTransaction, StepKind,
};
use time::OffsetDateTime;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use crate::storage::{InMemoryStorage, ShardData, ShardTables};

pub const RECORD_TABLE: &str = "migration_record";

/// Table and column catalog of one shard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemorySchema {
    tables: BTreeMap<String, BTreeSet<String>>,
}

impl MemorySchema {
    /// Creates the table if missing; existing tables are left untouched.
    pub fn create_table(&mut self, table: &str, columns: &[&str]) {
        self.tables
            .entry(table.to_string())
            .or_insert_with(|| columns.iter().map(|c| c.to_string()).collect());
    }

    /// Adds a column if missing. Fails if the table does not exist.
    pub fn add_column(&mut self, table: &str, column: &str) -> Result<(), String> {
        let columns = self
            .tables
            .get_mut(table)
            .ok_or_else(|| format!("relation \"{table}\" does not exist"))?;
        columns.insert(column.to_string());
        Ok(())
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.tables
            .get(table)
            .is_some_and(|columns| columns.contains(column))
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }
}

/// What a migration step receives: the shard's schema and, on demand, a
/// working copy of its tables.
pub struct MemoryShardHandle {
    schema: MemorySchema,
    data: Arc<ShardData>,
    tables: Option<ShardTables>,
}

impl MemoryShardHandle {
    pub fn schema(&mut self) -> &mut MemorySchema {
        &mut self.schema
    }

    /// Rebuilds the index rows of every live lineage from its current version.
    /// Returns the number of lineages indexed.
    pub fn reindex(&mut self, indexer: &SearchIndexer) -> usize {
        let data = &self.data;
        let tables = self.tables.get_or_insert_with(|| data.tables.read().clone());

        let mut rebuilt = BTreeMap::new();
        for (key, versions) in &tables.versions {
            let Some(current) = versions.last().filter(|c| !c.deleted) else {
                continue;
            };
            let rows = indexer.index(
                &current.resource_type,
                &current.id,
                current.version_id,
                &current.content,
            );
            if !rows.is_empty() {
                rebuilt.insert(key.clone(), rows);
            }
        }
        let count = rebuilt.len();
        tables.index = rebuilt;
        count
    }
}

/// Migration backend over an [`InMemoryStorage`].
#[derive(Clone)]
pub struct MemoryMigrations {
    storage: Arc<InMemoryStorage>,
}

impl MemoryMigrations {
    pub fn new(storage: Arc<InMemoryStorage>) -> Self {
        Self { storage }
    }

    fn shard(&self, shard: &ShardId) -> Result<Arc<ShardData>, MigrationError> {
        self.storage.shard(shard).map_err(MigrationError::backend)
    }
}

#[async_trait]
impl MigrationBackend for MemoryMigrations {
    type Handle = MemoryShardHandle;
    type Tx = MemoryMigrationTransaction;

    async fn bootstrap(&self, shard: &ShardId) -> Result<(), MigrationError> {
        let data = self.shard(shard)?;
        let mut schema = data.schema.lock();
        schema
            .get_or_insert_with(MemorySchema::default)
            .create_table(RECORD_TABLE, &["shard_id", "version", "applied_at", "first_boot"]);
        Ok(())
    }

    async fn begin(&self, shard: &ShardId) -> Result<Self::Tx, MigrationError> {
        let data = self.shard(shard)?;
        let lock = data.migration_lock.clone().lock_owned().await;
        debug!(shard = %shard, "Migration lock acquired");
        let schema = data.schema.lock().clone().unwrap_or_default();
        Ok(MemoryMigrationTransaction {
            shard: shard.clone(),
            handle: MemoryShardHandle {
                schema,
                data: data.clone(),
                tables: None,
            },
            records: Vec::new(),
            data,
            _lock: lock,
        })
    }
}

/// One migration step's transaction; holds the shard's migration lock.
pub struct MemoryMigrationTransaction {
    shard: ShardId,
    data: Arc<ShardData>,
    handle: MemoryShardHandle,
    records: Vec<MigrationRecord>,
    _lock: OwnedMutexGuard<()>,
}

#[async_trait]
impl MigrationTransaction for MemoryMigrationTransaction {
    type Handle = MemoryShardHandle;

    async fn applied(&mut self) -> Result<AppliedState, MigrationError> {
        let mut all = self.data.records.read().clone();
        all.extend(self.records.iter().cloned());
        Ok(AppliedState::from_records(&all))
    }

    fn handle(&mut self) -> &mut Self::Handle {
        &mut self.handle
    }

    async fn record(&mut self, version: u32, first_boot: bool) -> Result<(), MigrationError> {
        let exists = self.data.records.read().iter().any(|r| r.version == version)
            || self.records.iter().any(|r| r.version == version);
        if exists {
            return Err(MigrationError::backend(format!(
                "duplicate key value violates unique constraint: ({}, {version})",
                self.shard
            )));
        }
        self.records.push(MigrationRecord {
            shard: self.shard.clone(),
            version,
            applied_at: OffsetDateTime::now_utc(),
            first_boot,
        });
        Ok(())
    }

    async fn commit(self) -> Result<(), MigrationError> {
        let Self {
            data,
            handle,
            records,
            ..
        } = self;
        *data.schema.lock() = Some(handle.schema);
        if let Some(tables) = handle.tables {
            *data.tables.write() = tables;
        }
        data.records.write().extend(records);
        Ok(())
    }

    async fn rollback(self) -> Result<(), MigrationError> {
        Ok(())
    }
}

fn create_resource_tables(handle: &mut MemoryShardHandle) -> BoxFuture<'_, Result<(), MigrationError>> {
    Box::pin(async move {
        let schema = handle.schema();
        schema.create_table(
            "resource_version",
            &["resource_type", "id", "version_id", "last_updated", "deleted", "content"],
        );
        schema.create_table("resource_current", &["resource_type", "id", "version_id"]);
        schema.create_table("shard_assignment", &["tenant_id", "shard_id", "state", "updated_at"]);
        Ok(())
    })
}

fn create_search_index(handle: &mut MemoryShardHandle) -> BoxFuture<'_, Result<(), MigrationError>> {
    Box::pin(async move {
        handle.schema().create_table(
            "search_index",
            &["resource_type", "resource_id", "version_id", "param", "kind", "value"],
        );
        Ok(())
    })
}

fn add_current_last_updated(
    handle: &mut MemoryShardHandle,
) -> BoxFuture<'_, Result<(), MigrationError>> {
    Box::pin(async move {
        handle
            .schema()
            .add_column("resource_current", "last_updated")
            .map_err(|e| MigrationError::step(3, "add_current_last_updated", e))
    })
}

fn reindex_current_versions(
    handle: &mut MemoryShardHandle,
) -> BoxFuture<'_, Result<(), MigrationError>> {
    Box::pin(async move {
        let count = handle.reindex(&SearchIndexer::new());
        debug!(lineages = count, "Reindexed current versions");
        Ok(())
    })
}

/// The in-memory engine's migration table.
pub static MEMORY_STEPS: &[MigrationStep<MemoryShardHandle>] = &[
    MigrationStep {
        version: 1,
        name: "create_resource_tables",
        kind: StepKind::Schema,
        run: create_resource_tables,
    },
    MigrationStep {
        version: 2,
        name: "create_search_index",
        kind: StepKind::Schema,
        run: create_search_index,
    },
    MigrationStep {
        version: 3,
        name: "add_current_last_updated",
        kind: StepKind::Schema,
        run: add_current_last_updated,
    },
    MigrationStep {
        version: 4,
        name: "reindex_current_versions",
        kind: StepKind::Data,
        run: reindex_current_versions,
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_changes_are_idempotent() {
        let mut schema = MemorySchema::default();
        schema.create_table("t", &["a"]);
        schema.add_column("t", "b").unwrap();
        schema.create_table("t", &["z"]);
        assert!(schema.has_column("t", "a"));
        assert!(schema.has_column("t", "b"));
        assert!(!schema.has_column("t", "z"));
        schema.add_column("t", "b").unwrap();
    }

    #[test]
    fn test_add_column_requires_table() {
        let mut schema = MemorySchema::default();
        let err = schema.add_column("missing", "c").unwrap_err();
        assert!(err.contains("does not exist"));
    }

    #[test]
    fn test_step_table_is_contiguous() {
        for (idx, step) in MEMORY_STEPS.iter().enumerate() {
            assert_eq!(step.version as usize, idx + 1);
        }
        assert_eq!(MEMORY_STEPS.last().map(|s| s.kind), Some(StepKind::Data));
    }
}
