use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use medrepo_core::ShardId;
use medrepo_search::{SearchIndexRow, SearchQuery};
use medrepo_storage::{
    EngineTransaction, MigrationRecord, ShardAssignment, ShardDirectory, StorageEngine,
    StorageError, StorageResult, StoredResource,
};
use papaya::HashMap as PapayaHashMap;
use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::sync::Mutex;

use crate::schema::MemorySchema;
use crate::transaction::MemoryTransaction;

pub type StorageKey = String; // Format: "ResourceType/id"

pub(crate) fn make_storage_key(resource_type: &str, id: &str) -> StorageKey {
    format!("{resource_type}/{id}")
}

/// Committed state of one shard.
///
/// `versions` holds every version of every lineage in ascending order; the
/// last entry is the current version.
#[derive(Debug, Clone, Default)]
pub(crate) struct ShardTables {
    pub(crate) versions: BTreeMap<StorageKey, Vec<StoredResource>>,
    pub(crate) index: BTreeMap<StorageKey, Vec<SearchIndexRow>>,
}

impl ShardTables {
    pub(crate) fn current(&self, key: &str) -> Option<&StoredResource> {
        self.versions.get(key).and_then(|v| v.last())
    }
}

/// Everything the engine keeps for one provisioned shard.
#[derive(Debug, Default)]
pub(crate) struct ShardData {
    pub(crate) tables: RwLock<ShardTables>,
    /// Per-lineage row locks, held by write transactions.
    pub(crate) lineage_locks: DashMap<StorageKey, Arc<Mutex<()>>>,
    /// Stand-in for the shard's advisory migration lock.
    pub(crate) migration_lock: Arc<Mutex<()>>,
    pub(crate) schema: SyncMutex<Option<MemorySchema>>,
    pub(crate) records: RwLock<Vec<MigrationRecord>>,
    /// Tenant assignments; only populated on the global shard.
    pub(crate) assignments: RwLock<BTreeMap<String, ShardAssignment>>,
}

/// In-memory storage engine.
///
/// This engine provides:
/// - Per-shard tables behind a `parking_lot` lock, swapped atomically on commit
/// - Lineage locks that serialize writers of one lineage across transactions
/// - An async migration lock per shard, standing in for an advisory lock
/// - The shard directory, kept on the global shard
///
/// The `global`, `placeholder` and `provisional` shards are always provisioned.
#[derive(Debug)]
pub struct InMemoryStorage {
    pub(crate) shards: PapayaHashMap<ShardId, Arc<ShardData>>,
}

impl InMemoryStorage {
    /// Creates an engine with only the well-known shards.
    pub fn new() -> Self {
        let storage = Self {
            shards: PapayaHashMap::new(),
        };
        for shard in [
            ShardId::global(),
            ShardId::placeholder(),
            ShardId::provisional(),
        ] {
            storage.provision(shard);
        }
        storage
    }

    /// Creates an engine with the well-known shards plus `shards`.
    pub fn with_shards(shards: impl IntoIterator<Item = ShardId>) -> Self {
        let storage = Self::new();
        for shard in shards {
            storage.provision(shard);
        }
        storage
    }

    /// Provisions an empty shard. Returns `false` if it already existed.
    pub fn provision(&self, shard: ShardId) -> bool {
        let guard = self.shards.pin();
        if guard.contains_key(&shard) {
            return false;
        }
        guard.insert(shard, Arc::new(ShardData::default()));
        true
    }

    pub(crate) fn shard(&self, shard: &ShardId) -> StorageResult<Arc<ShardData>> {
        self.shards.pin().get(shard).cloned().ok_or_else(|| {
            StorageError::shard_unavailable(Some(shard.clone()), "shard is not provisioned")
        })
    }

    /// Migration records of a shard, oldest first.
    pub fn migration_records(&self, shard: &ShardId) -> StorageResult<Vec<MigrationRecord>> {
        let data = self.shard(shard)?;
        let mut records = data.records.read().clone();
        records.sort_by_key(|r| r.version);
        Ok(records)
    }

    /// Current schema of a shard, `None` before bootstrap.
    pub fn schema(&self, shard: &ShardId) -> StorageResult<Option<MemorySchema>> {
        Ok(self.shard(shard)?.schema.lock().clone())
    }

    /// Number of lineages (live or tombstoned) on a shard.
    pub fn lineage_count(&self, shard: &ShardId) -> StorageResult<usize> {
        Ok(self.shard(shard)?.tables.read().versions.len())
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageEngine for InMemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn has_shard(&self, shard: &ShardId) -> bool {
        self.shards.pin().contains_key(shard)
    }

    fn shards(&self) -> Vec<ShardId> {
        let mut all: Vec<ShardId> = self.shards.pin().keys().cloned().collect();
        all.sort_by(|a, b| {
            b.is_well_known()
                .cmp(&a.is_well_known())
                .then_with(|| a.as_str().cmp(b.as_str()))
        });
        all
    }

    async fn begin(&self, shard: &ShardId) -> StorageResult<Box<dyn EngineTransaction>> {
        let data = self.shard(shard)?;
        Ok(Box::new(MemoryTransaction::new(data)))
    }

    async fn read_current(
        &self,
        shard: &ShardId,
        resource_type: &str,
        id: &str,
    ) -> StorageResult<Option<StoredResource>> {
        let data = self.shard(shard)?;
        let tables = data.tables.read();
        Ok(tables
            .current(&make_storage_key(resource_type, id))
            .cloned())
    }

    async fn read_version(
        &self,
        shard: &ShardId,
        resource_type: &str,
        id: &str,
        version_id: u64,
    ) -> StorageResult<Option<StoredResource>> {
        let data = self.shard(shard)?;
        let tables = data.tables.read();
        Ok(tables
            .versions
            .get(&make_storage_key(resource_type, id))
            .and_then(|versions| versions.iter().find(|v| v.version_id == version_id))
            .cloned())
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
        let data = self.shard(shard)?;
        let tables = data.tables.read();
        let Some(versions) = tables.versions.get(&make_storage_key(resource_type, id)) else {
            return Ok(Vec::new());
        };
        Ok(versions
            .iter()
            .filter(|v| v.version_id > after && v.version_id <= up_to)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn index_rows(
        &self,
        shard: &ShardId,
        resource_type: &str,
        id: &str,
    ) -> StorageResult<Vec<SearchIndexRow>> {
        let data = self.shard(shard)?;
        let tables = data.tables.read();
        Ok(tables
            .index
            .get(&make_storage_key(resource_type, id))
            .cloned()
            .unwrap_or_default())
    }

    async fn search(
        &self,
        shard: &ShardId,
        query: &SearchQuery,
    ) -> StorageResult<Vec<StoredResource>> {
        let data = self.shard(shard)?;
        let tables = data.tables.read();
        let prefix = format!("{}/", query.resource_type);

        let mut found = Vec::new();
        for (key, versions) in tables.versions.range(prefix.clone()..) {
            if !key.starts_with(&prefix) {
                break;
            }
            let Some(current) = versions.last() else {
                continue;
            };
            if current.deleted {
                continue;
            }
            let rows = tables.index.get(key).map(Vec::as_slice).unwrap_or(&[]);
            if query.matches(&current.id, rows) {
                found.push(current.clone());
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl ShardDirectory for InMemoryStorage {
    async fn lookup(&self, tenant_id: &str) -> StorageResult<Option<ShardAssignment>> {
        let global = self.shard(&ShardId::global())?;
        let assignments = global.assignments.read();
        Ok(assignments.get(tenant_id).cloned())
    }

    async fn upsert(&self, assignment: &ShardAssignment) -> StorageResult<()> {
        let global = self.shard(&ShardId::global())?;
        global
            .assignments
            .write()
            .insert(assignment.tenant_id.clone(), assignment.clone());
        Ok(())
    }

    async fn list(&self) -> StorageResult<Vec<ShardAssignment>> {
        let global = self.shard(&ShardId::global())?;
        let assignments = global.assignments.read();
        Ok(assignments.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::OffsetDateTime;

    fn shard_a() -> ShardId {
        ShardId::new("shard-a").unwrap()
    }

    #[test]
    fn test_well_known_shards_provisioned() {
        let storage = InMemoryStorage::with_shards([shard_a()]);
        assert!(storage.has_shard(&ShardId::global()));
        assert!(storage.has_shard(&ShardId::placeholder()));
        assert!(storage.has_shard(&ShardId::provisional()));
        assert!(storage.has_shard(&shard_a()));
        assert!(!storage.has_shard(&ShardId::new("shard-b").unwrap()));

        let shards = storage.shards();
        assert_eq!(shards.last(), Some(&shard_a()));
        assert!(!storage.provision(shard_a()));
    }

    #[tokio::test]
    async fn test_unprovisioned_shard_is_unavailable() {
        let storage = InMemoryStorage::new();
        let err = storage
            .read_current(&shard_a(), "Patient", "p1")
            .await
            .unwrap_err();
        assert!(err.is_shard_unavailable());
    }

    #[tokio::test]
    async fn test_commit_makes_writes_visible() {
        let storage = InMemoryStorage::new();
        let shard = ShardId::global();
        let now = OffsetDateTime::now_utc();

        let mut tx = storage.begin(&shard).await.unwrap();
        assert!(tx.lock_lineage("Project", "p1").await.unwrap().is_none());
        let v1 = StoredResource::live("Project", "p1", 1, now, json!({"name": "x"}));
        tx.insert_version(&v1).await.unwrap();

        assert!(storage.read_current(&shard, "Project", "p1").await.unwrap().is_none());
        tx.commit().await.unwrap();

        let current = storage.read_current(&shard, "Project", "p1").await.unwrap();
        assert_eq!(current.map(|c| c.version_id), Some(1));
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let storage = InMemoryStorage::new();
        let shard = ShardId::global();

        let mut tx = storage.begin(&shard).await.unwrap();
        tx.lock_lineage("Project", "p1").await.unwrap();
        let v1 = StoredResource::live("Project", "p1", 1, OffsetDateTime::now_utc(), json!({}));
        tx.insert_version(&v1).await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(storage.lineage_count(&shard).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_directory_roundtrip() {
        let storage = InMemoryStorage::with_shards([shard_a()]);
        assert!(storage.lookup("acme").await.unwrap().is_none());

        storage
            .upsert(&ShardAssignment::active("acme", shard_a()))
            .await
            .unwrap();
        let found = storage.lookup("acme").await.unwrap().unwrap();
        assert_eq!(found.shard, shard_a());
        assert_eq!(storage.list().await.unwrap().len(), 1);
    }
}
