//! Write transactions for the in-memory engine.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use medrepo_search::SearchIndexRow;
use medrepo_storage::{EngineTransaction, StorageError, StorageResult, StoredResource};
use tokio::sync::OwnedMutexGuard;
use tracing::trace;

use crate::storage::{ShardData, StorageKey, make_storage_key};

/// Buffered writes against one shard.
///
/// Lineage locks are taken in `lock_lineage` and released when the transaction
/// ends. Buffered writes are applied to the shard tables in one step on
/// commit.
pub struct MemoryTransaction {
    data: Arc<ShardData>,
    held: Vec<(StorageKey, OwnedMutexGuard<()>)>,
    versions: Vec<StoredResource>,
    index: BTreeMap<StorageKey, Vec<SearchIndexRow>>,
}

impl MemoryTransaction {
    pub(crate) fn new(data: Arc<ShardData>) -> Self {
        Self {
            data,
            held: Vec::new(),
            versions: Vec::new(),
            index: BTreeMap::new(),
        }
    }

    fn holds(&self, key: &str) -> bool {
        self.held.iter().any(|(k, _)| k == key)
    }

    fn pending_current(&self, key: &str) -> Option<&StoredResource> {
        self.versions
            .iter()
            .rev()
            .find(|v| make_storage_key(&v.resource_type, &v.id) == key)
    }
}

#[async_trait]
impl EngineTransaction for MemoryTransaction {
    async fn lock_lineage(
        &mut self,
        resource_type: &str,
        id: &str,
    ) -> StorageResult<Option<StoredResource>> {
        let key = make_storage_key(resource_type, id);
        if !self.holds(&key) {
            let mutex = self.data.lineage_locks.entry(key.clone()).or_default().clone();
            let guard = mutex.lock_owned().await;
            trace!(lineage = %key, "Lineage locked");
            self.held.push((key.clone(), guard));
        }

        if let Some(pending) = self.pending_current(&key) {
            return Ok(Some(pending.clone()));
        }
        Ok(self.data.tables.read().current(&key).cloned())
    }

    async fn insert_version(&mut self, resource: &StoredResource) -> StorageResult<()> {
        let key = make_storage_key(&resource.resource_type, &resource.id);
        if !self.holds(&key) {
            return Err(StorageError::transaction_error(format!(
                "{key} must be locked before writing"
            )));
        }
        self.versions.push(resource.clone());
        Ok(())
    }

    async fn replace_index_rows(
        &mut self,
        resource_type: &str,
        id: &str,
        rows: &[SearchIndexRow],
    ) -> StorageResult<()> {
        let key = make_storage_key(resource_type, id);
        if !self.holds(&key) {
            return Err(StorageError::transaction_error(format!(
                "{key} must be locked before indexing"
            )));
        }
        self.index.insert(key, rows.to_vec());
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> StorageResult<()> {
        let versions = std::mem::take(&mut self.versions);
        let index = std::mem::take(&mut self.index);
        {
            let mut tables = self.data.tables.write();

            // Validate before mutating so a rejected commit leaves no trace.
            let mut heads: BTreeMap<StorageKey, u64> = BTreeMap::new();
            for version in &versions {
                let key = make_storage_key(&version.resource_type, &version.id);
                let head = match heads.get(&key) {
                    Some(head) => *head,
                    None => tables.current(&key).map_or(0, |c| c.version_id),
                };
                if version.version_id != head + 1 {
                    return Err(StorageError::transaction_error(format!(
                        "{key}: version {} does not follow {head}",
                        version.version_id
                    )));
                }
                heads.insert(key, version.version_id);
            }

            for version in versions {
                let key = make_storage_key(&version.resource_type, &version.id);
                tables.versions.entry(key).or_default().push(version);
            }
            for (key, rows) in index {
                if rows.is_empty() {
                    tables.index.remove(&key);
                } else {
                    tables.index.insert(key, rows);
                }
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StorageResult<()> {
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        for (key, guard) in self.held.drain(..) {
            drop(guard);
            self.data
                .lineage_locks
                .remove_if(&key, |_, mutex| Arc::strong_count(mutex) == 1);
        }
    }
}
