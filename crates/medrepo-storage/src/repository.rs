//! Versioned resource repository.
//!
//! Every mutation runs in one engine transaction: the lineage row is locked,
//! the expected version checked, the new version appended and the lineage's
//! index rows replaced. The change event is published only after commit.
//!
//! Writers of the same lineage inside this process are additionally queued on
//! a per-lineage gate that is held until the event has been published, so
//! events for one lineage leave the repository in version order.

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use medrepo_core::{
    ChangeEvent, ChangeKind, ShardId, TenantContext, generate_id, validate_id, validate_shape,
};
use medrepo_search::{SearchIndexRow, SearchIndexer, SearchQuery};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, instrument, warn};

use crate::StorageResult;
use crate::error::StorageError;
use crate::evented::EventPublisher;
use crate::migration::ShardStatusBoard;
use crate::router::{Access, ShardRouter};
use crate::traits::{EngineTransaction, ShardDirectory, StorageEngine};
use crate::types::StoredResource;

const DEFAULT_HISTORY_PAGE_SIZE: usize = 50;

/// The versioned resource store.
pub struct ResourceRepository {
    engine: Arc<dyn StorageEngine>,
    router: ShardRouter,
    board: Arc<ShardStatusBoard>,
    indexer: SearchIndexer,
    publisher: EventPublisher,
    required_version: u32,
    history_page_size: usize,
    gates: DashMap<String, Arc<Mutex<()>>>,
}

impl ResourceRepository {
    pub fn new(
        engine: Arc<dyn StorageEngine>,
        directory: Arc<dyn ShardDirectory>,
        board: Arc<ShardStatusBoard>,
    ) -> Self {
        Self {
            router: ShardRouter::new(directory, engine.clone()),
            engine,
            board,
            indexer: SearchIndexer::new(),
            publisher: EventPublisher::new(),
            required_version: 1,
            history_page_size: DEFAULT_HISTORY_PAGE_SIZE,
            gates: DashMap::new(),
        }
    }

    /// Schema version a shard must have reached before it serves traffic.
    pub fn with_required_version(mut self, version: u32) -> Self {
        self.required_version = version;
        self
    }

    pub fn with_publisher(mut self, publisher: EventPublisher) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn with_history_page_size(mut self, size: usize) -> Self {
        self.history_page_size = size.max(1);
        self
    }

    pub fn router(&self) -> &ShardRouter {
        &self.router
    }

    pub fn board(&self) -> &Arc<ShardStatusBoard> {
        &self.board
    }

    pub fn engine(&self) -> &Arc<dyn StorageEngine> {
        &self.engine
    }

    /// Creates a new lineage at version 1 with a generated id.
    #[instrument(skip(self, content), fields(ctx = %ctx))]
    pub async fn create(
        &self,
        ctx: &TenantContext,
        resource_type: &str,
        content: Value,
    ) -> StorageResult<StoredResource> {
        validate_shape(resource_type, &content)?;
        let shard = self.route(ctx, resource_type, Access::Write).await?;
        let id = generate_id();

        let _gate = self.gate(&shard, resource_type, &id).await;
        let mut tx = self.engine.begin(&shard).await?;
        match tx.lock_lineage(resource_type, &id).await {
            Ok(None) => {}
            Ok(Some(_)) => {
                return abort(tx, StorageError::internal(format!(
                    "generated id collided with {resource_type}/{id}"
                )))
                .await;
            }
            Err(e) => return abort(tx, e).await,
        }

        let stored = StoredResource::live(resource_type, &id, 1, now(), content);
        let rows = self.indexer.index(resource_type, &id, 1, &stored.content);
        persist(tx, &stored, &rows).await?;

        debug!(id = %id, version_id = 1, rows = rows.len(), "Resource created");
        self.emit(ctx, &shard, ChangeKind::Created, &stored, Some(stored.content.clone()));
        Ok(stored)
    }

    /// Writes version `expected_version_id + 1` if the lineage is still at
    /// `expected_version_id`.
    #[instrument(skip(self, content), fields(ctx = %ctx))]
    pub async fn update(
        &self,
        ctx: &TenantContext,
        resource_type: &str,
        id: &str,
        expected_version_id: u64,
        content: Value,
    ) -> StorageResult<StoredResource> {
        validate_id(id)?;
        validate_shape(resource_type, &content)?;
        if let Some(body_id) = content.get("id").and_then(Value::as_str)
            && body_id != id
        {
            return Err(StorageError::validation(format!(
                "resource id '{body_id}' does not match '{id}'"
            )));
        }
        let shard = self.route(ctx, resource_type, Access::Write).await?;

        let _gate = self.gate(&shard, resource_type, id).await;
        let mut tx = self.engine.begin(&shard).await?;
        let current = match tx.lock_lineage(resource_type, id).await {
            Ok(Some(current)) => current,
            Ok(None) => return abort(tx, StorageError::not_found(resource_type, id)).await,
            Err(e) => return abort(tx, e).await,
        };
        if current.deleted {
            return abort(tx, StorageError::gone(resource_type, id)).await;
        }
        if current.version_id != expected_version_id {
            return abort(
                tx,
                StorageError::version_conflict(
                    resource_type,
                    id,
                    expected_version_id,
                    current.version_id,
                ),
            )
            .await;
        }

        let version_id = current.version_id + 1;
        let stored = StoredResource::live(resource_type, id, version_id, now(), content);
        let rows = self.indexer.index(resource_type, id, version_id, &stored.content);
        persist(tx, &stored, &rows).await?;

        debug!(version_id, rows = rows.len(), "Resource updated");
        self.emit(ctx, &shard, ChangeKind::Updated, &stored, Some(stored.content.clone()));
        Ok(stored)
    }

    /// Appends a tombstone version and drops the lineage's index rows.
    #[instrument(skip(self), fields(ctx = %ctx))]
    pub async fn delete(
        &self,
        ctx: &TenantContext,
        resource_type: &str,
        id: &str,
    ) -> StorageResult<StoredResource> {
        validate_id(id)?;
        let shard = self.route(ctx, resource_type, Access::Write).await?;

        let _gate = self.gate(&shard, resource_type, id).await;
        let mut tx = self.engine.begin(&shard).await?;
        let current = match tx.lock_lineage(resource_type, id).await {
            Ok(Some(current)) => current,
            Ok(None) => return abort(tx, StorageError::not_found(resource_type, id)).await,
            Err(e) => return abort(tx, e).await,
        };
        if current.deleted {
            return abort(tx, StorageError::gone(resource_type, id)).await;
        }

        let tombstone =
            StoredResource::tombstone(resource_type, id, current.version_id + 1, now());
        persist(tx, &tombstone, &[]).await?;

        debug!(version_id = tombstone.version_id, "Resource deleted");
        self.emit(ctx, &shard, ChangeKind::Deleted, &tombstone, Some(current.content));
        Ok(tombstone)
    }

    /// Reads the current version of a live lineage.
    pub async fn read(
        &self,
        ctx: &TenantContext,
        resource_type: &str,
        id: &str,
    ) -> StorageResult<StoredResource> {
        validate_id(id)?;
        let shard = self.route(ctx, resource_type, Access::Read).await?;
        match self.engine.read_current(&shard, resource_type, id).await? {
            Some(current) if current.deleted => Err(StorageError::gone(resource_type, id)),
            Some(current) => Ok(current),
            None => Err(StorageError::not_found(resource_type, id)),
        }
    }

    /// Reads any version of a lineage, tombstones included.
    pub async fn read_version(
        &self,
        ctx: &TenantContext,
        resource_type: &str,
        id: &str,
        version_id: u64,
    ) -> StorageResult<StoredResource> {
        validate_id(id)?;
        let shard = self.route(ctx, resource_type, Access::Read).await?;
        self.engine
            .read_version(&shard, resource_type, id, version_id)
            .await?
            .ok_or_else(|| {
                StorageError::not_found(resource_type, format!("{id}/_history/{version_id}"))
            })
    }

    /// Returns the lineage's history as of now.
    ///
    /// Versions written after this call are not part of the returned
    /// [`History`].
    pub async fn history(
        &self,
        ctx: &TenantContext,
        resource_type: &str,
        id: &str,
    ) -> StorageResult<History> {
        validate_id(id)?;
        let shard = self.route(ctx, resource_type, Access::Read).await?;
        let current = self
            .engine
            .read_current(&shard, resource_type, id)
            .await?
            .ok_or_else(|| StorageError::not_found(resource_type, id))?;
        Ok(History {
            engine: self.engine.clone(),
            shard,
            resource_type: resource_type.to_string(),
            id: id.to_string(),
            up_to: current.version_id,
            page_size: self.history_page_size,
        })
    }

    /// Current versions matching the query, within the caller's shard.
    pub async fn search(
        &self,
        ctx: &TenantContext,
        query: &SearchQuery,
    ) -> StorageResult<Vec<StoredResource>> {
        let shard = self.route(ctx, &query.resource_type, Access::Read).await?;
        let mut found = self.engine.search(&shard, query).await?;
        if let Some(count) = query.count {
            found.truncate(count);
        }
        Ok(found)
    }

    /// Current index rows of a lineage.
    pub async fn index_rows(
        &self,
        ctx: &TenantContext,
        resource_type: &str,
        id: &str,
    ) -> StorageResult<Vec<SearchIndexRow>> {
        validate_id(id)?;
        let shard = self.route(ctx, resource_type, Access::Read).await?;
        self.engine.index_rows(&shard, resource_type, id).await
    }

    async fn route(
        &self,
        ctx: &TenantContext,
        resource_type: &str,
        access: Access,
    ) -> StorageResult<ShardId> {
        let shard = self.router.route(ctx, resource_type, access).await?;
        self.board.ensure_ready(&shard, self.required_version)?;
        Ok(shard)
    }

    async fn gate(&self, shard: &ShardId, resource_type: &str, id: &str) -> LineageGate<'_> {
        let key = format!("{shard}/{resource_type}/{id}");
        let mutex = self.gates.entry(key.clone()).or_default().clone();
        let guard = mutex.lock_owned().await;
        LineageGate {
            gates: &self.gates,
            key,
            guard: Some(guard),
        }
    }

    fn emit(
        &self,
        ctx: &TenantContext,
        shard: &ShardId,
        kind: ChangeKind,
        stored: &StoredResource,
        resource: Option<Value>,
    ) {
        let event = ChangeEvent::new(
            kind,
            shard.clone(),
            &stored.resource_type,
            &stored.id,
            stored.version_id,
        )
        .with_tenant(ctx.tenant_id().map(str::to_string))
        .with_resource(resource);
        self.publisher.publish(&event);
    }
}

impl std::fmt::Debug for ResourceRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRepository")
            .field("engine", &self.engine.name())
            .field("required_version", &self.required_version)
            .field("publisher", &self.publisher)
            .finish()
    }
}

/// Held for the duration of one lineage write; removes its map entry when
/// nobody else is waiting.
struct LineageGate<'a> {
    gates: &'a DashMap<String, Arc<Mutex<()>>>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for LineageGate<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.gates
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Snapshot of a lineage's versions, read lazily in pages.
#[derive(Clone)]
pub struct History {
    engine: Arc<dyn StorageEngine>,
    shard: ShardId,
    resource_type: String,
    id: String,
    up_to: u64,
    page_size: usize,
}

impl History {
    /// Version that was current when the history was taken.
    pub fn latest_version(&self) -> u64 {
        self.up_to
    }

    pub fn shard(&self) -> &ShardId {
        &self.shard
    }

    /// Streams versions oldest first. Each call starts from version 1.
    pub fn stream(&self) -> BoxStream<'_, StorageResult<StoredResource>> {
        let pages = stream::try_unfold(0u64, move |after| async move {
            if after >= self.up_to {
                return Ok(None);
            }
            let page = self
                .engine
                .history_page(
                    &self.shard,
                    &self.resource_type,
                    &self.id,
                    after,
                    self.up_to,
                    self.page_size,
                )
                .await?;
            let Some(next) = page.last().map(|v| v.version_id) else {
                return Ok(None);
            };
            Ok::<_, StorageError>(Some((page, next)))
        });
        pages
            .map_ok(|page| stream::iter(page.into_iter().map(Ok)))
            .try_flatten()
            .boxed()
    }

    pub async fn collect(&self) -> StorageResult<Vec<StoredResource>> {
        self.stream().try_collect().await
    }
}

impl std::fmt::Debug for History {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("History")
            .field("shard", &self.shard)
            .field("lineage", &format_args!("{}/{}", self.resource_type, self.id))
            .field("up_to", &self.up_to)
            .finish()
    }
}

async fn persist(
    mut tx: Box<dyn EngineTransaction>,
    version: &StoredResource,
    rows: &[SearchIndexRow],
) -> StorageResult<()> {
    let written = async {
        tx.insert_version(version).await?;
        tx.replace_index_rows(&version.resource_type, &version.id, rows)
            .await
    }
    .await;
    match written {
        Ok(()) => tx.commit().await,
        Err(e) => abort(tx, e).await,
    }
}

async fn abort<T>(tx: Box<dyn EngineTransaction>, err: StorageError) -> StorageResult<T> {
    if let Err(rb) = tx.rollback().await {
        warn!(error = %rb, "Rollback failed");
    }
    Err(err)
}

/// Current time truncated to microseconds, the precision every engine keeps.
fn now() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now.replace_nanosecond(now.nanosecond() / 1_000 * 1_000)
        .unwrap_or(now)
}
