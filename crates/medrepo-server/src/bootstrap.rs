//! Startup wiring: storage engine, shard activation, repository and
//! subscription dispatcher.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use medrepo_core::{ChangeEvent, EventBroadcaster, ShardId};
use medrepo_db_memory::{InMemoryStorage, MEMORY_STEPS, MemoryMigrations};
use medrepo_db_postgres::{POSTGRES_STEPS, PostgresMigrations, PostgresStorage};
use medrepo_storage::{
    EventPublisher, MigrationBackend, MigrationError, MigrationRunner, ResourceRepository,
    ShardDirectory, ShardStatusBoard, StorageEngine,
};
use medrepo_subscriptions::{RepositoryStatusWriter, SubscriptionDispatcher};
use tokio_util::sync::CancellationToken;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, StorageBackend};

/// Brings shards to the current schema version.
#[async_trait]
pub trait ShardActivator: Send + Sync {
    /// Schema version shards must reach before serving traffic.
    fn latest_version(&self) -> u32;

    async fn activate(&self, shard: &ShardId, cancel: &CancellationToken)
    -> Result<u32, MigrationError>;
}

#[async_trait]
impl<B> ShardActivator for MigrationRunner<B>
where
    B: MigrationBackend + 'static,
{
    fn latest_version(&self) -> u32 {
        MigrationRunner::latest_version(self)
    }

    async fn activate(
        &self,
        shard: &ShardId,
        cancel: &CancellationToken,
    ) -> Result<u32, MigrationError> {
        MigrationRunner::activate(self, shard, cancel).await
    }
}

/// Everything the HTTP surface needs, built once at startup.
#[derive(Clone)]
pub struct Services {
    pub repository: Arc<ResourceRepository>,
    pub dispatcher: SubscriptionDispatcher,
    pub activator: Arc<dyn ShardActivator>,
    pub board: Arc<ShardStatusBoard>,
    /// Fan-out of committed changes for in-process observers
    pub events: Arc<EventBroadcaster>,
    /// Cancelled when the server shuts down
    pub shutdown: CancellationToken,
}

struct Engine {
    storage: Arc<dyn StorageEngine>,
    directory: Arc<dyn ShardDirectory>,
    activator: Arc<dyn ShardActivator>,
}

async fn open_engine(cfg: &AppConfig, board: &Arc<ShardStatusBoard>) -> anyhow::Result<Engine> {
    match cfg.storage.backend {
        StorageBackend::Memory => {
            let storage = Arc::new(InMemoryStorage::with_shards(cfg.storage.shard_ids()));
            let runner = MigrationRunner::new(
                MemoryMigrations::new(storage.clone()),
                MEMORY_STEPS,
                board.clone(),
            )?;
            info!(shards = storage.shards().len(), "In-memory storage ready");
            Ok(Engine {
                storage: storage.clone(),
                directory: storage,
                activator: Arc::new(runner),
            })
        }
        StorageBackend::Postgres => {
            let storage = PostgresStorage::connect(&cfg.to_postgres_config())
                .await
                .context("failed to connect PostgreSQL storage")?;
            let runner = MigrationRunner::new(
                PostgresMigrations::new(storage.clone()),
                POSTGRES_STEPS,
                board.clone(),
            )?;
            let storage = Arc::new(storage);
            Ok(Engine {
                storage: storage.clone(),
                directory: storage,
                activator: Arc::new(runner),
            })
        }
    }
}

/// Activates every shard; a shard whose migration fails stays blocked while
/// the others serve.
pub async fn activate_shards(
    activator: &dyn ShardActivator,
    shards: &[ShardId],
    cancel: &CancellationToken,
) -> usize {
    let mut ready = 0;
    for shard in shards {
        if cancel.is_cancelled() {
            break;
        }
        match activator.activate(shard, cancel).await {
            Ok(version) => {
                info!(shard = %shard, version, "Shard active");
                ready += 1;
            }
            Err(e) => error!(shard = %shard, error = %e, "Shard activation failed"),
        }
    }
    ready
}

/// Builds the repository and dispatcher and starts the dispatcher loop.
pub async fn build_services(cfg: &AppConfig, shutdown: CancellationToken) -> anyhow::Result<Services> {
    let board = ShardStatusBoard::new_shared();
    let engine = open_engine(cfg, &board).await?;

    let shards = engine.storage.shards();
    if cfg.migrations.run_on_startup {
        let ready = activate_shards(engine.activator.as_ref(), &shards, &shutdown).await;
        info!(ready, total = shards.len(), "Shard activation finished");
    } else {
        warn!("Startup migrations disabled; shards serve after explicit activation");
    }

    let dispatcher = SubscriptionDispatcher::new(cfg.to_dispatcher_config());
    let events = EventBroadcaster::new_shared();
    let publisher = EventPublisher::new()
        .with_sink(dispatcher.sink())
        .with_sink(events.clone());
    let repository = Arc::new(
        ResourceRepository::new(engine.storage, engine.directory, board.clone())
            .with_required_version(engine.activator.latest_version())
            .with_publisher(publisher),
    );
    tokio::spawn(log_changes(events.subscribe(), shutdown.clone()));

    for tenant in &cfg.storage.tenants {
        let shard = ShardId::new(&tenant.shard)
            .with_context(|| format!("invalid shard for tenant {}", tenant.tenant))?;
        if let Err(e) = repository.router().assign_tenant(&tenant.tenant, shard).await {
            warn!(tenant = %tenant.tenant, error = %e, "Tenant assignment skipped");
        }
    }

    dispatcher.set_status_writer(Arc::new(RepositoryStatusWriter::new(repository.clone())));
    match dispatcher.load_active(&repository).await {
        Ok(loaded) => info!(subscriptions = loaded, "Active subscriptions loaded"),
        Err(e) => warn!(error = %e, "Could not load active subscriptions"),
    }

    let event_loop = dispatcher.clone();
    tokio::spawn(async move { event_loop.run().await });

    Ok(Services {
        repository,
        dispatcher,
        activator: engine.activator,
        board,
        events,
        shutdown,
    })
}

/// Writes one log line per committed change until shutdown.
async fn log_changes(mut changes: broadcast::Receiver<ChangeEvent>, shutdown: CancellationToken) {
    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = changes.recv() => received,
        };
        match received {
            Ok(event) => info!(
                tenant = event.tenant.as_deref().unwrap_or("-"),
                shard = %event.shard,
                resource_type = %event.resource_type,
                id = %event.resource_id,
                version_id = event.version_id,
                change = event.change_kind.as_str(),
                "Resource changed"
            ),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Change log fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("Change log stopped");
}
