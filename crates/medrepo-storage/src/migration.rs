//! Forward-only, crash-safe schema migration runner.
//!
//! Each step runs in its own engine transaction holding the shard's advisory
//! lock. The highest applied version is always re-read from the shard's record
//! table under that lock, so a crash between steps (or between a step and its
//! commit) resumes at the right place on the next activation.
//!
//! [`ShardStatusBoard`] mirrors the per-shard state for request gating. It is a
//! cache of what this process observed, never the source of truth for the
//! applied version.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use medrepo_core::ShardId;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::StorageError;
use crate::traits::{MigrationBackend, MigrationTransaction, StepFn};

/// Errors raised by the runner and by migration backends.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MigrationError {
    /// A step failed; its transaction was rolled back.
    #[error("Migration {version} ({name}) failed: {reason}")]
    StepFailed {
        version: u32,
        name: String,
        reason: String,
    },

    /// The step table is malformed.
    #[error("Invalid migration table: {0}")]
    InvalidTable(String),

    /// The shard was previously marked failed and has not been cleared.
    #[error("Shard {shard} is blocked by failed migration {version}: {reason}")]
    Blocked {
        shard: ShardId,
        version: u32,
        reason: String,
    },

    #[error("Migration cancelled before version {0}")]
    Cancelled(u32),

    /// Engine-level failure (connection, lock, record table).
    #[error("Migration backend error: {0}")]
    Backend(String),
}

impl MigrationError {
    #[must_use]
    pub fn step(version: u32, name: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::StepFailed {
            version,
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    #[must_use]
    pub fn backend(reason: impl fmt::Display) -> Self {
        Self::Backend(reason.to_string())
    }
}

/// Whether a step changes structure or rewrites existing rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Schema,
    /// Backfill over existing rows; recorded without running on first boot.
    Data,
}

/// A numbered migration step for a backend whose handle type is `H`.
pub struct MigrationStep<H> {
    pub version: u32,
    pub name: &'static str,
    pub kind: StepKind,
    pub run: StepFn<H>,
}

impl<H> Clone for MigrationStep<H> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<H> Copy for MigrationStep<H> {}

impl<H> fmt::Debug for MigrationStep<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationStep")
            .field("version", &self.version)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Observed lifecycle state of one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardState {
    Uninitialized,
    Bootstrapping,
    AtVersion(u32),
    Migrating { from: u32, to: u32 },
    MigrationFailed { version: u32, reason: String },
}

impl fmt::Display for ShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => f.write_str("uninitialized"),
            Self::Bootstrapping => f.write_str("bootstrapping"),
            Self::AtVersion(v) => write!(f, "at_version({v})"),
            Self::Migrating { from, to } => write!(f, "migrating({from}->{to})"),
            Self::MigrationFailed { version, .. } => write!(f, "migration_failed({version})"),
        }
    }
}

/// Process-wide view of shard readiness.
#[derive(Debug, Default)]
pub struct ShardStatusBoard {
    states: DashMap<ShardId, ShardState>,
}

impl ShardStatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn state(&self, shard: &ShardId) -> ShardState {
        self.states
            .get(shard)
            .map(|s| s.value().clone())
            .unwrap_or(ShardState::Uninitialized)
    }

    pub fn set(&self, shard: &ShardId, state: ShardState) {
        debug!(shard = %shard, state = %state, "Shard state changed");
        self.states.insert(shard.clone(), state);
    }

    /// Gate for repository traffic: the shard must be at `required` or later.
    pub fn ensure_ready(&self, shard: &ShardId, required: u32) -> Result<(), StorageError> {
        match self.state(shard) {
            ShardState::AtVersion(v) if v >= required => Ok(()),
            ShardState::MigrationFailed { version, reason } => Err(
                StorageError::migration_failed(shard.clone(), version, reason),
            ),
            other => Err(StorageError::shard_unavailable(
                Some(shard.clone()),
                format!("shard is {other}, version {required} required"),
            )),
        }
    }

    /// Operator action: lifts a `MigrationFailed` block so the next
    /// activation retries. Returns `false` if the shard was not failed.
    pub fn clear_failure(&self, shard: &ShardId) -> bool {
        let mut cleared = false;
        if let Some(mut entry) = self.states.get_mut(shard) {
            if matches!(*entry, ShardState::MigrationFailed { .. }) {
                *entry = ShardState::Uninitialized;
                cleared = true;
            }
        }
        if cleared {
            info!(shard = %shard, "Migration failure cleared");
        }
        cleared
    }

    /// Snapshot of every tracked shard, sorted by id.
    pub fn snapshot(&self) -> Vec<(ShardId, ShardState)> {
        let mut all: Vec<_> = self
            .states
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
        all
    }
}

/// Applies migration steps to shards, one transaction per step.
pub struct MigrationRunner<B: MigrationBackend> {
    backend: B,
    steps: Vec<MigrationStep<B::Handle>>,
    board: Arc<ShardStatusBoard>,
}

impl<B: MigrationBackend> MigrationRunner<B> {
    /// Creates a runner; step versions must be `1, 2, ..., n`.
    pub fn new(
        backend: B,
        steps: &[MigrationStep<B::Handle>],
        board: Arc<ShardStatusBoard>,
    ) -> Result<Self, MigrationError> {
        for (idx, step) in steps.iter().enumerate() {
            let expected = idx as u32 + 1;
            if step.version != expected {
                return Err(MigrationError::InvalidTable(format!(
                    "step '{}' has version {}, expected {}",
                    step.name, step.version, expected
                )));
            }
        }
        Ok(Self {
            backend,
            steps: steps.to_vec(),
            board,
        })
    }

    pub fn latest_version(&self) -> u32 {
        self.steps.last().map_or(0, |s| s.version)
    }

    pub fn board(&self) -> &Arc<ShardStatusBoard> {
        &self.board
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Brings a shard to the latest version and returns it.
    ///
    /// A shard already marked failed is refused until `clear_failure`. The
    /// cancellation token is checked between steps only.
    #[instrument(skip(self, cancel), fields(shard = %shard, target = self.latest_version()))]
    pub async fn activate(
        &self,
        shard: &ShardId,
        cancel: &CancellationToken,
    ) -> Result<u32, MigrationError> {
        if let ShardState::MigrationFailed { version, reason } = self.board.state(shard) {
            return Err(MigrationError::Blocked {
                shard: shard.clone(),
                version,
                reason,
            });
        }

        self.board.set(shard, ShardState::Bootstrapping);
        if let Err(e) = self.backend.bootstrap(shard).await {
            self.board.set(shard, ShardState::Uninitialized);
            return Err(e);
        }

        // Decided once per activation: only a shard with an empty record
        // table at the start of this activation is on first boot.
        let mut first_boot: Option<bool> = None;
        let mut current = 0;

        for step in &self.steps {
            if cancel.is_cancelled() {
                warn!(version = step.version, "Migration cancelled between steps");
                self.board.set(shard, ShardState::Uninitialized);
                return Err(MigrationError::Cancelled(step.version));
            }

            let mut tx = self.backend.begin(shard).await?;
            let applied = match tx.applied().await {
                Ok(applied) => applied,
                Err(e) => {
                    if let Err(rb) = tx.rollback().await {
                        warn!(error = %rb, "Rollback after unreadable migration records failed");
                    }
                    self.board.set(shard, ShardState::Uninitialized);
                    return Err(e);
                }
            };
            let boot = *first_boot.get_or_insert(applied.is_empty());
            current = applied.current();

            if current >= step.version {
                tx.rollback().await?;
                continue;
            }

            self.board.set(
                shard,
                ShardState::Migrating {
                    from: current,
                    to: step.version,
                },
            );

            let outcome = if boot && step.kind == StepKind::Data {
                debug!(version = step.version, name = step.name, "Skipping data step on first boot");
                Ok(())
            } else {
                (step.run)(tx.handle()).await
            };

            let outcome = match outcome {
                Ok(()) => tx.record(step.version, boot).await.map(|_| tx),
                Err(e) => {
                    if let Err(rb) = tx.rollback().await {
                        warn!(error = %rb, "Rollback after failed migration step failed");
                    }
                    Err(e)
                }
            };

            let committed = match outcome {
                Ok(tx) => tx.commit().await,
                Err(e) => Err(e),
            };

            if let Err(e) = committed {
                let reason = match &e {
                    MigrationError::StepFailed { reason, .. } => reason.clone(),
                    other => other.to_string(),
                };
                error!(
                    version = step.version,
                    name = step.name,
                    error = %reason,
                    "Migration step failed; shard blocked"
                );
                self.board.set(
                    shard,
                    ShardState::MigrationFailed {
                        version: step.version,
                        reason,
                    },
                );
                return Err(e);
            }

            current = step.version;
            info!(version = step.version, name = step.name, first_boot = boot, "Migration applied");
        }

        self.board.set(shard, ShardState::AtVersion(current));
        Ok(current)
    }

    /// Activates every shard in order, stopping at the first failure.
    pub async fn activate_all(
        &self,
        shards: &[ShardId],
        cancel: &CancellationToken,
    ) -> Result<(), MigrationError> {
        for shard in shards {
            self.activate(shard, cancel).await?;
        }
        Ok(())
    }
}

impl From<MigrationError> for StorageError {
    fn from(err: MigrationError) -> Self {
        match err {
            MigrationError::Blocked {
                shard,
                version,
                reason,
            } => StorageError::migration_failed(shard, version, reason),
            MigrationError::Backend(msg) => StorageError::connection_error(msg),
            other => StorageError::internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &mut ()) -> futures_util::future::BoxFuture<'_, Result<(), MigrationError>> {
        Box::pin(async { Ok(()) })
    }

    #[test]
    fn test_board_gates_on_version() {
        let board = ShardStatusBoard::new();
        let shard = ShardId::global();

        let err = board.ensure_ready(&shard, 1).unwrap_err();
        assert!(err.is_shard_unavailable());

        board.set(&shard, ShardState::AtVersion(2));
        assert!(board.ensure_ready(&shard, 2).is_ok());
        assert!(board.ensure_ready(&shard, 3).is_err());
    }

    #[test]
    fn test_failed_shard_blocks_until_cleared() {
        let board = ShardStatusBoard::new();
        let shard = ShardId::new("shard-a").unwrap();
        board.set(
            &shard,
            ShardState::MigrationFailed {
                version: 3,
                reason: "column exists".into(),
            },
        );

        let err = board.ensure_ready(&shard, 1).unwrap_err();
        assert!(err.is_migration_failed());

        assert!(board.clear_failure(&shard));
        assert_eq!(board.state(&shard), ShardState::Uninitialized);
        assert!(!board.clear_failure(&shard));
    }

    #[test]
    fn test_shard_state_display() {
        assert_eq!(ShardState::AtVersion(4).to_string(), "at_version(4)");
        assert_eq!(
            ShardState::Migrating { from: 1, to: 2 }.to_string(),
            "migrating(1->2)"
        );
    }

    #[test]
    fn test_step_debug_omits_fn() {
        let step: MigrationStep<()> = MigrationStep {
            version: 1,
            name: "init",
            kind: StepKind::Schema,
            run: noop,
        };
        let dbg = format!("{step:?}");
        assert!(dbg.contains("init"));
        assert!(!dbg.contains("run"));
    }

    /// Backend whose record table cannot be read and whose rollbacks fail.
    #[derive(Default)]
    struct BrokenRecords {
        rollbacks: Arc<std::sync::atomic::AtomicUsize>,
    }

    struct BrokenTx {
        handle: (),
        rollbacks: Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl MigrationBackend for BrokenRecords {
        type Handle = ();
        type Tx = BrokenTx;

        async fn bootstrap(&self, _: &ShardId) -> Result<(), MigrationError> {
            Ok(())
        }

        async fn begin(&self, _: &ShardId) -> Result<BrokenTx, MigrationError> {
            Ok(BrokenTx {
                handle: (),
                rollbacks: self.rollbacks.clone(),
            })
        }
    }

    #[async_trait::async_trait]
    impl MigrationTransaction for BrokenTx {
        type Handle = ();

        async fn applied(&mut self) -> Result<crate::types::AppliedState, MigrationError> {
            Err(MigrationError::backend("relation medrepo_migrations is corrupt"))
        }

        fn handle(&mut self) -> &mut () {
            &mut self.handle
        }

        async fn record(&mut self, _: u32, _: bool) -> Result<(), MigrationError> {
            Ok(())
        }

        async fn commit(self) -> Result<(), MigrationError> {
            Ok(())
        }

        async fn rollback(self) -> Result<(), MigrationError> {
            self.rollbacks
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(MigrationError::backend("connection reset"))
        }
    }

    #[tokio::test]
    async fn test_unreadable_records_report_read_error_over_rollback_error() {
        let backend = BrokenRecords::default();
        let rollbacks = backend.rollbacks.clone();
        let steps = [MigrationStep {
            version: 1,
            name: "init",
            kind: StepKind::Schema,
            run: noop,
        }];
        let board = ShardStatusBoard::new_shared();
        let runner = MigrationRunner::new(backend, &steps, board.clone()).unwrap();
        let shard = ShardId::new("shard-a").unwrap();

        let err = runner
            .activate(&shard, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("corrupt"));
        assert_eq!(rollbacks.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(board.state(&shard), ShardState::Uninitialized);
    }

    #[test]
    fn test_blocked_maps_to_migration_failed() {
        let err: StorageError = MigrationError::Blocked {
            shard: ShardId::global(),
            version: 2,
            reason: "boom".into(),
        }
        .into();
        assert!(err.is_migration_failed());
    }
}
