//! Migration runner behaviour over the in-memory backend.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::future::BoxFuture;
use medrepo_core::{ShardId, TenantContext};
use medrepo_db_memory::{InMemoryStorage, MEMORY_STEPS, MemoryMigrations, MemoryShardHandle};
use medrepo_storage::{
    MigrationError, MigrationRunner, MigrationStep, ResourceRepository, ShardState,
    ShardStatusBoard, StepKind,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

type Step = MigrationStep<MemoryShardHandle>;
type StepResult<'a> = BoxFuture<'a, Result<(), MigrationError>>;

fn runner(
    storage: &Arc<InMemoryStorage>,
    steps: &[Step],
    board: &Arc<ShardStatusBoard>,
) -> MigrationRunner<MemoryMigrations> {
    MigrationRunner::new(MemoryMigrations::new(storage.clone()), steps, board.clone()).unwrap()
}

fn versions(storage: &InMemoryStorage, shard: &ShardId) -> Vec<u32> {
    storage
        .migration_records(shard)
        .unwrap()
        .iter()
        .map(|r| r.version)
        .collect()
}

#[tokio::test]
async fn test_activation_is_idempotent() {
    let storage = Arc::new(InMemoryStorage::new());
    let board = ShardStatusBoard::new_shared();
    let runner = runner(&storage, MEMORY_STEPS, &board);
    let shard = ShardId::global();
    let cancel = CancellationToken::new();

    assert_eq!(runner.activate(&shard, &cancel).await.unwrap(), 4);
    assert_eq!(versions(&storage, &shard), vec![1, 2, 3, 4]);
    let schema = storage.schema(&shard).unwrap().unwrap();
    assert!(schema.has_column("resource_current", "last_updated"));

    assert_eq!(runner.activate(&shard, &cancel).await.unwrap(), 4);
    assert_eq!(versions(&storage, &shard), vec![1, 2, 3, 4]);
    assert_eq!(board.state(&shard), ShardState::AtVersion(4));
}

static FIRST_BOOT_SCHEMA: AtomicUsize = AtomicUsize::new(0);
static FIRST_BOOT_DATA: AtomicUsize = AtomicUsize::new(0);

fn counted_schema(_: &mut MemoryShardHandle) -> StepResult<'_> {
    FIRST_BOOT_SCHEMA.fetch_add(1, Ordering::SeqCst);
    Box::pin(async { Ok(()) })
}

fn counted_data(_: &mut MemoryShardHandle) -> StepResult<'_> {
    FIRST_BOOT_DATA.fetch_add(1, Ordering::SeqCst);
    Box::pin(async { Ok(()) })
}

#[tokio::test]
async fn test_first_boot_skips_data_steps_but_upgrades_run_them() {
    let steps = [
        Step {
            version: 1,
            name: "schema",
            kind: StepKind::Schema,
            run: counted_schema,
        },
        Step {
            version: 2,
            name: "backfill",
            kind: StepKind::Data,
            run: counted_data,
        },
    ];
    let cancel = CancellationToken::new();

    let fresh = Arc::new(InMemoryStorage::new());
    let board = ShardStatusBoard::new_shared();
    runner(&fresh, &steps, &board)
        .activate(&ShardId::global(), &cancel)
        .await
        .unwrap();
    assert_eq!(FIRST_BOOT_SCHEMA.load(Ordering::SeqCst), 1);
    assert_eq!(FIRST_BOOT_DATA.load(Ordering::SeqCst), 0);
    let records = fresh.migration_records(&ShardId::global()).unwrap();
    assert!(records.iter().all(|r| r.first_boot));
    assert_eq!(records.len(), 2);

    let upgraded = Arc::new(InMemoryStorage::new());
    let board = ShardStatusBoard::new_shared();
    runner(&upgraded, &steps[..1], &board)
        .activate(&ShardId::global(), &cancel)
        .await
        .unwrap();
    runner(&upgraded, &steps, &board)
        .activate(&ShardId::global(), &cancel)
        .await
        .unwrap();
    assert_eq!(FIRST_BOOT_DATA.load(Ordering::SeqCst), 1);
    let records = upgraded.migration_records(&ShardId::global()).unwrap();
    assert!(records[0].first_boot);
    assert!(!records[1].first_boot);
}

static RESTART_RUNS: [AtomicUsize; 4] = [
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
];

fn restart_1(_: &mut MemoryShardHandle) -> StepResult<'_> {
    RESTART_RUNS[0].fetch_add(1, Ordering::SeqCst);
    Box::pin(async { Ok(()) })
}
fn restart_2(_: &mut MemoryShardHandle) -> StepResult<'_> {
    RESTART_RUNS[1].fetch_add(1, Ordering::SeqCst);
    Box::pin(async { Ok(()) })
}
fn restart_3(_: &mut MemoryShardHandle) -> StepResult<'_> {
    RESTART_RUNS[2].fetch_add(1, Ordering::SeqCst);
    Box::pin(async { Ok(()) })
}
fn restart_4(_: &mut MemoryShardHandle) -> StepResult<'_> {
    RESTART_RUNS[3].fetch_add(1, Ordering::SeqCst);
    Box::pin(async { Ok(()) })
}

#[tokio::test]
async fn test_restart_resumes_after_last_applied_version() {
    let steps = [
        Step { version: 1, name: "one", kind: StepKind::Schema, run: restart_1 },
        Step { version: 2, name: "two", kind: StepKind::Schema, run: restart_2 },
        Step { version: 3, name: "three", kind: StepKind::Schema, run: restart_3 },
        Step { version: 4, name: "four", kind: StepKind::Schema, run: restart_4 },
    ];
    let storage = Arc::new(InMemoryStorage::new());
    let shard = ShardId::global();
    let cancel = CancellationToken::new();

    // First process only knew about two steps.
    runner(&storage, &steps[..2], &ShardStatusBoard::new_shared())
        .activate(&shard, &cancel)
        .await
        .unwrap();

    // A new process, with a fresh status board, picks up from the record table.
    let board = ShardStatusBoard::new_shared();
    let version = runner(&storage, &steps, &board)
        .activate(&shard, &cancel)
        .await
        .unwrap();

    assert_eq!(version, 4);
    assert_eq!(versions(&storage, &shard), vec![1, 2, 3, 4]);
    let runs: Vec<usize> = RESTART_RUNS.iter().map(|c| c.load(Ordering::SeqCst)).collect();
    assert_eq!(runs, vec![1, 1, 1, 1]);
}

fn ok_step(h: &mut MemoryShardHandle) -> StepResult<'_> {
    Box::pin(async move {
        h.schema().create_table("resource_version", &["id"]);
        Ok(())
    })
}

fn broken_step(h: &mut MemoryShardHandle) -> StepResult<'_> {
    Box::pin(async move {
        h.schema().create_table("half_done", &["x"]);
        Err(MigrationError::step(2, "broken", "column \"x\" already exists"))
    })
}

fn fixed_step(h: &mut MemoryShardHandle) -> StepResult<'_> {
    Box::pin(async move {
        h.schema().create_table("done", &["x"]);
        Ok(())
    })
}

#[tokio::test]
async fn test_failed_step_blocks_shard_until_cleared() {
    let broken = [
        Step { version: 1, name: "ok", kind: StepKind::Schema, run: ok_step },
        Step { version: 2, name: "broken", kind: StepKind::Schema, run: broken_step },
        Step { version: 3, name: "later", kind: StepKind::Schema, run: fixed_step },
    ];
    let storage = Arc::new(InMemoryStorage::new());
    let board = ShardStatusBoard::new_shared();
    let shard = ShardId::global();
    let cancel = CancellationToken::new();

    let err = runner(&storage, &broken, &board)
        .activate(&shard, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::StepFailed { version: 2, .. }));

    // Step 1 stays committed, step 2 left nothing behind, step 3 never ran.
    assert_eq!(versions(&storage, &shard), vec![1]);
    let schema = storage.schema(&shard).unwrap().unwrap();
    assert!(schema.has_table("resource_version"));
    assert!(!schema.has_table("half_done"));
    assert!(!schema.has_table("done"));
    assert!(matches!(
        board.state(&shard),
        ShardState::MigrationFailed { version: 2, .. }
    ));

    let repo = ResourceRepository::new(storage.clone(), storage.clone(), board.clone());
    let err = repo
        .create(&TenantContext::system(), "Project", json!({"name": "x"}))
        .await
        .unwrap_err();
    assert!(err.is_migration_failed());

    let err = runner(&storage, &broken, &board)
        .activate(&shard, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::Blocked { version: 2, .. }));

    assert!(board.clear_failure(&shard));
    let fixed = [
        Step { version: 1, name: "ok", kind: StepKind::Schema, run: ok_step },
        Step { version: 2, name: "fixed", kind: StepKind::Schema, run: fixed_step },
        Step { version: 3, name: "later", kind: StepKind::Schema, run: fixed_step },
    ];
    assert_eq!(
        runner(&storage, &fixed, &board)
            .activate(&shard, &cancel)
            .await
            .unwrap(),
        3
    );
    assert_eq!(versions(&storage, &shard), vec![1, 2, 3]);
}

static CONCURRENT_RUNS: AtomicUsize = AtomicUsize::new(0);

fn slow_step(_: &mut MemoryShardHandle) -> StepResult<'_> {
    CONCURRENT_RUNS.fetch_add(1, Ordering::SeqCst);
    Box::pin(async {
        tokio::task::yield_now().await;
        Ok(())
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_runners_apply_each_step_once() {
    let steps = [
        Step { version: 1, name: "a", kind: StepKind::Schema, run: slow_step },
        Step { version: 2, name: "b", kind: StepKind::Schema, run: slow_step },
    ];
    let storage = Arc::new(InMemoryStorage::new());
    let shard = ShardId::global();

    let first = runner(&storage, &steps, &ShardStatusBoard::new_shared());
    let second = runner(&storage, &steps, &ShardStatusBoard::new_shared());
    let cancel = CancellationToken::new();
    let (a, b) = tokio::join!(first.activate(&shard, &cancel), second.activate(&shard, &cancel));

    assert_eq!(a.unwrap(), 2);
    assert_eq!(b.unwrap(), 2);
    assert_eq!(CONCURRENT_RUNS.load(Ordering::SeqCst), 2);
    assert_eq!(versions(&storage, &shard), vec![1, 2]);
}

#[tokio::test]
async fn test_cancellation_stops_between_steps() {
    let storage = Arc::new(InMemoryStorage::new());
    let board = ShardStatusBoard::new_shared();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = runner(&storage, MEMORY_STEPS, &board)
        .activate(&ShardId::global(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::Cancelled(1)));
    assert!(versions(&storage, &ShardId::global()).is_empty());
}

#[test]
fn test_gapped_step_table_is_rejected() {
    let steps = [
        Step { version: 1, name: "a", kind: StepKind::Schema, run: ok_step },
        Step { version: 3, name: "c", kind: StepKind::Schema, run: ok_step },
    ];
    let storage = Arc::new(InMemoryStorage::new());
    let result = MigrationRunner::new(
        MemoryMigrations::new(storage),
        &steps,
        ShardStatusBoard::new_shared(),
    );
    assert!(matches!(result, Err(MigrationError::InvalidTable(_))));
}

#[tokio::test]
async fn test_data_step_reindexes_on_upgrade() {
    let storage = Arc::new(InMemoryStorage::new());
    let board = ShardStatusBoard::new_shared();
    let shard = ShardId::global();
    let cancel = CancellationToken::new();

    runner(&storage, &MEMORY_STEPS[..3], &board)
        .activate(&shard, &cancel)
        .await
        .unwrap();
    let repo = ResourceRepository::new(storage.clone(), storage.clone(), board.clone())
        .with_required_version(3);
    let project = repo
        .create(&TenantContext::system(), "Project", json!({"name": "Demo"}))
        .await
        .unwrap();

    runner(&storage, MEMORY_STEPS, &board)
        .activate(&shard, &cancel)
        .await
        .unwrap();
    let rows = repo
        .index_rows(&TenantContext::system(), "Project", &project.id)
        .await
        .unwrap();
    assert!(rows.iter().any(|r| r.param == "name"));
    let records = storage.migration_records(&shard).unwrap();
    assert!(!records[3].first_boot);
}
