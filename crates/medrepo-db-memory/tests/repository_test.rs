//! Resource repository behaviour over the in-memory engine.

use std::sync::Arc;

use futures_util::TryStreamExt;
use medrepo_core::{ChangeEvent, ChangeKind, EventBroadcaster, ShardId, TenantContext};
use medrepo_db_memory::{InMemoryStorage, MEMORY_STEPS, MemoryMigrations};
use medrepo_search::SearchQuery;
use medrepo_storage::{
    EventPublisher, MigrationRunner, ResourceRepository, ShardStatusBoard, StorageEngine,
    StorageError,
};
use serde_json::json;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

fn shard_a() -> ShardId {
    ShardId::new("shard-a").unwrap()
}

fn acme() -> TenantContext {
    TenantContext::tenant("acme")
}

struct Fixture {
    repo: Arc<ResourceRepository>,
    events: broadcast::Receiver<ChangeEvent>,
}

async fn setup_with_page_size(page_size: usize) -> Fixture {
    let storage = Arc::new(InMemoryStorage::with_shards([shard_a()]));
    let board = ShardStatusBoard::new_shared();
    let runner = MigrationRunner::new(
        MemoryMigrations::new(storage.clone()),
        MEMORY_STEPS,
        board.clone(),
    )
    .unwrap();
    runner
        .activate_all(&storage.shards(), &CancellationToken::new())
        .await
        .unwrap();

    let broadcaster = EventBroadcaster::new_shared();
    let events = broadcaster.subscribe();
    let repo = ResourceRepository::new(storage.clone(), storage, board)
        .with_required_version(runner.latest_version())
        .with_history_page_size(page_size)
        .with_publisher(EventPublisher::new().with_sink(broadcaster));
    repo.router().assign_tenant("acme", shard_a()).await.unwrap();

    Fixture {
        repo: Arc::new(repo),
        events,
    }
}

async fn setup() -> Fixture {
    setup_with_page_size(50).await
}

#[tokio::test]
async fn test_patient_update_then_stale_update_conflicts() {
    let Fixture { repo, .. } = setup().await;
    let ctx = acme();

    let v1 = repo
        .create(&ctx, "Patient", json!({"resourceType": "Patient", "gender": "male"}))
        .await
        .unwrap();
    assert_eq!(v1.version_id, 1);
    assert_eq!(v1.content["meta"]["versionId"], "1");

    let v2 = repo
        .update(&ctx, "Patient", &v1.id, 1, json!({"gender": "female"}))
        .await
        .unwrap();
    assert_eq!(v2.version_id, 2);

    let err = repo
        .update(&ctx, "Patient", &v1.id, 1, json!({"gender": "other"}))
        .await
        .unwrap_err();
    match err {
        StorageError::VersionConflict {
            expected, actual, ..
        } => {
            assert_eq!(expected, 1);
            assert_eq!(actual, 2);
        }
        other => panic!("expected version conflict, got {other:?}"),
    }

    let current = repo.read(&ctx, "Patient", &v1.id).await.unwrap();
    assert_eq!(current.version_id, 2);
    assert_eq!(current.content["gender"], "female");
}

#[tokio::test]
async fn test_concurrent_updates_have_one_winner() {
    let Fixture { repo, .. } = setup().await;
    let ctx = acme();
    let created = repo
        .create(&ctx, "Patient", json!({"gender": "male"}))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let repo = repo.clone();
        let ctx = ctx.clone();
        let id = created.id.clone();
        handles.push(tokio::spawn(async move {
            repo.update(&ctx, "Patient", &id, 1, json!({"gender": "male", "birthDate": format!("19{i}0")}))
                .await
        }));
    }

    let mut winners = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(stored) => {
                assert_eq!(stored.version_id, 2);
                winners += 1;
            }
            Err(e) if e.is_version_conflict() => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(conflicts, 7);

    let history = repo.history(&ctx, "Patient", &created.id).await.unwrap();
    assert_eq!(history.latest_version(), 2);
}

#[tokio::test]
async fn test_history_is_ordered_gapless_and_bounded() {
    let Fixture { repo, .. } = setup_with_page_size(2).await;
    let ctx = acme();
    let mut current = repo
        .create(&ctx, "Patient", json!({"gender": "male"}))
        .await
        .unwrap();
    for _ in 0..4 {
        current = repo
            .update(&ctx, "Patient", &current.id, current.version_id, json!({"gender": "male"}))
            .await
            .unwrap();
    }

    let history = repo.history(&ctx, "Patient", &current.id).await.unwrap();
    repo.update(&ctx, "Patient", &current.id, 5, json!({"gender": "female"}))
        .await
        .unwrap();

    let versions: Vec<u64> = history
        .stream()
        .map_ok(|v| v.version_id)
        .try_collect()
        .await
        .unwrap();
    assert_eq!(versions, vec![1, 2, 3, 4, 5]);

    let again = history.collect().await.unwrap();
    assert_eq!(again.len(), 5);
    assert!(again.windows(2).all(|w| w[0].last_updated <= w[1].last_updated));
}

#[tokio::test]
async fn test_index_tracks_current_version_only() {
    let Fixture { repo, .. } = setup().await;
    let ctx = acme();
    let v1 = repo
        .create(
            &ctx,
            "Patient",
            json!({"gender": "male", "birthDate": "1980-04-02"}),
        )
        .await
        .unwrap();

    let rows = repo.index_rows(&ctx, "Patient", &v1.id).await.unwrap();
    assert!(rows.iter().any(|r| r.param == "birthdate"));
    assert!(rows.iter().all(|r| r.version_id == 1));

    repo.update(&ctx, "Patient", &v1.id, 1, json!({"gender": "female"}))
        .await
        .unwrap();
    let rows = repo.index_rows(&ctx, "Patient", &v1.id).await.unwrap();
    assert!(!rows.iter().any(|r| r.param == "birthdate"));
    assert!(rows.iter().all(|r| r.version_id == 2));

    let male = SearchQuery::parse("Patient?gender=male").unwrap();
    let female = SearchQuery::parse("Patient?gender=female").unwrap();
    assert!(repo.search(&ctx, &male).await.unwrap().is_empty());
    assert_eq!(repo.search(&ctx, &female).await.unwrap().len(), 1);

    repo.delete(&ctx, "Patient", &v1.id).await.unwrap();
    assert!(repo.index_rows(&ctx, "Patient", &v1.id).await.unwrap().is_empty());
    assert!(repo.search(&ctx, &female).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_deleted_lineage_is_gone_but_history_remains() {
    let Fixture { repo, .. } = setup().await;
    let ctx = acme();
    let v1 = repo
        .create(&ctx, "Patient", json!({"gender": "male"}))
        .await
        .unwrap();

    let tombstone = repo.delete(&ctx, "Patient", &v1.id).await.unwrap();
    assert_eq!(tombstone.version_id, 2);
    assert!(tombstone.deleted);

    assert!(repo.read(&ctx, "Patient", &v1.id).await.unwrap_err().is_gone());
    assert!(repo.delete(&ctx, "Patient", &v1.id).await.unwrap_err().is_gone());
    assert!(
        repo.update(&ctx, "Patient", &v1.id, 2, json!({}))
            .await
            .unwrap_err()
            .is_gone()
    );

    let first = repo.read_version(&ctx, "Patient", &v1.id, 1).await.unwrap();
    assert_eq!(first.content["gender"], "male");
    let second = repo.read_version(&ctx, "Patient", &v1.id, 2).await.unwrap();
    assert!(second.deleted);
    assert!(
        repo.read_version(&ctx, "Patient", &v1.id, 3)
            .await
            .unwrap_err()
            .is_not_found()
    );

    let history = repo.history(&ctx, "Patient", &v1.id).await.unwrap();
    assert_eq!(history.collect().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_unknown_lineage_is_not_found() {
    let Fixture { repo, .. } = setup().await;
    let ctx = acme();
    assert!(repo.read(&ctx, "Patient", "nope").await.unwrap_err().is_not_found());
    assert!(
        repo.update(&ctx, "Patient", "nope", 1, json!({}))
            .await
            .unwrap_err()
            .is_not_found()
    );
    assert!(repo.delete(&ctx, "Patient", "nope").await.unwrap_err().is_not_found());
    assert!(repo.history(&ctx, "Patient", "nope").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_invalid_content_is_rejected() {
    let Fixture { repo, .. } = setup().await;
    let ctx = acme();

    let err = repo
        .create(&ctx, "Observation", json!({"status": "final"}))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::ValidationError { .. }));

    let err = repo
        .create(&ctx, "Spaceship", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::ValidationError { .. }));

    let created = repo
        .create(&ctx, "Patient", json!({}))
        .await
        .unwrap();
    let err = repo
        .update(&ctx, "Patient", &created.id, 1, json!({"id": "someone-else"}))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::ValidationError { .. }));
}

#[tokio::test]
async fn test_events_follow_commits_in_version_order() {
    let Fixture { repo, mut events } = setup().await;
    let ctx = acme();

    let v1 = repo
        .create(&ctx, "Patient", json!({"gender": "male"}))
        .await
        .unwrap();
    repo.update(&ctx, "Patient", &v1.id, 1, json!({"gender": "female"}))
        .await
        .unwrap();
    repo.delete(&ctx, "Patient", &v1.id).await.unwrap();

    let created = events.recv().await.unwrap();
    assert_eq!(created.change_kind, ChangeKind::Created);
    assert_eq!(created.version_id, 1);
    assert_eq!(created.tenant.as_deref(), Some("acme"));
    assert_eq!(created.shard, shard_a());

    let updated = events.recv().await.unwrap();
    assert_eq!(updated.change_kind, ChangeKind::Updated);
    assert_eq!(updated.version_id, 2);

    let deleted = events.recv().await.unwrap();
    assert_eq!(deleted.change_kind, ChangeKind::Deleted);
    assert_eq!(deleted.version_id, 3);
    assert_eq!(
        deleted.resource.as_ref().map(|r| r["gender"].clone()),
        Some(json!("female"))
    );
}

#[tokio::test]
async fn test_failed_write_emits_no_event() {
    let Fixture { repo, mut events } = setup().await;
    let ctx = acme();
    let v1 = repo
        .create(&ctx, "Patient", json!({}))
        .await
        .unwrap();
    let _ = events.recv().await.unwrap();

    repo.update(&ctx, "Patient", &v1.id, 7, json!({}))
        .await
        .unwrap_err();
    assert!(matches!(
        events.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test]
async fn test_racing_writers_emit_events_in_version_order() {
    let Fixture { repo, mut events } = setup().await;
    let ctx = acme();
    let created = repo
        .create(&ctx, "Patient", json!({}))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let repo = repo.clone();
        let ctx = ctx.clone();
        let id = created.id.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..5 {
                loop {
                    let current = repo.read(&ctx, "Patient", &id).await.unwrap();
                    match repo
                        .update(&ctx, "Patient", &id, current.version_id, json!({}))
                        .await
                    {
                        Ok(_) => break,
                        Err(e) if e.is_version_conflict() => continue,
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event.version_id);
    }
    assert_eq!(seen, (1..=21).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_routing_failures_are_shard_unavailable() {
    let Fixture { repo, .. } = setup().await;

    let err = repo
        .create(&TenantContext::tenant("nobody"), "Patient", json!({}))
        .await
        .unwrap_err();
    assert!(err.is_shard_unavailable());

    let err = repo
        .create(&TenantContext::system(), "Patient", json!({}))
        .await
        .unwrap_err();
    assert!(err.is_shard_unavailable());

    let project = repo
        .create(&TenantContext::system(), "Project", json!({"name": "demo"}))
        .await
        .unwrap();
    let read = repo
        .read(&TenantContext::tenant("acme"), "Project", &project.id)
        .await
        .unwrap();
    assert_eq!(read.id, project.id);
}

#[tokio::test]
async fn test_unmigrated_shard_refuses_traffic() {
    let storage = Arc::new(InMemoryStorage::new());
    let repo = ResourceRepository::new(storage.clone(), storage, ShardStatusBoard::new_shared());

    let err = repo
        .create(&TenantContext::system(), "Project", json!({"name": "demo"}))
        .await
        .unwrap_err();
    assert!(err.is_shard_unavailable());
}

#[tokio::test]
async fn test_moving_tenant_keeps_lineages_on_source_shard() {
    let Fixture { repo, .. } = setup().await;
    let ctx = acme();
    let existing = repo
        .create(&ctx, "Patient", json!({"resourceType": "Patient", "gender": "female"}))
        .await
        .unwrap();

    repo.router().begin_move("acme").await.unwrap();

    // committed data stays visible while the move runs
    let read = repo.read(&ctx, "Patient", &existing.id).await.unwrap();
    assert_eq!(read.version_id, 1);
    let found = repo
        .search(&ctx, &SearchQuery::parse("Patient?gender=female").unwrap())
        .await
        .unwrap();
    assert_eq!(found.len(), 1);

    // nothing is written to the provisional shard
    let err = repo
        .create(&ctx, "Patient", json!({"resourceType": "Patient"}))
        .await
        .unwrap_err();
    assert!(err.is_shard_unavailable());
    let err = repo
        .update(&ctx, "Patient", &existing.id, 1, json!({"resourceType": "Patient"}))
        .await
        .unwrap_err();
    assert!(err.is_shard_unavailable());
    let err = repo.delete(&ctx, "Patient", &existing.id).await.unwrap_err();
    assert!(err.is_shard_unavailable());
    assert!(
        repo.engine()
            .read_current(&ShardId::provisional(), "Patient", &existing.id)
            .await
            .unwrap()
            .is_none()
    );

    repo.router().complete_move("acme", shard_a()).await.unwrap();

    let read = repo.read(&ctx, "Patient", &existing.id).await.unwrap();
    assert_eq!(read.version_id, 1);
    let updated = repo
        .update(&ctx, "Patient", &existing.id, 1, json!({"resourceType": "Patient"}))
        .await
        .unwrap();
    assert_eq!(updated.version_id, 2);
    let created = repo
        .create(&ctx, "Patient", json!({"resourceType": "Patient"}))
        .await
        .unwrap();
    assert_eq!(repo.read(&ctx, "Patient", &created.id).await.unwrap().version_id, 1);
}
