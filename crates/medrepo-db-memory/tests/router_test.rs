//! Shard routing over the in-memory shard directory.

use std::sync::Arc;

use medrepo_core::{ShardId, TenantContext};
use medrepo_db_memory::InMemoryStorage;
use medrepo_storage::{Access, AssignmentState, ShardRouter, StorageError};

fn shard(id: &str) -> ShardId {
    ShardId::new(id).unwrap()
}

fn router(storage: Arc<InMemoryStorage>) -> ShardRouter {
    ShardRouter::new(storage.clone(), storage)
}

#[tokio::test]
async fn test_platform_types_resolve_to_global() {
    let router = router(Arc::new(InMemoryStorage::new()));
    for ctx in [TenantContext::system(), TenantContext::tenant("acme")] {
        for resource_type in ["Project", "User", "ClientApplication", "DomainConfiguration"] {
            let resolved = router.resolve_shard(&ctx, resource_type, None).await.unwrap();
            assert_eq!(resolved, ShardId::global());
        }
    }
}

#[tokio::test]
async fn test_tenant_types_follow_assignment() {
    let storage = Arc::new(InMemoryStorage::with_shards([shard("shard-a")]));
    let router = router(storage);
    router.assign_tenant("acme", shard("shard-a")).await.unwrap();

    let ctx = TenantContext::tenant("acme");
    let first = router.resolve_shard(&ctx, "Patient", Some("p1")).await.unwrap();
    let second = router.resolve_shard(&ctx, "Patient", Some("p1")).await.unwrap();
    assert_eq!(first, shard("shard-a"));
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_unassigned_tenant_never_falls_back_to_global() {
    let router = router(Arc::new(InMemoryStorage::new()));
    let err = router
        .resolve_shard(&TenantContext::tenant("nobody"), "Patient", None)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::ShardUnavailable { shard: None, .. }));
}

#[tokio::test]
async fn test_system_context_cannot_reach_tenant_types() {
    let router = router(Arc::new(InMemoryStorage::new()));
    let err = router
        .resolve_shard(&TenantContext::system(), "Observation", None)
        .await
        .unwrap_err();
    assert!(err.is_shard_unavailable());
}

#[tokio::test]
async fn test_placeholder_assignment_routes_to_placeholder() {
    let router = router(Arc::new(InMemoryStorage::new()));
    router
        .assign_tenant("trial", ShardId::placeholder())
        .await
        .unwrap();
    let resolved = router
        .resolve_shard(&TenantContext::tenant("trial"), "Patient", None)
        .await
        .unwrap();
    assert_eq!(resolved, ShardId::placeholder());
}

#[tokio::test]
async fn test_moving_tenant_reads_source_and_refuses_writes() {
    let storage = Arc::new(InMemoryStorage::with_shards([shard("shard-a"), shard("shard-b")]));
    let router = router(storage);
    let ctx = TenantContext::tenant("acme");
    router.assign_tenant("acme", shard("shard-a")).await.unwrap();

    let moving = router.begin_move("acme").await.unwrap();
    assert_eq!(moving.state, AssignmentState::Moving);
    assert_eq!(
        router.resolve_shard(&ctx, "Patient", None).await.unwrap(),
        ShardId::provisional()
    );

    // reads stay on the source shard; writes wait for the move to finish
    assert_eq!(
        router.route(&ctx, "Patient", Access::Read).await.unwrap(),
        shard("shard-a")
    );
    let err = router.route(&ctx, "Patient", Access::Write).await.unwrap_err();
    assert!(matches!(
        err,
        StorageError::ShardUnavailable { shard: Some(ref s), .. } if *s == ShardId::provisional()
    ));
    // platform records are unaffected by a tenant move
    assert_eq!(
        router.route(&ctx, "Project", Access::Write).await.unwrap(),
        ShardId::global()
    );

    router.complete_move("acme", shard("shard-b")).await.unwrap();
    assert_eq!(
        router.resolve_shard(&ctx, "Patient", None).await.unwrap(),
        shard("shard-b")
    );
    assert_eq!(
        router.route(&ctx, "Patient", Access::Write).await.unwrap(),
        shard("shard-b")
    );

    let err = router
        .complete_move("acme", shard("shard-a"))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::ValidationError { .. }));
}

#[tokio::test]
async fn test_assignment_to_unprovisioned_shard_is_refused() {
    let router = router(Arc::new(InMemoryStorage::new()));
    let err = router
        .assign_tenant("acme", shard("shard-z"))
        .await
        .unwrap_err();
    assert!(err.is_shard_unavailable());
    assert!(router.list_assignments().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_type_is_validation_error() {
    let router = router(Arc::new(InMemoryStorage::new()));
    let err = router
        .resolve_shard(&TenantContext::tenant("acme"), "Spaceship", None)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::ValidationError { .. }));
}
