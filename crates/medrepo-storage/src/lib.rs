//! # medrepo-storage
//!
//! Versioned resource repository on top of pluggable storage engines.
//!
//! This crate defines the engine traits and everything that sits above them.
//! It does not contain any engine implementations; those are provided by
//! `medrepo-db-memory` and `medrepo-db-postgres`.
//!
//! ## Overview
//!
//! - [`ResourceRepository`]: create, update, read, history and delete with
//!   optimistic concurrency, write-time indexing and post-commit events
//! - [`ShardRouter`]: tenant to shard resolution and shard administration
//! - [`MigrationRunner`]: forward-only per-shard schema migrations, gated by
//!   the [`ShardStatusBoard`]
//! - [`StorageEngine`], [`EngineTransaction`], [`ShardDirectory`],
//!   [`MigrationBackend`]: the contract engines implement
//!
//! ## Example
//!
//! ```ignore
//! use medrepo_core::TenantContext;
//! use medrepo_storage::{ResourceRepository, StorageError};
//!
//! async fn bump(repo: &ResourceRepository, ctx: &TenantContext) -> Result<(), StorageError> {
//!     let patient = repo.create(ctx, "Patient", serde_json::json!({"gender": "male"})).await?;
//!     repo.update(ctx, "Patient", &patient.id, patient.version_id, patient.content).await?;
//!     Ok(())
//! }
//! ```

mod error;
pub mod evented;
pub mod migration;
mod repository;
mod router;
mod traits;
mod types;

// Re-export everything from submodules
pub use error::{ErrorCategory, StorageError};
pub use evented::EventPublisher;
pub use migration::{
    MigrationError, MigrationRunner, MigrationStep, ShardState, ShardStatusBoard, StepKind,
};
pub use repository::{History, ResourceRepository};
pub use router::{Access, ShardRouter};
pub use traits::{
    EngineTransaction, MigrationBackend, MigrationTransaction, ShardDirectory, StepFn,
    StorageEngine,
};
pub use types::{AppliedState, AssignmentState, MigrationRecord, ShardAssignment, StoredResource};

/// Type alias for a storage result.
pub type StorageResult<T> = Result<T, StorageError>;

/// Type alias for a shared storage engine.
pub type DynEngine = std::sync::Arc<dyn StorageEngine>;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use medrepo_storage::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{ErrorCategory, StorageError};
    pub use crate::repository::{History, ResourceRepository};
    pub use crate::router::ShardRouter;
    pub use crate::traits::{EngineTransaction, ShardDirectory, StorageEngine};
    pub use crate::types::{AssignmentState, ShardAssignment, StoredResource};
    pub use crate::{DynEngine, StorageResult};
}
