//! In-memory storage engine for medrepo.
//!
//! This crate provides an in-memory implementation of the `StorageEngine`,
//! `ShardDirectory` and `MigrationBackend` traits from `medrepo-storage`. It
//! is used for tests and for single-process deployments that do not need
//! durability.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use medrepo_db_memory::{InMemoryStorage, MemoryMigrations, MEMORY_STEPS};
//! use medrepo_storage::{MigrationRunner, ShardStatusBoard};
//!
//! let storage = Arc::new(InMemoryStorage::new());
//! let board = ShardStatusBoard::new_shared();
//! let runner = MigrationRunner::new(MemoryMigrations::new(storage.clone()), MEMORY_STEPS, board)?;
//! runner.activate_all(&storage.shards(), &CancellationToken::new()).await?;
//! ```

pub mod schema;
pub mod storage;
pub mod transaction;

pub use medrepo_storage::{StorageEngine, StorageError, StoredResource};
pub use schema::{MEMORY_STEPS, MemoryMigrations, MemorySchema, MemoryShardHandle};
pub use storage::{InMemoryStorage, StorageKey};
pub use transaction::MemoryTransaction;

/// Type alias for a shareable in-memory engine.
pub type DynMemoryStorage = std::sync::Arc<InMemoryStorage>;

/// Creates a new in-memory engine with the well-known shards.
pub fn create_memory_storage() -> DynMemoryStorage {
    std::sync::Arc::new(InMemoryStorage::new())
}
