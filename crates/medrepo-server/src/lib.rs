//! HTTP and WebSocket surface of the Medrepo resource repository.
//!
//! The binary loads [`AppConfig`], opens the configured storage engine,
//! activates every shard through the migration runner and then serves the
//! REST API, the subscription WebSocket channel and the operator endpoints.

pub mod admin;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod handlers;
pub mod observability;
pub mod server;
pub mod websocket;

pub use bootstrap::{Services, ShardActivator, build_services};
pub use config::{AppConfig, StorageBackend};
pub use error::{ApiError, ApiResult};
pub use observability::init_tracing;
pub use server::{AppState, MedrepoServer, ServerBuilder, build_app};
