pub mod error;
pub mod events;
pub mod id;
pub mod resource;
pub mod shard;

pub use error::{CoreError, Result};
pub use events::{ChangeEvent, ChangeEventSink, ChangeKind, EventBroadcaster, EventError};
pub use id::{generate_id, validate_id};
pub use resource::{ResourceScope, TypeDefinition, lookup_type, scope_of, validate_shape};
pub use shard::{ShardId, TenantContext};
