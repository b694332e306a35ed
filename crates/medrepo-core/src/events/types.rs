//! Change events published after a write commits.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::shard::ShardId;

/// Kind of change a committed write made to a lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// First version of a lineage was written
    Created,
    /// A new version replaced the current one
    Updated,
    /// A tombstone version was written
    Deleted,
}

impl ChangeKind {
    /// Returns the string representation of the change kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Updated => "updated",
            ChangeKind::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Event describing one committed mutation of a resource lineage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Tenant the write was made for (`None` for platform-scoped records)
    pub tenant: Option<String>,
    /// Shard the lineage lives on
    pub shard: ShardId,
    pub resource_type: String,
    pub resource_id: String,
    /// Version written by this change
    pub version_id: u64,
    pub change_kind: ChangeKind,
    /// Resource content; for deletes, the last live content of the lineage
    pub resource: Option<serde_json::Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl ChangeEvent {
    /// Create a new change event.
    pub fn new(
        change_kind: ChangeKind,
        shard: ShardId,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        version_id: u64,
    ) -> Self {
        Self {
            tenant: None,
            shard,
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            version_id,
            change_kind,
            resource: None,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn with_tenant(mut self, tenant: Option<String>) -> Self {
        self.tenant = tenant;
        self
    }

    pub fn with_resource(mut self, resource: Option<serde_json::Value>) -> Self {
        self.resource = resource;
        self
    }

    /// `Type/id` key of the lineage this event belongs to.
    pub fn lineage(&self) -> String {
        format!("{}/{}", self.resource_type, self.resource_id)
    }

    /// Check if this event matches a filter by resource type.
    pub fn matches_type(&self, filter_type: Option<&str>) -> bool {
        match filter_type {
            Some(t) => self.resource_type == t,
            None => true,
        }
    }
}
