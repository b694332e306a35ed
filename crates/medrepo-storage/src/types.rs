//! Storage types for resources, shard assignments and migration records.

use medrepo_core::ShardId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// A stored resource version with its metadata.
///
/// A lineage is the ordered sequence of versions sharing `(resource_type, id)`.
/// Versions start at 1 and increase by exactly 1. A tombstone has
/// `deleted == true` and `content == Value::Null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResource {
    pub resource_type: String,
    pub id: String,
    pub version_id: u64,
    /// Write time of this version.
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
    pub deleted: bool,
    /// The resource JSON, stamped with `id` and `meta`.
    pub content: Value,
}

impl StoredResource {
    /// Builds a live version, stamping `id`, `meta.versionId` and
    /// `meta.lastUpdated` into the content.
    pub fn live(
        resource_type: impl Into<String>,
        id: impl Into<String>,
        version_id: u64,
        last_updated: OffsetDateTime,
        mut content: Value,
    ) -> Self {
        let resource_type = resource_type.into();
        let id = id.into();
        stamp_meta(&mut content, &resource_type, &id, version_id, last_updated);
        Self {
            resource_type,
            id,
            version_id,
            last_updated,
            deleted: false,
            content,
        }
    }

    pub fn tombstone(
        resource_type: impl Into<String>,
        id: impl Into<String>,
        version_id: u64,
        last_updated: OffsetDateTime,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            version_id,
            last_updated,
            deleted: true,
            content: Value::Null,
        }
    }

    /// `Type/id` key of the lineage.
    pub fn lineage(&self) -> String {
        format!("{}/{}", self.resource_type, self.id)
    }

    /// Weak ETag for this version, e.g. `W/"3"`.
    pub fn etag(&self) -> String {
        format!("W/\"{}\"", self.version_id)
    }
}

fn stamp_meta(
    content: &mut Value,
    resource_type: &str,
    id: &str,
    version_id: u64,
    last_updated: OffsetDateTime,
) {
    let Some(obj) = content.as_object_mut() else {
        return;
    };
    obj.insert("resourceType".into(), Value::String(resource_type.to_string()));
    obj.insert("id".into(), Value::String(id.to_string()));

    let meta = obj
        .entry("meta")
        .or_insert_with(|| Value::Object(Default::default()));
    if let Some(meta) = meta.as_object_mut() {
        meta.insert("versionId".into(), Value::String(version_id.to_string()));
        if let Ok(ts) = last_updated.format(&Rfc3339) {
            meta.insert("lastUpdated".into(), Value::String(ts));
        }
    }
}

/// Whether a tenant's data is settled on its shard or being relocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentState {
    Active,
    Moving,
}

impl AssignmentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Moving => "moving",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "moving" => Some(Self::Moving),
            _ => None,
        }
    }
}

/// Durable mapping of one tenant to its shard, kept on the global shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardAssignment {
    pub tenant_id: String,
    pub shard: ShardId,
    pub state: AssignmentState,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl ShardAssignment {
    pub fn active(tenant_id: impl Into<String>, shard: ShardId) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            shard,
            state: AssignmentState::Active,
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn with_state(mut self, state: AssignmentState) -> Self {
        self.state = state;
        self.updated_at = OffsetDateTime::now_utc();
        self
    }
}

/// One applied migration step, as persisted in a shard's record table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub shard: ShardId,
    pub version: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub applied_at: OffsetDateTime,
    /// Set when the step ran as part of the shard's first activation.
    pub first_boot: bool,
}

/// Summary of a shard's record table read under the migration lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppliedState {
    /// Highest recorded version, `None` when no step was ever recorded.
    pub version: Option<u32>,
}

impl AppliedState {
    pub fn from_records(records: &[MigrationRecord]) -> Self {
        Self {
            version: records.iter().map(|r| r.version).max(),
        }
    }

    pub fn current(&self) -> u32 {
        self.version.unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.version.is_none()
    }
}
