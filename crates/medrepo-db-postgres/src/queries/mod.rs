//! SQL query implementations for the PostgreSQL storage engine.
//!
//! Queries use unqualified table names; the pool pins `search_path` to the
//! shard schema.

pub mod crud;
pub mod directory;
pub mod history;
pub mod index;
pub mod search;

use chrono::{DateTime, Utc};
use medrepo_storage::StoredResource;
use serde_json::Value;
use time::OffsetDateTime;

use crate::error::{PostgresError, Result};

/// `(resource_type, id, version_id, last_updated, deleted, content)` as selected
/// from `resource_version`.
pub(crate) type VersionRow = (String, String, i64, DateTime<Utc>, bool, Option<Value>);

/// Column list matching [`VersionRow`].
pub(crate) const VERSION_COLUMNS: &str =
    "resource_type, id, version_id, last_updated, deleted, content";

/// Converts chrono DateTime to time OffsetDateTime.
pub(crate) fn chrono_to_time(dt: DateTime<Utc>) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(dt.timestamp()).unwrap_or(OffsetDateTime::UNIX_EPOCH)
        + time::Duration::nanoseconds(i64::from(dt.timestamp_subsec_nanos()))
}

/// Converts time OffsetDateTime to chrono DateTime (microsecond precision).
pub(crate) fn time_to_chrono(dt: OffsetDateTime) -> DateTime<Utc> {
    let micros = dt.unix_timestamp_nanos() / 1_000;
    DateTime::<Utc>::from_timestamp_micros(micros as i64).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

pub(crate) fn to_version_id(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| PostgresError::corrupt(format!("negative version {value}")))
}

pub(crate) fn from_version_id(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| PostgresError::corrupt(format!("version {value} out of range")))
}

pub(crate) fn into_stored(row: VersionRow) -> Result<StoredResource> {
    let (resource_type, id, version_id, last_updated, deleted, content) = row;
    Ok(StoredResource {
        resource_type,
        id,
        version_id: to_version_id(version_id)?,
        last_updated: chrono_to_time(last_updated),
        deleted,
        content: content.unwrap_or(Value::Null),
    })
}
