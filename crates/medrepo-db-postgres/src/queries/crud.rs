//! Version reads and writes.

use medrepo_storage::StoredResource;
use sqlx_core::executor::Executor;
use sqlx_core::query::query;
use sqlx_core::query_as::query_as;
use sqlx_postgres::{PgConnection, Postgres};

use super::{VERSION_COLUMNS, VersionRow, from_version_id, into_stored, time_to_chrono};
use crate::error::Result;

/// Reads the current version of a lineage.
pub async fn read_current<'e, E>(
    executor: E,
    resource_type: &str,
    id: &str,
) -> Result<Option<StoredResource>>
where
    E: Executor<'e, Database = Postgres>,
{
    let sql = "SELECT v.resource_type, v.id, v.version_id, v.last_updated, v.deleted, v.content \
               FROM resource_current c \
               JOIN resource_version v \
                 ON v.resource_type = c.resource_type AND v.id = c.id AND v.version_id = c.version_id \
               WHERE c.resource_type = $1 AND c.id = $2";
    let row: Option<VersionRow> = query_as(sql)
        .bind(resource_type)
        .bind(id)
        .fetch_optional(executor)
        .await?;
    row.map(into_stored).transpose()
}

/// Reads one version of a lineage, tombstones included.
pub async fn read_version<'e, E>(
    executor: E,
    resource_type: &str,
    id: &str,
    version_id: u64,
) -> Result<Option<StoredResource>>
where
    E: Executor<'e, Database = Postgres>,
{
    let sql = format!(
        "SELECT {VERSION_COLUMNS} FROM resource_version \
         WHERE resource_type = $1 AND id = $2 AND version_id = $3"
    );
    let row: Option<VersionRow> = query_as(&sql)
        .bind(resource_type)
        .bind(id)
        .bind(from_version_id(version_id)?)
        .fetch_optional(executor)
        .await?;
    row.map(into_stored).transpose()
}

/// Takes the lineage lock for the rest of the transaction and returns the
/// current version.
///
/// The advisory lock covers lineages that have no row yet; `FOR UPDATE` keeps
/// the current pointer stable against writers that bypass it.
pub async fn lock_current(
    conn: &mut PgConnection,
    shard: &str,
    resource_type: &str,
    id: &str,
) -> Result<Option<StoredResource>> {
    query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(format!("medrepo:lineage:{shard}/{resource_type}/{id}"))
        .execute(&mut *conn)
        .await?;

    let sql = "SELECT v.resource_type, v.id, v.version_id, v.last_updated, v.deleted, v.content \
               FROM resource_current c \
               JOIN resource_version v \
                 ON v.resource_type = c.resource_type AND v.id = c.id AND v.version_id = c.version_id \
               WHERE c.resource_type = $1 AND c.id = $2 \
               FOR UPDATE OF c";
    let row: Option<VersionRow> = query_as(sql)
        .bind(resource_type)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(into_stored).transpose()
}

/// Appends a version and moves the current pointer to it.
pub async fn insert_version(conn: &mut PgConnection, resource: &StoredResource) -> Result<()> {
    let version_id = from_version_id(resource.version_id)?;
    let last_updated = time_to_chrono(resource.last_updated);
    let content = (!resource.deleted).then(|| resource.content.clone());

    query(
        "INSERT INTO resource_version \
         (resource_type, id, version_id, last_updated, deleted, content) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(&resource.resource_type)
    .bind(&resource.id)
    .bind(version_id)
    .bind(last_updated)
    .bind(resource.deleted)
    .bind(content)
    .execute(&mut *conn)
    .await?;

    query(
        "INSERT INTO resource_current (resource_type, id, version_id, deleted, last_updated) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (resource_type, id) DO UPDATE \
         SET version_id = EXCLUDED.version_id, \
             deleted = EXCLUDED.deleted, \
             last_updated = EXCLUDED.last_updated",
    )
    .bind(&resource.resource_type)
    .bind(&resource.id)
    .bind(version_id)
    .bind(resource.deleted)
    .bind(last_updated)
    .execute(&mut *conn)
    .await?;

    Ok(())
}
