//! History paging.

use medrepo_storage::StoredResource;
use sqlx_core::executor::Executor;
use sqlx_core::query_as::query_as;
use sqlx_postgres::Postgres;

use super::{VERSION_COLUMNS, VersionRow, from_version_id, into_stored};
use crate::error::Result;

/// Versions in `(after, up_to]`, oldest first, at most `limit`.
pub async fn history_page<'e, E>(
    executor: E,
    resource_type: &str,
    id: &str,
    after: u64,
    up_to: u64,
    limit: usize,
) -> Result<Vec<StoredResource>>
where
    E: Executor<'e, Database = Postgres>,
{
    let sql = format!(
        "SELECT {VERSION_COLUMNS} FROM resource_version \
         WHERE resource_type = $1 AND id = $2 AND version_id > $3 AND version_id <= $4 \
         ORDER BY version_id \
         LIMIT $5"
    );
    let rows: Vec<VersionRow> = query_as(&sql)
        .bind(resource_type)
        .bind(id)
        .bind(from_version_id(after)?)
        .bind(from_version_id(up_to)?)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(executor)
        .await?;
    rows.into_iter().map(into_stored).collect()
}
