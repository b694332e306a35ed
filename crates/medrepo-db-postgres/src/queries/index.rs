//! Search index rows.

use medrepo_search::{IndexValue, SearchIndexRow};
use serde_json::Value;
use sqlx_core::executor::Executor;
use sqlx_core::query::query;
use sqlx_core::query_as::query_as;
use sqlx_postgres::{PgConnection, Postgres};

use super::{from_version_id, to_version_id};
use crate::error::{PostgresError, Result};

/// `(resource_type, resource_id, version_id, param, value)`
type IndexRow = (String, String, i64, String, Value);

/// Replaces every index row of a lineage. Empty `rows` removes them all.
pub async fn replace_index_rows(
    conn: &mut PgConnection,
    resource_type: &str,
    id: &str,
    rows: &[SearchIndexRow],
) -> Result<()> {
    query("DELETE FROM search_index WHERE resource_type = $1 AND resource_id = $2")
        .bind(resource_type)
        .bind(id)
        .execute(&mut *conn)
        .await?;

    for (ordinal, row) in rows.iter().enumerate() {
        let value = serde_json::to_value(&row.value)
            .map_err(|e| PostgresError::corrupt(format!("index value: {e}")))?;
        query(
            "INSERT INTO search_index \
             (resource_type, resource_id, version_id, ordinal, param, kind, value) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&row.resource_type)
        .bind(&row.resource_id)
        .bind(from_version_id(row.version_id)?)
        .bind(i32::try_from(ordinal).unwrap_or(i32::MAX))
        .bind(&row.param)
        .bind(row.value.kind().as_str())
        .bind(value)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Index rows of one lineage, in extraction order.
pub async fn index_rows<'e, E>(
    executor: E,
    resource_type: &str,
    id: &str,
) -> Result<Vec<SearchIndexRow>>
where
    E: Executor<'e, Database = Postgres>,
{
    let rows: Vec<IndexRow> = query_as(
        "SELECT resource_type, resource_id, version_id, param, value FROM search_index \
         WHERE resource_type = $1 AND resource_id = $2 \
         ORDER BY ordinal",
    )
    .bind(resource_type)
    .bind(id)
    .fetch_all(executor)
    .await?;
    rows.into_iter().map(into_index_row).collect()
}

pub(crate) fn into_index_row(row: IndexRow) -> Result<SearchIndexRow> {
    let (resource_type, resource_id, version_id, param, value) = row;
    let value: IndexValue = serde_json::from_value(value)
        .map_err(|e| PostgresError::corrupt(format!("index value for {param}: {e}")))?;
    Ok(SearchIndexRow {
        resource_type,
        resource_id,
        version_id: to_version_id(version_id)?,
        param,
        value,
    })
}
