//! Tenant shard assignments, stored on the global shard.

use chrono::{DateTime, Utc};
use medrepo_core::ShardId;
use medrepo_storage::{AssignmentState, ShardAssignment};
use sqlx_core::executor::Executor;
use sqlx_core::query::query;
use sqlx_core::query_as::query_as;
use sqlx_postgres::Postgres;

use super::{chrono_to_time, time_to_chrono};
use crate::error::{PostgresError, Result};

/// `(tenant_id, shard_id, state, updated_at)`
type AssignmentRow = (String, String, String, DateTime<Utc>);

pub async fn lookup<'e, E>(executor: E, tenant_id: &str) -> Result<Option<ShardAssignment>>
where
    E: Executor<'e, Database = Postgres>,
{
    let row: Option<AssignmentRow> = query_as(
        "SELECT tenant_id, shard_id, state, updated_at FROM shard_assignment WHERE tenant_id = $1",
    )
    .bind(tenant_id)
    .fetch_optional(executor)
    .await?;
    row.map(into_assignment).transpose()
}

pub async fn upsert<'e, E>(executor: E, assignment: &ShardAssignment) -> Result<()>
where
    E: Executor<'e, Database = Postgres>,
{
    query(
        "INSERT INTO shard_assignment (tenant_id, shard_id, state, updated_at) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (tenant_id) DO UPDATE \
         SET shard_id = EXCLUDED.shard_id, state = EXCLUDED.state, updated_at = EXCLUDED.updated_at",
    )
    .bind(&assignment.tenant_id)
    .bind(assignment.shard.as_str())
    .bind(assignment.state.as_str())
    .bind(time_to_chrono(assignment.updated_at))
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn list<'e, E>(executor: E) -> Result<Vec<ShardAssignment>>
where
    E: Executor<'e, Database = Postgres>,
{
    let rows: Vec<AssignmentRow> = query_as(
        "SELECT tenant_id, shard_id, state, updated_at FROM shard_assignment ORDER BY tenant_id",
    )
    .fetch_all(executor)
    .await?;
    rows.into_iter().map(into_assignment).collect()
}

fn into_assignment(row: AssignmentRow) -> Result<ShardAssignment> {
    let (tenant_id, shard_id, state, updated_at) = row;
    let shard = ShardId::new(&shard_id)
        .map_err(|e| PostgresError::corrupt(format!("assignment of {tenant_id}: {e}")))?;
    let state = AssignmentState::parse(&state).ok_or_else(|| {
        PostgresError::corrupt(format!("assignment of {tenant_id}: unknown state '{state}'"))
    })?;
    Ok(ShardAssignment {
        tenant_id,
        shard,
        state,
        updated_at: chrono_to_time(updated_at),
    })
}
