//! Embedded migration steps.
//!
//! To add a step: add the SQL file under `migrations/`, a step function below,
//! and an entry at the end of [`POSTGRES_STEPS`]. Published steps are never
//! edited or reordered.

use futures_util::future::BoxFuture;
use medrepo_storage::{MigrationError, MigrationStep, StepKind};
use sqlx_core::executor::Executor;
use sqlx_core::raw_sql::raw_sql;
use sqlx_postgres::PgConnection;
use tracing::debug;

async fn apply(
    conn: &mut PgConnection,
    version: u32,
    name: &'static str,
    sql: &'static str,
) -> Result<(), MigrationError> {
    let result = (&mut *conn)
        .execute(raw_sql(sql))
        .await
        .map_err(|e| MigrationError::step(version, name, e))?;
    debug!(version, name, rows = result.rows_affected(), "Applied migration SQL");
    Ok(())
}

fn create_resource_tables(conn: &mut PgConnection) -> BoxFuture<'_, Result<(), MigrationError>> {
    Box::pin(apply(
        conn,
        1,
        "create_resource_tables",
        include_str!("../../migrations/0001_create_resource_tables.sql"),
    ))
}

fn create_search_index(conn: &mut PgConnection) -> BoxFuture<'_, Result<(), MigrationError>> {
    Box::pin(apply(
        conn,
        2,
        "create_search_index",
        include_str!("../../migrations/0002_create_search_index.sql"),
    ))
}

fn add_current_last_updated(conn: &mut PgConnection) -> BoxFuture<'_, Result<(), MigrationError>> {
    Box::pin(apply(
        conn,
        3,
        "add_current_last_updated",
        include_str!("../../migrations/0003_add_current_last_updated.sql"),
    ))
}

fn backfill_current_last_updated(
    conn: &mut PgConnection,
) -> BoxFuture<'_, Result<(), MigrationError>> {
    Box::pin(apply(
        conn,
        4,
        "backfill_current_last_updated",
        include_str!("../../migrations/0004_backfill_current_last_updated.sql"),
    ))
}

/// The PostgreSQL engine's migration table.
pub static POSTGRES_STEPS: &[MigrationStep<PgConnection>] = &[
    MigrationStep {
        version: 1,
        name: "create_resource_tables",
        kind: StepKind::Schema,
        run: create_resource_tables,
    },
    MigrationStep {
        version: 2,
        name: "create_search_index",
        kind: StepKind::Schema,
        run: create_search_index,
    },
    MigrationStep {
        version: 3,
        name: "add_current_last_updated",
        kind: StepKind::Schema,
        run: add_current_last_updated,
    },
    MigrationStep {
        version: 4,
        name: "backfill_current_last_updated",
        kind: StepKind::Data,
        run: backfill_current_last_updated,
    },
];
