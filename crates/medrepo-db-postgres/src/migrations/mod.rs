//! Migration backend for the PostgreSQL storage engine.
//!
//! Steps are embedded SQL files applied through the shared migration runner.
//! Every step transaction first takes a transaction-scoped advisory lock keyed
//! by the shard, so runners on other nodes wait instead of racing; the lock is
//! released when the step commits or rolls back.

mod steps;

pub use steps::POSTGRES_STEPS;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use medrepo_core::ShardId;
use medrepo_storage::{
    AppliedState, MigrationBackend, MigrationError, MigrationRecord, MigrationTransaction,
};
use sqlx_core::executor::Executor;
use sqlx_core::query::query;
use sqlx_core::query_as::query_as;
use sqlx_core::query_scalar::query_scalar;
use sqlx_core::raw_sql::raw_sql;
use sqlx_postgres::{PgConnection, PgTransaction};
use tracing::{debug, instrument};

use crate::error::PostgresError;
use crate::queries::chrono_to_time;
use crate::storage::PostgresStorage;

/// Advisory lock key of a shard's migrations.
pub fn lock_key(shard: &ShardId) -> String {
    format!("medrepo:migrate:{shard}")
}

/// Migration backend over a [`PostgresStorage`].
#[derive(Debug, Clone)]
pub struct PostgresMigrations {
    storage: PostgresStorage,
}

impl PostgresMigrations {
    pub fn new(storage: PostgresStorage) -> Self {
        Self { storage }
    }

    async fn begin_locked(&self, shard: &ShardId) -> Result<PgTransaction<'static>, MigrationError> {
        let pool = &self
            .storage
            .shard_pool(shard)
            .map_err(MigrationError::backend)?
            .pool;
        let mut tx = pool.begin().await.map_err(PostgresError::from)?;
        query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(lock_key(shard))
            .execute(&mut *tx)
            .await
            .map_err(PostgresError::from)?;
        debug!(shard = %shard, "Migration lock acquired");
        Ok(tx)
    }

    /// Migration records of a shard, oldest first.
    pub async fn records(&self, shard: &ShardId) -> Result<Vec<MigrationRecord>, MigrationError> {
        let pool = &self
            .storage
            .shard_pool(shard)
            .map_err(MigrationError::backend)?
            .pool;
        let rows: Vec<(i32, DateTime<Utc>, bool)> = query_as(
            "SELECT version, applied_at, first_boot FROM migration_record \
             WHERE shard_id = $1 ORDER BY version",
        )
        .bind(shard.as_str())
        .fetch_all(pool)
        .await
        .map_err(PostgresError::from)?;

        rows.into_iter()
            .map(|(version, applied_at, first_boot)| {
                Ok(MigrationRecord {
                    shard: shard.clone(),
                    version: to_step_version(version)?,
                    applied_at: chrono_to_time(applied_at),
                    first_boot,
                })
            })
            .collect()
    }
}

fn to_step_version(version: i32) -> Result<u32, MigrationError> {
    u32::try_from(version)
        .map_err(|_| MigrationError::backend(format!("invalid recorded version {version}")))
}

#[async_trait]
impl MigrationBackend for PostgresMigrations {
    type Handle = PgConnection;
    type Tx = PostgresMigrationTransaction;

    #[instrument(skip(self), fields(shard = %shard))]
    async fn bootstrap(&self, shard: &ShardId) -> Result<(), MigrationError> {
        let schema = self
            .storage
            .shard_pool(shard)
            .map_err(MigrationError::backend)?
            .schema
            .clone();
        let mut tx = self.begin_locked(shard).await?;
        let sql = format!(
            "CREATE SCHEMA IF NOT EXISTS \"{schema}\";\n\
             CREATE TABLE IF NOT EXISTS \"{schema}\".migration_record (\n\
                 shard_id   TEXT NOT NULL,\n\
                 version    INTEGER NOT NULL,\n\
                 applied_at TIMESTAMPTZ NOT NULL DEFAULT now(),\n\
                 first_boot BOOLEAN NOT NULL DEFAULT FALSE,\n\
                 PRIMARY KEY (shard_id, version)\n\
             );"
        );
        (&mut *tx)
            .execute(raw_sql(&sql))
            .await
            .map_err(PostgresError::from)?;
        tx.commit().await.map_err(PostgresError::from)?;
        Ok(())
    }

    async fn begin(&self, shard: &ShardId) -> Result<Self::Tx, MigrationError> {
        let tx = self.begin_locked(shard).await?;
        Ok(PostgresMigrationTransaction {
            shard: shard.clone(),
            tx,
        })
    }
}

/// One migration step's transaction; holds the shard's advisory lock.
pub struct PostgresMigrationTransaction {
    shard: ShardId,
    tx: PgTransaction<'static>,
}

#[async_trait]
impl MigrationTransaction for PostgresMigrationTransaction {
    type Handle = PgConnection;

    async fn applied(&mut self) -> Result<AppliedState, MigrationError> {
        let version: Option<i32> =
            query_scalar("SELECT MAX(version) FROM migration_record WHERE shard_id = $1")
                .bind(self.shard.as_str())
                .fetch_one(&mut *self.tx)
                .await
                .map_err(PostgresError::from)?;
        Ok(AppliedState {
            version: version.map(to_step_version).transpose()?,
        })
    }

    fn handle(&mut self) -> &mut Self::Handle {
        &mut *self.tx
    }

    async fn record(&mut self, version: u32, first_boot: bool) -> Result<(), MigrationError> {
        let version = i32::try_from(version)
            .map_err(|_| MigrationError::backend(format!("version {version} out of range")))?;
        query("INSERT INTO migration_record (shard_id, version, first_boot) VALUES ($1, $2, $3)")
            .bind(self.shard.as_str())
            .bind(version)
            .bind(first_boot)
            .execute(&mut *self.tx)
            .await
            .map_err(PostgresError::from)?;
        Ok(())
    }

    async fn commit(self) -> Result<(), MigrationError> {
        self.tx.commit().await.map_err(PostgresError::from)?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), MigrationError> {
        self.tx.rollback().await.map_err(PostgresError::from)?;
        Ok(())
    }
}
