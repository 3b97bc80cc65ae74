//! SQLite storage implementation.
//!
//! Provides persistent storage using SQLite database. Each record is stored
//! as a JSON body next to the columns needed for filtering and ordering.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection, Transaction};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use super::{Storage, StorageError};
use crate::core::execution::JobExecution;
use crate::core::job::{Job, JobFilter, JobStatus};
use crate::core::schedule::JobSchedule;
use crate::core::types::{ExecutionId, JobId};

/// SQLite storage backend.
///
/// Provides persistent storage with automatic schema migration.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage with the given database path.
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(other)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(other)?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Create an in-memory SQLite database (useful for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(other)?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(other)?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        let schema = include_str!("../../migrations/001_initial_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn begin(&self) -> Result<Transaction<'_, Sqlite>, StorageError> {
        self.pool.begin().await.map_err(other)
    }
}

fn other(e: sqlx::Error) -> StorageError {
    StorageError::Other(e.to_string())
}

fn decode<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, StorageError> {
    Ok(serde_json::from_str(body)?)
}

/// Compare-and-swap a job row. The stored body carries `version + 1`.
async fn update_job_row(conn: &mut SqliteConnection, job: &Job) -> Result<(), StorageError> {
    let mut next = job.clone();
    next.version += 1;
    let body = serde_json::to_string(&next)?;

    let result = sqlx::query(
        r#"
        UPDATE jobs SET name = ?, job_type = ?, status = ?, priority = ?, version = ?, body = ?
        WHERE id = ? AND version = ?
        "#,
    )
    .bind(&next.name)
    .bind(next.job_type.as_str())
    .bind(next.status.as_str())
    .bind(next.priority)
    .bind(next.version as i64)
    .bind(&body)
    .bind(job.id.to_string())
    .bind(job.version as i64)
    .execute(&mut *conn)
    .await
    .map_err(other)?;

    if result.rows_affected() == 0 {
        let current: Option<(i64,)> = sqlx::query_as("SELECT version FROM jobs WHERE id = ?")
            .bind(job.id.to_string())
            .fetch_optional(&mut *conn)
            .await
            .map_err(other)?;
        return Err(match current {
            None => StorageError::NotFound(format!("job: {}", job.id)),
            Some((found,)) => StorageError::VersionConflict(format!(
                "job {}: expected version {}, found {}",
                job.id, job.version, found
            )),
        });
    }
    Ok(())
}

async fn update_execution_row(
    conn: &mut SqliteConnection,
    execution: &JobExecution,
) -> Result<(), StorageError> {
    let mut next = execution.clone();
    next.version += 1;
    let body = serde_json::to_string(&next)?;

    let result = sqlx::query(
        "UPDATE executions SET status = ?, version = ?, body = ? WHERE id = ? AND version = ?",
    )
    .bind(next.status.as_str())
    .bind(next.version as i64)
    .bind(&body)
    .bind(execution.id.to_string())
    .bind(execution.version as i64)
    .execute(&mut *conn)
    .await
    .map_err(other)?;

    if result.rows_affected() == 0 {
        let current: Option<(i64,)> =
            sqlx::query_as("SELECT version FROM executions WHERE id = ?")
                .bind(execution.id.to_string())
                .fetch_optional(&mut *conn)
                .await
                .map_err(other)?;
        return Err(match current {
            None => StorageError::NotFound(format!("execution: {}", execution.id)),
            Some((found,)) => StorageError::VersionConflict(format!(
                "execution {}: expected version {}, found {}",
                execution.id, execution.version, found
            )),
        });
    }
    Ok(())
}

async fn insert_execution_row(
    conn: &mut SqliteConnection,
    execution: &JobExecution,
) -> Result<(), StorageError> {
    let body = serde_json::to_string(execution)?;
    let result = sqlx::query(
        r#"
        INSERT INTO executions (id, job_id, status, started_at, version, body)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(execution.id.to_string())
    .bind(execution.job_id.to_string())
    .bind(execution.status.as_str())
    .bind(execution.started_at.timestamp_millis())
    .bind(execution.version as i64)
    .bind(&body)
    .execute(&mut *conn)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(
            StorageError::DuplicateKey(format!("execution: {}", execution.id)),
        ),
        Err(e) => Err(other(e)),
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn insert_job(&self, job: Job) -> Result<(), StorageError> {
        let body = serde_json::to_string(&job)?;
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (id, name, job_type, status, priority, version, created_at, body)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.id.to_string())
        .bind(&job.name)
        .bind(job.job_type.as_str())
        .bind(job.status.as_str())
        .bind(job.priority)
        .bind(job.version as i64)
        .bind(job.created_at.timestamp_millis())
        .bind(&body)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StorageError::DuplicateKey(format!("job: {}", job.id)))
            }
            Err(e) => Err(other(e)),
        }
    }

    async fn get_job(&self, id: &JobId) -> Result<Job, StorageError> {
        let row: (String,) = sqlx::query_as("SELECT body FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(other)?
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))?;
        decode(&row.0)
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StorageError> {
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT body FROM jobs
            WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR job_type = ?2)
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?3
            "#,
        )
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.job_type.map(|t| t.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(other)?;

        rows.iter().map(|row| decode(&row.0)).collect()
    }

    async fn update_job(&self, job: &mut Job) -> Result<(), StorageError> {
        let mut conn = self.pool.acquire().await.map_err(other)?;
        update_job_row(&mut conn, job).await?;
        job.version += 1;
        Ok(())
    }

    async fn delete_job(&self, id: &JobId) -> Result<(), StorageError> {
        let mut tx = self.begin().await?;
        sqlx::query("DELETE FROM executions WHERE job_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(other)?;
        sqlx::query("DELETE FROM schedules WHERE job_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(other)?;
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(other)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("job: {}", id)));
        }
        tx.commit().await.map_err(other)
    }

    async fn count_jobs_by_status(&self) -> Result<HashMap<JobStatus, u64>, StorageError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(other)?;

        rows.into_iter()
            .map(|(status, count)| {
                let status = JobStatus::from_str(&status)
                    .map_err(|e| StorageError::SerializationError(e.to_string()))?;
                Ok((status, count as u64))
            })
            .collect()
    }

    async fn upsert_schedule(&self, schedule: JobSchedule) -> Result<(), StorageError> {
        let body = serde_json::to_string(&schedule)?;
        let result = sqlx::query(
            r#"
            INSERT INTO schedules (job_id, id, status, next_execution, version, created_at, body)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (job_id) DO UPDATE SET
                id = excluded.id,
                status = excluded.status,
                next_execution = excluded.next_execution,
                version = excluded.version,
                body = excluded.body
            "#,
        )
        .bind(schedule.job_id.to_string())
        .bind(schedule.id.to_string())
        .bind(schedule.status.as_str())
        .bind(schedule.next_execution.map(|t| t.timestamp_millis()))
        .bind(schedule.version as i64)
        .bind(schedule.created_at.timestamp_millis())
        .bind(&body)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_foreign_key_violation() => Err(
                StorageError::NotFound(format!("job: {}", schedule.job_id)),
            ),
            Err(e) => Err(other(e)),
        }
    }

    async fn update_schedule(&self, schedule: &mut JobSchedule) -> Result<(), StorageError> {
        let mut next = schedule.clone();
        next.version += 1;
        let body = serde_json::to_string(&next)?;

        let result = sqlx::query(
            r#"
            UPDATE schedules SET status = ?, next_execution = ?, version = ?, body = ?
            WHERE job_id = ? AND id = ? AND version = ?
            "#,
        )
        .bind(next.status.as_str())
        .bind(next.next_execution.map(|t| t.timestamp_millis()))
        .bind(next.version as i64)
        .bind(&body)
        .bind(schedule.job_id.to_string())
        .bind(schedule.id.to_string())
        .bind(schedule.version as i64)
        .execute(&self.pool)
        .await
        .map_err(other)?;

        if result.rows_affected() == 0 {
            let current: Option<(String, i64)> =
                sqlx::query_as("SELECT id, version FROM schedules WHERE job_id = ?")
                    .bind(schedule.job_id.to_string())
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(other)?;
            return Err(match current {
                None => StorageError::NotFound(format!("schedule for job: {}", schedule.job_id)),
                Some((id, found)) => StorageError::VersionConflict(format!(
                    "schedule {}: expected version {}, found {} (schedule {})",
                    schedule.id, schedule.version, found, id
                )),
            });
        }
        schedule.version += 1;
        Ok(())
    }

    async fn get_schedule(&self, job_id: &JobId) -> Result<JobSchedule, StorageError> {
        let row: (String,) = sqlx::query_as("SELECT body FROM schedules WHERE job_id = ?")
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(other)?
            .ok_or_else(|| StorageError::NotFound(format!("schedule for job: {}", job_id)))?;
        decode(&row.0)
    }

    async fn list_schedules(&self) -> Result<Vec<JobSchedule>, StorageError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT body FROM schedules ORDER BY created_at, rowid")
                .fetch_all(&self.pool)
                .await
                .map_err(other)?;
        rows.iter().map(|row| decode(&row.0)).collect()
    }

    async fn delete_schedule(&self, job_id: &JobId) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM schedules WHERE job_id = ?")
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(other)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!(
                "schedule for job: {}",
                job_id
            )));
        }
        Ok(())
    }

    async fn get_execution(&self, id: &ExecutionId) -> Result<JobExecution, StorageError> {
        let row: (String,) = sqlx::query_as("SELECT body FROM executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(other)?
            .ok_or_else(|| StorageError::NotFound(format!("execution: {}", id)))?;
        decode(&row.0)
    }

    async fn list_executions(
        &self,
        job_id: &JobId,
        limit: usize,
    ) -> Result<Vec<JobExecution>, StorageError> {
        let limit = i64::try_from(limit).unwrap_or(-1);
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT body FROM executions WHERE job_id = ? ORDER BY started_at DESC, rowid DESC LIMIT ?",
        )
        .bind(job_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(other)?;

        rows.iter().map(|row| decode(&row.0)).collect()
    }

    async fn record_dispatch(
        &self,
        job: &mut Job,
        execution: &mut JobExecution,
    ) -> Result<(), StorageError> {
        let mut tx = self.begin().await?;
        update_job_row(&mut tx, job).await?;
        insert_execution_row(&mut tx, execution).await?;
        tx.commit().await.map_err(other)?;
        job.version += 1;
        Ok(())
    }

    async fn record_outcome(
        &self,
        job: Option<&mut Job>,
        executions: &mut [JobExecution],
    ) -> Result<(), StorageError> {
        let mut tx = self.begin().await?;
        if let Some(job) = job.as_deref() {
            update_job_row(&mut tx, job).await?;
        }
        for execution in executions.iter() {
            update_execution_row(&mut tx, execution).await?;
        }
        tx.commit().await.map_err(other)?;

        if let Some(job) = job {
            job.version += 1;
        }
        for execution in executions.iter_mut() {
            execution.version += 1;
        }
        Ok(())
    }
}
