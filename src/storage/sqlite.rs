//! SQLite storage implementation.
//!
//! Provides persistent storage using a SQLite database via sqlx.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::{FailureRecord, HttpMethod, JobPatch, JobRecord, Storage, StorageError};
use crate::core::types::{FailureId, JobId, UserId};

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
            .map_err(|e| StorageError::Other(e.to_string()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Create an in-memory SQLite database (useful for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

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

    async fn write_job(&self, job: &JobRecord, insert: bool) -> Result<(), StorageError> {
        let sql = if insert {
            r#"
            INSERT INTO jobs (id, user_id, time, time_zone, action_url, method, headers,
                              payload, failure_url, failure_logging, next_tick, failed,
                              created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#
        } else {
            r#"
            UPDATE jobs
            SET user_id = ?2, time = ?3, time_zone = ?4, action_url = ?5, method = ?6,
                headers = ?7, payload = ?8, failure_url = ?9, failure_logging = ?10,
                next_tick = ?11, failed = ?12, created_at = ?13, updated_at = ?14
            WHERE id = ?1
            "#
        };

        let headers = serde_json::to_string(&job.headers)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let payload = job
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        sqlx::query(sql)
            .bind(job.id.to_string())
            .bind(job.user_id.as_str())
            .bind(&job.time)
            .bind(&job.time_zone)
            .bind(&job.action_url)
            .bind(job.method.as_str())
            .bind(headers)
            .bind(payload)
            .bind(&job.failure_url)
            .bind(job.failure_logging)
            .bind(job.next_tick)
            .bind(job.failed)
            .bind(system_time_to_string(job.created_at))
            .bind(system_time_to_string(job.updated_at))
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;
        Ok(())
    }
}

// Helper functions for time conversion
fn system_time_to_string(time: SystemTime) -> String {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

fn string_to_system_time(s: &str) -> SystemTime {
    s.parse::<u128>()
        .ok()
        .map(|millis| UNIX_EPOCH + Duration::from_millis(millis as u64))
        .unwrap_or(UNIX_EPOCH)
}

fn row_to_job(row: &SqliteRow) -> Result<JobRecord, StorageError> {
    let id: String = row.get("id");
    let user_id: String = row.get("user_id");
    let method: String = row.get("method");
    let headers: String = row.get("headers");
    let payload: Option<String> = row.get("payload");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(JobRecord {
        id: JobId::parse(&id).map_err(|e| StorageError::Serialization(e.to_string()))?,
        user_id: UserId::new(user_id),
        time: row.get("time"),
        time_zone: row.get("time_zone"),
        action_url: row.get("action_url"),
        method: method
            .parse::<HttpMethod>()
            .map_err(StorageError::Serialization)?,
        headers: serde_json::from_str(&headers)
            .map_err(|e| StorageError::Serialization(e.to_string()))?,
        payload: payload
            .map(|p| serde_json::from_str(&p))
            .transpose()
            .map_err(|e| StorageError::Serialization(e.to_string()))?,
        failure_url: row.get("failure_url"),
        failure_logging: row.get("failure_logging"),
        next_tick: row.get("next_tick"),
        failed: row.get("failed"),
        created_at: string_to_system_time(&created_at),
        updated_at: string_to_system_time(&updated_at),
    })
}

fn row_to_failure(row: &SqliteRow) -> Result<FailureRecord, StorageError> {
    let id: String = row.get("id");
    let job_id: String = row.get("job_id");
    let user_id: String = row.get("user_id");
    let status_code: Option<i64> = row.get("status_code");
    let request_time: String = row.get("request_time");
    let duration: i64 = row.get("request_duration_ms");
    let job: String = row.get("job");
    let created_at: String = row.get("created_at");

    Ok(FailureRecord {
        id: FailureId::parse(&id).map_err(|e| StorageError::Serialization(e.to_string()))?,
        job_id: JobId::parse(&job_id).map_err(|e| StorageError::Serialization(e.to_string()))?,
        user_id: UserId::new(user_id),
        status_code: status_code.map(|c| c as u16),
        request_time: string_to_system_time(&request_time),
        request_duration_ms: duration as u64,
        job: serde_json::from_str(&job)
            .map_err(|e| StorageError::Serialization(e.to_string()))?,
        response: row.get("response"),
        error_message: row.get("error_message"),
        created_at: string_to_system_time(&created_at),
    })
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn insert_job(&self, job: JobRecord) -> Result<(), StorageError> {
        let existing = sqlx::query("SELECT id FROM jobs WHERE id = ?")
            .bind(job.id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;
        if existing.is_some() {
            return Err(StorageError::DuplicateKey(format!("job: {}", job.id)));
        }

        self.write_job(&job, true).await
    }

    async fn get_job(&self, id: &JobId) -> Result<JobRecord, StorageError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))?;

        row_to_job(&row)
    }

    async fn list_jobs(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<JobRecord>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE user_id = ? ORDER BY next_tick ASC LIMIT ? OFFSET ?",
        )
        .bind(user_id.as_str())
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        rows.iter().map(row_to_job).collect()
    }

    async fn count_jobs(&self, user_id: &UserId) -> Result<usize, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM jobs WHERE user_id = ?")
            .bind(user_id.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;
        let n: i64 = row.get("n");
        Ok(n as usize)
    }

    async fn update_job(&self, id: &JobId, patch: JobPatch) -> Result<JobRecord, StorageError> {
        let mut job = self.get_job(id).await?;
        patch.apply(&mut job);
        self.write_job(&job, false).await?;
        Ok(job)
    }

    async fn delete_job(&self, id: &JobId) -> Result<JobRecord, StorageError> {
        let job = self.get_job(id).await?;
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;
        Ok(job)
    }

    async fn find_due(&self, horizon_ms: i64) -> Result<Vec<JobRecord>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE failed = 0 AND next_tick <= ? ORDER BY next_tick ASC",
        )
        .bind(horizon_ms)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        rows.iter().map(row_to_job).collect()
    }

    async fn insert_failure(&self, record: FailureRecord) -> Result<(), StorageError> {
        let job = serde_json::to_string(&record.job)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO failures (id, job_id, user_id, status_code, request_time,
                                  request_duration_ms, job, response, error_message, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.job_id.to_string())
        .bind(record.user_id.as_str())
        .bind(record.status_code.map(|c| c as i64))
        .bind(system_time_to_string(record.request_time))
        .bind(record.request_duration_ms as i64)
        .bind(job)
        .bind(&record.response)
        .bind(&record.error_message)
        .bind(system_time_to_string(record.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;
        Ok(())
    }

    async fn list_failures(
        &self,
        user_id: &UserId,
        job_id: &JobId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<FailureRecord>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM failures WHERE user_id = ? AND job_id = ?
            ORDER BY created_at ASC LIMIT ? OFFSET ?
            "#,
        )
        .bind(user_id.as_str())
        .bind(job_id.to_string())
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        rows.iter().map(row_to_failure).collect()
    }

    async fn count_failures(
        &self,
        user_id: &UserId,
        job_id: &JobId,
    ) -> Result<usize, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM failures WHERE user_id = ? AND job_id = ?")
            .bind(user_id.as_str())
            .bind(job_id.to_string())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;
        let n: i64 = row.get("n");
        Ok(n as usize)
    }
}
