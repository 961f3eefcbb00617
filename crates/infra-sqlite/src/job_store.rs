// SQLite JobStore Implementation

use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::str::FromStr;
use vidforge_core::domain::{
    Job, JobError, JobId, JobKind, JobStatus, OwnerId, ProgressMeta, QueueMode, Scope,
};
use vidforge_core::error::{AppError, Result};
use vidforge_core::port::{JobQuery, JobStore, KindUsage, StatusCounts};

// Convert sqlx::Error to AppError, keeping the SQLite result code visible
fn map_sqlx_error(err: sqlx::Error) -> AppError {
    match &err {
        sqlx::Error::Database(db_err) => match db_err.code() {
            // SQLite result codes: https://www.sqlite.org/rescode.html
            Some(code) => match code.as_ref() {
                "2067" | "1555" => AppError::Database(format!(
                    "Unique constraint violation: {} ({})",
                    db_err.message(),
                    code
                )),
                "5" => AppError::Database(format!(
                    "Database locked (SQLITE_BUSY): {}",
                    db_err.message()
                )),
                "13" => AppError::Database(format!("Database full: {}", db_err.message())),
                other => AppError::Database(format!(
                    "Database error [{}]: {}",
                    other,
                    db_err.message()
                )),
            },
            None => AppError::Database(format!("Database error: {}", db_err.message())),
        },
        sqlx::Error::RowNotFound => AppError::Database("Row not found".to_string()),
        sqlx::Error::ColumnNotFound(col) => {
            AppError::Database(format!("Column not found: {}", col))
        }
        _ => AppError::Database(err.to_string()),
    }
}

fn corrupt(column: &str, detail: impl std::fmt::Display) -> AppError {
    AppError::Database(format!("corrupt {} column: {}", column, detail))
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    kind: String,
    owner_id: Option<i64>,
    status: String,
    progress_percent: i64,
    progress_meta: String,
    payload: String,
    result: Option<String>,
    error: Option<String>,
    attempts: i64,
    max_attempts: i64,
    stall_count: i64,
    backend: String,
    correlation_token: Option<String>,
    created_at: i64,
    started_at: Option<i64>,
    heartbeat_at: Option<i64>,
    available_at: i64,
    finished_at: Option<i64>,
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        let kind = JobKind::from_str(&self.kind)?;
        let status = JobStatus::from_str(&self.status)?;
        let backend = QueueMode::from_str(&self.backend)?;
        let payload = serde_json::from_str(&self.payload).map_err(|e| corrupt("payload", e))?;
        let progress_meta: ProgressMeta =
            serde_json::from_str(&self.progress_meta).map_err(|e| corrupt("progress_meta", e))?;
        let result = self
            .result
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| corrupt("result", e))?;
        let error: Option<JobError> = self
            .error
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| corrupt("error", e))?;

        Ok(Job {
            id: self.id,
            kind,
            owner_id: self.owner_id,
            status,
            progress_percent: self.progress_percent.clamp(0, 100) as u8,
            progress_meta,
            payload,
            result,
            error,
            attempts: self.attempts.max(0) as u32,
            max_attempts: self.max_attempts.max(1) as u32,
            stall_count: self.stall_count.max(0) as u32,
            backend,
            correlation_token: self.correlation_token,
            created_at: self.created_at,
            started_at: self.started_at,
            heartbeat_at: self.heartbeat_at,
            available_at: self.available_at,
            finished_at: self.finished_at,
        })
    }
}

fn rows_into_jobs(rows: Vec<JobRow>) -> Result<Vec<Job>> {
    rows.into_iter().map(JobRow::into_job).collect()
}

fn push_scope(builder: &mut QueryBuilder<'_, Sqlite>, scope: &Scope) {
    if let Scope::Owner(owner) = scope {
        builder.push(" AND owner_id = ").push_bind(*owner);
    }
}

pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert(&self, job: &Job) -> Result<()> {
        let payload = serde_json::to_string(&job.payload)?;
        let progress_meta = serde_json::to_string(&job.progress_meta)?;
        let result = job.result.as_ref().map(serde_json::to_string).transpose()?;
        let error = job.error.as_ref().map(serde_json::to_string).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, kind, owner_id, status, progress_percent, progress_meta,
                payload, result, error, error_kind, attempts, max_attempts,
                stall_count, backend, correlation_token, created_at, started_at,
                heartbeat_at, available_at, finished_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(job.kind.as_str())
        .bind(job.owner_id)
        .bind(job.status.as_str())
        .bind(job.progress_percent as i64)
        .bind(progress_meta)
        .bind(payload)
        .bind(result)
        .bind(error)
        .bind(job.error.as_ref().map(|e| e.kind.as_str()))
        .bind(job.attempts as i64)
        .bind(job.max_attempts as i64)
        .bind(job.stall_count as i64)
        .bind(job.backend.as_str())
        .bind(&job.correlation_token)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.heartbeat_at)
        .bind(job.available_at)
        .bind(job.finished_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>> {
        sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?
            .map(JobRow::into_job)
            .transpose()
    }

    async fn claim(&self, id: &JobId, now_millis: i64) -> Result<Option<Job>> {
        sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET status = 'active',
                attempts = attempts + 1,
                started_at = ?,
                heartbeat_at = ?,
                progress_percent = 0,
                progress_meta = '{}'
            WHERE id = ? AND status = 'pending' AND available_at <= ?
            RETURNING *
            "#,
        )
        .bind(now_millis)
        .bind(now_millis)
        .bind(id)
        .bind(now_millis)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?
        .map(JobRow::into_job)
        .transpose()
    }

    async fn heartbeat(&self, id: &JobId, attempt: u32, now_millis: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET heartbeat_at = ? WHERE id = ? AND status = 'active' AND attempts = ?",
        )
        .bind(now_millis)
        .bind(id)
        .bind(attempt as i64)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_progress(
        &self,
        id: &JobId,
        attempt: u32,
        percent: u8,
        meta: &ProgressMeta,
        now_millis: i64,
    ) -> Result<Option<u8>> {
        let meta = serde_json::to_string(meta)?;
        let stored: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE jobs
            SET progress_percent = MAX(progress_percent, ?),
                progress_meta = ?,
                heartbeat_at = ?
            WHERE id = ? AND status = 'active' AND attempts = ?
            RETURNING progress_percent
            "#,
        )
        .bind(percent.min(100) as i64)
        .bind(meta)
        .bind(now_millis)
        .bind(id)
        .bind(attempt as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(stored.map(|p| p.clamp(0, 100) as u8))
    }

    async fn complete(
        &self,
        id: &JobId,
        attempt: u32,
        result: &serde_json::Value,
        now_millis: i64,
    ) -> Result<bool> {
        let result = serde_json::to_string(result)?;
        let outcome = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed',
                progress_percent = 100,
                result = ?,
                error = NULL,
                error_kind = NULL,
                finished_at = ?
            WHERE id = ? AND status = 'active' AND attempts = ?
            "#,
        )
        .bind(result)
        .bind(now_millis)
        .bind(id)
        .bind(attempt as i64)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(outcome.rows_affected() > 0)
    }

    async fn fail(
        &self,
        id: &JobId,
        attempt: u32,
        error: &JobError,
        now_millis: i64,
    ) -> Result<bool> {
        let encoded = serde_json::to_string(error)?;
        let outcome = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                error = ?,
                error_kind = ?,
                finished_at = ?
            WHERE id = ? AND status = 'active' AND attempts = ?
            "#,
        )
        .bind(encoded)
        .bind(error.kind.as_str())
        .bind(now_millis)
        .bind(id)
        .bind(attempt as i64)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(outcome.rows_affected() > 0)
    }

    async fn abandon_pending(
        &self,
        id: &JobId,
        attempt: u32,
        error: &JobError,
        now_millis: i64,
    ) -> Result<bool> {
        let encoded = serde_json::to_string(error)?;
        let outcome = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                error = ?,
                error_kind = ?,
                finished_at = ?
            WHERE id = ? AND status = 'pending' AND attempts = ?
            "#,
        )
        .bind(encoded)
        .bind(error.kind.as_str())
        .bind(now_millis)
        .bind(id)
        .bind(attempt as i64)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(outcome.rows_affected() > 0)
    }

    async fn release_for_retry(
        &self,
        id: &JobId,
        attempt: u32,
        available_at: i64,
    ) -> Result<bool> {
        let outcome = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                available_at = ?,
                heartbeat_at = NULL
            WHERE id = ? AND status = 'active' AND attempts = ?
            "#,
        )
        .bind(available_at)
        .bind(id)
        .bind(attempt as i64)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(outcome.rows_affected() > 0)
    }

    async fn requeue_stalled(&self, id: &JobId, attempt: u32, now_millis: i64) -> Result<bool> {
        let outcome = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                stall_count = stall_count + 1,
                available_at = ?,
                heartbeat_at = NULL
            WHERE id = ? AND status = 'active' AND attempts = ?
            "#,
        )
        .bind(now_millis)
        .bind(id)
        .bind(attempt as i64)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(outcome.rows_affected() > 0)
    }

    async fn reset_failed(
        &self,
        id: &JobId,
        max_attempts: u32,
        available_at: i64,
    ) -> Result<Option<Job>> {
        sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET status = 'pending',
                max_attempts = ?,
                stall_count = 0,
                available_at = ?,
                error = NULL,
                error_kind = NULL,
                result = NULL,
                finished_at = NULL,
                heartbeat_at = NULL
            WHERE id = ? AND status = 'failed'
            RETURNING *
            "#,
        )
        .bind(max_attempts as i64)
        .bind(available_at)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?
        .map(JobRow::into_job)
        .transpose()
    }

    async fn remove(&self, id: &JobId) -> Result<bool> {
        let outcome = sqlx::query("DELETE FROM jobs WHERE id = ? AND status != 'active'")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(outcome.rows_affected() > 0)
    }

    async fn list(&self, query: &JobQuery) -> Result<Vec<Job>> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM jobs WHERE 1 = 1");
        if let Some(kind) = query.kind {
            builder.push(" AND kind = ").push_bind(kind.as_str());
        }
        if let Some(status) = query.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        push_scope(&mut builder, &query.scope);
        builder.push(" ORDER BY created_at DESC, id DESC");
        if let Some(limit) = query.limit {
            builder.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = builder
            .build_query_as::<JobRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows_into_jobs(rows)
    }

    async fn count_by_status(&self, kind: Option<JobKind>, scope: &Scope) -> Result<StatusCounts> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT status, COUNT(*) FROM jobs WHERE 1 = 1");
        if let Some(kind) = kind {
            builder.push(" AND kind = ").push_bind(kind.as_str());
        }
        push_scope(&mut builder, scope);
        builder.push(" GROUP BY status");

        let rows: Vec<(String, i64)> = builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            counts.add(JobStatus::from_str(&status)?, count.max(0) as u64);
        }
        Ok(counts)
    }

    async fn find_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE status = ? ORDER BY created_at ASC",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        rows_into_jobs(rows)
    }

    async fn find_stalled(&self, heartbeat_before: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT * FROM jobs
            WHERE status = 'active'
              AND COALESCE(heartbeat_at, started_at, 0) < ?
            ORDER BY started_at ASC
            "#,
        )
        .bind(heartbeat_before)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        rows_into_jobs(rows)
    }

    async fn increment_usage(&self, owner_id: OwnerId, kind: JobKind) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO owner_usage (owner_id, kind, submitted) VALUES (?, ?, 1)
            ON CONFLICT (owner_id, kind) DO UPDATE SET submitted = submitted + 1
            "#,
        )
        .bind(owner_id)
        .bind(kind.as_str())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn usage(&self, owner_id: OwnerId) -> Result<Vec<KindUsage>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT kind, submitted FROM owner_usage WHERE owner_id = ? ORDER BY kind",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter()
            .map(|(kind, submitted)| {
                Ok(KindUsage {
                    kind: JobKind::from_str(&kind)?,
                    submitted: submitted.max(0) as u64,
                })
            })
            .collect()
    }
}
