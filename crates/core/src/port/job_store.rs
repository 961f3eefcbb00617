// Job Store Port (Interface)
//
// Every mutation of an existing job is a compare-and-set on
// (id, status, attempts): a write made on behalf of an attempt that has
// since been requeued or finished affects nothing and reports `false`.

use crate::domain::{Job, JobError, JobId, JobKind, JobStatus, OwnerId, ProgressMeta, Scope};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Listing filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobQuery {
    pub kind: Option<JobKind>,
    pub status: Option<JobStatus>,
    pub scope: Scope,
    pub limit: Option<u32>,
}

impl JobQuery {
    pub fn new(scope: Scope) -> Self {
        Self {
            kind: None,
            status: None,
            scope,
            limit: None,
        }
    }

    pub fn kind(mut self, kind: Option<JobKind>) -> Self {
        self.kind = kind;
        self
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Per-status counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.waiting += count,
            JobStatus::Active => self.active += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.waiting + self.active + self.completed + self.failed
    }
}

/// Submissions per kind for one owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindUsage {
    pub kind: JobKind,
    pub submitted: u64,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: &Job) -> Result<()>;

    async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>>;

    /// pending -> active for a job whose backoff has elapsed.
    /// Increments `attempts`, resets progress. `None` when not claimable.
    async fn claim(&self, id: &JobId, now_millis: i64) -> Result<Option<Job>>;

    async fn heartbeat(&self, id: &JobId, attempt: u32, now_millis: i64) -> Result<bool>;

    /// Raise progress (never lowers it) and replace the metadata.
    /// Returns the stored percent, `None` if the attempt is no longer active.
    async fn record_progress(
        &self,
        id: &JobId,
        attempt: u32,
        percent: u8,
        meta: &ProgressMeta,
        now_millis: i64,
    ) -> Result<Option<u8>>;

    async fn complete(
        &self,
        id: &JobId,
        attempt: u32,
        result: &serde_json::Value,
        now_millis: i64,
    ) -> Result<bool>;

    async fn fail(&self, id: &JobId, attempt: u32, error: &JobError, now_millis: i64)
        -> Result<bool>;

    /// pending -> failed for a job no broker message will ever deliver
    async fn abandon_pending(
        &self,
        id: &JobId,
        attempt: u32,
        error: &JobError,
        now_millis: i64,
    ) -> Result<bool>;

    /// active -> pending after a failed attempt, claimable from `available_at`
    async fn release_for_retry(&self, id: &JobId, attempt: u32, available_at: i64)
        -> Result<bool>;

    /// active -> pending after a missed heartbeat, bumps `stall_count`
    async fn requeue_stalled(&self, id: &JobId, attempt: u32, now_millis: i64) -> Result<bool>;

    /// failed -> pending with a fresh attempt budget
    async fn reset_failed(
        &self,
        id: &JobId,
        max_attempts: u32,
        available_at: i64,
    ) -> Result<Option<Job>>;

    /// Delete a job that is not active. Returns false if it was active or missing.
    async fn remove(&self, id: &JobId) -> Result<bool>;

    async fn list(&self, query: &JobQuery) -> Result<Vec<Job>>;

    async fn count_by_status(&self, kind: Option<JobKind>, scope: &Scope) -> Result<StatusCounts>;

    async fn find_by_status(&self, status: JobStatus) -> Result<Vec<Job>>;

    /// Active jobs whose last heartbeat is older than the cutoff
    async fn find_stalled(&self, heartbeat_before: i64) -> Result<Vec<Job>>;

    async fn increment_usage(&self, owner_id: OwnerId, kind: JobKind) -> Result<()>;

    async fn usage(&self, owner_id: OwnerId) -> Result<Vec<KindUsage>>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::error::AppError;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Job store kept in a map, with the same compare-and-set rules as SQLite
    #[derive(Default)]
    pub struct InMemoryJobStore {
        jobs: Mutex<HashMap<JobId, Job>>,
        usage: Mutex<HashMap<(OwnerId, JobKind), u64>>,
    }

    impl InMemoryJobStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Apply `update` when the job is in `status` at `attempt`
        fn update_if<F>(&self, id: &JobId, status: JobStatus, attempt: Option<u32>, update: F) -> bool
        where
            F: FnOnce(&mut Job),
        {
            let mut jobs = self.jobs.lock().unwrap();
            match jobs.get_mut(id) {
                Some(job)
                    if job.status == status && attempt.map_or(true, |a| a == job.attempts) =>
                {
                    update(job);
                    true
                }
                _ => false,
            }
        }

        fn matching<F>(&self, filter: F) -> Vec<Job>
        where
            F: Fn(&Job) -> bool,
        {
            let jobs = self.jobs.lock().unwrap();
            jobs.values().filter(|job| filter(job)).cloned().collect()
        }
    }

    #[async_trait]
    impl JobStore for InMemoryJobStore {
        async fn insert(&self, job: &Job) -> Result<()> {
            let mut jobs = self.jobs.lock().unwrap();
            if jobs.contains_key(&job.id) {
                return Err(AppError::Database(format!(
                    "Unique constraint violation: jobs.id {}",
                    job.id
                )));
            }
            jobs.insert(job.id.clone(), job.clone());
            Ok(())
        }

        async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>> {
            Ok(self.jobs.lock().unwrap().get(id).cloned())
        }

        async fn claim(&self, id: &JobId, now_millis: i64) -> Result<Option<Job>> {
            let mut jobs = self.jobs.lock().unwrap();
            match jobs.get_mut(id) {
                Some(job) if job.status == JobStatus::Pending && job.available_at <= now_millis => {
                    job.start(now_millis)?;
                    Ok(Some(job.clone()))
                }
                _ => Ok(None),
            }
        }

        async fn heartbeat(&self, id: &JobId, attempt: u32, now_millis: i64) -> Result<bool> {
            Ok(self.update_if(id, JobStatus::Active, Some(attempt), |job| {
                job.heartbeat_at = Some(now_millis);
            }))
        }

        async fn record_progress(
            &self,
            id: &JobId,
            attempt: u32,
            percent: u8,
            meta: &ProgressMeta,
            now_millis: i64,
        ) -> Result<Option<u8>> {
            let mut stored = None;
            self.update_if(id, JobStatus::Active, Some(attempt), |job| {
                job.progress_percent = job.progress_percent.max(percent.min(100));
                job.progress_meta = meta.clone();
                job.heartbeat_at = Some(now_millis);
                stored = Some(job.progress_percent);
            });
            Ok(stored)
        }

        async fn complete(
            &self,
            id: &JobId,
            attempt: u32,
            result: &serde_json::Value,
            now_millis: i64,
        ) -> Result<bool> {
            Ok(self.update_if(id, JobStatus::Active, Some(attempt), |job| {
                job.status = JobStatus::Completed;
                job.progress_percent = 100;
                job.result = Some(result.clone());
                job.error = None;
                job.finished_at = Some(now_millis);
            }))
        }

        async fn fail(
            &self,
            id: &JobId,
            attempt: u32,
            error: &JobError,
            now_millis: i64,
        ) -> Result<bool> {
            Ok(self.update_if(id, JobStatus::Active, Some(attempt), |job| {
                job.status = JobStatus::Failed;
                job.error = Some(error.clone());
                job.finished_at = Some(now_millis);
            }))
        }

        async fn abandon_pending(
            &self,
            id: &JobId,
            attempt: u32,
            error: &JobError,
            now_millis: i64,
        ) -> Result<bool> {
            Ok(self.update_if(id, JobStatus::Pending, Some(attempt), |job| {
                job.status = JobStatus::Failed;
                job.error = Some(error.clone());
                job.finished_at = Some(now_millis);
            }))
        }

        async fn release_for_retry(
            &self,
            id: &JobId,
            attempt: u32,
            available_at: i64,
        ) -> Result<bool> {
            Ok(self.update_if(id, JobStatus::Active, Some(attempt), |job| {
                job.status = JobStatus::Pending;
                job.available_at = available_at;
                job.heartbeat_at = None;
            }))
        }

        async fn requeue_stalled(&self, id: &JobId, attempt: u32, now_millis: i64) -> Result<bool> {
            Ok(self.update_if(id, JobStatus::Active, Some(attempt), |job| {
                job.status = JobStatus::Pending;
                job.stall_count += 1;
                job.available_at = now_millis;
                job.heartbeat_at = None;
            }))
        }

        async fn reset_failed(
            &self,
            id: &JobId,
            max_attempts: u32,
            available_at: i64,
        ) -> Result<Option<Job>> {
            let mut reset = None;
            self.update_if(id, JobStatus::Failed, None, |job| {
                job.status = JobStatus::Pending;
                job.max_attempts = max_attempts;
                job.stall_count = 0;
                job.available_at = available_at;
                job.error = None;
                job.result = None;
                job.finished_at = None;
                job.heartbeat_at = None;
                reset = Some(job.clone());
            });
            Ok(reset)
        }

        async fn remove(&self, id: &JobId) -> Result<bool> {
            let mut jobs = self.jobs.lock().unwrap();
            match jobs.get(id) {
                Some(job) if job.status != JobStatus::Active => {
                    jobs.remove(id);
                    Ok(true)
                }
                _ => Ok(false),
            }
        }

        async fn list(&self, query: &JobQuery) -> Result<Vec<Job>> {
            let mut jobs = self.matching(|job| {
                query.kind.map_or(true, |k| k == job.kind)
                    && query.status.map_or(true, |s| s == job.status)
                    && query.scope.permits(job.owner_id)
            });
            jobs.sort_by(|a, b| (b.created_at, &b.id).cmp(&(a.created_at, &a.id)));
            if let Some(limit) = query.limit {
                jobs.truncate(limit as usize);
            }
            Ok(jobs)
        }

        async fn count_by_status(&self, kind: Option<JobKind>, scope: &Scope) -> Result<StatusCounts> {
            let mut counts = StatusCounts::default();
            for job in self.matching(|job| {
                kind.map_or(true, |k| k == job.kind) && scope.permits(job.owner_id)
            }) {
                counts.add(job.status, 1);
            }
            Ok(counts)
        }

        async fn find_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
            let mut jobs = self.matching(|job| job.status == status);
            jobs.sort_by_key(|job| job.created_at);
            Ok(jobs)
        }

        async fn find_stalled(&self, heartbeat_before: i64) -> Result<Vec<Job>> {
            let mut jobs = self.matching(|job| {
                job.status == JobStatus::Active
                    && job.heartbeat_at.or(job.started_at).unwrap_or(0) < heartbeat_before
            });
            jobs.sort_by_key(|job| job.started_at);
            Ok(jobs)
        }

        async fn increment_usage(&self, owner_id: OwnerId, kind: JobKind) -> Result<()> {
            *self.usage.lock().unwrap().entry((owner_id, kind)).or_insert(0) += 1;
            Ok(())
        }

        async fn usage(&self, owner_id: OwnerId) -> Result<Vec<KindUsage>> {
            let usage = self.usage.lock().unwrap();
            let mut rows: Vec<KindUsage> = usage
                .iter()
                .filter(|((owner, _), _)| *owner == owner_id)
                .map(|((_, kind), submitted)| KindUsage {
                    kind: *kind,
                    submitted: *submitted,
                })
                .collect();
            rows.sort_by_key(|row| row.kind.as_str());
            Ok(rows)
        }
    }
}
