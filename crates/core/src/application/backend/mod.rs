// Queue backends: one interface, broker-backed and inline implementations

mod broker;
mod inline;

pub use broker::BrokerBackend;
pub use inline::InlineBackend;

use crate::application::worker::constants::LISTING_LIMIT;
use crate::domain::{Job, JobId, JobKind, JobPayload, JobStatus, OwnerId, QueueMode, Scope};
use crate::error::{AppError, Result};
use crate::port::{JobQuery, JobStore, StatusCounts};
use async_trait::async_trait;

/// Submission input
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub owner_id: Option<OwnerId>,
    pub payload: JobPayload,
}

#[async_trait]
pub trait QueueBackend: Send + Sync {
    fn mode(&self) -> QueueMode;

    /// Broker: returns the job `pending`. Inline: returns it terminal.
    async fn submit(&self, new_job: NewJob) -> Result<Job>;

    async fn get_status(&self, id: &JobId) -> Result<Option<Job>>;

    async fn list(&self, kind: Option<JobKind>, status: JobStatus, scope: Scope)
        -> Result<Vec<Job>>;

    /// Only valid on failed jobs
    async fn retry(&self, id: &JobId) -> Result<Job>;

    /// Only valid on jobs that are not active
    async fn remove(&self, id: &JobId) -> Result<()>;

    async fn stats(&self, kind: Option<JobKind>, scope: Scope) -> Result<StatusCounts>;
}

pub(crate) async fn list_from_store(
    store: &dyn JobStore,
    kind: Option<JobKind>,
    status: JobStatus,
    scope: Scope,
) -> Result<Vec<Job>> {
    let query = JobQuery::new(scope)
        .kind(kind)
        .status(status)
        .limit(LISTING_LIMIT);
    store.list(&query).await
}

pub(crate) async fn remove_inactive(store: &dyn JobStore, id: &JobId) -> Result<()> {
    let job = store
        .find_by_id(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("job {}", id)))?;
    if job.status == JobStatus::Active {
        return Err(AppError::Unsupported(format!(
            "job {} is active and cannot be removed",
            id
        )));
    }
    if !store.remove(id).await? {
        // Claimed (or removed) between the read and the delete
        return Err(AppError::Unsupported(format!(
            "job {} became active and cannot be removed",
            id
        )));
    }
    Ok(())
}
