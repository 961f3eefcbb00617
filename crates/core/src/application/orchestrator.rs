// Job Orchestrator - single entry point for submissions and reads
use crate::application::access::SessionRegistry;
use crate::application::backend::{NewJob, QueueBackend};
use crate::application::mode::ModeState;
use crate::domain::{Job, JobId, JobKind, JobPayload, JobStatus, OwnerId, Principal, QueueMode};
use crate::error::{AppError, Result};
use crate::port::{JobStore, KindUsage, StatusCounts};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobListing {
    pub waiting: Vec<Job>,
    pub active: Vec<Job>,
    pub completed: Vec<Job>,
    pub failed: Vec<Job>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
}

impl From<StatusCounts> for JobStats {
    fn from(counts: StatusCounts) -> Self {
        Self {
            waiting: counts.waiting,
            active: counts.active,
            completed: counts.completed,
            failed: counts.failed,
            total: counts.total(),
        }
    }
}

/// Routes submissions to the backend of the current mode and applies the
/// principal's scope to every read. Reads keep going through the broker
/// backend after a degradation so broker jobs stay visible.
pub struct JobOrchestrator {
    mode: Arc<ModeState>,
    broker: Option<Arc<dyn QueueBackend>>,
    inline: Arc<dyn QueueBackend>,
    store: Arc<dyn JobStore>,
    sessions: Arc<SessionRegistry>,
}

impl JobOrchestrator {
    pub fn new(
        mode: Arc<ModeState>,
        broker: Option<Arc<dyn QueueBackend>>,
        inline: Arc<dyn QueueBackend>,
        store: Arc<dyn JobStore>,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            mode,
            broker,
            inline,
            store,
            sessions,
        }
    }

    pub fn mode(&self) -> QueueMode {
        self.mode.current()
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Backend that answers reads: the broker one whenever this process
    /// started with a broker, since its jobs outlive a degradation
    fn reader(&self) -> &Arc<dyn QueueBackend> {
        self.broker.as_ref().unwrap_or(&self.inline)
    }

    /// Submit a job for `owner_id`. A broker that fails mid-submission
    /// degrades the mode and the job runs inline instead; the caller never
    /// sees a transient broker error.
    pub async fn submit(&self, payload: JobPayload, owner_id: Option<OwnerId>) -> Result<Job> {
        payload.validate()?;
        let kind = payload.kind();
        let new_job = NewJob { owner_id, payload };

        let job = match (&self.broker, self.mode.current()) {
            (Some(broker), QueueMode::Broker) => match broker.submit(new_job.clone()).await {
                Ok(job) => job,
                Err(e) if e.is_broker() => {
                    self.mode.degrade(&e.to_string());
                    info!(kind = %kind, "Broker submission failed, running job inline");
                    self.inline.submit(new_job).await?
                }
                Err(e) => return Err(e),
            },
            _ => self.inline.submit(new_job).await?,
        };

        if let Some(owner) = owner_id {
            if let Err(e) = self.store.increment_usage(owner, kind).await {
                warn!(owner_id = %owner, kind = %kind, error = %e, "Failed to count submission");
            }
        }
        Ok(job)
    }

    /// Status of a job the principal may see. A kind mismatch reads as missing.
    pub async fn get_status(
        &self,
        id: &JobId,
        kind: Option<JobKind>,
        principal: &Principal,
    ) -> Result<Option<Job>> {
        let job = self.reader().get_status(id).await?;
        Ok(job.filter(|job| {
            principal.scope().permits(job.owner_id) && kind.map_or(true, |k| k == job.kind)
        }))
    }

    pub async fn list_jobs(&self, kind: Option<JobKind>, principal: &Principal) -> Result<JobListing> {
        let backend = self.reader();
        let scope = principal.scope();
        Ok(JobListing {
            waiting: backend.list(kind, JobStatus::Pending, scope).await?,
            active: backend.list(kind, JobStatus::Active, scope).await?,
            completed: backend.list(kind, JobStatus::Completed, scope).await?,
            failed: backend.list(kind, JobStatus::Failed, scope).await?,
        })
    }

    pub async fn stats(&self, kind: Option<JobKind>, principal: &Principal) -> Result<JobStats> {
        let counts = self.reader().stats(kind, principal.scope()).await?;
        Ok(counts.into())
    }

    pub async fn retry(&self, id: &JobId, principal: &Principal) -> Result<Job> {
        let job = self.visible_job(id, principal).await?;
        if job.backend == QueueMode::Inline {
            return Err(AppError::Unsupported(format!(
                "job {} ran inline and cannot be retried",
                id
            )));
        }
        let Some(broker) = &self.broker else {
            return self.inline.retry(id).await;
        };
        match broker.retry(id).await {
            Err(e) if e.is_broker() => {
                self.mode.degrade(&e.to_string());
                Err(e)
            }
            other => other,
        }
    }

    pub async fn remove(&self, id: &JobId, principal: &Principal) -> Result<()> {
        self.visible_job(id, principal).await?;
        self.reader().remove(id).await
    }

    /// Submission counters for the principal's own user id
    pub async fn usage(&self, principal: &Principal) -> Result<Vec<KindUsage>> {
        self.store.usage(principal.user_id).await
    }

    async fn visible_job(&self, id: &JobId, principal: &Principal) -> Result<Job> {
        self.store
            .find_by_id(id)
            .await?
            .filter(|job| principal.scope().permits(job.owner_id))
            .ok_or_else(|| AppError::NotFound(format!("job {}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::backend::{BrokerBackend, InlineBackend};
    use crate::application::lifecycle::{LifecycleController, StallConfig};
    use crate::application::retry::RetryPolicy;
    use crate::domain::{DomainError, DownloadPayload, JobError, ParsePayload};
    use crate::port::broker::mocks::InMemoryBroker;
    use crate::port::id_provider::{InlineIdProvider, UuidProvider};
    use crate::port::job_store::mocks::InMemoryJobStore;
    use crate::port::notifier::NoopNotifier;
    use crate::port::time_provider::mocks::ManualClock;
    use crate::port::worker_runner::mocks::ScriptedRunner;
    use crate::port::TimeProvider;
    use serde_json::json;

    struct Fixture {
        store: Arc<InMemoryJobStore>,
        broker: Arc<InMemoryBroker>,
        runner: Arc<ScriptedRunner>,
        mode: Arc<ModeState>,
        orchestrator: JobOrchestrator,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryJobStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let runner = Arc::new(ScriptedRunner::succeeding(json!({"file_path": "/out/a.mp4"})));
        let clock: Arc<dyn TimeProvider> = Arc::new(ManualClock::new(1_000_000));
        let mode = Arc::new(ModeState::new(QueueMode::Broker));
        let retry_policy = Arc::new(RetryPolicy::default());

        let lifecycle = Arc::new(LifecycleController::new(
            store.clone(),
            broker.clone(),
            Arc::clone(&retry_policy),
            Arc::new(NoopNotifier),
            Arc::clone(&clock),
            Arc::clone(&mode),
            StallConfig::default(),
        ));
        let broker_backend: Arc<dyn QueueBackend> = Arc::new(BrokerBackend::new(
            broker.clone(),
            store.clone(),
            lifecycle,
            retry_policy,
            Arc::new(NoopNotifier),
            Arc::clone(&clock),
        ));
        let inline: Arc<dyn QueueBackend> = Arc::new(InlineBackend::new(
            store.clone(),
            runner.clone(),
            Arc::new(NoopNotifier),
            Arc::clone(&clock),
            Arc::new(InlineIdProvider::new(Arc::clone(&clock))),
        ));
        let orchestrator = JobOrchestrator::new(
            Arc::clone(&mode),
            Some(broker_backend),
            inline,
            store.clone(),
            Arc::new(SessionRegistry::new(Arc::new(UuidProvider))),
        );
        Fixture {
            store,
            broker,
            runner,
            mode,
            orchestrator,
        }
    }

    fn download() -> JobPayload {
        JobPayload::Download(DownloadPayload {
            video_id: "dQw4w9WgXcQ".to_string(),
            quality: Some("720p".to_string()),
            cookies_path: None,
        })
    }

    #[tokio::test]
    async fn test_broker_submit_enqueues_without_running() {
        let f = fixture();
        let job = f.orchestrator.submit(download(), Some(7)).await.unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.backend, QueueMode::Broker);
        assert_eq!(f.broker.queued(JobKind::Download), 1);
        assert_eq!(f.runner.call_count(), 0);
    }

    #[tokio::test]
    async fn test_broker_failure_on_submit_degrades_and_runs_inline() {
        let f = fixture();
        f.broker.set_available(false);

        let job = f.orchestrator.submit(download(), Some(7)).await.unwrap();
        assert_eq!(job.backend, QueueMode::Inline);
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(json!({"file_path": "/out/a.mp4"})));
        assert_eq!(f.runner.call_count(), 1);
        assert_eq!(f.orchestrator.mode(), QueueMode::Inline);

        // Later submissions skip the broker entirely
        f.broker.set_available(true);
        let next = f.orchestrator.submit(download(), Some(7)).await.unwrap();
        assert_eq!(next.backend, QueueMode::Inline);
        assert_eq!(f.broker.queued(JobKind::Download), 0);

        let usage = f.orchestrator.usage(&Principal::user(7)).await.unwrap();
        assert_eq!(usage[0].submitted, 2);
    }

    #[tokio::test]
    async fn test_invalid_payload_is_rejected_before_any_backend() {
        let f = fixture();
        let payload = JobPayload::Parse(ParsePayload {
            video_id: "--exec".to_string(),
            languages: vec!["en".to_string()],
            cookies_path: None,
        });

        let err = f.orchestrator.submit(payload, Some(7)).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Domain(DomainError::ValidationError(_))
        ));
        assert_eq!(f.runner.call_count(), 0);
        assert!(f.store.usage(7).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_broker_jobs_stay_visible_after_degradation() {
        let f = fixture();
        let admin = Principal::elevated(0);
        let queued = f.orchestrator.submit(download(), Some(7)).await.unwrap();
        f.mode.degrade("connection reset");
        let ran_inline = f.orchestrator.submit(download(), Some(7)).await.unwrap();
        assert_eq!(ran_inline.status, JobStatus::Completed);

        let listing = f.orchestrator.list_jobs(None, &admin).await.unwrap();
        assert_eq!(listing.waiting.len(), 1);
        assert_eq!(listing.waiting[0].id, queued.id);
        assert_eq!(listing.completed.len(), 1);

        let stats = f.orchestrator.stats(None, &admin).await.unwrap();
        assert_eq!((stats.waiting, stats.completed, stats.total), (1, 1, 2));

        let status = f.orchestrator.get_status(&queued.id, None, &admin).await.unwrap();
        assert_eq!(status.map(|j| j.backend), Some(QueueMode::Broker));
    }

    #[tokio::test]
    async fn test_retry_of_broker_job_refused_after_degradation() {
        let f = fixture();
        let owner = Principal::user(7);
        let job = f.orchestrator.submit(download(), Some(7)).await.unwrap();
        let claimed = f.store.claim(&job.id, 1_000_000).await.unwrap().unwrap();
        f.store
            .fail(&job.id, claimed.attempts, &JobError::internal("boom"), 1_000_001)
            .await
            .unwrap();
        f.mode.degrade("connection reset");

        let err = f.orchestrator.retry(&job.id, &owner).await.unwrap_err();
        assert!(matches!(err, AppError::Unsupported(_)));
        let stored = f.store.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
    }
}
