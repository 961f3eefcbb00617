// Broker-backed queue backend

use super::{list_from_store, remove_inactive, NewJob, QueueBackend};
use crate::application::lifecycle::LifecycleController;
use crate::application::retry::RetryPolicy;
use crate::domain::{Job, JobId, JobKind, JobStatus, QueueMode, Scope};
use crate::error::Result;
use crate::port::{Broker, JobEvent, JobNotifier, JobStore, StatusCounts, TimeProvider};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

pub struct BrokerBackend {
    broker: Arc<dyn Broker>,
    store: Arc<dyn JobStore>,
    lifecycle: Arc<LifecycleController>,
    retry_policy: Arc<RetryPolicy>,
    notifier: Arc<dyn JobNotifier>,
    time_provider: Arc<dyn TimeProvider>,
}

impl BrokerBackend {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn JobStore>,
        lifecycle: Arc<LifecycleController>,
        retry_policy: Arc<RetryPolicy>,
        notifier: Arc<dyn JobNotifier>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            broker,
            store,
            lifecycle,
            retry_policy,
            notifier,
            time_provider,
        }
    }
}

#[async_trait]
impl QueueBackend for BrokerBackend {
    fn mode(&self) -> QueueMode {
        QueueMode::Broker
    }

    async fn submit(&self, new_job: NewJob) -> Result<Job> {
        let kind = new_job.payload.kind();
        let id = self.broker.next_job_id().await?;
        let now = self.time_provider.now_millis();
        let job = Job::new(
            id,
            now,
            new_job.owner_id,
            new_job.payload,
            QueueMode::Broker,
            self.retry_policy.max_attempts(kind),
        );

        self.store.insert(&job).await?;
        if let Err(e) = self.broker.publish(kind, &job.id).await {
            // Never leave a pending row behind that no message points at
            if let Err(cleanup) = self.store.remove(&job.id).await {
                warn!(job_id = %job.id, error = %cleanup, "Failed to drop unpublished job");
            }
            return Err(e.into());
        }

        info!(
            job_id = %job.id,
            kind = %kind,
            owner_id = ?job.owner_id,
            "Job enqueued"
        );
        self.notifier.notify(JobEvent::snapshot(&job, now)).await;
        Ok(job)
    }

    async fn get_status(&self, id: &JobId) -> Result<Option<Job>> {
        self.store.find_by_id(id).await
    }

    async fn list(
        &self,
        kind: Option<JobKind>,
        status: JobStatus,
        scope: Scope,
    ) -> Result<Vec<Job>> {
        list_from_store(self.store.as_ref(), kind, status, scope).await
    }

    async fn retry(&self, id: &JobId) -> Result<Job> {
        self.lifecycle.retry_failed(id).await
    }

    async fn remove(&self, id: &JobId) -> Result<()> {
        remove_inactive(self.store.as_ref(), id).await?;
        info!(job_id = %id, "Job removed");
        Ok(())
    }

    async fn stats(&self, kind: Option<JobKind>, scope: Scope) -> Result<StatusCounts> {
        self.store.count_by_status(kind, &scope).await
    }
}
