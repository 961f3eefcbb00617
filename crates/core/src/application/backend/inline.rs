// Inline queue backend: the submitting call runs the worker itself

use super::{list_from_store, remove_inactive, NewJob, QueueBackend};
use crate::application::sink::InlineProgressSink;
use crate::domain::{Job, JobError, JobId, JobKind, JobStatus, QueueMode, Scope};
use crate::error::{AppError, Result};
use crate::port::{
    IdProvider, JobEvent, JobNotifier, JobStore, StatusCounts, TimeProvider, WorkerRunner,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};

/// Jobs are stored once, already terminal; nothing is ever waiting or active
/// from the store's point of view.
pub struct InlineBackend {
    store: Arc<dyn JobStore>,
    runner: Arc<dyn WorkerRunner>,
    notifier: Arc<dyn JobNotifier>,
    time_provider: Arc<dyn TimeProvider>,
    ids: Arc<dyn IdProvider>,
}

impl InlineBackend {
    pub fn new(
        store: Arc<dyn JobStore>,
        runner: Arc<dyn WorkerRunner>,
        notifier: Arc<dyn JobNotifier>,
        time_provider: Arc<dyn TimeProvider>,
        ids: Arc<dyn IdProvider>,
    ) -> Self {
        Self {
            store,
            runner,
            notifier,
            time_provider,
            ids,
        }
    }
}

#[async_trait]
impl QueueBackend for InlineBackend {
    fn mode(&self) -> QueueMode {
        QueueMode::Inline
    }

    async fn submit(&self, new_job: NewJob) -> Result<Job> {
        let now = self.time_provider.now_millis();
        let mut job = Job::new(
            self.ids.generate_id(),
            now,
            new_job.owner_id,
            new_job.payload,
            QueueMode::Inline,
            1,
        );
        job.start(now)?;
        info!(job_id = %job.id, kind = %job.kind, "Running job inline");
        self.notifier.notify(JobEvent::snapshot(&job, now)).await;

        let sink = InlineProgressSink::new(
            job.clone(),
            Arc::clone(&self.notifier),
            Arc::clone(&self.time_provider),
        );
        let outcome = self.runner.run(&job, &sink).await;
        let mut job = sink.into_job();

        let finished_at = self.time_provider.now_millis();
        match outcome {
            Ok(output) => {
                job.complete(finished_at, output.result)?;
                info!(job_id = %job.id, duration_ms = %output.duration_ms, "Inline job completed");
            }
            Err(err) => {
                let error = JobError::from(err);
                error!(job_id = %job.id, error = %error, "Inline job failed");
                job.fail(finished_at, error)?;
            }
        }

        self.store.insert(&job).await?;
        self.notifier.notify(JobEvent::snapshot(&job, finished_at)).await;
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
        if !status.is_terminal() {
            return Ok(Vec::new());
        }
        list_from_store(self.store.as_ref(), kind, status, scope).await
    }

    async fn retry(&self, id: &JobId) -> Result<Job> {
        Err(AppError::Unsupported(format!(
            "retry of job {} is not available in inline mode",
            id
        )))
    }

    async fn remove(&self, id: &JobId) -> Result<()> {
        remove_inactive(self.store.as_ref(), id).await?;
        info!(job_id = %id, "Job removed");
        Ok(())
    }

    async fn stats(&self, kind: Option<JobKind>, scope: Scope) -> Result<StatusCounts> {
        let mut counts = self.store.count_by_status(kind, &scope).await?;
        counts.waiting = 0;
        counts.active = 0;
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DownloadPayload, JobErrorKind, JobPayload, ProgressUpdate};
    use crate::port::id_provider::InlineIdProvider;
    use crate::port::job_store::mocks::InMemoryJobStore;
    use crate::port::notifier::BroadcastNotifier;
    use crate::port::time_provider::mocks::ManualClock;
    use crate::port::worker_runner::mocks::ScriptedRunner;
    use crate::port::ExecutionError;
    use serde_json::json;

    fn backend(
        runner: Arc<ScriptedRunner>,
        store: Arc<InMemoryJobStore>,
        notifier: Arc<BroadcastNotifier>,
    ) -> InlineBackend {
        let clock: Arc<dyn TimeProvider> = Arc::new(ManualClock::new(1_000_000));
        InlineBackend::new(
            store,
            runner,
            notifier,
            Arc::clone(&clock),
            Arc::new(InlineIdProvider::new(clock)),
        )
    }

    fn new_job() -> NewJob {
        NewJob {
            owner_id: Some(7),
            payload: JobPayload::Download(DownloadPayload {
                video_id: "dQw4w9WgXcQ".to_string(),
                quality: None,
                cookies_path: None,
            }),
        }
    }

    #[tokio::test]
    async fn test_submit_runs_worker_and_stores_terminal_job() {
        let store = Arc::new(InMemoryJobStore::new());
        let notifier = Arc::new(BroadcastNotifier::new(16));
        let mut events = notifier.subscribe();
        let runner = Arc::new(
            ScriptedRunner::succeeding(json!({"file_path": "/out/a.mp4"})).with_updates(vec![
                ProgressUpdate::Transfer {
                    percent: 50,
                    speed: Some("1.2MiB/s".to_string()),
                    eta: None,
                },
            ]),
        );
        let inline = backend(runner.clone(), store.clone(), notifier);

        let job = inline.submit(new_job()).await.unwrap();
        assert_eq!(job.id, "inline-1000000-0");
        assert_eq!(job.backend, QueueMode::Inline);
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!((job.attempts, job.max_attempts), (1, 1));
        assert_eq!(job.progress_meta.speed.as_deref(), Some("1.2MiB/s"));
        assert_eq!(runner.call_count(), 1);
        assert_eq!(store.find_by_id(&job.id).await.unwrap(), Some(job.clone()));

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push((event.status, event.progress_percent));
        }
        assert_eq!(
            seen,
            vec![
                (JobStatus::Active, 0),
                (JobStatus::Active, 50),
                (JobStatus::Completed, 100)
            ]
        );
    }

    #[tokio::test]
    async fn test_submit_failure_is_final() {
        let store = Arc::new(InMemoryJobStore::new());
        let runner = Arc::new(ScriptedRunner::failing(ExecutionError::NonZeroExit {
            code: Some(2),
            stderr: "ERROR: Video unavailable".to_string(),
        }));
        let inline = backend(runner, store.clone(), Arc::new(BroadcastNotifier::new(4)));

        let job = inline.submit(new_job()).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        let error = job.error.clone().unwrap();
        assert_eq!(error.kind, JobErrorKind::NonZeroExit);
        assert_eq!(error.exit_code, Some(2));

        let err = inline.retry(&job.id).await.unwrap_err();
        assert!(matches!(err, AppError::Unsupported(_)));

        let stats = inline.stats(None, Scope::All).await.unwrap();
        assert_eq!((stats.waiting, stats.active, stats.failed), (0, 0, 1));
        assert!(inline
            .list(None, JobStatus::Pending, Scope::All)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_ids_stay_unique_within_one_millisecond() {
        let runner = Arc::new(ScriptedRunner::succeeding(json!({})));
        let inline = backend(
            runner,
            Arc::new(InMemoryJobStore::new()),
            Arc::new(BroadcastNotifier::new(4)),
        );

        let first = inline.submit(new_job()).await.unwrap();
        let second = inline.submit(new_job()).await.unwrap();
        assert_ne!(first.id, second.id);
        assert!(second.id.starts_with(InlineIdProvider::PREFIX));
    }
}
