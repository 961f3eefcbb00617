// Lifecycle Controller: attempt outcomes, manual retry, stall detection and
// startup recovery for broker-backed jobs
use crate::application::mode::ModeState;
use crate::application::retry::{RetryDecision, RetryPolicy};
use crate::application::worker::constants::*;
use crate::application::worker::ShutdownToken;
use crate::domain::{Job, JobError, JobId, JobStatus, QueueMode};
use crate::error::{AppError, Result};
use crate::port::{
    Broker, ExecutionError, JobEvent, JobNotifier, JobStore, TimeProvider, WorkerOutput,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StallConfig {
    /// Active job without a heartbeat for this long is stalled
    pub window_ms: i64,
    pub check_interval_ms: u64,
    /// Requeues allowed before a stalled job is failed
    pub max_stall_retries: u32,
}

impl Default for StallConfig {
    fn default() -> Self {
        Self {
            window_ms: DEFAULT_STALL_WINDOW_MS,
            check_interval_ms: DEFAULT_STALL_CHECK_INTERVAL.as_millis() as u64,
            max_stall_retries: DEFAULT_MAX_STALL_RETRIES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Completed,
    RetryScheduled { delay_ms: i64 },
    Failed,
    /// The attempt was already requeued or finished elsewhere; nothing written
    Stale,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StallReport {
    pub requeued: usize,
    pub failed: usize,
}

pub struct LifecycleController {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn Broker>,
    retry_policy: Arc<RetryPolicy>,
    notifier: Arc<dyn JobNotifier>,
    time_provider: Arc<dyn TimeProvider>,
    mode: Arc<ModeState>,
    stall: StallConfig,
}

impl LifecycleController {
    pub fn new(
        store: Arc<dyn JobStore>,
        broker: Arc<dyn Broker>,
        retry_policy: Arc<RetryPolicy>,
        notifier: Arc<dyn JobNotifier>,
        time_provider: Arc<dyn TimeProvider>,
        mode: Arc<ModeState>,
        stall: StallConfig,
    ) -> Self {
        Self {
            store,
            broker,
            retry_policy,
            notifier,
            time_provider,
            mode,
            stall,
        }
    }

    /// Record how an attempt of a claimed job ended.
    ///
    /// `job` is the snapshot returned by the claim; its `attempts` is the
    /// fencing token for every write made here.
    pub async fn finish_attempt(
        &self,
        job: &Job,
        outcome: std::result::Result<WorkerOutput, ExecutionError>,
    ) -> Result<AttemptOutcome> {
        let now = self.time_provider.now_millis();

        let output = match outcome {
            Ok(output) => output,
            Err(err) => return self.handle_failure(job, JobError::from(err), now).await,
        };

        if !output.structured {
            warn!(job_id = %job.id, "Worker printed no JSON object, storing raw output");
        }
        if !self
            .store
            .complete(&job.id, job.attempts, &output.result, now)
            .await?
        {
            return Ok(self.stale(job));
        }
        info!(
            job_id = %job.id,
            kind = %job.kind,
            attempt = %job.attempts,
            duration_ms = %output.duration_ms,
            "Job completed"
        );
        self.notify_current(&job.id).await;
        Ok(AttemptOutcome::Completed)
    }

    async fn handle_failure(&self, job: &Job, error: JobError, now: i64) -> Result<AttemptOutcome> {
        let delay_ms = match self.retry_policy.should_retry(job, &error) {
            RetryDecision::Retry(delay_ms) if self.mode.current() == QueueMode::Broker => delay_ms,
            RetryDecision::Retry(_) => {
                warn!(job_id = %job.id, "Broker no longer in use, failing instead of retrying");
                return self.fail_attempt(job, &error, now).await;
            }
            RetryDecision::Failed => return self.fail_attempt(job, &error, now).await,
        };

        if !self
            .store
            .release_for_retry(&job.id, job.attempts, now + delay_ms)
            .await?
        {
            return Ok(self.stale(job));
        }
        if let Err(e) = self
            .broker
            .publish_delayed(job.kind, &job.id, delay(delay_ms))
            .await
        {
            let lost = JobError::internal(format!("retry could not be queued ({}) after: {}", e, error));
            self.abandon(job, &lost, now).await;
            return Err(e.into());
        }
        warn!(
            job_id = %job.id,
            attempt = %job.attempts,
            delay_ms = %delay_ms,
            error = %error,
            "Attempt failed, retry scheduled"
        );
        self.notify_current(&job.id).await;
        Ok(AttemptOutcome::RetryScheduled { delay_ms })
    }

    async fn fail_attempt(&self, job: &Job, error: &JobError, now: i64) -> Result<AttemptOutcome> {
        if !self.store.fail(&job.id, job.attempts, error, now).await? {
            return Ok(self.stale(job));
        }
        error!(
            job_id = %job.id,
            kind = %job.kind,
            attempt = %job.attempts,
            error = %error,
            "Job failed"
        );
        self.notify_current(&job.id).await;
        Ok(AttemptOutcome::Failed)
    }

    /// Fail a pending job whose broker message was never written.
    /// Returns true when this call failed it.
    async fn abandon(&self, job: &Job, error: &JobError, now: i64) -> bool {
        match self
            .store
            .abandon_pending(&job.id, job.attempts, error, now)
            .await
        {
            Ok(true) => {
                error!(job_id = %job.id, kind = %job.kind, error = %error, "Undeliverable job failed");
                self.notify_current(&job.id).await;
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Could not fail undeliverable job");
                false
            }
        }
    }

    fn stale(&self, job: &Job) -> AttemptOutcome {
        info!(
            job_id = %job.id,
            attempt = %job.attempts,
            "Attempt no longer current, outcome discarded"
        );
        AttemptOutcome::Stale
    }

    /// Put a failed job back in the queue with a fresh attempt budget,
    /// claimable after the backoff for its next attempt.
    pub async fn retry_failed(&self, id: &JobId) -> Result<Job> {
        let failed = self
            .store
            .find_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("job {}", id)))?;
        if failed.status != JobStatus::Failed {
            return Err(AppError::Unsupported(format!(
                "job {} is {}, only failed jobs can be retried",
                id, failed.status
            )));
        }
        if self.mode.current() != QueueMode::Broker {
            return Err(AppError::Unsupported(format!(
                "job {} needs the broker to be retried and the broker is no longer in use",
                id
            )));
        }

        let now = self.time_provider.now_millis();
        let delay_ms = self
            .retry_policy
            .backoff_delay_ms(failed.kind, failed.failed_attempts());
        let max_attempts = failed.attempts + self.retry_policy.max_attempts(failed.kind);

        let job = self
            .store
            .reset_failed(id, max_attempts, now + delay_ms)
            .await?
            .ok_or_else(|| {
                AppError::InvalidState(format!("job {} changed state during retry", id))
            })?;
        if let Err(e) = self
            .broker
            .publish_delayed(job.kind, &job.id, delay(delay_ms))
            .await
        {
            // Back to failed with the error the caller asked to retry
            let previous = failed
                .error
                .unwrap_or_else(|| JobError::internal("retry could not be queued"));
            self.abandon(&job, &previous, now).await;
            return Err(e.into());
        }

        info!(
            job_id = %job.id,
            attempts = %job.attempts,
            max_attempts = %job.max_attempts,
            delay_ms = %delay_ms,
            "Failed job requeued"
        );
        self.notifier.notify(JobEvent::snapshot(&job, now)).await;
        Ok(job)
    }

    /// Requeue or fail active jobs that stopped heartbeating
    pub async fn sweep_stalled(&self) -> Result<StallReport> {
        let now = self.time_provider.now_millis();
        let cutoff = now - self.stall.window_ms;
        let mut report = StallReport::default();

        for job in self.store.find_stalled(cutoff).await? {
            if job.stall_count >= self.stall.max_stall_retries {
                let error = JobError::stalled(job.stall_count);
                if self.store.fail(&job.id, job.attempts, &error, now).await? {
                    error!(
                        job_id = %job.id,
                        stall_count = %job.stall_count,
                        "Stalled job exceeded stall retries, failing"
                    );
                    report.failed += 1;
                    self.notify_current(&job.id).await;
                }
            } else if self
                .store
                .requeue_stalled(&job.id, job.attempts, now)
                .await?
            {
                warn!(
                    job_id = %job.id,
                    attempt = %job.attempts,
                    heartbeat_at = ?job.heartbeat_at,
                    "Stalled job requeued"
                );
                if let Err(e) = self.broker.publish(job.kind, &job.id).await {
                    let lost = JobError::internal(format!("stalled job could not be requeued: {}", e));
                    if self.abandon(&job, &lost, now).await {
                        report.failed += 1;
                    }
                    continue;
                }
                report.requeued += 1;
                self.notify_current(&job.id).await;
            }
        }
        Ok(report)
    }

    /// Re-publish pending broker jobs whose message may have been lost.
    /// Duplicate messages are harmless: only one claim can succeed.
    pub async fn recover_pending(&self) -> Result<usize> {
        let now = self.time_provider.now_millis();
        let pending = self.store.find_by_status(JobStatus::Pending).await?;
        let mut recovered = 0;

        for job in pending
            .into_iter()
            .filter(|job| job.backend == QueueMode::Broker)
        {
            let wait_ms = job.available_at - now;
            if wait_ms > 0 {
                self.broker
                    .publish_delayed(job.kind, &job.id, delay(wait_ms))
                    .await?;
            } else {
                self.broker.publish(job.kind, &job.id).await?;
            }
            debug!(job_id = %job.id, "Pending job re-published");
            recovered += 1;
        }

        info!(recovered_count = %recovered, "Pending job recovery complete");
        Ok(recovered)
    }

    /// Fail the broker jobs nothing will run once the mode has left broker:
    /// pending ones get no more deliveries, stalled active ones no more sweeps.
    pub async fn abandon_broker_jobs(&self) -> Result<usize> {
        let now = self.time_provider.now_millis();
        let undelivered = JobError::internal("broker became unavailable before the job could run");
        let mut failed = 0;

        for job in self
            .store
            .find_by_status(JobStatus::Pending)
            .await?
            .into_iter()
            .filter(|job| job.backend == QueueMode::Broker)
        {
            if self.abandon(&job, &undelivered, now).await {
                failed += 1;
            }
        }

        for job in self
            .store
            .find_stalled(now - self.stall.window_ms)
            .await?
            .into_iter()
            .filter(|job| job.backend == QueueMode::Broker)
        {
            let error = JobError::stalled(job.stall_count);
            if self.store.fail(&job.id, job.attempts, &error, now).await? {
                self.notify_current(&job.id).await;
                failed += 1;
            }
        }

        warn!(failed_count = %failed, "Broker jobs failed after degradation");
        Ok(failed)
    }

    /// Periodic stall sweep until shutdown
    pub async fn run_stall_detector(self: Arc<Self>, mut shutdown: ShutdownToken) {
        let period = Duration::from_millis(self.stall.check_interval_ms.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            window_ms = %self.stall.window_ms,
            interval_ms = %period.as_millis(),
            "Stall detector started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep_stalled().await {
                        Ok(report) if report != StallReport::default() => {
                            info!(
                                requeued = %report.requeued,
                                failed = %report.failed,
                                "Stall sweep finished"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Stall sweep failed"),
                    }
                }
                _ = shutdown.wait() => break,
            }
        }
        info!("Stall detector stopped");
    }

    async fn notify_current(&self, id: &JobId) {
        match self.store.find_by_id(id).await {
            Ok(Some(job)) => {
                let now = self.time_provider.now_millis();
                self.notifier.notify(JobEvent::snapshot(&job, now)).await;
            }
            Ok(None) => {}
            Err(e) => warn!(job_id = %id, error = %e, "Could not load job for notification"),
        }
    }
}

fn delay(millis: i64) -> Duration {
    Duration::from_millis(millis.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::sink::StoreProgressSink;
    use crate::domain::{DownloadPayload, JobErrorKind, JobKind, JobPayload, ProgressUpdate};
    use crate::port::broker::mocks::InMemoryBroker;
    use crate::port::job_store::mocks::InMemoryJobStore;
    use crate::port::notifier::NoopNotifier;
    use crate::port::time_provider::mocks::ManualClock;
    use crate::port::worker_runner::mocks::ScriptedRunner;
    use crate::port::WorkerRunner;

    struct Fixture {
        store: Arc<InMemoryJobStore>,
        broker: Arc<InMemoryBroker>,
        clock: Arc<ManualClock>,
        mode: Arc<ModeState>,
        controller: LifecycleController,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryJobStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let mode = Arc::new(ModeState::new(QueueMode::Broker));
        let controller = LifecycleController::new(
            store.clone(),
            broker.clone(),
            Arc::new(RetryPolicy::uniform(3, 20)),
            Arc::new(NoopNotifier),
            clock.clone(),
            Arc::clone(&mode),
            StallConfig {
                window_ms: 30_000,
                check_interval_ms: 15_000,
                max_stall_retries: 1,
            },
        );
        Fixture {
            store,
            broker,
            clock,
            mode,
            controller,
        }
    }

    fn download_job(id: &str, now: i64) -> Job {
        let payload = JobPayload::Download(DownloadPayload {
            video_id: "dQw4w9WgXcQ".to_string(),
            quality: None,
            cookies_path: None,
        });
        Job::new(id, now, Some(7), payload, QueueMode::Broker, 3)
    }

    async fn claimed(f: &Fixture, id: &str) -> Job {
        let now = f.clock.now_millis();
        f.store.insert(&download_job(id, now)).await.unwrap();
        f.store.claim(&id.to_string(), now).await.unwrap().unwrap()
    }

    fn exit_error() -> ExecutionError {
        ExecutionError::NonZeroExit {
            code: Some(1),
            stderr: "HTTP Error 503".to_string(),
        }
    }

    /// Run the scripted worker the way a worker slot does
    async fn run_attempt(f: &Fixture, runner: &ScriptedRunner, job: &Job) -> Result<AttemptOutcome> {
        let sink = StoreProgressSink::new(
            job.clone(),
            f.store.clone(),
            Arc::new(NoopNotifier),
            f.clock.clone(),
        );
        let outcome = runner.run(job, &sink).await;
        f.controller.finish_attempt(job, outcome).await
    }

    #[tokio::test]
    async fn test_successful_attempt_completes_job() {
        let f = fixture();
        let job = claimed(&f, "1").await;
        let runner = ScriptedRunner::succeeding(serde_json::json!({"file_path": "/out/a.mp4"}))
            .with_updates(vec![ProgressUpdate::Step("Downloading".to_string())]);

        let outcome = run_attempt(&f, &runner, &job).await.unwrap();
        assert_eq!(outcome, AttemptOutcome::Completed);
        assert_eq!(runner.call_count(), 1);

        let stored = f.store.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.progress_percent, 100);
        assert_eq!(
            stored.progress_meta.current_step.as_deref(),
            Some("Downloading")
        );
    }

    #[tokio::test]
    async fn test_failed_attempt_schedules_retry_with_backoff() {
        let f = fixture();
        let job = claimed(&f, "1").await;
        let runner = ScriptedRunner::failing(exit_error())
            .with_updates(vec![ProgressUpdate::Percent(40)]);

        let outcome = run_attempt(&f, &runner, &job).await.unwrap();
        assert_eq!(outcome, AttemptOutcome::RetryScheduled { delay_ms: 20 });

        let stored = f.store.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.available_at, f.clock.now_millis() + 20);
        assert_eq!(stored.progress_percent, 40);
        assert_eq!(f.broker.queued(JobKind::Download), 1);

        // The second failure doubles the delay
        f.clock.advance(20);
        let job = f
            .store
            .claim(&job.id, f.clock.now_millis())
            .await
            .unwrap()
            .unwrap();
        let outcome = run_attempt(&f, &runner, &job).await.unwrap();
        assert_eq!(outcome, AttemptOutcome::RetryScheduled { delay_ms: 40 });
        assert_eq!(runner.call_count(), 2);
    }

    #[tokio::test]
    async fn test_stale_attempt_outcome_is_discarded() {
        let f = fixture();
        let job = claimed(&f, "1").await;
        f.store
            .requeue_stalled(&job.id, job.attempts, f.clock.now_millis())
            .await
            .unwrap();

        let runner = ScriptedRunner::succeeding(serde_json::json!({}));
        let outcome = run_attempt(&f, &runner, &job).await.unwrap();
        assert_eq!(outcome, AttemptOutcome::Stale);
        let stored = f.store.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_unqueued_retry_fails_job_instead_of_leaving_it_pending() {
        let f = fixture();
        let job = claimed(&f, "1").await;
        f.broker.set_available(false);

        let runner = ScriptedRunner::failing(exit_error());
        let err = run_attempt(&f, &runner, &job).await.unwrap_err();
        assert!(err.is_broker());

        let stored = f.store.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        let error = stored.error.unwrap();
        assert_eq!(error.kind, JobErrorKind::Internal);
        assert!(error.message.contains("worker exited with code 1"));
    }

    #[tokio::test]
    async fn test_failure_after_degradation_is_final() {
        let f = fixture();
        let job = claimed(&f, "1").await;
        f.mode.degrade("connection reset");

        let runner = ScriptedRunner::failing(exit_error());
        let outcome = run_attempt(&f, &runner, &job).await.unwrap();
        assert_eq!(outcome, AttemptOutcome::Failed);

        let stored = f.store.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(
            stored.error.map(|e| e.kind),
            Some(JobErrorKind::NonZeroExit)
        );
        assert_eq!(f.broker.queued(JobKind::Download), 0);
    }

    #[tokio::test]
    async fn test_sweep_keeps_going_when_requeue_publish_fails() {
        let f = fixture();
        let first = claimed(&f, "1").await;
        let second = claimed(&f, "2").await;
        f.clock.advance(31_000);
        f.broker.set_available(false);

        let report = f.controller.sweep_stalled().await.unwrap();
        assert_eq!(report, StallReport { requeued: 0, failed: 2 });

        for id in [&first.id, &second.id] {
            let stored = f.store.find_by_id(id).await.unwrap().unwrap();
            assert_eq!(stored.status, JobStatus::Failed);
            assert_eq!(stored.error.map(|e| e.kind), Some(JobErrorKind::Internal));
        }
    }

    #[tokio::test]
    async fn test_manual_retry_keeps_job_failed_when_publish_fails() {
        let f = fixture();
        let job = claimed(&f, "1").await;
        let original = JobError::spawn_failure("yt-dlp", "not found");
        f.store
            .fail(&job.id, job.attempts, &original, f.clock.now_millis())
            .await
            .unwrap();
        f.broker.set_available(false);

        let err = f.controller.retry_failed(&job.id).await.unwrap_err();
        assert!(err.is_broker());

        let stored = f.store.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error, Some(original));

        // Once the broker is back the same job can be retried
        f.broker.set_available(true);
        let retried = f.controller.retry_failed(&job.id).await.unwrap();
        assert_eq!(retried.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_manual_retry_refused_after_degradation() {
        let f = fixture();
        let job = claimed(&f, "1").await;
        f.store
            .fail(&job.id, job.attempts, &JobError::internal("boom"), 0)
            .await
            .unwrap();
        f.mode.degrade("connection reset");

        let err = f.controller.retry_failed(&job.id).await.unwrap_err();
        assert!(matches!(err, AppError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_abandon_broker_jobs_fails_pending_and_stalled() {
        let f = fixture();
        let now = f.clock.now_millis();
        f.store.insert(&download_job("pending", now)).await.unwrap();
        let stalled = claimed(&f, "stalled").await;
        f.clock.advance(31_000);
        let running = claimed(&f, "running").await;

        let failed = f.controller.abandon_broker_jobs().await.unwrap();
        assert_eq!(failed, 2);

        let pending = f.store.find_by_id(&"pending".to_string()).await.unwrap().unwrap();
        assert_eq!(pending.status, JobStatus::Failed);
        assert_eq!(pending.error.map(|e| e.kind), Some(JobErrorKind::Internal));

        let stalled = f.store.find_by_id(&stalled.id).await.unwrap().unwrap();
        assert_eq!(stalled.status, JobStatus::Failed);
        assert_eq!(stalled.error.map(|e| e.kind), Some(JobErrorKind::Stalled));

        // A heartbeating attempt is left to finish on its own
        let running = f.store.find_by_id(&running.id).await.unwrap().unwrap();
        assert_eq!(running.status, JobStatus::Active);
    }
}
