// Progress sinks handed to the worker runner

use crate::domain::{Job, ProgressUpdate};
use crate::port::{JobEvent, JobNotifier, JobStore, ProgressSink, TimeProvider};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Broker mode: every change is written to the store, then announced
pub struct StoreProgressSink {
    job: Mutex<Job>,
    store: Arc<dyn JobStore>,
    notifier: Arc<dyn JobNotifier>,
    time_provider: Arc<dyn TimeProvider>,
}

impl StoreProgressSink {
    pub fn new(
        job: Job,
        store: Arc<dyn JobStore>,
        notifier: Arc<dyn JobNotifier>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            job: Mutex::new(job),
            store,
            notifier,
            time_provider,
        }
    }
}

#[async_trait]
impl ProgressSink for StoreProgressSink {
    async fn on_progress(&self, update: ProgressUpdate) {
        let now = self.time_provider.now_millis();
        let snapshot = {
            let mut job = self.job.lock().await;
            if !job.apply_progress(&update, now) {
                return;
            }
            job.clone()
        };

        let stored = self
            .store
            .record_progress(
                &snapshot.id,
                snapshot.attempts,
                snapshot.progress_percent,
                &snapshot.progress_meta,
                now,
            )
            .await;

        match stored {
            Ok(Some(percent)) => {
                let mut event = JobEvent::snapshot(&snapshot, now);
                event.progress_percent = percent;
                self.notifier.notify(event).await;
            }
            Ok(None) => {
                debug!(job_id = %snapshot.id, attempt = %snapshot.attempts, "Progress for stale attempt dropped");
            }
            Err(e) => {
                warn!(job_id = %snapshot.id, error = %e, "Failed to record progress");
            }
        }
    }
}

/// Inline mode: progress is only visible through the notifier
pub struct InlineProgressSink {
    job: Mutex<Job>,
    notifier: Arc<dyn JobNotifier>,
    time_provider: Arc<dyn TimeProvider>,
}

impl InlineProgressSink {
    pub fn new(
        job: Job,
        notifier: Arc<dyn JobNotifier>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            job: Mutex::new(job),
            notifier,
            time_provider,
        }
    }

    /// The job with all progress folded in
    pub fn into_job(self) -> Job {
        self.job.into_inner()
    }
}

#[async_trait]
impl ProgressSink for InlineProgressSink {
    async fn on_progress(&self, update: ProgressUpdate) {
        let now = self.time_provider.now_millis();
        let event = {
            let mut job = self.job.lock().await;
            if !job.apply_progress(&update, now) {
                return;
            }
            JobEvent::snapshot(&job, now)
        };
        self.notifier.notify(event).await;
    }
}
