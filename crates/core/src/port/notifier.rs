// Notification Sink Port
// Pushes every progress tick and status transition to whoever is listening.

use crate::domain::{Job, JobError, JobId, JobKind, JobStatus, OwnerId, ProgressMeta};
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub kind: JobKind,
    pub owner_id: Option<OwnerId>,
    pub status: JobStatus,
    pub progress_percent: u8,
    pub progress_meta: ProgressMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_token: Option<String>,
    pub at: i64,
}

impl JobEvent {
    pub fn snapshot(job: &Job, at: i64) -> Self {
        Self {
            job_id: job.id.clone(),
            kind: job.kind,
            owner_id: job.owner_id,
            status: job.status,
            progress_percent: job.progress_percent,
            progress_meta: job.progress_meta.clone(),
            error: job.error.clone(),
            correlation_token: job.correlation_token.clone(),
            at,
        }
    }
}

/// Delivery is best effort: a missing listener never fails the job.
#[async_trait]
pub trait JobNotifier: Send + Sync {
    async fn notify(&self, event: JobEvent);
}

pub struct NoopNotifier;

#[async_trait]
impl JobNotifier for NoopNotifier {
    async fn notify(&self, _event: JobEvent) {}
}

/// Fan-out to in-process subscribers
pub struct BroadcastNotifier {
    tx: broadcast::Sender<JobEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl JobNotifier for BroadcastNotifier {
    async fn notify(&self, event: JobEvent) {
        // Err only means nobody is subscribed
        let _ = self.tx.send(event);
    }
}
