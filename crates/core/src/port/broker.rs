// Broker Port
// Carries job ids between submitters and worker slots. The Job Store stays
// the source of truth; a message is only a hint that a job may be claimable.

use crate::domain::{JobId, JobKind};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// A consumed message, acknowledged once the job is claimed or discarded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message_id: String,
    pub job_id: JobId,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("broker did not answer within {0}ms")]
    Timeout(u64),

    #[error("broker connection closed")]
    Closed,

    #[error("unexpected broker reply: {0}")]
    Protocol(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    /// Readiness check: reachable and queues prepared
    async fn ready(&self) -> Result<(), BrokerError>;

    /// Next id from the broker-side counter
    async fn next_job_id(&self) -> Result<JobId, BrokerError>;

    async fn publish(&self, kind: JobKind, job_id: &str) -> Result<(), BrokerError>;

    /// Publish once `delay` has elapsed (backoff)
    async fn publish_delayed(
        &self,
        kind: JobKind,
        job_id: &str,
        delay: Duration,
    ) -> Result<(), BrokerError>;

    /// Wait up to `wait` for the next message of `kind`
    async fn consume(
        &self,
        kind: JobKind,
        consumer: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, BrokerError>;

    async fn ack(&self, kind: JobKind, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Release connections. Later calls fail with `BrokerError::Closed`.
    async fn close(&self);
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;
    use tokio::time::Instant;

    /// Upper bound on one idle wait, so a missed notification costs little
    const POLL_SLICE: Duration = Duration::from_millis(20);

    #[derive(Default)]
    struct Queues {
        ready: HashMap<JobKind, VecDeque<Delivery>>,
        delayed: Vec<(Instant, JobKind, JobId)>,
    }

    /// Process-local broker with the same delivery semantics as the redis one
    pub struct InMemoryBroker {
        queues: Mutex<Queues>,
        notify: Notify,
        job_seq: AtomicU64,
        message_seq: AtomicU64,
        available: AtomicBool,
        closed: AtomicBool,
        acked: AtomicU64,
    }

    impl Default for InMemoryBroker {
        fn default() -> Self {
            Self::new()
        }
    }

    impl InMemoryBroker {
        pub fn new() -> Self {
            Self {
                queues: Mutex::new(Queues::default()),
                notify: Notify::new(),
                job_seq: AtomicU64::new(0),
                message_seq: AtomicU64::new(0),
                available: AtomicBool::new(true),
                closed: AtomicBool::new(false),
                acked: AtomicU64::new(0),
            }
        }

        /// Simulate the broker going away (or coming back)
        pub fn set_available(&self, available: bool) {
            self.available.store(available, Ordering::SeqCst);
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        pub fn acked(&self) -> u64 {
            self.acked.load(Ordering::SeqCst)
        }

        /// Messages waiting for `kind`, delayed ones included
        pub fn queued(&self, kind: JobKind) -> usize {
            let queues = self.queues.lock().unwrap();
            let ready = queues.ready.get(&kind).map_or(0, VecDeque::len);
            let delayed = queues.delayed.iter().filter(|(_, k, _)| *k == kind).count();
            ready + delayed
        }

        fn check(&self) -> Result<(), BrokerError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(BrokerError::Closed);
            }
            if !self.available.load(Ordering::SeqCst) {
                return Err(BrokerError::Unavailable("connection refused".to_string()));
            }
            Ok(())
        }

        fn push(&self, queues: &mut Queues, kind: JobKind, job_id: JobId) {
            let seq = self.message_seq.fetch_add(1, Ordering::SeqCst);
            queues.ready.entry(kind).or_default().push_back(Delivery {
                message_id: format!("{}-0", seq),
                job_id,
            });
        }

        /// Move due delayed messages to their ready queue, return the next due time
        fn promote_due(&self, queues: &mut Queues, now: Instant) -> Option<Instant> {
            let (due, later): (Vec<_>, Vec<_>) = std::mem::take(&mut queues.delayed)
                .into_iter()
                .partition(|(at, _, _)| *at <= now);
            queues.delayed = later;
            for (_, kind, job_id) in due {
                self.push(queues, kind, job_id);
            }
            queues.delayed.iter().map(|(at, _, _)| *at).min()
        }
    }

    #[async_trait]
    impl Broker for InMemoryBroker {
        async fn ready(&self) -> Result<(), BrokerError> {
            self.check()
        }

        async fn next_job_id(&self) -> Result<JobId, BrokerError> {
            self.check()?;
            Ok((self.job_seq.fetch_add(1, Ordering::SeqCst) + 1).to_string())
        }

        async fn publish(&self, kind: JobKind, job_id: &str) -> Result<(), BrokerError> {
            self.check()?;
            {
                let mut queues = self.queues.lock().unwrap();
                self.push(&mut queues, kind, job_id.to_string());
            }
            self.notify.notify_waiters();
            Ok(())
        }

        async fn publish_delayed(
            &self,
            kind: JobKind,
            job_id: &str,
            delay: Duration,
        ) -> Result<(), BrokerError> {
            self.check()?;
            let mut queues = self.queues.lock().unwrap();
            queues
                .delayed
                .push((Instant::now() + delay, kind, job_id.to_string()));
            Ok(())
        }

        async fn consume(
            &self,
            kind: JobKind,
            _consumer: &str,
            wait: Duration,
        ) -> Result<Option<Delivery>, BrokerError> {
            let deadline = Instant::now() + wait;
            loop {
                self.check()?;
                let now = Instant::now();
                let next_due = {
                    let mut queues = self.queues.lock().unwrap();
                    let next_due = self.promote_due(&mut queues, now);
                    if let Some(delivery) = queues.ready.get_mut(&kind).and_then(VecDeque::pop_front)
                    {
                        return Ok(Some(delivery));
                    }
                    next_due
                };
                if now >= deadline {
                    return Ok(None);
                }
                let mut wake_at = deadline.min(now + POLL_SLICE);
                if let Some(due) = next_due {
                    wake_at = wake_at.min(due);
                }
                let _ = tokio::time::timeout_at(wake_at, self.notify.notified()).await;
            }
        }

        async fn ack(&self, _kind: JobKind, _delivery: &Delivery) -> Result<(), BrokerError> {
            self.check()?;
            self.acked.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
            self.notify.notify_waiters();
        }
    }
}
