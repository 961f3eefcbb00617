// Worker - broker consume loop, one job per slot

pub mod constants;
mod shutdown;

use constants::*;
pub use shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};

use crate::application::lifecycle::LifecycleController;
use crate::application::mode::ModeState;
use crate::application::sink::StoreProgressSink;
use crate::domain::{Job, JobId, JobKind, JobStatus, QueueMode};
use crate::error::Result;
use crate::port::{
    Broker, ExecutionError, JobEvent, JobNotifier, JobStore, TimeProvider, WorkerOutput,
    WorkerRunner,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Worker slots per job kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Concurrency {
    pub download: usize,
    pub parse: usize,
    pub generate: usize,
}

impl Default for Concurrency {
    fn default() -> Self {
        Self {
            download: DEFAULT_DOWNLOAD_CONCURRENCY,
            parse: DEFAULT_PARSE_CONCURRENCY,
            generate: DEFAULT_GENERATE_CONCURRENCY,
        }
    }
}

impl Concurrency {
    pub fn for_kind(&self, kind: JobKind) -> usize {
        match kind {
            JobKind::Download => self.download,
            JobKind::Parse => self.parse,
            JobKind::Generate => self.generate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    pub consume_block: Duration,
    pub heartbeat_interval: Duration,
    pub concurrency: Concurrency,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            consume_block: DEFAULT_CONSUME_BLOCK,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            concurrency: Concurrency::default(),
        }
    }
}

/// Everything a worker slot needs, shared by all slots
#[derive(Clone)]
pub struct WorkerContext {
    pub broker: Arc<dyn Broker>,
    pub store: Arc<dyn JobStore>,
    pub runner: Arc<dyn WorkerRunner>,
    pub lifecycle: Arc<LifecycleController>,
    pub notifier: Arc<dyn JobNotifier>,
    pub time_provider: Arc<dyn TimeProvider>,
    pub mode: Arc<ModeState>,
    pub config: WorkerConfig,
}

pub struct Worker {
    kind: JobKind,
    consumer: String,
    ctx: WorkerContext,
}

impl Worker {
    pub fn new(kind: JobKind, consumer: impl Into<String>, ctx: WorkerContext) -> Self {
        Self {
            kind,
            consumer: consumer.into(),
            ctx,
        }
    }

    /// Consume until shutdown or until the queue mode leaves broker
    pub async fn run(&self, mut shutdown: ShutdownToken) {
        info!(kind = %self.kind, consumer = %self.consumer, "Worker started");
        let mut broker_errors = 0u32;

        loop {
            if shutdown.is_shutdown() || self.ctx.mode.current() != QueueMode::Broker {
                break;
            }
            match self.process_next_job().await {
                Ok(_) => broker_errors = 0,
                Err(e) => {
                    error!(kind = %self.kind, consumer = %self.consumer, error = %e, "Worker error");
                    if e.is_broker() {
                        broker_errors += 1;
                        if broker_errors >= MAX_CONSECUTIVE_BROKER_ERRORS {
                            self.ctx.mode.degrade(&e.to_string());
                            break;
                        }
                    }
                    tokio::select! {
                        _ = sleep(ERROR_RECOVERY_SLEEP_DURATION) => {},
                        _ = shutdown.wait() => break,
                    }
                }
            }
        }
        info!(kind = %self.kind, consumer = %self.consumer, "Worker stopped");
    }

    /// Take one message and run its job. Returns false when the consume timed out.
    pub async fn process_next_job(&self) -> Result<bool> {
        let delivery = match self
            .ctx
            .broker
            .consume(self.kind, &self.consumer, self.ctx.config.consume_block)
            .await?
        {
            Some(d) => d,
            None => return Ok(false),
        };
        // A crash between ack and claim leaves the job pending; startup recovery re-publishes it
        self.ctx.broker.ack(self.kind, &delivery).await?;

        let now = self.ctx.time_provider.now_millis();
        let job = match self.ctx.store.claim(&delivery.job_id, now).await? {
            Some(job) => job,
            None => {
                self.skip_unclaimable(&delivery.job_id, now).await?;
                return Ok(true);
            }
        };

        info!(
            job_id = %job.id,
            kind = %job.kind,
            attempt = %job.attempts,
            "Processing job"
        );
        self.ctx.notifier.notify(JobEvent::snapshot(&job, now)).await;

        let outcome = self.execute(job.clone()).await;
        self.ctx.lifecycle.finish_attempt(&job, outcome).await?;
        Ok(true)
    }

    /// Message for a job that cannot be claimed now: early (backoff not over),
    /// or already taken, finished or removed.
    async fn skip_unclaimable(&self, id: &JobId, now: i64) -> Result<()> {
        match self.ctx.store.find_by_id(id).await? {
            Some(job) if job.status == JobStatus::Pending && job.available_at > now => {
                let wait = Duration::from_millis((job.available_at - now) as u64);
                debug!(job_id = %id, wait_ms = %wait.as_millis(), "Message arrived early, re-publishing");
                self.ctx.broker.publish_delayed(job.kind, id, wait).await?;
            }
            Some(job) => {
                debug!(job_id = %id, status = %job.status, "Dropping message for unclaimable job");
            }
            None => {
                debug!(job_id = %id, "Dropping message for removed job");
            }
        }
        Ok(())
    }

    /// Run the attempt in its own task so a panic only fails this job,
    /// heartbeating while the worker process is alive.
    async fn execute(&self, job: Job) -> std::result::Result<WorkerOutput, ExecutionError> {
        let runner = Arc::clone(&self.ctx.runner);
        let store = Arc::clone(&self.ctx.store);
        let time_provider = Arc::clone(&self.ctx.time_provider);
        let heartbeat_interval = self.ctx.config.heartbeat_interval;
        let sink = StoreProgressSink::new(
            job.clone(),
            Arc::clone(&self.ctx.store),
            Arc::clone(&self.ctx.notifier),
            Arc::clone(&self.ctx.time_provider),
        );
        let job_id = job.id.clone();

        let handle = tokio::spawn(async move {
            let run = runner.run(&job, &sink);
            tokio::pin!(run);
            let mut heartbeat = tokio::time::interval(heartbeat_interval);
            heartbeat.tick().await;

            loop {
                tokio::select! {
                    outcome = &mut run => break outcome,
                    _ = heartbeat.tick() => {
                        let now = time_provider.now_millis();
                        if let Err(e) = store.heartbeat(&job.id, job.attempts, now).await {
                            warn!(job_id = %job.id, error = %e, "Heartbeat failed");
                        }
                    }
                }
            }
        });

        match handle.await {
            Ok(outcome) => outcome,
            Err(join_err) => {
                error!(job_id = %job_id, error = %join_err, "Worker task panicked");
                Err(ExecutionError::Panicked(join_err.to_string()))
            }
        }
    }
}

/// Spawn the configured number of slots for every kind
pub fn spawn_workers(ctx: &WorkerContext, shutdown: &ShutdownSender) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    for kind in JobKind::ALL {
        for slot in 0..ctx.config.concurrency.for_kind(kind) {
            let consumer = format!("{}-{}-{}", std::process::id(), kind, slot);
            let worker = Worker::new(kind, consumer, ctx.clone());
            let token = shutdown.token();
            handles.push(tokio::spawn(async move { worker.run(token).await }));
        }
    }
    handles
}
