// Engine - wires backends, worker slots and the stall detector for a mode

use crate::application::access::SessionRegistry;
use crate::application::backend::{BrokerBackend, InlineBackend, QueueBackend};
use crate::application::lifecycle::{LifecycleController, StallConfig};
use crate::application::mode::{ModeSelection, ModeState};
use crate::application::orchestrator::JobOrchestrator;
use crate::application::retry::RetryPolicy;
use crate::application::worker::{
    shutdown_channel, spawn_workers, ShutdownSender, ShutdownToken, WorkerConfig, WorkerContext,
};
use crate::domain::QueueMode;
use crate::port::id_provider::{InlineIdProvider, UuidProvider};
use crate::port::{Broker, JobNotifier, JobStore, TimeProvider, WorkerRunner};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    pub stall: StallConfig,
    pub workers: WorkerConfig,
}

/// Adapters injected by the composition root
#[derive(Clone)]
pub struct EngineDeps {
    pub store: Arc<dyn JobStore>,
    pub runner: Arc<dyn WorkerRunner>,
    pub notifier: Arc<dyn JobNotifier>,
    pub time_provider: Arc<dyn TimeProvider>,
}

pub struct Engine {
    orchestrator: Arc<JobOrchestrator>,
    mode: Arc<ModeState>,
    broker: Option<Arc<dyn Broker>>,
    shutdown: Arc<ShutdownSender>,
    handles: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Build the orchestrator for the selected mode. In broker mode this also
    /// re-publishes pending jobs and starts worker slots and the stall detector.
    pub async fn start(deps: EngineDeps, config: EngineConfig, selection: ModeSelection) -> Self {
        let mode = Arc::new(ModeState::new(selection.mode));
        let (shutdown, _) = shutdown_channel();
        let shutdown = Arc::new(shutdown);
        let mut handles = Vec::new();

        let inline: Arc<dyn QueueBackend> = Arc::new(InlineBackend::new(
            Arc::clone(&deps.store),
            Arc::clone(&deps.runner),
            Arc::clone(&deps.notifier),
            Arc::clone(&deps.time_provider),
            Arc::new(InlineIdProvider::new(Arc::clone(&deps.time_provider))),
        ));

        let broker = match selection.mode {
            QueueMode::Broker => selection.broker,
            QueueMode::Inline => None,
        };

        let broker_backend = match &broker {
            Some(broker) => {
                let retry_policy = Arc::new(config.retry.clone());
                let lifecycle = Arc::new(LifecycleController::new(
                    Arc::clone(&deps.store),
                    Arc::clone(broker),
                    Arc::clone(&retry_policy),
                    Arc::clone(&deps.notifier),
                    Arc::clone(&deps.time_provider),
                    Arc::clone(&mode),
                    config.stall,
                ));

                if let Err(e) = lifecycle.recover_pending().await {
                    warn!(error = %e, "Pending job recovery failed");
                }

                let ctx = WorkerContext {
                    broker: Arc::clone(broker),
                    store: Arc::clone(&deps.store),
                    runner: Arc::clone(&deps.runner),
                    lifecycle: Arc::clone(&lifecycle),
                    notifier: Arc::clone(&deps.notifier),
                    time_provider: Arc::clone(&deps.time_provider),
                    mode: Arc::clone(&mode),
                    config: config.workers,
                };
                handles.extend(spawn_workers(&ctx, &shutdown));
                handles.push(tokio::spawn(
                    Arc::clone(&lifecycle).run_stall_detector(shutdown.token()),
                ));
                handles.push(tokio::spawn(stop_on_degrade(
                    mode.subscribe(),
                    Arc::clone(&shutdown),
                    Arc::clone(broker),
                    Arc::clone(&lifecycle),
                    shutdown.token(),
                )));

                let backend: Arc<dyn QueueBackend> = Arc::new(BrokerBackend::new(
                    Arc::clone(broker),
                    Arc::clone(&deps.store),
                    lifecycle,
                    retry_policy,
                    Arc::clone(&deps.notifier),
                    Arc::clone(&deps.time_provider),
                ));
                Some(backend)
            }
            None => None,
        };

        let sessions = Arc::new(SessionRegistry::new(Arc::new(UuidProvider)));
        let orchestrator = Arc::new(JobOrchestrator::new(
            Arc::clone(&mode),
            broker_backend,
            inline,
            deps.store,
            sessions,
        ));

        info!(mode = %mode.current(), background_tasks = %handles.len(), "Engine started");
        Self {
            orchestrator,
            mode,
            broker,
            shutdown,
            handles,
        }
    }

    pub fn orchestrator(&self) -> Arc<JobOrchestrator> {
        Arc::clone(&self.orchestrator)
    }

    pub fn mode(&self) -> QueueMode {
        self.mode.current()
    }

    /// Stop background tasks, waiting up to `grace` for running jobs
    pub async fn shutdown(self, grace: Duration) {
        self.shutdown.shutdown();
        let all = join_handles(self.handles);
        if tokio::time::timeout(grace, all).await.is_err() {
            warn!(grace_ms = %grace.as_millis(), "Background tasks still running after grace period");
        }
        if let Some(broker) = self.broker {
            broker.close().await;
        }
        info!("Engine stopped");
    }
}

async fn join_handles(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}

/// Once the mode leaves broker, stop every background task, release the
/// broker and fail the broker jobs that can no longer run
async fn stop_on_degrade(
    mut mode_rx: watch::Receiver<QueueMode>,
    shutdown: Arc<ShutdownSender>,
    broker: Arc<dyn Broker>,
    lifecycle: Arc<LifecycleController>,
    mut token: ShutdownToken,
) {
    loop {
        tokio::select! {
            changed = mode_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                if *mode_rx.borrow_and_update() == QueueMode::Inline {
                    shutdown.shutdown();
                    broker.close().await;
                    info!("Broker released after degradation");
                    if let Err(e) = lifecycle.abandon_broker_jobs().await {
                        error!(error = %e, "Failed to settle broker jobs after degradation");
                    }
                    return;
                }
            }
            _ = token.wait() => return,
        }
    }
}
