//! vidforge daemon - composition root
//!
//! Wires the SQLite store, the worker process adapter and (when configured
//! and reachable) the redis broker into the engine, then serves JSON-RPC
//! until ctrl-c.

mod logging;
mod settings;

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

use settings::Settings;
use vidforge_api_rpc::RpcServer;
use vidforge_core::application::{Engine, EngineDeps, ModeSelection, ModeSelector};
use vidforge_core::port::notifier::BroadcastNotifier;
use vidforge_core::port::time_provider::SystemTimeProvider;
use vidforge_core::port::{Broker, JobNotifier, TimeProvider};
use vidforge_infra_redis::RedisBroker;
use vidforge_infra_sqlite::{create_pool, run_migrations, SqliteJobStore};
use vidforge_infra_system::ProcessWorkerRunner;

const EVENT_BUFFER: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Configuration and logging
    let settings = Settings::load().context("failed to load configuration")?;
    let _log_guard = logging::init(&settings.log)?;
    info!(version = %vidforge_core::VERSION, "vidforge starting");

    // 2. Database
    let db_url = settings.database.url();
    info!(database = %db_url, "Initializing database...");
    if let Some(dir) = db_url
        .strip_prefix("sqlite://")
        .and_then(|p| std::path::Path::new(p).parent())
    {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("cannot create database directory {}", dir.display()))?;
        }
    }
    let pool = create_pool(&db_url)
        .await
        .map_err(|e| anyhow::anyhow!("DB pool creation failed: {}", e))?;
    run_migrations(&pool)
        .await
        .map_err(|e| anyhow::anyhow!("Migration failed: {}", e))?;

    // 3. Adapters
    let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
    let store = Arc::new(SqliteJobStore::new(pool.clone()));
    let runner = Arc::new(ProcessWorkerRunner::new(
        settings.executables.clone(),
        settings.workers.env_allowlist.clone(),
        Arc::clone(&time_provider),
    ));
    let notifier = Arc::new(BroadcastNotifier::new(EVENT_BUFFER));
    spawn_event_logger(&notifier);

    // 4. Queue mode
    let selection = match settings.broker.redis_config() {
        Some(redis_config) => {
            let selector = ModeSelector::new(settings.broker.probe_timeout());
            let time_provider = Arc::clone(&time_provider);
            selector
                .select(|| async move {
                    RedisBroker::connect(redis_config, time_provider)
                        .await
                        .map(|broker| Arc::new(broker) as Arc<dyn Broker>)
                })
                .await
        }
        None => {
            info!("No broker url configured, running jobs inline");
            ModeSelection::inline()
        }
    };

    // 5. Engine
    let deps = EngineDeps {
        store,
        runner,
        notifier: notifier as Arc<dyn JobNotifier>,
        time_provider,
    };
    let engine = Engine::start(deps, settings.engine_config(), selection).await;

    // 6. JSON-RPC server
    let rpc_server = RpcServer::new(settings.rpc.clone(), engine.orchestrator());
    let (rpc_addr, rpc_handle) = rpc_server
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("RPC server start failed: {}", e))?;

    info!(mode = %engine.mode(), rpc = %rpc_addr, "System ready");

    // 7. Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Exiting gracefully...");

    // 8. Graceful shutdown
    if let Err(e) = rpc_handle.stop() {
        warn!(error = %e, "RPC server already stopped");
    }
    rpc_handle.stopped().await;
    engine.shutdown(settings.shutdown_grace()).await;
    pool.close().await;

    info!("Shutdown complete.");
    Ok(())
}

/// Job events have no remote subscriber yet; trace them at debug level
fn spawn_event_logger(notifier: &BroadcastNotifier) {
    let mut events = notifier.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => debug!(
                    job_id = %event.job_id,
                    kind = %event.kind,
                    status = %event.status,
                    progress = %event.progress_percent,
                    "Job event"
                ),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped = %skipped, "Job event logger lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
