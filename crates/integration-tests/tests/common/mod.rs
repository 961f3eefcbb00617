//! Shared fixtures: in-memory SQLite, engine wiring, shell workers and polling.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use vidforge_core::application::{
    Concurrency, Engine, EngineConfig, EngineDeps, JobOrchestrator, ModeSelection, RetryPolicy,
    StallConfig, WorkerConfig,
};
use vidforge_core::domain::{
    DownloadPayload, GeneratePayload, Job, JobId, JobPayload, ParsePayload, Principal,
};
use vidforge_core::port::notifier::NoopNotifier;
use vidforge_core::port::time_provider::SystemTimeProvider;
use vidforge_core::port::{JobStore, TimeProvider, WorkerRunner};
use vidforge_infra_sqlite::{create_pool, run_migrations, SqliteJobStore};
use vidforge_infra_system::{ExecutableSpec, ProcessWorkerRunner, WorkerCommands};

pub const WAIT_LIMIT: Duration = Duration::from_secs(10);

pub async fn memory_store() -> Arc<SqliteJobStore> {
    let pool = create_pool("sqlite::memory:").await.unwrap();
    run_migrations(&pool).await.unwrap();
    Arc::new(SqliteJobStore::new(pool))
}

/// Fast timings so broker-mode tests finish in well under a second
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        retry: RetryPolicy::uniform(3, 20),
        stall: StallConfig {
            window_ms: 30_000,
            check_interval_ms: 60_000,
            max_stall_retries: 1,
        },
        workers: WorkerConfig {
            consume_block: Duration::from_millis(50),
            heartbeat_interval: Duration::from_millis(100),
            concurrency: Concurrency {
                download: 1,
                parse: 1,
                generate: 1,
            },
        },
    }
}

pub fn deps(store: Arc<dyn JobStore>, runner: Arc<dyn WorkerRunner>) -> EngineDeps {
    EngineDeps {
        store,
        runner,
        notifier: Arc::new(NoopNotifier),
        time_provider: Arc::new(SystemTimeProvider),
    }
}

pub async fn start_engine(
    store: Arc<dyn JobStore>,
    runner: Arc<dyn WorkerRunner>,
    selection: ModeSelection,
) -> Engine {
    Engine::start(deps(store, runner), fast_config(), selection).await
}

/// Runner whose every kind executes `sh -c <script>`
pub fn shell_runner(script: &str) -> Arc<ProcessWorkerRunner> {
    let spec = ExecutableSpec::new("sh").arg("-c").arg(script).arg("worker");
    runner_for(spec)
}

pub fn runner_for(spec: ExecutableSpec) -> Arc<ProcessWorkerRunner> {
    let commands = WorkerCommands {
        download: spec.clone(),
        parse: spec.clone(),
        generate: spec,
        output_dir: None,
        working_dir: None,
    };
    let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
    Arc::new(ProcessWorkerRunner::new(
        commands,
        vec!["PATH".to_string()],
        time_provider,
    ))
}

pub fn download(video_id: &str) -> JobPayload {
    JobPayload::Download(DownloadPayload {
        video_id: video_id.to_string(),
        quality: Some("720p".to_string()),
        cookies_path: None,
    })
}

pub fn parse(video_id: &str) -> JobPayload {
    JobPayload::Parse(ParsePayload {
        video_id: video_id.to_string(),
        languages: vec!["en".to_string()],
        cookies_path: None,
    })
}

pub fn generate(video_id: &str) -> JobPayload {
    JobPayload::Generate(GeneratePayload {
        video_id: video_id.to_string(),
        target_languages: vec!["es".to_string()],
        sheet_id: Some("sheet-1".to_string()),
        sheet_row: Some("4".to_string()),
        voice: None,
    })
}

/// Poll until the job satisfies `done`, panicking after `WAIT_LIMIT`
pub async fn wait_for<F>(orchestrator: &JobOrchestrator, id: &JobId, done: F) -> Job
where
    F: Fn(&Job) -> bool,
{
    let admin = Principal::elevated(0);
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    loop {
        if let Some(job) = orchestrator.get_status(id, None, &admin).await.unwrap() {
            if done(&job) {
                return job;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {} did not reach the expected state in time",
            id
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
