//! Inline mode: startup fallback when the broker probe fails, synchronous
//! submissions, and degradation from broker mode at runtime.

mod common;

use common::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use vidforge_core::application::{Engine, ModeSelection, ModeSelector};
use vidforge_core::domain::{JobErrorKind, JobStatus, Principal, QueueMode};
use vidforge_core::error::AppError;
use vidforge_core::port::broker::mocks::InMemoryBroker;
use vidforge_core::port::{Broker, BrokerError};

#[tokio::test]
async fn test_probe_timeout_selects_inline_and_submit_is_synchronous() {
    let selector = ModeSelector::new(Duration::from_millis(50));
    let selection = selector
        .select(|| async {
            // Broker host that never answers
            std::future::pending::<Result<Arc<dyn Broker>, BrokerError>>().await
        })
        .await;
    assert_eq!(selection.mode, QueueMode::Inline);

    let store = memory_store().await;
    let engine = start_engine(
        store,
        shell_runner(r#"echo "PROGRESS: 60"; echo '{"file_path": "/out/abc.mp4"}'"#),
        selection,
    )
    .await;
    assert_eq!(engine.mode(), QueueMode::Inline);
    let orchestrator = engine.orchestrator();

    let job = orchestrator.submit(download("abc"), Some(5)).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.backend, QueueMode::Inline);
    assert!(job.id.starts_with("inline-"));
    assert_eq!(job.progress_percent, 100);
    assert_eq!(job.result, Some(json!({"file_path": "/out/abc.mp4"})));

    let owner = Principal::user(5);
    let stored = orchestrator
        .get_status(&job.id, None, &owner)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(stored.result, job.result);

    engine.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_failed_readiness_closes_probe_client() {
    let broker = Arc::new(InMemoryBroker::new());
    broker.set_available(false);

    let probed = broker.clone();
    let selection = ModeSelector::new(Duration::from_millis(200))
        .select(|| async move { Ok(probed as Arc<dyn Broker>) })
        .await;

    assert_eq!(selection.mode, QueueMode::Inline);
    assert!(broker.is_closed());
}

#[tokio::test]
async fn test_inline_failure_is_terminal_and_cannot_be_retried() {
    let store = memory_store().await;
    let engine = start_engine(
        store,
        shell_runner(r#"echo "no captions" >&2; exit 2"#),
        ModeSelection::inline(),
    )
    .await;
    let orchestrator = engine.orchestrator();
    let owner = Principal::user(5);

    let job = orchestrator.submit(parse("abc"), Some(5)).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
    let error = job.error.clone().unwrap();
    assert_eq!(error.kind, JobErrorKind::NonZeroExit);
    assert_eq!(error.stderr.as_deref(), Some("no captions"));

    let err = orchestrator.retry(&job.id, &owner).await.unwrap_err();
    assert!(matches!(err, AppError::Unsupported(_)));

    // Inline mode never has anything waiting or running
    let listing = orchestrator.list_jobs(None, &owner).await.unwrap();
    assert!(listing.waiting.is_empty());
    assert!(listing.active.is_empty());
    assert_eq!(listing.failed.len(), 1);

    orchestrator.remove(&job.id, &owner).await.unwrap();
    let err = orchestrator.remove(&job.id, &owner).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    engine.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_invalid_payload_is_rejected_before_running() {
    let store = memory_store().await;
    let engine = start_engine(store, shell_runner("exit 0"), ModeSelection::inline()).await;
    let orchestrator = engine.orchestrator();

    let err = orchestrator.submit(download("  "), Some(5)).await.unwrap_err();
    assert!(matches!(err, AppError::Domain(_) | AppError::Validation(_)));

    let stats = orchestrator.stats(None, &Principal::elevated(0)).await.unwrap();
    assert_eq!(stats.total, 0);
    assert!(orchestrator.usage(&Principal::user(5)).await.unwrap().is_empty());

    engine.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_broker_loss_degrades_to_inline_for_the_process_lifetime() {
    let store = memory_store().await;
    let broker = Arc::new(InMemoryBroker::new());
    let engine = start_engine(
        store,
        shell_runner(r#"echo '{"ok": true}'"#),
        ModeSelection::broker(broker.clone()),
    )
    .await;
    let orchestrator = engine.orchestrator();
    assert_eq!(orchestrator.mode(), QueueMode::Broker);

    broker.set_available(false);
    let job = orchestrator.submit(download("abc"), Some(1)).await.unwrap();
    assert_eq!(job.backend, QueueMode::Inline);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(orchestrator.mode(), QueueMode::Inline);

    // Background tasks stop and the broker is released
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    while !broker.is_closed() {
        assert!(tokio::time::Instant::now() < deadline, "broker never closed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Coming back does not switch the mode back
    broker.set_available(true);
    let job = orchestrator.submit(parse("abc"), Some(1)).await.unwrap();
    assert_eq!(job.backend, QueueMode::Inline);

    engine.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_degradation_settles_jobs_still_queued_on_the_broker() {
    let store = memory_store().await;
    let broker = Arc::new(InMemoryBroker::new());
    let mut config = fast_config();
    config.workers.concurrency.download = 0;
    let engine = Engine::start(
        deps(store, shell_runner(r#"echo '{"ok": true}'"#)),
        config,
        ModeSelection::broker(broker.clone()),
    )
    .await;
    let orchestrator = engine.orchestrator();
    let owner = Principal::user(1);

    // No download slots, so this one is still queued when the broker goes away
    let queued = orchestrator.submit(download("abc"), Some(1)).await.unwrap();
    assert_eq!(queued.status, JobStatus::Pending);

    broker.set_available(false);
    let inline = orchestrator.submit(parse("abc"), Some(1)).await.unwrap();
    assert_eq!(inline.status, JobStatus::Completed);

    let settled = wait_for(&orchestrator, &queued.id, |j| j.is_terminal()).await;
    assert_eq!(settled.status, JobStatus::Failed);
    assert_eq!(settled.backend, QueueMode::Broker);
    assert_eq!(settled.error.map(|e| e.kind), Some(JobErrorKind::Internal));

    let listing = orchestrator.list_jobs(None, &owner).await.unwrap();
    assert!(listing.waiting.is_empty());
    assert_eq!(listing.failed.len(), 1);
    assert_eq!(listing.completed.len(), 1);

    let stats = orchestrator.stats(None, &owner).await.unwrap();
    assert_eq!((stats.failed, stats.completed, stats.total), (1, 1, 2));

    let err = orchestrator.retry(&queued.id, &owner).await.unwrap_err();
    assert!(matches!(err, AppError::Unsupported(_)), "got {:?}", err);

    engine.shutdown(Duration::from_secs(1)).await;
}
