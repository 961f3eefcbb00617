// Mode Selector: decides once whether submissions go through the broker

use crate::application::worker::constants::DEFAULT_PROBE_TIMEOUT;
use crate::domain::QueueMode;
use crate::port::{Broker, BrokerError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{info, warn};

/// Process-wide queue mode. Starts at the selector's choice and can only
/// move from broker to inline.
pub struct ModeState {
    tx: watch::Sender<QueueMode>,
}

impl ModeState {
    pub fn new(initial: QueueMode) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn current(&self) -> QueueMode {
        *self.tx.borrow()
    }

    /// Switch to inline. Returns true only for the call that made the switch;
    /// that call logs the degradation, every other call is silent.
    pub fn degrade(&self, reason: &str) -> bool {
        let switched = self.tx.send_if_modified(|mode| {
            if *mode == QueueMode::Broker {
                *mode = QueueMode::Inline;
                true
            } else {
                false
            }
        });
        if switched {
            warn!(reason = %reason, "ModeDegraded: broker unavailable, running jobs inline from now on");
        }
        switched
    }

    pub fn subscribe(&self) -> watch::Receiver<QueueMode> {
        self.tx.subscribe()
    }
}

/// Outcome of startup selection
pub struct ModeSelection {
    pub mode: QueueMode,
    pub broker: Option<Arc<dyn Broker>>,
}

impl ModeSelection {
    pub fn inline() -> Self {
        Self {
            mode: QueueMode::Inline,
            broker: None,
        }
    }

    pub fn broker(broker: Arc<dyn Broker>) -> Self {
        Self {
            mode: QueueMode::Broker,
            broker: Some(broker),
        }
    }
}

pub struct ModeSelector {
    probe_timeout: Duration,
}

impl Default for ModeSelector {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

impl ModeSelector {
    pub fn new(probe_timeout: Duration) -> Self {
        Self { probe_timeout }
    }

    /// Connect and check readiness, each bounded by the probe timeout.
    /// A client that connected but failed readiness is closed before returning.
    pub async fn probe<F, Fut>(&self, connect: F) -> Result<Arc<dyn Broker>, BrokerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn Broker>, BrokerError>>,
    {
        let budget_ms = self.probe_timeout.as_millis() as u64;

        let broker = timeout(self.probe_timeout, connect())
            .await
            .map_err(|_| BrokerError::Timeout(budget_ms))??;

        let readiness = match timeout(self.probe_timeout, broker.ready()).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Timeout(budget_ms)),
        };

        if let Err(e) = readiness {
            // Closing a hung client may hang as well
            let _ = timeout(self.probe_timeout, broker.close()).await;
            return Err(e);
        }
        Ok(broker)
    }

    /// Probe once and settle the mode for the process lifetime
    pub async fn select<F, Fut>(&self, connect: F) -> ModeSelection
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn Broker>, BrokerError>>,
    {
        match self.probe(connect).await {
            Ok(broker) => {
                info!(mode = %QueueMode::Broker, "Broker ready, using broker-backed queue");
                ModeSelection::broker(broker)
            }
            Err(e) => {
                warn!(
                    error = %e,
                    mode = %QueueMode::Inline,
                    "ModeDegraded: broker probe failed, running jobs inline"
                );
                ModeSelection::inline()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::JobKind;
    use crate::port::broker::MockBroker;
    use crate::port::Delivery;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    /// Accepts the connection, never answers readiness
    struct HangingBroker {
        closed: AtomicBool,
    }

    #[async_trait]
    impl Broker for HangingBroker {
        async fn ready(&self) -> Result<(), BrokerError> {
            std::future::pending::<()>().await;
            Ok(())
        }
        async fn next_job_id(&self) -> Result<String, BrokerError> {
            Err(BrokerError::Closed)
        }
        async fn publish(&self, _kind: JobKind, _job_id: &str) -> Result<(), BrokerError> {
            Err(BrokerError::Closed)
        }
        async fn publish_delayed(
            &self,
            _kind: JobKind,
            _job_id: &str,
            _delay: Duration,
        ) -> Result<(), BrokerError> {
            Err(BrokerError::Closed)
        }
        async fn consume(
            &self,
            _kind: JobKind,
            _consumer: &str,
            _wait: Duration,
        ) -> Result<Option<Delivery>, BrokerError> {
            Err(BrokerError::Closed)
        }
        async fn ack(&self, _kind: JobKind, _delivery: &Delivery) -> Result<(), BrokerError> {
            Err(BrokerError::Closed)
        }
        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_degrade_happens_once() {
        let state = ModeState::new(QueueMode::Broker);
        assert!(state.degrade("connection reset"));
        assert!(!state.degrade("connection reset"));
        assert_eq!(state.current(), QueueMode::Inline);
    }

    #[test]
    fn test_inline_never_upgrades() {
        let state = ModeState::new(QueueMode::Inline);
        assert!(!state.degrade("irrelevant"));
        assert_eq!(state.current(), QueueMode::Inline);
    }

    #[tokio::test]
    async fn test_degrade_wakes_subscribers() {
        let state = ModeState::new(QueueMode::Broker);
        let mut rx = state.subscribe();
        state.degrade("gone");
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), QueueMode::Inline);
    }

    #[tokio::test]
    async fn test_ready_broker_selects_broker_mode() {
        let mut mock = MockBroker::new();
        mock.expect_ready().times(1).returning(|| Ok(()));
        mock.expect_close().never();

        let broker: Arc<dyn Broker> = Arc::new(mock);
        let selection = ModeSelector::new(Duration::from_millis(200))
            .select(|| async move { Ok(broker) })
            .await;
        assert_eq!(selection.mode, QueueMode::Broker);
        assert!(selection.broker.is_some());
    }

    #[tokio::test]
    async fn test_failed_readiness_closes_client() {
        let mut mock = MockBroker::new();
        mock.expect_ready()
            .times(1)
            .returning(|| Err(BrokerError::Unavailable("connection refused".to_string())));
        mock.expect_close().times(1).returning(|| ());

        let broker: Arc<dyn Broker> = Arc::new(mock);
        let selection = ModeSelector::new(Duration::from_millis(200))
            .select(|| async move { Ok(broker) })
            .await;
        assert_eq!(selection.mode, QueueMode::Inline);
        assert!(selection.broker.is_none());
    }

    #[tokio::test]
    async fn test_connect_error_selects_inline() {
        let selection = ModeSelector::new(Duration::from_millis(200))
            .select(|| async { Err(BrokerError::Unavailable("dns".to_string())) })
            .await;
        assert_eq!(selection.mode, QueueMode::Inline);
    }

    #[tokio::test]
    async fn test_hung_readiness_is_bounded_by_timeout() {
        let hanging = Arc::new(HangingBroker {
            closed: AtomicBool::new(false),
        });
        let broker: Arc<dyn Broker> = hanging.clone();

        let started = Instant::now();
        let result = ModeSelector::new(Duration::from_millis(100))
            .probe(|| async move { Ok(broker) })
            .await;

        assert_eq!(result.err(), Some(BrokerError::Timeout(100)));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(hanging.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_hung_connect_is_bounded_by_timeout() {
        let result = ModeSelector::new(Duration::from_millis(50))
            .probe(|| async {
                std::future::pending::<Result<Arc<dyn Broker>, BrokerError>>().await
            })
            .await;
        assert_eq!(result.err(), Some(BrokerError::Timeout(50)));
    }
}
