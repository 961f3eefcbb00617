// ID Provider Port (for deterministic testing)

use crate::port::TimeProvider;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// ID provider interface (allows deterministic IDs in tests)
pub trait IdProvider: Send + Sync {
    fn generate_id(&self) -> String;
}

/// Inline job ids: `inline-<epoch ms>-<seq>`.
/// Broker ids are plain counters, so the prefix keeps the namespaces apart.
pub struct InlineIdProvider {
    time_provider: Arc<dyn TimeProvider>,
    seq: AtomicU64,
}

impl InlineIdProvider {
    pub const PREFIX: &'static str = "inline-";

    pub fn new(time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            time_provider,
            seq: AtomicU64::new(0),
        }
    }
}

impl IdProvider for InlineIdProvider {
    fn generate_id(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!(
            "{}{}-{}",
            Self::PREFIX,
            self.time_provider.now_millis(),
            seq
        )
    }
}

/// UUID v4 provider, used for session tokens
pub struct UuidProvider;

impl IdProvider for UuidProvider {
    fn generate_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}
