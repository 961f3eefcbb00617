//! Broker connection settings.

use serde::{Deserialize, Serialize};
use vidforge_core::domain::JobKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisBrokerConfig {
    pub url: String,
    /// Namespace for every key this broker touches
    pub key_prefix: String,
    pub consumer_group: String,
}

impl Default for RedisBrokerConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "vidforge".to_string(),
            consumer_group: "vidforge:workers".to_string(),
        }
    }
}

impl RedisBrokerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Stream carrying ready job ids for one kind
    pub fn stream_key(&self, kind: JobKind) -> String {
        format!("{}:stream:{}", self.key_prefix, kind)
    }

    /// Sorted set of job ids waiting out a backoff, scored by due time (ms)
    pub fn delayed_key(&self, kind: JobKind) -> String {
        format!("{}:delayed:{}", self.key_prefix, kind)
    }

    pub fn id_counter_key(&self) -> String {
        format!("{}:job_id", self.key_prefix)
    }
}
