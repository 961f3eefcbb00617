// Queue mode

use crate::domain::error::{DomainError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Which backend serves submissions. Moves broker -> inline at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    Broker,
    Inline,
}

impl QueueMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueMode::Broker => "broker",
            QueueMode::Inline => "inline",
        }
    }
}

impl std::fmt::Display for QueueMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueMode {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "broker" => Ok(QueueMode::Broker),
            "inline" => Ok(QueueMode::Inline),
            other => Err(DomainError::UnknownQueueMode(other.to_string())),
        }
    }
}
