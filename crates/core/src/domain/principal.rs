// Access Filter: who is asking and what they may see

use crate::domain::job::OwnerId;
use serde::{Deserialize, Serialize};

/// Requesting identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: OwnerId,
    #[serde(default)]
    pub elevated: bool,
}

impl Principal {
    pub fn user(user_id: OwnerId) -> Self {
        Self {
            user_id,
            elevated: false,
        }
    }

    pub fn elevated(user_id: OwnerId) -> Self {
        Self {
            user_id,
            elevated: true,
        }
    }

    pub fn scope(&self) -> Scope {
        if self.elevated {
            Scope::All
        } else {
            Scope::Owner(self.user_id)
        }
    }
}

/// Row filter applied to every read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    All,
    Owner(OwnerId),
}

impl Scope {
    /// System-owned jobs (no owner) are only visible to elevated callers.
    pub fn permits(&self, owner_id: Option<OwnerId>) -> bool {
        match self {
            Scope::All => true,
            Scope::Owner(id) => owner_id == Some(*id),
        }
    }
}
