// Session-scoped principals and impersonation

use crate::domain::{OwnerId, Principal};
use crate::error::{AppError, Result};
use crate::port::IdProvider;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, Clone, Copy)]
struct Session {
    original: Principal,
    acting_as: Option<OwnerId>,
}

impl Session {
    fn effective(&self) -> Principal {
        match self.acting_as {
            Some(owner) => Principal::user(owner),
            None => self.original,
        }
    }
}

/// Maps session tokens to the principal every read and write is scoped by.
///
/// While a session impersonates an owner, its effective principal is that
/// owner without elevation, so listings, submissions and usage counters all
/// land on the impersonated owner. `revert` puts the original principal back.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Session>>,
    tokens: Arc<dyn IdProvider>,
}

impl SessionRegistry {
    pub fn new(tokens: Arc<dyn IdProvider>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            tokens,
        }
    }

    pub async fn open(&self, principal: Principal) -> String {
        let token = self.tokens.generate_id();
        self.sessions.write().await.insert(
            token.clone(),
            Session {
                original: principal,
                acting_as: None,
            },
        );
        token
    }

    pub async fn effective(&self, token: &str) -> Result<Principal> {
        self.sessions
            .read()
            .await
            .get(token)
            .map(Session::effective)
            .ok_or_else(|| unknown_session(token))
    }

    /// Act as `owner` for this session. Switching targets keeps the original.
    pub async fn impersonate(&self, token: &str, owner: OwnerId) -> Result<Principal> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(token).ok_or_else(|| unknown_session(token))?;
        if !session.original.elevated {
            return Err(AppError::Forbidden(
                "impersonation requires an elevated principal".to_string(),
            ));
        }
        session.acting_as = Some(owner);
        info!(
            user_id = %session.original.user_id,
            acting_as = %owner,
            "Impersonation started"
        );
        Ok(session.effective())
    }

    /// Restore the original principal. Reverting a session that is not
    /// impersonating anyone just returns its principal.
    pub async fn revert(&self, token: &str) -> Result<Principal> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(token).ok_or_else(|| unknown_session(token))?;
        if let Some(owner) = session.acting_as.take() {
            info!(
                user_id = %session.original.user_id,
                acted_as = %owner,
                "Impersonation reverted"
            );
        }
        Ok(session.original)
    }

    pub async fn close(&self, token: &str) -> bool {
        self.sessions.write().await.remove(token).is_some()
    }
}

fn unknown_session(token: &str) -> AppError {
    AppError::NotFound(format!("session {}", token))
}
