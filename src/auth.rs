//! Authentication Module
//!
//! Holds the bearer token used for backend calls. Obtaining the token is the
//! host application's job; the tracker only reads it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Authenticated user session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSession {
    pub access_token: String,
    pub user_id: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuthSession {
    pub fn new(access_token: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            user_id: user_id.into(),
            expires_at: None,
        }
    }

    /// Sessions without an expiry never expire locally; the server has the final word.
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Utc::now() >= at)
    }
}

/// Manages authentication state
#[derive(Debug, Default)]
pub struct AuthManager {
    session: Option<AuthSession>,
}

impl AuthManager {
    pub fn new() -> Self {
        Self { session: None }
    }

    pub fn with_session(session: AuthSession) -> Self {
        Self {
            session: Some(session),
        }
    }

    pub fn set_session(&mut self, session: AuthSession) {
        info!(user_id = %session.user_id, "Session set");
        self.session = Some(session);
    }

    /// Get the current session if it has not expired
    pub fn session(&self) -> Option<&AuthSession> {
        match &self.session {
            Some(session) if !session.is_expired() => Some(session),
            Some(_) => {
                warn!("Session is expired");
                None
            }
            None => None,
        }
    }

    pub fn access_token(&self) -> Option<&str> {
        self.session().map(|s| s.access_token.as_str())
    }

    pub fn user_id(&self) -> Option<&str> {
        self.session().map(|s| s.user_id.as_str())
    }

    pub fn is_authenticated(&self) -> bool {
        self.session().is_some()
    }

    pub fn clear_session(&mut self) {
        info!("Session cleared");
        self.session = None;
    }
}
