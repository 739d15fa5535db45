//! Location Dispatcher
//!
//! Sends one location update per (session, sample) decision.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::auth::AuthManager;
use crate::model::{LocationSample, SessionId};
use crate::sync::{ApiClient, ApiError};

/// Dispatch failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("Network error: {0}")]
    Network(String),

    /// The bearer token was rejected or is missing
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Server error: {0}")]
    Server(String),
}

impl DispatchError {
    /// Transient failures heal on a later tick because the session stays stale.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Unauthorized)
    }
}

impl From<ApiError> for DispatchError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Network(msg) => Self::Network(msg),
            ApiError::Unauthorized => Self::Unauthorized,
            ApiError::Server { status, message } => Self::Server(format!("{}: {}", status, message)),
            ApiError::Parse(msg) => Self::Server(msg),
        }
    }
}

#[async_trait]
pub trait LocationDispatcher: Send + Sync {
    async fn send(&self, session_id: &SessionId, sample: &LocationSample) -> Result<(), DispatchError>;
}

/// Dispatcher backed by `POST /api/borrows/{borrow_id}/location`
pub struct HttpDispatcher {
    api: ApiClient,
    auth: Arc<Mutex<AuthManager>>,
}

impl HttpDispatcher {
    pub fn new(api: ApiClient, auth: Arc<Mutex<AuthManager>>) -> Self {
        Self { api, auth }
    }
}

#[async_trait]
impl LocationDispatcher for HttpDispatcher {
    async fn send(&self, session_id: &SessionId, sample: &LocationSample) -> Result<(), DispatchError> {
        let token = self
            .auth
            .lock()
            .ok()
            .and_then(|auth| auth.access_token().map(str::to_string));

        let Some(token) = token else {
            warn!(session = %session_id, "No valid access token for location update");
            return Err(DispatchError::Unauthorized);
        };

        debug!(
            session = %session_id,
            lat = sample.latitude,
            lon = sample.longitude,
            accuracy = sample.accuracy_meters,
            "Sending location update"
        );

        self.api
            .post_location(&token, session_id, sample)
            .await
            .map_err(DispatchError::from)
    }
}
