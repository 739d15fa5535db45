//! API Sync Module
//!
//! HTTP communication with the borrow-management backend: the session list
//! feed and the per-borrow location endpoint.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::model::{BorrowSession, LocationSample, SessionId};

/// API client for the borrow backend
#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch the user's borrow sessions (all statuses).
    pub async fn fetch_borrows(
        &self,
        user_id: &str,
        access_token: Option<&str>,
    ) -> Result<Vec<BorrowSession>, ApiError> {
        let url = format!("{}/borrows", self.base_url);

        debug!(%url, user_id, "Fetching borrow sessions");

        let mut request = self.client.get(&url).query(&[("user_id", user_id)]);
        if let Some(token) = access_token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let response = check_status(response).await?;

        response
            .json::<Vec<BorrowSession>>()
            .await
            .map_err(|e| ApiError::Parse(e.to_string()))
    }

    /// Report a location sample for one borrow
    pub async fn post_location(
        &self,
        access_token: &str,
        session_id: &SessionId,
        sample: &LocationSample,
    ) -> Result<(), ApiError> {
        let url = format!("{}/api/borrows/{}/location", self.base_url, session_id);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", access_token))
            .json(&LocationUpdate::from(sample))
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        check_status(response).await?;

        info!(session = %session_id, "Location update accepted");
        Ok(())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        return Err(ApiError::Unauthorized);
    }

    let message = response
        .json::<ErrorResponse>()
        .await
        .map(|e| e.error)
        .unwrap_or_else(|_| format!("Status: {}", status));

    Err(ApiError::Server {
        status: status.as_u16(),
        message,
    })
}

// Request/Response types

/// Body of `POST /api/borrows/{borrow_id}/location`
#[derive(Debug, Serialize)]
pub struct LocationUpdate {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
    pub timestamp: DateTime<Utc>,
}

impl From<&LocationSample> for LocationUpdate {
    fn from(sample: &LocationSample) -> Self {
        Self {
            latitude: sample.latitude,
            longitude: sample.longitude,
            accuracy: sample.accuracy_meters,
            timestamp: sample.captured_at,
        }
    }
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: String,
}

/// API errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),
}
