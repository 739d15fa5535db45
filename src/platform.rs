//! Host Platform Module
//!
//! The host's geolocation capability and permission model, plus adapters for
//! hosts without a real sensor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::FixedPosition;
use crate::model::LocationSample;

/// Consent state as reported by a non-prompting query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionState {
    Granted,
    Denied,
    Prompt,
    Unknown,
}

/// Options for a continuous position watch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    pub high_accuracy: bool,
    /// Upper bound on how long the platform may take to produce a fix
    pub timeout: Duration,
    /// A cached fix older than this must not be delivered
    pub maximum_age: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            timeout: Duration::from_secs(15),
            maximum_age: Duration::from_secs(30),
        }
    }
}

/// Platform-assigned id of a live watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

/// Sensor failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SensorError {
    #[error("Location permission was revoked")]
    PermissionRevoked,

    #[error("Timed out waiting for a position fix")]
    Timeout,

    #[error("Position unavailable: {0}")]
    PositionUnavailable(String),
}

/// Receives every fix or failure a watch produces
pub type PositionSink = Arc<dyn Fn(Result<LocationSample, SensorError>) + Send + Sync>;

/// The host's geolocation API
#[async_trait]
pub trait GeolocationPlatform: Send + Sync {
    /// Whether the host exposes a location API at all
    fn is_supported(&self) -> bool;

    /// Current consent state; must never surface a prompt
    fn query_permission(&self) -> PermissionState;

    /// Ask the user for consent; may show a native prompt
    async fn request_permission(&self) -> PermissionState;

    /// Start a continuous watch that pushes into `sink` until cleared
    fn watch_position(&self, options: WatchOptions, sink: PositionSink) -> Result<WatchId, SensorError>;

    fn clear_watch(&self, id: WatchId);
}

/// A host with no location API
#[derive(Debug, Default)]
pub struct UnsupportedPlatform;

#[async_trait]
impl GeolocationPlatform for UnsupportedPlatform {
    fn is_supported(&self) -> bool {
        false
    }

    fn query_permission(&self) -> PermissionState {
        PermissionState::Unknown
    }

    async fn request_permission(&self) -> PermissionState {
        PermissionState::Unknown
    }

    fn watch_position(&self, _options: WatchOptions, _sink: PositionSink) -> Result<WatchId, SensorError> {
        Err(SensorError::PositionUnavailable("host has no location API".into()))
    }

    fn clear_watch(&self, _id: WatchId) {}
}

/// A stationary host (kiosk, desk terminal) that reports a configured position.
///
/// Each watch re-emits a freshly stamped sample at least once per `maximum_age`,
/// so the last known location never ages past the watch window.
pub struct FixedPlatform {
    position: FixedPosition,
    next_id: AtomicU64,
    watches: Mutex<HashMap<WatchId, JoinHandle<()>>>,
}

impl FixedPlatform {
    pub fn new(position: FixedPosition) -> Self {
        Self {
            position,
            next_id: AtomicU64::new(1),
            watches: Mutex::new(HashMap::new()),
        }
    }

    pub fn active_watches(&self) -> usize {
        self.watches.lock().map(|w| w.len()).unwrap_or(0)
    }
}

#[async_trait]
impl GeolocationPlatform for FixedPlatform {
    fn is_supported(&self) -> bool {
        true
    }

    fn query_permission(&self) -> PermissionState {
        PermissionState::Granted
    }

    async fn request_permission(&self) -> PermissionState {
        PermissionState::Granted
    }

    fn watch_position(&self, options: WatchOptions, sink: PositionSink) -> Result<WatchId, SensorError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SensorError::PositionUnavailable(e.to_string()))?;

        let id = WatchId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let period = options.maximum_age.max(Duration::from_secs(1));
        let position = self.position;

        let task = runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                sink(Ok(LocationSample::new(
                    position.latitude,
                    position.longitude,
                    position.accuracy_meters,
                )));
            }
        });

        self.watches
            .lock()
            .map_err(|_| SensorError::PositionUnavailable("watch table poisoned".into()))?
            .insert(id, task);

        info!(watch = id.0, every_secs = period.as_secs(), "Fixed position watch started");
        debug!(position = ?self.position, "Reporting fixed position");
        Ok(id)
    }

    fn clear_watch(&self, id: WatchId) {
        let task = self.watches.lock().ok().and_then(|mut w| w.remove(&id));
        if let Some(task) = task {
            task.abort();
            info!(watch = id.0, "Fixed position watch cleared");
        }
    }
}

impl Drop for FixedPlatform {
    fn drop(&mut self) {
        if let Ok(watches) = self.watches.get_mut() {
            for (_, task) in watches.drain() {
                task.abort();
            }
        }
    }
}
