//! Test doubles for the host platform and the backend.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use borrow_tracker_lib::config::TrackerConfig;
use borrow_tracker_lib::dispatcher::{DispatchError, LocationDispatcher};
use borrow_tracker_lib::registry::SessionFeed;
use borrow_tracker_lib::sync::ApiError;
use borrow_tracker_lib::platform::{
    GeolocationPlatform, PermissionState, PositionSink, SensorError, WatchId, WatchOptions,
};
use borrow_tracker_lib::{BorrowSession, LocationSample, SessionId};

/// Platform whose position events are pushed by the test.
pub struct FakePlatform {
    pub supported: bool,
    pub permission: Mutex<PermissionState>,
    pub prompt_answer: PermissionState,
    pub prompts: AtomicUsize,
    pub watches_opened: AtomicUsize,
    pub watches_cleared: AtomicUsize,
    next_id: AtomicU64,
    sink: Mutex<Option<PositionSink>>,
}

impl FakePlatform {
    pub fn granted() -> Arc<Self> {
        Self::with_permission(PermissionState::Granted)
    }

    pub fn with_permission(permission: PermissionState) -> Arc<Self> {
        Arc::new(Self {
            supported: true,
            permission: Mutex::new(permission),
            prompt_answer: PermissionState::Granted,
            prompts: AtomicUsize::new(0),
            watches_opened: AtomicUsize::new(0),
            watches_cleared: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            sink: Mutex::new(None),
        })
    }

    pub fn unsupported() -> Arc<Self> {
        let mut platform = Self::with_permission(PermissionState::Unknown);
        Arc::get_mut(&mut platform).unwrap().supported = false;
        platform
    }

    /// Live watches (opened minus cleared)
    pub fn live_watches(&self) -> usize {
        self.watches_opened.load(Ordering::SeqCst) - self.watches_cleared.load(Ordering::SeqCst)
    }

    /// Deliver a fix through the most recent watch, even if it was cleared.
    pub fn emit(&self, sample: LocationSample) {
        let sink = self.sink.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink(Ok(sample));
        }
    }

    pub fn fail(&self, error: SensorError) {
        let sink = self.sink.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink(Err(error));
        }
    }
}

#[async_trait]
impl GeolocationPlatform for FakePlatform {
    fn is_supported(&self) -> bool {
        self.supported
    }

    fn query_permission(&self) -> PermissionState {
        *self.permission.lock().unwrap()
    }

    async fn request_permission(&self) -> PermissionState {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        // The dialog stays up across a scheduling point.
        tokio::task::yield_now().await;
        *self.permission.lock().unwrap() = self.prompt_answer;
        self.prompt_answer
    }

    fn watch_position(&self, _options: WatchOptions, sink: PositionSink) -> Result<WatchId, SensorError> {
        if !self.supported {
            return Err(SensorError::PositionUnavailable("unsupported".into()));
        }
        self.watches_opened.fetch_add(1, Ordering::SeqCst);
        *self.sink.lock().unwrap() = Some(sink);
        Ok(WatchId(self.next_id.fetch_add(1, Ordering::SeqCst)))
    }

    fn clear_watch(&self, _id: WatchId) {
        self.watches_cleared.fetch_add(1, Ordering::SeqCst);
    }
}

/// Dispatcher that records calls and answers from a script.
#[derive(Default)]
pub struct RecordingDispatcher {
    pub calls: Mutex<Vec<(SessionId, LocationSample)>>,
    failures: Mutex<HashMap<SessionId, DispatchError>>,
}

impl RecordingDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_with(&self, id: SessionId, error: DispatchError) {
        self.failures.lock().unwrap().insert(id, error);
    }

    pub fn succeed(&self, id: &SessionId) {
        self.failures.lock().unwrap().remove(id);
    }

    pub fn call_ids(&self) -> Vec<SessionId> {
        self.calls.lock().unwrap().iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl LocationDispatcher for RecordingDispatcher {
    async fn send(&self, session_id: &SessionId, sample: &LocationSample) -> Result<(), DispatchError> {
        self.calls.lock().unwrap().push((session_id.clone(), *sample));
        match self.failures.lock().unwrap().get(session_id) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

/// Session feed whose contents the test swaps between fetches.
#[derive(Default)]
pub struct ScriptedFeed {
    sessions: Mutex<Vec<BorrowSession>>,
    pub fetches: AtomicUsize,
}

impl ScriptedFeed {
    pub fn new(sessions: Vec<BorrowSession>) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(sessions),
            fetches: AtomicUsize::new(0),
        })
    }

    pub fn set(&self, sessions: Vec<BorrowSession>) {
        *self.sessions.lock().unwrap() = sessions;
    }
}

#[async_trait]
impl SessionFeed for ScriptedFeed {
    async fn fetch_sessions(&self) -> Result<Vec<BorrowSession>, ApiError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.sessions.lock().unwrap().clone())
    }
}

/// Config with the production timings and no per-tick backend refresh.
pub fn test_config() -> TrackerConfig {
    TrackerConfig {
        refresh_sessions_each_tick: false,
        tick_interval: Duration::from_secs(60),
        staleness_threshold: Duration::from_secs(60),
        ..TrackerConfig::default()
    }
}

pub fn sample() -> LocationSample {
    LocationSample::new(13.7563, 100.5018, 8.0)
}
