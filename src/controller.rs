//! Tracking Controller
//!
//! The one tracking service for the process. UI owners register and
//! unregister; the sensor watch and the reconciliation timer exist once no
//! matter how many owners are mounted, and live until the last owner leaves.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::Utc;
use tokio::runtime::Handle;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::TrackerConfig;
use crate::dispatcher::{DispatchError, LocationDispatcher};
use crate::model::{
    BorrowSession, LocationSample, OwnerId, SchedulerState, SessionId, TrackingSnapshot,
};
use crate::permission::{AccessOutcome, PermissionGate, PermissionStatus};
use crate::platform::{GeolocationPlatform, SensorError, WatchOptions};
use crate::registry::{ListenerId, SessionRegistry};
use crate::scheduler::ReconciliationScheduler;
use crate::sensor::SampleSource;

pub type SampleCallback = Arc<dyn Fn(&LocationSample) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&TrackingError) + Send + Sync>;

/// Per-owner notification hooks
#[derive(Clone, Default)]
pub struct TrackingCallbacks {
    on_sample: Option<SampleCallback>,
    on_error: Option<ErrorCallback>,
}

impl TrackingCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_sample<F>(mut self, f: F) -> Self
    where
        F: Fn(&LocationSample) + Send + Sync + 'static,
    {
        self.on_sample = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&TrackingError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }
}

/// Tracking errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrackingError {
    #[error("Location tracking is not supported on this device")]
    Unsupported,

    #[error("Location permission denied")]
    PermissionDenied,

    #[error("Sensor error: {0}")]
    Sensor(#[from] SensorError),

    #[error("Location update for session {session} failed: {source}")]
    Dispatch {
        session: SessionId,
        source: DispatchError,
    },
}

impl TrackingError {
    /// Errors that mean tracking cannot run until the user acts.
    pub fn blocks_tracking(&self) -> bool {
        matches!(self, Self::Unsupported | Self::PermissionDenied)
    }
}

/// What one reconciliation pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Sessions whose update was accepted, in completion order
    pub dispatched: Vec<SessionId>,
    pub failed: Vec<(SessionId, DispatchError)>,
    /// Sessions were due but no sample has arrived yet
    pub skipped_no_sample: bool,
    /// Tracking was stopped when the pass ran
    pub not_tracking: bool,
}

impl TickReport {
    pub fn attempted(&self) -> usize {
        self.dispatched.len() + self.failed.len()
    }
}

struct ControllerState {
    is_tracking: bool,
    last_location: Option<LocationSample>,
    active: Vec<SessionId>,
    owners: Vec<(OwnerId, TrackingCallbacks)>,
    scheduler: ReconciliationScheduler,
    runtime: Option<Handle>,
    // Bumped on every teardown so in-flight work from an earlier run is ignored.
    generation: u64,
}

struct Inner {
    gate: PermissionGate,
    source: SampleSource,
    registry: Arc<SessionRegistry>,
    dispatcher: Arc<dyn LocationDispatcher>,
    stop_on_unauthorized: bool,
    refresh_each_tick: bool,
    state: Mutex<ControllerState>,
    // Held for a whole reconciliation pass so manual and timer passes never overlap.
    tick: AsyncMutex<()>,
    snapshot: watch::Sender<TrackingSnapshot>,
    registry_listener: ListenerId,
}

/// Shared handle to the tracking service; clones refer to the same instance.
#[derive(Clone)]
pub struct TrackingController {
    inner: Arc<Inner>,
}

impl TrackingController {
    pub fn new(
        config: &TrackerConfig,
        platform: Arc<dyn GeolocationPlatform>,
        registry: Arc<SessionRegistry>,
        dispatcher: Arc<dyn LocationDispatcher>,
    ) -> Self {
        let options = WatchOptions {
            high_accuracy: true,
            timeout: config.sensor_timeout,
            maximum_age: config.sensor_maximum_age,
        };
        let (snapshot, _) = watch::channel(TrackingSnapshot::default());

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let listener_ref = weak.clone();
            let registry_listener = registry.on_change(move |sessions| {
                if let Some(inner) = listener_ref.upgrade() {
                    inner.on_registry_change(sessions);
                }
            });

            Inner {
                gate: PermissionGate::new(platform.clone()),
                source: SampleSource::new(platform, options),
                registry,
                dispatcher,
                stop_on_unauthorized: config.stop_on_unauthorized,
                refresh_each_tick: config.refresh_sessions_each_tick,
                state: Mutex::new(ControllerState {
                    is_tracking: false,
                    last_location: None,
                    active: Vec::new(),
                    owners: Vec::new(),
                    scheduler: ReconciliationScheduler::new(
                        config.tick_interval,
                        config.staleness_threshold,
                    ),
                    runtime: None,
                    generation: 0,
                }),
                tick: AsyncMutex::new(()),
                snapshot,
                registry_listener,
            }
        });

        Self { inner }
    }

    /// Register `owner` and make sure tracking runs.
    ///
    /// Repeated calls (same or different owner) merge `initial_active_session_ids`
    /// into the tracked set; they never open a second sensor watch or timer.
    pub async fn start<I>(
        &self,
        owner: OwnerId,
        callbacks: TrackingCallbacks,
        initial_active_session_ids: I,
    ) -> Result<(), TrackingError>
    where
        I: IntoIterator<Item = SessionId>,
    {
        let requested: Vec<SessionId> = initial_active_session_ids.into_iter().collect();
        self.inner.start(owner, callbacks, requested).await
    }

    /// Unregister `owner`. Tracking stops only when no owner remains.
    /// Unknown owners are ignored.
    pub fn stop(&self, owner: &OwnerId) {
        self.inner.stop(owner);
    }

    /// Stop tracking for every owner.
    pub fn shutdown(&self) {
        self.inner.shutdown("shutdown requested");
    }

    /// Run one reconciliation pass now. The timer calls the same routine.
    pub async fn reconcile_now(&self) -> TickReport {
        self.inner.reconcile().await
    }

    /// Explicit, user-initiated permission request (may prompt).
    pub async fn request_access(&self) -> AccessOutcome {
        self.inner.gate.request_access().await
    }

    /// Passive permission check (never prompts).
    pub fn permission_status(&self) -> PermissionStatus {
        self.inner.gate.check()
    }

    pub fn is_tracking(&self) -> bool {
        self.inner.lock_state().is_tracking
    }

    pub fn last_location(&self) -> Option<LocationSample> {
        self.inner.lock_state().last_location
    }

    pub fn active_session_ids(&self) -> Vec<SessionId> {
        self.inner.lock_state().active.clone()
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.inner.lock_state().scheduler.state()
    }

    pub fn owner_count(&self) -> usize {
        self.inner.lock_state().owners.len()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.registry
    }

    /// Observe state changes instead of polling.
    pub fn subscribe(&self) -> watch::Receiver<TrackingSnapshot> {
        self.inner.snapshot.subscribe()
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn start(
        self: &Arc<Self>,
        owner: OwnerId,
        callbacks: TrackingCallbacks,
        requested: Vec<SessionId>,
    ) -> Result<(), TrackingError> {
        {
            let mut st = self.lock_state();
            if st.is_tracking {
                upsert_owner(&mut st, owner.clone(), callbacks);
                self.merge_requested(&mut st, requested);
                self.rearm(&mut st);
                debug!(%owner, owners = st.owners.len(), "Joined running tracker");
                self.publish(&st);
                return Ok(());
            }
        }

        match self.gate.ensure_access().await {
            AccessOutcome::Unsupported => return Err(TrackingError::Unsupported),
            AccessOutcome::Denied => return Err(TrackingError::PermissionDenied),
            AccessOutcome::Granted | AccessOutcome::Unknown => {}
        }

        let generation = {
            let mut st = self.lock_state();
            let first = !st.is_tracking;
            st.is_tracking = true;
            st.runtime.get_or_insert_with(Handle::current);
            upsert_owner(&mut st, owner.clone(), callbacks);
            if first {
                let sessions = self.registry.sessions();
                self.sync_with_registry(&mut st, &sessions, self.registry.is_loaded());
            }
            self.merge_requested(&mut st, requested);
            st.generation
        };

        let on_sample = Arc::downgrade(self);
        let on_error = Arc::downgrade(self);
        let subscribed = self.source.subscribe(
            move |sample| {
                if let Some(inner) = on_sample.upgrade() {
                    inner.handle_sample(sample);
                }
            },
            move |err| {
                if let Some(inner) = on_error.upgrade() {
                    inner.handle_sensor_error(err);
                }
            },
        );

        let mut st = self.lock_state();
        if let Err(e) = subscribed {
            error!(error = %e, "Could not start position watch");
            if st.generation == generation {
                st.owners.retain(|(id, _)| id != &owner);
                if st.owners.is_empty() {
                    self.teardown(&mut st);
                }
            }
            self.publish(&st);
            return Err(TrackingError::Sensor(e));
        }

        self.rearm(&mut st);
        info!(
            %owner,
            owners = st.owners.len(),
            sessions = st.active.len(),
            "Location tracking started"
        );
        self.publish(&st);
        Ok(())
    }

    fn stop(&self, owner: &OwnerId) {
        let released = {
            let mut st = self.lock_state();
            let before = st.owners.len();
            st.owners.retain(|(id, _)| id != owner);
            if st.owners.len() == before {
                debug!(%owner, "Stop from unregistered owner ignored");
                return;
            }

            if st.owners.is_empty() {
                self.teardown(&mut st);
                true
            } else {
                debug!(%owner, remaining = st.owners.len(), "Owner left, tracking continues");
                self.publish(&st);
                false
            }
        };

        if released {
            self.source.unsubscribe();
            info!(%owner, "Location tracking stopped");
            self.publish(&self.lock_state());
        }
    }

    fn shutdown(&self, reason: &str) {
        {
            let mut st = self.lock_state();
            st.owners.clear();
            self.teardown(&mut st);
        }
        self.source.unsubscribe();
        info!(reason, "Location tracking shut down");
        self.publish(&self.lock_state());
    }

    fn teardown(&self, st: &mut ControllerState) {
        st.is_tracking = false;
        st.last_location = None;
        st.active.clear();
        st.scheduler.reset();
        st.generation += 1;
    }

    fn handle_sample(&self, sample: LocationSample) {
        let callbacks: Vec<SampleCallback> = {
            let mut st = self.lock_state();
            if !st.is_tracking {
                return;
            }
            st.last_location = Some(sample);
            self.publish(&st);
            st.owners
                .iter()
                .filter_map(|(_, cb)| cb.on_sample.clone())
                .collect()
        };

        for callback in callbacks {
            callback(&sample);
        }
    }

    fn handle_sensor_error(&self, err: SensorError) {
        let is_tracking = self.lock_state().is_tracking;
        if is_tracking {
            self.emit_error(&TrackingError::Sensor(err));
        }
    }

    fn emit_error(&self, err: &TrackingError) {
        let callbacks: Vec<ErrorCallback> = self
            .lock_state()
            .owners
            .iter()
            .filter_map(|(_, cb)| cb.on_error.clone())
            .collect();

        for callback in callbacks {
            callback(err);
        }
    }

    fn on_registry_change(self: &Arc<Self>, sessions: &[BorrowSession]) {
        let loaded = self.registry.is_loaded();
        let mut st = self.lock_state();
        if !st.is_tracking {
            return;
        }
        self.sync_with_registry(&mut st, sessions, loaded);
        self.rearm(&mut st);
        self.publish(&st);
    }

    /// Registry-active sessions come first, in feed order. Sessions the
    /// registry reports in another status are dropped, as are sessions
    /// missing from a full feed; others stay until the feed knows them.
    fn sync_with_registry(&self, st: &mut ControllerState, sessions: &[BorrowSession], loaded: bool) {
        let mut next: Vec<SessionId> = Vec::new();
        for session in sessions.iter().filter(|s| s.is_active()) {
            if !next.contains(&session.session_id) {
                next.push(session.session_id.clone());
            }
        }

        for id in st.active.drain(..) {
            if next.contains(&id) {
                continue;
            }
            match sessions.iter().find(|s| s.session_id == id) {
                Some(session) => {
                    info!(session = %id, status = %session.status, "Session left the active set")
                }
                None if loaded => info!(session = %id, "Session no longer in the borrow feed"),
                None => next.push(id),
            }
        }

        st.active = next;
    }

    /// Owner-supplied ids follow the same rules as `sync_with_registry`.
    fn merge_requested(&self, st: &mut ControllerState, requested: Vec<SessionId>) {
        let loaded = self.registry.is_loaded();
        for id in requested {
            match self.registry.status_of(&id) {
                Some(status) if !status.is_active() => {
                    debug!(session = %id, %status, "Ignoring session that is not active");
                    continue;
                }
                None if loaded => {
                    debug!(session = %id, "Ignoring session missing from the borrow feed");
                    continue;
                }
                _ => {}
            }
            if !st.active.contains(&id) {
                st.active.push(id);
            }
        }
    }

    /// Keep the timer in step with the tracked set. With nothing to track
    /// the feed is still polled so new borrows start tracking.
    fn rearm(self: &Arc<Self>, st: &mut ControllerState) {
        let active = st.active.clone();
        st.scheduler.retain(&active);

        if !st.is_tracking {
            if st.scheduler.is_armed() {
                st.scheduler.disarm();
            }
            st.scheduler.stop_polling();
            return;
        }

        let Some(runtime) = st.runtime.clone() else {
            return;
        };
        let weak = Arc::downgrade(self);

        if active.is_empty() {
            if st.scheduler.is_armed() {
                st.scheduler.disarm();
            }
            if self.refresh_each_tick {
                st.scheduler.start_polling(&runtime, move || {
                    let weak = weak.clone();
                    async move {
                        match weak.upgrade() {
                            Some(inner) => inner.poll_feed().await,
                            None => false,
                        }
                    }
                });
            }
            return;
        }

        st.scheduler.stop_polling();
        st.scheduler.arm(&runtime, move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => {
                        inner.reconcile().await;
                        true
                    }
                    None => false,
                }
            }
        });
    }

    async fn poll_feed(&self) -> bool {
        let is_tracking = self.lock_state().is_tracking;
        if !is_tracking {
            return false;
        }
        // Changes reach the controller through the registry listener.
        let _ = self.registry.refresh().await;
        true
    }

    async fn reconcile(self: &Arc<Self>) -> TickReport {
        let _tick = self.tick.lock().await;
        let refresh = self.refresh_each_tick && self.lock_state().is_tracking;
        if refresh {
            // Failures keep the previous list; the registry logs them.
            let _ = self.registry.refresh().await;
        }

        let now = Utc::now();
        let (generation, sample, due) = {
            let mut st = self.lock_state();
            if !st.is_tracking {
                return TickReport {
                    not_tracking: true,
                    ..TickReport::default()
                };
            }

            let candidates: Vec<_> = st
                .active
                .iter()
                .map(|id| (id.clone(), self.registry.last_synced_at(id)))
                .collect();
            let due = st.scheduler.due_sessions(now, candidates);
            if due.is_empty() {
                return TickReport::default();
            }

            let Some(sample) = st.last_location else {
                debug!(due = due.len(), "No location sample yet, skipping tick");
                return TickReport {
                    skipped_no_sample: true,
                    ..TickReport::default()
                };
            };

            st.scheduler.begin_tick();
            self.publish(&st);
            (st.generation, sample, due)
        };

        debug!(due = due.len(), "Dispatching location updates");
        let mut tasks = JoinSet::new();
        for id in due {
            let dispatcher = self.dispatcher.clone();
            tasks.spawn(async move {
                let result = dispatcher.send(&id, &sample).await;
                (id, result)
            });
        }

        let mut report = TickReport::default();
        let mut unauthorized = false;
        while let Some(joined) = tasks.join_next().await {
            let (id, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(error = %e, "Location dispatch task failed");
                    continue;
                }
            };

            match result {
                Ok(()) => {
                    let synced_at = Utc::now();
                    {
                        let mut st = self.lock_state();
                        if st.generation != generation {
                            continue;
                        }
                        st.scheduler.record_sync(&id, synced_at);
                    }
                    self.registry.mark_synced(&id, synced_at);
                    report.dispatched.push(id);
                }
                Err(e) => {
                    let current = self.lock_state().generation;
                    if current != generation {
                        continue;
                    }
                    warn!(session = %id, error = %e, "Location update failed");
                    unauthorized |= e == DispatchError::Unauthorized;
                    self.emit_error(&TrackingError::Dispatch {
                        session: id.clone(),
                        source: e.clone(),
                    });
                    report.failed.push((id, e));
                }
            }
        }

        {
            let mut st = self.lock_state();
            if st.generation == generation {
                st.scheduler.end_tick();
                self.publish(&st);
            }
        }

        if unauthorized && self.stop_on_unauthorized {
            self.shutdown("backend rejected the access token");
        }

        report
    }

    fn publish(&self, st: &ControllerState) {
        self.snapshot.send_replace(TrackingSnapshot {
            is_tracking: st.is_tracking,
            last_location: st.last_location,
            active_session_ids: st.active.clone(),
            scheduler_state: st.scheduler.state(),
            owner_count: st.owners.len(),
        });
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.registry.remove_listener(self.registry_listener);
    }
}

fn upsert_owner(st: &mut ControllerState, owner: OwnerId, callbacks: TrackingCallbacks) {
    match st.owners.iter_mut().find(|(id, _)| *id == owner) {
        Some(entry) => entry.1 = callbacks,
        None => st.owners.push((owner, callbacks)),
    }
}
