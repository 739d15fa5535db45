//! Session Registry
//!
//! Point-in-time view of the user's borrow sessions, refreshed from the
//! backend feed and by push-style update events.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::auth::AuthManager;
use crate::model::{BorrowSession, BorrowStatus, SessionId};
use crate::sync::{ApiClient, ApiError};

/// Source of the session list
#[async_trait]
pub trait SessionFeed: Send + Sync {
    async fn fetch_sessions(&self) -> Result<Vec<BorrowSession>, ApiError>;
}

/// Session feed backed by `GET /borrows?user_id=<id>`
pub struct HttpSessionFeed {
    api: ApiClient,
    auth: Arc<Mutex<AuthManager>>,
}

impl HttpSessionFeed {
    pub fn new(api: ApiClient, auth: Arc<Mutex<AuthManager>>) -> Self {
        Self { api, auth }
    }
}

#[async_trait]
impl SessionFeed for HttpSessionFeed {
    async fn fetch_sessions(&self) -> Result<Vec<BorrowSession>, ApiError> {
        let (user_id, token) = {
            let auth = self.auth.lock().map_err(|_| ApiError::Unauthorized)?;
            let user_id = auth.user_id().map(str::to_string);
            (user_id, auth.access_token().map(str::to_string))
        };

        let Some(user_id) = user_id else {
            return Err(ApiError::Unauthorized);
        };

        self.api.fetch_borrows(&user_id, token.as_deref()).await
    }
}

pub type ListenerId = u64;

type Listener = Arc<dyn Fn(&[BorrowSession]) + Send + Sync>;

#[derive(Default)]
struct RegistryInner {
    sessions: Vec<BorrowSession>,
    loaded: bool,
}

#[derive(Default)]
struct Listeners {
    next_id: ListenerId,
    entries: Vec<(ListenerId, Listener)>,
}

pub struct SessionRegistry {
    feed: Option<Arc<dyn SessionFeed>>,
    inner: Mutex<RegistryInner>,
    listeners: Mutex<Listeners>,
}

impl SessionRegistry {
    pub fn new(feed: Arc<dyn SessionFeed>) -> Self {
        Self {
            feed: Some(feed),
            inner: Mutex::new(RegistryInner::default()),
            listeners: Mutex::new(Listeners::default()),
        }
    }

    /// A registry populated only through `replace` and `apply_update`.
    pub fn detached() -> Self {
        Self {
            feed: None,
            inner: Mutex::new(RegistryInner::default()),
            listeners: Mutex::new(Listeners::default()),
        }
    }

    /// Active sessions from the latest snapshot, in feed order.
    pub fn active_sessions(&self) -> Vec<BorrowSession> {
        self.lock_inner()
            .sessions
            .iter()
            .filter(|s| s.is_active())
            .cloned()
            .collect()
    }

    /// Every session from the latest snapshot, terminal ones included.
    pub fn sessions(&self) -> Vec<BorrowSession> {
        self.lock_inner().sessions.clone()
    }

    pub fn status_of(&self, id: &SessionId) -> Option<BorrowStatus> {
        self.lock_inner()
            .sessions
            .iter()
            .find(|s| &s.session_id == id)
            .map(|s| s.status)
    }

    pub fn last_synced_at(&self, id: &SessionId) -> Option<DateTime<Utc>> {
        self.lock_inner()
            .sessions
            .iter()
            .find(|s| &s.session_id == id)
            .and_then(|s| s.last_location_synced_at)
    }

    /// Whether at least one full session list has been received
    pub fn is_loaded(&self) -> bool {
        self.lock_inner().loaded
    }

    /// Pull from the feed. On failure the previous snapshot stays in place so
    /// a transient outage does not look like every session ended.
    pub async fn refresh(&self) -> Result<usize, ApiError> {
        let Some(feed) = &self.feed else {
            return Ok(self.active_sessions().len());
        };

        match feed.fetch_sessions().await {
            Ok(sessions) => {
                let active = sessions.iter().filter(|s| s.is_active()).count();
                debug!(total = sessions.len(), active, "Session list refreshed");
                self.replace(sessions);
                Ok(active)
            }
            Err(e) => {
                warn!(error = %e, "Session refresh failed, keeping previous list");
                Err(e)
            }
        }
    }

    /// Install an externally fetched session list
    pub fn replace(&self, sessions: Vec<BorrowSession>) {
        {
            let mut inner = self.lock_inner();
            inner.sessions = sessions;
            inner.loaded = true;
        }
        self.notify();
    }

    /// Apply a single-session update event (status change, new borrow).
    pub fn apply_update(&self, session: BorrowSession) {
        {
            let mut inner = self.lock_inner();
            match inner
                .sessions
                .iter_mut()
                .find(|s| s.session_id == session.session_id)
            {
                Some(existing) => {
                    if existing.status != session.status {
                        info!(
                            session = %session.session_id,
                            from = %existing.status,
                            to = %session.status,
                            "Borrow status changed"
                        );
                    }
                    *existing = session;
                }
                None => inner.sessions.push(session),
            }
        }
        self.notify();
    }

    /// Record a successful location report in the local view.
    pub fn mark_synced(&self, id: &SessionId, at: DateTime<Utc>) {
        let mut inner = self.lock_inner();
        if let Some(session) = inner.sessions.iter_mut().find(|s| &s.session_id == id) {
            if session.last_location_synced_at.map_or(true, |prev| prev < at) {
                session.last_location_synced_at = Some(at);
            }
        }
    }

    pub fn on_change<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&[BorrowSession]) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.next_id += 1;
        let id = listeners.next_id;
        listeners.entries.push((id, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.entries.retain(|(entry, _)| *entry != id);
    }

    // Listeners run without any registry lock held so they may call back in.
    fn notify(&self) {
        let sessions = self.lock_inner().sessions.clone();
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .iter()
            .map(|(_, l)| l.clone())
            .collect();

        for listener in listeners {
            listener(&sessions);
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
