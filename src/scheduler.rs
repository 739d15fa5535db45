//! Reconciliation Scheduler
//!
//! Fixed-period timer plus the staleness rule that decides which sessions
//! are due for a location update.
//!
//! States: `Idle` (no timer) → `Armed` (timer waiting) → `Running` (tick in
//! progress) → back to `Armed`, or `Idle` once disarmed.
//!
//! While idle the scheduler can also run a feed poll on the same period so
//! new sessions are picked up. Polling does not change the state.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::model::{SchedulerState, SessionId};

pub struct ReconciliationScheduler {
    period: Duration,
    threshold: Duration,
    state: SchedulerState,
    timer: Option<JoinHandle<()>>,
    poller: Option<JoinHandle<()>>,
    // Successful reports made by this process; the registry may lag behind.
    local_sync: HashMap<SessionId, DateTime<Utc>>,
}

impl ReconciliationScheduler {
    pub fn new(period: Duration, threshold: Duration) -> Self {
        Self {
            period,
            threshold,
            state: SchedulerState::Idle,
            timer: None,
            poller: None,
            local_sync: HashMap::new(),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn is_armed(&self) -> bool {
        self.timer.is_some()
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Start the timer. The first tick fires one period from now. Ticks are
    /// awaited in sequence and missed ticks are skipped. `on_tick` returning
    /// `false` ends the loop.
    pub fn arm<F, Fut>(&mut self, runtime: &Handle, on_tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        if self.timer.is_some() {
            return;
        }

        self.timer = Some(spawn_interval(runtime, self.period, on_tick));
        if self.state == SchedulerState::Idle {
            self.state = SchedulerState::Armed;
        }
        info!(period_secs = self.period.as_secs(), "Reconciliation timer armed");
    }

    pub fn is_polling(&self) -> bool {
        self.poller.is_some()
    }

    /// Start the idle feed poll, with the same timing rules as `arm`.
    pub fn start_polling<F, Fut>(&mut self, runtime: &Handle, on_poll: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        if self.poller.is_some() {
            return;
        }
        self.poller = Some(spawn_interval(runtime, self.period, on_poll));
        debug!(period_secs = self.period.as_secs(), "Idle feed poll started");
    }

    pub fn stop_polling(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
            debug!("Idle feed poll stopped");
        }
    }

    /// Stop the timer. No tick starts after this returns.
    pub fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
            info!("Reconciliation timer disarmed");
        }
        self.state = SchedulerState::Idle;
    }

    pub fn begin_tick(&mut self) {
        self.state = SchedulerState::Running;
    }

    pub fn end_tick(&mut self) {
        self.state = if self.timer.is_some() {
            SchedulerState::Armed
        } else {
            SchedulerState::Idle
        };
    }

    /// Due iff never synced, or synced at least `threshold` ago.
    pub fn is_due(&self, now: DateTime<Utc>, last_synced: Option<DateTime<Utc>>) -> bool {
        match last_synced {
            None => true,
            // A sync stamped in the future (clock skew) counts as fresh.
            Some(at) => (now - at).to_std().map_or(false, |age| age >= self.threshold),
        }
    }

    /// Sessions due for an update, in candidate order. The effective sync
    /// time is the later of the reported one and the locally recorded one.
    pub fn due_sessions<I>(&self, now: DateTime<Utc>, candidates: I) -> Vec<SessionId>
    where
        I: IntoIterator<Item = (SessionId, Option<DateTime<Utc>>)>,
    {
        candidates
            .into_iter()
            .filter(|(id, reported)| {
                let local = self.local_sync.get(id).copied();
                let effective = match (*reported, local) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                };
                let due = self.is_due(now, effective);
                if !due {
                    debug!(session = %id, "Session location is fresh");
                }
                due
            })
            .map(|(id, _)| id)
            .collect()
    }

    pub fn record_sync(&mut self, id: &SessionId, at: DateTime<Utc>) {
        let entry = self.local_sync.entry(id.clone()).or_insert(at);
        if *entry < at {
            *entry = at;
        }
    }

    /// Forget local sync times for sessions that are no longer tracked.
    pub fn retain(&mut self, active: &[SessionId]) {
        self.local_sync.retain(|id, _| active.contains(id));
    }

    pub fn reset(&mut self) {
        self.disarm();
        self.stop_polling();
        self.local_sync.clear();
    }
}

impl Drop for ReconciliationScheduler {
    fn drop(&mut self) {
        for task in [self.timer.take(), self.poller.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

fn spawn_interval<F, Fut>(runtime: &Handle, period: Duration, mut on_tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    runtime.spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if !on_tick().await {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn scheduler() -> ReconciliationScheduler {
        ReconciliationScheduler::new(Duration::from_secs(60), Duration::from_secs(60))
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    #[test]
    fn test_staleness_threshold() {
        let s = scheduler();
        let now = Utc::now();

        assert!(s.is_due(now, None), "never synced");
        assert!(!s.is_due(now, Some(now - secs(30))), "30s ago is fresh");
        assert!(s.is_due(now, Some(now - secs(60))), "exactly the threshold is due");
        assert!(s.is_due(now, Some(now - secs(600))));
        assert!(!s.is_due(now, Some(now + secs(10))), "future stamp is fresh");
    }

    #[test]
    fn test_due_sessions_keep_candidate_order() {
        let s = scheduler();
        let now = Utc::now();
        let due = s.due_sessions(
            now,
            vec![
                (SessionId::from(3), None),
                (SessionId::from(1), Some(now - secs(10))),
                (SessionId::from(2), Some(now - secs(120))),
            ],
        );
        assert_eq!(due, vec![SessionId::from(3), SessionId::from(2)]);
    }

    #[test]
    fn test_local_sync_overrides_stale_report() {
        let mut s = scheduler();
        let now = Utc::now();
        let id = SessionId::from(42);

        s.record_sync(&id, now - secs(5));
        assert!(s.due_sessions(now, vec![(id.clone(), None)]).is_empty());
        assert!(s
            .due_sessions(now, vec![(id.clone(), Some(now - secs(300)))])
            .is_empty());

        s.retain(&[]);
        assert_eq!(s.due_sessions(now, vec![(id.clone(), None)]), vec![id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_ticks_each_period_until_disarmed() {
        let mut s = scheduler();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();

        s.arm(&Handle::current(), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            }
        });
        assert_eq!(s.state(), SchedulerState::Armed);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0, "first tick is one period out");

        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);

        s.disarm();
        assert_eq!(s.state(), SchedulerState::Idle);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_is_idempotent() {
        let mut s = scheduler();
        let ticks = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter = ticks.clone();
            s.arm(&Handle::current(), move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    true
                }
            });
        }

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_poll_keeps_state_idle_and_stops_on_reset() {
        let mut s = scheduler();
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = polls.clone();

        s.start_polling(&Handle::current(), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            }
        });
        assert!(s.is_polling());
        assert_eq!(s.state(), SchedulerState::Idle);

        tokio::time::sleep(Duration::from_secs(121)).await;
        assert_eq!(polls.load(Ordering::SeqCst), 2);

        s.reset();
        assert!(!s.is_polling());
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(polls.load(Ordering::SeqCst), 2);
    }
}
