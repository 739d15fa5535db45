//! Sample Source
//!
//! Owns the single continuous position watch for the process.

use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::model::LocationSample;
use crate::platform::{GeolocationPlatform, PositionSink, SensorError, WatchId, WatchOptions};

/// Handle to the live subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionHandle {
    watch: WatchId,
}

impl SubscriptionHandle {
    pub fn watch_id(&self) -> WatchId {
        self.watch
    }
}

pub struct SampleSource {
    platform: Arc<dyn GeolocationPlatform>,
    options: WatchOptions,
    active: Mutex<Option<SubscriptionHandle>>,
}

impl SampleSource {
    pub fn new(platform: Arc<dyn GeolocationPlatform>, options: WatchOptions) -> Self {
        Self {
            platform,
            options,
            active: Mutex::new(None),
        }
    }

    /// Start the watch. While a subscription is live, further calls return
    /// the existing handle and their callbacks are dropped.
    pub fn subscribe<S, E>(&self, on_sample: S, on_error: E) -> Result<SubscriptionHandle, SensorError>
    where
        S: Fn(LocationSample) + Send + Sync + 'static,
        E: Fn(SensorError) + Send + Sync + 'static,
    {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = *active {
            debug!(watch = handle.watch.0, "Position watch already running");
            return Ok(handle);
        }

        let sink: PositionSink = Arc::new(move |event| match event {
            Ok(sample) => on_sample(sample),
            Err(e) => {
                warn!(error = %e, "Position watch reported an error");
                on_error(e)
            }
        });

        let watch = self.platform.watch_position(self.options, sink)?;
        let handle = SubscriptionHandle { watch };
        *active = Some(handle);

        info!(
            watch = watch.0,
            high_accuracy = self.options.high_accuracy,
            timeout_secs = self.options.timeout.as_secs(),
            max_age_secs = self.options.maximum_age.as_secs(),
            "Position watch started"
        );
        Ok(handle)
    }

    /// Release the watch; a no-op when nothing is subscribed.
    pub fn unsubscribe(&self) {
        let handle = self.active.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            self.platform.clear_watch(handle.watch);
            info!(watch = handle.watch.0, "Position watch released");
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.active.lock().map(|a| a.is_some()).unwrap_or(false)
    }
}

impl Drop for SampleSource {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
