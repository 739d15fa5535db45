//! Permission Gate
//!
//! Decides whether location sampling may run. Passive checks never prompt;
//! `ensure_access` and `request_access` may surface the host's consent
//! dialog, and concurrent `ensure_access` callers share one dialog.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::platform::{GeolocationPlatform, PermissionState};

/// Result of a passive permission check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionStatus {
    Granted,
    Denied,
    Prompt,
    Unknown,
    Unsupported,
}

/// Result of an access request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessOutcome {
    Granted,
    Denied,
    Unsupported,
    Unknown,
}

pub struct PermissionGate {
    platform: Arc<dyn GeolocationPlatform>,
    // Held while the consent dialog is up; stores the answer of the last one.
    prompt: Mutex<Option<AccessOutcome>>,
    prompts_issued: AtomicU64,
}

impl PermissionGate {
    pub fn new(platform: Arc<dyn GeolocationPlatform>) -> Self {
        Self {
            platform,
            prompt: Mutex::new(None),
            prompts_issued: AtomicU64::new(0),
        }
    }

    /// Non-prompting check, safe to call on every mount.
    pub fn check(&self) -> PermissionStatus {
        if !self.platform.is_supported() {
            return PermissionStatus::Unsupported;
        }

        match self.platform.query_permission() {
            PermissionState::Granted => PermissionStatus::Granted,
            PermissionState::Denied => PermissionStatus::Denied,
            PermissionState::Prompt => PermissionStatus::Prompt,
            PermissionState::Unknown => PermissionStatus::Unknown,
        }
    }

    /// Access check used when tracking starts. Decided states are returned
    /// without prompting. Callers that arrive while a dialog is already up
    /// wait for it and share its answer instead of prompting again.
    pub async fn ensure_access(&self) -> AccessOutcome {
        if let Some(decided) = self.decided() {
            return decided;
        }

        let seen = self.prompts_issued.load(Ordering::SeqCst);
        let mut last = self.prompt.lock().await;
        if self.prompts_issued.load(Ordering::SeqCst) != seen {
            if let Some(outcome) = *last {
                debug!(?outcome, "Reusing answer from concurrent permission prompt");
                return outcome;
            }
        }

        // The dialog may have been answered elsewhere while we waited.
        if let Some(decided) = self.decided() {
            return decided;
        }
        self.prompt_locked(&mut last).await
    }

    /// Explicit, user-initiated request. Fails fast when unsupported and
    /// returns a decided state as is; otherwise prompts exactly once.
    pub async fn request_access(&self) -> AccessOutcome {
        if let Some(decided) = self.decided() {
            return decided;
        }

        let mut last = self.prompt.lock().await;
        self.prompt_locked(&mut last).await
    }

    fn decided(&self) -> Option<AccessOutcome> {
        match self.check() {
            PermissionStatus::Unsupported => {
                warn!("Location API unsupported on this host");
                Some(AccessOutcome::Unsupported)
            }
            PermissionStatus::Granted => Some(AccessOutcome::Granted),
            PermissionStatus::Denied => {
                warn!("Location permission denied");
                Some(AccessOutcome::Denied)
            }
            PermissionStatus::Prompt | PermissionStatus::Unknown => None,
        }
    }

    async fn prompt_locked(&self, last: &mut Option<AccessOutcome>) -> AccessOutcome {
        let outcome = match self.platform.request_permission().await {
            PermissionState::Granted => AccessOutcome::Granted,
            PermissionState::Denied => AccessOutcome::Denied,
            PermissionState::Prompt | PermissionState::Unknown => AccessOutcome::Unknown,
        };
        *last = Some(outcome);
        self.prompts_issued.fetch_add(1, Ordering::SeqCst);

        info!(?outcome, "Location permission requested");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{PositionSink, SensorError, UnsupportedPlatform, WatchId, WatchOptions};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct PromptingPlatform {
        state: PermissionState,
        answer: PermissionState,
        prompts: AtomicUsize,
    }

    impl PromptingPlatform {
        fn new(state: PermissionState, answer: PermissionState) -> Arc<Self> {
            Arc::new(Self {
                state,
                answer,
                prompts: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl GeolocationPlatform for PromptingPlatform {
        fn is_supported(&self) -> bool {
            true
        }

        fn query_permission(&self) -> PermissionState {
            self.state
        }

        async fn request_permission(&self) -> PermissionState {
            self.prompts.fetch_add(1, Ordering::SeqCst);
            // Stay "in the dialog" across a scheduling point.
            tokio::task::yield_now().await;
            self.answer
        }

        fn watch_position(&self, _: WatchOptions, _: PositionSink) -> Result<WatchId, SensorError> {
            Ok(WatchId(1))
        }

        fn clear_watch(&self, _: WatchId) {}
    }

    #[tokio::test]
    async fn test_unsupported_fails_fast() {
        let gate = PermissionGate::new(Arc::new(UnsupportedPlatform));
        assert_eq!(gate.check(), PermissionStatus::Unsupported);
        assert_eq!(gate.request_access().await, AccessOutcome::Unsupported);
    }

    #[tokio::test]
    async fn test_passive_check_never_prompts() {
        let platform = PromptingPlatform::new(PermissionState::Prompt, PermissionState::Granted);
        let gate = PermissionGate::new(platform.clone());

        assert_eq!(gate.check(), PermissionStatus::Prompt);
        assert_eq!(gate.check(), PermissionStatus::Prompt);
        assert_eq!(platform.prompts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_request_prompts_once_when_undecided() {
        let platform = PromptingPlatform::new(PermissionState::Prompt, PermissionState::Denied);
        let gate = PermissionGate::new(platform.clone());

        assert_eq!(gate.request_access().await, AccessOutcome::Denied);
        assert_eq!(platform.prompts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_decided_state_skips_prompt() {
        let granted = PromptingPlatform::new(PermissionState::Granted, PermissionState::Denied);
        let gate = PermissionGate::new(granted.clone());
        assert_eq!(gate.request_access().await, AccessOutcome::Granted);
        assert_eq!(granted.prompts.load(Ordering::SeqCst), 0);

        let denied = PromptingPlatform::new(PermissionState::Denied, PermissionState::Granted);
        let gate = PermissionGate::new(denied.clone());
        assert_eq!(gate.request_access().await, AccessOutcome::Denied);
        assert_eq!(denied.prompts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ensure_access_shares_one_prompt_between_concurrent_callers() {
        let platform = PromptingPlatform::new(PermissionState::Prompt, PermissionState::Granted);
        let gate = PermissionGate::new(platform.clone());

        let (first, second) = tokio::join!(gate.ensure_access(), gate.ensure_access());

        assert_eq!(first, AccessOutcome::Granted);
        assert_eq!(second, AccessOutcome::Granted);
        assert_eq!(platform.prompts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_request_access_prompts_on_every_explicit_retry() {
        // The host keeps reporting "prompt" after a dismissed dialog.
        let platform = PromptingPlatform::new(PermissionState::Prompt, PermissionState::Prompt);
        let gate = PermissionGate::new(platform.clone());

        assert_eq!(gate.request_access().await, AccessOutcome::Unknown);
        assert_eq!(gate.request_access().await, AccessOutcome::Unknown);
        assert_eq!(platform.prompts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_ensure_access_skips_prompt_when_decided() {
        let platform = PromptingPlatform::new(PermissionState::Denied, PermissionState::Granted);
        let gate = PermissionGate::new(platform.clone());

        assert_eq!(gate.ensure_access().await, AccessOutcome::Denied);
        assert_eq!(platform.prompts.load(Ordering::SeqCst), 0);
    }
}
