//! Borrow Tracker - Headless Entry Point
//!
//! Runs location tracking for the configured user's active borrows until
//! interrupted.

use std::sync::{Arc, Mutex};

use anyhow::Context;
use tracing::{error, info, warn};

use borrow_tracker_lib::{
    auth::{AuthManager, AuthSession},
    config::TrackerConfig,
    dispatcher::HttpDispatcher,
    logging,
    platform::{FixedPlatform, GeolocationPlatform, UnsupportedPlatform},
    registry::{HttpSessionFeed, SessionRegistry},
    sync::ApiClient,
    OwnerId, TrackingCallbacks, TrackingController,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = TrackerConfig::from_env().context("invalid tracker configuration")?;
    let _log_guard = logging::init(&config.log_dir);
    info!(api = %config.api_base_url, "Borrow tracker starting...");

    let mut auth = AuthManager::new();
    match (&config.access_token, &config.user_id) {
        (Some(token), Some(user_id)) => auth.set_session(AuthSession::new(token, user_id)),
        _ => warn!("BORROW_TRACKER_TOKEN / BORROW_TRACKER_USER_ID not set, backend calls will be rejected"),
    }
    let auth = Arc::new(Mutex::new(auth));

    let api = ApiClient::new(&config.api_base_url, config.http_timeout)
        .context("failed to create HTTP client")?;

    let platform: Arc<dyn GeolocationPlatform> = match config.fixed_position {
        Some(position) => Arc::new(FixedPlatform::new(position)),
        None => Arc::new(UnsupportedPlatform),
    };

    let registry = Arc::new(SessionRegistry::new(Arc::new(HttpSessionFeed::new(
        api.clone(),
        auth.clone(),
    ))));
    let dispatcher = Arc::new(HttpDispatcher::new(api, auth));
    let controller = TrackingController::new(&config, platform, registry.clone(), dispatcher);

    if let Err(e) = registry.refresh().await {
        warn!(error = %e, "Initial session refresh failed");
    }
    let active: Vec<_> = registry
        .active_sessions()
        .into_iter()
        .map(|s| s.session_id)
        .collect();
    info!(active = active.len(), "Active borrow sessions loaded");

    let owner = OwnerId::from("daemon");
    let callbacks = TrackingCallbacks::new()
        .on_sample(|sample| {
            info!(
                lat = sample.latitude,
                lon = sample.longitude,
                accuracy = sample.accuracy_meters,
                "Location sample"
            )
        })
        .on_error(|e| warn!(error = %e, "Tracking error"));

    if let Err(e) = controller.start(owner.clone(), callbacks, active).await {
        error!(error = %e, "Location tracking unavailable");
        return Err(e.into());
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    controller.stop(&owner);
    info!("Borrow tracker stopped");
    Ok(())
}
