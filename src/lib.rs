//! Borrow Location Tracker Library
//!
//! Tracks the device location while equipment borrows are active and keeps
//! each borrow's last reported location fresh on the backend.

pub mod auth;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod logging;
pub mod model;
pub mod permission;
pub mod platform;
pub mod registry;
pub mod scheduler;
pub mod sensor;
pub mod sync;

pub use controller::{TickReport, TrackingCallbacks, TrackingController, TrackingError};
pub use model::{BorrowSession, BorrowStatus, LocationSample, OwnerId, SessionId, TrackingSnapshot};
