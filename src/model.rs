//! Domain Model
//!
//! Location samples, borrow session projections and the observable tracking snapshot.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Opaque borrow session identifier.
///
/// The backend sends `borrow_id` as either a number or a string; both decode to the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<u64> for SessionId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Number(i64),
            Text(String),
        }

        match RawId::deserialize(deserializer)? {
            RawId::Number(n) => Ok(Self(n.to_string())),
            RawId::Text(s) => Ok(Self(s)),
        }
    }
}

/// Identifies a UI owner (app shell, page component, daemon) that registered for tracking.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// One reading of the device position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_meters: f64,
    pub captured_at: DateTime<Utc>,
}

impl LocationSample {
    pub fn new(latitude: f64, longitude: f64, accuracy_meters: f64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy_meters,
            captured_at: Utc::now(),
        }
    }
}

/// Borrow status as reported by the borrow-management backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BorrowStatus {
    Pending,
    Approved,
    Carry,
    Overdue,
    Completed,
    Returned,
    Rejected,
    #[serde(alias = "cancelled")]
    Canceled,
    #[serde(other)]
    Other,
}

impl BorrowStatus {
    /// Equipment is checked out and the session is entitled to location reporting.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Approved | Self::Carry | Self::Overdue)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Returned | Self::Rejected | Self::Canceled
        )
    }
}

impl std::fmt::Display for BorrowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Carry => "carry",
            Self::Overdue => "overdue",
            Self::Completed => "completed",
            Self::Returned => "returned",
            Self::Rejected => "rejected",
            Self::Canceled => "canceled",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

/// Projection of a borrow record: only the fields location tracking needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BorrowSession {
    #[serde(rename = "borrow_id")]
    pub session_id: SessionId,
    pub status: BorrowStatus,
    #[serde(
        rename = "last_location_update",
        default,
        deserialize_with = "deserialize_optional_timestamp"
    )]
    pub last_location_synced_at: Option<DateTime<Utc>>,
}

impl BorrowSession {
    pub fn new(session_id: impl Into<SessionId>, status: BorrowStatus) -> Self {
        Self {
            session_id: session_id.into(),
            status,
            last_location_synced_at: None,
        }
    }

    pub fn synced_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_location_synced_at = Some(at);
        self
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

// Backends differ on whether timestamps carry an offset; offset-less values are UTC.
fn deserialize_optional_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    let Some(raw) = raw.filter(|s| !s.trim().is_empty()) else {
        return Ok(None);
    };

    parse_timestamp(raw.trim())
        .map(Some)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", raw)))
}

pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Lifecycle of the reconciliation timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Idle,
    Armed,
    Running,
}

/// Observable tracking state, published to subscribers on every change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingSnapshot {
    pub is_tracking: bool,
    pub last_location: Option<LocationSample>,
    pub active_session_ids: Vec<SessionId>,
    pub scheduler_state: SchedulerState,
    pub owner_count: usize,
}

impl Default for TrackingSnapshot {
    fn default() -> Self {
        Self {
            is_tracking: false,
            last_location: None,
            active_session_ids: Vec::new(),
            scheduler_state: SchedulerState::Idle,
            owner_count: 0,
        }
    }
}
