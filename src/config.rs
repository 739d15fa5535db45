//! Configuration Module
//!
//! Runtime settings read from `BORROW_TRACKER_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_API_URL: &str = "http://localhost:3000";

/// A fixed position reported by hosts without a real sensor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedPosition {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_meters: f64,
}

impl std::str::FromStr for FixedPosition {
    type Err = ConfigError;

    /// Parses `lat,lon` or `lat,lon,accuracy`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::Invalid {
            key: "BORROW_TRACKER_FIXED_POSITION".into(),
            value: s.to_string(),
        };

        let parts: Vec<f64> = s
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .map_err(|_| invalid())?;

        let (latitude, longitude, accuracy_meters) = match parts.as_slice() {
            [lat, lon] => (*lat, *lon, 10.0),
            [lat, lon, acc] => (*lat, *lon, *acc),
            _ => return Err(invalid()),
        };

        if !(-90.0..=90.0).contains(&latitude)
            || !(-180.0..=180.0).contains(&longitude)
            || accuracy_meters < 0.0
        {
            return Err(invalid());
        }

        Ok(Self {
            latitude,
            longitude,
            accuracy_meters,
        })
    }
}

/// Tracker settings
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub api_base_url: String,
    pub user_id: Option<String>,
    pub access_token: Option<String>,
    /// Period of the reconciliation timer
    pub tick_interval: Duration,
    /// Age after which a session's reported location is due for an update
    pub staleness_threshold: Duration,
    /// Per-fix timeout handed to the position watch
    pub sensor_timeout: Duration,
    /// Maximum age of a cached fix before the platform must take a fresh one
    pub sensor_maximum_age: Duration,
    pub http_timeout: Duration,
    /// Treat a 401/403 from the location endpoint as a global stop signal
    pub stop_on_unauthorized: bool,
    /// Pull the session list from the backend before every reconciliation
    pub refresh_sessions_each_tick: bool,
    pub fixed_position: Option<FixedPosition>,
    pub log_dir: PathBuf,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            user_id: None,
            access_token: None,
            tick_interval: Duration::from_secs(60),
            staleness_threshold: Duration::from_secs(60),
            sensor_timeout: Duration::from_secs(15),
            sensor_maximum_age: Duration::from_secs(30),
            http_timeout: Duration::from_secs(30),
            stop_on_unauthorized: false,
            refresh_sessions_each_tick: true,
            fixed_position: None,
            log_dir: default_log_directory(),
        }
    }
}

impl TrackerConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(url) = get("BORROW_TRACKER_API_URL") {
            config.api_base_url = url.trim().trim_end_matches('/').to_string();
        }
        config.user_id = get("BORROW_TRACKER_USER_ID");
        config.access_token = get("BORROW_TRACKER_TOKEN");

        if let Some(v) = get("BORROW_TRACKER_TICK_SECS") {
            config.tick_interval = parse_secs("BORROW_TRACKER_TICK_SECS", &v)?;
        }
        if let Some(v) = get("BORROW_TRACKER_STALE_SECS") {
            config.staleness_threshold = parse_secs("BORROW_TRACKER_STALE_SECS", &v)?;
        }
        if let Some(v) = get("BORROW_TRACKER_SENSOR_TIMEOUT_SECS") {
            config.sensor_timeout = parse_secs("BORROW_TRACKER_SENSOR_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("BORROW_TRACKER_SENSOR_MAX_AGE_SECS") {
            config.sensor_maximum_age = parse_secs("BORROW_TRACKER_SENSOR_MAX_AGE_SECS", &v)?;
        }
        if let Some(v) = get("BORROW_TRACKER_HTTP_TIMEOUT_SECS") {
            config.http_timeout = parse_secs("BORROW_TRACKER_HTTP_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("BORROW_TRACKER_STOP_ON_UNAUTHORIZED") {
            config.stop_on_unauthorized = parse_bool("BORROW_TRACKER_STOP_ON_UNAUTHORIZED", &v)?;
        }
        if let Some(v) = get("BORROW_TRACKER_REFRESH_EACH_TICK") {
            config.refresh_sessions_each_tick =
                parse_bool("BORROW_TRACKER_REFRESH_EACH_TICK", &v)?;
        }
        if let Some(v) = get("BORROW_TRACKER_FIXED_POSITION") {
            config.fixed_position = Some(v.parse()?);
        }
        if let Some(v) = get("BORROW_TRACKER_LOG_DIR") {
            config.log_dir = PathBuf::from(v);
        }

        Ok(config)
    }
}

fn parse_secs(key: &str, value: &str) -> Result<Duration, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(0) => Err(ConfigError::ZeroDuration(key.to_string())),
        Ok(secs) => Ok(Duration::from_secs(secs)),
        Err(_) => Err(ConfigError::Invalid {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn default_log_directory() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("BorrowTracker")
        .join("logs")
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },

    #[error("{0} must be greater than zero")]
    ZeroDuration(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = TrackerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.api_base_url, DEFAULT_API_URL);
        assert_eq!(config.tick_interval, Duration::from_secs(60));
        assert_eq!(config.staleness_threshold, Duration::from_secs(60));
        assert!(config.refresh_sessions_each_tick);
        assert!(!config.stop_on_unauthorized);
        assert!(config.fixed_position.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = TrackerConfig::from_lookup(lookup(&[
            ("BORROW_TRACKER_API_URL", "https://api.example.com/"),
            ("BORROW_TRACKER_TICK_SECS", "30"),
            ("BORROW_TRACKER_STOP_ON_UNAUTHORIZED", "yes"),
            ("BORROW_TRACKER_FIXED_POSITION", "13.75, 100.5, 25"),
            ("BORROW_TRACKER_USER_ID", "u-1"),
        ]))
        .unwrap();

        assert_eq!(config.api_base_url, "https://api.example.com");
        assert_eq!(config.tick_interval, Duration::from_secs(30));
        assert!(config.stop_on_unauthorized);
        assert_eq!(config.user_id.as_deref(), Some("u-1"));
        assert_eq!(
            config.fixed_position,
            Some(FixedPosition {
                latitude: 13.75,
                longitude: 100.5,
                accuracy_meters: 25.0
            })
        );
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            TrackerConfig::from_lookup(lookup(&[("BORROW_TRACKER_STALE_SECS", "0")])),
            Err(ConfigError::ZeroDuration(_))
        ));
        assert!(matches!(
            TrackerConfig::from_lookup(lookup(&[("BORROW_TRACKER_TICK_SECS", "soon")])),
            Err(ConfigError::Invalid { .. })
        ));
        assert!("91.0,0.0".parse::<FixedPosition>().is_err());
        assert!("1.0".parse::<FixedPosition>().is_err());
    }
}
