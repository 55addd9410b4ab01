//! Process-wide driver settings.
//!
//! Settings are read from the environment on first use unless a value was
//! installed earlier with [`install`]. They govern cancellation, the pool
//! sweeper and the defaults used by the pool registry.

use std::sync::{OnceLock, PoisonError, RwLock};
use std::time::Duration;

use monetdb_core::error::ConfigError;
use monetdb_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// What cancelling a running statement does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelStrategy {
    /// Cancellation is not supported
    #[default]
    None,
    /// Close the session's socket and drop it from its pool
    TerminateSession,
}

impl std::str::FromStr for CancelStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "none" => Ok(Self::None),
            "terminate_session" | "terminatesession" => Ok(Self::TerminateSession),
            other => Err(config_error(format!("unknown cancel strategy {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub cancel_strategy: CancelStrategy,
    /// Pause between two sweeps of the pool registry
    pub sweep_interval: Duration,
    /// Idle sessions older than this are closed by the sweeper
    pub idle_max_age: Duration,
    pub pool_min: usize,
    pub pool_max: usize,
    pub receive_timeout: Option<Duration>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cancel_strategy: CancelStrategy::None,
            sweep_interval: Duration::from_secs(1),
            idle_max_age: Duration::from_secs(5 * 60),
            pool_min: 1,
            pool_max: 10,
            receive_timeout: Some(Duration::from_secs(120)),
        }
    }
}

impl Settings {
    pub const CANCEL_STRATEGY_VAR: &'static str = "MONETDB_CANCEL_STRATEGY";
    pub const SWEEP_INTERVAL_VAR: &'static str = "MONETDB_SWEEP_INTERVAL_MS";
    pub const IDLE_MAX_AGE_VAR: &'static str = "MONETDB_IDLE_MAX_AGE_SECS";
    pub const POOL_MIN_VAR: &'static str = "MONETDB_POOL_MIN";
    pub const POOL_MAX_VAR: &'static str = "MONETDB_POOL_MAX";
    pub const RECEIVE_TIMEOUT_VAR: &'static str = "MONETDB_RECEIVE_TIMEOUT_SECS";

    /// Parse settings from a JSON document; missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            Error::Config(ConfigError {
                message: format!("invalid settings document: {e}"),
                source: Some(Box::new(e)),
            })
        })
    }

    /// Read settings from `MONETDB_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();
        if let Some(v) = lookup(Self::CANCEL_STRATEGY_VAR) {
            settings.cancel_strategy = v.parse()?;
        }
        if let Some(v) = lookup(Self::SWEEP_INTERVAL_VAR) {
            settings.sweep_interval = Duration::from_millis(parse_var(Self::SWEEP_INTERVAL_VAR, &v)?);
        }
        if let Some(v) = lookup(Self::IDLE_MAX_AGE_VAR) {
            settings.idle_max_age = Duration::from_secs(parse_var(Self::IDLE_MAX_AGE_VAR, &v)?);
        }
        if let Some(v) = lookup(Self::POOL_MIN_VAR) {
            settings.pool_min = parse_var(Self::POOL_MIN_VAR, &v)?;
        }
        if let Some(v) = lookup(Self::POOL_MAX_VAR) {
            settings.pool_max = parse_var(Self::POOL_MAX_VAR, &v)?;
        }
        if let Some(v) = lookup(Self::RECEIVE_TIMEOUT_VAR) {
            let secs: u64 = parse_var(Self::RECEIVE_TIMEOUT_VAR, &v)?;
            settings.receive_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_min == 0 || self.pool_min > self.pool_max {
            return Err(config_error(format!(
                "pool bounds must satisfy 1 <= min <= max, got min={} max={}",
                self.pool_min, self.pool_max
            )));
        }
        if self.sweep_interval.is_zero() {
            return Err(config_error("sweep interval must be positive"));
        }
        Ok(())
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value.trim().parse().map_err(|e: T::Err| {
        Error::Config(ConfigError {
            message: format!("invalid value {value:?} for {name}"),
            source: Some(Box::new(e)),
        })
    })
}

fn config_error(message: impl Into<String>) -> Error {
    Error::Config(ConfigError {
        message: message.into(),
        source: None,
    })
}

static SETTINGS: OnceLock<RwLock<Settings>> = OnceLock::new();

fn global() -> &'static RwLock<Settings> {
    SETTINGS.get_or_init(|| {
        let settings = Settings::from_env().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "ignoring invalid MONETDB_* settings");
            Settings::default()
        });
        RwLock::new(settings)
    })
}

/// Replace the process-wide settings.
pub fn install(settings: Settings) -> Result<()> {
    settings.validate()?;
    tracing::debug!(?settings, "installing driver settings");
    *global().write().unwrap_or_else(PoisonError::into_inner) = settings;
    Ok(())
}

/// Snapshot of the process-wide settings.
pub fn current() -> Settings {
    global()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.cancel_strategy, CancelStrategy::None);
        assert_eq!(settings.sweep_interval, Duration::from_secs(1));
        assert_eq!(settings.idle_max_age, Duration::from_secs(300));
    }

    #[test]
    fn test_environment_overrides() {
        let settings = Settings::from_lookup(lookup(&[
            ("MONETDB_CANCEL_STRATEGY", "terminate-session"),
            ("MONETDB_SWEEP_INTERVAL_MS", "250"),
            ("MONETDB_IDLE_MAX_AGE_SECS", "60"),
            ("MONETDB_POOL_MIN", "2"),
            ("MONETDB_POOL_MAX", "4"),
            ("MONETDB_RECEIVE_TIMEOUT_SECS", "0"),
        ]))
        .unwrap();
        assert_eq!(settings.cancel_strategy, CancelStrategy::TerminateSession);
        assert_eq!(settings.sweep_interval, Duration::from_millis(250));
        assert_eq!(settings.idle_max_age, Duration::from_secs(60));
        assert_eq!((settings.pool_min, settings.pool_max), (2, 4));
        assert_eq!(settings.receive_timeout, None);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            Settings::from_lookup(lookup(&[("MONETDB_POOL_MAX", "many")])),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Settings::from_lookup(lookup(&[("MONETDB_CANCEL_STRATEGY", "abort")])),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Settings::from_lookup(lookup(&[("MONETDB_POOL_MIN", "5"), ("MONETDB_POOL_MAX", "2")])),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_from_json() {
        let settings =
            Settings::from_json(r#"{"cancel_strategy":"terminate_session","pool_max":3}"#)
                .unwrap();
        assert_eq!(settings.cancel_strategy, CancelStrategy::TerminateSession);
        assert_eq!(settings.pool_max, 3);
        assert_eq!(settings.pool_min, 1);
        assert!(Settings::from_json("{").is_err());
    }
}
