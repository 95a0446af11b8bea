//! Runtime configuration.
//!
//! Values come from the process environment (after `dotenvy` has loaded a
//! `.env` file, if any). Every field has a default; a variable that is set
//! but does not parse is a configuration error rather than being ignored.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::database::MaintenanceConfig;
use crate::notification::BackoffPolicy;
use crate::{Error, Result};

pub const DEFAULT_DATABASE_URL: &str = "sqlite:notify.db?mode=rwc";
pub const DEFAULT_LOG_DIR: &str = "logs";

/// Tunables for dispatch, retry and maintenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Attempts per notification unless the subscription overrides it.
    pub default_max_attempts: u32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    /// Send timeout for channels whose config carries none.
    pub send_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// How long a worker owns a claimed row. Renewed per send to cover the
    /// channel timeout.
    pub claim_lease_secs: u64,
    pub event_poll_interval_ms: u64,
    pub event_batch_size: u32,
    pub sweep_batch_size: u32,
    pub max_concurrent_events: usize,
    pub max_concurrent_sends: usize,
    pub retention_days: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: 3,
            backoff_base_secs: 30,
            backoff_max_secs: 3600,
            send_timeout_secs: 30,
            sweep_interval_secs: 30,
            claim_lease_secs: 120,
            event_poll_interval_ms: 1000,
            event_batch_size: 100,
            sweep_batch_size: 100,
            max_concurrent_events: 8,
            max_concurrent_sends: 32,
            retention_days: 30,
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| Error::config(format!("{}={:?}: {}", key, raw, e))),
        _ => Ok(default),
    }
}

impl DispatchConfig {
    /// Read `NOTIFY_*` variables from the environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup, falling back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let d = Self::default();
        let config = Self {
            default_max_attempts: parse_var(&lookup, "NOTIFY_MAX_ATTEMPTS", d.default_max_attempts)?,
            backoff_base_secs: parse_var(&lookup, "NOTIFY_BACKOFF_BASE_SECS", d.backoff_base_secs)?,
            backoff_max_secs: parse_var(&lookup, "NOTIFY_BACKOFF_MAX_SECS", d.backoff_max_secs)?,
            send_timeout_secs: parse_var(&lookup, "NOTIFY_SEND_TIMEOUT_SECS", d.send_timeout_secs)?,
            sweep_interval_secs: parse_var(
                &lookup,
                "NOTIFY_SWEEP_INTERVAL_SECS",
                d.sweep_interval_secs,
            )?,
            claim_lease_secs: parse_var(&lookup, "NOTIFY_CLAIM_LEASE_SECS", d.claim_lease_secs)?,
            event_poll_interval_ms: parse_var(
                &lookup,
                "NOTIFY_EVENT_POLL_INTERVAL_MS",
                d.event_poll_interval_ms,
            )?,
            event_batch_size: parse_var(&lookup, "NOTIFY_EVENT_BATCH_SIZE", d.event_batch_size)?,
            sweep_batch_size: parse_var(&lookup, "NOTIFY_SWEEP_BATCH_SIZE", d.sweep_batch_size)?,
            max_concurrent_events: parse_var(
                &lookup,
                "NOTIFY_MAX_CONCURRENT_EVENTS",
                d.max_concurrent_events,
            )?,
            max_concurrent_sends: parse_var(
                &lookup,
                "NOTIFY_MAX_CONCURRENT_SENDS",
                d.max_concurrent_sends,
            )?,
            retention_days: parse_var(&lookup, "NOTIFY_RETENTION_DAYS", d.retention_days)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("default_max_attempts", u64::from(self.default_max_attempts)),
            ("backoff_base_secs", self.backoff_base_secs),
            ("backoff_max_secs", self.backoff_max_secs),
            ("send_timeout_secs", self.send_timeout_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("claim_lease_secs", self.claim_lease_secs),
            ("event_poll_interval_ms", self.event_poll_interval_ms),
            ("event_batch_size", u64::from(self.event_batch_size)),
            ("sweep_batch_size", u64::from(self.sweep_batch_size)),
            ("max_concurrent_events", self.max_concurrent_events as u64),
            ("max_concurrent_sends", self.max_concurrent_sends as u64),
            ("retention_days", u64::from(self.retention_days)),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(Error::config(format!("{} must be greater than zero", name)));
        }
        if self.backoff_max_secs < self.backoff_base_secs {
            return Err(Error::config(
                "backoff_max_secs must not be smaller than backoff_base_secs",
            ));
        }
        if self.claim_lease_secs <= self.send_timeout_secs {
            return Err(Error::config(format!(
                "claim_lease_secs ({}) must exceed send_timeout_secs ({})",
                self.claim_lease_secs, self.send_timeout_secs
            )));
        }
        Ok(())
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_secs(self.backoff_base_secs),
            Duration::from_secs(self.backoff_max_secs),
        )
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.claim_lease_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn event_poll_interval(&self) -> Duration {
        Duration::from_millis(self.event_poll_interval_ms)
    }

    pub fn maintenance(&self) -> MaintenanceConfig {
        MaintenanceConfig {
            retention_days: self.retention_days,
            ..MaintenanceConfig::default()
        }
    }
}

/// Process-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_url: String,
    pub log_dir: String,
    pub dispatch: DispatchConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            log_dir: DEFAULT_LOG_DIR.to_string(),
            dispatch: DispatchConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Self {
            database_url: lookup("DATABASE_URL")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            log_dir: lookup("NOTIFY_LOG_DIR")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_LOG_DIR.to_string()),
            dispatch: DispatchConfig::from_lookup(lookup)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.log_dir, "logs");
        assert_eq!(config.dispatch, DispatchConfig::default());
        assert_eq!(config.dispatch.backoff().delay_for(1), Duration::from_secs(30));
        assert_eq!(config.dispatch.maintenance().retention_days, 30);
    }

    #[test]
    fn test_overrides() {
        let config = DispatchConfig::from_lookup(lookup(&[
            ("NOTIFY_MAX_ATTEMPTS", "5"),
            ("NOTIFY_BACKOFF_BASE_SECS", " 10 "),
            ("NOTIFY_MAX_CONCURRENT_SENDS", "4"),
            ("NOTIFY_RETENTION_DAYS", ""),
        ]))
        .unwrap();
        assert_eq!(config.default_max_attempts, 5);
        assert_eq!(config.backoff_base_secs, 10);
        assert_eq!(config.max_concurrent_sends, 4);
        assert_eq!(config.retention_days, 30);
    }

    #[test]
    fn test_unparseable_value_is_config_error() {
        let err = DispatchConfig::from_lookup(lookup(&[("NOTIFY_SWEEP_INTERVAL_SECS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("NOTIFY_SWEEP_INTERVAL_SECS"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let zero_attempts = DispatchConfig {
            default_max_attempts: 0,
            ..Default::default()
        };
        assert!(zero_attempts.validate().is_err());

        let short_lease = DispatchConfig {
            claim_lease_secs: 30,
            ..Default::default()
        };
        assert!(short_lease.validate().is_err());

        let inverted_backoff = DispatchConfig {
            backoff_base_secs: 60,
            backoff_max_secs: 30,
            ..Default::default()
        };
        assert!(inverted_backoff.validate().is_err());

        assert!(DispatchConfig::default().validate().is_ok());
    }
}
