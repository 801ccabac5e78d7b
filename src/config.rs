//! Application-level configuration loading: hold timing and storage backend selection.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use serde_with::{DurationMilliSeconds, serde_as};
use tracing::{info, warn};

use crate::state::hold::{EscalationWindows, HoldPolicy, SkipPolicy};

/// Default location on disk where the server looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/app.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "DISC_HOLD_BACK_CONFIG_PATH";
/// Environment variable that sets or overrides the administrative token.
const ADMIN_TOKEN_ENV: &str = "DISC_HOLD_BACK_ADMIN_TOKEN";

const DEFAULT_HOLD_TIMEOUT: Duration = Duration::from_millis(180_000);
const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Which document store the server connects to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Process-local store; state is lost on restart.
    #[default]
    Memory,
    /// MongoDB, configured through `MONGO_URI` / `MONGO_DB`.
    Mongo,
    /// CouchDB, configured through the `COUCH_*` variables.
    Couch,
}

/// Timing rules applied to every new hold and to the sweeper.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HoldSettings {
    /// Total length of a hold.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "timeout_ms")]
    pub timeout: Duration,
    /// Remaining time at which a hold escalates to `warning`.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "warning_remaining_ms")]
    pub warning_remaining: Duration,
    /// Remaining time at which a hold escalates to `critical`.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "critical_remaining_ms")]
    pub critical_remaining: Duration,
    /// Period of the sweeper.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "tick_interval_ms")]
    pub tick_interval: Duration,
    /// How a tick that crossed several thresholds is applied.
    pub skip_policy: SkipPolicy,
}

impl Default for HoldSettings {
    fn default() -> Self {
        let windows = EscalationWindows::default();
        Self {
            timeout: DEFAULT_HOLD_TIMEOUT,
            warning_remaining: windows.warning_remaining,
            critical_remaining: windows.critical_remaining,
            tick_interval: DEFAULT_TICK_INTERVAL,
            skip_policy: SkipPolicy::default(),
        }
    }
}

impl HoldSettings {
    /// Check that the windows nest inside the timeout and the tick is non-zero.
    fn validate(&self) -> Result<(), String> {
        if self.tick_interval.is_zero() {
            return Err("tick_interval_ms must be positive".into());
        }
        if self.timeout.is_zero() {
            return Err("timeout_ms must be positive".into());
        }
        if self.critical_remaining >= self.warning_remaining {
            return Err("critical_remaining_ms must be below warning_remaining_ms".into());
        }
        if self.warning_remaining >= self.timeout {
            return Err("warning_remaining_ms must be below timeout_ms".into());
        }
        Ok(())
    }
}

/// Storage section of the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Which document store the service connects to.
    pub backend: StorageBackend,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
/// Immutable runtime configuration shared across the application.
pub struct AppConfig {
    /// Hold timing.
    pub hold: HoldSettings,
    /// Storage backend selection.
    pub storage: StorageSettings,
    /// Token expected in `X-Admin-Token`; admin routes are closed when unset.
    pub admin_token: Option<String>,
}

impl AppConfig {
    /// Load the application configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let mut config = Self::load_file();
        if let Some(token) = env::var(ADMIN_TOKEN_ENV).ok().filter(|t| !t.is_empty()) {
            config.admin_token = Some(token);
        }
        if config.admin_token.is_none() {
            warn!("no admin token configured; admin routes are disabled");
        }
        config
    }

    fn load_file() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match Self::parse(&contents) {
                Ok(config) => {
                    info!(
                        path = %path.display(),
                        timeout_ms = config.hold.timeout.as_millis() as u64,
                        tick_ms = config.hold.tick_interval.as_millis() as u64,
                        skip_policy = ?config.hold.skip_policy,
                        backend = ?config.storage.backend,
                        "loaded configuration"
                    );
                    config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "invalid config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }

    /// Parse and validate a JSON document.
    pub fn parse(contents: &str) -> Result<Self, String> {
        let config: Self = serde_json::from_str(contents).map_err(|err| err.to_string())?;
        config.hold.validate()?;
        Ok(config)
    }

    /// Escalation rules derived from the hold settings.
    pub fn hold_policy(&self) -> HoldPolicy {
        HoldPolicy {
            windows: EscalationWindows {
                warning_remaining: self.hold.warning_remaining,
                critical_remaining: self.hold.critical_remaining,
            },
            skip: self.hold.skip_policy,
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = AppConfig::parse("{}").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.hold.timeout, Duration::from_secs(180));
        assert_eq!(config.hold_policy(), HoldPolicy::default());
    }

    #[test]
    fn partial_hold_section_keeps_other_defaults() {
        let config = AppConfig::parse(
            r#"{"hold": {"tick_interval_ms": 1000, "skip_policy": "step"}, "storage": {"backend": "couch"}}"#,
        )
        .unwrap();

        assert_eq!(config.hold.tick_interval, Duration::from_secs(1));
        assert_eq!(config.hold.skip_policy, SkipPolicy::Step);
        assert_eq!(config.hold.timeout, Duration::from_secs(180));
        assert_eq!(config.storage.backend, StorageBackend::Couch);
    }

    #[test]
    fn windows_must_nest_inside_the_timeout() {
        let err = AppConfig::parse(r#"{"hold": {"timeout_ms": 100000}}"#).unwrap_err();
        assert!(err.contains("warning_remaining_ms"));

        let err = AppConfig::parse(
            r#"{"hold": {"warning_remaining_ms": 30000, "critical_remaining_ms": 60000}}"#,
        )
        .unwrap_err();
        assert!(err.contains("critical_remaining_ms"));
    }
}
