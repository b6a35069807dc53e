//! Sync engine configuration.
//!
//! `SyncConfig` is read from an optional JSON file, then `TERN_*` environment
//! overrides are applied on top, then the result is validated. Unset fields
//! fall back to the defaults below.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::{DEFAULT_ITERATIONS, MIN_ITERATIONS};
use crate::error::{Error, Result};
use crate::queue::DEFAULT_CEILING;

const DEFAULT_DEBOUNCE_MS: u64 = 2_000;
const DEFAULT_CONCURRENCY_WINDOW_MS: u64 = 5_000;
const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
const DEFAULT_BACKOFF_MAX_EXPONENT: u32 = 5;
const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_REMOTE_TIMEOUT_MS: u64 = 30_000;
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Prefix for environment overrides, e.g. `TERN_DEBOUNCE_MS=500`
pub const ENV_PREFIX: &str = "TERN_";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Quiet period after a local edit before a pass starts
    pub debounce_ms: u64,
    /// Edits closer together than this are merged instead of last-writer-wins
    pub concurrency_window_ms: u64,
    pub backoff_base_ms: u64,
    /// Backoff stops growing after `base * 2^max_exponent`
    pub backoff_max_exponent: u32,
    /// Retries after a transient failure before manual sync is required
    pub max_retries: u32,
    /// Bound on every remote call
    pub remote_timeout_ms: u64,
    /// Queue length that triggers compaction
    pub queue_ceiling: usize,
    /// Replace the payload of deleted records with empty content
    pub clear_payload_on_tombstone: bool,
    /// PBKDF2 iterations used when a master key is first derived
    pub kdf_iterations: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            concurrency_window_ms: DEFAULT_CONCURRENCY_WINDOW_MS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_max_exponent: DEFAULT_BACKOFF_MAX_EXPONENT,
            max_retries: DEFAULT_MAX_RETRIES,
            remote_timeout_ms: DEFAULT_REMOTE_TIMEOUT_MS,
            queue_ceiling: DEFAULT_CEILING,
            clear_payload_on_tombstone: false,
            kdf_iterations: DEFAULT_ITERATIONS,
        }
    }
}

impl SyncConfig {
    /// Load from `path` (when given and present) plus the process environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path)?;
                Self::from_json_str(&raw).map_err(|e| {
                    Error::Config(format!("{}: {e}", path.display()))
                })?
            }
            _ => Self::default(),
        };
        config.apply_env(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::Config(format!("invalid config JSON: {e}")))
    }

    /// Apply `TERN_*` overrides from `vars`; unrelated keys are ignored
    pub fn apply_env<I, K, V>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.as_ref().trim();
            match name {
                "DEBOUNCE_MS" => self.debounce_ms = parse_env(name, value)?,
                "CONCURRENCY_WINDOW_MS" => self.concurrency_window_ms = parse_env(name, value)?,
                "BACKOFF_BASE_MS" => self.backoff_base_ms = parse_env(name, value)?,
                "BACKOFF_MAX_EXPONENT" => self.backoff_max_exponent = parse_env(name, value)?,
                "MAX_RETRIES" => self.max_retries = parse_env(name, value)?,
                "REMOTE_TIMEOUT_MS" => self.remote_timeout_ms = parse_env(name, value)?,
                "QUEUE_CEILING" => self.queue_ceiling = parse_env(name, value)?,
                "CLEAR_PAYLOAD_ON_TOMBSTONE" => {
                    self.clear_payload_on_tombstone = parse_bool(name, value)?;
                }
                "KDF_ITERATIONS" => self.kdf_iterations = parse_env(name, value)?,
                _ => {}
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency_window_ms == 0 {
            return Err(Error::Config("concurrency_window_ms must be positive".into()));
        }
        if self.backoff_base_ms == 0 {
            return Err(Error::Config("backoff_base_ms must be positive".into()));
        }
        if self.backoff_max_exponent > MAX_BACKOFF_EXPONENT {
            return Err(Error::Config(format!(
                "backoff_max_exponent must be at most {MAX_BACKOFF_EXPONENT}"
            )));
        }
        if self.remote_timeout_ms == 0 {
            return Err(Error::Config("remote_timeout_ms must be positive".into()));
        }
        if self.queue_ceiling == 0 {
            return Err(Error::Config("queue_ceiling must be at least 1".into()));
        }
        if self.kdf_iterations < MIN_ITERATIONS {
            return Err(Error::Config(format!(
                "kdf_iterations must be at least {MIN_ITERATIONS}"
            )));
        }
        Ok(())
    }

    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub const fn concurrency_window(&self) -> Duration {
        Duration::from_millis(self.concurrency_window_ms)
    }

    pub const fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub const fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("{ENV_PREFIX}{name}: invalid value '{value}'")))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!(
            "{ENV_PREFIX}{name}: expected a boolean, got '{value}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_are_valid() {
        let config = SyncConfig::default();
        config.validate().unwrap();
        assert_eq!(config.debounce(), Duration::from_secs(2));
        assert_eq!(config.concurrency_window(), Duration::from_secs(5));
        assert_eq!(config.backoff_base(), Duration::from_secs(1));
        assert_eq!(config.remote_timeout(), Duration::from_secs(30));
        assert_eq!(config.queue_ceiling, 100);
        assert_eq!(config.max_retries, 5);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = SyncConfig::from_json_str(r#"{"debounce_ms": 250}"#).unwrap();
        assert_eq!(config.debounce_ms, 250);
        assert_eq!(config.concurrency_window_ms, DEFAULT_CONCURRENCY_WINDOW_MS);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(SyncConfig::from_json_str(r#"{"debounce": 250}"#).is_err());
    }

    #[test]
    fn env_overrides_apply_and_ignore_unrelated_keys() {
        let mut config = SyncConfig::default();
        config
            .apply_env([
                ("TERN_MAX_RETRIES", "2"),
                ("TERN_CLEAR_PAYLOAD_ON_TOMBSTONE", "yes"),
                ("TERN_UNKNOWN", "whatever"),
                ("HOME", "/root"),
            ])
            .unwrap();
        assert_eq!(config.max_retries, 2);
        assert!(config.clear_payload_on_tombstone);
    }

    #[test]
    fn bad_env_value_is_a_config_error() {
        let mut config = SyncConfig::default();
        let error = config
            .apply_env([("TERN_QUEUE_CEILING", "lots")])
            .unwrap_err();
        assert!(matches!(error, Error::Config(_)));
        assert!(error.to_string().contains("TERN_QUEUE_CEILING"));
    }

    #[test]
    fn validate_rejects_weak_kdf_and_zero_ceiling() {
        let weak = SyncConfig {
            kdf_iterations: 1_000,
            ..SyncConfig::default()
        };
        assert!(weak.validate().is_err());

        let zero = SyncConfig {
            queue_ceiling: 0,
            ..SyncConfig::default()
        };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn load_reads_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tern.json");
        std::fs::write(&path, r#"{"remote_timeout_ms": 1000}"#).unwrap();
        let config = SyncConfig::load(Some(&path)).unwrap();
        assert_eq!(config.remote_timeout(), Duration::from_secs(1));
    }
}
