// Copyright 2024 RustFS Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::error::{LockError, Result};

pub const ENV_TTL_MS: &str = "HILOK_TTL_MS";
pub const ENV_REFRESH_INTERVAL_MS: &str = "HILOK_REFRESH_INTERVAL_MS";
pub const ENV_PATH_SEPARATOR: &str = "HILOK_PATH_SEPARATOR";
pub const ENV_CANCEL_ON_LOCK_FAILURE: &str = "HILOK_CANCEL_ON_LOCK_FAILURE";
pub const ENV_KEY_PREFIX: &str = "HILOK_KEY_PREFIX";
pub const ENV_READ_POLL_MS: &str = "HILOK_READ_POLL_MS";
pub const ENV_WRITE_POLL_MS: &str = "HILOK_WRITE_POLL_MS";

/// Hierarchical lock configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HiLokConfig {
    /// Lease attached to every writer slot and readers list
    #[serde(default = "default_ttl")]
    pub ttl: Duration,

    /// Background renewal period, zero disables renewal
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: Duration,

    /// Separator splitting a request path into segments
    #[serde(default = "default_path_separator")]
    pub path_separator: String,

    /// Abort scoped critical sections when a held lease is lost
    #[serde(default = "default_cancel_on_lock_failure")]
    pub cancel_on_lock_failure: bool,

    /// Namespace prefix for every store key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Poll period of blocking read acquisition
    #[serde(default = "default_read_poll_interval")]
    pub read_poll_interval: Duration,

    /// Poll period of blocking write acquisition
    #[serde(default = "default_write_poll_interval")]
    pub write_poll_interval: Duration,
}

impl Default for HiLokConfig {
    fn default() -> Self {
        Self {
            ttl: default_ttl(),
            refresh_interval: default_refresh_interval(),
            path_separator: default_path_separator(),
            cancel_on_lock_failure: default_cancel_on_lock_failure(),
            key_prefix: default_key_prefix(),
            read_poll_interval: default_read_poll_interval(),
            write_poll_interval: default_write_poll_interval(),
        }
    }
}

// Default value functions
fn default_ttl() -> Duration {
    Duration::from_millis(5000)
}

fn default_refresh_interval() -> Duration {
    Duration::from_millis(2000)
}

fn default_path_separator() -> String {
    "/".to_string()
}

fn default_cancel_on_lock_failure() -> bool {
    true
}

fn default_key_prefix() -> String {
    crate::DEFAULT_KEY_PREFIX.to_string()
}

fn default_read_poll_interval() -> Duration {
    crate::DEFAULT_READ_POLL_INTERVAL
}

fn default_write_poll_interval() -> Duration {
    crate::DEFAULT_WRITE_POLL_INTERVAL
}

fn get_env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_env_str(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn get_env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| match v.to_lowercase().as_str() {
            "1" | "true" | "yes" => Some(true),
            "0" | "false" | "no" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

impl HiLokConfig {
    /// Defaults overlaid with `HILOK_*` environment variables. Unparseable values fall back to the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            ttl: Duration::from_millis(get_env_u64(ENV_TTL_MS, defaults.ttl.as_millis() as u64)),
            refresh_interval: Duration::from_millis(get_env_u64(
                ENV_REFRESH_INTERVAL_MS,
                defaults.refresh_interval.as_millis() as u64,
            )),
            path_separator: get_env_str(ENV_PATH_SEPARATOR, &defaults.path_separator),
            cancel_on_lock_failure: get_env_bool(ENV_CANCEL_ON_LOCK_FAILURE, defaults.cancel_on_lock_failure),
            key_prefix: get_env_str(ENV_KEY_PREFIX, &defaults.key_prefix),
            read_poll_interval: Duration::from_millis(get_env_u64(
                ENV_READ_POLL_MS,
                defaults.read_poll_interval.as_millis() as u64,
            )),
            write_poll_interval: Duration::from_millis(get_env_u64(
                ENV_WRITE_POLL_MS,
                defaults.write_poll_interval.as_millis() as u64,
            )),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_refresh_interval(mut self, refresh_interval: Duration) -> Self {
        self.refresh_interval = refresh_interval;
        self
    }

    pub fn with_path_separator(mut self, separator: impl Into<String>) -> Self {
        self.path_separator = separator.into();
        self
    }

    pub fn with_cancel_on_lock_failure(mut self, cancel: bool) -> Self {
        self.cancel_on_lock_failure = cancel;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_poll_intervals(mut self, read: Duration, write: Duration) -> Self {
        self.read_poll_interval = read;
        self.write_poll_interval = write;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.ttl.is_zero() {
            return Err(LockError::configuration("TTL must be greater than zero"));
        }

        if !self.refresh_interval.is_zero() && self.refresh_interval >= self.ttl {
            return Err(LockError::configuration(format!(
                "Refresh interval {:?} must be shorter than the TTL {:?}",
                self.refresh_interval, self.ttl
            )));
        }

        if self.path_separator.is_empty() {
            return Err(LockError::configuration("Path separator must not be empty"));
        }

        if self.key_prefix.is_empty() {
            return Err(LockError::configuration("Key prefix must not be empty"));
        }

        if self.read_poll_interval.is_zero() || self.write_poll_interval.is_zero() {
            return Err(LockError::configuration("Poll intervals must be greater than zero"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config() {
        let config = HiLokConfig::default();
        assert_eq!(config.ttl, Duration::from_millis(5000));
        assert_eq!(config.refresh_interval, Duration::from_millis(2000));
        assert_eq!(config.path_separator, "/");
        assert!(config.cancel_on_lock_failure);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let config = HiLokConfig::default().with_ttl(Duration::ZERO);
        assert!(config.validate().is_err());

        let config = HiLokConfig::default()
            .with_ttl(Duration::from_millis(500))
            .with_refresh_interval(Duration::from_millis(500));
        assert!(config.validate().is_err());

        // Disabled refresh is always valid
        let config = HiLokConfig::default()
            .with_ttl(Duration::from_millis(500))
            .with_refresh_interval(Duration::ZERO);
        assert!(config.validate().is_ok());

        let config = HiLokConfig::default().with_path_separator("");
        assert!(config.validate().is_err());

        let config = HiLokConfig::default().with_poll_intervals(Duration::ZERO, Duration::from_millis(1));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serialization() {
        let config = HiLokConfig::default().with_key_prefix("jobs");
        let serialized = serde_json::to_string(&config).unwrap();
        let deserialized: HiLokConfig = serde_json::from_str(&serialized).unwrap();
        assert_eq!(config, deserialized);

        let partial: HiLokConfig = serde_json::from_str(r#"{"path_separator": ":"}"#).unwrap();
        assert_eq!(partial.path_separator, ":");
        assert_eq!(partial.ttl, default_ttl());
    }

    #[test]
    #[serial]
    fn test_from_env() {
        // SAFETY: serialized with every other test touching the process environment
        unsafe {
            env::set_var(ENV_TTL_MS, "800");
            env::set_var(ENV_REFRESH_INTERVAL_MS, "200");
            env::set_var(ENV_CANCEL_ON_LOCK_FAILURE, "no");
            env::set_var(ENV_PATH_SEPARATOR, ".");
            env::set_var(ENV_READ_POLL_MS, "not-a-number");
        }

        let config = HiLokConfig::from_env();

        unsafe {
            for key in [
                ENV_TTL_MS,
                ENV_REFRESH_INTERVAL_MS,
                ENV_CANCEL_ON_LOCK_FAILURE,
                ENV_PATH_SEPARATOR,
                ENV_READ_POLL_MS,
            ] {
                env::remove_var(key);
            }
        }

        assert_eq!(config.ttl, Duration::from_millis(800));
        assert_eq!(config.refresh_interval, Duration::from_millis(200));
        assert!(!config.cancel_on_lock_failure);
        assert_eq!(config.path_separator, ".");
        assert_eq!(config.read_poll_interval, default_read_poll_interval());
        assert!(config.validate().is_ok());
    }
}
