// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::attempts::Attempts;
use crate::backoff::{BackoffSettings, BackoffStrategy};
use crate::error::ModeError;
use crate::mode::ModeSettings;
use serde::Deserialize;
use std::env;
use std::time::Duration;

const DEFAULT_WORKER: usize = 1;
const DEFAULT_MAX_RETRIES: i64 = 3;
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_BACKOFF_INIT_MS: u64 = 1000;
const DEFAULT_BACKOFF_MAX_MS: u64 = 60_000;
const DEFAULT_BULK_MAX_SIZE: usize = 50;
const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration of one output.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Endpoint addresses, e.g. `logs.internal:5044`
    pub hosts: Vec<String>,
    /// Connections opened per host
    pub worker: usize,
    /// Balance across all connections instead of failing over between hosts
    pub loadbalance: bool,
    /// Retries after the first attempt; negative retries forever
    pub max_retries: i64,
    /// Connect timeout, also bounding each wait for a free worker
    pub timeout_secs: u64,
    pub backoff_init_ms: u64,
    pub backoff_max_ms: u64,
    /// Equal-jitter backoff instead of plain exponential
    pub backoff_jitter: bool,
    /// Events per published batch
    pub bulk_max_size: usize,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            worker: DEFAULT_WORKER,
            loadbalance: false,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            backoff_init_ms: DEFAULT_BACKOFF_INIT_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            backoff_jitter: false,
            bulk_max_size: DEFAULT_BULK_MAX_SIZE,
            log_level: "info".to_string(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ModeError> {
    match env::var(name) {
        Ok(val) => val
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ModeError::InvalidConfig(format!("{name} has an invalid value '{val}'"))),
        Err(_) => Ok(None),
    }
}

fn parse_bool_env(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .map(|val| matches!(val.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
}

impl OutputConfig {
    /// Create configuration from `SHIPPER_*` environment variables
    pub fn from_env() -> Result<Self, ModeError> {
        let defaults = Self::default();
        let hosts = env::var("SHIPPER_HOSTS")
            .map(|val| {
                val.split(',')
                    .map(str::trim)
                    .filter(|host| !host.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let log_level = env::var("SHIPPER_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or(defaults.log_level);

        let config = Self {
            hosts,
            worker: parse_env("SHIPPER_WORKER")?.unwrap_or(defaults.worker),
            loadbalance: parse_bool_env("SHIPPER_LOADBALANCE").unwrap_or(defaults.loadbalance),
            max_retries: parse_env("SHIPPER_MAX_RETRIES")?.unwrap_or(defaults.max_retries),
            timeout_secs: parse_env("SHIPPER_TIMEOUT_SECS")?.unwrap_or(defaults.timeout_secs),
            backoff_init_ms: parse_env("SHIPPER_BACKOFF_INIT_MS")?
                .unwrap_or(defaults.backoff_init_ms),
            backoff_max_ms: parse_env("SHIPPER_BACKOFF_MAX_MS")?
                .unwrap_or(defaults.backoff_max_ms),
            backoff_jitter: parse_bool_env("SHIPPER_BACKOFF_JITTER")
                .unwrap_or(defaults.backoff_jitter),
            bulk_max_size: parse_env("SHIPPER_BULK_MAX_SIZE")?.unwrap_or(defaults.bulk_max_size),
            log_level,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ModeError> {
        if self.hosts.is_empty() {
            return Err(ModeError::InvalidConfig(
                "at least one host is required".to_string(),
            ));
        }
        if self.hosts.iter().any(|host| host.trim().is_empty()) {
            return Err(ModeError::InvalidConfig(
                "hosts cannot contain empty entries".to_string(),
            ));
        }
        if self.worker == 0 {
            return Err(ModeError::InvalidConfig(
                "worker must be greater than 0".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(ModeError::InvalidConfig(
                "timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.backoff_init_ms == 0 {
            return Err(ModeError::InvalidConfig(
                "backoff_init_ms must be greater than 0".to_string(),
            ));
        }
        if self.backoff_max_ms < self.backoff_init_ms {
            return Err(ModeError::InvalidConfig(format!(
                "backoff_max_ms ({}) must not be below backoff_init_ms ({})",
                self.backoff_max_ms, self.backoff_init_ms
            )));
        }
        if self.bulk_max_size == 0 {
            return Err(ModeError::InvalidConfig(
                "bulk_max_size must be greater than 0".to_string(),
            ));
        }
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ModeError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }
        Ok(())
    }

    pub fn max_attempts(&self) -> Attempts {
        Attempts::from_max_retries(self.max_retries)
    }

    pub fn mode_settings(&self) -> ModeSettings {
        ModeSettings {
            max_attempts: self.max_attempts(),
            timeout: Duration::from_secs(self.timeout_secs),
            backoff: BackoffSettings {
                init: Duration::from_millis(self.backoff_init_ms),
                max: Duration::from_millis(self.backoff_max_ms),
                strategy: if self.backoff_jitter {
                    BackoffStrategy::EqualJitter
                } else {
                    BackoffStrategy::Exponential
                },
            },
            load_balance: self.loadbalance,
        }
    }
}
