//! Messenger configuration.
//!
//! A messenger has a single tunable: the timeout applied to requests that do not
//! pass their own. Zero is treated as "unset" and falls back to the default.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Timeout used when neither the caller nor the configuration supplies one.
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// Environment variable read by [`MessengerConfig::from_env`].
pub const TIMEOUT_ENV_VAR: &str = "DUPLEX_DEFAULT_TIMEOUT_MS";

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessengerConfig {
    /// Default request timeout in milliseconds (0 = use `DEFAULT_TIMEOUT_MS`)
    #[serde(default = "default_timeout_ms")]
    default_timeout_ms: u64,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl MessengerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.default_timeout_ms = timeout_ms;
        self
    }

    pub fn with_default_timeout(self, timeout: Duration) -> Self {
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.with_default_timeout_ms(millis)
    }

    /// Effective default timeout in milliseconds.
    pub fn default_timeout_ms(&self) -> u64 {
        if self.default_timeout_ms == 0 {
            DEFAULT_TIMEOUT_MS
        } else {
            self.default_timeout_ms
        }
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms())
    }

    /// Load from the environment, falling back to defaults.
    ///
    /// An unparsable value is logged and ignored.
    pub fn from_env() -> Self {
        Self::from_env_strict().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Ignoring invalid messenger configuration");
            Self::default()
        })
    }

    /// Load from the environment, rejecting unparsable values.
    pub fn from_env_strict() -> Result<Self, ConfigError> {
        match std::env::var(TIMEOUT_ENV_VAR) {
            Ok(raw) => Self::parse_timeout(&raw),
            Err(_) => Ok(Self::default()),
        }
    }

    fn parse_timeout(raw: &str) -> Result<Self, ConfigError> {
        raw.trim()
            .parse::<u64>()
            .map(|ms| Self::default().with_default_timeout_ms(ms))
            .map_err(|_| ConfigError::InvalidTimeout {
                var: TIMEOUT_ENV_VAR,
                value: raw.to_owned(),
            })
    }
}
