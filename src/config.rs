//! Receiver configuration parsed from environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::reconnect::{DEFAULT_RECONNECT_ATTEMPTS, ReconnectPolicy};
use crate::transport::Endpoint;

pub const ENV_LISTEN_URL: &str = "RPC_LISTEN_URL";
pub const ENV_SEND_URL: &str = "RPC_SEND_URL";
pub const ENV_RECONNECT_ATTEMPTS: &str = "RPC_RECONNECT_ATTEMPTS";
pub const ENV_RECONNECT_BASE_MS: &str = "RPC_RECONNECT_BASE_MS";
pub const ENV_CANCEL_GRACE_MS: &str = "RPC_CANCEL_GRACE_MS";

pub const DEFAULT_RECONNECT_BASE_MS: u64 = 1000;
pub const DEFAULT_CANCEL_GRACE_MS: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A required variable is unset or empty.
    #[error("missing required variable {var}")]
    Missing { var: &'static str },
    /// A variable is set but does not parse.
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
    /// A URL does not use the `ws://` or `wss://` scheme.
    #[error("{var} must be a ws:// or wss:// url, got {value:?}")]
    Scheme { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverConfig {
    pub endpoint: Endpoint,
    pub reconnect: ReconnectPolicy,
    /// How long a canceled call may keep running before it is dropped.
    pub cancel_grace: Duration,
}

impl ReceiverConfig {
    /// Config with default reconnect policy and cancel grace.
    #[must_use]
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            reconnect: ReconnectPolicy::default(),
            cancel_grace: Duration::from_millis(DEFAULT_CANCEL_GRACE_MS),
        }
    }

    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    #[must_use]
    pub fn with_cancel_grace(mut self, cancel_grace: Duration) -> Self {
        self.cancel_grace = cancel_grace;
        self
    }

    /// Build typed receiver config from environment variables.
    ///
    /// Required:
    /// - `RPC_LISTEN_URL`: listen URL, or the only URL in duplex mode
    ///
    /// Optional:
    /// - `RPC_SEND_URL`: separate send URL; absent means duplex
    /// - `RPC_RECONNECT_ATTEMPTS`: default 6
    /// - `RPC_RECONNECT_BASE_MS`: default 1000
    /// - `RPC_CANCEL_GRACE_MS`: default 1000
    ///
    /// # Errors
    ///
    /// [`ConfigError`] for a missing listen URL, a non-websocket URL, or an
    /// unparsable number.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ReceiverConfig::from_env`] over an arbitrary lookup.
    ///
    /// # Errors
    ///
    /// See [`ReceiverConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let listen = var(ENV_LISTEN_URL).ok_or(ConfigError::Missing { var: ENV_LISTEN_URL })?;
        let listen = ws_url(ENV_LISTEN_URL, listen)?;
        let endpoint = match var(ENV_SEND_URL) {
            Some(send) => Endpoint::Split {
                listen,
                send: ws_url(ENV_SEND_URL, send)?,
            },
            None => Endpoint::Duplex(listen),
        };

        let max_attempts = parse_or(var(ENV_RECONNECT_ATTEMPTS), ENV_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_ATTEMPTS)?;
        let base_ms = parse_or(var(ENV_RECONNECT_BASE_MS), ENV_RECONNECT_BASE_MS, DEFAULT_RECONNECT_BASE_MS)?;
        let grace_ms = parse_or(var(ENV_CANCEL_GRACE_MS), ENV_CANCEL_GRACE_MS, DEFAULT_CANCEL_GRACE_MS)?;

        Ok(Self {
            endpoint,
            reconnect: ReconnectPolicy::new(max_attempts, Duration::from_millis(base_ms)),
            cancel_grace: Duration::from_millis(grace_ms),
        })
    }
}

fn parse_or<T>(raw: Option<String>, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + Copy,
{
    match raw {
        None => Ok(default),
        Some(value) => value.trim().parse::<T>().map_err(|_| ConfigError::Invalid { var, value }),
    }
}

fn ws_url(var: &'static str, value: String) -> Result<String, ConfigError> {
    let value = value.trim().to_owned();
    if value.starts_with("ws://") || value.starts_with("wss://") {
        Ok(value)
    } else {
        Err(ConfigError::Scheme { var, value })
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
