//! Environment-backed configuration for a relay session.

use std::env;

use relay_core::{
    Backpressure, DEFAULT_RECONNECT_DELAY_MS, NotificationQueue, NotificationReceiver,
    RetryPolicy, SyncFilter,
};
use thiserror::Error;
use url::Url;

use crate::trust::TrustPolicy;

const DEFAULT_SYNC_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_NOTIFICATION_CAPACITY: usize = 64;

/// Runtime configuration of a [`Session`](crate::Session).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Homeserver the transport talks to, for log context.
    pub homeserver: Option<Url>,
    /// Server-side long-poll timeout of each sync.
    pub sync_timeout_ms: u64,
    /// Delay after a transport fault or non-success status.
    pub backoff_ms: u64,
    pub lazy_load_members: bool,
    pub trust_policy: TrustPolicy,
    pub notification_capacity: usize,
    pub backpressure: Backpressure,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            homeserver: None,
            sync_timeout_ms: DEFAULT_SYNC_TIMEOUT_MS,
            backoff_ms: DEFAULT_RECONNECT_DELAY_MS,
            lazy_load_members: true,
            trust_policy: TrustPolicy::AutoTrust,
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
            backpressure: Backpressure::Block,
        }
    }
}

impl SessionConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let homeserver = optional_trimmed_env("RELAY_HOMESERVER", &mut lookup)
            .map(|value| {
                Url::parse(&value).map_err(|err| ConfigError::InvalidValue {
                    key: "RELAY_HOMESERVER",
                    value,
                    reason: err.to_string(),
                })
            })
            .transpose()?;

        let sync_timeout_ms =
            parse_u64_with_default("RELAY_SYNC_TIMEOUT_MS", DEFAULT_SYNC_TIMEOUT_MS, &mut lookup)?;
        let backoff_ms =
            parse_u64_with_default("RELAY_BACKOFF_MS", DEFAULT_RECONNECT_DELAY_MS, &mut lookup)?;
        let lazy_load_members = parse_bool("RELAY_LAZY_LOAD_MEMBERS", true, &mut lookup)?;

        let trust_policy = match optional_trimmed_env("RELAY_TRUST_POLICY", &mut lookup) {
            None => TrustPolicy::default(),
            Some(value) => {
                value
                    .parse::<TrustPolicy>()
                    .map_err(|err| ConfigError::InvalidValue {
                        key: "RELAY_TRUST_POLICY",
                        value,
                        reason: err.to_string(),
                    })?
            }
        };

        let notification_capacity = parse_usize_with_default(
            "RELAY_NOTIFICATION_CAPACITY",
            DEFAULT_NOTIFICATION_CAPACITY,
            &mut lookup,
        )?;

        let backpressure = match optional_trimmed_env("RELAY_NOTIFICATION_BACKPRESSURE", &mut lookup)
        {
            None => Backpressure::default(),
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "block" => Backpressure::Block,
                "drop" => Backpressure::DropNewest,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "RELAY_NOTIFICATION_BACKPRESSURE",
                        value,
                        reason: "expected 'block' or 'drop'".to_owned(),
                    });
                }
            },
        };

        if backoff_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_BACKOFF_MS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if notification_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_NOTIFICATION_CAPACITY",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        Ok(Self {
            homeserver,
            sync_timeout_ms,
            backoff_ms,
            lazy_load_members,
            trust_policy,
            notification_capacity,
            backpressure,
        })
    }

    /// Fixed reconnect delay applied after every transport fault.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.backoff_ms)
    }

    pub fn sync_filter(&self) -> SyncFilter {
        SyncFilter {
            lazy_load_members: self.lazy_load_members,
        }
    }

    /// Build the device-change queue sized and tuned by this config.
    pub fn notification_queue(&self) -> (NotificationQueue, NotificationReceiver) {
        NotificationQueue::new(self.notification_capacity, self.backpressure)
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_u64_with_default<F>(
    key: &'static str,
    default: u64,
    lookup: &mut F,
) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value
        .parse::<u64>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_usize_with_default<F>(
    key: &'static str,
    default: usize,
    lookup: &mut F,
) -> Result<usize, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value
        .parse::<usize>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_bool<F>(key: &'static str, default: bool, lookup: &mut F) -> Result<bool, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value,
            reason: "expected a boolean".to_owned(),
        }),
    }
}
