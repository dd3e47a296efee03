//! Node configuration from environment variables.
//!
//! # Environment Variables
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `RELAY_MODE` | `loopback` | `local`, `ping` or `loopback` |
//! | `RELAY_TRANSPORT` | `memory` | `memory` or `gcp-pubsub` |
//! | `RELAY_PROJECT_ID` | | Cloud project holding the topic |
//! | `RELAY_TOPIC` | | Topic this node publishes to |
//! | `RELAY_SUBSCRIPTION` | | Subscription this node receives from |
//! | `RELAY_CREDENTIALS_FILE` | | Service-account key for the cloud transport |
//! | `RELAY_BINDING_FILE` | | Service-binding JSON overriding the four above |
//! | `RELAY_BROKER_URL` | `http://localhost:8080` | Private broker base URL |
//! | `RELAY_WAIT_TIMEOUT_SECS` | `30` | Default reply wait |
//! | `RELAY_POLL_INTERVAL_SECS` | `5` | Dispatch loop liveness interval |
//! | `RELAY_MAX_INFLIGHT_HANDLERS` | unbounded | Handler concurrency cap |

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use relay_correlation::config::{DEFAULT_POLL_INTERVAL, DEFAULT_WAIT_TIMEOUT};
use relay_correlation::RegistryConfig;
use thiserror::Error;

use crate::binding::PubSubBinding;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} is required for the cloud transport")]
    Missing(&'static str),

    #[error("the in-memory transport only works in loopback mode, not {0}")]
    MemoryOutsideLoopback(Mode),

    #[error("loopback mode runs over the in-memory transport only")]
    LoopbackNeedsMemory,

    #[error("relay-node was built without the gcp-pubsub feature")]
    TransportUnavailable,
}

/// Which side(s) of the relay this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Private side: serve broker operations until interrupted.
    Local,
    /// Public side smoke test: one catalog round trip, then exit.
    Ping,
    /// Both sides in-process.
    #[default]
    Loopback,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Local => "local",
            Mode::Ping => "ping",
            Mode::Loopback => "loopback",
        })
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Mode::Local),
            "ping" => Ok(Mode::Ping),
            "loopback" => Ok(Mode::Loopback),
            other => Err(format!("unknown mode {:?}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    #[default]
    Memory,
    GcpPubSub,
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(TransportKind::Memory),
            "gcp-pubsub" | "pubsub" => Ok(TransportKind::GcpPubSub),
            other => Err(format!("unknown transport {:?}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub mode: Mode,
    pub transport: TransportKind,
    pub project_id: Option<String>,
    pub topic: Option<String>,
    pub subscription: Option<String>,
    pub credentials_path: Option<String>,
    pub binding_file: Option<String>,
    pub broker_url: String,
    pub wait_timeout: Duration,
    pub poll_interval: Duration,
    pub max_inflight_handlers: Option<usize>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            transport: TransportKind::default(),
            project_id: None,
            topic: None,
            subscription: None,
            credentials_path: None,
            binding_file: None,
            broker_url: "http://localhost:8080".to_string(),
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_inflight_handlers: None,
        }
    }
}

impl NodeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup. `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Self {
            mode: parse_var("RELAY_MODE", non_empty("RELAY_MODE"))?.unwrap_or(defaults.mode),
            transport: parse_var("RELAY_TRANSPORT", non_empty("RELAY_TRANSPORT"))?
                .unwrap_or(defaults.transport),
            project_id: non_empty("RELAY_PROJECT_ID"),
            topic: non_empty("RELAY_TOPIC"),
            subscription: non_empty("RELAY_SUBSCRIPTION"),
            credentials_path: non_empty("RELAY_CREDENTIALS_FILE"),
            binding_file: non_empty("RELAY_BINDING_FILE"),
            broker_url: non_empty("RELAY_BROKER_URL").unwrap_or(defaults.broker_url),
            wait_timeout: parse_var::<u64>("RELAY_WAIT_TIMEOUT_SECS", non_empty("RELAY_WAIT_TIMEOUT_SECS"))?
                .map(Duration::from_secs)
                .unwrap_or(defaults.wait_timeout),
            poll_interval: parse_var::<u64>("RELAY_POLL_INTERVAL_SECS", non_empty("RELAY_POLL_INTERVAL_SECS"))?
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
            max_inflight_handlers: parse_var(
                "RELAY_MAX_INFLIGHT_HANDLERS",
                non_empty("RELAY_MAX_INFLIGHT_HANDLERS"),
            )?,
        })
    }

    /// Take project, topic, subscription and credentials from a decoded
    /// service binding. Binding values win over the environment.
    pub fn apply_binding(&mut self, binding: &PubSubBinding) {
        self.project_id = Some(binding.project_id.clone());
        self.topic = Some(binding.topic_id.clone());
        self.subscription = Some(binding.subscription_id.clone());
        self.credentials_path = Some(binding.credentials_path.display().to_string());
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wait_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                var: "RELAY_WAIT_TIMEOUT_SECS",
                value: "0".into(),
                reason: "must be positive".into(),
            });
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                var: "RELAY_POLL_INTERVAL_SECS",
                value: "0".into(),
                reason: "must be positive".into(),
            });
        }
        if self.max_inflight_handlers == Some(0) {
            return Err(ConfigError::InvalidValue {
                var: "RELAY_MAX_INFLIGHT_HANDLERS",
                value: "0".into(),
                reason: "must be positive".into(),
            });
        }

        match (self.mode, self.transport) {
            (Mode::Loopback, TransportKind::Memory) => Ok(()),
            (Mode::Loopback, TransportKind::GcpPubSub) => Err(ConfigError::LoopbackNeedsMemory),
            (mode, TransportKind::Memory) => Err(ConfigError::MemoryOutsideLoopback(mode)),
            (_, TransportKind::GcpPubSub) => {
                if !cfg!(feature = "gcp-pubsub") {
                    return Err(ConfigError::TransportUnavailable);
                }
                if self.project_id.is_none() {
                    return Err(ConfigError::Missing("RELAY_PROJECT_ID"));
                }
                if self.topic.is_none() {
                    return Err(ConfigError::Missing("RELAY_TOPIC"));
                }
                if self.subscription.is_none() {
                    return Err(ConfigError::Missing("RELAY_SUBSCRIPTION"));
                }
                Ok(())
            }
        }
    }

    /// Registry settings for one side of the relay.
    pub fn registry_config(&self, name: &str) -> RegistryConfig {
        let config = RegistryConfig::named(name)
            .with_wait_for_timeout(self.wait_timeout)
            .with_poll_interval(self.poll_interval);
        match self.max_inflight_handlers {
            Some(limit) => config.with_max_inflight_handlers(limit),
            None => config,
        }
    }
}

fn parse_var<T>(var: &'static str, raw: Option<String>) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    raw.map(|value| {
        value.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
            var,
            reason: e.to_string(),
            value,
        })
    })
    .transpose()
}
