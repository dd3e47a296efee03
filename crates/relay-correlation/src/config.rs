//! Registry tunables.

use std::time::Duration;

use crate::error::RegistryError;

/// Default time `wait_for` blocks before giving up.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default interval at which the dispatch loop re-checks the callback table.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Name used in log lines and metric labels.
    pub name: String,
    /// Timeout applied when `wait_for` is given none.
    pub wait_for_timeout: Duration,
    /// Dispatch loop liveness check interval. Also the worst-case extra
    /// latency when a registration races the loop going idle.
    pub poll_interval: Duration,
    /// Upper bound on concurrently running handlers. `None` is unbounded.
    pub max_inflight_handlers: Option<usize>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            name: "registry".to_string(),
            wait_for_timeout: DEFAULT_WAIT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_inflight_handlers: None,
        }
    }
}

impl RegistryConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_wait_for_timeout(mut self, timeout: Duration) -> Self {
        self.wait_for_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_inflight_handlers(mut self, limit: usize) -> Self {
        self.max_inflight_handlers = Some(limit);
        self
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.wait_for_timeout.is_zero() {
            return Err(RegistryError::InvalidConfig(
                "wait_for_timeout must be non-zero".into(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(RegistryError::InvalidConfig(
                "poll_interval must be non-zero".into(),
            ));
        }
        if self.max_inflight_handlers == Some(0) {
            return Err(RegistryError::InvalidConfig(
                "max_inflight_handlers must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
