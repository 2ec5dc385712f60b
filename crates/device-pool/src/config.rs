//! Pool configuration

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How long `release` waits for the error scopes to drain.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_millis(5000);

/// Configuration for a [`DevicePool`](crate::DevicePool)
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct PoolConfig {
    /// Name used in log fields
    pub label: String,
    /// Upper bound on draining the error scopes in `release`
    pub drain_timeout: Duration,
    /// Capacity of the event broadcast channel
    pub event_buffer: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            label: "gpu".to_string(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            event_buffer: 64,
        }
    }
}

impl PoolConfig {
    /// Validate pool configuration, returning an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.label.is_empty() {
            return Err(Error::configuration("label cannot be empty"));
        }
        if self.drain_timeout.is_zero() {
            return Err(Error::configuration(
                "drain_timeout must be greater than zero",
            ));
        }
        if self.event_buffer == 0 {
            return Err(Error::configuration(
                "event_buffer must be greater than zero",
            ));
        }
        Ok(())
    }
}
