//! Dispatcher and scheduler configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{circuit_breaker::CircuitBreakerConfig, error::DispatchError, policy::RetryPolicy};

const fn default_page_size() -> usize {
    100
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_interval() -> u64 {
    10
}

const fn default_initial_delay() -> u64 {
    5
}

const fn default_send_timeout() -> u64 {
    30
}

const fn default_worker_pool_size() -> usize {
    4
}

const fn default_shutdown_timeout() -> u64 {
    30
}

const fn default_enabled() -> bool {
    true
}

/// Configuration for the dispatch engine
///
/// Every field has a default, so an empty `()` section is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Maximum number of eligible records fetched per cycle
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Maximum delivery attempts before a record is marked `FAILED`
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Records per transport call. `None` sends the whole page as one batch.
    #[serde(default)]
    pub sub_batch_size: Option<usize>,

    /// Number of sub-batches that may be in flight at once
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    /// How often a cycle is triggered (in seconds)
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Delay before the first cycle after startup (in seconds)
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,

    /// Upper bound on a single transport call (in seconds)
    ///
    /// A call exceeding it counts as a batch-level transport failure.
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,

    /// How long shutdown waits for an in-flight cycle (in seconds)
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// When `false`, the scheduler never triggers cycles
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            max_attempts: default_max_attempts(),
            sub_batch_size: None,
            worker_pool_size: default_worker_pool_size(),
            interval_secs: default_interval(),
            initial_delay_secs: default_initial_delay(),
            send_timeout_secs: default_send_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            enabled: default_enabled(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl DispatchConfig {
    /// Check the configuration for values that would stall dispatch
    ///
    /// # Errors
    /// Returns [`DispatchError::Configuration`] naming the first invalid field
    pub fn validate(&self) -> Result<(), DispatchError> {
        let invalid = |field: &str| {
            Err(DispatchError::Configuration(format!(
                "{field} must be greater than zero"
            )))
        };

        if self.page_size == 0 {
            return invalid("page_size");
        }
        if self.max_attempts == 0 {
            return invalid("max_attempts");
        }
        if self.worker_pool_size == 0 {
            return invalid("worker_pool_size");
        }
        if self.sub_batch_size == Some(0) {
            return invalid("sub_batch_size");
        }
        if self.interval_secs == 0 {
            return invalid("interval_secs");
        }

        Ok(())
    }

    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts)
    }

    /// Effective number of records per transport call
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.sub_batch_size.unwrap_or(self.page_size).max(1)
    }

    #[must_use]
    pub const fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    #[must_use]
    pub const fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
