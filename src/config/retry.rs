use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Basic retry policy template
#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
pub struct BackoffPolicy {
    /// Maximum number of retries (0 means unlimited retries)
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Backoff base (unit: milliseconds)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum backoff time (unit: milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl BackoffPolicy {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn validate(
        &self,
        name: &str,
    ) -> Result<()> {
        if self.base_delay_ms == 0 {
            return Err(Error::InvalidConfig(format!("retry.{name}.base_delay_ms must be greater than 0")));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(Error::InvalidConfig(format!(
                "retry.{name}.max_delay_ms ({}) must not be smaller than base_delay_ms ({})",
                self.max_delay_ms, self.base_delay_ms
            )));
        }
        Ok(())
    }
}

/// Divide strategies by concern
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RetryPolicies {
    // Re-establishing the transport after connection loss
    #[serde(default = "default_reconnect_policy")]
    pub reconnect: BackoffPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            reconnect: default_reconnect_policy(),
        }
    }
}

impl RetryPolicies {
    pub fn validate(&self) -> Result<()> {
        self.reconnect.validate("reconnect")
    }
}

fn default_reconnect_policy() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 0,
        base_delay_ms: 50,
        max_delay_ms: 1000,
    }
}
fn default_max_retries() -> usize {
    3
}
fn default_base_delay_ms() -> u64 {
    50
}
fn default_max_delay_ms() -> u64 {
    1000
}
