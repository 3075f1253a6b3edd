use std::time::Duration;

use thiserror::Error;

/// Timing knobs for the failure detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// How often each client is asked for a heartbeat.
    pub probe_interval: Duration,
    /// How often the coordinator scans for silent clients.
    pub sweep_interval: Duration,
    /// Silence longer than this gets a client evicted.
    pub liveness_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_millis(2_000),
            sweep_interval: Duration::from_millis(1_000),
            liveness_timeout: Duration::from_millis(7_000),
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("probe interval", self.probe_interval),
            ("sweep interval", self.sweep_interval),
            ("liveness timeout", self.liveness_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Zero(name));
            }
        }

        // A timeout inside one probe cycle evicts clients that did nothing wrong.
        if self.liveness_timeout <= self.probe_interval {
            return Err(ConfigError::TimeoutWithinProbe {
                timeout: self.liveness_timeout,
                probe: self.probe_interval,
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("liveness timeout {timeout:?} must exceed the probe interval {probe:?}")]
    TimeoutWithinProbe { timeout: Duration, probe: Duration },
}
