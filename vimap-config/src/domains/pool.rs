//! Worker pool configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigResult;
use crate::validation::{validate_positive, Validatable};

/// Worker pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of workers forked by `Pool::unlabeled` and the CLI
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Items kept queued per worker; the spooler tops the input channel up
    /// to `spool_factor * worker_count`
    #[serde(default = "default_spool_factor")]
    pub spool_factor: usize,

    /// How long a worker waits on its input channel before polling again
    #[serde(
        rename = "worker_poll_interval_ms",
        with = "crate::domains::utils::serde_duration_ms",
        default = "default_worker_poll_interval"
    )]
    pub worker_poll_interval: Duration,

    /// How long the coordinator waits on the output channel per loop turn
    #[serde(
        rename = "result_poll_interval_ms",
        with = "crate::domains::utils::serde_duration_ms",
        default = "default_result_poll_interval"
    )]
    pub result_poll_interval: Duration,

    /// Use the input channel's current depth when computing spool capacity.
    /// When false the spooler assumes an empty channel every time.
    #[serde(default = "crate::domains::utils::default_true")]
    pub query_input_depth: bool,

    /// Shut workers down as soon as all registered input is exhausted
    #[serde(default = "crate::domains::utils::default_true")]
    pub close_if_done: bool,

    /// Force-kill workers that have not exited this long after shutdown.
    /// `None` waits forever.
    #[serde(
        rename = "join_timeout_ms",
        with = "crate::domains::utils::serde_duration_ms_option",
        default
    )]
    pub join_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            spool_factor: default_spool_factor(),
            worker_poll_interval: default_worker_poll_interval(),
            result_poll_interval: default_result_poll_interval(),
            query_input_depth: true,
            close_if_done: true,
            join_timeout: None,
        }
    }
}

impl PoolConfig {
    /// Same configuration with a different worker count
    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }
}

impl Validatable for PoolConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(self.worker_count, "worker_count", self.domain_name())?;
        validate_positive(self.spool_factor, "spool_factor", self.domain_name())?;
        validate_positive(
            self.worker_poll_interval.as_millis(),
            "worker_poll_interval_ms",
            self.domain_name(),
        )?;
        validate_positive(
            self.result_poll_interval.as_millis(),
            "result_poll_interval_ms",
            self.domain_name(),
        )?;

        if let Some(timeout) = self.join_timeout {
            validate_positive(timeout.as_millis(), "join_timeout_ms", self.domain_name())?;
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "pool"
    }
}

// Default value functions
fn default_worker_count() -> usize {
    num_cpus::get()
}

fn default_spool_factor() -> usize {
    2
}

fn default_worker_poll_interval() -> Duration {
    Duration::from_millis(20)
}

fn default_result_poll_interval() -> Duration {
    Duration::from_millis(100)
}
