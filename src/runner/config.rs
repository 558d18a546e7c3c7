//! # Runner configuration.
//!
//! [`RunnerConfig`] defines the runner's timing behavior: how long the
//! control loop waits for commands, how long execution may stay paused,
//! and how long a scheduling request may take.
//!
//! # Example
//! ```
//! use std::time::Duration;
//! use testrig::RunnerConfig;
//!
//! let mut cfg = RunnerConfig::default();
//! cfg.pause_timeout = Duration::from_secs(60);
//! cfg.schedule_timeout = Duration::from_secs(5);
//!
//! assert_eq!(cfg.queue_timeout, Duration::ZERO);
//! ```

use std::time::Duration;

/// Timing configuration for a test runner.
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    /// Maximum time the control loop waits for the next command
    /// (0 = wait forever).
    pub queue_timeout: Duration,
    /// Maximum time execution may stay paused before the run fails
    /// (0 = wait forever).
    pub pause_timeout: Duration,
    /// Maximum time to wait for the scheduler to answer a request
    /// (0 = wait forever).
    pub schedule_timeout: Duration,
}

impl RunnerConfig {
    pub(crate) fn command_wait_limit(&self) -> Option<Duration> {
        limit(self.queue_timeout)
    }

    pub(crate) fn pause_wait_limit(&self) -> Option<Duration> {
        limit(self.pause_timeout)
    }

    pub(crate) fn schedule_wait_limit(&self) -> Option<Duration> {
        limit(self.schedule_timeout)
    }
}

#[inline]
fn limit(timeout: Duration) -> Option<Duration> {
    if timeout.is_zero() {
        None
    } else {
        Some(timeout)
    }
}

impl Default for RunnerConfig {
    /// Provides a default configuration:
    /// - `queue_timeout = 0s` (wait forever)
    /// - `pause_timeout = 0s` (wait forever)
    /// - `schedule_timeout = 30s`
    fn default() -> Self {
        Self {
            queue_timeout: Duration::ZERO,
            pause_timeout: Duration::ZERO,
            schedule_timeout: Duration::from_secs(30),
        }
    }
}
