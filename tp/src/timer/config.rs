//! Timer configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::delay::{Cadence, Delay};
use super::error::TimerError;

/// Configuration for a RecurringTimer
///
/// Millisecond fields accept `-1` as "infinite".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerConfig {
    /// Delay before the first invocation in milliseconds
    #[serde(default = "default_due_time_ms")]
    pub due_time_ms: i64,

    /// Delay between invocations in milliseconds
    #[serde(default = "default_period_ms")]
    pub period_ms: i64,

    /// Launch invocations detached instead of awaiting each one
    #[serde(default)]
    pub allow_overlap: bool,

    /// Upper bound on how long stop waits for the loop before aborting it
    #[serde(default)]
    pub stop_timeout_ms: Option<u64>,
}

fn default_due_time_ms() -> i64 {
    0
}

fn default_period_ms() -> i64 {
    1000
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            due_time_ms: 0,
            period_ms: 1000,
            allow_overlap: false,
            stop_timeout_ms: None,
        }
    }
}

impl TimerConfig {
    /// Get the due time as a Delay
    pub fn due_time(&self) -> Result<Delay, TimerError> {
        Delay::from_signed_millis("due_time", self.due_time_ms)
    }

    /// Get the period as a Delay
    pub fn period(&self) -> Result<Delay, TimerError> {
        Delay::from_signed_millis("period", self.period_ms)
    }

    /// Get the validated cadence
    pub fn cadence(&self) -> Result<Cadence, TimerError> {
        Cadence::from_signed_millis(self.due_time_ms, self.period_ms)
    }

    /// Get the stop timeout as a Duration
    pub fn stop_timeout(&self) -> Option<Duration> {
        self.stop_timeout_ms.map(Duration::from_millis)
    }
}
