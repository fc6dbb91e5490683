//! Timer error types

use thiserror::Error;

/// Errors that can occur while building or driving a [`RecurringTimer`](super::RecurringTimer)
#[derive(Debug, Error)]
pub enum TimerError {
    #[error("Missing argument: {0}")]
    MissingArgument(&'static str),

    #[error("Value out of range for {name}: {value}")]
    OutOfRange { name: &'static str, value: i64 },

    #[error("Timer has been disposed")]
    Disposed,
}

impl TimerError {
    /// Check if this error came from using a disposed timer
    pub fn is_disposed(&self) -> bool {
        matches!(self, TimerError::Disposed)
    }
}
