//! Recurring timer
//!
//! The RecurringTimer repeatedly runs a caller-supplied async workload on a
//! due-time/period cadence in a background tokio task, and can be started and
//! stopped from any number of tasks.

mod config;
mod delay;
mod error;
mod recurring;

pub use config::TimerConfig;
pub use delay::{Cadence, Delay, INFINITE_MILLIS};
pub use error::TimerError;
pub use recurring::{ErrorHandler, RecurringTimer, RecurringTimerBuilder, TimerState, TimerStats, Workload};
