//! TaskPace - recurring timers and bounded fan-out for tokio
//!
//! Two independent building blocks for background work:
//!
//! - [`RecurringTimer`] runs an async workload on a due-time/period cadence in
//!   a background task. It can be started and stopped from any number of
//!   tasks, cancels cooperatively, and turns workload failures into an error
//!   callback instead of crashing the runtime.
//! - [`FanOut`] runs an async operation over every item of a sequence with an
//!   optional cap on in-flight operations, and can collect the outputs in
//!   source order no matter which finish first.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use taskpace::{FanOut, RecurringTimer};
//!
//! let timer = RecurringTimer::builder()
//!     .workload(|_token| async { refresh_cache().await })
//!     .due_time(Duration::from_millis(300))
//!     .period(Duration::from_millis(500))
//!     .on_error(|err| eprintln!("refresh failed: {err}"))
//!     .build()?;
//! timer.start().await?;
//!
//! let sizes = FanOut::bounded(4)?
//!     .run_for_each_collecting(urls, |url| async move { fetch_len(url).await })
//!     .await?;
//!
//! timer.stop().await?;
//! ```

pub mod cli;
pub mod config;
pub mod executor;
pub mod timer;

pub use config::Config;
pub use executor::{Admission, AdmissionGate, ExecutorConfig, FanOut, FanOutError};
pub use timer::{
    Cadence, Delay, ErrorHandler, RecurringTimer, RecurringTimerBuilder, TimerConfig, TimerError, TimerState,
    TimerStats, Workload,
};

/// Re-exported so workloads can name the token they receive
pub use tokio_util::sync::CancellationToken;
