//! Bounded-concurrency fan-out
//!
//! FanOut runs an async operation over every item of a sequence, optionally
//! capping how many operations are in flight, and can collect the outputs in
//! source order.

mod config;
mod error;
mod fanout;
mod gate;

pub use config::ExecutorConfig;
pub use error::FanOutError;
pub use fanout::FanOut;
pub use gate::{Admission, AdmissionGate};
