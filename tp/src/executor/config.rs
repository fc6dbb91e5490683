//! Fan-out configuration

use serde::{Deserialize, Serialize};

/// Configuration for a FanOut
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Max operations in flight at once, unbounded when absent
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

impl ExecutorConfig {
    /// Check whether a concurrency bound is configured
    pub fn is_bounded(&self) -> bool {
        self.max_concurrency.is_some()
    }
}
