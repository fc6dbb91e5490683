//! Fan-out error types

use thiserror::Error;

/// Errors that can occur while running a fan-out
#[derive(Debug, Error)]
pub enum FanOutError {
    #[error("Value out of range for {name}: {value}")]
    OutOfRange { name: &'static str, value: usize },

    #[error("Operation failed for item {index} ({failed} failed in total): {source}")]
    Operation {
        index: usize,
        failed: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("Operation panicked for item {index}: {message}")]
    Panicked { index: usize, message: String },

    #[error("No result recorded for item {index}")]
    MissingResult { index: usize },

    #[error("Admission gate closed")]
    GateClosed,

    #[error("Operation task did not complete: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl FanOutError {
    /// Wrap an operation failure
    pub fn operation(index: usize, failed: usize, err: eyre::Report) -> Self {
        FanOutError::Operation {
            index,
            failed,
            source: err.into(),
        }
    }

    /// Get the source index of the item that failed, if any
    pub fn index(&self) -> Option<usize> {
        match self {
            FanOutError::Operation { index, .. }
            | FanOutError::Panicked { index, .. }
            | FanOutError::MissingResult { index } => Some(*index),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_message_includes_cause() {
        let err = FanOutError::operation(3, 2, eyre::eyre!("Boom"));

        let msg = err.to_string();
        assert!(msg.contains("item 3"));
        assert!(msg.contains("2 failed"));
        assert!(msg.contains("Boom"));
        assert_eq!(err.index(), Some(3));
    }

    #[test]
    fn test_index_absent_for_validation_errors() {
        let err = FanOutError::OutOfRange {
            name: "max_concurrency",
            value: 0,
        };
        assert_eq!(err.index(), None);
        assert!(err.to_string().contains("max_concurrency"));
    }
}
