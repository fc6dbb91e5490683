//! FanOut - run an async operation over every item with bounded parallelism
//!
//! Every item is spawned onto the runtime as its own task. With a concurrency
//! bound, submission waits on an [`AdmissionGate`] before each spawn and the
//! admission travels with the task, so it is returned on every exit path.
//! Each task carries the index it was submitted at, which keys its slot in the
//! result vector regardless of completion order.

use std::any::Any;
use std::future::Future;
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::config::ExecutorConfig;
use super::error::FanOutError;
use super::gate::AdmissionGate;

/// Why a single item did not produce a value
enum Failure {
    Error(eyre::Report),
    Panicked(String),
}

/// Result slots keyed by source index
struct IndexedResults<R> {
    slots: Vec<Option<R>>,
}

impl<R> IndexedResults<R> {
    fn with_len(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| None).collect(),
        }
    }

    fn insert(&mut self, index: usize, value: R) {
        debug_assert!(self.slots[index].is_none(), "slot {index} written twice");
        self.slots[index] = Some(value);
    }

    /// Project the slots in position order
    fn into_ordered(self) -> Result<Vec<R>, FanOutError> {
        self.slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| slot.ok_or(FanOutError::MissingResult { index }))
            .collect()
    }
}

/// Bounded-concurrency fan-out executor
///
/// Holds only the concurrency bound; every run creates its own gate.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanOut {
    max_concurrency: Option<NonZeroUsize>,
}

impl FanOut {
    /// Create an executor, `None` meaning unbounded
    ///
    /// A bound of zero is rejected.
    pub fn new(max_concurrency: Option<usize>) -> Result<Self, FanOutError> {
        debug!(?max_concurrency, "FanOut::new: called");
        match max_concurrency {
            None => Ok(Self::unbounded()),
            Some(n) => Self::bounded(n),
        }
    }

    /// Create an executor that launches every item at once
    pub fn unbounded() -> Self {
        Self { max_concurrency: None }
    }

    /// Create an executor running at most `max_concurrency` items at once
    pub fn bounded(max_concurrency: usize) -> Result<Self, FanOutError> {
        let bound = NonZeroUsize::new(max_concurrency).ok_or(FanOutError::OutOfRange {
            name: "max_concurrency",
            value: max_concurrency,
        })?;
        Ok(Self {
            max_concurrency: Some(bound),
        })
    }

    /// Create an executor from configuration
    pub fn from_config(config: &ExecutorConfig) -> Result<Self, FanOutError> {
        Self::new(config.max_concurrency)
    }

    /// Get the concurrency bound, if any
    pub fn max_concurrency(&self) -> Option<usize> {
        self.max_concurrency.map(NonZeroUsize::get)
    }

    /// Run `operation` over every item, waiting for all of them
    ///
    /// Every item runs even when some fail; the failure with the lowest source
    /// index is returned once all in-flight work has settled.
    pub async fn run_for_each<I, F, Fut>(&self, source: I, operation: F) -> Result<(), FanOutError>
    where
        I: IntoIterator,
        I::IntoIter: Send,
        I::Item: Send + 'static,
        F: Fn(I::Item) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = eyre::Result<()>> + Send + 'static,
    {
        self.run_for_each_collecting(source, operation).await.map(|_| ())
    }

    /// Run `operation` over every item and collect the outputs in source order
    ///
    /// Output `i` is always the result for item `i`, whatever order the
    /// operations finish in. Failure handling matches [`run_for_each`](Self::run_for_each).
    pub async fn run_for_each_collecting<I, F, Fut, R>(&self, source: I, operation: F) -> Result<Vec<R>, FanOutError>
    where
        I: IntoIterator,
        I::IntoIter: Send,
        I::Item: Send + 'static,
        F: Fn(I::Item) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = eyre::Result<R>> + Send + 'static,
        R: Send + 'static,
    {
        let operation = Arc::new(operation);
        let gate = self.max_concurrency.map(|n| AdmissionGate::new(n.get()));
        let mut tasks = JoinSet::new();
        let mut count = 0;

        for (index, item) in source.into_iter().enumerate() {
            let admission = match &gate {
                Some(gate) => Some(gate.acquire().await?),
                None => None,
            };
            let operation = operation.clone();

            tasks.spawn(async move {
                let _admission = admission;
                let outcome = match AssertUnwindSafe(async move { operation(item).await })
                    .catch_unwind()
                    .await
                {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(Failure::Error(e)),
                    Err(panic) => Err(Failure::Panicked(panic_message(&*panic))),
                };
                (index, outcome)
            });
            count += 1;
        }
        debug!(count, bound = ?self.max_concurrency(), "FanOut::run_for_each_collecting: all items submitted");

        let mut results = IndexedResults::with_len(count);
        let mut failures: Vec<(usize, Failure)> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (index, outcome) = joined?;
            match outcome {
                Ok(value) => results.insert(index, value),
                Err(failure) => failures.push((index, failure)),
            }
        }

        if let Some(gate) = &gate {
            debug!(
                count,
                peak_in_flight = gate.peak_in_flight(),
                capacity = gate.capacity(),
                "FanOut::run_for_each_collecting: gate released"
            );
        }

        let failed = failures.len();
        let first = failures.into_iter().min_by_key(|(index, _)| *index);
        match first {
            None => results.into_ordered(),
            Some((index, Failure::Error(e))) => {
                warn!(index, failed, error = %e, "Fan-out operation failed");
                Err(FanOutError::operation(index, failed, e))
            }
            Some((index, Failure::Panicked(message))) => {
                warn!(index, failed, %message, "Fan-out operation panicked");
                Err(FanOutError::Panicked { index, message })
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
