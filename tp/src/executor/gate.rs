//! Admission gate bounding concurrent operations

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use super::error::FanOutError;

#[derive(Debug, Default)]
struct Counters {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// Counting gate with a fixed number of admissions
///
/// Cheap to clone; clones share the same admissions.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    counters: Arc<Counters>,
}

/// One granted admission, returned to the gate on drop
#[derive(Debug)]
pub struct Admission {
    _permit: OwnedSemaphorePermit,
    counters: Arc<Counters>,
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl AdmissionGate {
    /// Create a gate granting at most `capacity` admissions at once
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "AdmissionGate::new: called");
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Wait for an admission
    pub async fn acquire(&self) -> Result<Admission, FanOutError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FanOutError::GateClosed)?;

        let now = self.counters.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.counters.peak.fetch_max(now, Ordering::AcqRel);
        Ok(Admission {
            _permit: permit,
            counters: self.counters.clone(),
        })
    }

    /// Get the maximum number of admissions
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get the number of admissions currently held
    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::Acquire)
    }

    /// Get the highest number of admissions held at once
    pub fn peak_in_flight(&self) -> usize {
        self.counters.peak.load(Ordering::Acquire)
    }

    /// Get the number of admissions that can be granted without waiting
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let gate = AdmissionGate::new(2);
        assert_eq!(gate.capacity(), 2);

        let a = gate.acquire().await.unwrap();
        let b = gate.acquire().await.unwrap();
        assert_eq!(gate.in_flight(), 2);
        assert_eq!(gate.available(), 0);

        drop(a);
        assert_eq!(gate.in_flight(), 1);
        assert_eq!(gate.available(), 1);

        drop(b);
        assert_eq!(gate.in_flight(), 0);
        assert_eq!(gate.peak_in_flight(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_when_full() {
        let gate = AdmissionGate::new(1);
        let held = gate.acquire().await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), gate.acquire()).await;
        assert!(blocked.is_err());

        drop(held);
        let granted = tokio::time::timeout(Duration::from_millis(50), gate.acquire()).await;
        assert!(granted.is_ok());
    }

    async fn hold_and_panic(admission: Admission) {
        let _admission = admission;
        panic!("operation blew up")
    }

    #[tokio::test]
    async fn test_release_on_panic() {
        let gate = AdmissionGate::new(1);
        let admission = gate.acquire().await.unwrap();

        let result = tokio::spawn(hold_and_panic(admission)).await;
        assert!(result.is_err());

        assert_eq!(gate.in_flight(), 0);
        assert_eq!(gate.available(), 1);
    }
}
