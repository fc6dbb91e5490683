//! Delay and cadence types
//!
//! A [`Delay`] is either a finite wait or [`Delay::Never`], the infinite
//! sentinel. As a due time `Never` suppresses every invocation; as a period it
//! lets the workload run exactly once.

use std::fmt;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::error::TimerError;

/// Millisecond value accepted as "wait forever" by [`Delay::from_millis`]
pub const INFINITE_MILLIS: i64 = -1;

/// How long to wait before the next step of a timer loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Delay {
    /// Wait for the given duration
    After(Duration),
    /// Never complete the wait
    Never,
}

impl Delay {
    pub const ZERO: Delay = Delay::After(Duration::ZERO);

    /// Create a delay from whole milliseconds
    pub fn from_millis(millis: u64) -> Self {
        Delay::After(Duration::from_millis(millis))
    }

    /// Create a delay from signed milliseconds, treating `-1` as infinite
    ///
    /// Any other negative value is rejected.
    pub fn from_signed_millis(name: &'static str, millis: i64) -> Result<Self, TimerError> {
        match millis {
            INFINITE_MILLIS => Ok(Delay::Never),
            m if m >= 0 => Ok(Delay::from_millis(m as u64)),
            value => Err(TimerError::OutOfRange { name, value }),
        }
    }

    /// Check if this is the infinite sentinel
    pub fn is_never(&self) -> bool {
        matches!(self, Delay::Never)
    }

    /// Get the finite duration, if any
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Delay::After(d) => Some(*d),
            Delay::Never => None,
        }
    }

    /// Wait out this delay unless `token` is cancelled first
    ///
    /// Returns `true` when the delay elapsed and `false` on cancellation.
    pub(crate) async fn wait(&self, token: &CancellationToken) -> bool {
        match self {
            Delay::After(duration) => {
                tokio::select! {
                    _ = token.cancelled() => false,
                    _ = tokio::time::sleep(*duration) => true,
                }
            }
            Delay::Never => {
                token.cancelled().await;
                false
            }
        }
    }
}

impl From<Duration> for Delay {
    fn from(duration: Duration) -> Self {
        Delay::After(duration)
    }
}

impl fmt::Display for Delay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delay::After(d) => write!(f, "{}ms", d.as_millis()),
            Delay::Never => write!(f, "never"),
        }
    }
}

/// Due time and period of a recurring timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    /// Initial delay before the first invocation
    pub due_time: Delay,
    /// Delay between invocations
    pub period: Delay,
}

impl Cadence {
    pub fn new(due_time: impl Into<Delay>, period: impl Into<Delay>) -> Self {
        Self {
            due_time: due_time.into(),
            period: period.into(),
        }
    }

    /// Build a cadence from signed milliseconds (`-1` meaning infinite)
    pub fn from_signed_millis(due_time_ms: i64, period_ms: i64) -> Result<Self, TimerError> {
        Ok(Self {
            due_time: Delay::from_signed_millis("due_time", due_time_ms)?,
            period: Delay::from_signed_millis("period", period_ms)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_signed_millis() {
        assert_eq!(
            Delay::from_signed_millis("due_time", 250).unwrap(),
            Delay::After(Duration::from_millis(250))
        );
        assert_eq!(Delay::from_signed_millis("due_time", 0).unwrap(), Delay::ZERO);
        assert_eq!(Delay::from_signed_millis("due_time", -1).unwrap(), Delay::Never);
    }

    #[test]
    fn test_from_signed_millis_rejects_negative() {
        let err = Delay::from_signed_millis("period", -2).unwrap_err();
        assert!(matches!(
            err,
            TimerError::OutOfRange {
                name: "period",
                value: -2
            }
        ));
    }

    #[test]
    fn test_cadence_from_signed_millis() {
        let cadence = Cadence::from_signed_millis(-1, 500).unwrap();
        assert!(cadence.due_time.is_never());
        assert_eq!(cadence.period.as_duration(), Some(Duration::from_millis(500)));

        assert!(Cadence::from_signed_millis(10, -100).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(Delay::from_millis(300).to_string(), "300ms");
        assert_eq!(Delay::Never.to_string(), "never");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_elapses() {
        let token = CancellationToken::new();
        let start = tokio::time::Instant::now();
        assert!(Delay::from_millis(100).wait(&token).await);
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_never_returns_on_cancel() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            canceller.cancel();
        });

        assert!(!Delay::Never.wait(&token).await);
    }

    #[tokio::test]
    async fn test_wait_cancelled_before_start() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(!Delay::from_millis(60_000).wait(&token).await);
    }
}
