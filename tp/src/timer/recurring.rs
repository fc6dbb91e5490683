//! RecurringTimer - cancellable background loop around an async workload
//!
//! Each effective `start` creates a run generation: one cancellation token and
//! one spawned driver task. The driver waits for the due time, then invokes the
//! workload and waits for the period until the token is cancelled. `start` and
//! `stop` serialize on a single async mutex, so concurrent callers never create
//! two drivers or race a cancellation.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use eyre::eyre;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::TimerConfig;
use super::delay::{Cadence, Delay};
use super::error::TimerError;

/// A caller-supplied workload invoked on every tick
pub type Workload = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, eyre::Result<()>> + Send + Sync>;

/// Callback notified when a workload fails
pub type ErrorHandler = Arc<dyn Fn(&eyre::Report) + Send + Sync>;

/// Lifecycle state of a RecurringTimer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Idle,
    Running,
    Disposed,
}

/// Counters for a RecurringTimer
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TimerStats {
    /// Workload invocations started, across all generations
    pub invocations: u64,
    /// Workload failures reported to the error handler
    pub failures: u64,
    /// Run generations started
    pub generations: u64,
}

/// State shared between the timer handle and its driver tasks
struct Shared {
    workload: Workload,
    cadence: Cadence,
    allow_overlap: bool,
    on_error: RwLock<Option<ErrorHandler>>,

    /// Id of the generation currently considered running, 0 when none
    active: AtomicU64,

    invocations: AtomicU64,
    failures: AtomicU64,
    generations: AtomicU64,
}

impl Shared {
    /// Run the workload once, converting a panic into an error
    async fn invoke(&self, token: CancellationToken) -> eyre::Result<()> {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        let workload = self.workload.clone();
        match AssertUnwindSafe(async move { workload(token).await })
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(eyre!("workload panicked: {}", panic_message(&*panic))),
        }
    }

    /// Record a workload failure and notify the error handler
    ///
    /// Only the first failure of a still-active generation is reported. A
    /// panicking handler is logged and otherwise ignored.
    fn fail(&self, generation: u64, err: eyre::Report) {
        if self
            .active
            .compare_exchange(generation, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(generation, error = %err, "Shared::fail: generation no longer active, suppressing");
            return;
        }
        self.failures.fetch_add(1, Ordering::Relaxed);
        error!(generation, error = %err, "Workload failed, timer loop terminating");

        let handler = self
            .on_error
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(handler) = handler else {
            debug!(generation, "Shared::fail: no error handler registered");
            return;
        };

        if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| handler(&err))) {
            warn!(generation, panic = %panic_message(&*panic), "Error handler panicked, ignoring");
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

/// One cancellation scope plus the driver task it controls
struct RunGeneration {
    id: u64,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// State guarded by the start/stop mutex
struct Lifecycle {
    generation: Option<RunGeneration>,

    /// Runtime the last generation was spawned on, used by `close` off-runtime
    runtime: Option<Handle>,
}

/// Recurring, cancellable background timer
///
/// Share it behind an `Arc` to start and stop it from several tasks.
pub struct RecurringTimer {
    shared: Arc<Shared>,
    lifecycle: Mutex<Lifecycle>,
    stop_timeout: Option<Duration>,
    disposed: AtomicBool,

    /// Parent of every generation token; cancelled on dispose and drop
    root: CancellationToken,
}

impl RecurringTimer {
    /// Start building a timer
    pub fn builder() -> RecurringTimerBuilder {
        RecurringTimerBuilder::default()
    }

    /// Create a timer from a workload and a cadence
    pub fn new<F, Fut>(workload: F, due_time: impl Into<Delay>, period: impl Into<Delay>, allow_overlap: bool) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = eyre::Result<()>> + Send + 'static,
    {
        Self::from_parts(
            boxed_workload(workload),
            Cadence::new(due_time, period),
            allow_overlap,
            None,
            None,
        )
    }

    /// Create a timer from configuration
    pub fn from_config<F, Fut>(config: &TimerConfig, workload: F) -> Result<Self, TimerError>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = eyre::Result<()>> + Send + 'static,
    {
        debug!(?config, "RecurringTimer::from_config: called");
        let cadence = config.cadence()?;
        Ok(Self::from_parts(
            boxed_workload(workload),
            cadence,
            config.allow_overlap,
            config.stop_timeout(),
            None,
        ))
    }

    fn from_parts(
        workload: Workload,
        cadence: Cadence,
        allow_overlap: bool,
        stop_timeout: Option<Duration>,
        on_error: Option<ErrorHandler>,
    ) -> Self {
        debug!(
            due_time = %cadence.due_time,
            period = %cadence.period,
            allow_overlap,
            ?stop_timeout,
            "RecurringTimer::new: called"
        );
        Self {
            shared: Arc::new(Shared {
                workload,
                cadence,
                allow_overlap,
                on_error: RwLock::new(on_error),
                active: AtomicU64::new(0),
                invocations: AtomicU64::new(0),
                failures: AtomicU64::new(0),
                generations: AtomicU64::new(0),
            }),
            lifecycle: Mutex::new(Lifecycle {
                generation: None,
                runtime: None,
            }),
            stop_timeout,
            disposed: AtomicBool::new(false),
            root: CancellationToken::new(),
        }
    }

    /// Get the cadence this timer runs on
    pub fn cadence(&self) -> Cadence {
        self.shared.cadence
    }

    /// Check whether invocations may overlap
    pub fn allow_overlap(&self) -> bool {
        self.shared.allow_overlap
    }

    /// Set the error handler, replacing any previous one
    pub fn on_error<H>(&self, handler: H)
    where
        H: Fn(&eyre::Report) + Send + Sync + 'static,
    {
        debug!("RecurringTimer::on_error: handler registered");
        *self.shared.on_error.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// Remove the error handler
    pub fn clear_on_error(&self) {
        debug!("RecurringTimer::clear_on_error: called");
        *self.shared.on_error.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Check whether a generation is live and has not terminated on failure
    pub fn is_running(&self) -> bool {
        self.shared.active.load(Ordering::Acquire) != 0
    }

    /// Get the current lifecycle state
    pub fn state(&self) -> TimerState {
        if self.disposed.load(Ordering::Acquire) {
            TimerState::Disposed
        } else if self.is_running() {
            TimerState::Running
        } else {
            TimerState::Idle
        }
    }

    /// Get a snapshot of the timer counters
    pub fn stats(&self) -> TimerStats {
        TimerStats {
            invocations: self.shared.invocations.load(Ordering::Relaxed),
            failures: self.shared.failures.load(Ordering::Relaxed),
            generations: self.shared.generations.load(Ordering::Relaxed),
        }
    }

    /// Start the background loop
    ///
    /// Does nothing when the timer is already running. Must be called from
    /// within a tokio runtime.
    pub async fn start(&self) -> Result<(), TimerError> {
        debug!("RecurringTimer::start: called");
        let mut lifecycle = self.lifecycle.lock().await;
        if self.disposed.load(Ordering::Acquire) {
            debug!("RecurringTimer::start: disposed, rejecting");
            return Err(TimerError::Disposed);
        }

        let live = lifecycle.generation.as_ref().map(|g| g.id);
        if live.is_some() && live == Some(self.shared.active.load(Ordering::Acquire)) {
            debug!(?live, "RecurringTimer::start: already running, ignoring");
            return Ok(());
        }

        // A generation that terminated on failure is reaped before replacing it
        if let Some(stale) = lifecycle.generation.take() {
            debug!(generation = stale.id, "RecurringTimer::start: reaping terminated generation");
            stale.token.cancel();
            if let Err(e) = stale.handle.await {
                warn!(generation = stale.id, error = %e, "Terminated timer loop ended abnormally");
            }
        }

        let id = self.shared.generations.fetch_add(1, Ordering::AcqRel) + 1;
        let token = self.root.child_token();
        self.shared.active.store(id, Ordering::Release);
        lifecycle.runtime = Some(Handle::current());
        let handle = tokio::spawn(run_loop(self.shared.clone(), id, token.clone()));
        lifecycle.generation = Some(RunGeneration { id, token, handle });

        info!(
            generation = id,
            due_time = %self.shared.cadence.due_time,
            period = %self.shared.cadence.period,
            allow_overlap = self.shared.allow_overlap,
            "RecurringTimer started"
        );
        Ok(())
    }

    /// Stop the background loop and wait for it to exit
    ///
    /// Does nothing when the timer is idle. Cancellation is cooperative: a
    /// workload that ignores its token delays this call unless a stop timeout
    /// is configured, in which case the loop is aborted once it expires.
    pub async fn stop(&self) -> Result<(), TimerError> {
        debug!("RecurringTimer::stop: called");
        let mut lifecycle = self.lifecycle.lock().await;
        if self.disposed.load(Ordering::Acquire) {
            debug!("RecurringTimer::stop: disposed, rejecting");
            return Err(TimerError::Disposed);
        }

        self.stop_locked(&mut lifecycle).await;
        Ok(())
    }

    async fn stop_locked(&self, lifecycle: &mut Lifecycle) {
        let Some(generation) = lifecycle.generation.take() else {
            debug!("RecurringTimer::stop_locked: not running");
            return;
        };

        let _ = self
            .shared
            .active
            .compare_exchange(generation.id, 0, Ordering::AcqRel, Ordering::Acquire);
        generation.token.cancel();
        self.await_loop(generation).await;
    }

    async fn await_loop(&self, generation: RunGeneration) {
        let RunGeneration { id, handle, .. } = generation;
        debug!(generation = id, "RecurringTimer::await_loop: waiting for loop to exit");

        let result = match self.stop_timeout {
            Some(limit) => {
                let abort = handle.abort_handle();
                match tokio::time::timeout(limit, handle).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(
                            generation = id,
                            timeout = ?limit,
                            "Timer loop did not stop in time, aborting"
                        );
                        abort.abort();
                        return;
                    }
                }
            }
            None => handle.await,
        };

        match result {
            Ok(()) => info!(generation = id, "RecurringTimer stopped"),
            Err(e) if e.is_cancelled() => debug!(generation = id, "RecurringTimer::await_loop: loop was aborted"),
            Err(e) => warn!(generation = id, error = %e, "Timer loop ended abnormally"),
        }
    }

    /// Stop the loop and release the timer
    ///
    /// Idempotent. Every later `start` or `stop` fails with
    /// [`TimerError::Disposed`].
    pub async fn dispose(&self) {
        debug!("RecurringTimer::dispose: called");
        let mut lifecycle = self.lifecycle.lock().await;
        if self.disposed.load(Ordering::Acquire) {
            debug!("RecurringTimer::dispose: already disposed");
            return;
        }

        self.stop_locked(&mut lifecycle).await;
        self.disposed.store(true, Ordering::Release);
        self.root.cancel();
        lifecycle.runtime = None;
        info!("RecurringTimer disposed");
    }

    /// Blocking form of [`dispose`](Self::dispose)
    ///
    /// On a multi-thread runtime this blocks in place; outside any runtime it
    /// drives disposal on the runtime the loop was spawned on. A current-thread
    /// runtime cannot be blocked, so there the loop is only cancelled.
    pub fn close(&self) {
        debug!("RecurringTimer::close: called");
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| handle.block_on(self.dispose()));
            }
            Ok(_) => {
                warn!("RecurringTimer::close on a current-thread runtime, cancelling without waiting");
                self.root.cancel();
                self.shared.active.store(0, Ordering::Release);
                self.disposed.store(true, Ordering::Release);
            }
            Err(_) => {
                let runtime = self.lifecycle.blocking_lock().runtime.clone();
                match runtime {
                    Some(handle) => handle.block_on(self.dispose()),
                    None => futures::executor::block_on(self.dispose()),
                }
            }
        }
    }
}

impl Drop for RecurringTimer {
    fn drop(&mut self) {
        if !self.disposed.load(Ordering::Acquire) && self.is_running() {
            debug!("RecurringTimer::drop: dropped while running, cancelling loop");
        }
        self.root.cancel();
    }
}

impl fmt::Debug for RecurringTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecurringTimer")
            .field("cadence", &self.shared.cadence)
            .field("allow_overlap", &self.shared.allow_overlap)
            .field("stop_timeout", &self.stop_timeout)
            .field("state", &self.state())
            .finish()
    }
}

/// Driver loop for one run generation
async fn run_loop(shared: Arc<Shared>, generation: u64, token: CancellationToken) {
    debug!(generation, due_time = %shared.cadence.due_time, "run_loop: waiting for due time");
    if !shared.cadence.due_time.wait(&token).await {
        debug!(generation, "run_loop: cancelled before due time");
        return;
    }

    while !token.is_cancelled() {
        if shared.allow_overlap {
            spawn_detached(shared.clone(), generation, token.clone());
        } else if let Err(e) = shared.invoke(token.clone()).await {
            if token.is_cancelled() {
                debug!(generation, error = %e, "run_loop: workload failed after cancellation, ignoring");
                break;
            }
            shared.fail(generation, e);
            return;
        }

        if !shared.cadence.period.wait(&token).await {
            break;
        }
    }

    debug!(generation, "run_loop: cancelled");
}

/// Launch one invocation without awaiting it
///
/// A failure goes through the same path as a sequential one and also cancels
/// the generation, which ends the driver loop.
fn spawn_detached(shared: Arc<Shared>, generation: u64, token: CancellationToken) {
    debug!(generation, "spawn_detached: launching invocation");
    tokio::spawn(async move {
        if token.is_cancelled() {
            debug!(generation, "spawn_detached: cancelled before invocation, skipping");
            return;
        }
        if let Err(e) = shared.invoke(token.clone()).await {
            if token.is_cancelled() {
                debug!(generation, error = %e, "spawn_detached: failed after cancellation, ignoring");
                return;
            }
            token.cancel();
            shared.fail(generation, e);
        }
    });
}

fn boxed_workload<F, Fut>(workload: F) -> Workload
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = eyre::Result<()>> + Send + 'static,
{
    Arc::new(move |token| workload(token).boxed())
}

/// Builder for [`RecurringTimer`]
#[derive(Default)]
pub struct RecurringTimerBuilder {
    workload: Option<Workload>,
    due_time: Option<Delay>,
    period: Option<Delay>,
    allow_overlap: bool,
    stop_timeout: Option<Duration>,
    on_error: Option<ErrorHandler>,
}

impl RecurringTimerBuilder {
    /// Set the workload invoked on every tick
    pub fn workload<F, Fut>(mut self, workload: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = eyre::Result<()>> + Send + 'static,
    {
        self.workload = Some(boxed_workload(workload));
        self
    }

    /// Set the delay before the first invocation
    pub fn due_time(mut self, due_time: impl Into<Delay>) -> Self {
        self.due_time = Some(due_time.into());
        self
    }

    /// Set the delay between invocations
    pub fn period(mut self, period: impl Into<Delay>) -> Self {
        self.period = Some(period.into());
        self
    }

    /// Launch invocations detached instead of awaiting each one
    pub fn allow_overlap(mut self, allow_overlap: bool) -> Self {
        self.allow_overlap = allow_overlap;
        self
    }

    /// Bound how long `stop` waits before aborting the loop
    pub fn stop_timeout(mut self, stop_timeout: Option<Duration>) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    /// Set the error handler
    pub fn on_error<H>(mut self, handler: H) -> Self
    where
        H: Fn(&eyre::Report) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(handler));
        self
    }

    /// Build the timer, failing if a required part is missing
    pub fn build(self) -> Result<RecurringTimer, TimerError> {
        let workload = self.workload.ok_or(TimerError::MissingArgument("workload"))?;
        let due_time = self.due_time.ok_or(TimerError::MissingArgument("due_time"))?;
        let period = self.period.ok_or(TimerError::MissingArgument("period"))?;

        Ok(RecurringTimer::from_parts(
            workload,
            Cadence { due_time, period },
            self.allow_overlap,
            self.stop_timeout,
            self.on_error,
        ))
    }
}
