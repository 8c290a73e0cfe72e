//! Bounded-parallelism, rate-limited execution of independent operations.
//!
//! A [`ThrottledRunner`] admits queued operations while two budgets allow it:
//!
//! - **Parallelism**: at most `max_parallelism` operations in flight
//!   (`0` disables the cap).
//! - **Rate window**: at most `max_per_window` operation *starts* within any
//!   rolling `window` (`0` for either disables the cap). Start timestamps are
//!   kept in a sliding log; entries older than the window are evicted before
//!   every admission decision.
//!
//! Admission is re-attempted whenever an operation is enqueued, an operation
//! finishes, or the rate window frees up a slot. There is no polling: a
//! single timer is armed for the instant the oldest start leaves the window.
//!
//! # Error modes
//!
//! With `stop_on_error` the first fault stops admission, abandons queued and
//! future operations, and is surfaced from [`ThrottledRunner::wait_for_completion`]
//! and from the handle of every faulted or abandoned operation. Without it,
//! faults stay attached to their own [`OperationResult`].

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RunnerConfig;
use crate::core::error::retain_fault;
use crate::core::events::{emit, EventKind, SharedEventSink};
use crate::core::{OperationFault, SchedulerError, Spawn};
use crate::runtime::TokioSpawner;

/// How an admitted operation ended.
#[derive(Debug)]
pub enum OperationOutcome<T> {
    /// The generator's future resolved successfully.
    Completed(T),
    /// The generator's future returned an error or panicked.
    Faulted(OperationFault),
}

/// Result record of one admitted operation.
#[derive(Debug)]
pub struct OperationResult<T> {
    /// 0-based submission order.
    pub index: u64,
    /// When the operation was admitted.
    pub started_at: Instant,
    /// When the operation's future resolved.
    pub completed_at: Instant,
    /// Value or captured fault.
    pub outcome: OperationOutcome<T>,
}

impl<T> OperationResult<T> {
    /// Whether the operation completed without a fault.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self.outcome, OperationOutcome::Completed(_))
    }

    /// The captured fault, if any.
    #[must_use]
    pub const fn fault(&self) -> Option<&OperationFault> {
        match &self.outcome {
            OperationOutcome::Faulted(fault) => Some(fault),
            OperationOutcome::Completed(_) => None,
        }
    }

    /// Consume the record, keeping the value of a completed operation.
    pub fn into_value(self) -> Option<T> {
        match self.outcome {
            OperationOutcome::Completed(value) => Some(value),
            OperationOutcome::Faulted(_) => None,
        }
    }

    /// Time between admission and completion.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.completed_at.saturating_duration_since(self.started_at)
    }
}

/// Counters describing runner activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunnerStats {
    /// Operations waiting for admission.
    pub queued: usize,
    /// Operations currently in flight.
    pub running: usize,
    /// Operations admitted so far.
    pub started: u64,
    /// Operations that finished (successfully or not).
    pub completed: u64,
    /// Operations that faulted.
    pub faulted: u64,
}

/// First fault seen in stop-on-error mode, shared with every handle.
struct FaultLatch {
    stop_on_error: bool,
    first: Mutex<Option<OperationFault>>,
}

impl FaultLatch {
    fn trip(&self, fault: &OperationFault) {
        let mut first = self.first.lock();
        if first.is_none() {
            *first = Some(fault.clone());
        }
    }

    fn first(&self) -> Option<OperationFault> {
        self.first.lock().clone()
    }

    fn is_tripped(&self) -> bool {
        self.first.lock().is_some()
    }
}

/// Resolved admission limits.
#[derive(Debug, Clone, Copy)]
struct Limits {
    max_parallelism: usize,
    max_per_window: usize,
    window: Duration,
}

impl Limits {
    const fn rate_limited(&self) -> bool {
        self.max_per_window > 0 && !self.window.is_zero()
    }
}

type Launch<S> = Box<dyn FnOnce(Arc<Shared<S>>, Instant) -> BoxFuture<'static, ()> + Send>;

struct QueuedOperation<S> {
    index: u64,
    launch: Launch<S>,
}

struct RunnerState<S> {
    queue: VecDeque<QueuedOperation<S>>,
    running: usize,
    starts: VecDeque<Instant>,
    next_index: u64,
    timer_armed: bool,
    faults: VecDeque<OperationFault>,
    started: u64,
    completed: u64,
    faulted: u64,
}

impl<S> RunnerState<S> {
    /// Evict stale starts and, if the window is full, return when the next
    /// slot frees up.
    fn rate_deadline(&mut self, now: Instant, limits: &Limits) -> Option<Instant> {
        if !limits.rate_limited() {
            return None;
        }
        while let Some(&front) = self.starts.front() {
            if now.saturating_duration_since(front) >= limits.window {
                self.starts.pop_front();
            } else {
                break;
            }
        }
        if self.starts.len() >= limits.max_per_window {
            self.starts.front().map(|&front| front + limits.window)
        } else {
            None
        }
    }
}

struct Shared<S> {
    limits: Limits,
    latch: Arc<FaultLatch>,
    state: Mutex<RunnerState<S>>,
    outstanding: watch::Sender<usize>,
    cancel: CancellationToken,
    spawner: S,
    events: OnceLock<SharedEventSink>,
}

impl<S: Spawn> Shared<S> {
    fn is_halted(&self) -> bool {
        self.cancel.is_cancelled() || (self.latch.stop_on_error && self.latch.is_tripped())
    }

    /// Admit as many queued operations as the budgets allow.
    fn pump(self: &Arc<Self>) {
        let mut launches = Vec::new();
        let mut abandoned = Vec::new();
        let mut timer_deadline = None;
        {
            let mut state = self.state.lock();
            if self.is_halted() {
                abandoned.extend(state.queue.drain(..));
            } else {
                let now = Instant::now();
                while !state.queue.is_empty() {
                    if self.limits.max_parallelism > 0
                        && state.running >= self.limits.max_parallelism
                    {
                        break;
                    }
                    if let Some(deadline) = state.rate_deadline(now, &self.limits) {
                        if !state.timer_armed {
                            state.timer_armed = true;
                            timer_deadline = Some(deadline);
                        }
                        break;
                    }
                    let Some(op) = state.queue.pop_front() else {
                        break;
                    };
                    state.running += 1;
                    state.started += 1;
                    if self.limits.rate_limited() {
                        state.starts.push_back(now);
                    }
                    launches.push(op);
                }
            }
        }

        if !abandoned.is_empty() {
            let count = abandoned.len();
            info!(
                count,
                cancelled = self.cancel.is_cancelled(),
                "abandoned queued operations"
            );
            drop(abandoned);
            self.outstanding.send_modify(|n| *n = n.saturating_sub(count));
        }

        for op in launches {
            debug!(index = op.index, "admitting operation");
            let shared = Arc::clone(self);
            let started_at = Instant::now();
            self.spawner.spawn(async move {
                (op.launch)(Arc::clone(&shared), started_at).await;
                shared.on_finished();
            });
        }

        if let Some(deadline) = timer_deadline {
            debug!("rate window full, arming admission timer");
            let shared = Arc::clone(self);
            self.spawner.spawn(async move {
                tokio::select! {
                    () = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {}
                    () = shared.cancel.cancelled() => {}
                }
                shared.state.lock().timer_armed = false;
                shared.pump();
            });
        }
    }

    fn on_finished(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            state.running = state.running.saturating_sub(1);
            state.completed += 1;
        }
        self.pump();
        self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
    }

    fn record_fault(&self, fault: &OperationFault) {
        warn!(origin = fault.origin(), error = %fault.error(), "operation faulted");
        emit(
            self.events.get(),
            "throttled_runner",
            EventKind::OperationFaulted,
            Some(fault.to_string()),
        );
        let mut state = self.state.lock();
        state.faulted += 1;
        if self.latch.stop_on_error {
            self.latch.trip(fault);
        } else {
            retain_fault(&mut state.faults, fault.clone());
        }
    }
}

/// Handle to one enqueued operation.
///
/// Dropping the handle does not cancel the operation.
pub struct OperationHandle<T> {
    index: u64,
    rx: oneshot::Receiver<OperationResult<T>>,
    latch: Arc<FaultLatch>,
}

impl<T> OperationHandle<T> {
    /// 0-based submission index of the operation.
    #[must_use]
    pub const fn index(&self) -> u64 {
        self.index
    }

    /// Wait for the operation to finish.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::OperationFault` in stop-on-error mode when this
    ///   operation faulted or was abandoned because another one did (the
    ///   first fault is returned).
    /// - `SchedulerError::Cancelled` when the operation was abandoned by
    ///   cancellation before it started.
    pub async fn wait(self) -> Result<OperationResult<T>, SchedulerError> {
        match self.rx.await {
            Ok(result) => {
                if self.latch.stop_on_error {
                    if let OperationOutcome::Faulted(own) = &result.outcome {
                        let first = self.latch.first().unwrap_or_else(|| own.clone());
                        return Err(SchedulerError::OperationFault(first));
                    }
                }
                Ok(result)
            }
            Err(_) => Err(self
                .latch
                .first()
                .map_or(SchedulerError::Cancelled, SchedulerError::OperationFault)),
        }
    }
}

impl<T> fmt::Debug for OperationHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationHandle")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

/// Runs operation generators under a parallelism cap and a rolling rate cap.
///
/// Cloning yields another handle to the same runner.
pub struct ThrottledRunner<S: Spawn = TokioSpawner> {
    shared: Arc<Shared<S>>,
}

impl<S: Spawn> Clone for ThrottledRunner<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl ThrottledRunner<TokioSpawner> {
    /// Create a runner on the current tokio runtime with its own cancellation scope.
    #[must_use]
    pub fn new(config: RunnerConfig) -> Self {
        Self::with_cancellation(config, &CancellationToken::new())
    }

    /// Create a runner on the current tokio runtime, cancelled together with `cancel`.
    #[must_use]
    pub fn with_cancellation(config: RunnerConfig, cancel: &CancellationToken) -> Self {
        Self::with_spawner(config, cancel, TokioSpawner::current())
    }
}

impl<S: Spawn> ThrottledRunner<S> {
    /// Create a runner that spawns operations through `spawner`.
    ///
    /// The runner observes a child of `cancel`; cancelling the runner does
    /// not cancel the parent scope.
    pub fn with_spawner(config: RunnerConfig, cancel: &CancellationToken, spawner: S) -> Self {
        let limits = Limits {
            max_parallelism: config.max_parallelism,
            max_per_window: config.max_per_window,
            window: config.window(),
        };
        let (outstanding, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                limits,
                latch: Arc::new(FaultLatch {
                    stop_on_error: config.stop_on_error,
                    first: Mutex::new(None),
                }),
                state: Mutex::new(RunnerState {
                    queue: VecDeque::new(),
                    running: 0,
                    starts: VecDeque::new(),
                    next_index: 0,
                    timer_armed: false,
                    faults: VecDeque::new(),
                    started: 0,
                    completed: 0,
                    faulted: 0,
                }),
                outstanding,
                cancel: cancel.child_token(),
                spawner,
                events: OnceLock::new(),
            }),
        }
    }

    /// Forward operation faults to an event sink. Only the first sink set sticks.
    #[must_use]
    pub fn with_events(self, sink: SharedEventSink) -> Self {
        let _ = self.shared.events.set(sink);
        self
    }

    /// Schedule one generator for eventual execution.
    ///
    /// The generator is invoked once the operation is admitted. The returned
    /// handle may be dropped for fire-and-forget use.
    pub fn enqueue<T, F, Fut>(&self, generator: F) -> OperationHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let latch = Arc::clone(&self.shared.latch);

        let index = {
            let mut state = self.shared.state.lock();
            let index = state.next_index;
            state.next_index += 1;

            if self.shared.is_halted() {
                debug!(index, "runner halted, operation abandoned on enqueue");
                return OperationHandle { index, rx, latch };
            }

            let launch: Launch<S> = Box::new(move |shared: Arc<Shared<S>>, started_at| {
                async move {
                    let origin = format!("operation #{index}");
                    let outcome = AssertUnwindSafe(async move { generator().await })
                        .catch_unwind()
                        .await;
                    let completed_at = Instant::now();
                    let outcome = match outcome {
                        Ok(Ok(value)) => OperationOutcome::Completed(value),
                        Ok(Err(error)) => {
                            OperationOutcome::Faulted(OperationFault::new(origin, error))
                        }
                        Err(payload) => OperationOutcome::Faulted(OperationFault::from_panic(
                            origin,
                            payload.as_ref(),
                        )),
                    };
                    if let OperationOutcome::Faulted(fault) = &outcome {
                        shared.record_fault(fault);
                    }
                    let _ = tx.send(OperationResult {
                        index,
                        started_at,
                        completed_at,
                        outcome,
                    });
                }
                .boxed()
            });

            state.queue.push_back(QueuedOperation { index, launch });
            self.shared.outstanding.send_modify(|n| *n += 1);
            index
        };

        self.shared.pump();
        OperationHandle { index, rx, latch }
    }

    /// Enqueue a generator and wait for its result record.
    ///
    /// # Errors
    ///
    /// See [`OperationHandle::wait`].
    pub async fn enqueue_and_wait<T, F, Fut>(
        &self,
        generator: F,
    ) -> Result<OperationResult<T>, SchedulerError>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.enqueue(generator).wait().await
    }

    /// Wait until every operation enqueued so far has finished or been abandoned.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::OperationFault` carrying the first fault in
    ///   stop-on-error mode.
    /// - `SchedulerError::Cancelled` once the runner was cancelled and all
    ///   in-flight operations have unwound.
    pub async fn wait_for_completion(&self) -> Result<(), SchedulerError> {
        let mut outstanding = self.shared.outstanding.subscribe();
        let _ = outstanding.wait_for(|n| *n == 0).await;

        if let Some(fault) = self.shared.latch.first() {
            return Err(SchedulerError::OperationFault(fault));
        }
        if self.shared.cancel.is_cancelled() {
            return Err(SchedulerError::Cancelled);
        }
        Ok(())
    }

    /// Stop admitting work and abandon everything still queued.
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
        self.shared.pump();
    }

    /// Whether the runner has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// The runner's cancellation token.
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.shared.cancel
    }

    /// Faults recorded in continue-on-error mode, in completion order.
    ///
    /// At most [`MAX_RETAINED_FAULTS`](crate::core::MAX_RETAINED_FAULTS) are
    /// kept; `stats().faulted` counts all of them.
    #[must_use]
    pub fn faults(&self) -> Vec<OperationFault> {
        self.shared.state.lock().faults.iter().cloned().collect()
    }

    /// The first fault in stop-on-error mode.
    #[must_use]
    pub fn first_fault(&self) -> Option<OperationFault> {
        self.shared.latch.first()
    }

    /// Snapshot of runner counters.
    #[must_use]
    pub fn stats(&self) -> RunnerStats {
        let state = self.shared.state.lock();
        RunnerStats {
            queued: state.queue.len(),
            running: state.running,
            started: state.started,
            completed: state.completed,
            faulted: state.faulted,
        }
    }
}

impl<S: Spawn> fmt::Debug for ThrottledRunner<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottledRunner")
            .field("limits", &self.shared.limits)
            .field("stop_on_error", &self.shared.latch.stop_on_error)
            .field("stats", &self.stats())
            .finish()
    }
}
