//! Registry of named background tasks sharing one cancellation scope.
//!
//! A [`TaskManager`] runs two kinds of entries:
//!
//! - **One-shot** tasks run their body once and leave the registry when it
//!   returns or faults.
//! - **Periodic** tasks re-run their body on an interval (or only when
//!   triggered, for [`TaskInterval::Infinite`]) until they exit, fault, or
//!   the scope is cancelled. Firings of one entry never overlap: the body
//!   runs to completion before the next tick is considered.
//!
//! Faults stay isolated to the entry that raised them and surface through
//! [`TaskManager::wait_for_all`].

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::core::error::retain_fault;
use crate::core::events::{emit, EventKind, SharedEventSink};
use crate::core::{OperationFault, SchedulerError, Spawn};
use crate::runtime::TokioSpawner;

/// How often a periodic task fires on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskInterval {
    /// Fire once per period.
    Every(Duration),
    /// Never fire on a timer; only explicit triggers run the body.
    Infinite,
}

impl From<Duration> for TaskInterval {
    fn from(period: Duration) -> Self {
        Self::Every(period)
    }
}

/// Handed to every invocation of a task body.
#[derive(Debug, Clone)]
pub struct TaskContext {
    id: Uuid,
    name: Option<Arc<str>>,
    cancel: CancellationToken,
    exit: CancellationToken,
}

impl TaskContext {
    /// Registry identifier of the entry.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Entry name; `None` for anonymous entries.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The manager's shared cancellation scope.
    #[must_use]
    pub const fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the shared scope was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop a periodic entry once the current firing returns.
    pub fn request_exit(&self) {
        self.exit.cancel();
    }

    /// Whether the entry was asked to exit.
    #[must_use]
    pub fn exit_requested(&self) -> bool {
        self.exit.is_cancelled()
    }

    /// Resolves once the scope is cancelled or the entry is asked to exit.
    pub async fn stopped(&self) {
        tokio::select! {
            () = self.cancel.cancelled() => {}
            () = self.exit.cancelled() => {}
        }
    }
}

type TaskOutcome = Result<(), OperationFault>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TaskKey {
    Named(String),
    Anonymous(Uuid),
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(name) => f.write_str(name),
            Self::Anonymous(id) => write!(f, "task {id}"),
        }
    }
}

struct PeriodicControl {
    paused: watch::Sender<bool>,
    trigger: Arc<Notify>,
}

struct TaskEntry {
    id: Uuid,
    periodic: Option<PeriodicControl>,
    exit: CancellationToken,
    done: watch::Receiver<Option<TaskOutcome>>,
}

#[derive(Debug, Default)]
struct Tally {
    active: usize,
    faults: VecDeque<OperationFault>,
    fault_count: usize,
}

impl Tally {
    fn aggregate(&self) -> SchedulerError {
        SchedulerError::AggregateFault(self.faults.iter().cloned().collect())
    }
}

struct Inner<S> {
    cancel: CancellationToken,
    spawner: S,
    registry: Mutex<HashMap<TaskKey, TaskEntry>>,
    tally: watch::Sender<Tally>,
    events: OnceLock<SharedEventSink>,
}

/// Keeps an entry registered while its future is alive; settles it on drop.
struct Registration<S> {
    inner: Arc<Inner<S>>,
    key: TaskKey,
    id: Uuid,
    periodic: bool,
    done: watch::Sender<Option<TaskOutcome>>,
    outcome: Option<TaskOutcome>,
}

impl<S> Registration<S> {
    fn settle(mut self, outcome: TaskOutcome) {
        self.outcome = Some(outcome);
    }
}

impl<S> Drop for Registration<S> {
    fn drop(&mut self) {
        // A future dropped mid-flight ends as if cancelled.
        let outcome = self.outcome.take().unwrap_or(Ok(()));
        {
            let mut registry = self.inner.registry.lock();
            if registry.get(&self.key).is_some_and(|e| e.id == self.id) {
                registry.remove(&self.key);
            }
        }

        let source = self.key.to_string();
        match &outcome {
            Ok(()) => {
                debug!(task = %source, periodic = self.periodic, "task finished");
                let kind = if self.periodic {
                    EventKind::TaskExited
                } else {
                    EventKind::TaskCompleted
                };
                emit(self.inner.events.get(), &source, kind, None);
            }
            Err(fault) => {
                error!(task = %source, error = %fault.error(), "task faulted");
                emit(
                    self.inner.events.get(),
                    &source,
                    EventKind::TaskFaulted,
                    Some(fault.to_string()),
                );
            }
        }

        self.done.send_replace(Some(outcome.clone()));
        self.inner.tally.send_modify(|tally| {
            tally.active = tally.active.saturating_sub(1);
            if let Err(fault) = outcome {
                tally.fault_count += 1;
                retain_fault(&mut tally.faults, fault);
            }
        });
    }
}

/// Convert a caught body result into the entry outcome. Failures raised
/// after the scope was cancelled count as cancellation.
fn settle(
    result: Result<anyhow::Result<()>, Box<dyn Any + Send>>,
    origin: &str,
    cancel: &CancellationToken,
) -> TaskOutcome {
    let fault = match result {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(error)) => OperationFault::new(origin, error),
        Err(payload) => OperationFault::from_panic(origin, payload.as_ref()),
    };
    if cancel.is_cancelled() {
        debug!(task = origin, error = %fault.error(), "task failed after cancellation");
        return Ok(());
    }
    Err(fault)
}

/// Wait for the next timer tick, holding while paused.
async fn next_tick(deadline: Option<Instant>, paused: &mut watch::Receiver<bool>) {
    let Some(deadline) = deadline else {
        return std::future::pending().await;
    };
    loop {
        if *paused.borrow_and_update() {
            if paused.changed().await.is_err() {
                return std::future::pending().await;
            }
            continue;
        }
        tokio::select! {
            () = tokio::time::sleep_until(deadline) => return,
            changed = paused.changed() => {
                if changed.is_err() {
                    return std::future::pending().await;
                }
            }
        }
    }
}

/// Owns named background tasks that share one cancellation scope.
///
/// Cloning yields another handle to the same registry.
pub struct TaskManager<S: Spawn = TokioSpawner> {
    inner: Arc<Inner<S>>,
}

impl<S: Spawn> Clone for TaskManager<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl TaskManager<TokioSpawner> {
    /// Create a manager on the current tokio runtime, cancelled together with `cancel`.
    #[must_use]
    pub fn new(cancel: &CancellationToken) -> Self {
        Self::with_spawner(cancel, TokioSpawner::current())
    }
}

impl<S: Spawn> TaskManager<S> {
    /// Create a manager that spawns entries through `spawner`.
    pub fn with_spawner(cancel: &CancellationToken, spawner: S) -> Self {
        let (tally, _) = watch::channel(Tally::default());
        Self {
            inner: Arc::new(Inner {
                cancel: cancel.child_token(),
                spawner,
                registry: Mutex::new(HashMap::new()),
                tally,
                events: OnceLock::new(),
            }),
        }
    }

    /// Record task life-cycle events on a sink. Only the first sink set sticks.
    #[must_use]
    pub fn with_events(self, sink: SharedEventSink) -> Self {
        let _ = self.inner.events.set(sink);
        self
    }

    /// Register and start a one-shot task.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::InvalidArgument` for an empty name.
    /// - `SchedulerError::DuplicateName` if an active entry has the same name.
    /// - `SchedulerError::Cancelled` if the scope was already cancelled.
    pub fn schedule_task<F, Fut>(&self, name: Option<&str>, body: F) -> Result<Uuid, SchedulerError>
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (registration, ctx) = self.register(name, None)?;
        let origin = registration.key.to_string();
        let id = registration.id;
        let cancel = self.inner.cancel.clone();

        emit(self.inner.events.get(), &origin, EventKind::TaskStarted, None);
        debug!(task = %origin, "one-shot task started");
        self.inner.spawner.spawn(async move {
            let result = AssertUnwindSafe(async move { body(ctx).await })
                .catch_unwind()
                .await;
            registration.settle(settle(result, &origin, &cancel));
        });
        Ok(id)
    }

    /// Register and start a periodic task.
    ///
    /// With `run_immediately` the body fires once right away; otherwise the
    /// first firing waits one interval (or a trigger, for
    /// [`TaskInterval::Infinite`]).
    ///
    /// # Errors
    ///
    /// As [`Self::schedule_task`], plus `SchedulerError::InvalidArgument`
    /// for a zero interval.
    pub fn schedule_periodic_task<F, Fut>(
        &self,
        name: Option<&str>,
        interval: TaskInterval,
        mut body: F,
        run_immediately: bool,
    ) -> Result<Uuid, SchedulerError>
    where
        F: FnMut(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if interval == TaskInterval::Every(Duration::ZERO) {
            return Err(SchedulerError::InvalidArgument(
                "periodic interval must be greater than zero".into(),
            ));
        }
        let (paused_tx, mut paused) = watch::channel(false);
        let trigger = Arc::new(Notify::new());
        let control = PeriodicControl {
            paused: paused_tx,
            trigger: Arc::clone(&trigger),
        };
        let (registration, ctx) = self.register(name, Some(control))?;
        let origin = registration.key.to_string();
        let id = registration.id;
        let cancel = self.inner.cancel.clone();
        let exit = ctx.exit.clone();

        emit(self.inner.events.get(), &origin, EventKind::TaskStarted, None);
        debug!(task = %origin, ?interval, run_immediately, "periodic task started");
        self.inner.spawner.spawn(async move {
            let period = match interval {
                TaskInterval::Every(period) => Some(period),
                TaskInterval::Infinite => None,
            };
            let mut next = if run_immediately {
                Some(Instant::now())
            } else {
                period.map(|p| Instant::now() + p)
            };

            let outcome = loop {
                let fire = tokio::select! {
                    biased;
                    () = cancel.cancelled() => false,
                    () = exit.cancelled() => false,
                    () = trigger.notified() => true,
                    () = next_tick(next, &mut paused) => true,
                };
                if !fire {
                    break Ok(());
                }

                debug!(task = %origin, "periodic task firing");
                let firing = ctx.clone();
                let result = AssertUnwindSafe(async { body(firing).await })
                    .catch_unwind()
                    .await;
                if let Err(fault) = settle(result, &origin, &cancel) {
                    break Err(fault);
                }
                next = period.map(|p| Instant::now() + p);
            };
            registration.settle(outcome);
        });
        Ok(id)
    }

    fn register(
        &self,
        name: Option<&str>,
        periodic: Option<PeriodicControl>,
    ) -> Result<(Registration<S>, TaskContext), SchedulerError> {
        if name.is_some_and(str::is_empty) {
            return Err(SchedulerError::InvalidArgument(
                "task name must not be empty".into(),
            ));
        }
        if self.inner.cancel.is_cancelled() {
            return Err(SchedulerError::Cancelled);
        }

        let id = Uuid::new_v4();
        let key = name.map_or(TaskKey::Anonymous(id), |n| TaskKey::Named(n.to_string()));
        let exit = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(None);
        let is_periodic = periodic.is_some();

        {
            let mut registry = self.inner.registry.lock();
            if registry.contains_key(&key) {
                return Err(SchedulerError::DuplicateName(key.to_string()));
            }
            registry.insert(
                key.clone(),
                TaskEntry {
                    id,
                    periodic,
                    exit: exit.clone(),
                    done: done_rx,
                },
            );
            self.inner.tally.send_modify(|tally| tally.active += 1);
        }

        let ctx = TaskContext {
            id,
            name: name.map(Arc::from),
            cancel: self.inner.cancel.clone(),
            exit,
        };
        let registration = Registration {
            inner: Arc::clone(&self.inner),
            key,
            id,
            periodic: is_periodic,
            done: done_tx,
            outcome: None,
        };
        Ok((registration, ctx))
    }

    /// Pause (`true`) or resume (`false`) the timer of a periodic entry.
    ///
    /// A firing already in progress is not interrupted. Returns whether a
    /// periodic entry with that name exists.
    pub fn try_pause_task(&self, name: &str, pause: bool) -> bool {
        let registry = self.inner.registry.lock();
        let Some(control) = registry
            .get(&TaskKey::Named(name.to_string()))
            .and_then(|e| e.periodic.as_ref())
        else {
            return false;
        };
        control.paused.send_replace(pause);
        info!(task = name, pause, "periodic task timer toggled");
        true
    }

    /// Force an out-of-band firing of a periodic entry once the current
    /// firing (if any) completes. Returns whether the entry exists.
    pub fn try_trigger_task(&self, name: &str) -> bool {
        let registry = self.inner.registry.lock();
        let Some(control) = registry
            .get(&TaskKey::Named(name.to_string()))
            .and_then(|e| e.periodic.as_ref())
        else {
            return false;
        };
        control.trigger.notify_one();
        info!(task = name, "periodic task triggered");
        true
    }

    /// Wait until the named entry has terminated and left the registry.
    ///
    /// Returns immediately when no such entry is active.
    ///
    /// # Errors
    ///
    /// `SchedulerError::OperationFault` with the entry's own fault.
    pub async fn wait_for_termination(&self, name: &str) -> Result<(), SchedulerError> {
        let done = self
            .inner
            .registry
            .lock()
            .get(&TaskKey::Named(name.to_string()))
            .map(|e| e.done.clone());
        match done {
            Some(done) => wait_done(done).await,
            None => Ok(()),
        }
    }

    /// Ask an entry to stop rescheduling and wait for its current firing to
    /// finish and the entry to leave the registry.
    ///
    /// # Errors
    ///
    /// As [`Self::wait_for_termination`].
    pub async fn exit_and_wait_for_termination(&self, name: &str) -> Result<(), SchedulerError> {
        let entry = self
            .inner
            .registry
            .lock()
            .get(&TaskKey::Named(name.to_string()))
            .map(|e| (e.exit.clone(), e.done.clone()));
        let Some((exit, done)) = entry else {
            return Ok(());
        };
        info!(task = name, "requesting task exit");
        exit.cancel();
        wait_done(done).await
    }

    /// Wait until no entry is active, including entries registered while
    /// waiting.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::AggregateFault` as soon as any entry has faulted,
    ///   carrying the retained faults, oldest first (see [`Self::faults`]).
    /// - `SchedulerError::Cancelled` once all entries wound down after the
    ///   scope was cancelled.
    pub async fn wait_for_all(&self) -> Result<(), SchedulerError> {
        let mut tally = self.inner.tally.subscribe();
        {
            let tally = tally
                .wait_for(|t| t.active == 0 || !t.faults.is_empty())
                .await
                .map_err(|_| SchedulerError::Cancelled)?;
            if !tally.faults.is_empty() {
                return Err(tally.aggregate());
            }
        }
        if self.inner.cancel.is_cancelled() {
            return Err(SchedulerError::Cancelled);
        }
        Ok(())
    }

    /// Number of active entries, anonymous ones included.
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.registry.lock().len()
    }

    /// Whether a named entry is active.
    #[must_use]
    pub fn contains_task(&self, name: &str) -> bool {
        self.inner
            .registry
            .lock()
            .contains_key(&TaskKey::Named(name.to_string()))
    }

    /// Names of the active named entries.
    #[must_use]
    pub fn task_names(&self) -> Vec<String> {
        self.inner
            .registry
            .lock()
            .keys()
            .filter_map(|key| match key {
                TaskKey::Named(name) => Some(name.clone()),
                TaskKey::Anonymous(_) => None,
            })
            .collect()
    }

    /// Faults recorded so far, oldest first. At most
    /// [`MAX_RETAINED_FAULTS`](crate::core::MAX_RETAINED_FAULTS) are kept.
    #[must_use]
    pub fn faults(&self) -> Vec<OperationFault> {
        self.inner.tally.borrow().faults.iter().cloned().collect()
    }

    /// Number of entries that have faulted, including faults no longer retained.
    #[must_use]
    pub fn fault_count(&self) -> usize {
        self.inner.tally.borrow().fault_count
    }

    /// Cancel the shared scope. Periodic timers stop and bodies observe the
    /// token at their next suspension point.
    pub fn cancel(&self) {
        info!(active = self.count(), "cancelling task manager");
        self.inner.cancel.cancel();
    }

    /// Whether the scope was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// The manager's cancellation token (a child of the one it was built with).
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Cancel the scope and wait for every entry to wind down.
    ///
    /// # Errors
    ///
    /// `SchedulerError::AggregateFault` if any entry faulted.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.cancel();
        let mut tally = self.inner.tally.subscribe();
        let tally = tally
            .wait_for(|t| t.active == 0)
            .await
            .map_err(|_| SchedulerError::Cancelled)?;
        if tally.faults.is_empty() {
            Ok(())
        } else {
            Err(tally.aggregate())
        }
    }
}

async fn wait_done(mut done: watch::Receiver<Option<TaskOutcome>>) -> Result<(), SchedulerError> {
    let outcome = done
        .wait_for(Option::is_some)
        .await
        .map_err(|_| SchedulerError::Cancelled)?
        .clone();
    match outcome {
        Some(Err(fault)) => Err(SchedulerError::OperationFault(fault)),
        Some(Ok(())) | None => Ok(()),
    }
}

impl<S: Spawn> fmt::Debug for TaskManager<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskManager")
            .field("active", &self.count())
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}
