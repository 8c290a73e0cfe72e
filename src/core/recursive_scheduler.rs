//! Work-queue driver with recursive expansion under a resource budget.
//!
//! A [`RecursiveScheduler`] repeatedly groups pending work items into
//! chunks, runs each chunk through a [`ThrottledRunner`] and feeds whatever
//! the chunk's result yields back into the pending queue. This models
//! paginated listings (an item cycles through several chunks until its last
//! page is fetched) and hierarchy walks (a processed node yields its
//! children).
//!
//! Every chunk costs one budget unit per item. Units are taken from the
//! optional [`ResourceGuard`] before dispatch and freed exactly once when the
//! chunk comes back, whether it was handled, aborted, dropped by the runner
//! or panicked.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::events::{emit, EventKind, SharedEventSink};
use crate::core::{OperationFault, ResourceGuard, SchedulerError, Spawn, ThrottledRunner};
use crate::runtime::TokioSpawner;

/// A unit of work driven by a [`RecursiveScheduler`].
pub trait WorkItem: Send + 'static {
    /// Whether the item needs no further dispatch.
    fn is_complete(&self) -> bool;
}

/// One dispatch unit: a batch of items plus what processing it produced.
pub struct Chunk<I, O> {
    id: u64,
    items: Vec<I>,
    output: Option<O>,
    fault: Option<OperationFault>,
    cost: i64,
    started: bool,
}

impl<I, O> Chunk<I, O> {
    /// Group `items` into a chunk.
    #[must_use]
    pub const fn new(items: Vec<I>) -> Self {
        Self {
            id: 0,
            items,
            output: None,
            fault: None,
            cost: 0,
            started: false,
        }
    }

    /// Dispatch sequence number within its scheduler run.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// The chunk's items.
    #[must_use]
    pub fn items(&self) -> &[I] {
        &self.items
    }

    /// Mutable access to the items, e.g. to advance a page cursor.
    ///
    /// The set of items is fixed once the chunk is built.
    pub fn items_mut(&mut self) -> &mut [I] {
        &mut self.items
    }

    /// Number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the chunk holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Value produced by [`ChunkHandler::consume_chunk`].
    #[must_use]
    pub const fn output(&self) -> Option<&O> {
        self.output.as_ref()
    }

    /// Move the produced value out of the chunk.
    pub fn take_output(&mut self) -> Option<O> {
        self.output.take()
    }

    /// The fault captured while processing the chunk.
    #[must_use]
    pub const fn fault(&self) -> Option<&OperationFault> {
        self.fault.as_ref()
    }

    /// Budget units held by the chunk while in flight.
    #[must_use]
    pub const fn cost(&self) -> i64 {
        self.cost
    }
}

impl<I, O> fmt::Debug for Chunk<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("id", &self.id)
            .field("items", &self.items.len())
            .field("has_output", &self.output.is_some())
            .field("fault", &self.fault)
            .field("cost", &self.cost)
            .field("started", &self.started)
            .finish()
    }
}

/// Caller-supplied chunk processing.
#[async_trait]
pub trait ChunkHandler: Send + Sync + 'static {
    /// Work item type.
    type Item: WorkItem;
    /// Value produced by consuming one chunk.
    type Output: Send + 'static;

    /// Build a chunk from a batch of pending items.
    ///
    /// Every item must end up in the chunk; the order may change.
    fn get_chunk(&self, items: Vec<Self::Item>) -> Chunk<Self::Item, Self::Output> {
        Chunk::new(items)
    }

    /// Perform the external work for a chunk. An error is captured on the
    /// chunk and routes it to [`Self::abort_chunk`].
    async fn consume_chunk(
        &self,
        chunk: &mut Chunk<Self::Item, Self::Output>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Self::Output>;

    /// Inspect a successfully consumed chunk and return follow-up items.
    ///
    /// The chunk's own items are re-examined afterwards: incomplete ones go
    /// back to the pending queue.
    fn handle_task_result(
        &self,
        chunk: &mut Chunk<Self::Item, Self::Output>,
        cancel: &CancellationToken,
    ) -> Vec<Self::Item>;

    /// Compensate for a faulted chunk. Its items are not requeued.
    fn abort_chunk(&self, chunk: &mut Chunk<Self::Item, Self::Output>, cancel: &CancellationToken);

    /// Called after every scheduling step.
    fn on_iteration(&self, _progress: &SchedulerProgress) {}
}

/// Scheduler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerProgress {
    /// Items waiting for dispatch.
    pub pending: usize,
    /// Chunks in flight.
    pub in_flight: usize,
    /// Items inside in-flight chunks.
    pub in_flight_items: usize,
    /// Items reported complete.
    pub finished: usize,
    /// Items dropped with an aborted chunk.
    pub aborted: usize,
    /// Items seen so far: seeds plus follow-ups.
    pub total: usize,
}

impl SchedulerProgress {
    /// No pending items and nothing in flight.
    #[must_use]
    pub const fn is_drained(&self) -> bool {
        self.pending == 0 && self.in_flight == 0
    }
}

/// Sends a chunk back to the scheduler exactly once, even when the
/// operation carrying it is dropped or unwinds.
struct ChunkReturn<I, O> {
    chunk: Option<Chunk<I, O>>,
    tx: mpsc::UnboundedSender<Chunk<I, O>>,
}

impl<I, O> ChunkReturn<I, O> {
    fn finish(&mut self) {
        if let Some(chunk) = self.chunk.take() {
            let _ = self.tx.send(chunk);
        }
    }
}

impl<I, O> Drop for ChunkReturn<I, O> {
    fn drop(&mut self) {
        if let Some(chunk) = self.chunk.as_mut() {
            chunk.fault = Some(OperationFault::new(
                format!("chunk #{}", chunk.id),
                anyhow::anyhow!("chunk operation ended before completing"),
            ));
        }
        self.finish();
    }
}

enum Step<I, O> {
    Cancelled,
    Returned(Chunk<I, O>),
    Granted(i64),
}

/// Drives a work queue to exhaustion.
pub struct RecursiveScheduler<H: ChunkHandler, S: Spawn = TokioSpawner> {
    handler: Arc<H>,
    runner: ThrottledRunner<S>,
    guard: Option<ResourceGuard>,
    chunk_size: usize,
    cancel: CancellationToken,
    pending: VecDeque<H::Item>,
    progress: SchedulerProgress,
    next_chunk_id: u64,
    events: OnceLock<SharedEventSink>,
}

impl<H: ChunkHandler, S: Spawn> RecursiveScheduler<H, S> {
    /// Create a scheduler over `initial_items`.
    ///
    /// Chunks hold at most `chunk_size` items and run on `runner`. When a
    /// `guard` is supplied every chunk takes one unit per item from it.
    /// Items that are already complete are counted finished right away.
    ///
    /// # Errors
    ///
    /// `SchedulerError::InvalidArgument` if `chunk_size` is zero.
    pub fn new(
        handler: H,
        initial_items: Vec<H::Item>,
        runner: ThrottledRunner<S>,
        chunk_size: usize,
        guard: Option<ResourceGuard>,
        cancel: &CancellationToken,
    ) -> Result<Self, SchedulerError> {
        if chunk_size == 0 {
            return Err(SchedulerError::InvalidArgument(
                "chunk_size must be greater than 0".into(),
            ));
        }
        let mut progress = SchedulerProgress {
            total: initial_items.len(),
            ..SchedulerProgress::default()
        };
        let mut pending = VecDeque::with_capacity(initial_items.len());
        for item in initial_items {
            if item.is_complete() {
                progress.finished += 1;
            } else {
                pending.push_back(item);
            }
        }
        progress.pending = pending.len();
        Ok(Self {
            handler: Arc::new(handler),
            runner,
            guard,
            chunk_size,
            cancel: cancel.child_token(),
            pending,
            progress,
            next_chunk_id: 0,
            events: OnceLock::new(),
        })
    }

    /// Forward iteration and abort events to a sink.
    #[must_use]
    pub fn with_events(self, sink: SharedEventSink) -> Self {
        let _ = self.events.set(sink);
        self
    }

    /// The chunk handler.
    #[must_use]
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Current counters.
    #[must_use]
    pub const fn progress(&self) -> SchedulerProgress {
        self.progress
    }

    /// Items that have not been dispatched, e.g. after a cancelled run.
    #[must_use]
    pub fn pending_items(&self) -> &VecDeque<H::Item> {
        &self.pending
    }

    /// The scheduler's cancellation token (a child of the one it was built with).
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run until no items are pending and no chunk is in flight.
    ///
    /// Faulted chunks are aborted and never fail the run. On cancellation,
    /// dispatch stops and in-flight chunks are drained (handled or aborted,
    /// their budget freed) before returning. Chunks the runner had not
    /// started yet are not consumed; their items return to
    /// [`Self::pending_items`].
    ///
    /// # Errors
    ///
    /// - `SchedulerError::Cancelled` when the cancellation left items
    ///   pending or aborted a chunk.
    /// - `SchedulerError::ContractViolation` when the handler broke its
    ///   contract, or the guard's accounting was disturbed from outside.
    pub async fn run(&mut self) -> Result<SchedulerProgress, SchedulerError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut failure: Option<SchedulerError> = None;
        // Aborted count when cancellation was first observed.
        let mut aborted_at_cancel: Option<usize> = None;
        let mut reported = false;
        info!(
            pending = self.progress.pending,
            chunk_size = self.chunk_size,
            budget = self.guard.as_ref().map(ResourceGuard::capacity),
            "scheduler run started"
        );

        loop {
            if self.cancel.is_cancelled() && aborted_at_cancel.is_none() {
                aborted_at_cancel = Some(self.progress.aborted);
                info!(
                    pending = self.pending.len(),
                    in_flight = self.progress.in_flight,
                    "scheduler cancelled, draining in-flight chunks"
                );
            }
            if failure.is_none() && aborted_at_cancel.is_none() {
                match self.dispatch_ready(&tx) {
                    Ok(0) => {}
                    Ok(_) => {
                        self.report();
                        reported = true;
                    }
                    Err(e) => failure = Some(e),
                }
            }
            let halted = failure.is_some() || aborted_at_cancel.is_some();
            if self.progress.in_flight == 0 && (halted || self.pending.is_empty()) {
                break;
            }

            let wants_budget = !halted && !self.pending.is_empty() && self.guard.is_some();
            let want = self.next_request();
            let guard = self.guard.clone();
            let cancel = self.cancel.clone();
            let in_flight = self.progress.in_flight;

            let step = tokio::select! {
                biased;
                () = cancel.cancelled(), if !halted => Step::Cancelled,
                Some(chunk) = rx.recv(), if in_flight > 0 => Step::Returned(chunk),
                granted = take_budget(guard.as_ref(), want, &cancel), if wants_budget => match granted {
                    Ok(granted) => Step::Granted(granted),
                    Err(_) => Step::Cancelled,
                },
            };

            match step {
                // Picked up at the top of the loop.
                Step::Cancelled => {}
                Step::Returned(chunk) => {
                    if let Err(e) = self.complete(chunk) {
                        failure.get_or_insert(e);
                    }
                    self.report();
                    reported = true;
                }
                Step::Granted(granted) => {
                    match self.dispatch(granted, &tx) {
                        Ok(0) => {}
                        Ok(_) => {
                            self.report();
                            reported = true;
                        }
                        Err(e) => failure = Some(e),
                    }
                }
            }
        }
        if !reported {
            self.report();
        }

        if let Some(e) = failure {
            warn!(error = %e, "scheduler run failed");
            return Err(e);
        }
        let left_undone = aborted_at_cancel
            .is_some_and(|before| !self.pending.is_empty() || self.progress.aborted > before);
        if left_undone {
            info!(
                pending = self.progress.pending,
                finished = self.progress.finished,
                aborted = self.progress.aborted,
                "scheduler run cancelled"
            );
            return Err(SchedulerError::Cancelled);
        }
        info!(
            finished = self.progress.finished,
            aborted = self.progress.aborted,
            total = self.progress.total,
            "scheduler run finished"
        );
        Ok(self.progress)
    }

    fn next_request(&self) -> i64 {
        i64::try_from(self.chunk_size.min(self.pending.len())).unwrap_or(i64::MAX)
    }

    /// Dispatch chunks while the budget grants units without waiting.
    /// Returns the number of chunks dispatched.
    fn dispatch_ready(
        &mut self,
        tx: &mpsc::UnboundedSender<Chunk<H::Item, H::Output>>,
    ) -> Result<usize, SchedulerError> {
        let mut dispatched = 0;
        while !self.pending.is_empty() {
            let want = self.next_request();
            let granted = self
                .guard
                .as_ref()
                .map_or(want, |guard| guard.try_take(want));
            if granted <= 0 {
                break;
            }
            dispatched += self.dispatch(granted, tx)?;
        }
        Ok(dispatched)
    }

    /// Build a chunk of `granted` pending items and hand it to the runner.
    /// Returns the number of chunks dispatched (0 or 1).
    fn dispatch(
        &mut self,
        granted: i64,
        tx: &mpsc::UnboundedSender<Chunk<H::Item, H::Output>>,
    ) -> Result<usize, SchedulerError> {
        let count = usize::try_from(granted)
            .unwrap_or(0)
            .min(self.pending.len());
        let surplus = granted - i64::try_from(count).unwrap_or(granted);
        if surplus > 0 {
            self.release(surplus)?;
        }
        if count == 0 {
            return Ok(0);
        }

        let items: Vec<_> = self.pending.drain(..count).collect();
        let mut chunk = self.handler.get_chunk(items);
        let cost = granted - surplus;
        if chunk.len() != count {
            self.release(cost)?;
            self.progress.pending = self.pending.len();
            return Err(SchedulerError::ContractViolation(format!(
                "get_chunk returned {} items for a batch of {count}",
                chunk.len()
            )));
        }

        chunk.id = self.next_chunk_id;
        self.next_chunk_id += 1;
        chunk.cost = cost;
        chunk.output = None;
        chunk.fault = None;
        chunk.started = false;
        self.progress.pending = self.pending.len();
        self.progress.in_flight += 1;
        self.progress.in_flight_items += count;
        debug!(
            chunk = chunk.id,
            items = count,
            cost,
            pending = self.progress.pending,
            in_flight = self.progress.in_flight,
            "dispatching chunk"
        );

        let handler = Arc::clone(&self.handler);
        let cancel = self.cancel.clone();
        let mut ret = ChunkReturn {
            chunk: Some(chunk),
            tx: tx.clone(),
        };
        self.runner.enqueue(move || async move {
            // Chunks still queued in the runner when the run is cancelled
            // go back unconsumed.
            if let Some(chunk) = ret.chunk.as_mut().filter(|_| !cancel.is_cancelled()) {
                chunk.started = true;
                match handler.consume_chunk(chunk, &cancel).await {
                    Ok(output) => chunk.output = Some(output),
                    Err(error) => {
                        chunk.fault = Some(OperationFault::new(format!("chunk #{}", chunk.id), error));
                    }
                }
            }
            ret.finish();
            Ok::<(), anyhow::Error>(())
        });
        Ok(1)
    }

    /// Route a returned chunk to the handler and settle its accounting.
    fn complete(&mut self, mut chunk: Chunk<H::Item, H::Output>) -> Result<(), SchedulerError> {
        let size = chunk.len();
        self.progress.in_flight = self.progress.in_flight.saturating_sub(1);
        self.progress.in_flight_items = self.progress.in_flight_items.saturating_sub(size);

        let released = if !chunk.started && self.cancel.is_cancelled() {
            debug!(chunk = chunk.id, items = size, "requeueing unstarted chunk");
            for item in chunk.items.drain(..).rev() {
                self.pending.push_front(item);
            }
            self.release(chunk.cost)
        } else if let Some(fault) = chunk.fault.clone() {
            warn!(chunk = chunk.id, items = size, error = %fault, "aborting faulted chunk");
            self.handler.abort_chunk(&mut chunk, &self.cancel);
            self.progress.aborted += size;
            emit(
                self.events.get(),
                "recursive_scheduler",
                EventKind::ChunkAborted,
                Some(fault.to_string()),
            );
            self.release(chunk.cost)
        } else {
            let follow_ups = self.handler.handle_task_result(&mut chunk, &self.cancel);
            let released = self.release(chunk.cost);
            self.progress.total += follow_ups.len();
            for item in chunk.items.drain(..).chain(follow_ups) {
                if item.is_complete() {
                    self.progress.finished += 1;
                } else {
                    self.pending.push_back(item);
                }
            }
            released
        };
        self.progress.pending = self.pending.len();
        released
    }

    /// Hand the current counters to the handler and the event sink.
    fn report(&self) {
        self.handler.on_iteration(&self.progress);
        debug!(
            pending = self.progress.pending,
            in_flight = self.progress.in_flight,
            finished = self.progress.finished,
            aborted = self.progress.aborted,
            total = self.progress.total,
            "scheduler iteration"
        );
        if let Some(sink) = self.events.get() {
            let detail = serde_json::to_string(&self.progress).ok();
            emit(Some(sink), "recursive_scheduler", EventKind::Iteration, detail);
        }
    }

    fn release(&self, cost: i64) -> Result<(), SchedulerError> {
        let Some(guard) = &self.guard else {
            return Ok(());
        };
        guard.free(cost).map_err(|e| {
            SchedulerError::ContractViolation(format!("releasing {cost} budget units failed: {e}"))
        })
    }
}

async fn take_budget(
    guard: Option<&ResourceGuard>,
    want: i64,
    cancel: &CancellationToken,
) -> Result<i64, SchedulerError> {
    match guard {
        Some(guard) => guard.take_with_cancel(want, true, cancel).await,
        None => Ok(want),
    }
}

impl<H: ChunkHandler, S: Spawn> fmt::Debug for RecursiveScheduler<H, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecursiveScheduler")
            .field("chunk_size", &self.chunk_size)
            .field("guard", &self.guard)
            .field("progress", &self.progress)
            .finish_non_exhaustive()
    }
}
