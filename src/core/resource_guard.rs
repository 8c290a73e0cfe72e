//! Resizable counting resource guard.
//!
//! A [`ResourceGuard`] represents a shared capacity pool such as "number of
//! concurrent remote requests allowed". Callers take units (possibly fewer
//! than requested), free them when done, and the owner may resize the pool
//! at any time.
//!
//! # Accounting
//!
//! `available = capacity - allocated`. Shrinking the capacity below what is
//! currently granted never revokes grants; `available` goes negative and
//! later frees repay the deficit before anything is granted again.
//!
//! # Fairness
//!
//! Waiting callers are queued in arrival order and serviced strictly FIFO,
//! across capacity changes. A waiter is granted `min(requested, available)`
//! as soon as anything is available; it does not hold out for the full
//! amount. Because queued waiters imply `available <= 0`, a non-waiting
//! take can never overtake the queue.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::SchedulerError;

struct Waiter {
    id: u64,
    requested: i64,
    grant: oneshot::Sender<i64>,
}

struct GuardState {
    capacity: i64,
    allocated: i64,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
}

impl GuardState {
    const fn available(&self) -> i64 {
        self.capacity - self.allocated
    }

    /// Grant from the pool without queueing, unless waiters are ahead of us.
    fn grant_immediately(&mut self, requested: i64) -> Option<i64> {
        let available = self.available();
        if available <= 0 || !self.waiters.is_empty() {
            return None;
        }
        let granted = requested.min(available);
        self.allocated += granted;
        debug!(requested, granted, available = self.available(), "granted units");
        Some(granted)
    }

    /// Hand out whatever is available to queued waiters, front first.
    fn service_waiters(&mut self) {
        while self.available() > 0 {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            let granted = waiter.requested.min(self.available());
            self.allocated += granted;
            if waiter.grant.send(granted).is_err() {
                // Receiver vanished without deregistering; keep the units.
                self.allocated -= granted;
                continue;
            }
            debug!(
                waiter = waiter.id,
                requested = waiter.requested,
                granted,
                available = self.available(),
                "granted units to queued waiter"
            );
        }
    }
}

/// Dynamically resizable counting resource pool with FIFO waiters.
///
/// Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct ResourceGuard {
    inner: Arc<Mutex<GuardState>>,
}

impl ResourceGuard {
    /// Create a guard with the given initial capacity.
    #[must_use]
    pub fn new(capacity: i64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(GuardState {
                capacity,
                allocated: 0,
                waiters: VecDeque::new(),
                next_waiter_id: 0,
            })),
        }
    }

    /// Take up to `requested` units.
    ///
    /// With `wait = false` this grants `min(requested, max(0, available))`
    /// immediately, possibly zero. With `wait = true` the caller is suspended
    /// until at least one unit is available and then receives
    /// `min(requested, available)`.
    ///
    /// # Errors
    ///
    /// Never fails; the `Result` is shared with [`Self::take_with_cancel`].
    pub async fn take(&self, requested: i64, wait: bool) -> Result<i64, SchedulerError> {
        self.take_with_cancel(requested, wait, &CancellationToken::new())
            .await
    }

    /// Cancellable form of [`Self::take`].
    ///
    /// A waiting take that is cancelled (or whose future is dropped) leaves
    /// the queue; if it had already been granted units they are returned to
    /// the pool.
    ///
    /// # Errors
    ///
    /// `SchedulerError::Cancelled` if `cancel` fires while waiting.
    pub async fn take_with_cancel(
        &self,
        requested: i64,
        wait: bool,
        cancel: &CancellationToken,
    ) -> Result<i64, SchedulerError> {
        if requested <= 0 {
            return Ok(0);
        }

        let pending = {
            let mut state = self.inner.lock();
            let available = state.available();
            if let Some(granted) = state.grant_immediately(requested) {
                return Ok(granted);
            }
            if !wait {
                return Ok(0);
            }
            if cancel.is_cancelled() {
                return Err(SchedulerError::Cancelled);
            }

            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter {
                id,
                requested,
                grant: tx,
            });
            debug!(
                waiter = id,
                requested,
                available,
                queued = state.waiters.len(),
                "waiting for capacity"
            );
            PendingTake {
                guard: self,
                id,
                rx: Some(rx),
            }
        };

        pending.wait(cancel).await
    }

    /// Synchronous form of `take(requested, false)`.
    #[must_use]
    pub fn try_take(&self, requested: i64) -> i64 {
        if requested <= 0 {
            return 0;
        }
        self.inner.lock().grant_immediately(requested).unwrap_or(0)
    }

    /// Release `amount` previously granted units.
    ///
    /// While the pool is over-allocated the released units first repay the
    /// deficit; waiters are only serviced once `available` turns positive.
    ///
    /// # Errors
    ///
    /// `SchedulerError::InvalidArgument` if `amount` is negative or exceeds
    /// the number of units currently granted.
    pub fn free(&self, amount: i64) -> Result<(), SchedulerError> {
        if amount < 0 {
            return Err(SchedulerError::InvalidArgument(format!(
                "cannot free a negative amount ({amount})"
            )));
        }
        let mut state = self.inner.lock();
        if amount > state.allocated {
            return Err(SchedulerError::InvalidArgument(format!(
                "cannot free {amount} units, only {} allocated",
                state.allocated
            )));
        }
        state.allocated -= amount;
        debug!(freed = amount, available = state.available(), "released units");
        state.service_waiters();
        Ok(())
    }

    /// Change the total capacity.
    ///
    /// Shrinking never revokes grants and may leave `available` negative.
    /// Growing immediately services waiters in arrival order.
    pub fn set_capacity(&self, capacity: i64) {
        let mut state = self.inner.lock();
        let previous = state.capacity;
        state.capacity = capacity;
        debug!(
            previous,
            capacity,
            available = state.available(),
            "resource capacity changed"
        );
        state.service_waiters();
    }

    /// Current `capacity - allocated`; negative while over-allocated.
    #[must_use]
    pub fn available(&self) -> i64 {
        self.inner.lock().available()
    }

    /// Current total capacity.
    #[must_use]
    pub fn capacity(&self) -> i64 {
        self.inner.lock().capacity
    }

    /// Units currently granted.
    #[must_use]
    pub fn allocated(&self) -> i64 {
        self.inner.lock().allocated
    }

    /// Number of queued waiters.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.inner.lock().waiters.len()
    }
}

impl fmt::Debug for ResourceGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("ResourceGuard")
            .field("capacity", &state.capacity)
            .field("allocated", &state.allocated)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

/// A queued waiter. Dropping it before the grant is observed deregisters the
/// waiter or hands an already-sent grant back to the pool.
struct PendingTake<'a> {
    guard: &'a ResourceGuard,
    id: u64,
    rx: Option<oneshot::Receiver<i64>>,
}

impl PendingTake<'_> {
    async fn wait(mut self, cancel: &CancellationToken) -> Result<i64, SchedulerError> {
        let outcome = {
            let Some(rx) = self.rx.as_mut() else {
                return Err(SchedulerError::Cancelled);
            };
            tokio::select! {
                biased;
                granted = rx => Some(granted),
                () = cancel.cancelled() => None,
            }
        };

        match outcome {
            Some(Ok(granted)) => {
                self.rx = None;
                Ok(granted)
            }
            Some(Err(_)) => {
                self.rx = None;
                Err(SchedulerError::Cancelled)
            }
            None => {
                debug!(waiter = self.id, "waiting take cancelled");
                Err(SchedulerError::Cancelled)
            }
        }
    }
}

impl Drop for PendingTake<'_> {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        let mut state = self.guard.inner.lock();
        if let Some(pos) = state.waiters.iter().position(|w| w.id == self.id) {
            state.waiters.remove(pos);
            return;
        }
        // Granted under the lock before we could observe it.
        if let Ok(granted) = rx.try_recv() {
            state.allocated -= granted;
            debug!(waiter = self.id, granted, "returned grant of abandoned take");
            state.service_waiters();
        }
    }
}
