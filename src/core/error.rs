//! Error types for scheduler operations.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// A failure raised inside user-supplied work (a generator, a chunk consumer
/// or a task body), isolated to the unit of work it came from.
///
/// The underlying error is shared so the same fault can be surfaced to every
/// waiter that observes it.
#[derive(Clone, Error)]
#[error("{origin} faulted: {error:#}")]
pub struct OperationFault {
    origin: String,
    error: Arc<anyhow::Error>,
}

impl OperationFault {
    /// Wrap an error raised by the unit of work named `origin`.
    pub fn new(origin: impl Into<String>, error: anyhow::Error) -> Self {
        Self {
            origin: origin.into(),
            error: Arc::new(error),
        }
    }

    /// Build a fault from a caught panic payload.
    pub(crate) fn from_panic(origin: impl Into<String>, payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        Self::new(origin, anyhow::anyhow!("panicked: {message}"))
    }

    /// Name of the unit of work that faulted.
    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// The error raised by the unit of work.
    #[must_use]
    pub fn error(&self) -> &anyhow::Error {
        &self.error
    }

    /// Downcast the underlying error to its concrete type.
    #[must_use]
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<E>()
    }
}

impl fmt::Debug for OperationFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationFault")
            .field("origin", &self.origin)
            .field("error", &format_args!("{:#}", self.error))
            .finish()
    }
}

/// Errors produced by scheduler components.
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    /// A programming-contract violation caught synchronously.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A task with the same name is already active.
    #[error("a task named `{0}` is already active")]
    DuplicateName(String),
    /// A single operation faulted.
    #[error(transparent)]
    OperationFault(OperationFault),
    /// Several operations faulted and are surfaced together.
    #[error("{} operation(s) faulted: {}", .0.len(), join_faults(.0))]
    AggregateFault(Vec<OperationFault>),
    /// Cooperative shutdown is in progress.
    #[error("operation cancelled")]
    Cancelled,
    /// A collaborator broke the scheduler's contract.
    #[error("contract violation: {0}")]
    ContractViolation(String),
    /// Configuration could not be loaded or validated.
    #[error("config error: {0}")]
    Config(String),
}

impl SchedulerError {
    /// Whether this error belongs to the invalid-argument class
    /// (bad arguments and duplicate task names).
    #[must_use]
    pub const fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument(_) | Self::DuplicateName(_))
    }

    /// Whether this error signals cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The faults carried by this error, if any.
    #[must_use]
    pub fn faults(&self) -> &[OperationFault] {
        match self {
            Self::OperationFault(fault) => std::slice::from_ref(fault),
            Self::AggregateFault(faults) => faults,
            _ => &[],
        }
    }
}

impl From<OperationFault> for SchedulerError {
    fn from(fault: OperationFault) -> Self {
        Self::OperationFault(fault)
    }
}

fn join_faults(faults: &[OperationFault]) -> String {
    faults
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Most faults a runner or task manager keeps; older ones are dropped first.
/// Fault counters keep counting past this bound.
pub const MAX_RETAINED_FAULTS: usize = 256;

/// Append `fault`, dropping the oldest retained fault once the bound is reached.
pub(crate) fn retain_fault(faults: &mut VecDeque<OperationFault>, fault: OperationFault) {
    if faults.len() >= MAX_RETAINED_FAULTS {
        faults.pop_front();
    }
    faults.push_back(fault);
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
