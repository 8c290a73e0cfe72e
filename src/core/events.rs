//! Event sinks for scheduler observability.
//!
//! Observability hooks (scheduler iterations, chunk aborts, task life-cycle
//! and operation faults) are forwarded to an [`EventSink`]. Two sinks ship
//! with the crate: an in-memory ring buffer for tests and development, and a
//! sink that forwards every event to `tracing`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::util::clock::now_ms;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A throttled operation faulted.
    OperationFaulted,
    /// A scheduler finished one scheduling step.
    Iteration,
    /// A chunk carried a fault and was aborted.
    ChunkAborted,
    /// A managed task started running.
    TaskStarted,
    /// A managed task completed.
    TaskCompleted,
    /// A managed task faulted.
    TaskFaulted,
    /// A periodic task left its loop.
    TaskExited,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::OperationFaulted => "operation_faulted",
            Self::Iteration => "iteration",
            Self::ChunkAborted => "chunk_aborted",
            Self::TaskStarted => "task_started",
            Self::TaskCompleted => "task_completed",
            Self::TaskFaulted => "task_faulted",
            Self::TaskExited => "task_exited",
        };
        f.write_str(name)
    }
}

/// A structured observability event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerEvent {
    /// Event identifier.
    pub event_id: String,
    /// Component or task that produced the event.
    pub source: String,
    /// What happened.
    pub kind: EventKind,
    /// Timestamp milliseconds.
    pub created_at_ms: u128,
    /// Additional context.
    pub detail: Option<String>,
}

/// Destination for [`SchedulerEvent`]s.
pub trait EventSink: Send + Sync {
    /// Record an event.
    fn record(&self, event: SchedulerEvent);
}

/// Shared handle to an event sink.
pub type SharedEventSink = Arc<dyn EventSink>;

/// In-memory event sink with a bounded buffer.
pub struct InMemoryEventSink {
    events: Mutex<VecDeque<SchedulerEvent>>,
    max_events: usize,
}

impl InMemoryEventSink {
    /// Create a new in-memory sink keeping at most `max_events` events.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(max_events)),
            max_events,
        }
    }

    /// Retrieve a snapshot of stored events.
    #[must_use]
    pub fn events(&self) -> Vec<SchedulerEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Events of one kind, oldest first.
    #[must_use]
    pub fn events_of(&self, kind: EventKind) -> Vec<SchedulerEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }
}

impl EventSink for InMemoryEventSink {
    fn record(&self, event: SchedulerEvent) {
        if self.max_events == 0 {
            return;
        }
        let mut events = self.events.lock();
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event);
    }
}

/// Sink that forwards events to the `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn record(&self, event: SchedulerEvent) {
        match event.kind {
            EventKind::OperationFaulted | EventKind::ChunkAborted | EventKind::TaskFaulted => {
                tracing::warn!(
                    event_id = %event.event_id,
                    source = %event.source,
                    kind = %event.kind,
                    detail = event.detail.as_deref().unwrap_or(""),
                    "scheduler event"
                );
            }
            _ => {
                tracing::info!(
                    event_id = %event.event_id,
                    source = %event.source,
                    kind = %event.kind,
                    detail = event.detail.as_deref().unwrap_or(""),
                    "scheduler event"
                );
            }
        }
    }
}

/// Helper to build an event with a fresh identifier and timestamp.
pub fn build_event(
    source: impl Into<String>,
    kind: EventKind,
    detail: Option<String>,
) -> SchedulerEvent {
    SchedulerEvent {
        event_id: uuid::Uuid::new_v4().to_string(),
        source: source.into(),
        kind,
        created_at_ms: now_ms(),
        detail,
    }
}

/// Record an event on an optional sink.
pub(crate) fn emit(
    sink: Option<&SharedEventSink>,
    source: &str,
    kind: EventKind,
    detail: Option<String>,
) {
    if let Some(sink) = sink {
        sink.record(build_event(source, kind, detail));
    }
}
