//! Concurrency-control primitives: resource budget, throttled runner,
//! recursive scheduler and cooperative task manager.

pub mod error;
pub mod events;
pub mod recursive_scheduler;
pub mod resource_guard;
pub mod spawn;
pub mod task_manager;
pub mod throttled_runner;

pub use error::{AppResult, OperationFault, SchedulerError, MAX_RETAINED_FAULTS};
pub use events::{
    build_event, EventKind, EventSink, InMemoryEventSink, SchedulerEvent, SharedEventSink,
    TracingEventSink,
};
pub use recursive_scheduler::{Chunk, ChunkHandler, RecursiveScheduler, SchedulerProgress, WorkItem};
pub use resource_guard::ResourceGuard;
pub use spawn::Spawn;
pub use task_manager::{TaskContext, TaskInterval, TaskManager};
pub use throttled_runner::{
    OperationHandle, OperationOutcome, OperationResult, RunnerStats, ThrottledRunner,
};
