//! Orchestration glue and status models.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ExtractionConfig;
use crate::core::{ChunkHandler, RecursiveScheduler, SchedulerError, Spawn, TaskManager};

/// Register a scheduler run as a one-shot managed task named `name`.
///
/// Cancelling the manager's scope or asking the task to exit cancels the
/// run, which then drains its in-flight chunks. A cancelled run counts as
/// a clean exit; any other run failure becomes the task's fault.
///
/// # Errors
///
/// As [`TaskManager::schedule_task`].
pub fn schedule_scheduler_run<H, SM, SR>(
    manager: &TaskManager<SM>,
    name: &str,
    mut scheduler: RecursiveScheduler<H, SR>,
) -> Result<Uuid, SchedulerError>
where
    H: ChunkHandler,
    SM: Spawn,
    SR: Spawn,
{
    manager.schedule_task(Some(name), move |ctx| async move {
        let stop = scheduler.cancellation_token().clone();
        let linked = async {
            ctx.stopped().await;
            stop.cancel();
            std::future::pending::<()>().await;
        };
        let result = tokio::select! {
            biased;
            result = scheduler.run() => result,
            () = linked => Err(SchedulerError::Cancelled),
        };
        match result {
            Ok(_) | Err(SchedulerError::Cancelled) => Ok(()),
            Err(e) => Err(anyhow::Error::new(e)),
        }
    })
}

/// Configured scheduler data for listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    /// Scheduler name.
    pub name: String,
    /// Maximum items per chunk.
    pub chunk_size: usize,
    /// Resource budget, if any.
    pub resource_capacity: Option<i64>,
    /// Parallelism cap of the scheduler's runner.
    pub max_parallelism: usize,
}

/// Build scheduler listings from a config snapshot, sorted by name.
#[must_use]
pub fn list_schedulers(cfg: &ExtractionConfig) -> Vec<SchedulerSnapshot> {
    let mut snapshots: Vec<_> = cfg
        .schedulers
        .iter()
        .map(|(name, scheduler)| SchedulerSnapshot {
            name: name.clone(),
            chunk_size: scheduler.chunk_size,
            resource_capacity: scheduler.resource_capacity,
            max_parallelism: scheduler.runner.max_parallelism,
        })
        .collect();
    snapshots.sort_by(|a, b| a.name.cmp(&b.name));
    snapshots
}

/// Health response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    /// No fault recorded and the scope is still live.
    pub ok: bool,
    /// Active managed tasks.
    pub active_tasks: usize,
    /// Faults recorded by managed tasks.
    pub faulted_tasks: usize,
    /// Whether the manager's scope was cancelled.
    pub cancelled: bool,
}

/// Return a health payload for a task manager.
#[must_use]
pub fn health<S: Spawn>(manager: &TaskManager<S>) -> Health {
    let faulted_tasks = manager.fault_count();
    let cancelled = manager.is_cancelled();
    Health {
        ok: faulted_tasks == 0 && !cancelled,
        active_tasks: manager.count(),
        faulted_tasks,
        cancelled,
    }
}
