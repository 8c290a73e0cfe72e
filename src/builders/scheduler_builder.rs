//! Builders to construct runners, guards, schedulers and periodic tasks
//! from configuration.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{ExtractionConfig, PeriodicTaskConfig, RunnerConfig, SchedulerConfig};
use crate::core::{
    ChunkHandler, RecursiveScheduler, ResourceGuard, SchedulerError, Spawn, TaskContext,
    TaskManager, ThrottledRunner,
};

/// Build a throttled runner from its configuration.
pub fn build_runner<S: Spawn>(
    cfg: &RunnerConfig,
    cancel: &CancellationToken,
    spawner: S,
) -> ThrottledRunner<S> {
    ThrottledRunner::with_spawner(cfg.clone(), cancel, spawner)
}

/// Build the resource guard of a scheduler, if it has a budget.
#[must_use]
pub fn build_guard(cfg: &SchedulerConfig) -> Option<ResourceGuard> {
    cfg.resource_capacity.map(ResourceGuard::new)
}

/// Build the scheduler named `name` over `initial_items`.
///
/// # Errors
///
/// `SchedulerError::Config` if the configuration is invalid or has no
/// scheduler with that name.
pub fn build_scheduler<H, S>(
    cfg: &ExtractionConfig,
    name: &str,
    handler: H,
    initial_items: Vec<H::Item>,
    cancel: &CancellationToken,
    spawner: S,
) -> Result<RecursiveScheduler<H, S>, SchedulerError>
where
    H: ChunkHandler,
    S: Spawn,
{
    cfg.validate()
        .map_err(|e| SchedulerError::Config(format!("config invalid: {e}")))?;
    let scheduler_cfg = cfg
        .schedulers
        .get(name)
        .ok_or_else(|| SchedulerError::Config(format!("unknown scheduler `{name}`")))?;

    let runner = build_runner(&scheduler_cfg.runner, cancel, spawner);
    RecursiveScheduler::new(
        handler,
        initial_items,
        runner,
        scheduler_cfg.chunk_size,
        build_guard(scheduler_cfg),
        cancel,
    )
}

/// Register every configured periodic task on `manager`, using
/// `body_factory` to build each task body.
///
/// # Errors
///
/// `SchedulerError::Config` for invalid configuration, or whatever the
/// factory or the registration returns.
pub fn schedule_configured_tasks<S, FB, F, Fut>(
    manager: &TaskManager<S>,
    cfg: &ExtractionConfig,
    mut body_factory: FB,
) -> Result<Vec<Uuid>, SchedulerError>
where
    S: Spawn,
    FB: FnMut(&str, &PeriodicTaskConfig) -> Result<F, SchedulerError>,
    F: FnMut(TaskContext) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    cfg.validate()
        .map_err(|e| SchedulerError::Config(format!("config invalid: {e}")))?;

    let mut names: Vec<_> = cfg.tasks.keys().collect();
    names.sort();

    let mut ids = Vec::with_capacity(names.len());
    for name in names {
        let task_cfg = &cfg.tasks[name];
        let body = body_factory(name, task_cfg)?;
        let id = manager.schedule_periodic_task(
            Some(name.as_str()),
            task_cfg.interval(),
            body,
            task_cfg.run_immediately,
        )?;
        ids.push(id);
    }
    Ok(ids)
}
