//! Runtime adapters and orchestration surface.

pub mod api;
pub mod tokio_spawner;

pub use api::{health, list_schedulers, schedule_scheduler_run, Health, SchedulerSnapshot};
pub use tokio_spawner::TokioSpawner;
