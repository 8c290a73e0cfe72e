//! Builders to construct scheduler components from configuration.

pub mod scheduler_builder;

pub use scheduler_builder::{build_guard, build_runner, build_scheduler, schedule_configured_tasks};
