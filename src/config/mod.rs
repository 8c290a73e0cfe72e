//! Configuration models for runners, schedulers and periodic tasks.

pub mod runner;
pub mod scheduler;

pub use runner::RunnerConfig;
pub use scheduler::{ExtractionConfig, PeriodicTaskConfig, SchedulerConfig};
