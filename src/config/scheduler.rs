//! Scheduler and periodic task configuration structures.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::RunnerConfig;
use crate::core::TaskInterval;

/// Configuration of one recursive scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum work items per chunk.
    pub chunk_size: usize,
    /// Resource budget shared by the scheduler's chunks; `None` runs without a guard.
    #[serde(default)]
    pub resource_capacity: Option<i64>,
    /// Throttling applied to chunk processing.
    #[serde(default)]
    pub runner: RunnerConfig,
}

impl SchedulerConfig {
    /// Validate scheduler configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_size == 0 {
            return Err("chunk_size must be greater than 0".into());
        }
        if let Some(capacity) = self.resource_capacity {
            if capacity <= 0 {
                return Err("resource_capacity must be greater than 0".into());
            }
        }
        Ok(())
    }
}

fn default_run_immediately() -> bool {
    true
}

/// Configuration of one periodic task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodicTaskConfig {
    /// Interval between firings in milliseconds; absent means trigger-only.
    #[serde(default)]
    pub interval_ms: Option<u64>,
    /// Fire once as soon as the task is scheduled.
    #[serde(default = "default_run_immediately")]
    pub run_immediately: bool,
}

impl PeriodicTaskConfig {
    /// Validate periodic task values.
    pub fn validate(&self) -> Result<(), String> {
        if self.interval_ms == Some(0) {
            return Err("interval_ms must be greater than 0 (omit it for trigger-only tasks)".into());
        }
        Ok(())
    }

    /// The configured interval.
    #[must_use]
    pub const fn interval(&self) -> TaskInterval {
        match self.interval_ms {
            Some(ms) => TaskInterval::Every(Duration::from_millis(ms)),
            None => TaskInterval::Infinite,
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Map of scheduler name to configuration.
    pub schedulers: HashMap<String, SchedulerConfig>,
    /// Map of periodic task name to configuration.
    #[serde(default)]
    pub tasks: HashMap<String, PeriodicTaskConfig>,
}

impl ExtractionConfig {
    /// Validate every entry and ensure at least one scheduler exists.
    pub fn validate(&self) -> Result<(), String> {
        if self.schedulers.is_empty() {
            return Err("at least one scheduler must be defined".into());
        }
        for (name, scheduler) in &self.schedulers {
            scheduler
                .validate()
                .map_err(|e| format!("scheduler `{name}` invalid: {e}"))?;
        }
        for (name, task) in &self.tasks {
            if name.is_empty() {
                return Err("task names must not be empty".into());
            }
            task.validate()
                .map_err(|e| format!("task `{name}` invalid: {e}"))?;
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }
}
