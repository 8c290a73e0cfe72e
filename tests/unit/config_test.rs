//! Tests for configuration validation

use std::collections::HashMap;
use std::time::Duration;

use extraction_scheduler::config::{
    ExtractionConfig, PeriodicTaskConfig, RunnerConfig, SchedulerConfig,
};
use extraction_scheduler::core::TaskInterval;

fn scheduler(chunk_size: usize, resource_capacity: Option<i64>) -> SchedulerConfig {
    SchedulerConfig {
        chunk_size,
        resource_capacity,
        runner: RunnerConfig::new().with_max_parallelism(4),
    }
}

#[test]
fn test_scheduler_config_validation() {
    assert!(scheduler(10, Some(100)).validate().is_ok());
    assert!(scheduler(10, None).validate().is_ok());
}

#[test]
fn test_scheduler_config_invalid_chunk_size() {
    assert!(scheduler(0, Some(100)).validate().is_err());
}

#[test]
fn test_scheduler_config_invalid_capacity() {
    assert!(scheduler(10, Some(0)).validate().is_err());
    assert!(scheduler(10, Some(-5)).validate().is_err());
}

#[test]
fn test_periodic_task_interval() {
    let every = PeriodicTaskConfig {
        interval_ms: Some(250),
        run_immediately: false,
    };
    assert!(every.validate().is_ok());
    assert_eq!(every.interval(), TaskInterval::Every(Duration::from_millis(250)));

    let trigger_only = PeriodicTaskConfig {
        interval_ms: None,
        run_immediately: true,
    };
    assert_eq!(trigger_only.interval(), TaskInterval::Infinite);

    let zero = PeriodicTaskConfig {
        interval_ms: Some(0),
        run_immediately: true,
    };
    assert!(zero.validate().is_err());
}

#[test]
fn test_extraction_config_requires_scheduler() {
    let cfg = ExtractionConfig {
        schedulers: HashMap::new(),
        tasks: HashMap::new(),
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_extraction_config_names_bad_entry() {
    let mut schedulers = HashMap::new();
    schedulers.insert("listings".to_string(), scheduler(0, None));
    let cfg = ExtractionConfig {
        schedulers,
        tasks: HashMap::new(),
    };
    let err = cfg.validate().unwrap_err();
    assert!(err.contains("listings"), "{err}");
}

#[test]
fn test_extraction_config_from_json() {
    let json = r#"{
        "schedulers": {
            "listings": {
                "chunk_size": 25,
                "resource_capacity": 200,
                "runner": { "max_parallelism": 4, "stop_on_error": true }
            },
            "details": { "chunk_size": 5 }
        },
        "tasks": {
            "refresh-tokens": { "interval_ms": 60000 },
            "manual-export": { "run_immediately": false }
        }
    }"#;

    let cfg = ExtractionConfig::from_json_str(json).unwrap();
    let listings = &cfg.schedulers["listings"];
    assert_eq!(listings.chunk_size, 25);
    assert_eq!(listings.resource_capacity, Some(200));
    assert_eq!(listings.runner.max_parallelism, 4);
    assert!(listings.runner.stop_on_error);
    assert!(!listings.runner.is_rate_limited());

    let details = &cfg.schedulers["details"];
    assert_eq!(details.resource_capacity, None);
    assert_eq!(details.runner, RunnerConfig::default());

    assert!(cfg.tasks["refresh-tokens"].run_immediately);
    assert_eq!(cfg.tasks["manual-export"].interval(), TaskInterval::Infinite);
}

#[test]
fn test_extraction_config_from_json_rejects_invalid() {
    assert!(ExtractionConfig::from_json_str("not json").is_err());
    assert!(ExtractionConfig::from_json_str(r#"{ "schedulers": {} }"#).is_err());
    let zero_interval = r#"{
        "schedulers": { "s": { "chunk_size": 1 } },
        "tasks": { "t": { "interval_ms": 0 } }
    }"#;
    assert!(ExtractionConfig::from_json_str(zero_interval).is_err());
}

#[test]
fn test_runner_config_rate_limit_from_lookup() {
    let cfg = RunnerConfig::from_lookup(|key| match key {
        "THROTTLE_MAX_PER_WINDOW" => Some("10".to_string()),
        "THROTTLE_WINDOW_MS" => Some("1000".to_string()),
        _ => None,
    })
    .unwrap();
    assert!(cfg.is_rate_limited());
    assert_eq!(cfg.window(), Duration::from_secs(1));
}
