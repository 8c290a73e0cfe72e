//! Tests for runtime glue and status models

use std::collections::HashMap;

use extraction_scheduler::config::{ExtractionConfig, RunnerConfig, SchedulerConfig};
use extraction_scheduler::core::{Spawn, TaskManager};
use extraction_scheduler::runtime::{health, list_schedulers, TokioSpawner};
use tokio_util::sync::CancellationToken;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tokio_spawner_spawn() {
    let spawner = TokioSpawner::new(tokio::runtime::Handle::current());

    let (tx, rx) = tokio::sync::oneshot::channel();
    spawner.spawn(async move {
        tx.send(123).unwrap();
    });

    let result = rx.await.expect("oneshot result");
    assert_eq!(result, 123);
}

#[tokio::test]
async fn test_current_spawner_uses_caller_runtime() {
    let spawner = TokioSpawner::current();
    let (tx, rx) = tokio::sync::oneshot::channel();
    spawner.spawn(async move {
        tx.send("spawned").unwrap();
    });
    assert_eq!(rx.await.unwrap(), "spawned");
}

#[test]
fn test_list_schedulers_sorted() {
    let mut schedulers = HashMap::new();
    for (name, chunk_size) in [("zeta", 2), ("alpha", 8)] {
        schedulers.insert(
            name.to_string(),
            SchedulerConfig {
                chunk_size,
                resource_capacity: Some(16),
                runner: RunnerConfig::new().with_max_parallelism(3),
            },
        );
    }
    let cfg = ExtractionConfig {
        schedulers,
        tasks: HashMap::new(),
    };

    let listed = list_schedulers(&cfg);
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].name, "alpha");
    assert_eq!(listed[0].chunk_size, 8);
    assert_eq!(listed[1].name, "zeta");
    assert_eq!(listed[1].max_parallelism, 3);
    assert_eq!(listed[1].resource_capacity, Some(16));
}

#[tokio::test]
async fn test_health_of_idle_manager() {
    let manager = TaskManager::new(&CancellationToken::new());
    let status = health(&manager);
    assert!(status.ok);
    assert_eq!(status.active_tasks, 0);
    assert_eq!(status.faulted_tasks, 0);
    assert!(!status.cancelled);

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["ok"], true);

    manager.cancel();
    assert!(health(&manager).cancelled);
    assert!(!health(&manager).ok);
}
