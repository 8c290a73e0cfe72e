//! Tests for builder functions

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use extraction_scheduler::builders::{
    build_guard, build_runner, build_scheduler, schedule_configured_tasks,
};
use extraction_scheduler::config::{
    ExtractionConfig, PeriodicTaskConfig, RunnerConfig, SchedulerConfig,
};
use extraction_scheduler::core::{
    Chunk, ChunkHandler, SchedulerError, TaskContext, TaskManager, WorkItem,
};
use extraction_scheduler::runtime::TokioSpawner;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct Record {
    fetched: bool,
}

impl WorkItem for Record {
    fn is_complete(&self) -> bool {
        self.fetched
    }
}

struct Fetcher;

#[async_trait]
impl ChunkHandler for Fetcher {
    type Item = Record;
    type Output = usize;

    async fn consume_chunk(
        &self,
        chunk: &mut Chunk<Record, usize>,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<usize> {
        Ok(chunk.len())
    }

    fn handle_task_result(
        &self,
        chunk: &mut Chunk<Record, usize>,
        _cancel: &CancellationToken,
    ) -> Vec<Record> {
        for record in chunk.items_mut() {
            record.fetched = true;
        }
        Vec::new()
    }

    fn abort_chunk(&self, _chunk: &mut Chunk<Record, usize>, _cancel: &CancellationToken) {}
}

fn config() -> ExtractionConfig {
    let mut schedulers = HashMap::new();
    schedulers.insert(
        "records".to_string(),
        SchedulerConfig {
            chunk_size: 3,
            resource_capacity: Some(6),
            runner: RunnerConfig::new().with_max_parallelism(2),
        },
    );
    let mut tasks = HashMap::new();
    tasks.insert(
        "b-refresh".to_string(),
        PeriodicTaskConfig {
            interval_ms: None,
            run_immediately: true,
        },
    );
    tasks.insert(
        "a-export".to_string(),
        PeriodicTaskConfig {
            interval_ms: None,
            run_immediately: false,
        },
    );
    ExtractionConfig { schedulers, tasks }
}

#[test]
fn test_build_guard_follows_capacity() {
    let cfg = config();
    let guard = build_guard(&cfg.schedulers["records"]).unwrap();
    assert_eq!(guard.capacity(), 6);
    assert_eq!(guard.available(), 6);

    let unbounded = SchedulerConfig {
        chunk_size: 1,
        resource_capacity: None,
        runner: RunnerConfig::default(),
    };
    assert!(build_guard(&unbounded).is_none());
}

#[tokio::test]
async fn test_build_runner_uses_config() {
    let runner = build_runner(
        &RunnerConfig::new().with_max_parallelism(1),
        &CancellationToken::new(),
        TokioSpawner::current(),
    );
    let value = runner.enqueue_and_wait(|| async { Ok(7) }).await.unwrap();
    assert_eq!(value.into_value(), Some(7));
    runner.wait_for_completion().await.unwrap();
}

#[tokio::test]
async fn test_build_scheduler_runs_to_completion() {
    let cfg = config();
    let items = (0..7).map(|_| Record { fetched: false }).collect();
    let mut scheduler = build_scheduler(
        &cfg,
        "records",
        Fetcher,
        items,
        &CancellationToken::new(),
        TokioSpawner::current(),
    )
    .unwrap();

    let progress = scheduler.run().await.unwrap();
    assert_eq!(progress.total, 7);
    assert_eq!(progress.finished, 7);
    assert!(progress.is_drained());
}

#[test]
fn test_build_scheduler_unknown_name() {
    let err = build_scheduler(
        &config(),
        "missing",
        Fetcher,
        Vec::new(),
        &CancellationToken::new(),
        TokioSpawner::current(),
    )
    .unwrap_err();
    assert!(matches!(err, SchedulerError::Config(ref msg) if msg.contains("missing")));
}

#[test]
fn test_build_scheduler_invalid_config() {
    let mut cfg = config();
    cfg.schedulers.get_mut("records").unwrap().chunk_size = 0;
    let err = build_scheduler(
        &cfg,
        "records",
        Fetcher,
        Vec::new(),
        &CancellationToken::new(),
        TokioSpawner::current(),
    )
    .unwrap_err();
    assert!(matches!(err, SchedulerError::Config(_)));
}

#[tokio::test]
async fn test_schedule_configured_tasks_in_name_order() {
    let manager = TaskManager::new(&CancellationToken::new());
    let fired = Arc::new(AtomicUsize::new(0));
    let mut seen = Vec::new();

    let ids = schedule_configured_tasks(&manager, &config(), |name, _task_cfg| {
        seen.push(name.to_string());
        let fired = Arc::clone(&fired);
        Ok(move |_ctx: TaskContext| {
            fired.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
    })
    .unwrap();

    assert_eq!(ids.len(), 2);
    assert_eq!(seen, vec!["a-export", "b-refresh"]);
    assert!(manager.contains_task("a-export"));
    assert!(manager.contains_task("b-refresh"));

    // Only the run-immediately task fires; neither has an interval.
    manager.exit_and_wait_for_termination("b-refresh").await.unwrap();
    manager.exit_and_wait_for_termination("a-export").await.unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}
