//! Integration tests for the resizable resource guard.
//!
//! This test validates:
//! 1. Partial grants and blocking takes resolved by `free`
//! 2. Over-allocation after a shrink and recovery after a grow
//! 3. Strict FIFO servicing of waiters across a capacity shrink
//! 4. Accounting under concurrent take/free/resize traffic

use std::sync::Arc;
use std::time::Duration;

use extraction_scheduler::core::ResourceGuard;
use parking_lot::Mutex;
use rand::Rng;

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_partial_grant_then_blocking_take() {
    let guard = ResourceGuard::new(5);
    assert_eq!(guard.take(3, true).await.unwrap(), 3);
    assert_eq!(guard.take(3, true).await.unwrap(), 2);
    assert_eq!(guard.take(2, false).await.unwrap(), 0);

    let blocked = {
        let guard = guard.clone();
        tokio::spawn(async move { guard.take(3, true).await })
    };
    settle().await;
    assert!(!blocked.is_finished());
    assert_eq!(guard.waiters(), 1);

    guard.free(2).unwrap();
    // Whatever is available is granted; the waiter does not hold out for 3.
    assert_eq!(blocked.await.unwrap().unwrap(), 2);
    assert_eq!(guard.available(), 0);
    assert_eq!(guard.allocated(), 5);
}

#[tokio::test]
async fn test_shrink_below_allocation_then_grow() {
    let guard = ResourceGuard::new(5);
    assert_eq!(guard.take(5, true).await.unwrap(), 5);

    guard.set_capacity(3);
    assert_eq!(guard.available(), -2);

    let pending = {
        let guard = guard.clone();
        tokio::spawn(async move { guard.take(3, true).await })
    };
    settle().await;
    assert!(!pending.is_finished());

    guard.set_capacity(10);
    assert_eq!(pending.await.unwrap().unwrap(), 3);
    assert_eq!(guard.available(), 10 - (5 + 3));
}

#[tokio::test]
async fn test_frees_repay_deficit_before_granting() {
    let guard = ResourceGuard::new(4);
    assert_eq!(guard.take(4, false).await.unwrap(), 4);
    guard.set_capacity(2);

    let waiter = {
        let guard = guard.clone();
        tokio::spawn(async move { guard.take(1, true).await })
    };
    settle().await;

    guard.free(2).unwrap();
    settle().await;
    assert!(!waiter.is_finished(), "freed units must repay the deficit first");
    assert_eq!(guard.available(), 0);

    guard.free(1).unwrap();
    assert_eq!(waiter.await.unwrap().unwrap(), 1);
    assert_eq!(guard.available(), 0);
}

#[tokio::test]
async fn test_waiters_stay_fifo_across_shrink() {
    let guard = ResourceGuard::new(2);
    assert_eq!(guard.take(2, false).await.unwrap(), 2);
    let order = Arc::new(Mutex::new(Vec::new()));

    let spawn_waiter = |label: &'static str| {
        let guard = guard.clone();
        let order = Arc::clone(&order);
        tokio::spawn(async move {
            let granted = guard.take(1, true).await.unwrap();
            order.lock().push(label);
            granted
        })
    };

    let before = spawn_waiter("before-shrink");
    settle().await;
    guard.set_capacity(1);
    let after = spawn_waiter("after-shrink");
    settle().await;
    assert_eq!(guard.waiters(), 2);

    // Repays the deficit only.
    guard.free(1).unwrap();
    settle().await;
    assert!(order.lock().is_empty());

    guard.free(1).unwrap();
    assert_eq!(before.await.unwrap(), 1);
    settle().await;
    assert!(!after.is_finished());

    guard.set_capacity(3);
    assert_eq!(after.await.unwrap(), 1);
    assert_eq!(*order.lock(), vec!["before-shrink", "after-shrink"]);
    assert_eq!(guard.available(), 1);
}

#[tokio::test]
async fn test_non_waiting_take_does_not_overtake_queue() {
    let guard = ResourceGuard::new(1);
    assert_eq!(guard.take(1, false).await.unwrap(), 1);

    let queued = {
        let guard = guard.clone();
        tokio::spawn(async move { guard.take(1, true).await })
    };
    settle().await;

    guard.free(1).unwrap();
    assert_eq!(guard.take(1, false).await.unwrap(), 0);
    assert_eq!(queued.await.unwrap().unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_traffic_keeps_accounting() {
    let guard = ResourceGuard::new(6);
    let peak = Arc::new(Mutex::new(0_i64));
    let mut workers = Vec::new();

    for _ in 0..32 {
        let guard = guard.clone();
        let peak = Arc::clone(&peak);
        let (want, hold_ms) = {
            let mut rng = rand::rng();
            (rng.random_range(1..=4_i64), rng.random_range(1..=10_u64))
        };
        workers.push(tokio::spawn(async move {
            let granted = guard.take(want, true).await.unwrap();
            assert!((1..=want).contains(&granted));
            {
                let mut peak = peak.lock();
                *peak = (*peak).max(guard.allocated());
            }
            tokio::time::sleep(Duration::from_millis(hold_ms)).await;
            guard.free(granted).unwrap();
        }));
    }

    let resizer = {
        let guard = guard.clone();
        tokio::spawn(async move {
            for capacity in [3, 8, 2, 6] {
                tokio::time::sleep(Duration::from_millis(7)).await;
                guard.set_capacity(capacity);
            }
        })
    };

    for worker in futures::future::join_all(workers).await {
        worker.unwrap();
    }
    resizer.await.unwrap();

    assert_eq!(guard.allocated(), 0);
    assert_eq!(guard.available(), 6);
    assert_eq!(guard.waiters(), 0);
    assert!(*peak.lock() <= 8);
}
