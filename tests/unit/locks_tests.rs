use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agent_manager::orchestrator::locks::AgentLocks;

#[tokio::test]
async fn same_agent_is_serialized() {
    let locks = AgentLocks::new();
    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let locks = locks.clone();
            let inside = Arc::clone(&inside);
            let peak = Arc::clone(&peak);
            tokio::spawn(async move {
                let _guard = locks.lock("a1").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            })
        })
        .collect();
    for task in tasks {
        task.await.expect("task");
    }

    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn different_agents_do_not_contend() {
    let locks = AgentLocks::new();
    let _a = locks.lock("a1").await;
    let b = tokio::time::timeout(Duration::from_secs(1), locks.lock("b1")).await;
    assert!(b.is_ok(), "lock on another agent must not wait");
}

#[tokio::test]
async fn forget_keeps_held_slot() {
    let locks = AgentLocks::new();
    let guard = locks.lock("a1").await;
    locks.forget("a1").await;

    // Slot survived: a second locker still has to wait for the guard.
    let waiting = tokio::time::timeout(Duration::from_millis(50), locks.lock("a1")).await;
    assert!(waiting.is_err());

    drop(guard);
    locks.forget("a1").await;
    let _fresh = tokio::time::timeout(Duration::from_secs(1), locks.lock("a1"))
        .await
        .expect("free after forget");
}
