// tests/unit_recache_test.rs

mod common;

use common::*;
use edgecache::core::store::{MemoryStore, SharedStore};
use edgecache::core::tasks::recache::{RecacheQueue, RecacheScheduler};
use edgecache::core::types::Priority;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn urls(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_enqueue_expands_the_cross_product() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let queue = RecacheQueue::new(Arc::clone(&store));

    let added = queue
        .enqueue(
            1,
            &urls(&["https://ex.com/a", "https://ex.com/b"]),
            &[1, 2],
            Priority::High,
            100.0,
        )
        .await
        .unwrap();
    assert_eq!(added, 4);
    assert_eq!(store.zcard("recache:1:high").await.unwrap(), 4);
}

#[tokio::test]
async fn test_reenqueue_keeps_existing_schedule() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let queue = RecacheQueue::new(Arc::clone(&store));

    let first = queue
        .enqueue(1, &urls(&["https://ex.com/a"]), &[1], Priority::Normal, 100.0)
        .await
        .unwrap();
    assert_eq!(first, 1);

    // The same member again, even at a later score, adds nothing.
    let second = queue
        .enqueue(1, &urls(&["https://ex.com/a"]), &[1], Priority::Normal, 500.0)
        .await
        .unwrap();
    assert_eq!(second, 0);
    assert_eq!(queue.len(1, Priority::Normal).await.unwrap(), 1);

    let popped = queue.pop_due(1, Priority::Normal, 200).await.unwrap().unwrap();
    assert_eq!(popped.url, "https://ex.com/a");
}

#[tokio::test]
async fn test_pop_due_honors_scores() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let queue = RecacheQueue::new(store);

    queue
        .enqueue(1, &urls(&["https://ex.com/later"]), &[1], Priority::High, 300.0)
        .await
        .unwrap();
    queue
        .enqueue(1, &urls(&["https://ex.com/sooner"]), &[1], Priority::High, 100.0)
        .await
        .unwrap();

    // Nothing is due before the earliest score.
    assert!(queue.pop_due(1, Priority::High, 50).await.unwrap().is_none());

    // Lower scores pop first.
    let first = queue.pop_due(1, Priority::High, 400).await.unwrap().unwrap();
    assert_eq!(first.url, "https://ex.com/sooner");
    let second = queue.pop_due(1, Priority::High, 400).await.unwrap().unwrap();
    assert_eq!(second.url, "https://ex.com/later");
    assert!(queue.pop_due(1, Priority::High, 400).await.unwrap().is_none());
}

#[tokio::test]
async fn test_peek_does_not_consume() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let queue = RecacheQueue::new(store);
    queue
        .enqueue(1, &urls(&["https://ex.com/a"]), &[1], Priority::High, 100.0)
        .await
        .unwrap();

    let peeked = queue.peek(1, Priority::High, 0, 10).await.unwrap();
    assert_eq!(peeked.len(), 1);
    assert_eq!(peeked[0].0.url, "https://ex.com/a");
    assert_eq!(peeked[0].1, 100.0);
    assert_eq!(queue.len(1, Priority::High).await.unwrap(), 1);
}

#[tokio::test]
async fn test_scheduler_drains_due_entries() {
    let dir = tempfile::tempdir().unwrap();
    let node = single_node(dir.path(), "ex.com").await;

    node.state
        .recache
        .enqueue(
            1,
            &urls(&["https://ex.com/r1", "https://ex.com/r2"]),
            &[1],
            Priority::Normal,
            0.0,
        )
        .await
        .unwrap();

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let scheduler = RecacheScheduler::new(
        Arc::clone(&node.state.recache),
        Arc::clone(&node.state.orchestrator),
        Arc::clone(&node.state.hosts),
        node.state.config.recache.clone(),
    );
    let handle = tokio::spawn(scheduler.run(shutdown_tx.subscribe()));

    tokio::time::sleep(Duration::from_millis(800)).await;
    shutdown_tx.send(()).unwrap();
    handle.await.unwrap();

    assert_eq!(node.renderer.call_count(), 2);
    assert_eq!(node.state.recache.len(1, Priority::Normal).await.unwrap(), 0);
    let entries = node
        .state
        .cache
        .metadata_store()
        .all_entry_keys()
        .await
        .unwrap();
    assert_eq!(entries.len(), 2);
}

#[tokio::test]
async fn test_scheduler_leaves_future_entries_queued() {
    let dir = tempfile::tempdir().unwrap();
    let node = single_node(dir.path(), "ex.com").await;

    let far_future = edgecache::core::types::unix_now() + 3600;
    node.state
        .recache
        .enqueue(
            1,
            &urls(&["https://ex.com/later"]),
            &[1],
            Priority::Normal,
            far_future as f64,
        )
        .await
        .unwrap();

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let scheduler = RecacheScheduler::new(
        Arc::clone(&node.state.recache),
        Arc::clone(&node.state.orchestrator),
        Arc::clone(&node.state.hosts),
        node.state.config.recache.clone(),
    );
    let handle = tokio::spawn(scheduler.run(shutdown_tx.subscribe()));

    tokio::time::sleep(Duration::from_millis(400)).await;
    shutdown_tx.send(()).unwrap();
    handle.await.unwrap();

    assert_eq!(node.renderer.call_count(), 0);
    assert_eq!(node.state.recache.len(1, Priority::Normal).await.unwrap(), 1);
}

#[tokio::test]
async fn test_failed_work_is_retried_a_bounded_number_of_times() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let renderer = MockRenderer::failing();
    let node = build_node(
        store,
        test_config(dir.path(), "n1", "ex.com"),
        renderer,
    )
    .await;

    node.state
        .recache
        .enqueue(1, &urls(&["https://ex.com/flaky"]), &[1], Priority::High, 0.0)
        .await
        .unwrap();

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let scheduler = RecacheScheduler::new(
        Arc::clone(&node.state.recache),
        Arc::clone(&node.state.orchestrator),
        Arc::clone(&node.state.hosts),
        node.state.config.recache.clone(),
    );
    let handle = tokio::spawn(scheduler.run(shutdown_tx.subscribe()));

    tokio::time::sleep(Duration::from_millis(800)).await;
    shutdown_tx.send(()).unwrap();
    handle.await.unwrap();

    // Dispatched at most max_retries (3) times, then dropped for good.
    assert_eq!(node.renderer.call_count(), 3);
    assert_eq!(node.state.recache.len(1, Priority::High).await.unwrap(), 0);
}
