//! Watcher tests against a real directory.
//!
//! The store is in-memory, so file contents only serve to trigger
//! notifications; what the watcher reports comes from the store.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;

use roaster::beans::{Bean, BeanStatus, BeanType, MemoryStore};
use roaster::orchestration::{Watcher, WatcherEvent};

fn drain(rx: &mut mpsc::UnboundedReceiver<WatcherEvent>) -> Vec<WatcherEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Test: Rapid edits collapse into one event
/// Given a started watcher over an empty store
/// When a bean file is written 5 times within the debounce window
/// Then exactly one Created event arrives
/// And it carries the final state
#[tokio::test]
async fn test_rapid_writes_are_debounced() {
    let dir = TempDir::new().unwrap();
    let beans_dir = dir.path().join(".beans");
    let store = Arc::new(MemoryStore::new());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher = Watcher::new(store.clone(), beans_dir.clone(), tx);
    watcher.start().await.unwrap();

    let file = beans_dir.join("b1--slug.md");
    for i in 0..5 {
        let body = format!("v{}", i);
        store.insert(Bean::new("b1", "Bean", BeanType::Task).with_body(&body));
        std::fs::write(&file, &body).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    let events = drain(&mut rx);
    assert_eq!(events.len(), 1, "got {:?}", events);
    match &events[0] {
        WatcherEvent::Created(bean) => {
            assert_eq!(bean.id, "b1");
            assert_eq!(bean.body, "v4");
        }
        other => panic!("expected Created, got {:?}", other),
    }
    assert_eq!(watcher.cache().get("b1").unwrap().body, "v4");
    watcher.stop().await;
}

/// Test: Status edits produce an update and a status change
#[tokio::test]
async fn test_status_edit_reports_status_change() {
    let dir = TempDir::new().unwrap();
    let beans_dir = dir.path().join(".beans");
    std::fs::create_dir_all(&beans_dir).unwrap();
    let file = beans_dir.join("b1--slug.md");
    std::fs::write(&file, "todo").unwrap();
    let store = Arc::new(MemoryStore::with_beans([Bean::new("b1", "Bean", BeanType::Task)]));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher = Watcher::new(store.clone(), beans_dir, tx);
    watcher.start().await.unwrap();

    store.insert(Bean::new("b1", "Bean", BeanType::Task).with_status(BeanStatus::Scrapped));
    std::fs::write(&file, "scrapped").unwrap();
    tokio::time::sleep(Duration::from_millis(800)).await;

    let events = drain(&mut rx);
    assert_eq!(events.len(), 2, "got {:?}", events);
    assert!(matches!(events[0], WatcherEvent::Updated { .. }));
    assert_eq!(
        events[1],
        WatcherEvent::StatusChanged {
            id: "b1".to_string(),
            old: BeanStatus::Todo,
            new: BeanStatus::Scrapped,
        }
    );
    assert_eq!(watcher.cache().status_of("b1"), Some(BeanStatus::Scrapped));
    watcher.stop().await;
}

/// Test: Removing a bean file reports a deletion
#[tokio::test]
async fn test_delete_reports_deleted() {
    let dir = TempDir::new().unwrap();
    let beans_dir = dir.path().join(".beans");
    std::fs::create_dir_all(&beans_dir).unwrap();
    let file = beans_dir.join("b1.md");
    std::fs::write(&file, "x").unwrap();
    let store = Arc::new(MemoryStore::with_beans([Bean::new("b1", "Bean", BeanType::Task)]));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher = Watcher::new(store.clone(), beans_dir, tx);
    watcher.start().await.unwrap();
    assert_eq!(watcher.cache().len(), 1);

    store.remove("b1");
    std::fs::remove_file(&file).unwrap();
    tokio::time::sleep(Duration::from_millis(800)).await;

    let events = drain(&mut rx);
    assert_eq!(events.len(), 1, "got {:?}", events);
    assert!(matches!(&events[0], WatcherEvent::Deleted(bean) if bean.id == "b1"));
    assert!(watcher.cache().is_empty());
    watcher.stop().await;
}

/// Test: Forced refresh bypasses the filesystem
#[tokio::test]
async fn test_refresh_emits_without_file_change() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::with_beans([Bean::new("b1", "Bean", BeanType::Task)]));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher = Watcher::new(store.clone(), dir.path().join(".beans"), tx);
    watcher.start().await.unwrap();

    assert_eq!(watcher.refresh("b1").await.unwrap(), 0);
    store.insert(
        Bean::new("b1", "Bean", BeanType::Task)
            .with_status(BeanStatus::InProgress)
            .with_tag("blocked"),
    );
    assert_eq!(watcher.refresh("b1").await.unwrap(), 3);

    let events = drain(&mut rx);
    assert!(matches!(
        &events[2],
        WatcherEvent::TagsChanged { added, removed, .. }
            if added == &vec!["blocked".to_string()] && removed.is_empty()
    ));
    watcher.stop().await;
}
