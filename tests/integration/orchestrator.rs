//! End-to-end daemon tests with `sh` standing in for the agent.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use roaster::beans::{Bean, BeanFilter, BeanStatus, BeanStore, BeanType, MemoryStore, TAG_BLOCKED, TAG_FAILED};
use roaster::config::Config;
use roaster::orchestration::Orchestrator;

use crate::fixtures::{sh_config, wait_for, TestRepo};

const TIMEOUT: Duration = Duration::from_secs(10);

fn quiet(mut config: Config) -> Config {
    config.branch.enabled = false;
    config.on_complete.auto_commit = false;
    config
}

fn crash_beans(store: &MemoryStore) -> Vec<Bean> {
    store
        .list(&BeanFilter::all())
        .unwrap()
        .into_iter()
        .filter(|b| b.title.starts_with("Crash:"))
        .collect()
}

/// Test: A clean agent run lands on main
/// Given a todo task and an agent that writes result.txt
/// When the daemon runs
/// Then the bean is completed
/// And main contains the file in a commit naming the bean
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_successful_run_lands_on_main() {
    let repo = TestRepo::new();
    let state = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::with_beans([Bean::new("b1", "Write result", BeanType::Task)]));
    let config = sh_config(state.path(), "echo done > result.txt");

    let orch = Orchestrator::new(config, &repo.path, store.clone()).unwrap();
    let handle = orch.handle();
    let task = tokio::spawn(orch.run());

    let done = wait_for(TIMEOUT, || {
        let store = store.clone();
        async move {
            store
                .get("b1")
                .unwrap()
                .is_some_and(|b| b.status == BeanStatus::Completed)
        }
    })
    .await;
    assert!(done, "bean never completed");

    let status = handle.status().await.unwrap();
    assert!(status.running.is_empty());
    assert_eq!(status.recent.len(), 1);
    assert_eq!(status.recent[0].bean_id, "b1");

    handle.shutdown();
    task.await.unwrap().unwrap();

    assert_eq!(repo.current_branch(), "main");
    assert_eq!(repo.git(&["show", "main:result.txt"]), "done");
    assert_eq!(repo.head_message("main"), "chore: Write result\n\nBean: b1");
    assert!(!repo.branch_exists("bean/b1"));
}

/// Test: A crashing agent leaves a crash report
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_run_creates_crash_bug() {
    let repo = TestRepo::new();
    let state = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::with_beans([Bean::new("t1", "Explode", BeanType::Task)]));
    // Only the original bean fails, so the crash report itself can run cleanly.
    let script = r#"case "$1" in *"Bean t1 (task,"*) echo boom; exit 3;; *) exit 0;; esac"#;
    let config = quiet(sh_config(state.path(), script));

    let orch = Orchestrator::new(config, &repo.path, store.clone()).unwrap();
    let handle = orch.handle();
    let task = tokio::spawn(orch.run());

    let failed = wait_for(TIMEOUT, || {
        let store = store.clone();
        async move {
            store.get("t1").unwrap().is_some_and(|b| b.has_tag(TAG_FAILED))
                && !crash_beans(&store).is_empty()
        }
    })
    .await;
    assert!(failed, "crash was never recorded");

    handle.shutdown();
    task.await.unwrap().unwrap();

    let crashes = crash_beans(&store);
    assert_eq!(crashes.len(), 1);
    assert_eq!(crashes[0].title, "Crash: Explode");
    assert!(crashes[0].body.contains("boom"));
    let t1 = store.get("t1").unwrap().unwrap();
    assert_eq!(t1.blocking_ids, vec![crashes[0].id.clone()]);
    assert_ne!(t1.status, BeanStatus::Completed);
}

/// Test: Cancel is not a failure
/// Given a running agent
/// When it is cancelled
/// Then the bean is back to todo without tags
/// And no crash bean or completion record exists
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_reverts_to_todo_without_side_effects() {
    let repo = TestRepo::new();
    let state = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::with_beans([Bean::new("b1", "Slow", BeanType::Task)]));
    let config = quiet(sh_config(state.path(), "exec sleep 30"));

    let orch = Orchestrator::new(config, &repo.path, store.clone()).unwrap();
    let handle = orch.handle();
    let task = tokio::spawn(orch.run());

    let started = wait_for(TIMEOUT, || {
        let handle = handle.clone();
        async move { handle.status().await.is_ok_and(|s| s.running.len() == 1) }
    })
    .await;
    assert!(started, "agent never started");

    handle.cancel("b1").await.unwrap();

    let b1 = store.get("b1").unwrap().unwrap();
    assert_eq!(b1.status, BeanStatus::Todo);
    assert!(b1.tags.is_empty());
    assert_eq!(store.len(), 1);

    let status = handle.status().await.unwrap();
    assert!(status.running.is_empty());
    assert!(status.recent.is_empty());
    assert!(status.queue.is_empty(), "cancelled bean is held back");

    assert!(handle.cancel("b1").await.is_err(), "nothing left to cancel");

    handle.shutdown();
    task.await.unwrap().unwrap();
}

/// Test: Retry jumps the queue within its priority
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_retry_goes_to_front_of_tier() {
    let repo = TestRepo::new();
    let state = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::with_beans([
        Bean::new("a", "Stuck", BeanType::Task).with_tag(TAG_BLOCKED),
        Bean::new("n1", "First", BeanType::Task),
        Bean::new("n2", "Second", BeanType::Task),
    ]));
    let config = quiet(sh_config(state.path(), "exec sleep 30"));

    let orch = Orchestrator::new(config, &repo.path, store.clone()).unwrap();
    let handle = orch.handle();
    let task = tokio::spawn(orch.run());

    let settled = wait_for(TIMEOUT, || {
        let handle = handle.clone();
        async move {
            handle.status().await.is_ok_and(|s| {
                s.running.len() == 1
                    && s.running[0].bean_id == "n1"
                    && s.queue.iter().map(|e| e.bean.id.as_str()).eq(["n2"])
            })
        }
    })
    .await;
    assert!(settled, "n1 never started");

    handle.retry("a").await.unwrap();
    assert!(!store.get("a").unwrap().unwrap().has_tag(TAG_BLOCKED));

    // Let the watcher's tag-change event pass through as well.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let status = handle.status().await.unwrap();
    let queue: Vec<&str> = status.queue.iter().map(|e| e.bean.id.as_str()).collect();
    assert_eq!(queue, vec!["a", "n2"]);

    handle.shutdown();
    task.await.unwrap().unwrap();
    assert_eq!(store.get("n1").unwrap().unwrap().status, BeanStatus::Todo);
}

/// Test: Pause holds back new work
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pause_and_resume() {
    let repo = TestRepo::new();
    let state = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let config = quiet(sh_config(state.path(), "exit 0"));

    let orch = Orchestrator::new(config, &repo.path, store.clone()).unwrap();
    let handle = orch.handle();
    let task = tokio::spawn(orch.run());

    handle.pause().unwrap();
    assert!(handle.status().await.unwrap().paused);

    store.insert(Bean::new("b1", "Later", BeanType::Task));
    std::fs::write(repo.path.join(".beans").join("b1--later.md"), "later").unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let status = handle.status().await.unwrap();
    assert_eq!(status.queue.len(), 1);
    assert!(status.running.is_empty());
    assert_eq!(store.get("b1").unwrap().unwrap().status, BeanStatus::Todo);

    handle.resume().unwrap();
    let done = wait_for(TIMEOUT, || {
        let store = store.clone();
        async move {
            store
                .get("b1")
                .unwrap()
                .is_some_and(|b| b.status == BeanStatus::Completed)
        }
    })
    .await;
    assert!(done, "bean never ran after resume");

    handle.shutdown();
    task.await.unwrap().unwrap();
}

/// Test: Orphan recovery survives a second restart
/// Given a bean left in progress by a dead daemon
/// When the daemon starts twice
/// Then exactly one crash bean exists
/// And the orphan is blocked by it once
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_orphan_recovery_is_idempotent_across_restarts() {
    let repo = TestRepo::new();
    let state = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::with_beans([
        Bean::new("b1", "Interrupted", BeanType::Task).with_status(BeanStatus::InProgress),
    ]));

    for _ in 0..2 {
        let config = quiet(sh_config(state.path(), "exit 0"));
        let orch = Orchestrator::new(config, &repo.path, store.clone()).unwrap();
        let handle = orch.handle();
        let task = tokio::spawn(orch.run());

        // Control commands are only served once startup has finished.
        handle.status().await.unwrap();
        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    let crashes = crash_beans(&store);
    assert_eq!(crashes.len(), 1);
    let b1 = store.get("b1").unwrap().unwrap();
    assert!(b1.has_tag(TAG_FAILED));
    assert_eq!(b1.blocking_ids, vec![crashes[0].id.clone()]);
    assert_eq!(b1.status, BeanStatus::InProgress);
}

/// Test: A blocked bean survives a restart untouched
/// Given a bean left in progress and tagged blocked
/// When the daemon starts
/// Then no crash bean is created
/// And the bean is neither failed nor queued
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_leaves_blocked_bean_alone() {
    let repo = TestRepo::new();
    let state = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::with_beans([
        Bean::new("b1", "Waiting", BeanType::Task)
            .with_status(BeanStatus::InProgress)
            .with_tag(TAG_BLOCKED),
    ]));

    let config = quiet(sh_config(state.path(), "exit 0"));
    let orch = Orchestrator::new(config, &repo.path, store.clone()).unwrap();
    let handle = orch.handle();
    let task = tokio::spawn(orch.run());

    let status = handle.status().await.unwrap();
    assert!(status.running.is_empty());
    assert!(status.queue.is_empty());
    handle.shutdown();
    task.await.unwrap().unwrap();

    assert!(crash_beans(&store).is_empty());
    assert_eq!(store.len(), 1);
    let b1 = store.get("b1").unwrap().unwrap();
    assert!(b1.has_tag(TAG_BLOCKED));
    assert!(!b1.has_tag(TAG_FAILED));
    assert_eq!(b1.status, BeanStatus::InProgress);
}

/// Test: A zero poll interval is rejected up front
#[test]
fn test_zero_poll_interval_is_rejected() {
    let repo = TestRepo::new();
    let state = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let mut config = quiet(sh_config(state.path(), "exit 0"));
    config.scheduler.poll_interval_ms = 0;

    assert!(Orchestrator::new(config, &repo.path, store).is_err());
}
