//! Completion handling against a real repository and an in-memory store.

use std::time::Duration;

use roaster::beans::{Bean, BeanStatus, BeanStore, BeanType, Priority, TAG_BLOCKED, TAG_FAILED};
use roaster::config::{OnBlockedConfig, OnCompleteConfig};
use roaster::log::RunContext;
use roaster::orchestration::{ExitResult, Outcome};

use crate::fixtures::CompletionHarness;

fn exited(code: i32) -> ExitResult {
    ExitResult {
        code: Some(code),
        signal: None,
        duration: Duration::from_secs(1),
    }
}

fn crash_bean(h: &CompletionHarness, id: &str) -> Bean {
    h.store.get(id).unwrap().expect("crash bean exists")
}

/// Test: Non-zero exit records a crash
/// Given an in-progress bean whose agent printed 60 lines and exited 3
/// When the exit is handled
/// Then the bean is tagged failed and keeps its status
/// And a high-priority bug holding the last 50 lines blocks it
/// And the working tree is left alone
#[test]
fn test_failed_exit_creates_crash_bug() {
    let h = CompletionHarness::new();
    h.store.insert(
        Bean::new("t1", "Parse config", BeanType::Task)
            .with_status(BeanStatus::InProgress)
            .with_parent("e1"),
    );
    let lines: Vec<String> = (0..60).map(|i| format!("out{:02}", i)).collect();
    h.write_output("t1", &lines);
    h.repo.write_file("README.md", "half-done edit\n");
    let head = h.repo.git(&["rev-parse", "HEAD"]);

    let ctx = RunContext::new("t1");
    let result = h.handler.handle_exit(&ctx, &exited(3), None).unwrap();

    assert_eq!(result.outcome, Outcome::Failed);
    let bean = h.store.get("t1").unwrap().unwrap();
    assert!(bean.has_tag(TAG_FAILED));
    assert_eq!(bean.status, BeanStatus::InProgress);

    let crash_id = result.blocker_id.expect("crash bean id");
    assert_eq!(bean.blocking_ids, vec![crash_id.clone()]);
    let crash = crash_bean(&h, &crash_id);
    assert_eq!(crash.title, "Crash: Parse config");
    assert_eq!(crash.bean_type, BeanType::Bug);
    assert_eq!(crash.priority, Priority::High);
    assert_eq!(crash.parent_id.as_deref(), Some("e1"));
    assert!(crash.body.contains("exited with code 3"));
    assert!(crash.body.contains(&ctx.run_id.to_string()));
    assert!(crash.body.contains("out10"));
    assert!(crash.body.contains("out59"));
    assert!(!crash.body.contains("out09"));

    assert_eq!(h.repo.git(&["rev-parse", "HEAD"]), head);
    assert!(!h.repo.is_clean(), "agent edits are not reset");
}

/// Test: Blocked bean reuses an open blocker
#[test]
fn test_blocked_with_existing_blocker() {
    let h = CompletionHarness::new();
    h.store.insert(Bean::new("dep", "Dependency", BeanType::Task));
    h.store.insert(
        Bean::new("t1", "Task", BeanType::Task)
            .with_status(BeanStatus::InProgress)
            .with_tag(TAG_BLOCKED)
            .with_blocker("dep"),
    );

    let result = h
        .handler
        .handle_exit(&RunContext::new("t1"), &exited(0), None)
        .unwrap();

    assert_eq!(result.outcome, Outcome::Blocked);
    assert_eq!(result.blocker_id.as_deref(), Some("dep"));
    assert_eq!(h.store.len(), 2);
    assert_eq!(
        h.store.get("t1").unwrap().unwrap().status,
        BeanStatus::InProgress
    );
}

/// Test: Blocked bean without an open blocker gets one created
#[test]
fn test_blocked_creates_unblock_task() {
    let h = CompletionHarness::new();
    h.store.insert(Bean::new("done", "Old dependency", BeanType::Task).with_status(BeanStatus::Completed));
    h.store.insert(
        Bean::new("t1", "Wire API", BeanType::Task)
            .with_priority(Priority::Critical)
            .with_tag(TAG_BLOCKED)
            .with_blocker("done"),
    );

    let result = h
        .handler
        .handle_exit(&RunContext::new("t1"), &exited(0), None)
        .unwrap();

    assert_eq!(result.outcome, Outcome::Blocked);
    let blocker_id = result.blocker_id.expect("unblock bean id");
    let blocker = h.store.get(&blocker_id).unwrap().unwrap();
    assert_eq!(blocker.title, "Unblock: Wire API");
    assert_eq!(blocker.bean_type, BeanType::Task);
    assert_eq!(blocker.priority, Priority::Critical);
    assert!(h
        .store
        .get("t1")
        .unwrap()
        .unwrap()
        .blocking_ids
        .contains(&blocker_id));
}

/// Test: Blocker creation can be switched off
#[test]
fn test_blocked_without_blocker_creation() {
    let h = CompletionHarness::with_config(
        OnCompleteConfig::default(),
        OnBlockedConfig {
            create_blocker_bean: false,
        },
    );
    h.store.insert(Bean::new("t1", "Task", BeanType::Task).with_tag(TAG_BLOCKED));

    let result = h
        .handler
        .handle_exit(&RunContext::new("t1"), &exited(0), None)
        .unwrap();

    assert_eq!(result.outcome, Outcome::Blocked);
    assert_eq!(result.blocker_id, None);
    assert_eq!(h.store.len(), 1);
}

/// Test: Sequential completion lands on the parent branch
/// Given a task under epic "Auth" with uncommitted agent work on bean/t1
/// When the agent exits cleanly
/// Then the bean is completed
/// And bean/e1 gains one conventional commit scoped to the epic
/// And bean/t1 is deleted
#[test]
fn test_completed_squashes_into_parent_branch() {
    let h = CompletionHarness::new();
    h.store.insert(Bean::new("e1", "Auth", BeanType::Epic));
    h.store.insert(
        Bean::new("t1", "Add login", BeanType::Task)
            .with_status(BeanStatus::InProgress)
            .with_parent("e1"),
    );
    let t1 = h.store.get("t1").unwrap().unwrap();
    h.branches.ensure_branch(&t1, |id| h.store.get(id)).unwrap();
    h.repo.write_file("login.rs", "fn login() {}\n");
    let before = h.repo.commit_count("bean/e1");

    let result = h
        .handler
        .handle_exit(&RunContext::new("t1"), &exited(0), None)
        .unwrap();

    assert_eq!(result.outcome, Outcome::Completed);
    assert_eq!(result.error, None);
    assert_eq!(
        h.store.get("t1").unwrap().unwrap().status,
        BeanStatus::Completed
    );
    assert_eq!(h.repo.current_branch(), "bean/e1");
    assert_eq!(h.repo.commit_count("bean/e1"), before + 1);
    assert_eq!(h.repo.head_message("bean/e1"), "chore(auth): Add login\n\nBean: t1");
    assert_eq!(
        result.commit_sha.as_deref(),
        Some(h.repo.git(&["rev-parse", "bean/e1"]).as_str())
    );
    assert!(!h.repo.branch_exists("bean/t1"));
    assert!(h.repo.is_clean());
}

/// Test: Parallel completion merges from the worktree
#[test]
fn test_completed_from_worktree_merges_and_removes_it() {
    let h = CompletionHarness::new();
    h.store.insert(Bean::new("t1", "Add parser", BeanType::Task).with_status(BeanStatus::InProgress));
    let t1 = h.store.get("t1").unwrap().unwrap();
    let worktrees = tempfile::TempDir::new().unwrap();
    let path = worktrees.path().join("t1");
    h.branches.prepare_worktree(&t1, |id| h.store.get(id), &path).unwrap();
    std::fs::write(path.join("parser.rs"), "fn parse() {}\n").unwrap();

    let result = h
        .handler
        .handle_exit(&RunContext::new("t1"), &exited(0), Some(&path))
        .unwrap();

    assert_eq!(result.outcome, Outcome::Completed);
    assert_eq!(result.error, None);
    assert_eq!(h.repo.current_branch(), "main");
    assert!(h.repo.path.join("parser.rs").exists());
    assert_eq!(h.repo.head_message("main"), "chore: Add parser\n\nBean: t1");
    assert!(!path.exists());
    assert!(!h.repo.branch_exists("bean/t1"));
}

/// Test: Merge conflict does not undo completion
#[test]
fn test_merge_conflict_is_reported_not_fatal() {
    let h = CompletionHarness::new();
    h.repo.commit_file("shared.txt", "base\n", "Add shared file");
    h.store.insert(Bean::new("t1", "Edit shared", BeanType::Task).with_status(BeanStatus::InProgress));
    let t1 = h.store.get("t1").unwrap().unwrap();
    h.branches.ensure_branch(&t1, |_| Ok(None)).unwrap();
    h.repo.checkout("main");
    h.repo.commit_file("shared.txt", "main side\n", "Main edit");
    h.repo.checkout("bean/t1");
    h.repo.write_file("shared.txt", "agent side\n");

    let result = h
        .handler
        .handle_exit(&RunContext::new("t1"), &exited(0), None)
        .unwrap();

    assert_eq!(result.outcome, Outcome::Completed);
    let error = result.error.expect("conflict reported");
    assert!(error.contains("shared.txt"));
    assert_eq!(
        h.store.get("t1").unwrap().unwrap().status,
        BeanStatus::Completed
    );
    assert!(h.repo.branch_exists("bean/t1"));
    assert!(h.repo.is_clean());
}

/// Test: Nothing to land without auto-commit
#[test]
fn test_completed_without_auto_commit_leaves_tree() {
    let h = CompletionHarness::with_config(
        OnCompleteConfig {
            auto_commit: false,
            ..Default::default()
        },
        OnBlockedConfig::default(),
    );
    h.store.insert(Bean::new("t1", "Task", BeanType::Task));
    h.repo.write_file("README.md", "agent edit\n");
    let before = h.repo.commit_count("HEAD");

    let result = h
        .handler
        .handle_exit(&RunContext::new("t1"), &exited(0), None)
        .unwrap();

    assert_eq!(result.outcome, Outcome::Completed);
    assert_eq!(result.commit_sha, None);
    assert_eq!(h.repo.commit_count("HEAD"), before);
    assert!(!h.repo.is_clean());
}

/// Test: Orphan recovery happens once
#[test]
fn test_recover_orphan_is_idempotent() {
    let h = CompletionHarness::new();
    h.store.insert(Bean::new("b1", "Orphan", BeanType::Task).with_status(BeanStatus::InProgress));

    let first = h.handler.recover_orphan("b1").unwrap().expect("recovered");
    assert_eq!(first.outcome, Outcome::Failed);
    assert!(h.handler.recover_orphan("b1").unwrap().is_none());

    assert_eq!(h.store.len(), 2);
    let b1 = h.store.get("b1").unwrap().unwrap();
    assert_eq!(b1.blocking_ids.len(), 1);
    assert!(b1.has_tag(TAG_FAILED));
}

/// Test: Spawn failure is a crash
#[test]
fn test_spawn_failure_records_crash() {
    let h = CompletionHarness::new();
    h.store.insert(Bean::new("t1", "Task", BeanType::Task).with_status(BeanStatus::InProgress));

    let result = h
        .handler
        .handle_spawn_failure(&RunContext::new("t1"), "No such file or directory")
        .unwrap();

    assert_eq!(result.outcome, Outcome::Failed);
    let crash = crash_bean(&h, result.blocker_id.as_deref().unwrap());
    assert!(crash.body.contains("failed to start: No such file or directory"));
    assert!(h.store.get("t1").unwrap().unwrap().has_tag(TAG_FAILED));
}

/// Test: A blocked bean is not an orphan
#[test]
fn test_recover_orphan_skips_blocked_bean() {
    let h = CompletionHarness::new();
    h.store.insert(
        Bean::new("b1", "Waiting", BeanType::Task)
            .with_status(BeanStatus::InProgress)
            .with_tag(TAG_BLOCKED),
    );

    assert!(h.handler.recover_orphan("b1").unwrap().is_none());

    assert_eq!(h.store.len(), 1);
    let b1 = h.store.get("b1").unwrap().unwrap();
    assert!(!b1.has_tag(TAG_FAILED));
    assert!(b1.blocking_ids.is_empty());
}
