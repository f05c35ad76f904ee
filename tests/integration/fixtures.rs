//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories
//! - Building configs that run `sh` as the agent
//! - Waiting on asynchronous conditions

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use roaster::beans::MemoryStore;
use roaster::config::{AgentBackend, AgentConfig, BranchConfig, Config, OnBlockedConfig, OnCompleteConfig};
use roaster::git::GitOps;
use roaster::orchestration::{BranchManager, CompletionHandler};

/// A test repository with a temporary directory and initialized git.
pub struct TestRepo {
    /// The temporary directory containing the repo.
    pub temp_dir: TempDir,
    /// Path to the repository root.
    pub path: PathBuf,
}

impl TestRepo {
    /// Create a new test repository on `main` with an initial commit.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();
        let repo = Self { temp_dir, path };

        repo.git(&["init", "-b", "main"]);
        repo.git(&["config", "user.email", "test@test.com"]);
        repo.git(&["config", "user.name", "Test User"]);
        std::fs::write(repo.path.join("README.md"), "# Test Repository\n")
            .expect("Failed to write README");
        repo.git(&["add", "."]);
        repo.git(&["commit", "-m", "Initial commit"]);
        repo
    }

    /// Run git and return trimmed stdout, panicking on failure.
    pub fn git(&self, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.path)
            .output()
            .expect("Failed to run git");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// Run git and report only whether it succeeded.
    pub fn git_ok(&self, args: &[&str]) -> bool {
        Command::new("git")
            .args(args)
            .current_dir(&self.path)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Write a file and commit it on the current branch.
    pub fn commit_file(&self, filename: &str, content: &str, message: &str) -> String {
        self.write_file(filename, content);
        self.git(&["add", filename]);
        self.git(&["commit", "-m", message]);
        self.git(&["rev-parse", "HEAD"])
    }

    pub fn write_file(&self, filename: &str, content: &str) {
        let file_path = self.path.join(filename);
        if let Some(parent) = file_path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent dir");
        }
        std::fs::write(&file_path, content).expect("Failed to write file");
    }

    pub fn current_branch(&self) -> String {
        self.git(&["branch", "--show-current"])
    }

    pub fn checkout(&self, branch: &str) {
        self.git(&["checkout", branch]);
    }

    pub fn branch_exists(&self, name: &str) -> bool {
        !self.git(&["branch", "--list", name]).is_empty()
    }

    pub fn commit_count(&self, rev: &str) -> usize {
        self.git(&["rev-list", "--count", rev])
            .parse()
            .expect("rev-list count")
    }

    /// Full commit messages reachable from `rev`, newest first.
    pub fn messages(&self, rev: &str) -> Vec<String> {
        self.git(&["log", "--format=%B%x00", rev])
            .split('\0')
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect()
    }

    pub fn head_message(&self, rev: &str) -> String {
        self.git(&["log", "-1", "--format=%B", rev])
    }

    /// No staged, unstaged or conflicted changes and no merge in progress.
    pub fn is_clean(&self) -> bool {
        self.git(&["status", "--porcelain", "--untracked-files=no"]).is_empty()
            && !self.path.join(".git").join("MERGE_HEAD").exists()
    }

    pub fn git_ops(&self) -> GitOps {
        GitOps::new(&self.path).expect("Failed to open repo")
    }

    pub fn branch_manager(&self) -> BranchManager {
        BranchManager::new(self.git_ops(), BranchConfig::default())
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

/// A completion handler over a test repo, an in-memory store and a scratch output dir.
pub struct CompletionHarness {
    pub repo: TestRepo,
    pub store: Arc<MemoryStore>,
    pub branches: Arc<BranchManager>,
    pub handler: CompletionHandler,
    pub output_dir: TempDir,
}

impl CompletionHarness {
    pub fn new() -> Self {
        Self::with_config(OnCompleteConfig::default(), OnBlockedConfig::default())
    }

    pub fn with_config(on_complete: OnCompleteConfig, on_blocked: OnBlockedConfig) -> Self {
        let repo = TestRepo::new();
        let store = Arc::new(MemoryStore::new());
        let branches = Arc::new(repo.branch_manager());
        let output_dir = TempDir::new().expect("Failed to create output dir");
        let handler = CompletionHandler::new(
            store.clone(),
            branches.clone(),
            on_complete,
            on_blocked,
            output_dir.path().to_path_buf(),
        );
        Self {
            repo,
            store,
            branches,
            handler,
            output_dir,
        }
    }

    pub fn write_output(&self, bean_id: &str, lines: &[String]) {
        let path = self.output_dir.path().join(format!("{}.log", bean_id));
        std::fs::write(path, lines.join("\n") + "\n").expect("Failed to write output log");
    }
}

/// Config that runs `sh -c <script>` as the agent and keeps state under `state_dir`.
pub fn sh_config(state_dir: &Path, script: &str) -> Config {
    let mut config = Config::default();
    config.state_dir = Some(state_dir.to_string_lossy().to_string());
    config.scheduler.poll_interval_ms = 50;
    config.agent = AgentConfig {
        backend: AgentBackend::Custom,
        binary: Some("sh".to_string()),
        model: None,
        flags: vec!["-c".to_string(), script.to_string(), "agent".to_string()],
        grace_period_secs: 1,
    };
    config
}

/// Poll `check` until it returns true or `timeout` passes.
pub async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
