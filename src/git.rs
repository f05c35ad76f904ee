use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use git2::{BranchType, ErrorCode, Repository, RepositoryState, ResetType, Signature, StatusOptions};

use crate::{rlog_debug, rlog_warn, Error, Result};

/// Thin wrapper over git for one repository.
///
/// Probes go through libgit2. Porcelain operations that libgit2 does not
/// cover well (checkout with safety checks, merge, worktree add) shell out
/// to `git` with an argument vector, never a shell string.
pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        rlog_debug!("GitOps::new path={}", repo_path.display());
        let repo = Repository::discover(repo_path)?;
        let root = repo
            .workdir()
            .map(Path::to_path_buf)
            .ok_or_else(|| Error::Validation("bare repositories are not supported".to_string()))?;
        Ok(Self { repo_path: root })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::open(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Run `git <args>` in the main working tree and return stdout.
    pub fn run(&self, args: &[&str]) -> Result<String> {
        self.run_in(&self.repo_path, args)
    }

    /// Run `git <args>` in `dir` and return stdout, failing on a non-zero exit.
    pub fn run_in(&self, dir: &Path, args: &[&str]) -> Result<String> {
        let output = self.output_in(dir, args)?;
        if !output.status.success() {
            return Err(Error::GitCommand {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Run `git <args>` in `dir` without judging the exit status.
    pub fn output_in(&self, dir: &Path, args: &[&str]) -> Result<Output> {
        rlog_debug!("git {} (in {})", args.join(" "), dir.display());
        Ok(Command::new("git").args(args).current_dir(dir).output()?)
    }

    pub fn current_branch(&self) -> Result<Option<String>> {
        let repo = self.repo()?;
        let head = match repo.head() {
            Ok(head) => head,
            Err(e) if e.code() == ErrorCode::UnbornBranch => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if head.is_branch() {
            return Ok(head.shorthand().map(String::from));
        }
        Ok(None)
    }

    pub fn head_commit(&self) -> Result<String> {
        self.head_commit_at(&self.repo_path)
    }

    pub fn head_commit_at(&self, path: &Path) -> Result<String> {
        let repo = Repository::open(path)?;
        let commit = repo.head()?.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        let found = match repo.find_branch(branch, BranchType::Local) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        };
        found
    }

    /// Create `branch` pointing at the tip of `from`.
    pub fn create_branch(&self, branch: &str, from: &str) -> Result<()> {
        validate_branch_name(branch)?;
        rlog_debug!("GitOps::create_branch branch={} from={}", branch, from);
        let repo = self.repo()?;
        let source = match repo.find_branch(from, BranchType::Local) {
            Ok(b) => b,
            Err(e) if e.code() == ErrorCode::NotFound => {
                return Err(Error::Validation(format!(
                    "cannot create {}: base branch {} does not exist",
                    branch, from
                )))
            }
            Err(e) => return Err(e.into()),
        };
        let commit = source.get().peel_to_commit()?;
        repo.branch(branch, &commit, false)?;
        Ok(())
    }

    pub fn checkout(&self, branch: &str) -> Result<()> {
        validate_branch_name(branch)?;
        self.run(&["checkout", branch])?;
        Ok(())
    }

    /// Tracked files with uncommitted changes, staged or not. Untracked files don't count.
    pub fn is_dirty(&self) -> Result<bool> {
        self.is_dirty_at(&self.repo_path)
    }

    pub fn is_dirty_at(&self, path: &Path) -> Result<bool> {
        let repo = Repository::open(path)?;
        let mut opts = StatusOptions::new();
        opts.include_untracked(false).include_ignored(false);
        let statuses = repo.statuses(Some(&mut opts))?;
        Ok(!statuses.is_empty())
    }

    /// Stage every change, including deletions and new files.
    pub fn stage_all(&self, path: &Path) -> Result<()> {
        self.run_in(path, &["add", "-A"])?;
        Ok(())
    }

    /// Whether the index differs from HEAD.
    pub fn has_staged_changes(&self, path: &Path) -> Result<bool> {
        let repo = Repository::open(path)?;
        let head_tree = match repo.head() {
            Ok(head) => Some(head.peel_to_tree()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };
        let index = repo.index()?;
        if head_tree.is_none() {
            return Ok(!index.is_empty());
        }
        let diff = repo.diff_tree_to_index(head_tree.as_ref(), Some(&index), None)?;
        Ok(diff.deltas().len() > 0)
    }

    /// Commit whatever is staged at `path` and return the new commit id.
    pub fn commit_staged(&self, path: &Path, message: &str) -> Result<String> {
        rlog_debug!("GitOps::commit_staged path={} message={}", path.display(), message);
        let repo = Repository::open(path)?;
        let mut index = repo.index()?;
        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = repo
            .signature()
            .or_else(|_| Signature::now("Roaster", "roaster@localhost"))?;

        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };

        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        rlog_debug!("Commit created: {}", commit_id);
        Ok(commit_id.to_string())
    }

    pub fn state(&self) -> Result<RepositoryState> {
        Ok(self.repo()?.state())
    }

    pub fn merge_in_progress(&self) -> Result<bool> {
        Ok(self.state()? == RepositoryState::Merge)
    }

    pub fn rebase_in_progress(&self) -> Result<bool> {
        Ok(matches!(
            self.state()?,
            RepositoryState::Rebase
                | RepositoryState::RebaseInteractive
                | RepositoryState::RebaseMerge
                | RepositoryState::ApplyMailbox
                | RepositoryState::ApplyMailboxOrRebase
        ))
    }

    /// Paths with unresolved conflicts in the index.
    pub fn unmerged_paths(&self) -> Result<Vec<String>> {
        let repo = self.repo()?;
        let index = repo.index()?;
        if !index.has_conflicts() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        for conflict in index.conflicts()? {
            let conflict = conflict?;
            if let Some(entry) = conflict.our.or(conflict.their).or(conflict.ancestor) {
                paths.push(String::from_utf8_lossy(&entry.path).to_string());
            }
        }
        paths.sort();
        paths.dedup();
        Ok(paths)
    }

    /// `git merge --no-ff`; the caller inspects the outcome.
    pub fn merge_no_ff(&self, branch: &str, message: &str) -> Result<Output> {
        validate_branch_name(branch)?;
        self.output_in(&self.repo_path, &["merge", "--no-ff", "-m", message, branch])
    }

    /// `git merge --squash`; stages the combined change without committing.
    pub fn merge_squash(&self, branch: &str) -> Result<Output> {
        validate_branch_name(branch)?;
        self.output_in(&self.repo_path, &["merge", "--squash", branch])
    }

    pub fn abort_merge(&self) -> Result<()> {
        self.run(&["merge", "--abort"])?;
        Ok(())
    }

    pub fn abort_rebase(&self) -> Result<()> {
        self.run(&["rebase", "--abort"])?;
        Ok(())
    }

    /// Hard reset the working tree at `path` to its HEAD.
    pub fn reset_hard(&self, path: &Path) -> Result<()> {
        let repo = Repository::open(path)?;
        let head = repo.head()?.peel_to_commit()?;
        repo.reset(head.as_object(), ResetType::Hard, None)?;
        repo.cleanup_state()?;
        Ok(())
    }

    /// Delete a local branch. Returns Ok even if branch doesn't exist.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        rlog_debug!("GitOps::delete_branch branch={}", branch);
        let repo = self.repo()?;
        match repo.find_branch(branch, BranchType::Local) {
            Ok(mut branch_ref) => {
                branch_ref.delete()?;
                rlog_debug!("Branch deleted: {}", branch);
            }
            Err(e) if e.code() == ErrorCode::NotFound => {
                rlog_debug!("Branch '{}' not found (already deleted?)", branch);
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Add a linked worktree at `worktree_path` with `branch` checked out.
    pub fn add_worktree(&self, branch: &str, worktree_path: &Path) -> Result<()> {
        validate_branch_name(branch)?;
        if let Some(parent) = worktree_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let path = worktree_path.to_string_lossy();
        self.run(&["worktree", "add", "--quiet", path.as_ref(), branch])?;
        Ok(())
    }

    /// Remove a linked worktree, falling back to deleting the directory and pruning.
    pub fn remove_worktree(&self, worktree_path: &Path) -> Result<()> {
        rlog_debug!("GitOps::remove_worktree path={}", worktree_path.display());
        let path = worktree_path.to_string_lossy();
        if let Err(e) = self.run(&["worktree", "remove", "--force", path.as_ref()]) {
            rlog_warn!("git worktree remove failed for {}: {}", worktree_path.display(), e);
            if worktree_path.exists() {
                std::fs::remove_dir_all(worktree_path)?;
            }
        }
        self.run(&["worktree", "prune"])?;
        Ok(())
    }

    pub fn push(&self, dir: &Path, remote: &str, branch: &str) -> Result<()> {
        validate_branch_name(branch)?;
        self.run_in(dir, &["push", remote, branch])?;
        Ok(())
    }
}

/// Reject names git would misread, including anything that looks like an option.
pub fn validate_branch_name(name: &str) -> Result<()> {
    if name.is_empty() || name.starts_with('-') || !git2::Branch::name_is_valid(name)? {
        return Err(Error::Validation(format!("invalid branch name '{}'", name)));
    }
    Ok(())
}
