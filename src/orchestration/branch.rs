//! Hierarchical branch lifecycle for beans.
//!
//! Every bean works on `bean/{id}`, created from its parent's branch (or the
//! default branch for roots). Finished work is merged back into that same
//! parent branch with a strategy chosen by bean type.

use std::path::Path;

use crate::beans::{ancestors, Bean, BeanType};
use crate::config::{BranchConfig, MergeStrategy};
use crate::git::GitOps;
use crate::{rlog, rlog_debug, rlog_warn, Error, Result};

/// Outcome of merging a bean branch into its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeResult {
    /// Merge landed; `commit` is the target's new tip.
    Success { commit: String },
    /// Merge conflicted and was rolled back. The working tree is clean again.
    Conflicts { files: Vec<String> },
}

impl MergeResult {
    pub fn is_success(&self) -> bool {
        matches!(self, MergeResult::Success { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, MergeResult::Conflicts { .. })
    }

    pub fn commit(&self) -> Option<&str> {
        match self {
            MergeResult::Success { commit } => Some(commit),
            MergeResult::Conflicts { .. } => None,
        }
    }
}

/// Result of making sure a bean branch exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsuredBranch {
    /// The bean's own branch.
    pub branch: String,
    /// Branches created by this call, in creation order.
    pub created: Vec<String>,
}

pub struct BranchManager {
    git: GitOps,
    config: BranchConfig,
}

impl BranchManager {
    pub fn new(git: GitOps, config: BranchConfig) -> Self {
        Self { git, config }
    }

    pub fn git(&self) -> &GitOps {
        &self.git
    }

    pub fn config(&self) -> &BranchConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn merge_strategy(&self, bean_type: BeanType) -> MergeStrategy {
        self.config.strategy_for(bean_type)
    }

    /// The parent's branch when it exists, otherwise the default branch.
    pub fn merge_target(&self, bean: &Bean) -> Result<String> {
        if let Some(parent_id) = &bean.parent_id {
            let parent_branch = crate::beans::branch_name_for(parent_id);
            if self.git.branch_exists(&parent_branch)? {
                return Ok(parent_branch);
            }
            rlog_debug!(
                "parent branch {} missing, targeting {}",
                parent_branch,
                self.config.default_branch
            );
        }
        Ok(self.config.default_branch.clone())
    }

    /// Create the bean branch (and any missing ancestor branches) and check it out.
    ///
    /// Refuses to run on a dirty working tree. Safe to call again for a bean
    /// whose branch already exists: it only checks it out.
    pub fn ensure_branch<F>(&self, bean: &Bean, fetch: F) -> Result<EnsuredBranch>
    where
        F: FnMut(&str) -> Result<Option<Bean>>,
    {
        if self.git.is_dirty()? {
            return Err(Error::DirtyWorkingTree);
        }
        let ensured = self.ensure_branch_refs(bean, fetch)?;
        self.git.checkout(&ensured.branch)?;
        rlog!("Checked out {} for bean {}", ensured.branch, bean.id);
        Ok(ensured)
    }

    /// Create the lineage of branches for `bean` without touching the checkout.
    pub fn ensure_branch_refs<F>(&self, bean: &Bean, fetch: F) -> Result<EnsuredBranch>
    where
        F: FnMut(&str) -> Result<Option<Bean>>,
    {
        let chain = ancestors(bean, fetch)?;
        let mut created = Vec::new();
        let mut base = self.config.default_branch.clone();

        for ancestor in chain.iter().chain(std::iter::once(bean)) {
            let branch = ancestor.branch_name();
            if !self.git.branch_exists(&branch)? {
                rlog_debug!("creating {} from {}", branch, base);
                self.git.create_branch(&branch, &base)?;
                created.push(branch.clone());
            }
            base = branch;
        }

        Ok(EnsuredBranch {
            branch: base,
            created,
        })
    }

    /// Create the bean's branch lineage and a private worktree for it.
    pub fn prepare_worktree<F>(&self, bean: &Bean, fetch: F, path: &Path) -> Result<EnsuredBranch>
    where
        F: FnMut(&str) -> Result<Option<Bean>>,
    {
        let ensured = self.ensure_branch_refs(bean, fetch)?;
        if path.exists() {
            rlog_debug!("reusing worktree at {}", path.display());
        } else {
            self.git.add_worktree(&ensured.branch, path)?;
        }
        Ok(ensured)
    }

    /// Best-effort worktree removal; failures are logged, not returned.
    pub fn remove_worktree(&self, path: &Path) {
        if let Err(e) = self.git.remove_worktree(path) {
            rlog_warn!("failed to remove worktree {}: {}", path.display(), e);
        }
    }

    /// Merge the bean branch into its target using the type's strategy.
    ///
    /// Conflicts are rolled back and reported as [`MergeResult::Conflicts`];
    /// only unexpected git failures come back as errors.
    pub fn merge_branch(&self, bean: &Bean, message: &str) -> Result<MergeResult> {
        let source = bean.branch_name();
        if !self.git.branch_exists(&source)? {
            return Err(Error::Validation(format!("branch {} does not exist", source)));
        }
        if self.git.is_dirty()? {
            return Err(Error::DirtyWorkingTree);
        }

        let target = self.merge_target(bean)?;
        let strategy = self.merge_strategy(bean.bean_type);
        rlog!("Merging {} into {} ({:?})", source, target, strategy);
        self.git.checkout(&target)?;

        let result = match strategy {
            MergeStrategy::Merge => self.merge_commit(&source, message)?,
            MergeStrategy::Squash => self.merge_squash(&source, message)?,
        };

        match &result {
            MergeResult::Success { commit } => {
                rlog!("Merged {} into {} at {}", source, target, commit);
                if self.config.delete_after_merge {
                    if let Err(e) = self.git.delete_branch(&source) {
                        rlog_warn!("failed to delete merged branch {}: {}", source, e);
                    }
                }
            }
            MergeResult::Conflicts { files } => {
                rlog_warn!(
                    "Merge of {} into {} conflicted on {:?}; rolled back",
                    source,
                    target,
                    files
                );
            }
        }
        Ok(result)
    }

    fn merge_commit(&self, source: &str, message: &str) -> Result<MergeResult> {
        let output = self.git.merge_no_ff(source, message)?;
        if output.status.success() {
            return Ok(MergeResult::Success {
                commit: self.git.head_commit()?,
            });
        }

        if self.git.merge_in_progress()? {
            let files = self.git.unmerged_paths()?;
            if let Err(e) = self.git.abort_merge() {
                rlog_warn!("merge --abort failed ({}), resetting", e);
                self.git.reset_hard(self.git.repo_path())?;
            }
            return Ok(MergeResult::Conflicts { files });
        }

        Err(Error::GitCommand {
            command: format!("merge --no-ff {}", source),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    fn merge_squash(&self, source: &str, message: &str) -> Result<MergeResult> {
        let output = self.git.merge_squash(source)?;
        // A squash merge leaves no MERGE_HEAD; conflicts only show in the index.
        let files = self.git.unmerged_paths()?;
        if !files.is_empty() {
            self.git.reset_hard(self.git.repo_path())?;
            return Ok(MergeResult::Conflicts { files });
        }
        if !output.status.success() {
            self.git.reset_hard(self.git.repo_path())?;
            return Err(Error::GitCommand {
                command: format!("merge --squash {}", source),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let repo_path = self.git.repo_path();
        let commit = if self.git.has_staged_changes(repo_path)? {
            self.git.commit_staged(repo_path, message)?
        } else {
            rlog_debug!("squash of {} staged nothing", source);
            self.git.head_commit()?
        };
        Ok(MergeResult::Success { commit })
    }

    /// Abort a merge or rebase left behind by a crashed run.
    ///
    /// Returns whether anything had to be recovered.
    pub fn recover_git_state(&self) -> Result<bool> {
        if self.git.merge_in_progress()? {
            rlog_warn!("Found interrupted merge, aborting");
            if let Err(e) = self.git.abort_merge() {
                rlog_warn!("merge --abort failed ({}), resetting", e);
                self.git.reset_hard(self.git.repo_path())?;
            }
            return Ok(true);
        }
        if self.git.rebase_in_progress()? {
            rlog_warn!("Found interrupted rebase, aborting");
            self.git.abort_rebase()?;
            return Ok(true);
        }
        if !self.git.unmerged_paths()?.is_empty() {
            rlog_warn!("Found unmerged paths without a merge marker, resetting");
            self.git.reset_hard(self.git.repo_path())?;
            return Ok(true);
        }
        Ok(false)
    }
}
