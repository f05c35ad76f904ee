//! What happens to a bean after its agent exits.
//!
//! The handler always re-reads the bean first: the agent may have tagged it
//! while it ran. A non-zero exit records a crash, a `blocked` tag records a
//! blocker, anything else completes the bean and lands its changes.

use std::path::Path;
use std::sync::Arc;

use crate::beans::{
    ancestors, Bean, BeanStatus, BeanStore, BeanType, NewBean, Priority, TAG_BLOCKED, TAG_FAILED,
};
use crate::config::{CommitStyle, MergeStrategy, OnBlockedConfig, OnCompleteConfig};
use crate::log::RunContext;
use crate::orchestration::branch::{BranchManager, MergeResult};
use crate::orchestration::output::{read_tail, log_path, CRASH_TAIL_LINES};
use crate::orchestration::runner::ExitResult;
use crate::{rlog, rlog_debug, rlog_warn, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Blocked,
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::Blocked => "blocked",
            Outcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionResult {
    pub outcome: Outcome,
    /// Commit that carries the bean's work, after merging when a merge happened.
    pub commit_sha: Option<String>,
    /// Bean that now blocks this one.
    pub blocker_id: Option<String>,
    /// Problem that did not change the outcome, such as a merge conflict.
    pub error: Option<String>,
}

impl CompletionResult {
    fn new(outcome: Outcome) -> Self {
        Self {
            outcome,
            commit_sha: None,
            blocker_id: None,
            error: None,
        }
    }
}

pub struct CompletionHandler {
    store: Arc<dyn BeanStore>,
    branches: Arc<BranchManager>,
    on_complete: OnCompleteConfig,
    on_blocked: OnBlockedConfig,
    output_dir: std::path::PathBuf,
}

impl CompletionHandler {
    pub fn new(
        store: Arc<dyn BeanStore>,
        branches: Arc<BranchManager>,
        on_complete: OnCompleteConfig,
        on_blocked: OnBlockedConfig,
        output_dir: std::path::PathBuf,
    ) -> Self {
        Self {
            store,
            branches,
            on_complete,
            on_blocked,
            output_dir,
        }
    }

    fn fetch(&self, id: &str) -> Result<Bean> {
        self.store
            .get(id)?
            .ok_or_else(|| Error::BeanNotFound(id.to_string()))
    }

    /// Classify an agent exit and apply its side effects.
    ///
    /// `worktree` is set when the bean ran in its own linked worktree.
    pub fn handle_exit(
        &self,
        ctx: &RunContext,
        exit: &ExitResult,
        worktree: Option<&Path>,
    ) -> Result<CompletionResult> {
        let bean = self.fetch(&ctx.bean_id)?;

        if !exit.success() {
            let summary = match (exit.code, exit.signal) {
                (Some(code), _) => format!("agent exited with code {}", code),
                (None, Some(signal)) => format!("agent killed by signal {}", signal),
                (None, None) => "agent exited abnormally".to_string(),
            };
            return self.record_failure(ctx, &bean, &summary);
        }
        if bean.has_tag(TAG_BLOCKED) {
            return self.handle_blocked(ctx, &bean);
        }
        self.handle_completed(ctx, &bean, worktree)
    }

    /// The agent process never started.
    pub fn handle_spawn_failure(&self, ctx: &RunContext, error: &str) -> Result<CompletionResult> {
        let bean = self.fetch(&ctx.bean_id)?;
        self.record_failure(ctx, &bean, &format!("agent failed to start: {}", error))
    }

    /// Turn a bean left in progress by a previous daemon into a failed one.
    ///
    /// Returns `None` when the bean was already recovered.
    pub fn recover_orphan(&self, bean_id: &str) -> Result<Option<CompletionResult>> {
        let bean = self.fetch(bean_id)?;
        if bean.is_stuck() {
            rlog_debug!("{} already stuck, skipping recovery", bean_id);
            return Ok(None);
        }
        let ctx = RunContext::new(bean_id);
        let summary = "bean was in progress when the previous daemon stopped";
        self.record_failure(&ctx, &bean, summary).map(Some)
    }

    fn record_failure(&self, ctx: &RunContext, bean: &Bean, summary: &str) -> Result<CompletionResult> {
        rlog_warn!("{} failed: {}", ctx, summary);
        self.store.update_tags(&bean.id, &[TAG_FAILED], &[])?;

        let tail = read_tail(&log_path(&self.output_dir, &bean.id), CRASH_TAIL_LINES);
        let mut body = format!(
            "Bean {} ({}) crashed during an agent run.\n\nReason: {}\nRun: {}\n",
            bean.id, bean.title, summary, ctx.run_id
        );
        if !tail.is_empty() {
            body.push_str(&format!("\nLast output:\n\n```\n{}\n```\n", tail));
        }
        body.push_str(&format!(
            "\nOnce fixed, clear the `{}` tag on {} to let it run again.\n",
            TAG_FAILED, bean.id
        ));

        let mut crash = NewBean::new(&format!("Crash: {}", bean.title), BeanType::Bug);
        crash.priority = Priority::High;
        crash.body = body;
        crash.parent_id = bean.parent_id.clone();
        let blocker = self.store.create(&crash)?;
        self.store.add_blocker(&bean.id, &blocker.id)?;
        rlog!("{} created crash report {}", ctx, blocker.id);

        let mut result = CompletionResult::new(Outcome::Failed);
        result.blocker_id = Some(blocker.id);
        result.error = Some(summary.to_string());
        Ok(result)
    }

    fn handle_blocked(&self, ctx: &RunContext, bean: &Bean) -> Result<CompletionResult> {
        let mut result = CompletionResult::new(Outcome::Blocked);

        for blocker_id in &bean.blocking_ids {
            if let Some(blocker) = self.store.get(blocker_id)? {
                if !blocker.status.is_terminal() {
                    rlog!("{} blocked by existing bean {}", ctx, blocker.id);
                    result.blocker_id = Some(blocker.id);
                    return Ok(result);
                }
            }
        }

        if !self.on_blocked.create_blocker_bean {
            rlog!("{} blocked with no open blocker", ctx);
            return Ok(result);
        }

        let mut unblock = NewBean::new(&format!("Unblock: {}", bean.title), BeanType::Task);
        unblock.priority = bean.priority;
        unblock.parent_id = bean.parent_id.clone();
        unblock.body = format!(
            "The agent working on {} ({}) reported it as blocked. \
             Its body should say what is missing.\n\n\
             Resolve the problem, then clear the `{}` tag on {}.\n",
            bean.id, bean.title, TAG_BLOCKED, bean.id
        );
        let blocker = self.store.create(&unblock)?;
        self.store.add_blocker(&bean.id, &blocker.id)?;
        rlog!("{} blocked, created {}", ctx, blocker.id);
        result.blocker_id = Some(blocker.id);
        Ok(result)
    }

    fn handle_completed(
        &self,
        ctx: &RunContext,
        bean: &Bean,
        worktree: Option<&Path>,
    ) -> Result<CompletionResult> {
        self.store.set_status(&bean.id, BeanStatus::Completed)?;
        rlog!("{} completed", ctx);

        let mut result = CompletionResult::new(Outcome::Completed);
        if !self.on_complete.auto_commit {
            return Ok(result);
        }

        let message = commit_message(
            bean,
            self.commit_scope(bean).as_deref(),
            self.on_complete.commit_style,
            self.on_complete.bean_trailer,
        );
        if let Err(e) = self.land(ctx, bean, worktree, &message, &mut result) {
            rlog_warn!("{} failed to land changes: {}", ctx, e);
            result.error = Some(e.to_string());
        }
        Ok(result)
    }

    /// Slug of the nearest epic above the bean, if any.
    fn commit_scope(&self, bean: &Bean) -> Option<String> {
        match ancestors(bean, |id| self.store.get(id)) {
            Ok(chain) => chain
                .iter()
                .rev()
                .find(|b| b.bean_type == BeanType::Epic)
                .map(|epic| epic.slug.clone()),
            Err(e) => {
                rlog_warn!("could not resolve ancestors of {}: {}", bean.id, e);
                None
            }
        }
    }

    /// Commit, merge into the lineage target and push, as configured.
    fn land(
        &self,
        ctx: &RunContext,
        bean: &Bean,
        worktree: Option<&Path>,
        message: &str,
        result: &mut CompletionResult,
    ) -> Result<()> {
        let git = self.branches.git();
        let dir = worktree.unwrap_or_else(|| git.repo_path());

        git.stage_all(dir)?;
        if git.has_staged_changes(dir)? {
            let sha = git.commit_staged(dir, message)?;
            rlog!("{} committed {}", ctx, sha);
            result.commit_sha = Some(sha);
        } else {
            rlog_debug!("{} nothing to commit", ctx);
        }

        let merges = worktree.is_some() || self.branches.is_enabled();
        if !merges || !git.branch_exists(&bean.branch_name())? {
            if self.on_complete.push {
                if let Some(branch) = git.current_branch()? {
                    self.push(ctx, &branch);
                }
            }
            return Ok(());
        }

        // The branch cannot be deleted after merging while a worktree holds it.
        if let Some(path) = worktree {
            self.branches.remove_worktree(path);
        }

        let merge_message = match self.branches.merge_strategy(bean.bean_type) {
            MergeStrategy::Squash => message.to_string(),
            MergeStrategy::Merge => format!("Merge {}: {}", bean.branch_name(), bean.title),
        };
        match self.branches.merge_branch(bean, &merge_message)? {
            MergeResult::Success { commit } => {
                result.commit_sha = Some(commit);
                if self.on_complete.push {
                    let target = self.branches.merge_target(bean)?;
                    self.push(ctx, &target);
                }
            }
            MergeResult::Conflicts { files } => {
                rlog_warn!(
                    "{} merge conflicted, {} left for manual resolution",
                    ctx,
                    bean.branch_name()
                );
                result.error = Some(format!("merge conflict in {}", files.join(", ")));
            }
        }
        Ok(())
    }

    fn push(&self, ctx: &RunContext, branch: &str) {
        let git = self.branches.git();
        match git.push(git.repo_path(), &self.on_complete.remote, branch) {
            Ok(()) => rlog!("{} pushed {} to {}", ctx, branch, self.on_complete.remote),
            Err(e) => rlog_warn!("{} push of {} failed: {}", ctx, branch, e),
        }
    }
}

/// Build the commit message for a finished bean.
pub fn commit_message(bean: &Bean, scope: Option<&str>, style: CommitStyle, trailer: bool) -> String {
    let mut message = match (style, scope) {
        (CommitStyle::Simple, _) => bean.title.clone(),
        (CommitStyle::Conventional, Some(scope)) if !scope.is_empty() => {
            format!("{}({}): {}", bean.bean_type.commit_type(), scope, bean.title)
        }
        (CommitStyle::Conventional, _) => format!("{}: {}", bean.bean_type.commit_type(), bean.title),
    };

    if style == CommitStyle::Conventional {
        if let Some(excerpt) = changelog_section(&bean.body).or_else(|| first_paragraph(&bean.body)) {
            message.push_str("\n\n");
            message.push_str(&excerpt);
        }
    }
    if trailer {
        message.push_str(&format!("\n\nBean: {}", bean.id));
    }
    message
}

fn is_heading(line: &str) -> bool {
    line.trim_start().starts_with('#')
}

/// Contents of a `## Changelog` section, if present and non-empty.
fn changelog_section(body: &str) -> Option<String> {
    let mut lines = body.lines();
    lines.find(|line| {
        is_heading(line) && line.trim_start_matches('#').trim().eq_ignore_ascii_case("changelog")
    })?;
    let section: Vec<&str> = lines.take_while(|line| !is_heading(line)).collect();
    let text = section.join("\n").trim().to_string();
    (!text.is_empty()).then_some(text)
}

/// First paragraph of prose, skipping headings and checklists.
fn first_paragraph(body: &str) -> Option<String> {
    body.split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .find(|p| {
            let first = p.lines().next().unwrap_or_default().trim_start();
            !is_heading(first) && !first.starts_with("- [") && !first.starts_with("```")
        })
        .map(str::to_string)
}
