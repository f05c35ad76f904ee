//! The daemon loop.
//!
//! Owns every component and routes their events. Git and store calls are
//! made from this loop one at a time, so branch operations never overlap.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::agent::Agent;
use crate::beans::{Bean, BeanStatus, BeanStore, STUCK_TAGS};
use crate::config::Config;
use crate::git::GitOps;
use crate::log::RunContext;
use crate::orchestration::branch::BranchManager;
use crate::orchestration::completion::{CompletionHandler, CompletionResult, Outcome};
use crate::orchestration::output::OutputLog;
use crate::orchestration::runner::{AgentEvent, AgentRunner, ExitResult};
use crate::orchestration::scheduler::{QueueEntry, Scheduler, SchedulerEvent};
use crate::orchestration::watcher::{Watcher, WatcherEvent};
use crate::util::blocking;
use crate::{rlog, rlog_debug, rlog_error, rlog_warn, Error, Result};

/// Output lines kept in memory per running agent.
const OUTPUT_BUFFER_LINES: usize = 200;

/// Finished runs kept for status queries.
const RECENT_LIMIT: usize = 20;

/// Requests accepted by a running orchestrator.
#[derive(Debug)]
pub enum ControlCommand {
    Pause,
    Resume,
    Cancel {
        bean_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Retry {
        bean_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Status {
        reply: oneshot::Sender<StatusSnapshot>,
    },
}

/// One agent process the orchestrator is waiting on.
pub struct RunningAgent {
    pub ctx: RunContext,
    pub started_at: DateTime<Utc>,
    pub output: VecDeque<String>,
    pub worktree_path: Option<PathBuf>,
    runner: AgentRunner,
}

impl RunningAgent {
    fn push_output(&mut self, line: String) {
        if self.output.len() == OUTPUT_BUFFER_LINES {
            self.output.pop_front();
        }
        self.output.push_back(line);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningSummary {
    pub bean_id: String,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub worktree_path: Option<PathBuf>,
    pub last_line: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedRun {
    pub bean_id: String,
    pub outcome: Outcome,
    pub commit_sha: Option<String>,
    pub blocker_id: Option<String>,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl CompletedRun {
    fn from_result(bean_id: &str, result: CompletionResult) -> Self {
        Self {
            bean_id: bean_id.to_string(),
            outcome: result.outcome,
            commit_sha: result.commit_sha,
            blocker_id: result.blocker_id,
            error: result.error,
            finished_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub paused: bool,
    pub queue: Vec<QueueEntry>,
    pub running: Vec<RunningSummary>,
    /// Most recent first.
    pub recent: Vec<CompletedRun>,
}

/// Cloneable control surface for a running [`Orchestrator`].
#[derive(Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::UnboundedSender<ControlCommand>,
    shutdown: CancellationToken,
}

impl OrchestratorHandle {
    fn send(&self, cmd: ControlCommand) -> Result<()> {
        self.tx.send(cmd).map_err(|_| Error::ChannelClosed)
    }

    pub fn pause(&self) -> Result<()> {
        self.send(ControlCommand::Pause)
    }

    pub fn resume(&self) -> Result<()> {
        self.send(ControlCommand::Resume)
    }

    pub async fn cancel(&self, bean_id: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ControlCommand::Cancel {
            bean_id: bean_id.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| Error::ChannelClosed)?
    }

    pub async fn retry(&self, bean_id: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ControlCommand::Retry {
            bean_id: bean_id.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| Error::ChannelClosed)?
    }

    pub async fn status(&self) -> Result<StatusSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(ControlCommand::Status { reply })?;
        rx.await.map_err(|_| Error::ChannelClosed)
    }

    /// Ask the loop to stop. Running agents are cancelled and their beans go back to todo.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

pub struct Orchestrator {
    repo_root: PathBuf,
    poll_interval: Duration,
    grace_period: Duration,
    parallel: bool,
    worktrees_dir: PathBuf,
    store: Arc<dyn BeanStore>,
    branches: Arc<BranchManager>,
    completion: Arc<CompletionHandler>,
    agent: Agent,
    scheduler: Scheduler,
    watcher: Watcher,
    output: OutputLog,
    running: HashMap<String, RunningAgent>,
    recent: VecDeque<CompletedRun>,
    scheduler_rx: mpsc::UnboundedReceiver<SchedulerEvent>,
    watcher_rx: mpsc::UnboundedReceiver<WatcherEvent>,
    agent_tx: mpsc::UnboundedSender<AgentEvent>,
    agent_rx: mpsc::UnboundedReceiver<AgentEvent>,
    control_tx: mpsc::UnboundedSender<ControlCommand>,
    control_rx: mpsc::UnboundedReceiver<ControlCommand>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(config: Config, repo_root: &Path, store: Arc<dyn BeanStore>) -> Result<Self> {
        config.validate()?;
        config.ensure_dirs()?;

        let git = GitOps::new(repo_root)?;
        let repo_root = git.repo_path().to_path_buf();
        let branches = Arc::new(BranchManager::new(git, config.branch.clone()));
        let output_dir = config.output_dir()?;
        let completion = Arc::new(CompletionHandler::new(
            store.clone(),
            branches.clone(),
            config.on_complete.clone(),
            config.on_blocked.clone(),
            output_dir.clone(),
        ));

        let (scheduler_tx, scheduler_rx) = mpsc::unbounded_channel();
        let (watcher_tx, watcher_rx) = mpsc::unbounded_channel();
        let (agent_tx, agent_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let max_parallel = config.scheduler.max_parallel;
        Ok(Self {
            poll_interval: Duration::from_millis(config.scheduler.poll_interval_ms),
            grace_period: Duration::from_secs(config.agent.grace_period_secs),
            parallel: max_parallel > 1,
            worktrees_dir: config.worktrees_dir()?,
            watcher: Watcher::new(store.clone(), config.beans_dir(&repo_root), watcher_tx),
            repo_root,
            store,
            branches,
            completion,
            agent: Agent::from_config(&config.agent),
            scheduler: Scheduler::new(max_parallel, scheduler_tx),
            output: OutputLog::new(output_dir),
            running: HashMap::new(),
            recent: VecDeque::new(),
            scheduler_rx,
            watcher_rx,
            agent_tx,
            agent_rx,
            control_tx,
            control_rx,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn handle(&self) -> OrchestratorHandle {
        OrchestratorHandle {
            tx: self.control_tx.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Recover, then process events until shut down.
    pub async fn run(mut self) -> Result<()> {
        self.startup().await?;

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(cmd) = self.control_rx.recv() => self.handle_control(cmd).await,
                Some(event) = self.agent_rx.recv() => self.handle_agent_event(event).await,
                Some(event) = self.watcher_rx.recv() => self.handle_watcher_event(event),
                Some(SchedulerEvent::Ready(bean)) = self.scheduler_rx.recv() => self.start_bean(bean).await,
                _ = interval.tick() => self.tick(),
            }
        }

        self.stop_all().await;
        self.watcher.stop().await;
        rlog!("Orchestrator stopped");
        Ok(())
    }

    async fn startup(&mut self) -> Result<()> {
        let branches = self.branches.clone();
        if blocking(move || branches.recover_git_state()).await? {
            rlog_warn!("Recovered interrupted git operation from a previous run");
        }

        self.watcher.start().await?;

        let (stuck, orphans): (Vec<Bean>, Vec<Bean>) = self
            .watcher
            .cache()
            .snapshot()
            .into_iter()
            .filter(|b| b.status == BeanStatus::InProgress && !self.running.contains_key(&b.id))
            .partition(Bean::is_stuck);
        // Blocked or already failed work stays in progress without a new crash report.
        for bean in stuck {
            rlog_debug!("{} left in progress but stuck, not recovering", bean.id);
            self.scheduler.mark_stuck(&bean.id, "stuck before restart");
        }
        for id in orphans.into_iter().map(|b| b.id) {
            let completion = self.completion.clone();
            let bean_id = id.clone();
            match blocking(move || completion.recover_orphan(&bean_id)).await {
                Ok(Some(result)) => {
                    rlog_warn!("Recovered orphaned bean {} (blocker {:?})", id, result.blocker_id);
                    self.sync(&id, &result).await;
                }
                Ok(None) => {}
                Err(e) => rlog_error!("Failed to recover orphaned bean {}: {}", id, e),
            }
            self.scheduler.mark_stuck(&id, "orphaned");
        }

        for bean in self.watcher.cache().snapshot() {
            self.consider(bean);
        }
        rlog!(
            "Orchestrator started: {} beans, {} queued, max_parallel={}",
            self.watcher.cache().len(),
            self.scheduler.queue().len(),
            self.scheduler.max_parallel()
        );
        self.tick();
        Ok(())
    }

    fn tick(&mut self) {
        let cache = self.watcher.cache().clone();
        self.scheduler.tick(|id| cache.status_of(id));
    }

    /// Queue a bean if it can run now. Epics and milestones wait for their children.
    fn consider(&mut self, bean: Bean) {
        if self.running.contains_key(&bean.id) {
            return;
        }
        if bean.bean_type.is_review() && self.has_open_children(&bean.id) {
            self.scheduler.dequeue(&bean.id);
            return;
        }
        self.scheduler.enqueue(bean);
    }

    fn has_open_children(&self, id: &str) -> bool {
        self.watcher
            .cache()
            .snapshot()
            .iter()
            .any(|b| b.parent_id.as_deref() == Some(id) && !b.status.is_terminal())
    }

    fn handle_watcher_event(&mut self, event: WatcherEvent) {
        rlog_debug!("watcher: {:?}", event);
        let id = event.bean_id().to_string();
        match event {
            WatcherEvent::Created(bean) => self.consider(bean),
            WatcherEvent::Updated { new, .. } => self.consider(*new),
            WatcherEvent::Deleted(_) => {
                self.scheduler.dequeue(&id);
            }
            WatcherEvent::StatusChanged { .. } => {}
            WatcherEvent::TagsChanged { removed, .. } => {
                // A stuck tag removed by hand counts as a retry.
                if removed.iter().any(|t| STUCK_TAGS.contains(&t.as_str())) {
                    if let Some(bean) = self.watcher.cache().get(&id) {
                        if !bean.is_stuck() && self.scheduler.clear_stuck(&id) {
                            rlog!("{} unstuck externally", id);
                            self.consider(bean);
                        }
                    }
                }
            }
        }

        // A finished child may release its epic.
        if let Some(bean) = self.watcher.cache().get(&id) {
            if bean.status.is_terminal() {
                if let Some(parent) = bean.parent_id.and_then(|p| self.watcher.cache().get(&p)) {
                    self.consider(parent);
                }
            }
        }
        self.tick();
    }

    async fn start_bean(&mut self, bean: Bean) {
        let id = bean.id.clone();
        let ctx = RunContext::new(&id);

        let store = self.store.clone();
        let bean_id = id.clone();
        let bean = match blocking(move || store.get(&bean_id)).await {
            Ok(Some(bean)) if bean.status.is_workable() && !bean.is_stuck() => bean,
            Ok(_) => {
                rlog_debug!("{} no longer runnable, skipping", ctx);
                self.scheduler.mark_complete(&id);
                self.tick();
                return;
            }
            Err(e) => {
                rlog_error!("{} could not fetch bean: {}", ctx, e);
                self.scheduler.mark_complete(&id);
                return;
            }
        };

        if let Err(e) = self.launch(&ctx, bean).await {
            rlog_error!("{} could not start: {}", ctx, e);
            self.scheduler.mark_complete(&id);
            self.scheduler.mark_stuck(&id, &e.to_string());
            let store = self.store.clone();
            let bean_id = id.clone();
            if let Err(e) = blocking(move || store.set_status(&bean_id, BeanStatus::Todo)).await {
                rlog_warn!("{} could not revert status: {}", ctx, e);
            }
        }
        self.refresh(&id).await;
    }

    async fn launch(&mut self, ctx: &RunContext, bean: Bean) -> Result<()> {
        let store = self.store.clone();
        let bean_id = bean.id.clone();
        blocking(move || store.set_status(&bean_id, BeanStatus::InProgress)).await?;

        let worktree = self.parallel.then(|| self.worktrees_dir.join(&bean.id));
        if let Some(path) = worktree.clone() {
            let (branches, store, b) = (self.branches.clone(), self.store.clone(), bean.clone());
            let ensured = blocking(move || branches.prepare_worktree(&b, |id| store.get(id), &path)).await?;
            rlog!("{} working in worktree on {}", ctx, ensured.branch);
        } else if self.branches.is_enabled() {
            let (branches, store, b) = (self.branches.clone(), self.store.clone(), bean.clone());
            let ensured = blocking(move || branches.ensure_branch(&b, |id| store.get(id))).await?;
            rlog!("{} working on {}", ctx, ensured.branch);
        }

        self.output.truncate(&bean.id)?;

        let children = if bean.bean_type.is_review() {
            let store = self.store.clone();
            let bean_id = bean.id.clone();
            blocking(move || store.children(&bean_id)).await?
        } else {
            Vec::new()
        };

        let mut runner = AgentRunner::new(self.agent.clone(), self.agent_tx.clone())
            .with_grace_period(self.grace_period);
        let cwd = worktree.as_deref().unwrap_or(&self.repo_root);
        runner.run(ctx.clone(), &bean, &children, Some(cwd))?;

        self.running.insert(
            bean.id.clone(),
            RunningAgent {
                ctx: ctx.clone(),
                started_at: Utc::now(),
                output: VecDeque::new(),
                worktree_path: worktree,
                runner,
            },
        );
        Ok(())
    }

    fn is_current(&self, event: &AgentEvent) -> bool {
        self.running
            .get(event.bean_id())
            .is_some_and(|agent| agent.ctx.run_id == event.run_id())
    }

    async fn handle_agent_event(&mut self, event: AgentEvent) {
        if !self.is_current(&event) {
            rlog_debug!("dropping event from stale run {}", event.run_id());
            return;
        }
        match event {
            AgentEvent::Started { bean_id, pid, .. } => {
                rlog_debug!("{} agent pid {:?}", bean_id, pid);
            }
            AgentEvent::Output { bean_id, line, .. } => {
                if let Err(e) = self.output.append(&bean_id, &line) {
                    rlog_warn!("failed to persist output for {}: {}", bean_id, e);
                }
                if let Some(agent) = self.running.get_mut(&bean_id) {
                    agent.push_output(line);
                }
            }
            AgentEvent::Exited { bean_id, result, .. } => {
                self.finish(&bean_id, Finish::Exited(result)).await;
            }
            AgentEvent::SpawnFailed { bean_id, error, .. } => {
                self.finish(&bean_id, Finish::SpawnFailed(error)).await;
            }
        }
    }

    async fn finish(&mut self, bean_id: &str, finish: Finish) {
        let Some(agent) = self.running.remove(bean_id) else {
            return;
        };
        self.output.close(bean_id);

        let completion = self.completion.clone();
        let ctx = agent.ctx.clone();
        let worktree = agent.worktree_path.clone();
        let outcome = blocking(move || match finish {
            Finish::Exited(exit) => completion.handle_exit(&ctx, &exit, worktree.as_deref()),
            Finish::SpawnFailed(error) => completion.handle_spawn_failure(&ctx, &error),
        })
        .await;
        self.scheduler.mark_complete(bean_id);

        match outcome {
            Ok(result) => {
                rlog!("{} finished: {}", agent.ctx, result.outcome.as_str());
                match result.outcome {
                    Outcome::Failed => self.scheduler.mark_stuck(bean_id, "failed"),
                    Outcome::Blocked => self.scheduler.mark_stuck(bean_id, "blocked"),
                    Outcome::Completed => {}
                }
                self.sync(bean_id, &result).await;
                self.remember(CompletedRun::from_result(bean_id, result));
            }
            Err(e) => {
                rlog_error!("{} completion handling failed: {}", agent.ctx, e);
                self.scheduler.mark_stuck(bean_id, &e.to_string());
                self.refresh(bean_id).await;
                self.remember(CompletedRun {
                    bean_id: bean_id.to_string(),
                    outcome: Outcome::Failed,
                    commit_sha: None,
                    blocker_id: None,
                    error: Some(e.to_string()),
                    finished_at: Utc::now(),
                });
            }
        }
        self.tick();
    }

    /// Pull the bean and any new blocker into the cache right away.
    async fn sync(&mut self, bean_id: &str, result: &CompletionResult) {
        for id in std::iter::once(bean_id).chain(result.blocker_id.as_deref()) {
            self.refresh(id).await;
        }
    }

    async fn refresh(&mut self, bean_id: &str) {
        if let Err(e) = self.watcher.refresh(bean_id).await {
            rlog_warn!("failed to refresh {}: {}", bean_id, e);
        }
    }

    fn remember(&mut self, run: CompletedRun) {
        if self.recent.len() == RECENT_LIMIT {
            self.recent.pop_back();
        }
        self.recent.push_front(run);
    }

    async fn handle_control(&mut self, cmd: ControlCommand) {
        match cmd {
            ControlCommand::Pause => {
                rlog!("Scheduler paused");
                self.scheduler.pause();
            }
            ControlCommand::Resume => {
                rlog!("Scheduler resumed");
                self.scheduler.resume();
                self.tick();
            }
            ControlCommand::Cancel { bean_id, reply } => {
                let result = self.cancel(&bean_id).await;
                let _ = reply.send(result);
            }
            ControlCommand::Retry { bean_id, reply } => {
                let result = self.retry(&bean_id).await;
                let _ = reply.send(result);
            }
            ControlCommand::Status { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    /// Stop a run on request. This is not a failure: no tags, no crash report.
    async fn cancel(&mut self, bean_id: &str) -> Result<()> {
        let agent = self
            .running
            .remove(bean_id)
            .ok_or_else(|| Error::AgentNotFound(bean_id.to_string()))?;
        self.stop_agent(agent).await;
        self.scheduler.dequeue(bean_id);
        // Held back until retried, otherwise the todo status would requeue it at once.
        self.scheduler.mark_stuck(bean_id, "cancelled");
        self.refresh(bean_id).await;
        self.tick();
        Ok(())
    }

    async fn stop_agent(&mut self, mut agent: RunningAgent) {
        let id = agent.ctx.bean_id.clone();
        match agent.runner.cancel().await {
            Ok(exit) => rlog!("{} cancelled after {:?}", agent.ctx, exit.duration),
            Err(e) => rlog_warn!("{} cancel: {}", agent.ctx, e),
        }
        self.output.close(&id);
        self.scheduler.mark_complete(&id);

        let store = self.store.clone();
        if let Err(e) = blocking(move || store.set_status(&id, BeanStatus::Todo)).await {
            rlog_error!("{} could not revert status: {}", agent.ctx, e);
        }
    }

    /// Clear stuck state and put the bean at the front of its tier.
    async fn retry(&mut self, bean_id: &str) -> Result<()> {
        if self.running.contains_key(bean_id) {
            return Err(Error::AgentBusy(bean_id.to_string()));
        }
        let store = self.store.clone();
        let id = bean_id.to_string();
        let bean = blocking(move || {
            store.update_tags(&id, &[], &STUCK_TAGS)?;
            store.get(&id)?.ok_or(Error::BeanNotFound(id))
        })
        .await?;
        self.scheduler.clear_stuck(bean_id);
        if !self.scheduler.enqueue_front(bean) {
            rlog_debug!("retry of {} did not queue it", bean_id);
        }
        rlog!("Retrying {}", bean_id);
        self.refresh(bean_id).await;
        self.tick();
        Ok(())
    }

    fn snapshot(&self) -> StatusSnapshot {
        let mut running: Vec<RunningSummary> = self
            .running
            .values()
            .map(|agent| RunningSummary {
                bean_id: agent.ctx.bean_id.clone(),
                run_id: agent.ctx.run_id.to_string(),
                started_at: agent.started_at,
                worktree_path: agent.worktree_path.clone(),
                last_line: agent.output.back().cloned(),
            })
            .collect();
        running.sort_by(|a, b| a.started_at.cmp(&b.started_at));

        StatusSnapshot {
            paused: self.scheduler.is_paused(),
            queue: self.scheduler.queue().to_vec(),
            running,
            recent: self.recent.iter().cloned().collect(),
        }
    }

    async fn stop_all(&mut self) {
        let ids: Vec<String> = self.running.keys().cloned().collect();
        for id in ids {
            if let Some(agent) = self.running.remove(&id) {
                rlog!("{} stopping for shutdown", agent.ctx);
                self.stop_agent(agent).await;
            }
        }
    }
}

enum Finish {
    Exited(ExitResult),
    SpawnFailed(String),
}
