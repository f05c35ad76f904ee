//! Agent subprocess lifecycle.
//!
//! An `AgentRunner` owns at most one agent process. It streams the process
//! output as [`AgentEvent`]s and reports how the process ended. Cancellation
//! is graceful first (SIGTERM), then forceful once the grace period runs out.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::Agent;
use crate::beans::Bean;
use crate::log::RunContext;
use crate::orchestration::prompt::build_prompt;
use crate::{rlog, rlog_debug, rlog_warn, Error, Result};

/// Default time between SIGTERM and SIGKILL.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// How long to wait for output pipes to drain after the process exits.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// How an agent process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitResult {
    /// Exit code, absent when the process died from a signal.
    pub code: Option<i32>,
    /// Terminating signal number, if any.
    pub signal: Option<i32>,
    pub duration: Duration,
}

impl ExitResult {
    fn from_status(status: std::io::Result<ExitStatus>, duration: Duration) -> Self {
        use std::os::unix::process::ExitStatusExt;
        match status {
            Ok(status) => Self {
                code: status.code(),
                signal: status.signal(),
                duration,
            },
            Err(e) => {
                rlog_warn!("failed to wait for agent process: {}", e);
                Self {
                    code: None,
                    signal: None,
                    duration,
                }
            }
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Exit code, or 128 + signal the way shells report it.
    pub fn effective_code(&self) -> i32 {
        match (self.code, self.signal) {
            (Some(code), _) => code,
            (None, Some(sig)) => 128 + sig,
            (None, None) => -1,
        }
    }
}

/// Events emitted by an agent runner.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Started {
        bean_id: String,
        run_id: Uuid,
        pid: Option<u32>,
    },
    Output {
        bean_id: String,
        run_id: Uuid,
        stream: OutputStream,
        line: String,
        at: DateTime<Utc>,
    },
    Exited {
        bean_id: String,
        run_id: Uuid,
        result: ExitResult,
    },
    /// The process never started.
    SpawnFailed {
        bean_id: String,
        run_id: Uuid,
        error: String,
    },
}

impl AgentEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            AgentEvent::Started { run_id, .. }
            | AgentEvent::Output { run_id, .. }
            | AgentEvent::Exited { run_id, .. }
            | AgentEvent::SpawnFailed { run_id, .. } => *run_id,
        }
    }

    pub fn bean_id(&self) -> &str {
        match self {
            AgentEvent::Started { bean_id, .. }
            | AgentEvent::Output { bean_id, .. }
            | AgentEvent::Exited { bean_id, .. }
            | AgentEvent::SpawnFailed { bean_id, .. } => bean_id,
        }
    }
}

struct ActiveProcess {
    ctx: RunContext,
    pid: Option<u32>,
    cancel: CancellationToken,
    exited: watch::Receiver<Option<ExitResult>>,
}

pub struct AgentRunner {
    agent: Agent,
    grace_period: Duration,
    event_tx: mpsc::UnboundedSender<AgentEvent>,
    active: Option<ActiveProcess>,
}

impl AgentRunner {
    pub fn new(agent: Agent, event_tx: mpsc::UnboundedSender<AgentEvent>) -> Self {
        Self {
            agent,
            grace_period: DEFAULT_GRACE_PERIOD,
            event_tx,
            active: None,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Whether a process started by this runner is still alive.
    pub fn is_running(&self) -> bool {
        self.active
            .as_ref()
            .map_or(false, |a| a.exited.borrow().is_none())
    }

    pub fn pid(&self) -> Option<u32> {
        self.active.as_ref().and_then(|a| a.pid)
    }

    /// Spawn the agent for `bean`.
    ///
    /// Fails with [`Error::AgentBusy`] if a previous process is still running.
    /// A process that cannot be started is reported as
    /// [`AgentEvent::SpawnFailed`], not as an error here.
    pub fn run(
        &mut self,
        ctx: RunContext,
        bean: &Bean,
        children: &[Bean],
        cwd: Option<&Path>,
    ) -> Result<()> {
        if self.is_running() {
            return Err(Error::AgentBusy(bean.id.clone()));
        }

        let prompt = build_prompt(bean, children);
        let argv = self.agent.command(&prompt);
        rlog!("{} spawning {} ({} prompt bytes)", ctx, self.agent.name(), prompt.len());

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                rlog_warn!("{} failed to spawn {}: {}", ctx, argv[0], e);
                let _ = self.event_tx.send(AgentEvent::SpawnFailed {
                    bean_id: ctx.bean_id.clone(),
                    run_id: ctx.run_id,
                    error: format!("failed to spawn {}: {}", argv[0], e),
                });
                self.active = None;
                return Ok(());
            }
        };

        let pid = child.id();
        let _ = self.event_tx.send(AgentEvent::Started {
            bean_id: ctx.bean_id.clone(),
            run_id: ctx.run_id,
            pid,
        });

        let readers: Vec<JoinHandle<()>> = [
            child.stdout.take().map(|s| self.spawn_reader(&ctx, s, OutputStream::Stdout)),
            child.stderr.take().map(|s| self.spawn_reader(&ctx, s, OutputStream::Stderr)),
        ]
        .into_iter()
        .flatten()
        .collect();

        let cancel = CancellationToken::new();
        let (exited_tx, exited_rx) = watch::channel(None);
        tokio::spawn(supervise(
            child,
            readers,
            ctx.clone(),
            cancel.clone(),
            self.grace_period,
            exited_tx,
            self.event_tx.clone(),
        ));

        self.active = Some(ActiveProcess {
            ctx,
            pid,
            cancel,
            exited: exited_rx,
        });
        Ok(())
    }

    fn spawn_reader<R>(&self, ctx: &RunContext, stream: R, kind: OutputStream) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let tx = self.event_tx.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stream);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        rlog_warn!("{} {:?} read failed: {}", ctx, kind, e);
                        break;
                    }
                }
                let line = match std::str::from_utf8(&buf) {
                    Ok(text) => text.to_string(),
                    Err(_) => {
                        rlog_debug!("{} {:?} line is not valid UTF-8", ctx, kind);
                        String::from_utf8_lossy(&buf).into_owned()
                    }
                };
                let line = line.strip_suffix('\n').unwrap_or(&line);
                let line = line.strip_suffix('\r').unwrap_or(line).to_string();
                let _ = tx.send(AgentEvent::Output {
                    bean_id: ctx.bean_id.clone(),
                    run_id: ctx.run_id,
                    stream: kind,
                    line,
                    at: Utc::now(),
                });
            }
        })
    }

    /// Stop the running process and wait until it has exited.
    pub async fn cancel(&mut self) -> Result<ExitResult> {
        let active = self
            .active
            .as_mut()
            .ok_or_else(|| Error::AgentNotFound("no active process".to_string()))?;
        rlog!("{} cancelling agent", active.ctx);
        active.cancel.cancel();
        let result = active
            .exited
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::ChannelClosed)?
            .clone();
        self.active = None;
        result.ok_or(Error::ChannelClosed)
    }

    /// Wait for the current process to exit on its own.
    pub async fn wait(&mut self) -> Result<ExitResult> {
        let active = self
            .active
            .as_mut()
            .ok_or_else(|| Error::AgentNotFound("no active process".to_string()))?;
        let result = active
            .exited
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::ChannelClosed)?
            .clone();
        result.ok_or(Error::ChannelClosed)
    }
}

async fn supervise(
    mut child: Child,
    readers: Vec<JoinHandle<()>>,
    ctx: RunContext,
    cancel: CancellationToken,
    grace_period: Duration,
    exited_tx: watch::Sender<Option<ExitResult>>,
    event_tx: mpsc::UnboundedSender<AgentEvent>,
) {
    let started = Instant::now();
    let status = tokio::select! {
        status = child.wait() => status,
        _ = cancel.cancelled() => terminate(&mut child, grace_period, &ctx).await,
    };

    // Let buffered output land before the exit event.
    let aborts: Vec<AbortHandle> = readers.iter().map(JoinHandle::abort_handle).collect();
    if tokio::time::timeout(DRAIN_TIMEOUT, join_all(readers)).await.is_err() {
        rlog_debug!("{} output readers did not drain in time, aborting them", ctx);
        for handle in aborts {
            handle.abort();
        }
    }

    let result = ExitResult::from_status(status, started.elapsed());
    rlog!(
        "{} agent exited code={:?} signal={:?} after {:?}",
        ctx,
        result.code,
        result.signal,
        result.duration
    );
    let _ = exited_tx.send(Some(result.clone()));
    let _ = event_tx.send(AgentEvent::Exited {
        bean_id: ctx.bean_id.clone(),
        run_id: ctx.run_id,
        result,
    });
}

async fn terminate(
    child: &mut Child,
    grace_period: Duration,
    ctx: &RunContext,
) -> std::io::Result<ExitStatus> {
    if let Some(pid) = child.id() {
        rlog_debug!("{} sending SIGTERM to {}", ctx, pid);
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            rlog_warn!("{} SIGTERM failed: {}", ctx, e);
        }
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            rlog_warn!("{} did not exit within {:?}, killing", ctx, grace_period);
            child.kill().await?;
            child.wait().await
        }
    }
}
