use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use roaster::agent::Agent;
use roaster::beans::{BeanFilter, BeanStore, BeansCli};
use roaster::config::Config;
use roaster::git::GitOps;
use roaster::orchestration::{build_prompt, BranchManager, Orchestrator, Scheduler};
use roaster::{rlog, rlog_warn, Error, Result};

/// Roaster - runs coding agents against the beans in a repository
#[derive(Parser, Debug)]
#[command(name = "roaster")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    ROASTER_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to <state_dir>/roaster.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Repository to work in
    #[arg(short = 'C', long, default_value = ".")]
    pub repo: PathBuf,

    /// Config file (defaults to .roaster.toml in the repository)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the daemon in the foreground until interrupted
    Run,

    /// Show schedulable beans in the order they would run
    Queue,

    /// Print the prompt an agent would receive for a bean
    Prompt {
        /// Bean id
        id: String,
    },

    /// Abort a merge or rebase left behind by a crashed run
    RecoverGit,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let git = GitOps::new(&cli.repo)?;
    let repo_root = git.repo_path().to_path_buf();
    let config = Config::load(&repo_root, cli.config.as_deref())?;
    roaster::log::init(&config.state_dir()?, cli.debug);
    rlog!("roaster starting in {}", repo_root.display());

    let store: Arc<dyn BeanStore> = Arc::new(BeansCli::new(&config.beans.binary, &repo_root));

    match cli.command {
        Command::Run => run_daemon(config, &repo_root, store),
        Command::Queue => run_queue(&config, store.as_ref()),
        Command::Prompt { id } => run_prompt(store.as_ref(), &id),
        Command::RecoverGit => run_recover_git(git, &config),
    }
}

fn run_daemon(config: Config, repo_root: &Path, store: Arc<dyn BeanStore>) -> Result<()> {
    let agent = Agent::from_config(&config.agent);
    if !agent.is_available() {
        return Err(Error::Validation(format!(
            "agent binary '{}' not found in PATH",
            agent.binary()
        )));
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let orchestrator = Orchestrator::new(config, repo_root, store)?;
        let handle = orchestrator.handle();

        tokio::spawn(async move {
            wait_for_signal().await;
            rlog!("Shutdown requested");
            handle.shutdown();
        });

        println!("roaster running in {} (Ctrl-C to stop)", repo_root.display());
        orchestrator.run().await
    })
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            rlog_warn!("cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

fn run_queue(config: &Config, store: &dyn BeanStore) -> Result<()> {
    let beans = store.list(&BeanFilter::all())?;
    let statuses: HashMap<String, _> = beans.iter().map(|b| (b.id.clone(), b.status)).collect();

    let (tx, _rx) = mpsc::unbounded_channel();
    let mut scheduler = Scheduler::new(config.scheduler.max_parallel, tx);
    for bean in beans {
        scheduler.enqueue(bean);
    }

    if scheduler.queue().is_empty() {
        println!("Nothing to run.");
        return Ok(());
    }
    for entry in scheduler.queue() {
        let bean = &entry.bean;
        let waiting: Vec<&str> = bean
            .blocking_ids
            .iter()
            .filter(|id| statuses.get(*id).is_some_and(|s| !s.is_terminal()))
            .map(String::as_str)
            .collect();
        let note = if waiting.is_empty() {
            String::new()
        } else {
            format!("  (waiting on {})", waiting.join(", "))
        };
        println!(
            "{:<10} {:<9} {:<12} {}{}",
            bean.priority.as_str(),
            bean.bean_type.as_str(),
            bean.id,
            bean.title,
            note
        );
    }
    Ok(())
}

fn run_prompt(store: &dyn BeanStore, id: &str) -> Result<()> {
    let bean = store
        .get(id)?
        .ok_or_else(|| Error::BeanNotFound(id.to_string()))?;
    let children = if bean.bean_type.is_review() {
        store.children(id)?
    } else {
        Vec::new()
    };
    println!("{}", build_prompt(&bean, &children));
    Ok(())
}

fn run_recover_git(git: GitOps, config: &Config) -> Result<()> {
    let branches = BranchManager::new(git, config.branch.clone());
    if branches.recover_git_state()? {
        println!("Recovered an interrupted merge or rebase.");
    } else {
        println!("Nothing to recover.");
    }
    Ok(())
}
