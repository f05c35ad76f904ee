//! The orchestration engine: scheduling, watching, running and landing beans.

pub mod branch;
pub mod completion;
pub mod orchestrator;
pub mod output;
pub mod prompt;
pub mod runner;
pub mod scheduler;
pub mod watcher;

pub use branch::{BranchManager, EnsuredBranch, MergeResult};
pub use completion::{commit_message, CompletionHandler, CompletionResult, Outcome};
pub use orchestrator::{
    CompletedRun, ControlCommand, Orchestrator, OrchestratorHandle, RunningAgent, RunningSummary,
    StatusSnapshot,
};
pub use output::OutputLog;
pub use prompt::{build_prompt, extract_file_paths};
pub use runner::{AgentEvent, AgentRunner, ExitResult, OutputStream};
pub use scheduler::{QueueEntry, Scheduler, SchedulerEvent};
pub use watcher::{bean_id_from_path, diff_beans, BeanCache, Watcher, WatcherEvent};
