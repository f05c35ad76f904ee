use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("git {command} failed: {stderr}")]
    GitCommand { command: String, stderr: String },

    #[error("Working tree has uncommitted changes; refusing to switch branches")]
    DirtyWorkingTree,

    #[error("Bean store error: {0}")]
    Store(String),

    #[error("Bean not found: {0}")]
    BeanNotFound(String),

    #[error("Agent already running for bean {0}")]
    AgentBusy(String),

    #[error("No agent running for bean {0}")]
    AgentNotFound(String),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Orchestrator channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, Error>;
