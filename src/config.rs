use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::beans::BeanType;
use crate::{rlog_debug, Error, Result};

pub const CONFIG_FILE: &str = ".roaster.toml";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub branch: BranchConfig,
    pub on_complete: OnCompleteConfig,
    pub on_blocked: OnBlockedConfig,
    pub agent: AgentConfig,
    pub beans: BeansConfig,
    /// Logs, per-bean output and worktrees. Defaults to `~/.roaster`.
    pub state_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_parallel: usize,
    pub poll_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel: 1,
            poll_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    /// Merge commit, keeps the branch history.
    Merge,
    /// Collapse the branch into a single commit on the target.
    Squash,
}

impl MergeStrategy {
    /// Small units of work are squashed, larger ones keep their history.
    pub fn default_for(bean_type: BeanType) -> Self {
        match bean_type {
            BeanType::Task | BeanType::Bug => MergeStrategy::Squash,
            BeanType::Feature | BeanType::Epic | BeanType::Milestone => MergeStrategy::Merge,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BranchConfig {
    pub enabled: bool,
    pub delete_after_merge: bool,
    pub default_branch: String,
    /// Per-type overrides keyed by bean type name.
    pub merge_strategy: BTreeMap<String, MergeStrategy>,
}

impl Default for BranchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delete_after_merge: true,
            default_branch: "main".to_string(),
            merge_strategy: BTreeMap::new(),
        }
    }
}

impl BranchConfig {
    pub fn strategy_for(&self, bean_type: BeanType) -> MergeStrategy {
        self.merge_strategy
            .get(bean_type.as_str())
            .copied()
            .unwrap_or_else(|| MergeStrategy::default_for(bean_type))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CommitStyle {
    /// `type(scope): title` header plus body excerpt.
    #[default]
    Conventional,
    /// Bare title header.
    Simple,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OnCompleteConfig {
    pub auto_commit: bool,
    pub push: bool,
    pub remote: String,
    pub commit_style: CommitStyle,
    /// Append a `Bean: <id>` line to commit messages.
    pub bean_trailer: bool,
}

impl Default for OnCompleteConfig {
    fn default() -> Self {
        Self {
            auto_commit: true,
            push: false,
            remote: "origin".to_string(),
            commit_style: CommitStyle::Conventional,
            bean_trailer: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OnBlockedConfig {
    pub create_blocker_bean: bool,
}

impl Default for OnBlockedConfig {
    fn default() -> Self {
        Self {
            create_blocker_bean: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentBackend {
    #[default]
    Claude,
    Codex,
    /// `binary` plus `flags`, prompt appended as the last argument.
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub backend: AgentBackend,
    pub binary: Option<String>,
    pub model: Option<String>,
    pub flags: Vec<String>,
    pub grace_period_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            backend: AgentBackend::Claude,
            binary: None,
            model: None,
            flags: Vec::new(),
            grace_period_secs: 5,
        }
    }
}

impl AgentConfig {
    pub fn effective_binary(&self) -> &str {
        match (&self.binary, self.backend) {
            (Some(binary), _) => binary,
            (None, AgentBackend::Codex) => "codex",
            (None, _) => "claude",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BeansConfig {
    pub binary: String,
    /// Directory holding bean files, relative to the repository root.
    pub dir: String,
}

impl Default for BeansConfig {
    fn default() -> Self {
        Self {
            binary: "beans".to_string(),
            dir: ".beans".to_string(),
        }
    }
}

impl Config {
    /// Load `path`, or `<repo_root>/.roaster.toml` when no path is given.
    ///
    /// A missing default file yields the defaults; a missing explicit file is an error.
    pub fn load(repo_root: &Path, path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (repo_root.join(CONFIG_FILE), false),
        };
        rlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            if explicit {
                return Err(Error::Validation(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            rlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        config.validate()?;
        rlog_debug!(
            "Config loaded: max_parallel={} branching={} backend={:?}",
            config.scheduler.max_parallel,
            config.branch.enabled,
            config.agent.backend
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_parallel == 0 {
            return Err(Error::Validation(
                "scheduler.max_parallel must be at least 1".to_string(),
            ));
        }
        if self.scheduler.poll_interval_ms == 0 {
            return Err(Error::Validation(
                "scheduler.poll_interval_ms must be at least 1".to_string(),
            ));
        }
        for key in self.branch.merge_strategy.keys() {
            key.parse::<BeanType>()?;
        }
        Ok(())
    }

    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".roaster")),
        }
    }

    pub fn output_dir(&self) -> Result<PathBuf> {
        Ok(self.state_dir()?.join("output"))
    }

    pub fn worktrees_dir(&self) -> Result<PathBuf> {
        Ok(self.state_dir()?.join("worktrees"))
    }

    pub fn beans_dir(&self, repo_root: &Path) -> PathBuf {
        repo_root.join(&self.beans.dir)
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.state_dir()?, self.output_dir()?, self.worktrees_dir()?] {
            if !dir.exists() {
                rlog_debug!("Creating directory: {}", dir.display());
                fs::create_dir_all(&dir)?;
            }
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
