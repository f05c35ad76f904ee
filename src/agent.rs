use crate::config::{AgentBackend, AgentConfig};

/// Builds the command line for the configured coding agent.
#[derive(Debug, Clone)]
pub struct Agent {
    backend: AgentBackend,
    binary: String,
    model: Option<String>,
    flags: Vec<String>,
}

impl Agent {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            backend: config.backend,
            binary: config.effective_binary().to_string(),
            model: config.model.clone(),
            flags: config.flags.clone(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self.backend {
            AgentBackend::Claude => "Claude",
            AgentBackend::Codex => "Codex",
            AgentBackend::Custom => "Custom",
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Full argv, binary first. The prompt is always a single argument.
    pub fn command(&self, prompt: &str) -> Vec<String> {
        let mut cmd = vec![self.binary.clone()];
        match self.backend {
            AgentBackend::Claude => {
                cmd.extend(self.flags.iter().cloned());
                if let Some(model) = &self.model {
                    cmd.extend(["--model".to_string(), model.clone()]);
                }
                cmd.extend(["-p".to_string(), prompt.to_string()]);
            }
            AgentBackend::Codex => {
                cmd.push("exec".to_string());
                if let Some(model) = &self.model {
                    cmd.extend(["--model".to_string(), model.clone()]);
                }
                cmd.extend(self.flags.iter().cloned());
                cmd.push(prompt.to_string());
            }
            AgentBackend::Custom => {
                cmd.extend(self.flags.iter().cloned());
                cmd.push(prompt.to_string());
            }
        }
        cmd
    }

    pub fn is_available(&self) -> bool {
        which::which(self.binary()).is_ok()
    }
}

impl Default for Agent {
    fn default() -> Self {
        Self::from_config(&AgentConfig::default())
    }
}
