// ABOUTME: Agent variant tags and capability table
// ABOUTME: Strategy selection by stored tag rather than inheritance

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::claude::ClaudeRunner;
use crate::codex::CodexRunner;
use crate::opencode::OpencodeRunner;
use crate::runner::AgentRunner;
use drydock_sandbox::Provider;

#[derive(Error, Debug)]
pub enum VariantError {
    #[error("Unknown agent variant: {0}")]
    Unknown(String),
}

/// Supported agent CLIs, stored as the task's agent tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentVariant {
    Claude,
    Codex,
    Opencode,
}

impl AgentVariant {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Opencode => "opencode",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, VariantError> {
        match s {
            "claude" => Ok(Self::Claude),
            "codex" => Ok(Self::Codex),
            "opencode" => Ok(Self::Opencode),
            _ => Err(VariantError::Unknown(s.to_string())),
        }
    }

    /// Whether the variant can restore a prior conversation server-side
    pub fn supports_resume(&self) -> bool {
        matches!(self, Self::Claude)
    }

    /// Whether the variant reads user-scoped MCP connector configs
    pub fn supports_connectors(&self) -> bool {
        matches!(self, Self::Claude | Self::Opencode)
    }

    /// Environment variable carrying the variant's API credential
    pub fn api_key_env(&self) -> &str {
        match self {
            Self::Claude => "ANTHROPIC_API_KEY",
            Self::Codex => "OPENAI_API_KEY",
            Self::Opencode => "OPENCODE_API_KEY",
        }
    }
}

/// Build the runner for a variant tag
pub fn runner_for(variant: AgentVariant, provider: Arc<dyn Provider>) -> Box<dyn AgentRunner> {
    match variant {
        AgentVariant::Claude => Box::new(ClaudeRunner::new(provider)),
        AgentVariant::Codex => Box::new(CodexRunner::new(provider)),
        AgentVariant::Opencode => Box::new(OpencodeRunner::new(provider)),
    }
}
