// ABOUTME: Claude Code runner with session resumption and MCP connectors
// ABOUTME: Streams stream-json output and sniffs the session id from the init event

use crate::connector::mcp_servers_json;
use crate::runner::{
    drain_exec, ensure_tool, shell_quote, AgentError, AgentExecutionResult, AgentRunner,
    ExecutionRequest, LogSink, Result,
};
use async_trait::async_trait;
use drydock_core::WORKSPACE_DIR;
use drydock_sandbox::Provider;
use drydock_vcs::VcsTracker;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

const TOOL: &str = "claude";
const INSTALL_CMD: &str = "npm install -g @anthropic-ai/claude-code";
const MCP_CONFIG_PATH: &str = "/workspace/.mcp.json";

pub struct ClaudeRunner {
    provider: Arc<dyn Provider>,
    vcs: VcsTracker,
}

impl ClaudeRunner {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        let vcs = VcsTracker::new(provider.clone());
        Self { provider, vcs }
    }

    /// Pull the session id out of the stream-json init event
    fn sniff_session_id(line: &str, slot: &mut Option<String>) {
        if slot.is_some() || !line.starts_with('{') {
            return;
        }
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(line) {
            if let Some(session_id) = value.get("session_id").and_then(|v| v.as_str()) {
                *slot = Some(session_id.to_string());
            }
        }
    }
}

#[async_trait]
impl AgentRunner for ClaudeRunner {
    async fn execute(
        &self,
        container_id: &str,
        request: &ExecutionRequest,
        sink: &dyn LogSink,
    ) -> Result<AgentExecutionResult> {
        let api_key = request.api_key.as_deref().ok_or_else(|| {
            AgentError::AuthenticationFailed("no Anthropic credential configured".to_string())
        })?;

        ensure_tool(self.provider.as_ref(), container_id, TOOL, INSTALL_CMD).await?;

        if !request.connectors.is_empty() {
            let config = mcp_servers_json(&request.connectors);
            let write_config = format!(
                "printf '%s' {} > {}",
                shell_quote(&config.to_string()),
                MCP_CONFIG_PATH
            );
            let written = self
                .provider
                .exec_command(
                    container_id,
                    vec!["sh".to_string(), "-c".to_string(), write_config],
                    None,
                )
                .await?;
            if written.exit_code != 0 {
                return Err(AgentError::ToolInstallFailed(
                    "failed to write MCP config".to_string(),
                ));
            }
            debug!(
                "Wrote {} connector(s) to {}",
                request.connectors.len(),
                MCP_CONFIG_PATH
            );
        }

        let mut command = format!(
            "claude -p {} --output-format stream-json --verbose --dangerously-skip-permissions",
            shell_quote(&request.instruction)
        );
        if let Some(session) = &request.resume_session_id {
            // Server-side context restore; the prior instruction is not replayed
            command.push_str(&format!(" --resume {}", shell_quote(session)));
        }

        let env = HashMap::from([("ANTHROPIC_API_KEY".to_string(), api_key.to_string())]);

        info!("Starting claude in container {}", container_id);
        let stream = self
            .provider
            .exec_streaming(
                container_id,
                vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    format!("cd {} && {}", WORKSPACE_DIR, command),
                ],
                Some(env),
            )
            .await?;

        let mut session_id: Option<String> = None;
        let outcome = drain_exec(stream, sink, "agent", request.timeout, |line| {
            Self::sniff_session_id(line, &mut session_id)
        })
        .await?;

        if outcome.exit_code != 0 {
            return Err(AgentError::ExecutionCrashed {
                exit_code: outcome.exit_code,
                output: outcome.output,
            });
        }

        let changes_detected = self.vcs.changes_detected(container_id).await?;

        Ok(AgentExecutionResult {
            success: true,
            exit_code: outcome.exit_code,
            output: outcome.output,
            changes_detected,
            session_id,
        })
    }
}
