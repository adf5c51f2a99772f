// ABOUTME: OpenCode runner with MCP connector support, no session resumption
// ABOUTME: Writes opencode.json config and streams run output

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
use tracing::info;

const TOOL: &str = "opencode";
const INSTALL_CMD: &str = "npm install -g opencode-ai";
const CONFIG_PATH: &str = "/workspace/opencode.json";

pub struct OpencodeRunner {
    provider: Arc<dyn Provider>,
    vcs: VcsTracker,
}

impl OpencodeRunner {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        let vcs = VcsTracker::new(provider.clone());
        Self { provider, vcs }
    }
}

#[async_trait]
impl AgentRunner for OpencodeRunner {
    async fn execute(
        &self,
        container_id: &str,
        request: &ExecutionRequest,
        sink: &dyn LogSink,
    ) -> Result<AgentExecutionResult> {
        let api_key = request.api_key.as_deref().ok_or_else(|| {
            AgentError::AuthenticationFailed("no OpenCode credential configured".to_string())
        })?;

        ensure_tool(self.provider.as_ref(), container_id, TOOL, INSTALL_CMD).await?;

        if !request.connectors.is_empty() {
            let servers = mcp_servers_json(&request.connectors);
            let config = serde_json::json!({ "mcp": servers["mcpServers"] });
            let write_config = format!(
                "printf '%s' {} > {}",
                shell_quote(&config.to_string()),
                CONFIG_PATH
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
                    "failed to write opencode config".to_string(),
                ));
            }
        }

        let command = format!("opencode run {}", shell_quote(&request.instruction));
        let env = HashMap::from([("OPENCODE_API_KEY".to_string(), api_key.to_string())]);

        info!("Starting opencode in container {}", container_id);
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

        let outcome = drain_exec(stream, sink, "agent", request.timeout, |_| {}).await?;

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
            session_id: None,
        })
    }
}
