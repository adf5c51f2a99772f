// ABOUTME: Codex CLI runner without session resumption
// ABOUTME: Non-interactive full-auto execution with streamed plain-text output

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

const TOOL: &str = "codex";
const INSTALL_CMD: &str = "npm install -g @openai/codex";

pub struct CodexRunner {
    provider: Arc<dyn Provider>,
    vcs: VcsTracker,
}

impl CodexRunner {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        let vcs = VcsTracker::new(provider.clone());
        Self { provider, vcs }
    }
}

#[async_trait]
impl AgentRunner for CodexRunner {
    async fn execute(
        &self,
        container_id: &str,
        request: &ExecutionRequest,
        sink: &dyn LogSink,
    ) -> Result<AgentExecutionResult> {
        let api_key = request.api_key.as_deref().ok_or_else(|| {
            AgentError::AuthenticationFailed("no OpenAI credential configured".to_string())
        })?;

        ensure_tool(self.provider.as_ref(), container_id, TOOL, INSTALL_CMD).await?;

        let command = format!(
            "codex exec --full-auto --skip-git-repo-check {}",
            shell_quote(&request.instruction)
        );
        let env = HashMap::from([("OPENAI_API_KEY".to_string(), api_key.to_string())]);

        info!("Starting codex in container {}", container_id);
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
            // Codex has no conversational resumption
            session_id: None,
        })
    }
}
