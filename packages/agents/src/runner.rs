// ABOUTME: Shared agent runner contract and streaming plumbing
// ABOUTME: Line assembly, bounded capture, timeout handling for agent processes

use async_trait::async_trait;
use drydock_core::tail_bytes;
use drydock_sandbox::{ExecStream, Provider, ProviderError, StreamType};
use drydock_vcs::VcsError;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::connector::Connector;

/// Bound on the output kept in the execution result. The full stream is
/// persisted line-by-line through the sink, so this loses nothing durable.
pub const OUTPUT_CAPTURE_BYTES: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Tool install failed: {0}")]
    ToolInstallFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Execution timed out after {seconds} seconds")]
    ExecutionTimeout { seconds: u64 },

    #[error("Execution crashed with exit code {exit_code}")]
    ExecutionCrashed { exit_code: i64, output: String },

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("VCS error: {0}")]
    Vcs(#[from] VcsError),
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// Receives completed output lines as they are produced.
///
/// Implementations must preserve call order; they are invoked many times
/// per second during agent execution.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn append(&self, source: &str, line: &str) -> anyhow::Result<()>;
}

/// Request handed to an agent runner for one invocation
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub instruction: String,
    pub api_key: Option<String>,
    /// Remaining sandbox duration budget for this invocation
    pub timeout: Duration,
    pub resume_session_id: Option<String>,
    pub connectors: Vec<Connector>,
}

/// Outcome of one agent invocation
#[derive(Debug, Clone)]
pub struct AgentExecutionResult {
    pub success: bool,
    pub exit_code: i64,
    pub output: String,
    pub changes_detected: bool,
    /// Only variants supporting conversational resumption return one
    pub session_id: Option<String>,
}

/// Execution strategy implemented once per agent variant
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Run the agent against the sandbox workspace, streaming output into
    /// the sink as it is produced.
    async fn execute(
        &self,
        container_id: &str,
        request: &ExecutionRequest,
        sink: &dyn LogSink,
    ) -> Result<AgentExecutionResult>;
}

/// Re-assembles byte chunks into complete lines.
///
/// Chunk boundaries fall anywhere; a partial line is carried until its
/// newline arrives or the stream ends.
#[derive(Default)]
pub struct LineAssembler {
    carry: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line completed by it
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.carry.extend_from_slice(data);

        let mut lines = Vec::new();
        while let Some(pos) = self.carry.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.carry.drain(..=pos).collect();
            line.pop(); // trailing \n
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).to_string());
        }
        lines
    }

    /// Hand back the trailing partial line, if any
    pub fn flush(&mut self) -> Option<String> {
        if self.carry.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.carry).to_string();
        self.carry.clear();
        Some(line)
    }
}

pub(crate) struct StreamOutcome {
    pub exit_code: i64,
    pub output: String,
}

/// Drain a streaming exec into the sink line by line under a deadline.
///
/// `on_line` sees every completed line before it reaches the sink, so a
/// runner can sniff protocol events without buffering the whole stream.
pub(crate) async fn drain_exec(
    mut stream: ExecStream,
    sink: &dyn LogSink,
    source: &str,
    timeout: Duration,
    mut on_line: impl FnMut(&str) + Send,
) -> Result<StreamOutcome> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut assembler = LineAssembler::new();
    let mut capture = String::new();

    loop {
        let chunk = match tokio::time::timeout_at(deadline, stream.output.recv()).await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break, // stream closed
            Err(_) => {
                return Err(AgentError::ExecutionTimeout {
                    seconds: timeout.as_secs(),
                })
            }
        };

        let prefix = match chunk.stream {
            StreamType::Stdout => "",
            StreamType::Stderr => "! ",
        };

        for line in assembler.push(&chunk.data) {
            on_line(&line);
            capture.push_str(&line);
            capture.push('\n');
            if capture.len() > OUTPUT_CAPTURE_BYTES * 2 {
                capture = tail_bytes(&capture, OUTPUT_CAPTURE_BYTES);
            }
            if let Err(e) = sink.append(source, &format!("{}{}", prefix, line)).await {
                warn!("Log sink append failed: {}", e);
            }
        }
    }

    if let Some(line) = assembler.flush() {
        on_line(&line);
        capture.push_str(&line);
        capture.push('\n');
        if let Err(e) = sink.append(source, &line).await {
            warn!("Log sink append failed: {}", e);
        }
    }

    let exit_code = match tokio::time::timeout_at(deadline, stream.exit).await {
        Ok(Ok(code)) => code,
        Ok(Err(_)) => -1,
        Err(_) => {
            return Err(AgentError::ExecutionTimeout {
                seconds: timeout.as_secs(),
            })
        }
    };

    Ok(StreamOutcome {
        exit_code,
        output: tail_bytes(&capture, OUTPUT_CAPTURE_BYTES),
    })
}

/// Probe for a tool inside the sandbox and install it when absent.
///
/// Resumed sandboxes already carry the tool; the probe keeps this
/// idempotent.
pub(crate) async fn ensure_tool(
    provider: &dyn Provider,
    container_id: &str,
    tool: &str,
    install_cmd: &str,
) -> Result<()> {
    let probe = provider
        .exec_command(
            container_id,
            vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("command -v {}", tool),
            ],
            None,
        )
        .await?;

    if probe.exit_code == 0 {
        return Ok(());
    }

    let install = provider
        .exec_command(
            container_id,
            vec!["sh".to_string(), "-c".to_string(), install_cmd.to_string()],
            None,
        )
        .await?;

    if install.exit_code != 0 {
        return Err(AgentError::ToolInstallFailed(install.stderr_utf8()));
    }

    Ok(())
}

/// Single-quote a string for embedding in a shell command
pub(crate) fn shell_quote(input: &str) -> String {
    format!("'{}'", input.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_assembler_whole_lines() {
        let mut asm = LineAssembler::new();
        let lines = asm.push(b"one\ntwo\n");
        assert_eq!(lines, vec!["one", "two"]);
        assert_eq!(asm.flush(), None);
    }

    #[test]
    fn test_line_assembler_split_mid_line() {
        let mut asm = LineAssembler::new();
        assert!(asm.push(b"hel").is_empty());
        assert!(asm.push(b"lo wo").is_empty());
        let lines = asm.push(b"rld\nnext");
        assert_eq!(lines, vec!["hello world"]);
        assert_eq!(asm.flush(), Some("next".to_string()));
    }

    #[test]
    fn test_line_assembler_crlf() {
        let mut asm = LineAssembler::new();
        let lines = asm.push(b"one\r\ntwo\r\n");
        assert_eq!(lines, vec!["one", "two"]);
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }
}
