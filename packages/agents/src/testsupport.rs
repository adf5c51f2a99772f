// ABOUTME: Shared test doubles for agent runner tests
// ABOUTME: Scripted provider with canned streaming output and a recording sink

use crate::runner::LogSink;
use async_trait::async_trait;
use drydock_sandbox::{
    ContainerInfo, ContainerStatus, ExecResult, ExecStream, OutputChunk, Provider, ProviderError,
    SandboxSpec, StreamType,
};
use std::collections::HashMap;
use std::sync::Mutex;

/// Provider stub: records exec calls, answers probes by script, and
/// replays canned chunks for streaming execs.
pub struct StreamScript {
    /// Chunks emitted by exec_streaming, in order
    pub chunks: Vec<(StreamType, &'static str)>,
    pub exit_code: i64,
    /// Exec scripts that should fail (substring match)
    pub fail_on: Vec<&'static str>,
    /// `git status --porcelain` output served to the vcs tracker
    pub status_output: &'static str,
    pub commands: Mutex<Vec<String>>,
    pub stream_commands: Mutex<Vec<(String, Option<HashMap<String, String>>)>>,
    /// When true, exec_streaming never closes its output channel
    pub hang_stream: bool,
}

impl StreamScript {
    pub fn new(chunks: Vec<(StreamType, &'static str)>, exit_code: i64) -> Self {
        Self {
            chunks,
            exit_code,
            fail_on: Vec::new(),
            status_output: "",
            commands: Mutex::new(Vec::new()),
            stream_commands: Mutex::new(Vec::new()),
            hang_stream: false,
        }
    }

    pub fn recorded(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn streamed(&self) -> Vec<(String, Option<HashMap<String, String>>)> {
        self.stream_commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for StreamScript {
    async fn is_available(&self) -> Result<bool, ProviderError> {
        Ok(true)
    }

    async fn create_container(&self, _spec: &SandboxSpec) -> Result<String, ProviderError> {
        Ok("ctr".to_string())
    }

    async fn stop_container(
        &self,
        _container_id: &str,
        _timeout_secs: u64,
    ) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn remove_container(
        &self,
        _container_id: &str,
        _force: bool,
    ) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn get_container_info(&self, container_id: &str) -> Result<ContainerInfo, ProviderError> {
        Ok(ContainerInfo {
            id: container_id.to_string(),
            name: container_id.to_string(),
            status: ContainerStatus::Running,
            created_at: chrono::Utc::now(),
            started_at: None,
        })
    }

    async fn list_containers(
        &self,
        _include_stopped: bool,
    ) -> Result<Vec<ContainerInfo>, ProviderError> {
        Ok(vec![])
    }

    async fn exec_command(
        &self,
        _container_id: &str,
        command: Vec<String>,
        _env_vars: Option<HashMap<String, String>>,
    ) -> Result<ExecResult, ProviderError> {
        let script = command.last().cloned().unwrap_or_default();
        self.commands.lock().unwrap().push(script.clone());

        for fail in &self.fail_on {
            if script.contains(fail) {
                return Ok(ExecResult {
                    exit_code: 1,
                    stdout: vec![],
                    stderr: b"scripted failure".to_vec(),
                });
            }
        }

        let stdout = if script.contains("git status --porcelain") {
            self.status_output.as_bytes().to_vec()
        } else {
            vec![]
        };

        Ok(ExecResult {
            exit_code: 0,
            stdout,
            stderr: vec![],
        })
    }

    async fn exec_streaming(
        &self,
        _container_id: &str,
        command: Vec<String>,
        env_vars: Option<HashMap<String, String>>,
    ) -> Result<ExecStream, ProviderError> {
        let script = command.last().cloned().unwrap_or_default();
        self.stream_commands
            .lock()
            .unwrap()
            .push((script, env_vars));

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = tokio::sync::oneshot::channel();

        for (stream, data) in &self.chunks {
            let _ = tx.send(OutputChunk {
                timestamp: chrono::Utc::now(),
                stream: *stream,
                data: data.as_bytes().to_vec(),
            });
        }

        if self.hang_stream {
            // Leak the sender so the channel stays open past any deadline
            std::mem::forget(tx);
        } else {
            drop(tx);
            let _ = exit_tx.send(self.exit_code);
        }

        Ok(ExecStream {
            output: rx,
            exit: exit_rx,
        })
    }

    async fn pull_image(&self, _image: &str) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn image_exists(&self, _image: &str) -> Result<bool, ProviderError> {
        Ok(true)
    }
}

/// Sink recording appended lines in order
#[derive(Default)]
pub struct RecordingSink {
    pub lines: Mutex<Vec<String>>,
}

#[async_trait]
impl LogSink for RecordingSink {
    async fn append(&self, _source: &str, line: &str) -> anyhow::Result<()> {
        self.lines.lock().unwrap().push(line.to_string());
        Ok(())
    }
}
