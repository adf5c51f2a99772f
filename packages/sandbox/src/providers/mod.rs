// ABOUTME: Provider trait and implementations for sandbox execution backends
// ABOUTME: Defines abstract interface for container lifecycle and command execution

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

pub mod docker;

pub use docker::DockerProvider;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Container error: {0}")]
    ContainerError(String),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Image error: {0}")]
    ImageError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Provider not available: {0}")]
    NotAvailable(String),
}

type Result<T> = std::result::Result<T, ProviderError>;

/// Configuration for a new sandbox container
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub image: String,
    pub name: String,
    pub env_vars: HashMap<String, String>,
    pub cpu_cores: f32,
    pub memory_mb: u64,
    pub working_dir: Option<String>,
    pub labels: HashMap<String, String>,
    /// Process keeping the container alive between exec calls
    pub command: Option<Vec<String>>,
}

/// Container runtime information
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub status: ContainerStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Stopped,
    Dead,
    Error(String),
}

/// Collected result of running a command in a container
#[derive(Debug)]
pub struct ExecResult {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecResult {
    pub fn stdout_utf8(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_utf8(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }
}

/// Output chunk from a streaming exec
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub stream: StreamType,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Stdout,
    Stderr,
}

/// Incremental output from a long-running exec.
///
/// Chunks arrive in production order; `exit` resolves once with the exit
/// code after the output channel closes.
pub struct ExecStream {
    pub output: tokio::sync::mpsc::UnboundedReceiver<OutputChunk>,
    pub exit: tokio::sync::oneshot::Receiver<i64>,
}

/// Provider trait for sandbox container backends
#[async_trait]
pub trait Provider: Send + Sync {
    /// Check if the provider is available and configured correctly
    async fn is_available(&self) -> Result<bool>;

    /// Create and start a new container
    async fn create_container(&self, spec: &SandboxSpec) -> Result<String>;

    /// Stop a running container
    async fn stop_container(&self, container_id: &str, timeout_secs: u64) -> Result<()>;

    /// Remove a container; already-removed is not an error
    async fn remove_container(&self, container_id: &str, force: bool) -> Result<()>;

    /// Get container information
    async fn get_container_info(&self, container_id: &str) -> Result<ContainerInfo>;

    /// List all containers managed by this provider
    async fn list_containers(&self, include_stopped: bool) -> Result<Vec<ContainerInfo>>;

    /// Execute a command and collect its full output
    async fn exec_command(
        &self,
        container_id: &str,
        command: Vec<String>,
        env_vars: Option<HashMap<String, String>>,
    ) -> Result<ExecResult>;

    /// Execute a command, streaming its output as it is produced
    async fn exec_streaming(
        &self,
        container_id: &str,
        command: Vec<String>,
        env_vars: Option<HashMap<String, String>>,
    ) -> Result<ExecStream>;

    /// Pull an image if it doesn't exist locally
    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Check if an image exists locally
    async fn image_exists(&self, image: &str) -> Result<bool>;
}
