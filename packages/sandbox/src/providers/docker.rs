// ABOUTME: Docker provider implementation for container-based sandboxes
// ABOUTME: Uses bollard to manage isolated containers for agent execution

use super::{
    ContainerInfo, ContainerStatus, ExecResult, ExecStream, OutputChunk, Provider, ProviderError,
    Result, SandboxSpec, StreamType,
};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
        StartContainerOptions, StopContainerOptions,
    },
    exec::{CreateExecOptions, StartExecResults},
    image::CreateImageOptions,
    Docker,
};
use bollard::container::LogOutput;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct DockerProvider {
    client: Docker,
    label_prefix: String,
    /// Timeout for image pull operations
    pull_timeout: Duration,
}

impl DockerProvider {
    /// Create a new Docker provider with default pull timeout (10 minutes)
    pub fn new() -> Result<Self> {
        Self::with_pull_timeout(Duration::from_secs(600))
    }

    pub fn with_pull_timeout(timeout: Duration) -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;

        Ok(Self {
            client,
            label_prefix: "drydock.sandbox".to_string(),
            pull_timeout: timeout,
        })
    }

    /// Create with a specific Docker connection
    pub fn with_client(client: Docker) -> Self {
        Self {
            client,
            label_prefix: "drydock.sandbox".to_string(),
            pull_timeout: Duration::from_secs(600),
        }
    }

    /// Convert our spec to bollard config
    fn to_bollard_config(&self, spec: &SandboxSpec) -> Config<String> {
        let mut labels = spec.labels.clone();
        labels.insert(format!("{}.managed", self.label_prefix), "true".to_string());
        labels.insert(format!("{}.name", self.label_prefix), spec.name.clone());

        let env: Vec<String> = spec
            .env_vars
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let host_config = bollard::models::HostConfig {
            cpu_shares: Some((spec.cpu_cores * 1024.0) as i64),
            memory: Some((spec.memory_mb * 1024 * 1024) as i64),
            cap_drop: Some(vec!["ALL".to_string()]),
            privileged: Some(false),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            cmd: spec.command.clone(),
            env: Some(env),
            working_dir: spec.working_dir.clone(),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    /// Convert bollard container state to our status
    fn convert_status(state: &str) -> ContainerStatus {
        match state.to_lowercase().as_str() {
            "created" => ContainerStatus::Created,
            "running" | "restarting" => ContainerStatus::Running,
            "paused" => ContainerStatus::Paused,
            "exited" | "removing" => ContainerStatus::Stopped,
            "dead" => ContainerStatus::Dead,
            _ => ContainerStatus::Error(format!("Unknown status: {}", state)),
        }
    }

    async fn create_exec(
        &self,
        container_id: &str,
        command: Vec<String>,
        env_vars: Option<HashMap<String, String>>,
    ) -> Result<String> {
        let env: Option<Vec<String>> = env_vars.map(|vars| {
            vars.into_iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect()
        });

        let exec_config = CreateExecOptions {
            cmd: Some(command),
            env,
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(container_id, exec_config)
            .await
            .map_err(|e| ProviderError::ContainerError(e.to_string()))?;

        Ok(exec.id)
    }
}

#[async_trait]
impl Provider for DockerProvider {
    async fn is_available(&self) -> Result<bool> {
        match self.client.ping().await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("Docker not available: {}", e);
                Ok(false)
            }
        }
    }

    async fn create_container(&self, spec: &SandboxSpec) -> Result<String> {
        info!("Creating container: {}", spec.name);

        if !self.image_exists(&spec.image).await? {
            info!("Pulling image: {}", spec.image);
            self.pull_image(&spec.image).await?;
        }

        let bollard_config = self.to_bollard_config(spec);
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let container = self
            .client
            .create_container(Some(options), bollard_config)
            .await
            .map_err(|e| ProviderError::ContainerError(e.to_string()))?;

        debug!("Created container: {}", container.id);

        self.client
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| ProviderError::ContainerError(e.to_string()))?;

        Ok(container.id)
    }

    async fn stop_container(&self, container_id: &str, timeout_secs: u64) -> Result<()> {
        info!(
            "Stopping container: {} (timeout: {}s)",
            container_id, timeout_secs
        );

        let options = StopContainerOptions {
            t: timeout_secs as i64,
        };

        match self.client.stop_container(container_id, Some(options)).await {
            Ok(_) => Ok(()),
            // Already stopped is not an error
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!("Container {} already stopped", container_id);
                Ok(())
            }
            Err(e) => Err(ProviderError::ContainerError(e.to_string())),
        }
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> Result<()> {
        info!("Removing container: {} (force: {})", container_id, force);

        let options = RemoveContainerOptions {
            force,
            v: true, // Remove volumes
            ..Default::default()
        };

        match self
            .client
            .remove_container(container_id, Some(options))
            .await
        {
            Ok(_) => Ok(()),
            // Already removed is not an error; teardown must be idempotent
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!("Container {} already removed", container_id);
                Ok(())
            }
            Err(e) => Err(ProviderError::ContainerError(e.to_string())),
        }
    }

    async fn get_container_info(&self, container_id: &str) -> Result<ContainerInfo> {
        let inspect = match self.client.inspect_container(container_id, None).await {
            Ok(inspect) => inspect,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Err(ProviderError::ContainerNotFound(container_id.to_string())),
            Err(e) => return Err(ProviderError::ContainerError(e.to_string())),
        };

        let state = inspect.state.as_ref().ok_or_else(|| {
            ProviderError::ContainerError("Container has no state information".to_string())
        })?;

        let status = Self::convert_status(
            state
                .status
                .as_ref()
                .map(|s| s.as_ref())
                .unwrap_or("unknown"),
        );

        let created_at = inspect
            .created
            .as_ref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(chrono::Utc::now);

        let started_at = state
            .started_at
            .as_ref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc));

        Ok(ContainerInfo {
            id: container_id.to_string(),
            name: inspect
                .name
                .unwrap_or_else(|| container_id.to_string())
                .trim_start_matches('/')
                .to_string(),
            status,
            created_at,
            started_at,
        })
    }

    async fn list_containers(&self, include_stopped: bool) -> Result<Vec<ContainerInfo>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}.managed=true", self.label_prefix)],
        );

        let options = ListContainersOptions {
            all: include_stopped,
            filters,
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| ProviderError::ContainerError(e.to_string()))?;

        let mut container_infos = Vec::new();
        for container in containers {
            if let Some(id) = container.id {
                match self.get_container_info(&id).await {
                    Ok(info) => container_infos.push(info),
                    Err(e) => {
                        warn!("Failed to get info for container {}: {}", id, e);
                    }
                }
            }
        }

        Ok(container_infos)
    }

    async fn exec_command(
        &self,
        container_id: &str,
        command: Vec<String>,
        env_vars: Option<HashMap<String, String>>,
    ) -> Result<ExecResult> {
        debug!(
            "Executing command in container {}: {:?}",
            container_id, command
        );

        let exec_id = self.create_exec(container_id, command, env_vars).await?;

        let start_result = self
            .client
            .start_exec(&exec_id, None)
            .await
            .map_err(|e| ProviderError::ContainerError(e.to_string()))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        match start_result {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(msg) = output.next().await {
                    match msg {
                        Ok(LogOutput::StdOut { message }) => stdout.extend_from_slice(&message),
                        Ok(LogOutput::StdErr { message }) => stderr.extend_from_slice(&message),
                        Ok(LogOutput::Console { message }) => stdout.extend_from_slice(&message),
                        _ => {}
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(ProviderError::ContainerError(
                    "Exec was detached unexpectedly".to_string(),
                ))
            }
        }

        let exec_inspect = self
            .client
            .inspect_exec(&exec_id)
            .await
            .map_err(|e| ProviderError::ContainerError(e.to_string()))?;

        Ok(ExecResult {
            exit_code: exec_inspect.exit_code.unwrap_or(0),
            stdout,
            stderr,
        })
    }

    async fn exec_streaming(
        &self,
        container_id: &str,
        command: Vec<String>,
        env_vars: Option<HashMap<String, String>>,
    ) -> Result<ExecStream> {
        debug!(
            "Starting streaming exec in container {}: {:?}",
            container_id, command
        );

        let exec_id = self.create_exec(container_id, command, env_vars).await?;

        let start_result = self
            .client
            .start_exec(&exec_id, None)
            .await
            .map_err(|e| ProviderError::ContainerError(e.to_string()))?;

        let mut output = match start_result {
            StartExecResults::Attached { output, .. } => output,
            StartExecResults::Detached => {
                return Err(ProviderError::ContainerError(
                    "Exec was detached unexpectedly".to_string(),
                ))
            }
        };

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = tokio::sync::oneshot::channel();
        let client = self.client.clone();

        tokio::spawn(async move {
            while let Some(msg) = output.next().await {
                let (stream, data) = match msg {
                    Ok(LogOutput::StdOut { message }) => (StreamType::Stdout, message.to_vec()),
                    Ok(LogOutput::StdErr { message }) => (StreamType::Stderr, message.to_vec()),
                    Ok(LogOutput::Console { message }) => (StreamType::Stdout, message.to_vec()),
                    Ok(_) => continue,
                    Err(e) => {
                        error!("Error streaming exec output: {}", e);
                        break;
                    }
                };

                let chunk = OutputChunk {
                    timestamp: chrono::Utc::now(),
                    stream,
                    data,
                };

                if tx.send(chunk).is_err() {
                    break; // Receiver dropped
                }
            }

            let exit_code = match client.inspect_exec(&exec_id).await {
                Ok(inspect) => inspect.exit_code.unwrap_or(0),
                Err(e) => {
                    error!("Failed to inspect exec {}: {}", exec_id, e);
                    -1
                }
            };
            let _ = exit_tx.send(exit_code);
        });

        Ok(ExecStream {
            output: rx,
            exit: exit_rx,
        })
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!(
            "Pulling image: {} (timeout: {:?})",
            image, self.pull_timeout
        );

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let stream = self.client.create_image(Some(options), None, None);

        let result = tokio::time::timeout(self.pull_timeout, async {
            let mut stream = stream;
            while let Some(progress) = stream.next().await {
                match progress {
                    Ok(info) => {
                        if let Some(error) = info.error {
                            return Err(ProviderError::ImageError(format!(
                                "Failed to pull image {}: {}",
                                image, error
                            )));
                        }
                    }
                    Err(e) => {
                        return Err(ProviderError::ImageError(format!(
                            "Failed to pull image {}: {}",
                            image, e
                        )));
                    }
                }
            }
            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => {
                info!("Successfully pulled image: {}", image);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProviderError::ImageError(format!(
                "Timeout pulling image {} after {:?}",
                image, self.pull_timeout
            ))),
        }
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(ProviderError::ImageError(e.to_string())),
        }
    }
}
