// ABOUTME: Sandbox provisioning orchestration from repository to ready workspace
// ABOUTME: Handles clone, dependency install detection, git identity, and abort cleanup

use crate::providers::{Provider, ProviderError, SandboxSpec};
use crate::storage::{SandboxHandle, SandboxStatus, SandboxStorage, StorageError};
use chrono::{Duration, Utc};
use drydock_core::{redact_secrets, AuthorIdentity, RepoRef, WORKSPACE_DIR};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Clone failed: {0}")]
    CloneFailed(String),

    #[error("Dependency install failed: {0}")]
    DependencyInstallFailed(String),

    #[error("Credential invalid: {0}")]
    CredentialInvalid(String),

    #[error("Environment unavailable: {0}")]
    EnvironmentUnavailable(String),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, ProvisionError>;

/// Request to provision (or resume) a sandbox for a task
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub task_id: String,
    pub repo: RepoRef,
    /// The caller's own source-control token; held in memory only
    pub git_token: String,
    pub author: AuthorIdentity,
    pub branch: String,
    pub keep_alive: bool,
    pub max_duration: Duration,
    pub image: Option<String>,
    /// Existing sandbox to reuse for a follow-up, when still valid
    pub resume_sandbox_id: Option<String>,
}

/// Dependency installer resolved from lock-file signatures.
///
/// Ordered by specificity: a lock file beats a bare manifest.
const INSTALLERS: &[(&str, &str)] = &[
    ("pnpm-lock.yaml", "pnpm install --frozen-lockfile"),
    ("yarn.lock", "yarn install --frozen-lockfile"),
    ("bun.lockb", "bun install"),
    ("package-lock.json", "npm ci"),
    ("poetry.lock", "poetry install --no-root"),
    ("uv.lock", "uv sync"),
    ("requirements.txt", "pip install -r requirements.txt"),
    ("Cargo.toml", "cargo fetch"),
];

/// Pick the dependency install command for a workspace file listing
pub fn detect_installer(listing: &[&str]) -> Option<&'static str> {
    for (signature, command) in INSTALLERS {
        if listing.contains(signature) {
            return Some(command);
        }
    }
    None
}

/// Provisions isolated execution environments for tasks
pub struct Provisioner {
    provider: Arc<dyn Provider>,
    storage: Arc<SandboxStorage>,
    provider_name: String,
    default_image: String,
}

impl Provisioner {
    pub fn new(
        provider: Arc<dyn Provider>,
        storage: Arc<SandboxStorage>,
        provider_name: String,
        default_image: String,
    ) -> Self {
        Self {
            provider,
            storage,
            provider_name,
            default_image,
        }
    }

    /// Provision a sandbox for a task, reusing a still-valid resume handle
    /// when one is supplied.
    pub async fn provision(&self, request: ProvisionRequest) -> Result<SandboxHandle> {
        if request.git_token.trim().is_empty() {
            return Err(ProvisionError::CredentialInvalid(
                "missing source-control token".to_string(),
            ));
        }

        if let Some(resume_id) = &request.resume_sandbox_id {
            if let Some(handle) = self.try_resume(resume_id, &request).await? {
                info!(
                    "Reusing sandbox {} for task {}",
                    handle.id, request.task_id
                );
                return Ok(handle);
            }
            debug!(
                "Resume handle {} no longer valid, provisioning fresh",
                resume_id
            );
        }

        self.provision_fresh(request).await
    }

    /// Validate a resume handle: owned by this task, not expired, not torn
    /// down, container still running.
    async fn try_resume(
        &self,
        resume_id: &str,
        request: &ProvisionRequest,
    ) -> Result<Option<SandboxHandle>> {
        let handle = match self.storage.get_sandbox(resume_id).await {
            Ok(handle) => handle,
            Err(StorageError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if handle.task_id != request.task_id
            || handle.is_terminated()
            || handle.is_expired(Utc::now())
        {
            return Ok(None);
        }

        let container_id = match &handle.container_id {
            Some(id) => id,
            None => return Ok(None),
        };

        match self.provider.get_container_info(container_id).await {
            Ok(info) if info.status == crate::providers::ContainerStatus::Running => {
                // Reset the idle countdown for the follow-up
                self.storage
                    .touch(&handle.id, Utc::now() + request.max_duration)
                    .await?;
                self.storage.get_sandbox(&handle.id).await.map(Some).map_err(Into::into)
            }
            Ok(_) | Err(ProviderError::ContainerNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn provision_fresh(&self, request: ProvisionRequest) -> Result<SandboxHandle> {
        if !self.provider.is_available().await? {
            return Err(ProvisionError::EnvironmentUnavailable(
                "sandbox provider is not reachable".to_string(),
            ));
        }

        let now = Utc::now();
        let handle = self
            .storage
            .create_sandbox(SandboxHandle {
                id: String::new(),
                task_id: request.task_id.clone(),
                provider: self.provider_name.clone(),
                container_id: None,
                status: SandboxStatus::Creating,
                keep_alive: request.keep_alive,
                created_at: now,
                expires_at: now + request.max_duration,
                terminated_at: None,
                error_message: None,
            })
            .await?;

        let mut labels = HashMap::new();
        labels.insert("drydock.task_id".to_string(), request.task_id.clone());

        let spec = SandboxSpec {
            image: request
                .image
                .clone()
                .unwrap_or_else(|| self.default_image.clone()),
            name: handle.id.clone(),
            env_vars: HashMap::new(),
            cpu_cores: 2.0,
            memory_mb: 2048,
            working_dir: Some(WORKSPACE_DIR.to_string()),
            labels,
            command: Some(vec!["sleep".to_string(), "infinity".to_string()]),
        };

        let container_id = match self.provider.create_container(&spec).await {
            Ok(id) => id,
            Err(e) => {
                self.storage
                    .update_sandbox_status(&handle.id, SandboxStatus::Error, Some(e.to_string()))
                    .await?;
                return Err(ProvisionError::EnvironmentUnavailable(e.to_string()));
            }
        };
        self.storage.set_container(&handle.id, &container_id).await?;

        // Everything after container creation must clean up on failure so
        // no partially-provisioned sandbox leaks.
        match self.setup_workspace(&container_id, &request).await {
            Ok(()) => {
                self.storage
                    .update_sandbox_status(&handle.id, SandboxStatus::Running, None)
                    .await?;
                let handle = self.storage.get_sandbox(&handle.id).await?;
                info!(
                    "Provisioned sandbox {} for task {}",
                    handle.id, request.task_id
                );
                Ok(handle)
            }
            Err(e) => {
                warn!(
                    "Provisioning failed for task {}, releasing container {}",
                    request.task_id, container_id
                );
                if let Err(remove_err) = self.provider.remove_container(&container_id, true).await {
                    warn!(
                        "Failed to remove container {} after aborted provisioning: {}",
                        container_id, remove_err
                    );
                }
                self.storage
                    .update_sandbox_status(
                        &handle.id,
                        SandboxStatus::Error,
                        Some(redact_secrets(&e.to_string())),
                    )
                    .await?;
                Err(e)
            }
        }
    }

    /// Clone the repository, install dependencies, configure git identity,
    /// and check out the working branch.
    async fn setup_workspace(&self, container_id: &str, request: &ProvisionRequest) -> Result<()> {
        let clone_url = request.repo.authenticated_url(&request.git_token);

        let clone = self
            .run_shell(container_id, &format!("git clone {} {}", clone_url, WORKSPACE_DIR))
            .await?;
        if clone.exit_code != 0 {
            let stderr = redact_secrets(&clone.stderr_utf8());
            if stderr.contains("Authentication failed")
                || stderr.contains("401")
                || stderr.contains("403")
            {
                return Err(ProvisionError::CredentialInvalid(stderr));
            }
            return Err(ProvisionError::CloneFailed(stderr));
        }

        // Lock-file signature detection drives the install step
        let listing = self
            .run_in_workspace(container_id, "ls -1")
            .await?;
        if listing.exit_code != 0 {
            return Err(ProvisionError::CloneFailed(
                "workspace listing failed after clone".to_string(),
            ));
        }
        let stdout = listing.stdout_utf8();
        let files: Vec<&str> = stdout.lines().map(str::trim).collect();

        if let Some(install_cmd) = detect_installer(&files) {
            debug!("Installing dependencies with: {}", install_cmd);
            let install = self.run_in_workspace(container_id, install_cmd).await?;
            if install.exit_code != 0 {
                return Err(ProvisionError::DependencyInstallFailed(redact_secrets(
                    &install.stderr_utf8(),
                )));
            }
        } else {
            debug!("No dependency signature found, skipping install");
        }

        // The clone URL carried the token; the persisted remote must not
        let reset_remote_cmd = format!("git remote set-url origin {}", request.repo.https_url());
        let reset_remote = self.run_in_workspace(container_id, &reset_remote_cmd);
        if reset_remote.await?.exit_code != 0 {
            return Err(ProvisionError::CloneFailed(
                "failed to reset origin remote".to_string(),
            ));
        }

        let identity = format!(
            "git config user.name '{}' && git config user.email '{}'",
            request.author.name, request.author.email
        );
        let configured = self.run_in_workspace(container_id, &identity).await?;
        if configured.exit_code != 0 {
            return Err(ProvisionError::CloneFailed(
                "failed to configure commit identity".to_string(),
            ));
        }

        // Branch may still be a placeholder; vcs supports a later rename
        let checkout = self
            .run_in_workspace(container_id, &format!("git checkout -B {}", request.branch))
            .await?;
        if checkout.exit_code != 0 {
            return Err(ProvisionError::CloneFailed(redact_secrets(
                &checkout.stderr_utf8(),
            )));
        }

        Ok(())
    }

    async fn run_shell(
        &self,
        container_id: &str,
        script: &str,
    ) -> Result<crate::providers::ExecResult> {
        self.provider
            .exec_command(
                container_id,
                vec!["sh".to_string(), "-c".to_string(), script.to_string()],
                None,
            )
            .await
            .map_err(Into::into)
    }

    async fn run_in_workspace(
        &self,
        container_id: &str,
        script: &str,
    ) -> Result<crate::providers::ExecResult> {
        self.run_shell(container_id, &format!("cd {} && {}", WORKSPACE_DIR, script))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ContainerInfo, ContainerStatus, ExecResult, ExecStream, SandboxSpec};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Scripted provider: records every shell command, serves a canned
    /// workspace listing, and optionally fails commands by substring.
    struct ScriptedProvider {
        commands: Mutex<Vec<String>>,
        listing: String,
        fail_on: Option<String>,
        removed: Mutex<Vec<String>>,
        running_containers: Mutex<Vec<String>>,
    }

    impl ScriptedProvider {
        fn new(listing: &str) -> Self {
            Self {
                commands: Mutex::new(Vec::new()),
                listing: listing.to_string(),
                fail_on: None,
                removed: Mutex::new(Vec::new()),
                running_containers: Mutex::new(Vec::new()),
            }
        }

        fn failing_on(listing: &str, fail_on: &str) -> Self {
            Self {
                fail_on: Some(fail_on.to_string()),
                ..Self::new(listing)
            }
        }

        fn recorded(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        async fn is_available(&self) -> std::result::Result<bool, ProviderError> {
            Ok(true)
        }

        async fn create_container(
            &self,
            spec: &SandboxSpec,
        ) -> std::result::Result<String, ProviderError> {
            let id = format!("ctr-{}", spec.name);
            self.running_containers.lock().unwrap().push(id.clone());
            Ok(id)
        }

        async fn stop_container(
            &self,
            _container_id: &str,
            _timeout_secs: u64,
        ) -> std::result::Result<(), ProviderError> {
            Ok(())
        }

        async fn remove_container(
            &self,
            container_id: &str,
            _force: bool,
        ) -> std::result::Result<(), ProviderError> {
            self.removed.lock().unwrap().push(container_id.to_string());
            self.running_containers
                .lock()
                .unwrap()
                .retain(|c| c != container_id);
            Ok(())
        }

        async fn get_container_info(
            &self,
            container_id: &str,
        ) -> std::result::Result<ContainerInfo, ProviderError> {
            if !self
                .running_containers
                .lock()
                .unwrap()
                .contains(&container_id.to_string())
            {
                return Err(ProviderError::ContainerNotFound(container_id.to_string()));
            }
            Ok(ContainerInfo {
                id: container_id.to_string(),
                name: container_id.to_string(),
                status: ContainerStatus::Running,
                created_at: Utc::now(),
                started_at: Some(Utc::now()),
            })
        }

        async fn list_containers(
            &self,
            _include_stopped: bool,
        ) -> std::result::Result<Vec<ContainerInfo>, ProviderError> {
            Ok(vec![])
        }

        async fn exec_command(
            &self,
            _container_id: &str,
            command: Vec<String>,
            _env_vars: Option<std::collections::HashMap<String, String>>,
        ) -> std::result::Result<ExecResult, ProviderError> {
            let script = command.last().cloned().unwrap_or_default();
            self.commands.lock().unwrap().push(script.clone());

            if let Some(fail) = &self.fail_on {
                if script.contains(fail.as_str()) {
                    return Ok(ExecResult {
                        exit_code: 1,
                        stdout: vec![],
                        stderr: b"scripted failure".to_vec(),
                    });
                }
            }

            let stdout = if script.contains("ls -1") {
                self.listing.clone().into_bytes()
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
            _command: Vec<String>,
            _env_vars: Option<std::collections::HashMap<String, String>>,
        ) -> std::result::Result<ExecStream, ProviderError> {
            let (_tx, rx) = tokio::sync::mpsc::unbounded_channel();
            let (exit_tx, exit_rx) = tokio::sync::oneshot::channel();
            let _ = exit_tx.send(0);
            Ok(ExecStream {
                output: rx,
                exit: exit_rx,
            })
        }

        async fn pull_image(&self, _image: &str) -> std::result::Result<(), ProviderError> {
            Ok(())
        }

        async fn image_exists(&self, _image: &str) -> std::result::Result<bool, ProviderError> {
            Ok(true)
        }
    }

    fn request(task_id: &str) -> ProvisionRequest {
        ProvisionRequest {
            task_id: task_id.to_string(),
            repo: RepoRef::parse("https://github.com/acme/widgets").unwrap(),
            git_token: "tok".to_string(),
            author: AuthorIdentity {
                name: "Jane".to_string(),
                email: "jane@example.com".to_string(),
            },
            branch: "drydock/task-1".to_string(),
            keep_alive: false,
            max_duration: Duration::hours(1),
            image: None,
            resume_sandbox_id: None,
        }
    }

    async fn setup(provider: Arc<ScriptedProvider>) -> (Provisioner, Arc<SandboxStorage>) {
        let pool = drydock_storage::memory_pool().await.unwrap();
        let storage = Arc::new(SandboxStorage::new(pool));
        let provisioner = Provisioner::new(
            provider,
            storage.clone(),
            "docker".to_string(),
            "drydock/workspace:latest".to_string(),
        );
        (provisioner, storage)
    }

    #[test]
    fn test_detect_installer_table() {
        assert_eq!(
            detect_installer(&["package-lock.json", "src"]),
            Some("npm ci")
        );
        assert_eq!(
            detect_installer(&["yarn.lock"]),
            Some("yarn install --frozen-lockfile")
        );
        assert_eq!(
            detect_installer(&["pnpm-lock.yaml", "package-lock.json"]),
            Some("pnpm install --frozen-lockfile")
        );
        assert_eq!(detect_installer(&["bun.lockb"]), Some("bun install"));
        assert_eq!(
            detect_installer(&["poetry.lock", "requirements.txt"]),
            Some("poetry install --no-root")
        );
        assert_eq!(detect_installer(&["uv.lock"]), Some("uv sync"));
        assert_eq!(
            detect_installer(&["requirements.txt"]),
            Some("pip install -r requirements.txt")
        );
        assert_eq!(detect_installer(&["Cargo.toml"]), Some("cargo fetch"));
        assert_eq!(detect_installer(&["README.md"]), None);
    }

    #[tokio::test]
    async fn test_fresh_provision_runs_full_setup() {
        let provider = Arc::new(ScriptedProvider::new("package-lock.json\nsrc\n"));
        let (provisioner, _storage) = setup(provider.clone()).await;

        let handle = provisioner.provision(request("task_1")).await.unwrap();
        assert_eq!(handle.status, SandboxStatus::Running);
        assert!(handle.container_id.is_some());

        let commands = provider.recorded();
        assert!(commands.iter().any(|c| c.starts_with("git clone")));
        assert!(commands.iter().any(|c| c.contains("npm ci")));
        assert!(commands.iter().any(|c| c.contains("git config user.name")));
        assert!(commands
            .iter()
            .any(|c| c.contains("git checkout -B drydock/task-1")));
    }

    #[tokio::test]
    async fn test_missing_token_rejected_before_allocation() {
        let provider = Arc::new(ScriptedProvider::new(""));
        let (provisioner, _storage) = setup(provider.clone()).await;

        let mut req = request("task_1");
        req.git_token = "".to_string();

        let result = provisioner.provision(req).await;
        assert!(matches!(result, Err(ProvisionError::CredentialInvalid(_))));
        assert!(provider.recorded().is_empty());
    }

    #[tokio::test]
    async fn test_install_failure_releases_container() {
        let provider = Arc::new(ScriptedProvider::failing_on("package-lock.json\n", "npm ci"));
        let (provisioner, storage) = setup(provider.clone()).await;

        let result = provisioner.provision(request("task_1")).await;
        assert!(matches!(
            result,
            Err(ProvisionError::DependencyInstallFailed(_))
        ));

        // Partial resources must not leak
        assert_eq!(provider.removed.lock().unwrap().len(), 1);
        let live = storage.list_live().await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].status, SandboxStatus::Error);
    }

    #[tokio::test]
    async fn test_clone_failure_surfaces_typed_error() {
        let provider = Arc::new(ScriptedProvider::failing_on("", "git clone"));
        let (provisioner, _storage) = setup(provider.clone()).await;

        let result = provisioner.provision(request("task_1")).await;
        assert!(matches!(result, Err(ProvisionError::CloneFailed(_))));
    }

    #[tokio::test]
    async fn test_resume_skips_setup() {
        let provider = Arc::new(ScriptedProvider::new("package-lock.json\n"));
        let (provisioner, _storage) = setup(provider.clone()).await;

        let first = provisioner.provision(request("task_1")).await.unwrap();
        let setup_commands = provider.recorded().len();

        let mut req = request("task_1");
        req.resume_sandbox_id = Some(first.id.clone());

        let resumed = provisioner.provision(req).await.unwrap();
        assert_eq!(resumed.id, first.id);
        // No clone/install re-ran
        assert_eq!(provider.recorded().len(), setup_commands);
    }

    #[tokio::test]
    async fn test_expired_resume_provisions_fresh() {
        let provider = Arc::new(ScriptedProvider::new("README.md\n"));
        let (provisioner, storage) = setup(provider.clone()).await;

        let first = provisioner.provision(request("task_1")).await.unwrap();
        // Force the handle past its deadline
        storage
            .touch(&first.id, Utc::now() - Duration::seconds(1))
            .await
            .unwrap();

        let mut req = request("task_1");
        req.resume_sandbox_id = Some(first.id.clone());

        let fresh = provisioner.provision(req).await.unwrap();
        assert_ne!(fresh.id, first.id);
    }

    #[tokio::test]
    async fn test_resume_for_other_task_rejected() {
        let provider = Arc::new(ScriptedProvider::new("README.md\n"));
        let (provisioner, _storage) = setup(provider.clone()).await;

        let first = provisioner.provision(request("task_1")).await.unwrap();

        let mut req = request("task_2");
        req.resume_sandbox_id = Some(first.id.clone());

        let other = provisioner.provision(req).await.unwrap();
        assert_ne!(other.id, first.id);
    }
}
