// ABOUTME: Sandbox task orchestrator for drydock
// ABOUTME: Drives queued tasks through provision, agent execution, commit, and teardown

pub mod collaborators;
pub mod config;
pub mod events;
pub mod reaper;

pub use collaborators::{BranchNameProvider, CredentialProvider, RateLimitGate};
pub use config::OrchestratorConfig;
pub use events::{DbLogSink, EventBus, TaskEvent};
pub use reaper::{teardown_sandbox, LifecycleError, SandboxReaper};

use chrono::Utc;
use drydock_agents::{
    runner_for, AgentError, AgentVariant, ConnectorStorage, ExecutionRequest, VariantError,
};
use drydock_core::{RepoRefError, PLACEHOLDER_BRANCH_PREFIX};
use drydock_sandbox::{
    Provider, ProvisionError, ProvisionRequest, Provisioner, SandboxStorage,
};
use drydock_tasks::{CreateTaskInput, Task, TaskError, TaskStatus, TaskStorage};
use drydock_vcs::{CommitResult, VcsError, VcsTracker};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Sandbox storage error: {0}")]
    SandboxStorage(#[from] drydock_sandbox::StorageError),

    #[error("Unknown agent variant: {0}")]
    Variant(#[from] VariantError),

    #[error("Invalid repository reference: {0}")]
    Repo(#[from] RepoRefError),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Inbound request to start a new task
#[derive(Debug, Clone)]
pub struct CreateTaskRequest {
    pub user_id: String,
    pub repo_url: String,
    pub instruction: String,
    pub agent: String,
    pub keep_alive: bool,
}

/// Orchestrates the full lifecycle of sandbox tasks.
///
/// All state lives in storage; the orchestrator may be restarted between
/// steps and re-driven from the persisted task record.
pub struct TaskOrchestrator {
    config: OrchestratorConfig,
    provider: Arc<dyn Provider>,
    tasks: Arc<TaskStorage>,
    sandboxes: Arc<SandboxStorage>,
    connectors: Arc<ConnectorStorage>,
    provisioner: Provisioner,
    vcs: VcsTracker,
    credentials: Arc<dyn CredentialProvider>,
    rate_limit: Arc<dyn RateLimitGate>,
    branch_names: Arc<dyn BranchNameProvider>,
    events: EventBus,
}

impl TaskOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        provider: Arc<dyn Provider>,
        pool: SqlitePool,
        credentials: Arc<dyn CredentialProvider>,
        rate_limit: Arc<dyn RateLimitGate>,
        branch_names: Arc<dyn BranchNameProvider>,
    ) -> Self {
        let tasks = Arc::new(TaskStorage::new(pool.clone()));
        let sandboxes = Arc::new(SandboxStorage::new(pool.clone()));
        let connectors = Arc::new(ConnectorStorage::new(pool));
        let provisioner = Provisioner::new(
            provider.clone(),
            sandboxes.clone(),
            config.provider_name.clone(),
            config.default_image.clone(),
        );
        let vcs = VcsTracker::with_push_retry_limit(provider.clone(), config.push_retry_limit);
        let events = EventBus::new(config.event_channel_size);

        Self {
            config,
            provider,
            tasks,
            sandboxes,
            connectors,
            provisioner,
            vcs,
            credentials,
            rate_limit,
            branch_names,
            events,
        }
    }

    /// Subscribe to real-time task events
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    pub fn tasks(&self) -> &Arc<TaskStorage> {
        &self.tasks
    }

    pub fn sandboxes(&self) -> &Arc<SandboxStorage> {
        &self.sandboxes
    }

    /// Spawn the backstop reaper for this orchestrator's sandboxes
    pub async fn start_reaper(&self) -> SandboxReaper {
        let reaper = SandboxReaper::new(
            self.provider.clone(),
            self.sandboxes.clone(),
            self.config.reaper_interval,
        );
        reaper.start().await;
        reaper
    }

    /// Accept a new task, gated by the external rate limiter
    pub async fn create_task(&self, request: CreateTaskRequest) -> Result<Task> {
        match self.rate_limit.allow_task(&request.user_id).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(OrchestratorError::RateLimited(
                    "task limit reached".to_string(),
                ))
            }
            Err(e) => {
                warn!("Rate limit gate unavailable: {}", e);
                return Err(OrchestratorError::RateLimited(
                    "rate limiter unavailable".to_string(),
                ));
            }
        }

        // Validate the variant tag before anything is persisted
        AgentVariant::from_str(&request.agent)?;
        let repo = drydock_core::RepoRef::parse(&request.repo_url)?;

        let task = self
            .tasks
            .create_task(CreateTaskInput {
                user_id: request.user_id,
                agent: request.agent,
                repo,
                instruction: request.instruction,
                keep_alive: request.keep_alive,
            })
            .await?;

        self.emit_status(&task);
        info!("Created task {} for {}", task.id, task.user_id);
        Ok(task)
    }

    /// Drive a queued task to a terminal state.
    ///
    /// Component failures are absorbed here: the task ends `failed` with a
    /// sanitized summary and the sandbox is released; only infrastructure
    /// errors (storage down) propagate.
    pub async fn run_task(&self, task_id: &str) -> Result<Task> {
        let task = self.tasks.get_task(task_id).await?;
        if task.status != TaskStatus::Queued {
            return Err(OrchestratorError::InvalidState(format!(
                "task {} is {}, expected queued",
                task.id,
                task.status.as_str()
            )));
        }

        self.drive(task).await
    }

    /// Follow-up instruction on a completed task.
    ///
    /// Terminal statuses are immutable, so the follow-up becomes a new
    /// task inheriting the original's sandbox, session, and branch; the
    /// provisioner's resume path reuses the live sandbox.
    pub async fn continue_task(&self, task_id: &str, instruction: &str) -> Result<Task> {
        let original = self.tasks.get_task(task_id).await?;

        match self.rate_limit.allow_message(&original.user_id).await {
            Ok(true) => {}
            _ => {
                return Err(OrchestratorError::RateLimited(
                    "message limit reached".to_string(),
                ))
            }
        }

        if original.status != TaskStatus::Completed {
            return Err(OrchestratorError::InvalidState(format!(
                "task {} is {}, follow-ups require completed",
                original.id,
                original.status.as_str()
            )));
        }

        let variant = AgentVariant::from_str(&original.agent)?;
        let resumable_session = variant.supports_resume() && original.session_id.is_some();
        let live_sandbox = match &original.sandbox_id {
            Some(sandbox_id) => match self.sandboxes.get_sandbox(sandbox_id).await {
                Ok(handle) => {
                    original.keep_alive
                        && !handle.is_terminated()
                        && !handle.is_expired(Utc::now())
                }
                Err(_) => false,
            },
            None => false,
        };

        if !resumable_session && !live_sandbox {
            return Err(OrchestratorError::InvalidState(format!(
                "task {} has no live sandbox or resumable session",
                original.id
            )));
        }

        let follow_up = self
            .tasks
            .create_task(CreateTaskInput {
                user_id: original.user_id.clone(),
                agent: original.agent.clone(),
                repo: original.repo.clone(),
                instruction: instruction.to_string(),
                keep_alive: original.keep_alive,
            })
            .await?;

        if live_sandbox {
            if let Some(sandbox_id) = &original.sandbox_id {
                self.tasks.set_sandbox(&follow_up.id, sandbox_id).await?;
                // The handle is owned by one task at a time
                self.sandboxes.reassign(sandbox_id, &follow_up.id).await?;
            }
        }
        if resumable_session {
            self.tasks
                .set_session(&follow_up.id, original.session_id.as_deref())
                .await?;
        }
        if let Some(branch) = &original.branch {
            self.tasks.set_branch(&follow_up.id, branch).await?;
            if original.branch_pushed {
                self.tasks.mark_branch_pushed(&follow_up.id).await?;
            }
        }

        let follow_up = self.tasks.get_task(&follow_up.id).await?;
        self.emit_status(&follow_up);
        info!(
            "Created follow-up {} for task {}",
            follow_up.id, original.id
        );

        self.drive(follow_up).await
    }

    /// Request cancellation. A signal, not an interrupt: a queued task is
    /// finalized immediately, a task mid-pipeline stops at its next
    /// checkpoint.
    pub async fn cancel_task(&self, task_id: &str) -> Result<Task> {
        let flagged = self.tasks.request_cancel(task_id).await?;
        let task = self.tasks.get_task(task_id).await?;

        if flagged && task.status == TaskStatus::Queued {
            return self.finalize_cancelled(task).await;
        }

        Ok(task)
    }

    /// Apply a late-resolved branch name from the enrichment provider.
    ///
    /// Valid only before the branch is first pushed; afterwards the
    /// request is ignored and the existing name stays. Returns whether
    /// the rename was applied.
    pub async fn apply_branch_name(&self, task_id: &str, branch: &str) -> Result<bool> {
        let task = self.tasks.get_task(task_id).await?;
        if task.branch_pushed {
            debug!(
                "Branch for {} already pushed, keeping {:?}",
                task_id, task.branch
            );
            return Ok(false);
        }

        if !self.tasks.set_branch(task_id, branch).await? {
            return Ok(false);
        }

        // Rename inside the sandbox too when one is already provisioned
        if let Some(sandbox_id) = &task.sandbox_id {
            if let Ok(handle) = self.sandboxes.get_sandbox(sandbox_id).await {
                if !handle.is_terminated() {
                    if let Some(container_id) = &handle.container_id {
                        if let Err(e) = self.vcs.rename_branch(container_id, branch).await {
                            warn!("Failed to rename branch in {}: {}", sandbox_id, e);
                        }
                    }
                }
            }
        }

        Ok(true)
    }

    /// Fail tasks a crashed process left mid-pipeline.
    ///
    /// Run at startup before dispatching new work. The optimistic version
    /// check makes this safe against a task that is actually still being
    /// driven elsewhere: that driver's next transition simply wins.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let mut recovered = 0;

        for status in [
            TaskStatus::Provisioning,
            TaskStatus::Running,
            TaskStatus::Committing,
        ] {
            for task in self.tasks.list_tasks(None, Some(status)).await? {
                match self
                    .tasks
                    .transition(
                        &task,
                        TaskStatus::Failed,
                        Some("Interrupted by orchestrator restart"),
                        Some("Interrupted by orchestrator restart"),
                    )
                    .await
                {
                    Ok(failed) => {
                        self.emit_status(&failed);
                        self.release_sandbox(&failed, false).await;
                        recovered += 1;
                    }
                    Err(TaskError::Conflict { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        if recovered > 0 {
            warn!("Recovered {} interrupted task(s)", recovered);
        }
        Ok(recovered)
    }

    /// Ordered message log for a task
    pub async fn task_messages(
        &self,
        task_id: &str,
        after_seq: Option<i64>,
    ) -> Result<Vec<drydock_tasks::TaskMessage>> {
        Ok(self.tasks.list_messages(task_id, after_seq).await?)
    }

    // ==================== Pipeline ====================

    async fn drive(&self, task: Task) -> Result<Task> {
        if task.cancel_requested {
            return self.finalize_cancelled(task).await;
        }

        let mut task = self
            .tasks
            .transition(&task, TaskStatus::Provisioning, Some("Provisioning sandbox"), None)
            .await?;
        self.emit_status(&task);

        // Branch enrichment; the placeholder keeps everything working if
        // the provider has not resolved a name yet
        if task.branch.is_none() {
            let branch = self
                .branch_names
                .branch_name(&task.id, &task.instruction)
                .await
                .unwrap_or_else(|| {
                    format!(
                        "{}{}",
                        PLACEHOLDER_BRANCH_PREFIX,
                        task.id.trim_start_matches("task_")
                    )
                });
            self.tasks.set_branch(&task.id, &branch).await?;
            task = self.tasks.get_task(&task.id).await?;
        }
        let branch = match &task.branch {
            Some(branch) => branch.clone(),
            None => {
                return self
                    .fail(task, "Internal error while naming the branch")
                    .await
            }
        };

        let git_token = match self.credentials.git_token(&task.user_id).await {
            Ok(token) => token,
            Err(e) => {
                warn!("Credential provider failed for {}: {}", task.user_id, e);
                return self.fail(task, "Source-control credential unavailable").await;
            }
        };
        let author = match self.credentials.author_identity(&task.user_id).await {
            Ok(author) => author,
            Err(_) => return self.fail(task, "Author identity unavailable").await,
        };
        let variant = AgentVariant::from_str(&task.agent)?;
        let api_key = match self.credentials.agent_api_key(&task.user_id, variant).await {
            Ok(key) => key,
            Err(_) => None,
        };

        let handle = match self
            .provisioner
            .provision(ProvisionRequest {
                task_id: task.id.clone(),
                repo: task.repo.clone(),
                git_token: git_token.clone(),
                author: author.clone(),
                branch: branch.clone(),
                keep_alive: task.keep_alive,
                max_duration: self.config.max_sandbox_duration,
                image: None,
                resume_sandbox_id: task.sandbox_id.clone(),
            })
            .await
        {
            Ok(handle) => handle,
            Err(e) => return self.fail(task, summarize_provision_error(&e)).await,
        };
        self.tasks.set_sandbox(&task.id, &handle.id).await?;

        let container_id = match &handle.container_id {
            Some(container_id) => container_id.clone(),
            None => return self.fail(task, "Sandbox environment unavailable").await,
        };

        // Cancellation checkpoint after the provisioning sub-step
        let mut task = self.tasks.get_task(&task.id).await?;
        if task.cancel_requested {
            return self.finalize_cancelled(task).await;
        }

        task = self
            .tasks
            .transition(&task, TaskStatus::Running, Some("Agent started"), None)
            .await?;
        self.emit_status(&task);

        let connectors = if variant.supports_connectors() {
            self.connectors
                .list_for_user(&task.user_id)
                .await
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        let runner = runner_for(variant, self.provider.clone());
        let sink = DbLogSink::new(self.tasks.clone(), self.events.clone(), task.id.clone());
        let execution = ExecutionRequest {
            instruction: task.instruction.clone(),
            api_key,
            timeout: self.remaining_budget(&handle),
            resume_session_id: task.session_id.clone(),
            connectors,
        };

        let result = match runner.execute(&container_id, &execution, &sink).await {
            Ok(result) => result,
            Err(e) => return self.fail(task, summarize_agent_error(&e)).await,
        };

        if let Some(session_id) = &result.session_id {
            self.tasks.set_session(&task.id, Some(session_id)).await?;
        }

        // Cancellation checkpoint after the agent sub-step
        let mut task = self.tasks.get_task(&task.id).await?;
        if task.cancel_requested {
            return self.finalize_cancelled(task).await;
        }

        task = self
            .tasks
            .transition(&task, TaskStatus::Committing, Some("Committing changes"), None)
            .await?;
        self.emit_status(&task);

        let commit_result = if result.changes_detected {
            match self
                .vcs
                .commit_and_push(
                    &container_id,
                    &task.repo,
                    &git_token,
                    &author,
                    &branch,
                    &commit_message(&task),
                )
                .await
            {
                Ok(result) => result,
                // Race between detection and stage resolves as a clean tree
                Err(VcsError::NothingToCommit) => CommitResult::NoChanges,
                Err(e) => return self.fail(task, summarize_vcs_error(&e)).await,
            }
        } else {
            CommitResult::NoChanges
        };

        match &commit_result {
            CommitResult::Committed { commit_sha, branch } => {
                self.tasks.mark_branch_pushed(&task.id).await?;
                self.tasks
                    .append_message(
                        &task.id,
                        "vcs",
                        &format!("Pushed commit {} to {}", commit_sha, branch),
                    )
                    .await?;
            }
            CommitResult::NoChanges => {
                self.tasks
                    .append_message(&task.id, "vcs", "No changes to push")
                    .await?;
            }
        }

        let task = self
            .tasks
            .transition(&task, TaskStatus::Completed, Some("Task completed"), None)
            .await?;
        self.emit_status(&task);

        self.release_sandbox(&task, false).await;

        Ok(task)
    }

    /// Agent budget: the smaller of the configured ceiling and what is
    /// left of the sandbox's lifetime.
    fn remaining_budget(&self, handle: &drydock_sandbox::SandboxHandle) -> Duration {
        let remaining = handle
            .expires_at
            .signed_duration_since(Utc::now())
            .to_std()
            .unwrap_or(Duration::from_secs(1));
        remaining.min(self.config.agent_timeout).max(Duration::from_secs(1))
    }

    async fn fail(&self, task: Task, summary: &str) -> Result<Task> {
        let failed = self
            .tasks
            .transition(&task, TaskStatus::Failed, Some(summary), Some(summary))
            .await?;
        self.emit_status(&failed);
        self.release_sandbox(&failed, false).await;
        Ok(failed)
    }

    async fn finalize_cancelled(&self, task: Task) -> Result<Task> {
        let cancelled = self
            .tasks
            .transition(&task, TaskStatus::Cancelled, Some("Cancelled by user"), None)
            .await?;
        self.emit_status(&cancelled);
        // Cancellation always releases the sandbox, keep-alive or not
        self.release_sandbox(&cancelled, true).await;
        Ok(cancelled)
    }

    /// Synchronous teardown on the completion path. Keep-alive sandboxes
    /// are left for follow-ups; their durable deadline remains with the
    /// reaper. Teardown failures are logged, the reaper retries them.
    async fn release_sandbox(&self, task: &Task, even_if_keep_alive: bool) {
        let Some(sandbox_id) = &task.sandbox_id else {
            return;
        };
        if task.keep_alive && !even_if_keep_alive {
            return;
        }

        match teardown_sandbox(self.provider.as_ref(), &self.sandboxes, sandbox_id).await {
            Ok(true) => info!("Released sandbox {} for task {}", sandbox_id, task.id),
            Ok(false) => {}
            Err(e) => warn!(
                "Teardown of sandbox {} failed, reaper will retry: {}",
                sandbox_id, e
            ),
        }
    }

    fn emit_status(&self, task: &Task) {
        self.events.emit(TaskEvent::Status {
            task_id: task.id.clone(),
            status: task.status,
            error_message: task.error_message.clone(),
        });
    }
}

fn commit_message(task: &Task) -> String {
    let mut summary: String = task.instruction.lines().next().unwrap_or("").to_string();
    if summary.len() > 72 {
        let mut cut = 72;
        while !summary.is_char_boundary(cut) {
            cut -= 1;
        }
        summary.truncate(cut);
    }
    summary
}

/// Sanitized category summaries: no credentials, paths, or raw internals
/// cross the boundary into the user-visible log.
fn summarize_provision_error(error: &ProvisionError) -> &'static str {
    match error {
        ProvisionError::CloneFailed(_) => "Repository clone failed",
        ProvisionError::DependencyInstallFailed(_) => "Dependency installation failed",
        ProvisionError::CredentialInvalid(_) => "Source-control credential rejected",
        ProvisionError::EnvironmentUnavailable(_) => "Sandbox environment unavailable",
        ProvisionError::Provider(_) => "Sandbox environment unavailable",
        ProvisionError::Storage(_) => "Internal storage failure",
    }
}

fn summarize_agent_error(error: &AgentError) -> &'static str {
    match error {
        AgentError::ToolInstallFailed(_) => "Agent tool installation failed",
        AgentError::AuthenticationFailed(_) => "Agent authentication failed",
        AgentError::ExecutionTimeout { .. } => "Agent execution timed out",
        AgentError::ExecutionCrashed { .. } => "Agent execution failed",
        AgentError::Provider(_) => "Sandbox environment unavailable",
        AgentError::Vcs(_) => "Working tree inspection failed",
    }
}

fn summarize_vcs_error(error: &VcsError) -> &'static str {
    match error {
        VcsError::PushRejected(_) => "Push rejected by the remote",
        VcsError::AuthFailed(_) => "Push authentication failed",
        VcsError::NothingToCommit => "No changes to commit",
        VcsError::CommandFailed(_) => "Git operation failed",
        VcsError::Provider(_) => "Sandbox environment unavailable",
    }
}
