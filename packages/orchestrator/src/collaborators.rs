// ABOUTME: Collaborator traits the orchestrator consumes from the web layer
// ABOUTME: Credentials, rate limiting, and asynchronous branch-name enrichment

use async_trait::async_trait;
use drydock_agents::AgentVariant;
use drydock_core::AuthorIdentity;

/// Supplies per-user credentials on demand.
///
/// The orchestrator holds returned values in memory for the duration of a
/// command only; it never persists plaintext credentials.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// The user's own source-control token; never a shared fallback
    async fn git_token(&self, user_id: &str) -> anyhow::Result<String>;

    /// Commit author identity resolved from the user's profile
    async fn author_identity(&self, user_id: &str) -> anyhow::Result<AuthorIdentity>;

    /// API credential for the agent variant, when the user has one
    async fn agent_api_key(
        &self,
        user_id: &str,
        variant: AgentVariant,
    ) -> anyhow::Result<Option<String>>;
}

/// External gate consulted before provisioning or accepting a follow-up
#[async_trait]
pub trait RateLimitGate: Send + Sync {
    /// Whether the user may start another task now
    async fn allow_task(&self, user_id: &str) -> anyhow::Result<bool>;

    /// Whether the user may send another follow-up message now
    async fn allow_message(&self, user_id: &str) -> anyhow::Result<bool>;
}

/// Optional asynchronous branch-name enrichment.
///
/// The orchestrator functions with a placeholder when this has not
/// resolved; a late result is applied only before the branch is first
/// pushed.
#[async_trait]
pub trait BranchNameProvider: Send + Sync {
    async fn branch_name(&self, task_id: &str, instruction: &str) -> Option<String>;
}
