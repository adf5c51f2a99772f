/// Default container image used when a task does not request one
pub const DEFAULT_SANDBOX_IMAGE: &str = "drydock/workspace:latest";

/// Directory inside the sandbox where the repository is cloned
pub const WORKSPACE_DIR: &str = "/workspace";

/// Default lifetime of a sandbox before the reaper tears it down
pub const DEFAULT_MAX_SANDBOX_DURATION_SECS: u64 = 3600;

/// Default ceiling for a single agent invocation
pub const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 1800;

/// Prefix for placeholder branch names used until the branch-name
/// provider resolves a human-readable one
pub const PLACEHOLDER_BRANCH_PREFIX: &str = "drydock/task-";
