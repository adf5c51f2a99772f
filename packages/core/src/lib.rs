// ABOUTME: Core types, constants, and utilities for drydock
// ABOUTME: Foundational package providing shared functionality across all drydock packages

pub mod constants;
pub mod types;
pub mod utils;

// Re-export main types
pub use types::{AuthorIdentity, RepoRef, RepoRefError};

// Re-export constants
pub use constants::{
    DEFAULT_AGENT_TIMEOUT_SECS, DEFAULT_MAX_SANDBOX_DURATION_SECS, DEFAULT_SANDBOX_IMAGE,
    PLACEHOLDER_BRANCH_PREFIX, WORKSPACE_DIR,
};

// Re-export utilities
pub use utils::{redact_secrets, tail_bytes};
