// ABOUTME: Task type definitions and the status transition graph
// ABOUTME: Statuses, tasks, and ordered task messages

use chrono::{DateTime, Utc};
use drydock_core::RepoRef;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Provisioning,
    Running,
    Committing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Queued => "queued",
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Committing => "committing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "provisioning" => Some(Self::Provisioning),
            "running" => Some(Self::Running),
            "committing" => Some(Self::Committing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Terminal statuses are immutable once set
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// The state machine's legal edges.
    ///
    /// Cancellation is reachable from every non-terminal state; everything
    /// else advances along the pipeline or fails.
    pub fn can_transition(&self, to: TaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if to == TaskStatus::Cancelled {
            return true;
        }
        matches!(
            (self, to),
            (Self::Queued, Self::Provisioning)
                | (Self::Provisioning, Self::Running)
                | (Self::Provisioning, Self::Failed)
                | (Self::Running, Self::Committing)
                | (Self::Running, Self::Failed)
                | (Self::Committing, Self::Completed)
                | (Self::Committing, Self::Failed)
        )
    }
}

/// A user's request to run an agent against a repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub user_id: String,
    pub status: TaskStatus,
    /// Agent variant tag; interpreted by drydock-agents
    pub agent: String,
    pub repo: RepoRef,
    pub instruction: String,
    /// Placeholder until the branch-name provider resolves a real name
    pub branch: Option<String>,
    /// Set once the branch exists on the remote; renames stop then
    pub branch_pushed: bool,
    pub sandbox_id: Option<String>,
    /// Agent-specific resumable session token
    pub session_id: Option<String>,
    pub keep_alive: bool,
    pub cancel_requested: bool,
    pub error_message: Option<String>,
    /// Optimistic-lock counter; bumped on every status transition
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskInput {
    pub user_id: String,
    pub agent: String,
    pub repo: RepoRef,
    pub instruction: String,
    pub keep_alive: bool,
}

/// One ordered log line belonging to a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_id: String,
    pub seq: i64,
    pub source: String,
    pub line: String,
    pub created_at: DateTime<Utc>,
}
