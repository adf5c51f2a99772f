// ABOUTME: Storage layer for sandbox handles in SQLite
// ABOUTME: Tracks container ownership, keep-alive deadlines, and exactly-once teardown

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Sandbox not found: {0}")]
    NotFound(String),
    #[error("Invalid status: {0}")]
    InvalidStatus(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Creating,
    Running,
    Stopping,
    Stopped,
    Error,
    Terminated,
}

impl SandboxStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Terminated => "terminated",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "creating" => Ok(Self::Creating),
            "running" => Ok(Self::Running),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            "error" => Ok(Self::Error),
            "terminated" => Ok(Self::Terminated),
            _ => Err(StorageError::InvalidStatus(s.to_string())),
        }
    }
}

/// Durable record of a remote sandbox.
///
/// Owned exclusively by one task; `expires_at` is the reaper's source of
/// truth for teardown, independent of any in-memory state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxHandle {
    pub id: String,
    pub task_id: String,
    pub provider: String,
    pub container_id: Option<String>,
    pub status: SandboxStatus,
    pub keep_alive: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl SandboxHandle {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_terminated(&self) -> bool {
        self.status == SandboxStatus::Terminated
    }
}

pub struct SandboxStorage {
    pool: SqlitePool,
}

impl SandboxStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create_sandbox(&self, mut handle: SandboxHandle) -> Result<SandboxHandle> {
        // Generate ID if not provided
        if handle.id.is_empty() {
            handle.id = format!("sbx_{}", uuid::Uuid::new_v4().to_string().replace('-', ""));
        }

        sqlx::query(
            r#"
            INSERT INTO sandboxes (
                id, task_id, provider, container_id, status, keep_alive,
                created_at, expires_at, terminated_at, error_message
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&handle.id)
        .bind(&handle.task_id)
        .bind(&handle.provider)
        .bind(&handle.container_id)
        .bind(handle.status.as_str())
        .bind(handle.keep_alive)
        .bind(handle.created_at.to_rfc3339())
        .bind(handle.expires_at.to_rfc3339())
        .bind(handle.terminated_at.map(|d| d.to_rfc3339()))
        .bind(&handle.error_message)
        .execute(&self.pool)
        .await?;

        Ok(handle)
    }

    pub async fn get_sandbox(&self, id: &str) -> Result<SandboxHandle> {
        let row = sqlx::query(
            r#"
            SELECT id, task_id, provider, container_id, status, keep_alive,
                   created_at, expires_at, terminated_at, error_message
            FROM sandboxes
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Self::row_to_handle(row)?),
            None => Err(StorageError::NotFound(id.to_string())),
        }
    }

    pub async fn update_sandbox_status(
        &self,
        id: &str,
        status: SandboxStatus,
        error: Option<String>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE sandboxes SET status = ?1, error_message = ?2 WHERE id = ?3",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }

        Ok(())
    }

    pub async fn set_container(&self, id: &str, container_id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE sandboxes SET container_id = ?1 WHERE id = ?2")
            .bind(container_id)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }

        Ok(())
    }

    /// Push the teardown deadline forward; called on every follow-up
    pub async fn touch(&self, id: &str, expires_at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE sandboxes SET expires_at = ?1 WHERE id = ?2 AND status != 'terminated'",
        )
        .bind(expires_at.to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }

        Ok(())
    }

    /// Transfer exclusive ownership to a follow-up task
    pub async fn reassign(&self, id: &str, task_id: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE sandboxes SET task_id = ?1 WHERE id = ?2 AND status != 'terminated'",
        )
        .bind(task_id)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }

        Ok(())
    }

    /// Mark a sandbox terminated.
    ///
    /// Returns false when it was already terminated, which makes the
    /// synchronous completion path and the reaper safe to race.
    pub async fn mark_terminated(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sandboxes
            SET status = 'terminated', terminated_at = ?1
            WHERE id = ?2 AND status != 'terminated'
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Sandboxes whose teardown deadline has passed and are not yet torn down
    pub async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<SandboxHandle>> {
        let rows = sqlx::query(
            r#"
            SELECT id, task_id, provider, container_id, status, keep_alive,
                   created_at, expires_at, terminated_at, error_message
            FROM sandboxes
            WHERE status != 'terminated' AND expires_at <= ?1
            ORDER BY expires_at ASC
            "#,
        )
        .bind(now.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_handle).collect()
    }

    /// All live (not terminated) sandboxes, for orphan reconciliation
    pub async fn list_live(&self) -> Result<Vec<SandboxHandle>> {
        let rows = sqlx::query(
            r#"
            SELECT id, task_id, provider, container_id, status, keep_alive,
                   created_at, expires_at, terminated_at, error_message
            FROM sandboxes
            WHERE status != 'terminated'
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_handle).collect()
    }

    fn row_to_handle(row: sqlx::sqlite::SqliteRow) -> Result<SandboxHandle> {
        let status_str: String = row.get("status");
        let created_at_str: String = row.get("created_at");
        let expires_at_str: String = row.get("expires_at");
        let terminated_at_str: Option<String> = row.get("terminated_at");

        Ok(SandboxHandle {
            id: row.get("id"),
            task_id: row.get("task_id"),
            provider: row.get("provider"),
            container_id: row.get("container_id"),
            status: SandboxStatus::from_str(&status_str)?,
            keep_alive: row.get("keep_alive"),
            created_at: parse_timestamp(&created_at_str)?,
            expires_at: parse_timestamp(&expires_at_str)?,
            terminated_at: terminated_at_str
                .map(|s| parse_timestamp(&s))
                .transpose()?,
            error_message: row.get("error_message"),
        })
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::InvalidStatus(format!("bad timestamp {}: {}", s, e)))
}
