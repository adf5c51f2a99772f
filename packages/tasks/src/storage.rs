// ABOUTME: SQLite storage for tasks and their message log
// ABOUTME: Optimistic-locked status transitions persisted atomically with messages

use crate::types::{CreateTaskInput, Task, TaskMessage, TaskStatus};
use chrono::{DateTime, Utc};
use drydock_core::RepoRef;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Illegal transition from {from:?} to {to:?}")]
    IllegalTransition { from: TaskStatus, to: TaskStatus },

    #[error("Concurrent transition on task {task_id}")]
    Conflict { task_id: String },

    #[error("Invalid stored value: {0}")]
    InvalidValue(String),
}

pub type Result<T> = std::result::Result<T, TaskError>;

pub struct TaskStorage {
    pool: SqlitePool,
}

impl TaskStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create_task(&self, input: CreateTaskInput) -> Result<Task> {
        let task = Task {
            id: format!("task_{}", nanoid::nanoid!(12)),
            user_id: input.user_id,
            status: TaskStatus::Queued,
            agent: input.agent,
            repo: input.repo,
            instruction: input.instruction,
            branch: None,
            branch_pushed: false,
            sandbox_id: None,
            session_id: None,
            keep_alive: input.keep_alive,
            cancel_requested: false,
            error_message: None,
            version: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };

        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, user_id, status, agent, repo_owner, repo_name, repo_url,
                instruction, branch, branch_pushed, sandbox_id, session_id,
                keep_alive, cancel_requested, error_message, version,
                created_at, started_at, finished_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7,
                ?8, ?9, ?10, ?11, ?12,
                ?13, ?14, ?15, ?16,
                ?17, ?18, ?19
            )
            "#,
        )
        .bind(&task.id)
        .bind(&task.user_id)
        .bind(task.status.as_str())
        .bind(&task.agent)
        .bind(&task.repo.owner)
        .bind(&task.repo.name)
        .bind(&task.repo.url)
        .bind(&task.instruction)
        .bind(&task.branch)
        .bind(task.branch_pushed)
        .bind(&task.sandbox_id)
        .bind(&task.session_id)
        .bind(task.keep_alive)
        .bind(task.cancel_requested)
        .bind(&task.error_message)
        .bind(task.version)
        .bind(task.created_at.to_rfc3339())
        .bind(task.started_at.map(|d| d.to_rfc3339()))
        .bind(task.finished_at.map(|d| d.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(task)
    }

    pub async fn get_task(&self, id: &str) -> Result<Task> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, status, agent, repo_owner, repo_name, repo_url,
                   instruction, branch, branch_pushed, sandbox_id, session_id,
                   keep_alive, cancel_requested, error_message, version,
                   created_at, started_at, finished_at
            FROM tasks
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::row_to_task(row),
            None => Err(TaskError::NotFound(id.to_string())),
        }
    }

    pub async fn list_tasks(
        &self,
        user_id: Option<&str>,
        status: Option<TaskStatus>,
    ) -> Result<Vec<Task>> {
        let mut query = String::from(
            r#"
            SELECT id, user_id, status, agent, repo_owner, repo_name, repo_url,
                   instruction, branch, branch_pushed, sandbox_id, session_id,
                   keep_alive, cancel_requested, error_message, version,
                   created_at, started_at, finished_at
            FROM tasks
            WHERE 1=1
            "#,
        );

        let mut param_count = 0;
        if user_id.is_some() {
            param_count += 1;
            query.push_str(&format!(" AND user_id = ?{}", param_count));
        }
        if status.is_some() {
            param_count += 1;
            query.push_str(&format!(" AND status = ?{}", param_count));
        }
        query.push_str(" ORDER BY created_at DESC");

        let mut q = sqlx::query(&query);
        if let Some(uid) = user_id {
            q = q.bind(uid);
        }
        if let Some(s) = &status {
            q = q.bind(s.as_str());
        }

        let rows = q.fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_task).collect()
    }

    /// Apply a status transition guarded by the task's version.
    ///
    /// The status update and its describing message are written in one
    /// transaction, so a crash cannot leave them inconsistent. A stale
    /// version means another transition won the race.
    pub async fn transition(
        &self,
        task: &Task,
        to: TaskStatus,
        message: Option<&str>,
        error: Option<&str>,
    ) -> Result<Task> {
        if !task.status.can_transition(to) {
            return Err(TaskError::IllegalTransition {
                from: task.status,
                to,
            });
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let mut query = String::from("UPDATE tasks SET status = ?1, version = version + 1");
        let mut bind_index = 2;

        if error.is_some() {
            query.push_str(&format!(", error_message = ?{}", bind_index));
            bind_index += 1;
        }
        if to == TaskStatus::Provisioning {
            query.push_str(&format!(", started_at = ?{}", bind_index));
            bind_index += 1;
        }
        if to.is_terminal() {
            query.push_str(&format!(", finished_at = ?{}", bind_index));
            bind_index += 1;
        }

        query.push_str(&format!(
            " WHERE id = ?{} AND version = ?{}",
            bind_index,
            bind_index + 1
        ));

        let mut q = sqlx::query(&query).bind(to.as_str());
        if let Some(err) = error {
            q = q.bind(err);
        }
        if to == TaskStatus::Provisioning || to.is_terminal() {
            q = q.bind(now.to_rfc3339());
        }
        q = q.bind(&task.id).bind(task.version);

        let result = q.execute(&mut *tx).await?;
        if result.rows_affected() == 0 {
            // Either the task vanished or a concurrent transition won
            let exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE id = ?1")
                .bind(&task.id)
                .fetch_one(&mut *tx)
                .await?;
            return if exists == 0 {
                Err(TaskError::NotFound(task.id.clone()))
            } else {
                Err(TaskError::Conflict {
                    task_id: task.id.clone(),
                })
            };
        }

        if let Some(line) = message {
            Self::insert_message(&mut tx, &task.id, "system", line, now).await?;
        }

        tx.commit().await?;

        debug!(
            "Task {} transitioned {} -> {}",
            task.id,
            task.status.as_str(),
            to.as_str()
        );

        self.get_task(&task.id).await
    }

    /// Append one line to the task's ordered message log
    pub async fn append_message(
        &self,
        task_id: &str,
        source: &str,
        line: &str,
    ) -> Result<TaskMessage> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        Self::insert_message(&mut tx, task_id, source, line, now).await?;

        let seq: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) FROM task_messages WHERE task_id = ?1")
                .bind(task_id)
                .fetch_one(&mut *tx)
                .await?;

        tx.commit().await?;

        Ok(TaskMessage {
            task_id: task_id.to_string(),
            seq,
            source: source.to_string(),
            line: line.to_string(),
            created_at: now,
        })
    }

    async fn insert_message(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        task_id: &str,
        source: &str,
        line: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO task_messages (task_id, seq, source, line, created_at)
            VALUES (
                ?1,
                (SELECT COALESCE(MAX(seq), 0) + 1 FROM task_messages WHERE task_id = ?1),
                ?2, ?3, ?4
            )
            "#,
        )
        .bind(task_id)
        .bind(source)
        .bind(line)
        .bind(now.to_rfc3339())
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Messages in exact append order
    pub async fn list_messages(
        &self,
        task_id: &str,
        after_seq: Option<i64>,
    ) -> Result<Vec<TaskMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT task_id, seq, source, line, created_at
            FROM task_messages
            WHERE task_id = ?1 AND seq > ?2
            ORDER BY seq ASC
            "#,
        )
        .bind(task_id)
        .bind(after_seq.unwrap_or(0))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let created_at_str: String = row.get("created_at");
                Ok(TaskMessage {
                    task_id: row.get("task_id"),
                    seq: row.get("seq"),
                    source: row.get("source"),
                    line: row.get("line"),
                    created_at: parse_timestamp(&created_at_str)?,
                })
            })
            .collect()
    }

    pub async fn set_sandbox(&self, task_id: &str, sandbox_id: &str) -> Result<()> {
        self.update_field(task_id, "sandbox_id", Some(sandbox_id)).await
    }

    pub async fn set_session(&self, task_id: &str, session_id: Option<&str>) -> Result<()> {
        self.update_field(task_id, "session_id", session_id).await
    }

    /// Rename the working branch. Refused once the branch has been pushed;
    /// returns whether the rename was applied.
    pub async fn set_branch(&self, task_id: &str, branch: &str) -> Result<bool> {
        let result =
            sqlx::query("UPDATE tasks SET branch = ?1 WHERE id = ?2 AND branch_pushed = 0")
                .bind(branch)
                .bind(task_id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_branch_pushed(&self, task_id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE tasks SET branch_pushed = 1 WHERE id = ?1")
            .bind(task_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(TaskError::NotFound(task_id.to_string()));
        }
        Ok(())
    }

    /// Flag cancellation intent. A signal, not an interrupt: the pipeline
    /// honors it at its next checkpoint. Returns false for terminal tasks.
    pub async fn request_cancel(&self, task_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tasks SET cancel_requested = 1
            WHERE id = ?1 AND status NOT IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_field(
        &self,
        task_id: &str,
        field: &str,
        value: Option<&str>,
    ) -> Result<()> {
        let query = format!("UPDATE tasks SET {} = ?1 WHERE id = ?2", field);
        let result = sqlx::query(&query)
            .bind(value)
            .bind(task_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(TaskError::NotFound(task_id.to_string()));
        }
        Ok(())
    }

    fn row_to_task(row: sqlx::sqlite::SqliteRow) -> Result<Task> {
        let status_str: String = row.get("status");
        let status = TaskStatus::parse(&status_str)
            .ok_or_else(|| TaskError::InvalidValue(format!("status {}", status_str)))?;

        let created_at_str: String = row.get("created_at");
        let started_at_str: Option<String> = row.get("started_at");
        let finished_at_str: Option<String> = row.get("finished_at");

        Ok(Task {
            id: row.get("id"),
            user_id: row.get("user_id"),
            status,
            agent: row.get("agent"),
            repo: RepoRef {
                owner: row.get("repo_owner"),
                name: row.get("repo_name"),
                url: row.get("repo_url"),
            },
            instruction: row.get("instruction"),
            branch: row.get("branch"),
            branch_pushed: row.get("branch_pushed"),
            sandbox_id: row.get("sandbox_id"),
            session_id: row.get("session_id"),
            keep_alive: row.get("keep_alive"),
            cancel_requested: row.get("cancel_requested"),
            error_message: row.get("error_message"),
            version: row.get("version"),
            created_at: parse_timestamp(&created_at_str)?,
            started_at: started_at_str.map(|s| parse_timestamp(&s)).transpose()?,
            finished_at: finished_at_str.map(|s| parse_timestamp(&s)).transpose()?,
        })
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| TaskError::InvalidValue(format!("timestamp {}: {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> TaskStorage {
        let pool = drydock_storage::memory_pool().await.unwrap();
        TaskStorage::new(pool)
    }

    fn input() -> CreateTaskInput {
        CreateTaskInput {
            user_id: "u1".to_string(),
            agent: "claude".to_string(),
            repo: RepoRef::parse("https://github.com/acme/widgets").unwrap(),
            instruction: "add README badge".to_string(),
            keep_alive: false,
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let storage = setup().await;
        let task = storage.create_task(input()).await.unwrap();

        assert!(task.id.starts_with("task_"));
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.version, 0);

        let loaded = storage.get_task(&task.id).await.unwrap();
        assert_eq!(loaded.repo.owner, "acme");
        assert_eq!(loaded.repo.name, "widgets");
        assert_eq!(loaded.instruction, "add README badge");
    }

    #[tokio::test]
    async fn test_transition_bumps_version_and_appends_message() {
        let storage = setup().await;
        let task = storage.create_task(input()).await.unwrap();

        let task = storage
            .transition(&task, TaskStatus::Provisioning, Some("dispatched"), None)
            .await
            .unwrap();

        assert_eq!(task.status, TaskStatus::Provisioning);
        assert_eq!(task.version, 1);
        assert!(task.started_at.is_some());

        let messages = storage.list_messages(&task.id, None).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].line, "dispatched");
        assert_eq!(messages[0].source, "system");
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected_not_applied() {
        let storage = setup().await;
        let task = storage.create_task(input()).await.unwrap();

        let result = storage
            .transition(&task, TaskStatus::Committing, None, None)
            .await;
        assert!(matches!(
            result,
            Err(TaskError::IllegalTransition { .. })
        ));

        let loaded = storage.get_task(&task.id).await.unwrap();
        assert_eq!(loaded.status, TaskStatus::Queued);
        assert_eq!(loaded.version, 0);
    }

    #[tokio::test]
    async fn test_terminal_status_immutable() {
        let storage = setup().await;
        let task = storage.create_task(input()).await.unwrap();
        let task = storage
            .transition(&task, TaskStatus::Cancelled, None, None)
            .await
            .unwrap();

        let result = storage
            .transition(&task, TaskStatus::Provisioning, None, None)
            .await;
        assert!(matches!(result, Err(TaskError::IllegalTransition { .. })));
    }

    #[tokio::test]
    async fn test_stale_version_conflicts() {
        let storage = setup().await;
        let task = storage.create_task(input()).await.unwrap();

        // Two views of the same task; the first transition wins
        let stale = task.clone();
        storage
            .transition(&task, TaskStatus::Provisioning, None, None)
            .await
            .unwrap();

        let result = storage
            .transition(&stale, TaskStatus::Provisioning, None, None)
            .await;
        assert!(matches!(result, Err(TaskError::Conflict { .. })));

        // The winner's effect is intact
        let loaded = storage.get_task(&task.id).await.unwrap();
        assert_eq!(loaded.status, TaskStatus::Provisioning);
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn test_terminal_transition_sets_finished_at_and_error() {
        let storage = setup().await;
        let task = storage.create_task(input()).await.unwrap();
        let task = storage
            .transition(&task, TaskStatus::Provisioning, None, None)
            .await
            .unwrap();

        let task = storage
            .transition(
                &task,
                TaskStatus::Failed,
                Some("provisioning failed"),
                Some("Dependency install failed"),
            )
            .await
            .unwrap();

        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.finished_at.is_some());
        assert_eq!(
            task.error_message.as_deref(),
            Some("Dependency install failed")
        );
    }

    #[tokio::test]
    async fn test_message_ordering_preserved() {
        let storage = setup().await;
        let task = storage.create_task(input()).await.unwrap();

        for i in 0..50 {
            storage
                .append_message(&task.id, "agent", &format!("line {}", i))
                .await
                .unwrap();
        }

        let messages = storage.list_messages(&task.id, None).await.unwrap();
        assert_eq!(messages.len(), 50);
        for (i, message) in messages.iter().enumerate() {
            assert_eq!(message.seq, i as i64 + 1);
            assert_eq!(message.line, format!("line {}", i));
        }
    }

    #[tokio::test]
    async fn test_list_messages_after_seq() {
        let storage = setup().await;
        let task = storage.create_task(input()).await.unwrap();

        for i in 0..5 {
            storage
                .append_message(&task.id, "agent", &format!("line {}", i))
                .await
                .unwrap();
        }

        let tail = storage.list_messages(&task.id, Some(3)).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].seq, 4);
    }

    #[tokio::test]
    async fn test_branch_rename_blocked_after_push() {
        let storage = setup().await;
        let task = storage.create_task(input()).await.unwrap();

        assert!(storage.set_branch(&task.id, "drydock/task-1").await.unwrap());
        assert!(storage.set_branch(&task.id, "feat/badge").await.unwrap());

        storage.mark_branch_pushed(&task.id).await.unwrap();
        assert!(!storage.set_branch(&task.id, "feat/too-late").await.unwrap());

        let loaded = storage.get_task(&task.id).await.unwrap();
        assert_eq!(loaded.branch.as_deref(), Some("feat/badge"));
    }

    #[tokio::test]
    async fn test_request_cancel_only_non_terminal() {
        let storage = setup().await;
        let task = storage.create_task(input()).await.unwrap();

        assert!(storage.request_cancel(&task.id).await.unwrap());
        let loaded = storage.get_task(&task.id).await.unwrap();
        assert!(loaded.cancel_requested);

        let task = storage
            .transition(&loaded, TaskStatus::Cancelled, None, None)
            .await
            .unwrap();
        assert!(!storage.request_cancel(&task.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_tasks_filters() {
        let storage = setup().await;
        let task = storage.create_task(input()).await.unwrap();

        let mut other = input();
        other.user_id = "u2".to_string();
        storage.create_task(other).await.unwrap();

        let mine = storage.list_tasks(Some("u1"), None).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, task.id);

        let queued = storage
            .list_tasks(None, Some(TaskStatus::Queued))
            .await
            .unwrap();
        assert_eq!(queued.len(), 2);
    }
}
