// ABOUTME: SQLite pool bootstrap and migrations for drydock
// ABOUTME: Opens the database, enforces pragmas, and applies the workspace schema

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Embedded schema migrations for the whole workspace.
///
/// Domain packages run their queries against tables defined here; their
/// tests apply the same migrator against an in-memory database.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Open (creating if needed) the drydock database and apply migrations.
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    MIGRATOR.run(&pool).await?;

    info!("Database ready at {}", database_url);
    Ok(pool)
}

/// Migrated in-memory database for tests.
///
/// Pinned to a single connection: each SQLite in-memory connection is its
/// own database, so a wider pool would hand out empty schemas.
pub async fn memory_pool() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;
    MIGRATOR.run(&pool).await?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrations_apply_cleanly() {
        let pool = memory_pool().await.unwrap();

        // Every table the workspace depends on must exist
        for table in ["tasks", "task_messages", "sandboxes", "connectors"] {
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
            )
            .bind(table)
            .fetch_one(&pool)
            .await
            .unwrap();
            assert_eq!(count, 1, "missing table {}", table);
        }
    }

    #[tokio::test]
    async fn test_message_cascade_delete() {
        let pool = memory_pool().await.unwrap();

        sqlx::query(
            "INSERT INTO tasks (id, user_id, status, agent, repo_owner, repo_name, repo_url, instruction, version, created_at)
             VALUES ('task_x', 'u1', 'queued', 'claude', 'acme', 'widgets', 'https://github.com/acme/widgets', 'do it', 0, '2026-01-01T00:00:00Z')",
        )
        .execute(&pool)
        .await
        .unwrap();

        sqlx::query(
            "INSERT INTO task_messages (task_id, seq, source, line, created_at)
             VALUES ('task_x', 1, 'system', 'hello', '2026-01-01T00:00:00Z')",
        )
        .execute(&pool)
        .await
        .unwrap();

        sqlx::query("DELETE FROM tasks WHERE id = 'task_x'")
            .execute(&pool)
            .await
            .unwrap();

        let remaining: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM task_messages WHERE task_id = 'task_x'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(remaining, 0);
    }
}
