// ABOUTME: User-scoped MCP connector configurations
// ABOUTME: Storage and per-tool config rendering for agent invocations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Connector not found: {0}")]
    NotFound(String),
    #[error("Invalid transport: {0}")]
    InvalidTransport(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ConnectorError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorTransport {
    Stdio,
    Http,
}

impl ConnectorTransport {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Stdio => "stdio",
            Self::Http => "http",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "stdio" => Ok(Self::Stdio),
            "http" => Ok(Self::Http),
            _ => Err(ConnectorError::InvalidTransport(s.to_string())),
        }
    }
}

/// MCP server configuration owned by a user, independent of any task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connector {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub transport: ConnectorTransport,
    pub command: Option<String>,
    pub url: Option<String>,
    pub env: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Render connectors as the `mcpServers` map the agent CLIs read
pub fn mcp_servers_json(connectors: &[Connector]) -> serde_json::Value {
    let mut servers = serde_json::Map::new();
    for connector in connectors {
        let mut entry = serde_json::Map::new();
        match connector.transport {
            ConnectorTransport::Stdio => {
                if let Some(command) = &connector.command {
                    let mut parts = command.split_whitespace();
                    if let Some(program) = parts.next() {
                        entry.insert("command".to_string(), program.into());
                        let args: Vec<serde_json::Value> =
                            parts.map(|a| serde_json::Value::from(a)).collect();
                        if !args.is_empty() {
                            entry.insert("args".to_string(), serde_json::Value::Array(args));
                        }
                    }
                }
            }
            ConnectorTransport::Http => {
                entry.insert("type".to_string(), "http".into());
                if let Some(url) = &connector.url {
                    entry.insert("url".to_string(), url.as_str().into());
                }
            }
        }
        if !connector.env.is_empty() {
            entry.insert(
                "env".to_string(),
                serde_json::to_value(&connector.env).unwrap_or_default(),
            );
        }
        servers.insert(connector.name.clone(), serde_json::Value::Object(entry));
    }
    serde_json::json!({ "mcpServers": servers })
}

pub struct ConnectorStorage {
    pool: SqlitePool,
}

impl ConnectorStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create_connector(&self, mut connector: Connector) -> Result<Connector> {
        if connector.id.is_empty() {
            connector.id = format!("conn_{}", nanoid::nanoid!(12));
        }

        sqlx::query(
            r#"
            INSERT INTO connectors (id, user_id, name, transport, command, url, env, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&connector.id)
        .bind(&connector.user_id)
        .bind(&connector.name)
        .bind(connector.transport.as_str())
        .bind(&connector.command)
        .bind(&connector.url)
        .bind(serde_json::to_string(&connector.env)?)
        .bind(connector.created_at.to_rfc3339())
        .bind(connector.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(connector)
    }

    pub async fn get_connector(&self, id: &str) -> Result<Connector> {
        let row = sqlx::query(
            "SELECT id, user_id, name, transport, command, url, env, created_at, updated_at
             FROM connectors WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::row_to_connector(row),
            None => Err(ConnectorError::NotFound(id.to_string())),
        }
    }

    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<Connector>> {
        let rows = sqlx::query(
            "SELECT id, user_id, name, transport, command, url, env, created_at, updated_at
             FROM connectors WHERE user_id = ?1 ORDER BY created_at ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_connector).collect()
    }

    pub async fn delete_connector(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM connectors WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ConnectorError::NotFound(id.to_string()));
        }

        Ok(())
    }

    fn row_to_connector(row: sqlx::sqlite::SqliteRow) -> Result<Connector> {
        let transport_str: String = row.get("transport");
        let env_str: Option<String> = row.get("env");
        let created_at_str: String = row.get("created_at");
        let updated_at_str: String = row.get("updated_at");

        Ok(Connector {
            id: row.get("id"),
            user_id: row.get("user_id"),
            name: row.get("name"),
            transport: ConnectorTransport::from_str(&transport_str)?,
            command: row.get("command"),
            url: row.get("url"),
            env: env_str
                .map(|s| serde_json::from_str(&s))
                .transpose()?
                .unwrap_or_default(),
            created_at: parse_timestamp(&created_at_str)?,
            updated_at: parse_timestamp(&updated_at_str)?,
        })
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ConnectorError::InvalidTransport(format!("bad timestamp {}: {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connector(name: &str, user: &str) -> Connector {
        Connector {
            id: String::new(),
            user_id: user.to_string(),
            name: name.to_string(),
            transport: ConnectorTransport::Stdio,
            command: Some("npx -y @acme/mcp-server".to_string()),
            url: None,
            env: HashMap::from([("ACME_TOKEN".to_string(), "t".to_string())]),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_connector_crud() {
        let pool = drydock_storage::memory_pool().await.unwrap();
        let storage = ConnectorStorage::new(pool);

        let created = storage.create_connector(connector("acme", "u1")).await.unwrap();
        assert!(created.id.starts_with("conn_"));

        let loaded = storage.get_connector(&created.id).await.unwrap();
        assert_eq!(loaded.name, "acme");
        assert_eq!(loaded.env.get("ACME_TOKEN").map(String::as_str), Some("t"));

        let listed = storage.list_for_user("u1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(storage.list_for_user("u2").await.unwrap().is_empty());

        storage.delete_connector(&created.id).await.unwrap();
        assert!(matches!(
            storage.get_connector(&created.id).await,
            Err(ConnectorError::NotFound(_))
        ));
    }

    #[test]
    fn test_mcp_servers_json_stdio() {
        let json = mcp_servers_json(&[connector("acme", "u1")]);
        let entry = &json["mcpServers"]["acme"];
        assert_eq!(entry["command"], "npx");
        assert_eq!(entry["args"][0], "-y");
        assert_eq!(entry["env"]["ACME_TOKEN"], "t");
    }

    #[test]
    fn test_mcp_servers_json_http() {
        let mut c = connector("remote", "u1");
        c.transport = ConnectorTransport::Http;
        c.command = None;
        c.url = Some("https://mcp.example.com/sse".to_string());
        c.env.clear();

        let json = mcp_servers_json(&[c]);
        let entry = &json["mcpServers"]["remote"];
        assert_eq!(entry["type"], "http");
        assert_eq!(entry["url"], "https://mcp.example.com/sse");
    }
}
