// ABOUTME: Shared data types for drydock
// ABOUTME: Repository references and commit author identity used across packages

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RepoRefError {
    #[error("Unrecognized repository URL: {0}")]
    Unrecognized(String),
}

/// Reference to a hosted git repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
    pub url: String,
}

impl RepoRef {
    /// Parse a repository reference from a GitHub URL.
    ///
    /// Accepts the formats users paste in:
    /// https://github.com/owner/repo.git
    /// git@github.com:owner/repo.git
    /// https://github.com/owner/repo
    pub fn parse(url: &str) -> Result<Self, RepoRefError> {
        if let Some(path) = url.strip_prefix("git@github.com:") {
            // SSH format: git@github.com:owner/repo.git
            let path = path.strip_suffix(".git").unwrap_or(path);
            let parts: Vec<&str> = path.split('/').collect();
            if parts.len() == 2 && !parts[0].is_empty() && !parts[1].is_empty() {
                return Ok(Self {
                    owner: parts[0].to_string(),
                    name: parts[1].to_string(),
                    url: url.to_string(),
                });
            }
        } else if url.contains("github.com/") {
            // HTTPS format with or without username:
            // https://github.com/owner/repo.git
            // https://username@github.com/owner/repo
            let github_pos = url
                .find("github.com/")
                .map(|pos| pos + "github.com/".len())
                .ok_or_else(|| RepoRefError::Unrecognized(url.to_string()))?;
            let path = &url[github_pos..];
            let path = path.strip_suffix(".git").unwrap_or(path);
            let parts: Vec<&str> = path.split('/').collect();
            if parts.len() >= 2 && !parts[0].is_empty() && !parts[1].is_empty() {
                return Ok(Self {
                    owner: parts[0].to_string(),
                    name: parts[1].to_string(),
                    url: url.to_string(),
                });
            }
        }

        Err(RepoRefError::Unrecognized(url.to_string()))
    }

    /// HTTPS clone URL without any embedded credential
    pub fn https_url(&self) -> String {
        format!("https://github.com/{}/{}.git", self.owner, self.name)
    }

    /// HTTPS clone URL with a token embedded for a single command.
    ///
    /// The result must never be logged or persisted; redact_secrets
    /// strips this form from error strings.
    pub fn authenticated_url(&self, token: &str) -> String {
        format!(
            "https://x-access-token:{}@github.com/{}/{}.git",
            token, self.owner, self.name
        )
    }
}

/// Commit author identity resolved from the user's profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorIdentity {
    pub name: String,
    pub email: String,
}

impl AuthorIdentity {
    /// Formatted as git's `--author` argument expects
    pub fn as_author_arg(&self) -> String {
        format!("{} <{}>", self.name, self.email)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_https_url() {
        let r = RepoRef::parse("https://github.com/acme/widgets.git").unwrap();
        assert_eq!(r.owner, "acme");
        assert_eq!(r.name, "widgets");

        let r = RepoRef::parse("https://github.com/acme/widgets").unwrap();
        assert_eq!(r.name, "widgets");
    }

    #[test]
    fn test_parse_https_url_with_username() {
        let r = RepoRef::parse("https://jane@github.com/acme/widgets.git").unwrap();
        assert_eq!(r.owner, "acme");
        assert_eq!(r.name, "widgets");
    }

    #[test]
    fn test_parse_ssh_url() {
        let r = RepoRef::parse("git@github.com:acme/widgets.git").unwrap();
        assert_eq!(r.owner, "acme");
        assert_eq!(r.name, "widgets");
    }

    #[test]
    fn test_parse_invalid_url() {
        assert!(RepoRef::parse("not-a-valid-url").is_err());
        assert!(RepoRef::parse("git@github.com:only-owner").is_err());
    }

    #[test]
    fn test_authenticated_url_shape() {
        let r = RepoRef::parse("https://github.com/acme/widgets").unwrap();
        let url = r.authenticated_url("tok123");
        assert!(url.contains("x-access-token:tok123@"));
        assert!(url.ends_with("acme/widgets.git"));
    }

    #[test]
    fn test_author_arg() {
        let a = AuthorIdentity {
            name: "Jane Doe".to_string(),
            email: "jane@example.com".to_string(),
        };
        assert_eq!(a.as_author_arg(), "Jane Doe <jane@example.com>");
    }
}
