pub mod file_repository;
pub mod repository;

use std::io;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(thiserror::Error, Debug)]
pub enum ProjectError {
    #[error("invalid project id: {0}")]
    InvalidId(String),

    #[error("project not found: {0}")]
    NotFound(String),

    #[error("project limit reached ({0})")]
    LimitReached(usize),

    #[error("project template failed: {0}")]
    Template(String),

    #[error("{0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectInfo {
    pub id: String,
    pub path: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// One entry of a project's directory tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeNode {
    pub name: String,
    /// Relative to the project root; empty for the root itself.
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<TreeNode>>,
}

/// Project ids double as container names and directory names, so they are
/// restricted to one safe path segment.
pub fn validate_id(id: &str) -> Result<(), ProjectError> {
    let mut chars = id.chars();
    let valid = match chars.next() {
        Some(first) => {
            first.is_ascii_alphanumeric()
                && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
                && id.len() <= 128
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ProjectError::InvalidId(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_uuid_and_simple_names() {
        assert!(validate_id("0b6e4c1a-7d0f-4a39-9a57-2f3c1f5d8e21").is_ok());
        assert!(validate_id("proj-A").is_ok());
        assert!(validate_id("my_app.v2").is_ok());
    }

    #[test]
    fn rejects_paths_and_empty() {
        for bad in ["", ".", "..", "../etc", "a/b", "/abs", "-flag", "a b", "a\\b"] {
            assert!(validate_id(bad).is_err(), "{bad:?} should be rejected");
        }
        assert!(validate_id(&"x".repeat(129)).is_err());
    }
}
