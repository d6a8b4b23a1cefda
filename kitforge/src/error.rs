use std::collections::HashSet;
use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("fetch failed: {url}: {reason}")]
    Fetch { url: String, reason: String, retry: bool },

    #[error("hash mismatch: {0:?}")]
    HashMismatch(HashSet<String>),

    #[error("corrupt object: {0}")]
    Corruption(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("incomplete record: {0}")]
    IncompleteRecord(String),

    #[error("recipe error: {0}")]
    Recipe(String),

    #[error("git tree error: {0}")]
    GitTree(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{0}")]
    Io(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("git error: {0}")]
    Git(#[from] git2::Error),
}

impl Error {
    pub fn fetch(url: impl Into<String>, reason: impl Into<String>, retry: bool) -> Self {
        Error::Fetch { url: url.into(), reason: reason.into(), retry }
    }

    /// True if this error represents a retryable fetch failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Fetch { retry: true, .. })
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(format!("{e}: {}", e.kind()))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
