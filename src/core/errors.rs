// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the server.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug, Clone)]
pub enum EdgeCacheError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    /// Absence of an entry, file, or peer record. Often benign; drives the MISS path.
    #[error("Not found")]
    NotFound,

    /// A stored relative path resolved outside the cache base directory.
    #[error("path escapes cache directory: {0}")]
    PathEscape(String),

    /// A cached artifact could not be decompressed; triggers self-healing.
    #[error("Decompression failed: {0}")]
    Decompression(String),

    /// Stored metadata could not be parsed. The offending field is named.
    #[error("Malformed metadata field '{field}': {reason}")]
    Parse { field: String, reason: String },

    /// A peer was unreachable or responded with a server error.
    #[error("Peer transport error: {0}")]
    Transport(String),

    /// The internal auth header was missing or did not match.
    #[error("Unauthorized")]
    Unauthorized,

    /// A compare-and-swap on a metadata field lost the race.
    #[error("CAS conflict on {0}")]
    Conflict(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Operation cancelled")]
    Cancelled,

    /// A push target refused to store because it would exceed the replication factor.
    #[error("Entry is already fully replicated")]
    OverReplicated,

    /// A configuration state that refuses to boot.
    #[error("Fatal configuration error: {0}")]
    FatalConfig(String),

    /// A shared-store (Redis) failure.
    #[error("Store error: {0}")]
    Store(String),

    /// The headless renderer failed or returned an unusable result.
    #[error("Render failed: {0}")]
    Render(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown host '{0}'")]
    UnknownHost(String),

    #[error("Internal Server Error: {0}")]
    Internal(String),
}

impl EdgeCacheError {
    /// Returns true for absences that a caller normally converts into a MISS.
    pub fn is_not_found(&self) -> bool {
        matches!(self, EdgeCacheError::NotFound)
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for EdgeCacheError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::NotFound {
            EdgeCacheError::NotFound
        } else {
            EdgeCacheError::Io(Arc::new(e))
        }
    }
}

impl From<reqwest::Error> for EdgeCacheError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            EdgeCacheError::Timeout(e.to_string())
        } else {
            EdgeCacheError::Transport(e.to_string())
        }
    }
}

impl From<redis::RedisError> for EdgeCacheError {
    fn from(e: redis::RedisError) -> Self {
        EdgeCacheError::Store(e.to_string())
    }
}

impl From<serde_json::Error> for EdgeCacheError {
    fn from(e: serde_json::Error) -> Self {
        EdgeCacheError::Internal(format!("JSON serialization/deserialization error: {e}"))
    }
}

impl From<url::ParseError> for EdgeCacheError {
    fn from(e: url::ParseError) -> Self {
        EdgeCacheError::InvalidRequest(format!("invalid URL: {e}"))
    }
}
