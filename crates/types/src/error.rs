//! Failure taxonomy for content operations.

use std::io;
use std::path::PathBuf;

/// Errors surfaced by content operations.
///
/// Nothing is retried internally: every failure terminates that single
/// operation's result. Sessions are released on all exit paths, so no
/// partial-failure state is held across calls.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Malformed content address string.
    #[error("invalid content address: {0}")]
    InvalidAddress(String),

    /// Malformed node address string.
    #[error("invalid node address: {0}")]
    InvalidNodeAddress(String),

    /// A session to the storage node could not be established.
    #[error("failed to connect to storage node: {0}")]
    Connect(String),

    /// The deadline race was lost. The remote outcome is unknown, not
    /// necessarily aborted.
    #[error("operation timed out")]
    Timeout,

    /// A local file could not be read.
    #[error("failed to read {}: {source}", .path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Listing target does not exist.
    #[error("directory not found: {}", .0.display())]
    DirNotFound(PathBuf),

    /// Listing target is not readable.
    #[error("permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),

    /// Local block store failure.
    #[error("block store error: {0}")]
    Store(String),

    /// dag-json or wire encoding failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Session-layer failure other than connect or timeout.
    #[error("session error: {0}")]
    Session(String),
}

pub type Result<T> = std::result::Result<T, Error>;
