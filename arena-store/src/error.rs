//! Store error taxonomy.
//!
//! Business errors raised by caller transforms never pass through this type:
//! mutation primitives are generic over the caller's error `E: From<StoreError>`
//! so a rejected transform reaches its caller unchanged.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::schema::Collection;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// File-system failure in the local backend
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Encoding or decoding a stored document failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The remote database refused or dropped the connection
    #[error("Connection to {target} failed: {reason}")]
    Connection { target: String, reason: String },

    /// The remote database did not answer within the connect timeout
    #[error("Connection to {target} timed out after {timeout:?}")]
    Timeout { target: String, timeout: Duration },

    /// The remote database rejected a command
    #[error("Database error: {0}")]
    Database(String),

    /// A collection name outside the known set
    #[error("Unknown collection: {0}")]
    UnknownCollection(String),

    /// A backend name other than `local` or `remote`
    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    /// Some collections of a multi-collection write were replaced, others were not.
    #[error(
        "Partial write: committed {committed:?}, failed {}",
        failed.iter().map(|(c, e)| format!("{c} ({e})")).collect::<Vec<_>>().join(", ")
    )]
    PartialWrite {
        committed: Vec<Collection>,
        failed: Vec<(Collection, String)>,
    },
}

impl StoreError {
    /// Wrap an I/O error with the path it happened on.
    pub(crate) fn io(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_refusal() || e.is_connection_dropped() || e.is_io_error() {
            StoreError::Connection {
                target: "redis".to_string(),
                reason: e.to_string(),
            }
        } else {
            StoreError::Database(e.to_string())
        }
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
