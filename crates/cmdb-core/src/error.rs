//! Error types shared by every CMDB crate.

use thiserror::Error;

/// Failure of a storage operation.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object {key} not found")]
    NotFound { key: String },
    #[error("object {key} already exists")]
    AlreadyExists { key: String },
    #[error("conflicting write on {key}: {reason}")]
    Conflict { key: String, reason: String },
    #[error("storage is closed")]
    Closed,
    #[error("internal storage error: {0}")]
    Internal(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    /// Internal errors are unexpected backend failures. Everything else
    /// describes the state of the addressed object and may be worked around
    /// by the caller (e.g. falling back from update to create).
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::Internal(_) | Self::Closed | Self::Serialization(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// A watch event payload did not match the shape of the target object.
#[derive(Debug, Error)]
#[error("failed to decode {kind} payload at {key}: {source}")]
pub struct DecodeError {
    pub kind: String,
    pub key: String,
    #[source]
    pub source: serde_json::Error,
}

/// Configuration and I/O errors.
#[derive(Debug, Error)]
pub enum CmdbError {
    #[error("config error: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CmdbError>;
