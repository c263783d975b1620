use std::time::Duration;
use thiserror::Error;

use crate::ResourceType;

/// Errors related to communication with the resource store.
///
/// Not finding a resource is not an error: lookups return a resource of
/// [ResourceType::Undefined] instead.
#[derive(Debug, Error, PartialEq)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("type conflict at '{path}': expected {expected}, found {found}")]
    TypeConflict {
        path: String,
        expected: ResourceType,
        found: ResourceType,
    },

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("unable to acquire lock '{name}' within {waited:?}")]
    LockTimeout { name: String, waited: Duration },

    #[error("internal storage error: {0}")]
    StorageError(String),
}

impl Error {
    /// Whether retrying the failed operation may succeed.
    /// Misuse (type conflicts, unsupported or invalid requests) never does.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::LockTimeout { .. } | Error::StorageError(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(value: rusqlite::Error) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        if value.kind() == std::io::ErrorKind::InvalidInput {
            Error::InvalidRequest(value.to_string())
        } else {
            Error::StorageError(value.to_string())
        }
    }
}

impl From<tempfile::PersistError> for Error {
    fn from(value: tempfile::PersistError) -> Self {
        Error::StorageError(value.error.to_string())
    }
}

impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::InvalidRequest(msg) => Self::new(std::io::ErrorKind::InvalidInput, msg),
            Error::Unsupported(msg) => Self::new(std::io::ErrorKind::Unsupported, msg),
            e @ Error::LockTimeout { .. } => Self::new(std::io::ErrorKind::TimedOut, e.to_string()),
            e @ Error::TypeConflict { .. } => {
                Self::new(std::io::ErrorKind::InvalidInput, e.to_string())
            }
            Error::StorageError(msg) => Self::new(std::io::ErrorKind::Other, msg),
        }
    }
}
