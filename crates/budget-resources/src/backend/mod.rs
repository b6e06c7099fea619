//! Boundary to the file-resource layer.
//!
//! The core never parses workbooks itself. It asks a [`ResourceBackend`] to open, close, and
//! probe resources by canonical key and keeps track of what is open.

mod fs;
mod in_memory;

pub use fs::{FsBackend, WorkbookFile};
pub use in_memory::{InMemoryBackend, InMemoryResource};

use crate::error::ResourceError;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("no such resource")]
    NotFound,
    #[error("locked by another process")]
    Locked,
    #[error("{0}")]
    Malformed(String),
    #[error("{0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => BackendError::NotFound,
            _ => BackendError::Io(err),
        }
    }
}

impl BackendError {
    pub(crate) fn into_resource_error(self, key: &str) -> ResourceError {
        let key = key.to_string();
        match self {
            BackendError::NotFound => ResourceError::NotFound { key },
            BackendError::Locked => ResourceError::Locked { key },
            BackendError::Malformed(reason) => ResourceError::ValidationFailed { key, reason },
            BackendError::Io(source) => ResourceError::Io { key, source },
        }
    }
}

/// Capability to open and close expensive file-backed resources.
///
/// Implementations must be callable from any thread. The manager guarantees that `open` runs at
/// most once per live entry and `close` exactly once per successfully opened resource.
pub trait ResourceBackend: Send + Sync + 'static {
    type Resource: Send + Sync + 'static;

    fn open(&self, key: &str, read_only: bool) -> Result<Self::Resource, BackendError>;

    fn close(&self, resource: &Self::Resource) -> Result<(), BackendError>;

    /// Whether another process currently holds `key`. Must not block.
    fn is_locked(&self, key: &str) -> bool;
}
