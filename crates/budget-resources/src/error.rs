use std::fmt;

use crate::cleanup::CallbackId;
use crate::handle::HandleState;

#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("resource not found: `{key}`")]
    NotFound { key: String },
    #[error("resource `{key}` is locked by another process")]
    Locked { key: String },
    #[error("resource `{key}` failed validation: {reason}")]
    ValidationFailed { key: String, reason: String },
    #[error(
        "resource `{key}` is already open with read_only={held_read_only}, \
         requested read_only={requested_read_only}"
    )]
    ModeMismatch {
        key: String,
        held_read_only: bool,
        requested_read_only: bool,
    },
    #[error("handle for `{key}` is closed")]
    HandleClosed { key: String },
    #[error("invalid handle transition for `{key}`: {from:?} -> {to:?}")]
    InvalidTransition {
        key: String,
        from: HandleState,
        to: HandleState,
    },
    #[error("memory snapshot not found: `{0}`")]
    SnapshotNotFound(String),
    #[error("i/o error on `{key}`: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    CleanupFailed(#[from] CleanupFailed),
}

impl ResourceError {
    /// The canonical resource key this error refers to, if any.
    pub fn key(&self) -> Option<&str> {
        match self {
            ResourceError::NotFound { key }
            | ResourceError::Locked { key }
            | ResourceError::ValidationFailed { key, .. }
            | ResourceError::ModeMismatch { key, .. }
            | ResourceError::HandleClosed { key }
            | ResourceError::InvalidTransition { key, .. }
            | ResourceError::Io { key, .. } => Some(key),
            ResourceError::SnapshotNotFound(_) | ResourceError::CleanupFailed(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ResourceError>;

/// What a failed cleanup step was trying to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupStep {
    Close { key: String },
    Callback { id: CallbackId, name: String },
}

impl fmt::Display for CleanupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CleanupStep::Close { key } => write!(f, "close `{key}`"),
            CleanupStep::Callback { id, name } => write!(f, "callback `{name}` (#{})", id.get()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupFailure {
    pub step: CleanupStep,
    pub message: String,
}

impl fmt::Display for CleanupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.step, self.message)
    }
}

/// Every failure of a single cleanup pass, reported together once the pass has finished.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{} cleanup step(s) failed: {}", .failures.len(), join_failures(.failures))]
pub struct CleanupFailed {
    pub failures: Vec<CleanupFailure>,
}

impl CleanupFailed {
    /// Whether any failure came from the callback registered under `name`.
    pub fn mentions_callback(&self, name: &str) -> bool {
        self.failures.iter().any(|failure| {
            matches!(&failure.step, CleanupStep::Callback { name: n, .. } if n == name)
        })
    }

    /// Whether any failure came from closing the resource stored under `key`.
    pub fn mentions_key(&self, key: &str) -> bool {
        self.failures
            .iter()
            .any(|failure| matches!(&failure.step, CleanupStep::Close { key: k } if k == key))
    }
}

fn join_failures(failures: &[CleanupFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
