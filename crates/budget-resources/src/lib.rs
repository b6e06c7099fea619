//! Resource lifecycle core for the budget workbook application.
//!
//! Workbooks are expensive to open and must never be opened twice by the same process, nor left
//! open after the work that needed them is done. This crate exposes:
//! - A reference-counted registry of open resources keyed by canonical path
//! - All-or-nothing bulk acquisition with rollback
//! - Scoped guards that release on every exit path, including panics
//! - A coordinator for application-level cleanup callbacks
//! - Process memory snapshots, operation monitoring, and leak heuristics
//! - A periodic auto-cleanup task for memory pressure
//!
//! Opening and closing the resources themselves is delegated to a [`ResourceBackend`].

mod auto_cleanup;
pub mod backend;
mod cleanup;
pub mod config;
mod context;
mod error;
mod handle;
mod manager;
pub mod memory;
mod scope;

pub use auto_cleanup::{AutoCleanup, AUTO_CLEANUP_LABEL};
pub use backend::{
    BackendError, FsBackend, InMemoryBackend, InMemoryResource, ResourceBackend, WorkbookFile,
};
pub use cleanup::{CallbackId, CleanupCoordinator};
pub use config::{ConfigError, ResourceConfig};
pub use context::ResourceContext;
pub use error::{CleanupFailed, CleanupFailure, CleanupStep, ResourceError, Result};
pub use handle::{AcquireOptions, Handle, HandleId, HandleState, ResourceHandle};
pub use manager::{BulkHandles, CleanupReport, ResourceManager, ResourceStats};
pub use memory::{ActiveGauge, MemoryMonitor, MemoryProbe, MemorySnapshot, NullProbe, SnapshotDiff};
pub use scope::{BulkGuard, ResourceGuard, ScopedContext};

pub use budget_fs::ContainerKind;
