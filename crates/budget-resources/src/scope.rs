//! Scoped acquisition: the sanctioned way for application code to touch resources.
//!
//! Calling [`ResourceManager::acquire`] and [`ResourceManager::release`] by hand works, but every
//! early return or panic between the two leaks a reference. The guards here release on drop, so
//! release happens on every exit path by construction.

use std::path::Path;

use crate::backend::ResourceBackend;
use crate::error::{ResourceError, Result};
use crate::handle::{AcquireOptions, Handle};
use crate::manager::{BulkHandles, ResourceManager};

/// Releases its handle when dropped.
pub struct ResourceGuard<'a, B: ResourceBackend> {
    manager: &'a ResourceManager<B>,
    handle: Option<Handle<B::Resource>>,
}

impl<'a, B: ResourceBackend> ResourceGuard<'a, B> {
    pub fn acquire(
        manager: &'a ResourceManager<B>,
        path: impl AsRef<Path>,
        options: AcquireOptions,
    ) -> Result<Self> {
        let handle = manager.acquire(path, options)?;
        Ok(Self {
            manager,
            handle: Some(handle),
        })
    }

    pub fn handle(&self) -> &Handle<B::Resource> {
        self.handle
            .as_ref()
            .expect("resource guard holds a handle until dropped")
    }

    /// Release now instead of at the end of the scope.
    pub fn release(mut self) {
        if let Some(handle) = self.handle.take() {
            self.manager.release(handle);
        }
    }
}

impl<B: ResourceBackend> Drop for ResourceGuard<'_, B> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.manager.release(handle);
        }
    }
}

/// Releases a whole bulk batch when dropped, newest acquisition first.
pub struct BulkGuard<'a, B: ResourceBackend> {
    manager: &'a ResourceManager<B>,
    handles: Option<BulkHandles<B::Resource>>,
}

impl<'a, B: ResourceBackend> BulkGuard<'a, B> {
    pub fn acquire<I, P>(
        manager: &'a ResourceManager<B>,
        paths: I,
        options: AcquireOptions,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let handles = manager.acquire_bulk(paths, options)?;
        Ok(Self {
            manager,
            handles: Some(handles),
        })
    }

    pub fn handles(&self) -> &BulkHandles<B::Resource> {
        self.handles
            .as_ref()
            .expect("bulk guard holds its handles until dropped")
    }
}

impl<B: ResourceBackend> Drop for BulkGuard<'_, B> {
    fn drop(&mut self) {
        let Some(handles) = self.handles.take() else {
            return;
        };
        let mut handles = handles.into_vec();
        while let Some(handle) = handles.pop() {
            self.manager.release(handle);
        }
    }
}

/// Runs work against resources with release guaranteed afterwards.
pub struct ScopedContext<'a, B: ResourceBackend> {
    manager: &'a ResourceManager<B>,
}

impl<B: ResourceBackend> Clone for ScopedContext<'_, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B: ResourceBackend> Copy for ScopedContext<'_, B> {}

impl<'a, B: ResourceBackend> ScopedContext<'a, B> {
    pub fn new(manager: &'a ResourceManager<B>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &'a ResourceManager<B> {
        self.manager
    }

    /// Acquire `path`, run `body`, release.
    ///
    /// The release runs exactly once whether `body` returns `Ok`, returns `Err`, or panics; an
    /// error from `body` reaches the caller after the release. Acquisition errors convert into
    /// the body's error type.
    pub fn with_resource<T, E, F>(
        &self,
        path: impl AsRef<Path>,
        options: AcquireOptions,
        body: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce(&Handle<B::Resource>) -> std::result::Result<T, E>,
        E: From<ResourceError>,
    {
        let guard = ResourceGuard::acquire(self.manager, path, options)?;
        let outcome = body(guard.handle());
        guard.release();
        outcome
    }

    /// Bulk variant of [`ScopedContext::with_resource`].
    ///
    /// Acquisition is all-or-nothing; the batch is released newest first once `body` is done.
    pub fn with_resources_bulk<I, P, T, E, F>(
        &self,
        paths: I,
        options: AcquireOptions,
        body: F,
    ) -> std::result::Result<T, E>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
        F: FnOnce(&BulkHandles<B::Resource>) -> std::result::Result<T, E>,
        E: From<ResourceError>,
    {
        let guard = BulkGuard::acquire(self.manager, paths, options)?;
        let outcome = body(guard.handles());
        drop(guard);
        outcome
    }
}
