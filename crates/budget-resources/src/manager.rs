use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::backend::ResourceBackend;
use crate::cleanup::CleanupCoordinator;
use crate::error::{CleanupFailed, CleanupFailure, CleanupStep, ResourceError, Result};
use crate::handle::{AcquireOptions, Handle, HandleId, ResourceHandle, Shared};
use crate::memory::{ActiveGauge, MemoryMonitor};

/// Registry counters plus the current active count.
///
/// This is intended for observability (e.g. a status panel).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceStats {
    pub active_count: usize,
    pub total_opened_ever: u64,
    pub total_leaks_detected: u64,
    pub total_closed: u64,
    pub open_failures: u64,
    pub close_failures: u64,
}

/// What a successful forced cleanup did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub handles_closed: usize,
    pub callbacks_run: usize,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    total_opened_ever: u64,
    total_closed: u64,
    open_failures: u64,
    close_failures: u64,
}

struct Entry<R> {
    shared: Arc<Shared<R>>,
    refcount: usize,
    opened_at: DateTime<Utc>,
    last_access: DateTime<Utc>,
    last_access_instant: Instant,
}

impl<R> Entry<R> {
    fn touch(&mut self) {
        self.last_access = Utc::now();
        self.last_access_instant = Instant::now();
    }

    fn view(&self) -> ResourceHandle {
        ResourceHandle {
            id: self.shared.id,
            key: self.shared.key.clone(),
            state: self.shared.state(),
            refcount: self.refcount,
            read_only: self.shared.read_only,
            opened_at: self.opened_at,
            last_access: self.last_access,
            idle_for: self.last_access_instant.elapsed(),
        }
    }
}

/// Registry slot for a key.
///
/// `Opening` and `Closing` are placeholders held while backend I/O runs outside the lock; they
/// make sure exactly one thread opens and exactly one thread closes each entry.
enum Slot<R> {
    Opening,
    Live(Entry<R>),
    Closing,
}

struct Registry<R> {
    slots: HashMap<String, Slot<R>>,
    live: usize,
    counters: Counters,
}

enum SlotStatus {
    Vacant,
    Live,
    InTransition,
}

struct Inner<B: ResourceBackend> {
    backend: B,
    registry: Mutex<Registry<B::Resource>>,
    /// Signalled whenever an `Opening`/`Closing` placeholder is resolved.
    settled: Condvar,
    next_id: AtomicU64,
    monitor: Arc<MemoryMonitor>,
    cleanup: Arc<CleanupCoordinator>,
    active: ActiveGauge,
}

/// Reference-counted registry of open resources, keyed by canonical path.
///
/// Cloning is cheap and yields another view of the same registry.
pub struct ResourceManager<B: ResourceBackend> {
    inner: Arc<Inner<B>>,
}

impl<B: ResourceBackend> Clone for ResourceManager<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Clears a placeholder slot on drop, so a failed or panicking open/close never wedges the key.
struct Placeholder<'a, B: ResourceBackend> {
    manager: &'a ResourceManager<B>,
    key: String,
    armed: bool,
}

impl<'a, B: ResourceBackend> Placeholder<'a, B> {
    fn new(manager: &'a ResourceManager<B>, key: String) -> Self {
        Self {
            manager,
            key,
            armed: true,
        }
    }

    /// Replace the `Opening` placeholder with a live entry.
    fn fulfil(mut self, entry: Entry<B::Resource>) {
        let mut registry = self.manager.lock();
        registry.slots.insert(self.key.clone(), Slot::Live(entry));
        registry.live += 1;
        registry.counters.total_opened_ever += 1;
        self.manager.publish_active(&registry);
        self.armed = false;
        drop(registry);
        self.manager.inner.settled.notify_all();
    }
}

impl<B: ResourceBackend> Drop for Placeholder<'_, B> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut registry = self.manager.lock();
        if matches!(
            registry.slots.get(&self.key),
            Some(Slot::Opening | Slot::Closing)
        ) {
            registry.slots.remove(&self.key);
        }
        drop(registry);
        self.manager.inner.settled.notify_all();
    }
}

fn canonical(path: &Path) -> Result<String> {
    budget_fs::canonical_key(path)
        .map(|key| key.to_string_lossy().into_owned())
        .map_err(|source| ResourceError::Io {
            key: path.display().to_string(),
            source,
        })
}

impl<B: ResourceBackend> ResourceManager<B> {
    pub fn new(backend: B, monitor: Arc<MemoryMonitor>, cleanup: Arc<CleanupCoordinator>) -> Self {
        let active = monitor.active_gauge();
        Self {
            inner: Arc::new(Inner {
                backend,
                registry: Mutex::new(Registry {
                    slots: HashMap::new(),
                    live: 0,
                    counters: Counters::default(),
                }),
                settled: Condvar::new(),
                next_id: AtomicU64::new(0),
                monitor,
                cleanup,
                active,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry<B::Resource>> {
        self.inner
            .registry
            .lock()
            .expect("resource registry mutex poisoned")
    }

    fn publish_active(&self, registry: &Registry<B::Resource>) {
        self.inner.active.set(registry.live);
    }

    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    pub fn monitor(&self) -> &Arc<MemoryMonitor> {
        &self.inner.monitor
    }

    pub fn cleanup(&self) -> &Arc<CleanupCoordinator> {
        &self.inner.cleanup
    }

    /// Acquire a reference to the resource at `path`, opening it if nobody holds it yet.
    ///
    /// Notes:
    /// - A live entry is shared; its mode must match `options.read_only`.
    /// - A key another process has locked fails fast with [`ResourceError::Locked`].
    /// - A failed open registers nothing.
    pub fn acquire(
        &self,
        path: impl AsRef<Path>,
        options: AcquireOptions,
    ) -> Result<Handle<B::Resource>> {
        let key = canonical(path.as_ref())?;
        self.acquire_key(key, options).map(|(handle, _)| handle)
    }

    /// Returns the handle and whether this call opened the underlying resource.
    fn acquire_key(
        &self,
        key: String,
        options: AcquireOptions,
    ) -> Result<(Handle<B::Resource>, bool)> {
        let mut registry = self.lock();
        loop {
            let status = match registry.slots.get(&key) {
                None => SlotStatus::Vacant,
                Some(Slot::Live(_)) => SlotStatus::Live,
                Some(Slot::Opening | Slot::Closing) => SlotStatus::InTransition,
            };
            match status {
                SlotStatus::Live => {
                    let Some(Slot::Live(entry)) = registry.slots.get_mut(&key) else {
                        continue;
                    };
                    if entry.shared.read_only != options.read_only {
                        return Err(ResourceError::ModeMismatch {
                            key,
                            held_read_only: entry.shared.read_only,
                            requested_read_only: options.read_only,
                        });
                    }
                    entry.refcount += 1;
                    entry.touch();
                    log::trace!("acquired `{key}` (refcount {})", entry.refcount);
                    return Ok((Handle::new(Arc::clone(&entry.shared)), false));
                }
                SlotStatus::InTransition => {
                    registry = self
                        .inner
                        .settled
                        .wait(registry)
                        .expect("resource registry mutex poisoned");
                }
                SlotStatus::Vacant => {
                    registry.slots.insert(key.clone(), Slot::Opening);
                    break;
                }
            }
        }
        drop(registry);

        // This thread is now the only opener of `key`.
        let placeholder = Placeholder::new(self, key.clone());
        match self.open_resource(&key, options) {
            Ok(resource) => {
                let id = HandleId::new(self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1);
                let shared = Arc::new(Shared::open(id, key.clone(), options.read_only, resource));
                let now = Utc::now();
                placeholder.fulfil(Entry {
                    shared: Arc::clone(&shared),
                    refcount: 1,
                    opened_at: now,
                    last_access: now,
                    last_access_instant: Instant::now(),
                });
                log::debug!(
                    "opened `{key}` as {id} (read_only={})",
                    options.read_only
                );
                Ok((Handle::new(shared), true))
            }
            Err(err) => {
                self.lock().counters.open_failures += 1;
                log::debug!("failed to open `{key}`: {err}");
                drop(placeholder);
                Err(err)
            }
        }
    }

    fn open_resource(&self, key: &str, options: AcquireOptions) -> Result<B::Resource> {
        if self.inner.backend.is_locked(key) {
            return Err(ResourceError::Locked {
                key: key.to_string(),
            });
        }
        self.inner
            .backend
            .open(key, options.read_only)
            .map_err(|err| err.into_resource_error(key))
    }

    /// Give back one reference. The last release closes the underlying resource.
    ///
    /// Releasing a handle whose entry is already gone (closed by a forced cleanup, or replaced by
    /// a newer incarnation) only logs; the resource is never closed twice.
    pub fn release(&self, handle: Handle<B::Resource>) {
        let key = handle.key().to_string();
        let id = handle.id();
        drop(handle);

        let mut registry = self.lock();
        let remaining = match registry.slots.get_mut(&key) {
            Some(Slot::Live(entry)) if entry.shared.id == id => {
                entry.refcount = entry.refcount.saturating_sub(1);
                entry.refcount
            }
            _ => {
                log::debug!("ignoring release of `{key}` {id}: handle is no longer registered");
                return;
            }
        };
        if remaining > 0 {
            log::trace!("released `{key}` (refcount {remaining})");
            return;
        }

        let Some(Slot::Live(entry)) = registry.slots.insert(key.clone(), Slot::Closing) else {
            return;
        };
        registry.live -= 1;
        self.publish_active(&registry);
        drop(registry);

        let _placeholder = Placeholder::new(self, key.clone());
        if let Err(err) = self.close_entry(&entry) {
            log::warn!("failed to close `{key}`: {err}");
        }
    }

    /// Close one entry's resource. Counters are updated either way.
    fn close_entry(&self, entry: &Entry<B::Resource>) -> Result<()> {
        let shared = &entry.shared;
        let result = shared.mark_closed().and_then(|()| {
            self.inner
                .backend
                .close(&shared.resource)
                .map_err(|err| err.into_resource_error(&shared.key))
        });

        let mut registry = self.lock();
        registry.counters.total_closed += 1;
        if result.is_err() {
            registry.counters.close_failures += 1;
        } else {
            log::debug!("closed `{}` {}", shared.key, shared.id);
        }
        result
    }

    /// Acquire every path or none of them.
    ///
    /// Duplicate paths are acquired once. On the first failure, every acquisition made by this
    /// call is released again (newest first) and the failing key's error is returned. Entries that
    /// other callers already held only lose the reference this call added.
    pub fn acquire_bulk<I, P>(&self, paths: I, options: AcquireOptions) -> Result<BulkHandles<B::Resource>>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut keys = Vec::new();
        let mut seen = HashSet::new();
        for path in paths {
            let key = canonical(path.as_ref())?;
            if seen.insert(key.clone()) {
                keys.push(key);
            }
        }

        let mut acquired: Vec<Handle<B::Resource>> = Vec::with_capacity(keys.len());
        let mut newly_opened = 0usize;
        for key in keys {
            match self.acquire_key(key, options) {
                Ok((handle, opened)) => {
                    newly_opened += usize::from(opened);
                    acquired.push(handle);
                }
                Err(err) => {
                    let rolled_back = acquired.len();
                    while let Some(handle) = acquired.pop() {
                        self.release(handle);
                    }
                    log::warn!(
                        "bulk acquisition failed at `{}`; rolled back {rolled_back} handle(s) \
                         ({newly_opened} opened by this batch): {err}",
                        err.key().unwrap_or("?")
                    );
                    return Err(err);
                }
            }
        }
        Ok(BulkHandles { handles: acquired })
    }

    /// Close every registered resource regardless of refcount, then run the cleanup callbacks.
    ///
    /// Resources close newest first. Failures are collected across the whole pass and reported
    /// once at the end; outstanding handles become closed and their later release is a no-op.
    pub fn force_cleanup_all(&self) -> std::result::Result<CleanupReport, CleanupFailed> {
        let mut registry = self.lock();
        let live_keys: Vec<String> = registry
            .slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Live(_)))
            .map(|(key, _)| key.clone())
            .collect();
        let mut entries = Vec::with_capacity(live_keys.len());
        for key in live_keys {
            if let Some(Slot::Live(entry)) = registry.slots.insert(key.clone(), Slot::Closing) {
                registry.live -= 1;
                entries.push((key, entry));
            }
        }
        self.publish_active(&registry);
        drop(registry);

        entries.sort_by(|(_, a), (_, b)| b.shared.id.cmp(&a.shared.id));
        log::debug!("forced cleanup of {} open resource(s)", entries.len());

        // Every placeholder exists before the first close runs, so an unwinding close still
        // clears the keys that were not reached.
        let pending: Vec<_> = entries
            .into_iter()
            .map(|(key, entry)| (Placeholder::new(self, key.clone()), key, entry))
            .collect();

        let mut failures = Vec::new();
        let mut handles_closed = 0;
        for (_placeholder, key, entry) in pending {
            if entry.refcount > 0 {
                log::debug!(
                    "force-closing `{key}` with {} outstanding reference(s)",
                    entry.refcount
                );
            }
            match self.close_entry(&entry) {
                Ok(()) => handles_closed += 1,
                Err(err) => {
                    log::warn!("failed to close `{key}` during forced cleanup: {err}");
                    failures.push(CleanupFailure {
                        step: CleanupStep::Close { key },
                        message: err.to_string(),
                    });
                }
            }
        }

        let callbacks_run = match self.inner.cleanup.run_all() {
            Ok(count) => count,
            Err(err) => {
                failures.extend(err.failures);
                0
            }
        };

        if failures.is_empty() {
            Ok(CleanupReport {
                handles_closed,
                callbacks_run,
            })
        } else {
            Err(CleanupFailed { failures })
        }
    }

    /// Mark `handle` as used just now.
    pub fn touch(&self, handle: &Handle<B::Resource>) -> Result<()> {
        let mut registry = self.lock();
        match registry.slots.get_mut(handle.key()) {
            Some(Slot::Live(entry)) if entry.shared.id == handle.id() => {
                entry.touch();
                Ok(())
            }
            _ => Err(ResourceError::HandleClosed {
                key: handle.key().to_string(),
            }),
        }
    }

    pub fn handle_info(&self, path: impl AsRef<Path>) -> Option<ResourceHandle> {
        let key = canonical(path.as_ref()).ok()?;
        match self.lock().slots.get(&key) {
            Some(Slot::Live(entry)) => Some(entry.view()),
            _ => None,
        }
    }

    pub fn refcount(&self, path: impl AsRef<Path>) -> usize {
        self.handle_info(path).map_or(0, |info| info.refcount)
    }

    /// Every live entry, sorted by key.
    pub fn handles(&self) -> Vec<ResourceHandle> {
        let mut views: Vec<_> = self
            .lock()
            .slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Live(entry) => Some(entry.view()),
                _ => None,
            })
            .collect();
        views.sort_by(|a, b| a.key.cmp(&b.key));
        views
    }

    /// Live entries nobody has acquired or touched for at least `max_idle`.
    ///
    /// In a long session these are the usual suspects for handles that were never released.
    pub fn idle_handles(&self, max_idle: Duration) -> Vec<ResourceHandle> {
        self.handles()
            .into_iter()
            .filter(|view| view.idle_for >= max_idle)
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.lock().live
    }

    pub fn stats(&self) -> ResourceStats {
        let registry = self.lock();
        ResourceStats {
            active_count: registry.live,
            total_opened_ever: registry.counters.total_opened_ever,
            total_leaks_detected: self.inner.monitor.leaks_detected(),
            total_closed: registry.counters.total_closed,
            open_failures: registry.counters.open_failures,
            close_failures: registry.counters.close_failures,
        }
    }

    /// [`MemoryMonitor::monitor_operation`] on this manager's monitor.
    pub fn monitor_operation<T>(&self, name: &str, operation: impl FnOnce() -> T) -> T {
        self.inner.monitor.monitor_operation(name, operation)
    }
}

/// Handles from one [`ResourceManager::acquire_bulk`] call, in acquisition order.
pub struct BulkHandles<R> {
    handles: Vec<Handle<R>>,
}

impl<R> BulkHandles<R> {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Handle<R>> {
        self.handles.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.handles.iter().map(Handle::key)
    }

    /// Look up the handle acquired for `path`.
    pub fn get(&self, path: impl AsRef<Path>) -> Option<&Handle<R>> {
        let key = canonical(path.as_ref()).ok()?;
        self.handles.iter().find(|handle| handle.key() == key)
    }

    pub fn into_vec(self) -> Vec<Handle<R>> {
        self.handles
    }
}

impl<R> std::fmt::Debug for BulkHandles<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.handles.iter()).finish()
    }
}
