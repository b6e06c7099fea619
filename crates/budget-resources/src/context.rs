use std::sync::Arc;

use crate::auto_cleanup::AutoCleanup;
use crate::backend::{FsBackend, ResourceBackend};
use crate::cleanup::CleanupCoordinator;
use crate::config::ResourceConfig;
use crate::error::CleanupFailed;
use crate::manager::{CleanupReport, ResourceManager, ResourceStats};
use crate::memory::{default_probe, MemoryMonitor, MemoryProbe};
use crate::scope::ScopedContext;

/// The resource layer of one application, wired together from a [`ResourceConfig`].
///
/// Build it once at startup and pass it (or an `Arc` of it) to whatever needs resources. The
/// manager, monitor and cleanup coordinator it hands out are shared, so the context can be torn
/// down with [`ResourceContext::shutdown`] while collaborators still hold clones.
pub struct ResourceContext<B: ResourceBackend> {
    config: ResourceConfig,
    manager: ResourceManager<B>,
}

impl ResourceContext<FsBackend> {
    /// Context over workbook files on disk.
    pub fn for_filesystem(config: ResourceConfig) -> Self {
        Self::new(config, FsBackend::new())
    }
}

impl<B: ResourceBackend> ResourceContext<B> {
    pub fn new(config: ResourceConfig, backend: B) -> Self {
        Self::with_probe(config, backend, default_probe())
    }

    pub fn with_probe(config: ResourceConfig, backend: B, probe: Box<dyn MemoryProbe>) -> Self {
        let config = config.normalized();
        let monitor = Arc::new(MemoryMonitor::with_probe(&config, probe));
        let cleanup = Arc::new(CleanupCoordinator::new());
        log::debug!(
            "resource context ready (threshold {} bytes, debug {}, auto-cleanup {:?})",
            config.memory_threshold_bytes,
            config.debug_mode,
            config.auto_cleanup_interval()
        );
        Self {
            config,
            manager: ResourceManager::new(backend, monitor, cleanup),
        }
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    pub fn manager(&self) -> &ResourceManager<B> {
        &self.manager
    }

    pub fn monitor(&self) -> &Arc<MemoryMonitor> {
        self.manager.monitor()
    }

    pub fn cleanup(&self) -> &Arc<CleanupCoordinator> {
        self.manager.cleanup()
    }

    pub fn scoped(&self) -> ScopedContext<'_, B> {
        ScopedContext::new(&self.manager)
    }

    pub fn stats(&self) -> ResourceStats {
        self.manager.stats()
    }

    /// Start the periodic cleanup task, or `None` when the configured interval is zero.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_auto_cleanup(&self) -> Option<AutoCleanup> {
        let interval = self.config.auto_cleanup_interval()?;
        Some(AutoCleanup::spawn(
            self.manager.clone(),
            interval,
            self.config.debug_mode,
        ))
    }

    /// Close every open handle and run every cleanup callback.
    pub fn shutdown(&self) -> Result<CleanupReport, CleanupFailed> {
        let report = self.manager.force_cleanup_all()?;
        log::info!(
            "resource context shut down: {} handle(s) closed, {} callback(s) run",
            report.handles_closed,
            report.callbacks_run
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::handle::AcquireOptions;
    use crate::memory::NullProbe;

    #[test]
    fn shutdown_closes_handles_and_runs_callbacks() {
        let context = ResourceContext::with_probe(
            ResourceConfig::default(),
            InMemoryBackend::new(),
            Box::new(NullProbe),
        );
        context.manager().backend().insert("/budgets/a.xlsx", b"PK".to_vec());
        let flushed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&flushed);
        context.cleanup().register("flush", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let _handle = context
            .manager()
            .acquire("/budgets/a.xlsx", AcquireOptions::read_only())
            .expect("acquire");
        assert_eq!(context.stats().active_count, 1);

        let report = context.shutdown().expect("shutdown");
        assert_eq!(report.handles_closed, 1);
        assert_eq!(report.callbacks_run, 1);
        assert_eq!(flushed.load(Ordering::SeqCst), 1);
        assert_eq!(context.stats().active_count, 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn zero_interval_disables_auto_cleanup() {
        let config = ResourceConfig {
            auto_cleanup_interval_seconds: 0,
            ..ResourceConfig::default()
        };
        let context = ResourceContext::with_probe(config, InMemoryBackend::new(), Box::new(NullProbe));
        assert!(context.spawn_auto_cleanup().is_none());

        let context = ResourceContext::with_probe(
            ResourceConfig::default(),
            InMemoryBackend::new(),
            Box::new(NullProbe),
        );
        let task = context.spawn_auto_cleanup().expect("default interval enables the task");
        assert!(task.is_running());
        task.shutdown().await.expect("shutdown");
    }
}
