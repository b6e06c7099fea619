use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::backend::ResourceBackend;
use crate::manager::ResourceManager;

pub const AUTO_CLEANUP_LABEL: &str = "auto-cleanup";

#[derive(Debug, Default)]
struct Shared {
    ticks: AtomicU64,
    pressure_passes: AtomicU64,
    stopped: AtomicBool,
}

/// Background task that watches memory and runs the cleanup callbacks under pressure.
///
/// Every tick takes a snapshot labelled [`AUTO_CLEANUP_LABEL`]. When resident memory is above
/// `memory_pressure_bytes` the task runs [`CleanupCoordinator::run_all`] and reports handles that
/// have been idle for at least one interval. It never closes a registered resource, since every
/// registry entry still has a holder; full teardown is [`ResourceManager::force_cleanup_all`].
///
/// Dropping the handle aborts the task. A tick already running on the blocking pool still
/// finishes its snapshot, but skips the cleanup pass once the handle is stopped or dropped.
///
/// [`CleanupCoordinator::run_all`]: crate::CleanupCoordinator::run_all
#[derive(Debug)]
pub struct AutoCleanup {
    shared: Arc<Shared>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl AutoCleanup {
    /// Spawn the task onto the current tokio runtime.
    ///
    /// The first tick fires one full `interval` after spawning. Must be called from within a
    /// runtime.
    pub fn spawn<B: ResourceBackend>(
        manager: ResourceManager<B>,
        interval: Duration,
        debug_mode: bool,
    ) -> Self {
        let shared = Arc::new(Shared::default());
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let task_shared = Arc::clone(&shared);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            log::debug!("auto-cleanup started (interval {interval:?})");

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {}
                }

                let manager = manager.clone();
                let tick_shared = Arc::clone(&task_shared);
                let pressure = tokio::task::spawn_blocking(move || {
                    run_tick(&manager, interval, debug_mode, &tick_shared.stopped)
                })
                .await;
                task_shared.ticks.fetch_add(1, Ordering::Relaxed);
                match pressure {
                    Ok(true) => {
                        task_shared.pressure_passes.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(false) => {}
                    Err(err) => log::error!("auto-cleanup tick panicked: {err}"),
                }
            }

            log::debug!("auto-cleanup stopped");
        });

        Self {
            shared,
            stop: Some(stop_tx),
            task: Some(task),
        }
    }

    /// Ticks completed so far.
    pub fn tick_count(&self) -> u64 {
        self.shared.ticks.load(Ordering::Relaxed)
    }

    /// Ticks that found the process under pressure and ran the cleanup callbacks.
    pub fn pressure_pass_count(&self) -> u64 {
        self.shared.pressure_passes.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop the task and wait for it to exit.
    pub async fn shutdown(mut self) -> Result<(), tokio::task::JoinError> {
        self.shared.stopped.store(true, Ordering::SeqCst);
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match self.task.take() {
            Some(task) => task.await,
            None => Ok(()),
        }
    }
}

impl Drop for AutoCleanup {
    fn drop(&mut self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// One tick. Returns whether a pressure pass ran.
fn run_tick<B: ResourceBackend>(
    manager: &ResourceManager<B>,
    interval: Duration,
    debug_mode: bool,
    stopped: &AtomicBool,
) -> bool {
    let snapshot = manager.monitor().snapshot(AUTO_CLEANUP_LABEL);
    if debug_mode {
        let stats = manager.stats();
        log::debug!(
            "auto-cleanup: {} bytes resident, {} active handle(s), {} opened ever, {} leak(s)",
            snapshot.process_memory_bytes,
            stats.active_count,
            stats.total_opened_ever,
            stats.total_leaks_detected
        );
    }

    if !manager.monitor().under_pressure() || stopped.load(Ordering::SeqCst) {
        return false;
    }

    log::warn!(
        "auto-cleanup: {} bytes resident exceeds pressure limit of {} bytes",
        snapshot.process_memory_bytes,
        manager.monitor().pressure_bytes().unwrap_or_default()
    );
    for idle in manager.idle_handles(interval) {
        log::warn!(
            "auto-cleanup: `{}` {} held by {} reference(s), idle for {:?}",
            idle.key,
            idle.id,
            idle.refcount,
            idle.idle_for
        );
    }
    match manager.cleanup().run_all() {
        Ok(count) => log::info!("auto-cleanup ran {count} cleanup callback(s)"),
        Err(err) => log::error!("auto-cleanup: {err}"),
    }
    true
}
