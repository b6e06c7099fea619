//! Process memory observation.
//!
//! The monitor takes labelled snapshots, diffs them, and wraps operations with before/after
//! measurements. It is purely observational: nothing here ever changes the outcome of the work
//! it measures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::ResourceConfig;
use crate::error::{ResourceError, Result};

/// Source of memory figures.
pub trait MemoryProbe: Send + Sync {
    /// Resident memory of the current process, in bytes.
    fn process_memory_bytes(&self) -> u64;
    /// Memory the OS reports as available to new allocations, in bytes.
    fn system_available_bytes(&self) -> u64;
}

/// Probe that always reports zero. Used when `process-metrics` is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProbe;

impl MemoryProbe for NullProbe {
    fn process_memory_bytes(&self) -> u64 {
        0
    }

    fn system_available_bytes(&self) -> u64 {
        0
    }
}

#[cfg(feature = "process-metrics")]
pub use sysinfo_probe::SysinfoProbe;

#[cfg(feature = "process-metrics")]
mod sysinfo_probe {
    use std::sync::Mutex;

    use sysinfo::{Pid, System};

    use super::MemoryProbe;

    /// Best-effort, platform-dependent memory figures from `sysinfo`.
    pub struct SysinfoProbe {
        pid: Option<Pid>,
        system: Mutex<System>,
    }

    impl SysinfoProbe {
        pub fn new() -> Self {
            let pid = match sysinfo::get_current_pid() {
                Ok(pid) => Some(pid),
                Err(err) => {
                    log::warn!("process memory unavailable: {err}");
                    None
                }
            };
            Self {
                pid,
                system: Mutex::new(System::new()),
            }
        }
    }

    impl Default for SysinfoProbe {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MemoryProbe for SysinfoProbe {
        fn process_memory_bytes(&self) -> u64 {
            let Some(pid) = self.pid else {
                return 0;
            };
            let mut system = self.system.lock().expect("sysinfo mutex poisoned");
            if !system.refresh_process(pid) {
                log::debug!("process {pid:?} not found in sysinfo snapshot");
                return 0;
            }
            system.process(pid).map(|process| process.memory()).unwrap_or(0)
        }

        fn system_available_bytes(&self) -> u64 {
            let mut system = self.system.lock().expect("sysinfo mutex poisoned");
            system.refresh_memory();
            system.available_memory()
        }
    }
}

/// The default probe for this build.
pub fn default_probe() -> Box<dyn MemoryProbe> {
    #[cfg(feature = "process-metrics")]
    {
        Box::new(SysinfoProbe::new())
    }
    #[cfg(not(feature = "process-metrics"))]
    {
        Box::new(NullProbe)
    }
}

/// Number of live registry entries, published by the resource manager.
#[derive(Debug, Clone, Default)]
pub struct ActiveGauge(Arc<AtomicUsize>);

impl ActiveGauge {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn set(&self, value: usize) {
        self.0.store(value, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemorySnapshot {
    pub label: String,
    pub timestamp: DateTime<Utc>,
    pub process_memory_bytes: u64,
    pub system_available_bytes: u64,
    /// Registry active count when the snapshot was taken.
    pub active_handles: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SnapshotDiff {
    pub memory_delta_bytes: i64,
    pub elapsed: Duration,
    pub active_delta: i64,
}

#[derive(Debug, Clone)]
struct Recorded {
    snapshot: MemorySnapshot,
    taken: Instant,
}

fn delta(after: u64, before: u64) -> i64 {
    (i128::from(after) - i128::from(before)).clamp(i128::from(i64::MIN), i128::from(i64::MAX))
        as i64
}

fn diff_recorded(before: &Recorded, after: &Recorded) -> SnapshotDiff {
    SnapshotDiff {
        memory_delta_bytes: delta(
            after.snapshot.process_memory_bytes,
            before.snapshot.process_memory_bytes,
        ),
        elapsed: after.taken.saturating_duration_since(before.taken),
        active_delta: delta(
            after.snapshot.active_handles as u64,
            before.snapshot.active_handles as u64,
        ),
    }
}

pub struct MemoryMonitor {
    probe: Box<dyn MemoryProbe>,
    threshold_bytes: u64,
    pressure_bytes: Option<u64>,
    debug_mode: bool,
    active: ActiveGauge,
    snapshots: Mutex<HashMap<String, Recorded>>,
    leaks_detected: AtomicU64,
    threshold_breaches: AtomicU64,
}

impl MemoryMonitor {
    pub fn new(config: &ResourceConfig) -> Self {
        Self::with_probe(config, default_probe())
    }

    pub fn with_probe(config: &ResourceConfig, probe: Box<dyn MemoryProbe>) -> Self {
        let config = config.clone().normalized();
        Self {
            probe,
            threshold_bytes: config.memory_threshold_bytes,
            pressure_bytes: match config.memory_pressure_bytes {
                0 => None,
                bytes => Some(bytes),
            },
            debug_mode: config.debug_mode,
            active: ActiveGauge::default(),
            snapshots: Mutex::new(HashMap::new()),
            leaks_detected: AtomicU64::new(0),
            threshold_breaches: AtomicU64::new(0),
        }
    }

    /// The gauge the owning resource manager publishes its active count to.
    pub fn active_gauge(&self) -> ActiveGauge {
        self.active.clone()
    }

    pub fn threshold_bytes(&self) -> u64 {
        self.threshold_bytes
    }

    /// The resident-memory ceiling, or `None` when pressure detection is disabled.
    pub fn pressure_bytes(&self) -> Option<u64> {
        self.pressure_bytes
    }

    fn record(&self, label: String) -> Recorded {
        let recorded = Recorded {
            snapshot: MemorySnapshot {
                label: label.clone(),
                timestamp: Utc::now(),
                process_memory_bytes: self.probe.process_memory_bytes(),
                system_available_bytes: self.probe.system_available_bytes(),
                active_handles: self.active.get(),
            },
            taken: Instant::now(),
        };
        self.snapshots
            .lock()
            .expect("memory monitor mutex poisoned")
            .insert(label, recorded.clone());
        recorded
    }

    /// Capture current memory figures under `label`, replacing any earlier snapshot of that name.
    pub fn snapshot(&self, label: impl Into<String>) -> MemorySnapshot {
        self.record(label.into()).snapshot
    }

    pub fn latest(&self, label: &str) -> Option<MemorySnapshot> {
        self.snapshots
            .lock()
            .expect("memory monitor mutex poisoned")
            .get(label)
            .map(|recorded| recorded.snapshot.clone())
    }

    pub fn labels(&self) -> Vec<String> {
        let mut labels: Vec<_> = self
            .snapshots
            .lock()
            .expect("memory monitor mutex poisoned")
            .keys()
            .cloned()
            .collect();
        labels.sort();
        labels
    }

    pub fn clear(&self) {
        self.snapshots
            .lock()
            .expect("memory monitor mutex poisoned")
            .clear();
    }

    pub fn diff(&self, before: &str, after: &str) -> Result<SnapshotDiff> {
        let snapshots = self.snapshots.lock().expect("memory monitor mutex poisoned");
        let lookup = |label: &str| {
            snapshots
                .get(label)
                .ok_or_else(|| ResourceError::SnapshotNotFound(label.to_string()))
        };
        Ok(diff_recorded(lookup(before)?, lookup(after)?))
    }

    /// Run `operation` between `"{name}:before"` and `"{name}:after"` snapshots.
    ///
    /// The after-snapshot is taken even if `operation` panics. Whatever `operation` returns is
    /// handed back untouched.
    pub fn monitor_operation<T>(&self, name: &str, operation: impl FnOnce() -> T) -> T {
        let before = self.record(format!("{name}:before"));
        let _watch = OperationWatch {
            monitor: self,
            name,
            before,
        };
        operation()
    }

    /// Operations that left more registry entries open than they found.
    pub fn leaks_detected(&self) -> u64 {
        self.leaks_detected.load(Ordering::SeqCst)
    }

    /// Operations whose memory growth exceeded the configured threshold.
    pub fn threshold_breaches(&self) -> u64 {
        self.threshold_breaches.load(Ordering::SeqCst)
    }

    /// Whether resident process memory currently sits above `memory_pressure_bytes`.
    ///
    /// Independent of `memory_threshold_bytes`, which bounds growth across one operation.
    pub fn under_pressure(&self) -> bool {
        self.pressure_bytes
            .is_some_and(|limit| self.probe.process_memory_bytes() > limit)
    }

    fn assess(&self, name: &str, diff: SnapshotDiff, panicked: bool) {
        let outcome = if panicked { "panicked" } else { "finished" };
        if self.debug_mode {
            log::debug!(
                "operation `{name}` {outcome}: memory {:+} bytes, active {:+}, took {:?}",
                diff.memory_delta_bytes,
                diff.active_delta,
                diff.elapsed
            );
        } else {
            log::trace!(
                "operation `{name}` {outcome}: memory {:+} bytes, active {:+}",
                diff.memory_delta_bytes,
                diff.active_delta
            );
        }

        if diff.memory_delta_bytes > 0 && diff.memory_delta_bytes as u64 > self.threshold_bytes {
            self.threshold_breaches.fetch_add(1, Ordering::SeqCst);
            log::warn!(
                "operation `{name}` grew process memory by {} bytes (threshold {} bytes)",
                diff.memory_delta_bytes,
                self.threshold_bytes
            );
        }

        if diff.active_delta > 0 {
            self.leaks_detected.fetch_add(1, Ordering::SeqCst);
            log::warn!(
                "leak suspected in `{name}`: {} more resource handle(s) open than before",
                diff.active_delta
            );
        }
    }
}

struct OperationWatch<'a> {
    monitor: &'a MemoryMonitor,
    name: &'a str,
    before: Recorded,
}

impl Drop for OperationWatch<'_> {
    fn drop(&mut self) {
        let after = self.monitor.record(format!("{}:after", self.name));
        self.monitor.assess(
            self.name,
            diff_recorded(&self.before, &after),
            std::thread::panicking(),
        );
    }
}
