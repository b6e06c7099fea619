#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use budget_resources::{
    CleanupCoordinator, InMemoryBackend, MemoryMonitor, MemoryProbe, NullProbe, ResourceConfig,
    ResourceManager,
};

/// Probe whose resident figure the test moves by hand.
#[derive(Debug, Default)]
pub struct ScriptedProbe {
    resident: AtomicU64,
}

impl ScriptedProbe {
    pub fn set_resident(&self, bytes: u64) {
        self.resident.store(bytes, Ordering::SeqCst);
    }

    pub fn grow(&self, bytes: u64) {
        self.resident.fetch_add(bytes, Ordering::SeqCst);
    }
}

pub struct SharedProbe(pub Arc<ScriptedProbe>);

impl MemoryProbe for SharedProbe {
    fn process_memory_bytes(&self) -> u64 {
        self.0.resident.load(Ordering::SeqCst)
    }

    fn system_available_bytes(&self) -> u64 {
        8 * 1024 * 1024 * 1024
    }
}

pub fn manager_with(backend: InMemoryBackend, config: &ResourceConfig) -> ResourceManager<InMemoryBackend> {
    let monitor = MemoryMonitor::with_probe(config, Box::new(NullProbe));
    ResourceManager::new(backend, Arc::new(monitor), Arc::new(CleanupCoordinator::new()))
}

pub fn manager() -> ResourceManager<InMemoryBackend> {
    manager_with(InMemoryBackend::new(), &ResourceConfig::default())
}

/// Manager whose monitor reads from the returned probe.
pub fn scripted_manager(config: &ResourceConfig) -> (ResourceManager<InMemoryBackend>, Arc<ScriptedProbe>) {
    let probe = Arc::new(ScriptedProbe::default());
    let monitor = MemoryMonitor::with_probe(config, Box::new(SharedProbe(Arc::clone(&probe))));
    let manager = ResourceManager::new(
        InMemoryBackend::new(),
        Arc::new(monitor),
        Arc::new(CleanupCoordinator::new()),
    );
    (manager, probe)
}

pub const MIB: u64 = 1024 * 1024;
