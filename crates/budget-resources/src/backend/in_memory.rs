use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{BackendError, ResourceBackend};

#[derive(Debug, Clone)]
enum Document {
    Valid(Arc<Vec<u8>>),
    Malformed(String),
}

#[derive(Debug, Default)]
struct State {
    documents: HashMap<String, Document>,
    locked: HashSet<String>,
    failing_closes: HashSet<String>,
    opens: HashMap<String, usize>,
    closes: HashMap<String, usize>,
    close_order: Vec<String>,
}

/// Backend over an in-memory set of documents.
///
/// Used for embedding the core without touching disk (and throughout the test-suite): documents
/// can be marked malformed or locked, closes can be made to fail, and every open/close is counted
/// per key.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    state: Mutex<State>,
    open_delay: Option<Duration>,
}

/// A document opened from an [`InMemoryBackend`].
#[derive(Debug, Clone)]
pub struct InMemoryResource {
    key: String,
    read_only: bool,
    bytes: Arc<Vec<u8>>,
}

impl InMemoryResource {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

fn key_for(path: impl AsRef<Path>) -> String {
    let path = path.as_ref();
    budget_fs::canonical_key(path)
        .map(|key| key.to_string_lossy().into_owned())
        .unwrap_or_else(|_| path.to_string_lossy().into_owned())
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `delay` inside every `open`, widening race windows in concurrency tests.
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("in-memory backend mutex poisoned")
    }

    /// Add (or replace) a document. Returns its canonical key.
    pub fn insert(&self, path: impl AsRef<Path>, bytes: impl Into<Vec<u8>>) -> String {
        let key = key_for(path);
        self.lock()
            .documents
            .insert(key.clone(), Document::Valid(Arc::new(bytes.into())));
        key
    }

    /// Add a document whose open is rejected as malformed with `reason`.
    pub fn insert_malformed(&self, path: impl AsRef<Path>, reason: impl Into<String>) -> String {
        let key = key_for(path);
        self.lock()
            .documents
            .insert(key.clone(), Document::Malformed(reason.into()));
        key
    }

    pub fn set_locked(&self, path: impl AsRef<Path>, locked: bool) {
        let key = key_for(path);
        let mut state = self.lock();
        if locked {
            state.locked.insert(key);
        } else {
            state.locked.remove(&key);
        }
    }

    /// Make every close of `path` report an error (the resource still counts as closed).
    pub fn fail_close(&self, path: impl AsRef<Path>) {
        let key = key_for(path);
        self.lock().failing_closes.insert(key);
    }

    pub fn open_count(&self, path: impl AsRef<Path>) -> usize {
        let key = key_for(path);
        self.lock().opens.get(&key).copied().unwrap_or(0)
    }

    pub fn close_count(&self, path: impl AsRef<Path>) -> usize {
        let key = key_for(path);
        self.lock().closes.get(&key).copied().unwrap_or(0)
    }

    pub fn total_opens(&self) -> usize {
        self.lock().opens.values().sum()
    }

    pub fn total_closes(&self) -> usize {
        self.lock().closes.values().sum()
    }

    /// Keys in the order their resources were closed.
    pub fn close_order(&self) -> Vec<String> {
        self.lock().close_order.clone()
    }
}

impl ResourceBackend for InMemoryBackend {
    type Resource = InMemoryResource;

    fn open(&self, key: &str, read_only: bool) -> Result<InMemoryResource, BackendError> {
        if let Some(delay) = self.open_delay {
            std::thread::sleep(delay);
        }
        let mut state = self.lock();
        if state.locked.contains(key) {
            return Err(BackendError::Locked);
        }
        let bytes = match state.documents.get(key) {
            Some(Document::Valid(bytes)) => Arc::clone(bytes),
            Some(Document::Malformed(reason)) => return Err(BackendError::Malformed(reason.clone())),
            None => return Err(BackendError::NotFound),
        };
        *state.opens.entry(key.to_string()).or_default() += 1;
        Ok(InMemoryResource {
            key: key.to_string(),
            read_only,
            bytes,
        })
    }

    fn close(&self, resource: &InMemoryResource) -> Result<(), BackendError> {
        let mut state = self.lock();
        *state.closes.entry(resource.key.clone()).or_default() += 1;
        state.close_order.push(resource.key.clone());
        if state.failing_closes.contains(&resource.key) {
            return Err(BackendError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("simulated close failure for `{}`", resource.key),
            )));
        }
        Ok(())
    }

    fn is_locked(&self, key: &str) -> bool {
        self.lock().locked.contains(key)
    }
}
