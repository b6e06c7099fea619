use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::error::{CleanupFailed, CleanupFailure, CleanupStep};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CallbackId(u64);

impl CallbackId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

type Action = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

struct Registered {
    id: CallbackId,
    name: String,
    action: Action,
}

/// Registry of cleanup callbacks that are not tied to any single resource.
///
/// A pass runs callbacks newest first, mirroring scoped release order. Every callback runs even
/// if an earlier one fails or panics; the failures are returned together at the end. Callbacks
/// stay registered, so each later pass runs them again.
#[derive(Default)]
pub struct CleanupCoordinator {
    callbacks: Mutex<Vec<Registered>>,
    next_id: AtomicU64,
}

impl CleanupCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        name: impl Into<String>,
        action: impl Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> CallbackId {
        let id = CallbackId::new(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let name = name.into();
        log::debug!("registered cleanup callback `{name}` (#{})", id.get());
        self.callbacks
            .lock()
            .expect("cleanup registry mutex poisoned")
            .push(Registered {
                id,
                name,
                action: Arc::new(action),
            });
        id
    }

    /// Remove a callback. Returns `false` if `id` was not registered.
    pub fn unregister(&self, id: CallbackId) -> bool {
        let mut callbacks = self.callbacks.lock().expect("cleanup registry mutex poisoned");
        let before = callbacks.len();
        callbacks.retain(|registered| registered.id != id);
        callbacks.len() != before
    }

    pub fn len(&self) -> usize {
        self.callbacks
            .lock()
            .expect("cleanup registry mutex poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run one cleanup pass. Returns how many callbacks ran.
    pub fn run_all(&self) -> Result<usize, CleanupFailed> {
        // Callbacks run without the registry lock so they may (un)register freely.
        let pass: Vec<(CallbackId, String, Action)> = self
            .callbacks
            .lock()
            .expect("cleanup registry mutex poisoned")
            .iter()
            .rev()
            .map(|registered| {
                (
                    registered.id,
                    registered.name.clone(),
                    Arc::clone(&registered.action),
                )
            })
            .collect();

        let mut failures = Vec::new();
        for (id, name, action) in &pass {
            let message = match panic::catch_unwind(AssertUnwindSafe(|| action())) {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => format!("{err:#}"),
                Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
            };
            log::warn!("cleanup callback `{name}` (#{}) failed: {message}", id.get());
            failures.push(CleanupFailure {
                step: CleanupStep::Callback {
                    id: *id,
                    name: name.clone(),
                },
                message,
            });
        }

        if failures.is_empty() {
            Ok(pass.len())
        } else {
            Err(CleanupFailed { failures })
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Action) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_for = Arc::clone(&log);
        let make = move |name: &'static str| -> Action {
            let log = Arc::clone(&log_for);
            Arc::new(move || {
                log.lock().expect("log").push(name);
                Ok(())
            })
        };
        (log, make)
    }

    #[test]
    fn runs_newest_first() {
        let coordinator = CleanupCoordinator::new();
        let (log, make) = recorder();
        for name in ["first", "second", "third"] {
            let action = make(name);
            coordinator.register(name, move || action());
        }

        assert_eq!(coordinator.run_all().expect("clean pass"), 3);
        assert_eq!(*log.lock().expect("log"), vec!["third", "second", "first"]);
    }

    #[test]
    fn failing_and_panicking_callbacks_do_not_stop_the_pass() {
        let coordinator = CleanupCoordinator::new();
        let (log, make) = recorder();

        let a = make("a");
        coordinator.register("a", move || {
            a()?;
            anyhow::bail!("autosave database busy")
        });
        coordinator.register("b", || panic!("temp dir vanished"));
        let c = make("c");
        coordinator.register("c", move || c());

        let err = coordinator.run_all().expect_err("two failures");
        assert_eq!(err.failures.len(), 2);
        assert!(err.mentions_callback("a"));
        assert!(err.mentions_callback("b"));
        assert!(err.to_string().contains("autosave database busy"));
        assert!(err.to_string().contains("temp dir vanished"));
        assert_eq!(*log.lock().expect("log"), vec!["c", "a"]);
    }

    #[test]
    fn callbacks_run_once_per_pass_until_unregistered() {
        let coordinator = CleanupCoordinator::new();
        let (log, make) = recorder();
        let action = make("flush");
        let id = coordinator.register("flush", move || action());

        coordinator.run_all().expect("first pass");
        coordinator.run_all().expect("second pass");
        assert_eq!(log.lock().expect("log").len(), 2);

        assert!(coordinator.unregister(id));
        assert!(!coordinator.unregister(id));
        assert!(coordinator.is_empty());
        assert_eq!(coordinator.run_all().expect("empty pass"), 0);
        assert_eq!(log.lock().expect("log").len(), 2);
    }
}
