use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{ResourceError, Result};

/// Lifecycle of a registry entry.
///
/// `Unopened -> Open -> Closed` on the happy path, `Unopened -> Failed` when the open is rejected.
/// `Closed` and `Failed` are terminal: a later acquire of the same key creates a fresh entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HandleState {
    Unopened,
    Open,
    Closed,
    Failed,
}

impl HandleState {
    pub fn can_transition_to(self, next: HandleState) -> bool {
        matches!(
            (self, next),
            (HandleState::Unopened, HandleState::Open)
                | (HandleState::Unopened, HandleState::Failed)
                | (HandleState::Open, HandleState::Closed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, HandleState::Closed | HandleState::Failed)
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub(crate) fn advance(&mut self, next: HandleState, key: &str) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(ResourceError::InvalidTransition {
                key: key.to_string(),
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }
}

/// Identifies one incarnation of a registry entry.
///
/// Reopening a key after it was closed yields a new id, so tokens from the old incarnation are
/// recognised as stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct HandleId(u64);

impl HandleId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquireOptions {
    pub read_only: bool,
}

impl AcquireOptions {
    pub fn read_only() -> Self {
        Self { read_only: true }
    }

    pub fn read_write() -> Self {
        Self { read_only: false }
    }
}

/// Point-in-time view of a registry entry, suitable for diagnostics surfaces.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceHandle {
    pub id: HandleId,
    pub key: String,
    pub state: HandleState,
    pub refcount: usize,
    pub read_only: bool,
    pub opened_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    /// Time since `last_access` when this view was taken.
    pub idle_for: Duration,
}

pub(crate) struct Shared<R> {
    pub(crate) id: HandleId,
    pub(crate) key: String,
    pub(crate) read_only: bool,
    pub(crate) resource: R,
    state: Mutex<HandleState>,
}

impl<R> Shared<R> {
    /// State for a resource the backend has just opened.
    pub(crate) fn open(id: HandleId, key: String, read_only: bool, resource: R) -> Self {
        Self {
            id,
            key,
            read_only,
            resource,
            state: Mutex::new(HandleState::Open),
        }
    }

    pub(crate) fn state(&self) -> HandleState {
        *self.state.lock().expect("handle state mutex poisoned")
    }

    pub(crate) fn mark_closed(&self) -> Result<()> {
        self.state
            .lock()
            .expect("handle state mutex poisoned")
            .advance(HandleState::Closed, &self.key)
    }
}

/// Opaque token for one acquisition of a registered resource.
///
/// Tokens are not clonable: each one stands for exactly one reference the caller must give back
/// through [`ResourceManager::release`](crate::ResourceManager::release), ideally via
/// [`ScopedContext`](crate::ScopedContext).
pub struct Handle<R> {
    pub(crate) shared: Arc<Shared<R>>,
}

impl<R> Handle<R> {
    pub(crate) fn new(shared: Arc<Shared<R>>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> HandleId {
        self.shared.id
    }

    pub fn key(&self) -> &str {
        &self.shared.key
    }

    pub fn is_read_only(&self) -> bool {
        self.shared.read_only
    }

    pub fn state(&self) -> HandleState {
        self.shared.state()
    }

    /// Borrow the underlying resource.
    ///
    /// Fails with [`ResourceError::HandleClosed`] once the entry has been closed, e.g. by a
    /// forced cleanup while this token was still held.
    pub fn resource(&self) -> Result<&R> {
        match self.state() {
            HandleState::Open => Ok(&self.shared.resource),
            _ => Err(ResourceError::HandleClosed {
                key: self.shared.key.clone(),
            }),
        }
    }
}

impl<R> fmt::Debug for Handle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.shared.id)
            .field("key", &self.shared.key)
            .field("read_only", &self.shared.read_only)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_lifecycle_transitions_are_allowed() {
        use HandleState::*;
        let all = [Unopened, Open, Closed, Failed];
        let allowed = [(Unopened, Open), (Unopened, Failed), (Open, Closed)];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from:?} -> {to:?}"
                );
            }
        }
        assert!(Closed.is_terminal());
        assert!(Failed.is_terminal());
        assert!(!Open.is_terminal());
    }

    #[test]
    fn closed_handle_cannot_reopen_or_close_twice() {
        let shared = Shared::open(HandleId::new(1), "/budgets/a.xlsx".to_string(), true, ());
        shared.mark_closed().expect("first close");

        let err = shared.mark_closed().expect_err("second close");
        assert!(matches!(
            err,
            ResourceError::InvalidTransition {
                from: HandleState::Closed,
                to: HandleState::Closed,
                ..
            }
        ));

        let mut state = shared.state();
        assert!(state.advance(HandleState::Open, &shared.key).is_err());
    }

    #[test]
    fn resource_is_unavailable_after_close() {
        let handle = Handle::new(Arc::new(
            Shared::open(HandleId::new(2), "/budgets/b.xlsx".to_string(), false, 42u32),
        ));
        assert_eq!(*handle.resource().expect("open resource"), 42);

        handle.shared.mark_closed().expect("close");
        assert_eq!(handle.state(), HandleState::Closed);
        assert!(matches!(
            handle.resource(),
            Err(ResourceError::HandleClosed { .. })
        ));
    }
}
