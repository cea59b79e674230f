use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use opsdeck_protocol::ActionKind;
use tracing::trace;

use crate::ControlError;

/// Single-flight lock keyed by target id. At most one control action per
/// target may be in flight; a second acquisition fails fast instead of
/// queueing. Targets never contend with each other.
#[derive(Default)]
pub struct ActionGuard {
    active: Mutex<HashMap<String, ActionKind>>,
}

impl ActionGuard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim the target for `kind`. The returned permit releases the entry
    /// when dropped, so every exit path of the guarded operation releases.
    pub fn acquire(
        self: &Arc<Self>,
        target: &str,
        kind: ActionKind,
    ) -> Result<ActionPermit, ControlError> {
        let mut map = self.active.lock().expect("action guard map lock poisoned");
        if let Some(existing) = map.get(target) {
            return Err(ControlError::AlreadyInProgress {
                target: target.to_string(),
                kind: *existing,
            });
        }
        map.insert(target.to_string(), kind);
        trace!(target: "opsdeck::guard", id = %target, kind = %kind, "lock acquired");
        Ok(ActionPermit {
            guard: Arc::clone(self),
            target: target.to_string(),
            kind,
            released: false,
        })
    }

    /// Kind of the action currently holding the target, if any.
    pub fn current(&self, target: &str) -> Option<ActionKind> {
        self.active
            .lock()
            .expect("action guard map lock poisoned")
            .get(target)
            .copied()
    }

    fn release(&self, target: &str) {
        let mut map = self.active.lock().expect("action guard map lock poisoned");
        if map.remove(target).is_some() {
            trace!(target: "opsdeck::guard", id = %target, "lock released");
        }
    }
}

/// Scoped claim on a target. Dropping releases the lock; [`release`] does
/// the same eagerly and is idempotent.
///
/// [`release`]: ActionPermit::release
pub struct ActionPermit {
    guard: Arc<ActionGuard>,
    target: String,
    kind: ActionKind,
    released: bool,
}

impl ActionPermit {
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.guard.release(&self.target);
        }
    }
}

impl Drop for ActionPermit {
    fn drop(&mut self) {
        self.release_inner();
    }
}
