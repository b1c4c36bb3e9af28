//! Tracks every in-flight and completed operation. This is the one
//! structure mutated concurrently by multiple operation lifecycles, so all
//! registration and removal is serialized behind a single lock.

use crate::operation::OperationHandle;
use std::sync::Mutex;
use uuid::Uuid;

struct RegistryInner {
    active: Vec<OperationHandle>,
    history: Vec<OperationHandle>,
    history_limit: usize,
}

pub struct OperationRegistry {
    inner: Mutex<RegistryInner>,
}

impl OperationRegistry {
    pub fn new(history_limit: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                active: Vec::new(),
                history: Vec::new(),
                history_limit,
            }),
        }
    }

    pub(crate) fn register(&self, handle: OperationHandle) {
        let mut inner = self.inner.lock().unwrap();
        inner.active.push(handle);
    }

    /// Move a terminal operation out of the active set. Operations flagged
    /// suppress-history disappear entirely.
    pub(crate) fn finish(&self, id: Uuid) {
        let mut inner = self.inner.lock().unwrap();
        let Some(pos) = inner.active.iter().position(|h| h.id() == id) else {
            return;
        };
        let handle = inner.active.remove(pos);
        if !handle.suppress_history() {
            inner.history.push(handle);
            let limit = inner.history_limit;
            if inner.history.len() > limit {
                let excess = inner.history.len() - limit;
                inner.history.drain(..excess);
            }
        }
    }

    pub fn active(&self) -> Vec<OperationHandle> {
        self.inner.lock().unwrap().active.clone()
    }

    pub fn history(&self) -> Vec<OperationHandle> {
        self.inner.lock().unwrap().history.clone()
    }

    /// Active operations applying to the given object reference. Backs the
    /// at-most-one-in-progress affordance in selection UIs.
    pub fn operations_for(&self, object_ref: &str) -> Vec<OperationHandle> {
        self.inner
            .lock()
            .unwrap()
            .active
            .iter()
            .filter(|h| h.applies_to().iter().any(|r| r == object_ref))
            .cloned()
            .collect()
    }

    pub fn has_active_for(&self, object_ref: &str) -> bool {
        !self.operations_for(object_ref).is_empty()
    }
}
