//! Insertion-ordered listener registry with snapshot fan-out
//!
//! Notification callbacks are allowed to attach or detach listeners (or
//! re-enter the component that owns the registry), so fan-out never iterates
//! the live set: callers take a [`snapshot`](ListenerRegistry::snapshot) and
//! iterate the copy. Attach order determines notification order.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

/// Thin-pointer identity of a listener, used for dedup and removal.
fn data_ptr<L: ?Sized>(listener: &Arc<L>) -> *const () {
    Arc::as_ptr(listener) as *const ()
}

/// Registry of shared listeners, deduplicated by `Arc` identity.
pub struct ListenerRegistry<L: ?Sized> {
    name: String,
    listeners: Mutex<Vec<Arc<L>>>,
}

impl<L: ?Sized> ListenerRegistry<L> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Adds `listener` at the end of the notification order. Returns false
    /// if the same listener (by identity) is already attached.
    pub fn attach(&self, listener: Arc<L>) -> bool {
        let mut listeners = self.listeners.lock();
        if listeners.iter().any(|l| data_ptr(l) == data_ptr(&listener)) {
            return false;
        }
        trace!(registry = %self.name, count = listeners.len() + 1, "listener attached");
        listeners.push(listener);
        true
    }

    /// Removes `listener` by identity. Returns false if it was not attached.
    pub fn detach(&self, listener: &Arc<L>) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|l| data_ptr(l) != data_ptr(listener));
        let detached = listeners.len() != before;
        if detached {
            trace!(registry = %self.name, count = listeners.len(), "listener detached");
        }
        detached
    }

    /// True if `listener` is currently attached.
    pub fn contains(&self, listener: &Arc<L>) -> bool {
        self.listeners
            .lock()
            .iter()
            .any(|l| data_ptr(l) == data_ptr(listener))
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }

    /// Detaches every listener.
    pub fn clear(&self) {
        self.listeners.lock().clear();
    }

    /// Copy of the current listener set in attach order. Fan-out iterates
    /// this copy, so callbacks may attach or detach without affecting the
    /// traversal in flight.
    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.listeners.lock().clone()
    }
}
