//! Cooperative cancellation of blocked acquires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};

/// A shared flag that interrupts blocked [`acquire_with`] calls and marks a
/// unit of work as terminated.
///
/// Cancellation is sticky: once cancelled, a token stays cancelled. Clones
/// share the same flag, so one handle can be given to the waiting side and
/// another to whatever decides to cancel.
///
/// [`acquire_with`]: crate::pool::ResourcePool::acquire_with
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

struct CancelState {
    cancelled: AtomicBool,
    /// Condition variables with waiters to wake on cancellation.
    watchers: Mutex<Vec<Weak<Condvar>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            state: Arc::new(CancelState {
                cancelled: AtomicBool::new(false),
                watchers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Cancel the token and wake every registered waiter.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
        let mut watchers = self.state.watchers.lock();
        for watcher in watchers.drain(..) {
            if let Some(cond) = watcher.upgrade() {
                cond.notify_all();
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Register a condition variable to be notified on cancellation.
    pub(crate) fn watch(&self, cond: &Arc<Condvar>) {
        let mut watchers = self.state.watchers.lock();
        watchers.retain(|watcher| watcher.strong_count() > 0);
        watchers.push(Arc::downgrade(cond));
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
