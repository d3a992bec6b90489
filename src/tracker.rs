//! Invocation bookkeeping.
//!
//! Registration happens synchronously before the first await of an
//! invocation so there is no window in which the invocation is in flight
//! but unaccounted for.

use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Debug, Default)]
struct TrackerInner {
    active: HashSet<String>,
    completed: HashSet<String>,
}

/// Tracks which invocations are currently in flight on this host.
#[derive(Debug, Default)]
pub struct InvocationTracker {
    inner: Mutex<TrackerInner>,
}

impl InvocationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an invocation as active. Idempotent; re-registering a
    /// completed invocation is ignored.
    pub fn register(&self, invocation_id: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            if !inner.completed.contains(invocation_id) {
                inner.active.insert(invocation_id.to_string());
            }
        }
    }

    /// Moves an invocation from active to completed.
    pub fn complete(&self, invocation_id: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.active.remove(invocation_id);
            inner.completed.insert(invocation_id.to_string());
        }
    }

    /// Whether any invocation is still in flight.
    pub fn has_active_invocation(&self) -> bool {
        self.inner
            .lock()
            .map(|inner| !inner.active.is_empty())
            .unwrap_or(false)
    }

    /// Whether the given invocation is in flight.
    pub fn is_active(&self, invocation_id: &str) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.active.contains(invocation_id))
            .unwrap_or(false)
    }
}
