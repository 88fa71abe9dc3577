//! Bounded-capacity gate for in-flight flow runs.

use std::collections::HashSet;
use std::sync::Mutex;

use uuid::Uuid;

/// Non-blocking capacity limiter keyed by flow-run id.
///
/// Acquire and release are always paired by the submission pipeline;
/// releasing a key that holds no token is a bug and asserts.
pub(crate) struct RunLimiter {
    capacity: usize,
    holders: Mutex<HashSet<Uuid>>,
}

impl RunLimiter {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            holders: Mutex::new(HashSet::new()),
        }
    }

    /// Tries to take a token for the given run. Returns `false` when the
    /// limiter is at capacity or the run already holds a token (the caller
    /// stops admitting for this cycle).
    pub(crate) fn try_acquire(&self, flow_run_id: Uuid) -> bool {
        let mut holders = self.holders.lock().expect("limiter lock poisoned");
        if holders.len() >= self.capacity || holders.contains(&flow_run_id) {
            return false;
        }
        holders.insert(flow_run_id);
        true
    }

    pub(crate) fn release(&self, flow_run_id: Uuid) {
        let mut holders = self.holders.lock().expect("limiter lock poisoned");
        assert!(
            holders.remove(&flow_run_id),
            "limiter token released twice for flow run {flow_run_id}"
        );
    }

    pub(crate) fn in_use(&self) -> usize {
        self.holders.lock().expect("limiter lock poisoned").len()
    }
}
