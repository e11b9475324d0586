//! Revoke-table hand-off
//!
//! The revoke subsystem proper lives outside the commit engine; the pipeline
//! only needs two things from it: record a revoked block against the running
//! transaction, and atomically swap in a fresh table at the start of a commit
//! so the old one belongs to that commit alone.

use std::collections::HashSet;
use std::sync::Mutex;

/// Double-buffered revoke hash.
pub struct RevokeTables {
    inner: Mutex<RevokeInner>,
}

struct RevokeInner {
    current: HashSet<u64>,
    committing: HashSet<u64>,
}

impl RevokeTables {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RevokeInner {
                current: HashSet::new(),
                committing: HashSet::new(),
            }),
        }
    }

    /// Record a revoked block against the running transaction.
    pub fn record(&self, blocknr: u64) {
        self.inner
            .lock()
            .expect("revoke table lock poisoned")
            .current
            .insert(blocknr);
    }

    /// Swap in a fresh table; the previous one now belongs to the commit in
    /// progress.
    pub fn switch_table(&self) {
        let mut inner = self.inner.lock().expect("revoke table lock poisoned");
        debug_assert!(inner.committing.is_empty(), "prior commit left revokes behind");
        inner.committing = std::mem::take(&mut inner.current);
    }

    /// Drain the committing table's records, in ascending block order.
    pub fn take_committing(&self) -> Vec<u64> {
        let mut records: Vec<u64> = std::mem::take(
            &mut self.inner.lock().expect("revoke table lock poisoned").committing,
        )
        .into_iter()
        .collect();
        records.sort_unstable();
        records
    }
}

impl Default for RevokeTables {
    fn default() -> Self {
        Self::new()
    }
}
