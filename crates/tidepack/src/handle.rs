//! # Handles
//!
//! Owned capability references. A `Handle` is closed exactly once, when it is
//! dropped. Moving a handle into a `Value`, an encoder, or a message moves
//! ownership with it; nothing in tidepack ever duplicates one.
//!
//! The `HandleTable` stands in for the kernel's per-process handle table: it
//! issues handles and tracks which ones are still open, which lets callers
//! check that an error path did not leak or double-close anything.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

/// Issues handles and records which of them are still open.
#[derive(Debug)]
pub struct HandleTable {
    next: AtomicU32,
    live: Mutex<BTreeSet<u32>>,
}

impl HandleTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next: AtomicU32::new(1),
            live: Mutex::new(BTreeSet::new()),
        })
    }

    /// Creates a new open handle owned by the caller.
    pub fn create(self: &Arc<Self>) -> Handle {
        let raw = self.next.fetch_add(1, Ordering::Relaxed);
        self.live_set().insert(raw);
        Handle { raw, table: Arc::clone(self) }
    }

    /// Number of handles issued by this table that are still open.
    pub fn live_count(&self) -> usize {
        self.live_set().len()
    }

    pub fn is_live(&self, raw: u32) -> bool {
        self.live_set().contains(&raw)
    }

    fn release(&self, raw: u32) {
        let removed = self.live_set().remove(&raw);
        debug_assert!(removed, "handle {} closed twice", raw);
    }

    fn live_set(&self) -> std::sync::MutexGuard<'_, BTreeSet<u32>> {
        self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// An owned, move-only capability reference.
pub struct Handle {
    raw: u32,
    table: Arc<HandleTable>,
}

impl Handle {
    pub fn raw(&self) -> u32 {
        self.raw
    }

    /// Closes the handle. Equivalent to dropping it.
    pub fn close(self) {}
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.table.release(self.raw);
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw && Arc::ptr_eq(&self.table, &other.table)
    }
}

impl Eq for Handle {}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handle({})", self.raw)
    }
}
