//! Tracked memory accounting for transactional state
//!
//! Partition transaction state can grow with the number of producers and
//! open transactions, so every collection in the state machine charges its
//! allocations to a tracker. Trackers form a tree: the manager owns the
//! `tx-mem-root` tracker and each state half charges a child
//! (`log-state`, `mem-state`). Consumption rolls up to the parent so an
//! operator can read one number per partition.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// A node in the memory-tracking tree.
///
/// Cloning the `Arc` shares the tracker; dropping all references does not
/// release charged bytes (state must release what it charged).
#[derive(Debug)]
pub struct MemTracker {
    label: &'static str,
    consumed: AtomicUsize,
    parent: Weak<MemTracker>,
}

impl MemTracker {
    /// Create a root tracker
    pub fn root(label: &'static str) -> Arc<Self> {
        Arc::new(Self {
            label,
            consumed: AtomicUsize::new(0),
            parent: Weak::new(),
        })
    }

    /// Create a child tracker whose consumption rolls up into `self`
    pub fn child(self: &Arc<Self>, label: &'static str) -> Arc<Self> {
        Arc::new(Self {
            label,
            consumed: AtomicUsize::new(0),
            parent: Arc::downgrade(self),
        })
    }

    /// Charge `bytes` to this tracker and all ancestors
    pub fn charge(&self, bytes: usize) {
        self.consumed.fetch_add(bytes, Ordering::Relaxed);
        if let Some(parent) = self.parent.upgrade() {
            parent.charge(bytes);
        }
    }

    /// Release `bytes` from this tracker and all ancestors
    pub fn release(&self, bytes: usize) {
        // Saturating: releasing more than charged clamps at zero rather
        // than wrapping, a release-after-reset is not an error.
        let mut current = self.consumed.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(bytes);
            match self.consumed.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        if let Some(parent) = self.parent.upgrade() {
            parent.release(bytes);
        }
    }

    /// Release everything charged to this tracker (used on state reset)
    pub fn release_all(&self) {
        let bytes = self.consumed.swap(0, Ordering::Relaxed);
        if let Some(parent) = self.parent.upgrade() {
            parent.release(bytes);
        }
    }

    /// Bytes currently charged to this tracker (including descendants)
    pub fn consumption(&self) -> usize {
        self.consumed.load(Ordering::Relaxed)
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Charge for `n` entries of an in-memory collection entry type
    pub fn charge_entries<T>(&self, n: usize) {
        self.charge(n * std::mem::size_of::<T>());
    }

    /// Release for `n` entries of an in-memory collection entry type
    pub fn release_entries<T>(&self, n: usize) {
        self.release(n * std::mem::size_of::<T>());
    }
}
