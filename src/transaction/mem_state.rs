//! Speculative, term-scoped overlay state
//!
//! `MemState` holds the effects of operations that have been accepted by
//! the replicate pipeline but not yet observed through the apply path:
//! estimated first offsets of in-flight writes, transactions begun but
//! without a replicated data batch, and the LSO memo that keeps reads
//! monotonic while the basis offset alternates.
//!
//! The whole overlay is valid only for the term it was built in. When the
//! term moves on it is wiped before any new write is accepted; log state
//! then catches up with the committed index on its own.

use crate::memory::MemTracker;
use crate::transaction::identity::{Offset, Pid, PrepareMarker, TermId, TxSeq};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

#[derive(Debug)]
pub struct MemState {
    tracker: Arc<MemTracker>,
    /// Term this overlay belongs to
    pub term: TermId,
    /// Estimated first offset of an in-flight write per session, used to
    /// bound the LSO downward before the batch lands
    pub estimated: HashMap<Pid, Offset>,
    /// First-offset estimate of each transaction begun in this term that
    /// has no applied data batch yet
    pub tx_start: HashMap<Pid, Offset>,
    /// The offsets in `tx_start`, kept sorted for the LSO minimum
    pub tx_starts: BTreeSet<Offset>,
    /// Sessions with an open transaction (begin seen in this term) and the
    /// tx sequence the coordinator issued for it
    pub expected: HashMap<Pid, TxSeq>,
    /// Failed prepare bookkeeping (legacy; filters stale abort requests)
    pub preparing: HashMap<Pid, PrepareMarker>,
    /// Highest LSO ever returned; successful reads never go backwards
    pub last_lso: Offset,
}

impl MemState {
    pub fn new(tracker: Arc<MemTracker>) -> Self {
        Self {
            tracker,
            term: -1,
            estimated: HashMap::new(),
            tx_start: HashMap::new(),
            tx_starts: BTreeSet::new(),
            expected: HashMap::new(),
            preparing: HashMap::new(),
            last_lso: -1,
        }
    }

    /// Record the first-offset estimate for a transaction's first batch
    pub fn track_tx_start(&mut self, pid: Pid, offset: Offset) {
        if self.tx_start.contains_key(&pid) {
            return;
        }
        self.tracker.charge_entries::<(Pid, Offset)>(1);
        self.tx_start.insert(pid, offset);
        self.tx_starts.insert(offset);
    }

    /// Drop the in-flight offset overlays once the batch they were
    /// estimating for has been applied (the authoritative offsets are in
    /// log state from that point on)
    pub fn clear_inflight(&mut self, pid: Pid) {
        if self.estimated.remove(&pid).is_some() {
            self.tracker.release_entries::<(Pid, Offset)>(1);
        }
        if let Some(offset) = self.tx_start.remove(&pid) {
            self.tx_starts.remove(&offset);
            self.tracker.release_entries::<(Pid, Offset)>(1);
        }
    }

    /// Drop one session's overlays (tx finished, fenced, or evicted)
    pub fn forget(&mut self, pid: Pid) {
        self.expected.remove(&pid);
        if self.estimated.remove(&pid).is_some() {
            self.tracker.release_entries::<(Pid, Offset)>(1);
        }
        self.preparing.remove(&pid);
        if let Some(offset) = self.tx_start.remove(&pid) {
            self.tx_starts.remove(&offset);
            self.tracker.release_entries::<(Pid, Offset)>(1);
        }
    }

    /// Wipe the overlay for a new term. The LSO memo survives: monotonicity
    /// holds across leadership changes.
    pub fn wipe(&mut self, term: TermId) {
        let last_lso = self.last_lso;
        self.estimated.clear();
        self.tx_start.clear();
        self.tx_starts.clear();
        self.expected.clear();
        self.preparing.clear();
        self.tracker.release_all();
        self.term = term;
        self.last_lso = last_lso;
    }

    /// Smallest offset any in-flight or begun-but-unapplied tx may touch
    pub fn min_inflight_offset(&self) -> Option<Offset> {
        let tx_min = self.tx_starts.iter().next().copied();
        let est_min = self.estimated.values().min().copied();
        match (tx_min, est_min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}
