//! Authoritative partition transaction state
//!
//! `LogState` is rebuilt exclusively from applied (committed) log batches
//! and from snapshots of the same. Replaying the committed log against an
//! empty `LogState` must always produce identical contents, so nothing in
//! here may depend on wall-clock scheduling or on in-flight requests; the
//! speculative side lives in [`MemState`](super::mem_state::MemState).
//!
//! The one exception is `seq_table`, which the replicate pipeline also
//! updates speculatively before its batch is applied. Conflicts resolve
//! toward the highest sequence; clients must tolerate false rejects.

use crate::memory::MemTracker;
use crate::transaction::identity::{
    AbortIndex, ExpirationInfo, Offset, Pid, PrepareMarker, ProducerEpoch, ProducerId,
    SequenceNumber, TermId, TxData, TxRange,
};
use crate::transaction::snapshot::AbortSnapshot;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

/// Entries kept in the per-producer dedup ring
pub const SEQ_CACHE_SIZE: usize = 5;

/// One remembered `(sequence, offset)` pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqCacheEntry {
    pub seq: SequenceNumber,
    pub offset: Offset,
}

/// Per-producer sequence deduplication record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeqEntry {
    pub pid: Pid,
    /// Last accepted sequence, -1 before the first write
    pub seq: SequenceNumber,
    /// Committed offset of the last accepted sequence, -1 if unknown
    pub last_offset: Offset,
    /// Ring of the most recent displaced `(seq, offset)` pairs
    pub seq_cache: VecDeque<SeqCacheEntry>,
    /// Wall clock of the last accepted write (epoch ms)
    pub last_write_timestamp: i64,
}

impl SeqEntry {
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            seq: -1,
            last_offset: -1,
            seq_cache: VecDeque::with_capacity(SEQ_CACHE_SIZE),
            last_write_timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Advance to `new_seq`/`new_offset`, pushing the displaced pair into
    /// the ring. Regressions are ignored; a repeat refreshes the offset.
    pub fn update(&mut self, new_seq: SequenceNumber, new_offset: Offset) {
        if new_seq < self.seq {
            return;
        }
        if new_seq == self.seq {
            self.last_offset = new_offset;
            return;
        }
        if self.seq >= 0 && self.last_offset >= 0 {
            self.seq_cache.push_back(SeqCacheEntry {
                seq: self.seq,
                offset: self.last_offset,
            });
            while self.seq_cache.len() >= SEQ_CACHE_SIZE {
                self.seq_cache.pop_front();
            }
        }
        self.seq = new_seq;
        self.last_offset = new_offset;
        self.last_write_timestamp = chrono::Utc::now().timestamp_millis();
    }

    /// Offset previously returned for `seq`, if it is still remembered
    pub fn known_offset(&self, seq: SequenceNumber) -> Option<Offset> {
        if seq == self.seq && self.last_offset >= 0 {
            return Some(self.last_offset);
        }
        self.seq_cache
            .iter()
            .find(|e| e.seq == seq)
            .map(|e| e.offset)
    }
}

/// `SeqEntry` plus the term it was last updated in. Cross-term contents
/// are advisory only: a new leader revalidates rather than trusts them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeqEntryWrapper {
    pub entry: SeqEntry,
    pub term: TermId,
}

/// Authoritative state rebuilt from applied log batches
#[derive(Debug)]
pub struct LogState {
    tracker: Arc<MemTracker>,
    /// Highest fenced epoch per producer id; monotonically non-decreasing
    pub fence_pid_epoch: HashMap<ProducerId, ProducerEpoch>,
    /// Open transaction range per producer session
    pub ongoing_map: HashMap<Pid, TxRange>,
    /// First offsets of all open transactions (min drives the LSO)
    pub ongoing_set: BTreeSet<Offset>,
    /// Legacy prepare markers, populated only by replaying old logs
    pub prepared: HashMap<Pid, PrepareMarker>,
    /// Sequence dedup table
    pub seq_table: HashMap<Pid, SeqEntryWrapper>,
    /// Coordinator bookkeeping for the open transaction per session
    pub current_txes: HashMap<Pid, TxData>,
    /// Auto-abort deadlines per session
    pub expiration: HashMap<Pid, ExpirationInfo>,
    /// Aborted ranges not yet offloaded to a segment, ascending first
    pub aborted: Vec<TxRange>,
    /// Pointers to offloaded segments, ascending first
    pub abort_indexes: Vec<AbortIndex>,
    /// One-entry cache of the most recently loaded abort segment
    pub last_abort_snapshot: Option<AbortSnapshot>,
}

impl LogState {
    pub fn new(tracker: Arc<MemTracker>) -> Self {
        Self {
            tracker,
            fence_pid_epoch: HashMap::new(),
            ongoing_map: HashMap::new(),
            ongoing_set: BTreeSet::new(),
            prepared: HashMap::new(),
            seq_table: HashMap::new(),
            current_txes: HashMap::new(),
            expiration: HashMap::new(),
            aborted: Vec::new(),
            abort_indexes: Vec::new(),
            last_abort_snapshot: None,
        }
    }

    /// Raise the fenced epoch for `producer_id` to at least `epoch`.
    /// Returns true when the epoch strictly advanced.
    pub fn raise_fence(&mut self, producer_id: ProducerId, epoch: ProducerEpoch) -> bool {
        match self.fence_pid_epoch.get_mut(&producer_id) {
            Some(current) if *current >= epoch => false,
            Some(current) => {
                *current = epoch;
                true
            }
            None => {
                self.tracker
                    .charge_entries::<(ProducerId, ProducerEpoch)>(1);
                self.fence_pid_epoch.insert(producer_id, epoch);
                true
            }
        }
    }

    /// Drop every trace of sessions for `producer_id` whose epoch is below
    /// `epoch`. Returns the purged pids so callers can clear overlays too.
    pub fn purge_lower_epochs(
        &mut self,
        producer_id: ProducerId,
        epoch: ProducerEpoch,
    ) -> Vec<Pid> {
        let stale: Vec<Pid> = self
            .ongoing_map
            .keys()
            .chain(self.seq_table.keys())
            .chain(self.current_txes.keys())
            .chain(self.prepared.keys())
            .chain(self.expiration.keys())
            .filter(|pid| pid.producer_id == producer_id && pid.epoch < epoch)
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        for pid in &stale {
            self.forget_session(*pid);
        }
        stale
    }

    /// Record an applied transactional data batch: the session's range
    /// grows to cover the batch.
    pub fn extend_ongoing(&mut self, pid: Pid, base_offset: Offset, last_offset: Offset) {
        match self.ongoing_map.get_mut(&pid) {
            Some(range) => {
                range.last = last_offset;
            }
            None => {
                self.tracker.charge_entries::<(Pid, TxRange)>(1);
                self.ongoing_map
                    .insert(pid, TxRange::new(pid, base_offset, last_offset));
                self.ongoing_set.insert(base_offset);
            }
        }
    }

    /// Apply an authoritative seq observation from a committed batch (or a
    /// speculative one from the replicate pipeline; both converge on the
    /// highest sequence).
    pub fn observe_seq(
        &mut self,
        pid: Pid,
        seq: SequenceNumber,
        offset: Offset,
        term: TermId,
    ) {
        let wrapper = self.seq_table.entry(pid).or_insert_with(|| {
            SeqEntryWrapper {
                entry: SeqEntry::new(pid),
                term,
            }
        });
        wrapper.entry.update(seq, offset);
        wrapper.term = term;
    }

    /// Last accepted sequence for the session. Contents recorded under an
    /// earlier term (or restored from a snapshot) are advisory: strict
    /// ordering is only guaranteed within one term, and clients must be
    /// prepared for false rejects after a leadership change.
    pub fn tail_seq(&self, pid: Pid) -> Option<SequenceNumber> {
        self.seq_table
            .get(&pid)
            .filter(|w| w.entry.seq >= 0)
            .map(|w| w.entry.seq)
    }

    /// Cached offset for a retried sequence, if still remembered
    pub fn known_seq(&self, pid: Pid, seq: SequenceNumber) -> Option<Offset> {
        self.seq_table
            .get(&pid)
            .and_then(|w| w.entry.known_offset(seq))
    }

    /// Close the open transaction for `pid`; the range is returned so an
    /// abort can be recorded.
    pub fn close_tx(&mut self, pid: Pid) -> Option<TxRange> {
        let range = self.ongoing_map.remove(&pid);
        if let Some(range) = &range {
            self.ongoing_set.remove(&range.first);
            self.tracker.release_entries::<(Pid, TxRange)>(1);
        }
        self.current_txes.remove(&pid);
        self.prepared.remove(&pid);
        self.expiration.remove(&pid);
        range
    }

    pub fn record_prepare(&mut self, marker: PrepareMarker) {
        self.tracker.charge_entries::<(Pid, PrepareMarker)>(1);
        self.prepared.insert(marker.pid, marker);
    }

    /// Append an aborted range, keeping `aborted` sorted by first offset
    pub fn record_aborted(&mut self, range: TxRange) {
        self.tracker.charge_entries::<TxRange>(1);
        let at = self
            .aborted
            .partition_point(|r| r.first <= range.first);
        self.aborted.insert(at, range);
    }

    /// Forget one session completely (epoch purge or producer eviction)
    pub fn forget_session(&mut self, pid: Pid) {
        if let Some(range) = self.ongoing_map.remove(&pid) {
            self.ongoing_set.remove(&range.first);
            self.tracker.release_entries::<(Pid, TxRange)>(1);
        }
        self.prepared.remove(&pid);
        self.seq_table.remove(&pid);
        self.current_txes.remove(&pid);
        self.expiration.remove(&pid);
    }

    /// Forget the producer entirely, fencing epoch included (manager
    /// eviction hook)
    pub fn forget(&mut self, pid: Pid) {
        self.fence_pid_epoch.remove(&pid.producer_id);
        self.forget_session(pid);
    }

    pub fn reset(&mut self) {
        self.fence_pid_epoch.clear();
        self.ongoing_map.clear();
        self.ongoing_set.clear();
        self.prepared.clear();
        self.seq_table.clear();
        self.current_txes.clear();
        self.expiration.clear();
        self.aborted.clear();
        self.abort_indexes.clear();
        self.last_abort_snapshot = None;
        self.tracker.release_all();
    }

    pub fn tx_seq_of(&self, pid: Pid) -> Option<i64> {
        self.current_txes.get(&pid).map(|d| d.tx_seq)
    }
}
