//! Producer and transaction identity types
//!
//! These are the vocabulary types of the resource manager: producer
//! sessions, transaction attempts, batch identities and aborted ranges.
//! Numeric aliases match the widths Kafka clients put on the wire.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Producer ID type (matches Kafka's long type)
pub type ProducerId = i64;

/// Producer epoch type (matches Kafka's short type)
pub type ProducerEpoch = i16;

/// Sequence number type (matches Kafka's int type)
pub type SequenceNumber = i32;

/// Log offset (consumer-visible numbering)
pub type Offset = i64;

/// Raft term
pub type TermId = i64;

/// Transaction attempt counter issued by the coordinator per session
pub type TxSeq = i64;

/// Partition id of the transaction coordinator responsible for a tx
pub type TmPartition = i32;

/// Sentinel for "coordinator partition unknown" (pre-partitioning fences
/// and snapshots converted from older versions)
pub const UNKNOWN_TM_PARTITION: TmPartition = -1;

/// Producer identity: a stable session handle plus its fencing epoch
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Pid {
    pub producer_id: ProducerId,
    pub epoch: ProducerEpoch,
}

impl Pid {
    pub fn new(producer_id: ProducerId, epoch: ProducerEpoch) -> Self {
        Self { producer_id, epoch }
    }

    /// Producers with a negative id are plain (non-idempotent) producers
    pub fn is_idempotent(&self) -> bool {
        self.producer_id >= 0
    }
}

impl std::fmt::Display for Pid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{{}:{}}}", self.producer_id, self.epoch)
    }
}

/// Identity of a produced batch as seen by the replicate pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchIdentity {
    pub pid: Pid,
    /// Producer sequence of the first record in the batch
    pub base_seq: SequenceNumber,
    /// Number of records in the batch
    pub record_count: i32,
    pub is_transactional: bool,
}

impl BatchIdentity {
    pub fn idempotent(pid: Pid, base_seq: SequenceNumber, record_count: i32) -> Self {
        Self {
            pid,
            base_seq,
            record_count,
            is_transactional: false,
        }
    }

    pub fn transactional(pid: Pid, base_seq: SequenceNumber, record_count: i32) -> Self {
        Self {
            pid,
            base_seq,
            record_count,
            is_transactional: true,
        }
    }

    /// Producer sequence of the last record in the batch
    pub fn last_seq(&self) -> SequenceNumber {
        if self.record_count > 0 {
            self.base_seq + self.record_count - 1
        } else {
            self.base_seq
        }
    }

    /// Whether the batch participates in sequence deduplication
    pub fn is_idempotent(&self) -> bool {
        self.pid.is_idempotent()
    }
}

/// Inclusive range of log offsets written by one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRange {
    pub pid: Pid,
    pub first: Offset,
    pub last: Offset,
}

impl TxRange {
    pub fn new(pid: Pid, first: Offset, last: Offset) -> Self {
        Self { pid, first, last }
    }

    /// Whether `[self.first, self.last]` intersects `[from, to]`
    pub fn intersects(&self, from: Offset, to: Offset) -> bool {
        self.first <= to && self.last >= from
    }
}

/// Pointer to a persisted segment of aborted transaction ranges, all of
/// which fall inside `[first, last]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortIndex {
    pub first: Offset,
    pub last: Offset,
}

impl AbortIndex {
    pub fn intersects(&self, from: Offset, to: Offset) -> bool {
        self.first <= to && self.last >= from
    }
}

/// Marker recording the coordinator's durable decision for a transaction
/// (legacy stage kept for snapshot-format compatibility)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareMarker {
    /// Coordinator partition responsible for the transaction
    pub tm_partition: TmPartition,
    pub tx_seq: TxSeq,
    pub pid: Pid,
}

/// Coordinator bookkeeping for the transaction currently open on a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxData {
    pub tx_seq: TxSeq,
    pub tm_partition: TmPartition,
}

/// Where an incoming tx sequence sits relative to the session's current one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortOrigin {
    /// The sequence belongs to an attempt that already finished
    PresentInThePast,
    /// The sequence matches the current attempt
    Present,
    /// The sequence is ahead of anything this partition has seen
    Future,
}

/// Expiration tracking for an open transaction
#[derive(Debug, Clone, Copy)]
pub struct ExpirationInfo {
    pub timeout: Duration,
    pub last_update: Instant,
    pub is_expiration_requested: bool,
}

impl ExpirationInfo {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_update: Instant::now(),
            is_expiration_requested: false,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.last_update + self.timeout
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.is_expiration_requested || self.deadline() <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_identity_last_seq() {
        let bid = BatchIdentity::idempotent(Pid::new(7, 0), 5, 3);
        assert_eq!(bid.last_seq(), 7);

        let empty = BatchIdentity::idempotent(Pid::new(7, 0), 5, 0);
        assert_eq!(empty.last_seq(), 5);
    }

    #[test]
    fn test_non_idempotent_pid() {
        assert!(!Pid::new(-1, 0).is_idempotent());
        assert!(Pid::new(0, 0).is_idempotent());
    }

    #[test]
    fn test_tx_range_intersection() {
        let r = TxRange::new(Pid::new(1, 0), 10, 20);
        assert!(r.intersects(0, 10));
        assert!(r.intersects(20, 30));
        assert!(r.intersects(12, 15));
        assert!(!r.intersects(0, 9));
        assert!(!r.intersects(21, 100));
    }

    #[test]
    fn test_pid_ordering_by_id_then_epoch() {
        let a = Pid::new(1, 5);
        let b = Pid::new(2, 0);
        let c = Pid::new(2, 1);
        assert!(a < b);
        assert!(b < c);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiration_deadline() {
        let info = ExpirationInfo::new(Duration::from_secs(30));
        assert!(!info.is_expired(Instant::now()));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(info.is_expired(Instant::now()));
    }

    #[tokio::test]
    async fn test_explicit_expiration_request() {
        let mut info = ExpirationInfo::new(Duration::from_secs(3600));
        info.is_expiration_requested = true;
        assert!(info.is_expired(Instant::now()));
    }
}
