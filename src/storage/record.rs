//! Record and batch types for the replicated log
//!
//! The resource manager never inspects record payloads; it works on batch
//! headers (producer identity, sequencing, attribute bits) and on the keys
//! of control records. Values use `Bytes` so cloning a batch while it sits
//! in the replication pipeline is O(1).

use crate::error::{Result, WeirError};
use crate::transaction::identity::{BatchIdentity, Offset, Pid, SequenceNumber, TermId};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Batch attributes bit positions (Kafka v2 record batch layout)
pub const ATTR_TRANSACTIONAL_BIT: i16 = 0x10; // bit 4
pub const ATTR_CONTROL_BIT: i16 = 0x20; // bit 5

/// Control record kind tags carried in a control record's key
pub const CONTROL_TYPE_COMMIT: i16 = 0;
pub const CONTROL_TYPE_ABORT: i16 = 1;

/// The closed set of batch kinds the state machine dispatches on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchKind {
    /// Producer data
    Data,
    /// Epoch fence (begin-transaction) batch
    Fence,
    /// Legacy coordinator prepare marker
    Prepare,
    /// Commit/abort transaction marker
    Control,
}

/// Outcome recorded by a transaction control marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRecordKind {
    TxCommit,
    TxAbort,
    Unknown,
}

/// A single record in a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Optional key for the record
    pub key: Option<Bytes>,
    /// Value of the record
    pub value: Bytes,
}

impl Record {
    pub fn new(key: Option<Bytes>, value: Bytes) -> Self {
        Self { key, value }
    }
}

/// Batch header: everything the state machine needs without touching
/// payloads. `base_offset` and `term` are filled in by the consensus layer
/// when the batch is appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchHeader {
    pub kind: BatchKind,
    pub base_offset: Offset,
    pub record_count: i32,
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub base_sequence: SequenceNumber,
    pub attributes: i16,
    pub term: TermId,
    /// Append timestamp (epoch ms)
    pub timestamp: i64,
}

impl BatchHeader {
    pub fn is_transactional(&self) -> bool {
        self.attributes & ATTR_TRANSACTIONAL_BIT != 0
    }

    pub fn is_control(&self) -> bool {
        self.attributes & ATTR_CONTROL_BIT != 0
    }

    pub fn pid(&self) -> Pid {
        Pid::new(self.producer_id, self.producer_epoch)
    }

    /// Offset of the last record in the batch
    pub fn last_offset(&self) -> Offset {
        if self.record_count > 0 {
            self.base_offset + self.record_count as i64 - 1
        } else {
            self.base_offset
        }
    }

    /// Batch identity as seen by the replicate pipeline
    pub fn batch_identity(&self) -> BatchIdentity {
        BatchIdentity {
            pid: self.pid(),
            base_seq: self.base_sequence,
            record_count: self.record_count,
            is_transactional: self.is_transactional(),
        }
    }
}

/// A batch of records bound for (or read from) the replicated log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBatch {
    pub header: BatchHeader,
    pub records: Vec<Record>,
}

impl RecordBatch {
    /// Build a data batch for the given identity. Payloads are opaque to
    /// the resource manager.
    pub fn data(bid: BatchIdentity, records: Vec<Record>) -> Self {
        let mut attributes = 0;
        if bid.is_transactional {
            attributes |= ATTR_TRANSACTIONAL_BIT;
        }
        Self {
            header: BatchHeader {
                kind: BatchKind::Data,
                base_offset: -1,
                record_count: records.len() as i32,
                producer_id: bid.pid.producer_id,
                producer_epoch: bid.pid.epoch,
                base_sequence: bid.base_seq,
                attributes,
                term: -1,
                timestamp: chrono::Utc::now().timestamp_millis(),
            },
            records,
        }
    }

    /// Build a transaction marker batch (commit or abort).
    ///
    /// The envelope follows the Kafka control-record convention: a single
    /// record whose key carries `version: i16` then `kind: i16`, with a
    /// null value.
    pub fn control(pid: Pid, kind: ControlRecordKind) -> Self {
        let tag = match kind {
            ControlRecordKind::TxCommit => CONTROL_TYPE_COMMIT,
            ControlRecordKind::TxAbort => CONTROL_TYPE_ABORT,
            ControlRecordKind::Unknown => CONTROL_TYPE_ABORT,
        };
        let mut key = BytesMut::with_capacity(4);
        key.put_i16(0); // control record schema version
        key.put_i16(tag);

        Self {
            header: BatchHeader {
                kind: BatchKind::Control,
                base_offset: -1,
                record_count: 1,
                producer_id: pid.producer_id,
                producer_epoch: pid.epoch,
                base_sequence: -1,
                attributes: ATTR_TRANSACTIONAL_BIT | ATTR_CONTROL_BIT,
                term: -1,
                timestamp: chrono::Utc::now().timestamp_millis(),
            },
            records: vec![Record::new(Some(key.freeze()), Bytes::new())],
        }
    }

    /// Checksum over record keys and values, batch-level like the Kafka
    /// v2 CRC (which covers everything past the partition leader epoch)
    pub fn checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        for record in &self.records {
            if let Some(key) = &record.key {
                hasher.update(key);
            }
            hasher.update(&record.value);
        }
        hasher.finalize()
    }

    /// Parse the control-record kind out of a marker batch
    pub fn control_record_kind(&self) -> Result<ControlRecordKind> {
        if !self.header.is_control() {
            return Err(WeirError::Storage("not a control batch".to_string()));
        }
        let record = self
            .records
            .first()
            .ok_or_else(|| WeirError::Storage("empty control batch".to_string()))?;
        let key = record
            .key
            .as_ref()
            .ok_or_else(|| WeirError::Storage("control record without key".to_string()))?;
        if key.len() < 4 {
            return Err(WeirError::Storage(format!(
                "control record key too short: {} bytes",
                key.len()
            )));
        }
        let mut buf = key.clone();
        let _version = buf.get_i16();
        Ok(match buf.get_i16() {
            CONTROL_TYPE_COMMIT => ControlRecordKind::TxCommit,
            CONTROL_TYPE_ABORT => ControlRecordKind::TxAbort,
            _ => ControlRecordKind::Unknown,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_batch_attributes() {
        let bid = BatchIdentity::transactional(Pid::new(7, 0), 0, 3);
        let batch = RecordBatch::data(bid, vec![Record::new(None, Bytes::from("v"))]);
        assert!(batch.header.is_transactional());
        assert!(!batch.header.is_control());
        assert_eq!(batch.header.kind, BatchKind::Data);
    }

    #[test]
    fn test_control_batch_round_trip() {
        let commit = RecordBatch::control(Pid::new(7, 0), ControlRecordKind::TxCommit);
        assert!(commit.header.is_control());
        assert!(commit.header.is_transactional());
        assert_eq!(
            commit.control_record_kind().unwrap(),
            ControlRecordKind::TxCommit
        );

        let abort = RecordBatch::control(Pid::new(7, 0), ControlRecordKind::TxAbort);
        assert_eq!(
            abort.control_record_kind().unwrap(),
            ControlRecordKind::TxAbort
        );
    }

    #[test]
    fn test_control_kind_tags() {
        // Wire tags are fixed: commit = 0, abort = 1
        let commit = RecordBatch::control(Pid::new(1, 0), ControlRecordKind::TxCommit);
        let key = commit.records[0].key.as_ref().unwrap();
        assert_eq!(&key[..], &[0, 0, 0, 0]);

        let abort = RecordBatch::control(Pid::new(1, 0), ControlRecordKind::TxAbort);
        let key = abort.records[0].key.as_ref().unwrap();
        assert_eq!(&key[..], &[0, 0, 0, 1]);
    }

    #[test]
    fn test_control_kind_rejects_data_batch() {
        let bid = BatchIdentity::idempotent(Pid::new(7, 0), 0, 1);
        let batch = RecordBatch::data(bid, vec![Record::new(None, Bytes::from("v"))]);
        assert!(batch.control_record_kind().is_err());
    }

    #[test]
    fn test_last_offset() {
        let bid = BatchIdentity::idempotent(Pid::new(7, 0), 0, 3);
        let mut batch = RecordBatch::data(
            bid,
            vec![
                Record::new(None, Bytes::from("a")),
                Record::new(None, Bytes::from("b")),
                Record::new(None, Bytes::from("c")),
            ],
        );
        batch.header.base_offset = 100;
        assert_eq!(batch.header.last_offset(), 102);
    }

    #[test]
    fn test_checksum_stable_for_same_payload() {
        let bid = BatchIdentity::idempotent(Pid::new(7, 0), 0, 1);
        let a = RecordBatch::data(bid, vec![Record::new(None, Bytes::from("payload"))]);
        let b = RecordBatch::data(bid, vec![Record::new(None, Bytes::from("payload"))]);
        assert_eq!(a.checksum(), b.checksum());
    }

    #[test]
    fn test_batch_identity_from_header() {
        let bid = BatchIdentity::transactional(Pid::new(9, 2), 14, 4);
        let batch = RecordBatch::data(bid, vec![]);
        let mut expected = bid;
        expected.record_count = 0; // derived from the records actually present
        assert_eq!(batch.header.batch_identity(), expected);
    }
}
