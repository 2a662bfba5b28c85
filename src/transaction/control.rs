//! Fence and transaction-marker batch codecs
//!
//! A fence batch raises a producer's epoch on the partition and opens a
//! transaction for it. Three versions exist on disk and in flight:
//!
//! - v0: key only (epoch bump, nothing else)
//! - v1: value carries `{tx_seq: i64, timeout_ms: i32}`
//! - v2: value additionally carries `tm_partition: i32`, the coordinator
//!   partition that owns the transaction
//!
//! Writers emit v2 when transaction partitioning is active and v1
//! otherwise; readers accept all three for log replay.

use crate::error::{Result, WeirError};
use crate::storage::record::{
    BatchHeader, BatchKind, ControlRecordKind, Record, RecordBatch, ATTR_CONTROL_BIT,
    ATTR_TRANSACTIONAL_BIT,
};
use crate::transaction::identity::{Pid, PrepareMarker, TmPartition, TxSeq, UNKNOWN_TM_PARTITION};
use bytes::{Buf, BufMut, BytesMut};
use std::time::Duration;

pub const FENCE_VERSION_V0: i16 = 0;
pub const FENCE_VERSION_V1: i16 = 1;
pub const FENCE_VERSION_V2: i16 = 2;

/// Decoded contents of a fence batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FenceBatchData {
    pub pid: Pid,
    pub tx_seq: Option<TxSeq>,
    pub transaction_timeout_ms: Option<i32>,
    pub tm_partition: TmPartition,
}

fn fence_header(pid: Pid) -> BatchHeader {
    BatchHeader {
        kind: BatchKind::Fence,
        base_offset: -1,
        record_count: 1,
        producer_id: pid.producer_id,
        producer_epoch: pid.epoch,
        base_sequence: -1,
        attributes: ATTR_TRANSACTIONAL_BIT | ATTR_CONTROL_BIT,
        term: -1,
        timestamp: chrono::Utc::now().timestamp_millis(),
    }
}

/// Build a v1 fence batch (pre transaction-partitioning clusters)
pub fn make_fence_batch_v1(pid: Pid, tx_seq: TxSeq, transaction_timeout: Duration) -> RecordBatch {
    let mut key = BytesMut::with_capacity(2);
    key.put_i16(FENCE_VERSION_V1);

    let mut value = BytesMut::with_capacity(12);
    value.put_i64(tx_seq);
    value.put_i32(transaction_timeout.as_millis() as i32);

    RecordBatch {
        header: fence_header(pid),
        records: vec![Record::new(Some(key.freeze()), value.freeze())],
    }
}

/// Build a v2 fence batch carrying the owning coordinator partition
pub fn make_fence_batch_v2(
    pid: Pid,
    tx_seq: TxSeq,
    transaction_timeout: Duration,
    tm_partition: TmPartition,
) -> RecordBatch {
    let mut key = BytesMut::with_capacity(2);
    key.put_i16(FENCE_VERSION_V2);

    let mut value = BytesMut::with_capacity(16);
    value.put_i64(tx_seq);
    value.put_i32(transaction_timeout.as_millis() as i32);
    value.put_i32(tm_partition);

    RecordBatch {
        header: fence_header(pid),
        records: vec![Record::new(Some(key.freeze()), value.freeze())],
    }
}

/// Decode a fence batch of any supported version
pub fn read_fence_batch(batch: &RecordBatch) -> Result<FenceBatchData> {
    if batch.header.kind != BatchKind::Fence {
        return Err(WeirError::Storage("not a fence batch".to_string()));
    }
    let record = batch
        .records
        .first()
        .ok_or_else(|| WeirError::Storage("empty fence batch".to_string()))?;
    let key = record
        .key
        .as_ref()
        .ok_or_else(|| WeirError::Storage("fence record without key".to_string()))?;
    if key.len() < 2 {
        return Err(WeirError::Storage("fence record key too short".to_string()));
    }
    let version = key.clone().get_i16();
    let pid = batch.header.pid();

    match version {
        FENCE_VERSION_V0 => Ok(FenceBatchData {
            pid,
            tx_seq: None,
            transaction_timeout_ms: None,
            tm_partition: UNKNOWN_TM_PARTITION,
        }),
        FENCE_VERSION_V1 => {
            let mut value = record.value.clone();
            if value.len() < 12 {
                return Err(WeirError::Storage(
                    "fence v1 value truncated".to_string(),
                ));
            }
            let tx_seq = value.get_i64();
            let timeout_ms = value.get_i32();
            Ok(FenceBatchData {
                pid,
                tx_seq: Some(tx_seq),
                transaction_timeout_ms: Some(timeout_ms),
                tm_partition: UNKNOWN_TM_PARTITION,
            })
        }
        FENCE_VERSION_V2 => {
            let mut value = record.value.clone();
            if value.len() < 16 {
                return Err(WeirError::Storage(
                    "fence v2 value truncated".to_string(),
                ));
            }
            let tx_seq = value.get_i64();
            let timeout_ms = value.get_i32();
            let tm_partition = value.get_i32();
            Ok(FenceBatchData {
                pid,
                tx_seq: Some(tx_seq),
                transaction_timeout_ms: Some(timeout_ms),
                tm_partition,
            })
        }
        v => Err(WeirError::Storage(format!(
            "unknown fence batch version {v}"
        ))),
    }
}

/// Build a prepare-marker batch. Legacy: current coordinators no longer
/// write the prepare stage, but old logs replay through it.
pub fn make_prepare_batch(marker: PrepareMarker) -> RecordBatch {
    let mut key = BytesMut::with_capacity(2);
    key.put_i16(0); // prepare marker schema version

    let mut value = BytesMut::with_capacity(12);
    value.put_i32(marker.tm_partition);
    value.put_i64(marker.tx_seq);

    RecordBatch {
        header: BatchHeader {
            kind: BatchKind::Prepare,
            base_offset: -1,
            record_count: 1,
            producer_id: marker.pid.producer_id,
            producer_epoch: marker.pid.epoch,
            base_sequence: -1,
            attributes: ATTR_TRANSACTIONAL_BIT | ATTR_CONTROL_BIT,
            term: -1,
            timestamp: chrono::Utc::now().timestamp_millis(),
        },
        records: vec![Record::new(Some(key.freeze()), value.freeze())],
    }
}

/// Decode a prepare-marker batch
pub fn read_prepare_batch(batch: &RecordBatch) -> Result<PrepareMarker> {
    if batch.header.kind != BatchKind::Prepare {
        return Err(WeirError::Storage("not a prepare batch".to_string()));
    }
    let record = batch
        .records
        .first()
        .ok_or_else(|| WeirError::Storage("empty prepare batch".to_string()))?;
    let mut value = record.value.clone();
    if value.len() < 12 {
        return Err(WeirError::Storage("prepare value truncated".to_string()));
    }
    let tm_partition = value.get_i32();
    let tx_seq = value.get_i64();
    Ok(PrepareMarker {
        tm_partition,
        tx_seq,
        pid: batch.header.pid(),
    })
}

/// Classify a batch as a transaction marker without applying it. Batches
/// that are not markers report `Unknown`.
pub fn parse_tx_control_batch(batch: &RecordBatch) -> ControlRecordKind {
    if batch.header.kind != BatchKind::Control {
        return ControlRecordKind::Unknown;
    }
    batch
        .control_record_kind()
        .unwrap_or(ControlRecordKind::Unknown)
}

/// Build a v0-style fence batch. Only used to replay logs written by old
/// versions in tests; current writers never produce it.
#[cfg(test)]
pub fn make_fence_batch_v0(pid: Pid) -> RecordBatch {
    let mut key = BytesMut::with_capacity(2);
    key.put_i16(FENCE_VERSION_V0);
    RecordBatch {
        header: fence_header(pid),
        records: vec![Record::new(Some(key.freeze()), bytes::Bytes::new())],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::identity::BatchIdentity;

    #[test]
    fn test_fence_v2_round_trip() {
        let pid = Pid::new(7, 3);
        let batch = make_fence_batch_v2(pid, 42, Duration::from_secs(30), 5);
        let data = read_fence_batch(&batch).unwrap();
        assert_eq!(
            data,
            FenceBatchData {
                pid,
                tx_seq: Some(42),
                transaction_timeout_ms: Some(30_000),
                tm_partition: 5,
            }
        );
    }

    #[test]
    fn test_fence_v1_round_trip_defaults_tm() {
        let pid = Pid::new(7, 1);
        let batch = make_fence_batch_v1(pid, 9, Duration::from_secs(60));
        let data = read_fence_batch(&batch).unwrap();
        assert_eq!(data.tx_seq, Some(9));
        assert_eq!(data.transaction_timeout_ms, Some(60_000));
        assert_eq!(data.tm_partition, UNKNOWN_TM_PARTITION);
    }

    #[test]
    fn test_fence_v0_is_epoch_bump_only() {
        let pid = Pid::new(11, 4);
        let batch = make_fence_batch_v0(pid);
        let data = read_fence_batch(&batch).unwrap();
        assert_eq!(data.pid, pid);
        assert_eq!(data.tx_seq, None);
        assert_eq!(data.transaction_timeout_ms, None);
    }

    #[test]
    fn test_read_fence_rejects_data_batch() {
        let bid = BatchIdentity::idempotent(Pid::new(1, 0), 0, 1);
        let batch = RecordBatch::data(bid, vec![]);
        assert!(read_fence_batch(&batch).is_err());
    }

    #[test]
    fn test_prepare_round_trip() {
        let marker = PrepareMarker {
            tm_partition: 2,
            tx_seq: 17,
            pid: Pid::new(3, 1),
        };
        let batch = make_prepare_batch(marker);
        assert_eq!(read_prepare_batch(&batch).unwrap(), marker);
    }

    #[test]
    fn test_parse_tx_control_batch() {
        let commit = RecordBatch::control(Pid::new(1, 0), ControlRecordKind::TxCommit);
        assert_eq!(parse_tx_control_batch(&commit), ControlRecordKind::TxCommit);

        let fence = make_fence_batch_v1(Pid::new(1, 0), 1, Duration::from_secs(1));
        assert_eq!(parse_tx_control_batch(&fence), ControlRecordKind::Unknown);
    }
}
