//! Versioned transaction-state snapshots
//!
//! Two persisted formats live here:
//!
//! - the **local snapshot**: the full authoritative state at one offset,
//!   written as version 4 (version 3 when transaction partitioning is
//!   inactive) and readable as 3 or 4; versions 0-2 are rejected,
//! - the **abort segment**: an offloaded batch of aborted ranges covering
//!   one offset window, pointed to by an `AbortIndex` in the local
//!   snapshot.
//!
//! All integers are little-endian and fixed width. Vectors are encoded as
//! a `u32` count followed by the elements. No strings appear anywhere.

use crate::error::{Result, WeirError};
use crate::transaction::identity::{
    AbortIndex, ExpirationInfo, Offset, Pid, PrepareMarker, TmPartition, TxData, TxRange,
    TxSeq, UNKNOWN_TM_PARTITION,
};
use crate::transaction::log_state::{LogState, SeqCacheEntry, SeqEntry, SeqEntryWrapper};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use std::time::Duration;

pub const TX_SNAPSHOT_V3: u8 = 3;
pub const TX_SNAPSHOT_V4: u8 = 4;

/// Coordinator bookkeeping for one session, as persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxDataSnapshot {
    pub pid: Pid,
    pub tx_seq: TxSeq,
    pub tm: TmPartition,
}

/// Expiration timeout for one session, as persisted. The deadline itself
/// is not durable; it restarts from load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpirationSnapshot {
    pub pid: Pid,
    pub timeout_ms: i64,
}

/// The local snapshot: full authoritative state at `offset`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TxSnapshot {
    pub fenced: Vec<Pid>,
    pub ongoing: Vec<TxRange>,
    pub prepared: Vec<PrepareMarker>,
    pub aborted: Vec<TxRange>,
    pub abort_indexes: Vec<AbortIndex>,
    /// All batches up to and including this offset are reflected
    pub offset: Offset,
    pub seqs: Vec<SeqEntry>,
    pub tx_data: Vec<TxDataSnapshot>,
    pub expiration: Vec<ExpirationSnapshot>,
}

/// An offloaded batch of aborted ranges, all within `[first, last]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortSnapshot {
    pub first: Offset,
    pub last: Offset,
    pub aborted: Vec<TxRange>,
}

impl AbortSnapshot {
    pub fn matches(&self, idx: AbortIndex) -> bool {
        self.first == idx.first && self.last == idx.last
    }
}

// ---------------------------------------------------------------------
// primitive codecs

fn put_pid(buf: &mut BytesMut, pid: Pid) {
    buf.put_i64_le(pid.producer_id);
    buf.put_i16_le(pid.epoch);
}

fn get_pid(buf: &mut Bytes) -> Result<Pid> {
    ensure(buf, 10)?;
    let producer_id = buf.get_i64_le();
    let epoch = buf.get_i16_le();
    Ok(Pid::new(producer_id, epoch))
}

fn put_tx_range(buf: &mut BytesMut, range: &TxRange) {
    put_pid(buf, range.pid);
    buf.put_i64_le(range.first);
    buf.put_i64_le(range.last);
}

fn get_tx_range(buf: &mut Bytes) -> Result<TxRange> {
    let pid = get_pid(buf)?;
    ensure(buf, 16)?;
    let first = buf.get_i64_le();
    let last = buf.get_i64_le();
    Ok(TxRange::new(pid, first, last))
}

fn put_count(buf: &mut BytesMut, count: usize) {
    buf.put_u32_le(count as u32);
}

fn get_count(buf: &mut Bytes) -> Result<usize> {
    ensure(buf, 4)?;
    Ok(buf.get_u32_le() as usize)
}

fn ensure(buf: &Bytes, needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        Err(WeirError::SnapshotCorrupted(format!(
            "truncated snapshot: need {needed} more bytes, have {}",
            buf.remaining()
        )))
    } else {
        Ok(())
    }
}

fn put_seq_entry(buf: &mut BytesMut, entry: &SeqEntry) {
    put_pid(buf, entry.pid);
    buf.put_i32_le(entry.seq);
    buf.put_i64_le(entry.last_offset);
    put_count(buf, entry.seq_cache.len());
    for cached in &entry.seq_cache {
        buf.put_i32_le(cached.seq);
        buf.put_i64_le(cached.offset);
    }
    buf.put_i64_le(entry.last_write_timestamp);
}

fn get_seq_entry(buf: &mut Bytes) -> Result<SeqEntry> {
    let pid = get_pid(buf)?;
    ensure(buf, 12)?;
    let seq = buf.get_i32_le();
    let last_offset = buf.get_i64_le();
    let cache_len = get_count(buf)?;
    let mut seq_cache = VecDeque::with_capacity(cache_len);
    for _ in 0..cache_len {
        ensure(buf, 12)?;
        let seq = buf.get_i32_le();
        let offset = buf.get_i64_le();
        seq_cache.push_back(SeqCacheEntry { seq, offset });
    }
    ensure(buf, 8)?;
    let last_write_timestamp = buf.get_i64_le();
    Ok(SeqEntry {
        pid,
        seq,
        last_offset,
        seq_cache,
        last_write_timestamp,
    })
}

// ---------------------------------------------------------------------
// local snapshot

impl TxSnapshot {
    /// Capture the authoritative state at `offset`. Vectors are emitted in
    /// a canonical order so identical states serialize identically.
    pub fn capture(log: &LogState, offset: Offset) -> Self {
        let mut fenced: Vec<Pid> = log
            .fence_pid_epoch
            .iter()
            .map(|(id, epoch)| Pid::new(*id, *epoch))
            .collect();
        fenced.sort();

        let mut ongoing: Vec<TxRange> = log.ongoing_map.values().copied().collect();
        ongoing.sort_by_key(|r| r.first);

        let mut prepared: Vec<PrepareMarker> = log.prepared.values().copied().collect();
        prepared.sort_by_key(|m| m.pid);

        let mut seqs: Vec<SeqEntry> = log
            .seq_table
            .values()
            .map(|w| w.entry.clone())
            .collect();
        seqs.sort_by_key(|e| e.pid);

        let mut tx_data: Vec<TxDataSnapshot> = log
            .current_txes
            .iter()
            .map(|(pid, data)| TxDataSnapshot {
                pid: *pid,
                tx_seq: data.tx_seq,
                tm: data.tm_partition,
            })
            .collect();
        tx_data.sort_by_key(|d| d.pid);

        let mut expiration: Vec<ExpirationSnapshot> = log
            .expiration
            .iter()
            .map(|(pid, info)| ExpirationSnapshot {
                pid: *pid,
                timeout_ms: info.timeout.as_millis() as i64,
            })
            .collect();
        expiration.sort_by_key(|e| e.pid);

        Self {
            fenced,
            ongoing,
            prepared,
            aborted: log.aborted.clone(),
            abort_indexes: log.abort_indexes.clone(),
            offset,
            seqs,
            tx_data,
            expiration,
        }
    }

    /// Replace `log` with the snapshot contents
    pub fn restore(&self, log: &mut LogState) {
        log.reset();
        for pid in &self.fenced {
            log.raise_fence(pid.producer_id, pid.epoch);
        }
        for range in &self.ongoing {
            log.ongoing_map.insert(range.pid, *range);
            log.ongoing_set.insert(range.first);
        }
        for marker in &self.prepared {
            log.prepared.insert(marker.pid, *marker);
        }
        log.aborted = self.aborted.clone();
        log.abort_indexes = self.abort_indexes.clone();
        for entry in &self.seqs {
            log.seq_table.insert(
                entry.pid,
                SeqEntryWrapper {
                    entry: entry.clone(),
                    term: -1,
                },
            );
        }
        for data in &self.tx_data {
            log.current_txes.insert(
                data.pid,
                TxData {
                    tx_seq: data.tx_seq,
                    tm_partition: data.tm,
                },
            );
        }
        for exp in &self.expiration {
            log.expiration.insert(
                exp.pid,
                ExpirationInfo::new(Duration::from_millis(exp.timeout_ms.max(0) as u64)),
            );
        }
    }

    /// Serialize at the given version (3 or 4)
    pub fn encode(&self, version: u8) -> Result<Bytes> {
        if version != TX_SNAPSHOT_V3 && version != TX_SNAPSHOT_V4 {
            return Err(WeirError::UnsupportedSnapshotVersion(version));
        }
        let mut buf = BytesMut::with_capacity(256);
        buf.put_u8(version);

        put_count(&mut buf, self.fenced.len());
        for pid in &self.fenced {
            put_pid(&mut buf, *pid);
        }
        put_count(&mut buf, self.ongoing.len());
        for range in &self.ongoing {
            put_tx_range(&mut buf, range);
        }
        put_count(&mut buf, self.prepared.len());
        for marker in &self.prepared {
            buf.put_i32_le(marker.tm_partition);
            buf.put_i64_le(marker.tx_seq);
            put_pid(&mut buf, marker.pid);
        }
        put_count(&mut buf, self.aborted.len());
        for range in &self.aborted {
            put_tx_range(&mut buf, range);
        }
        put_count(&mut buf, self.abort_indexes.len());
        for idx in &self.abort_indexes {
            buf.put_i64_le(idx.first);
            buf.put_i64_le(idx.last);
        }
        buf.put_i64_le(self.offset);
        put_count(&mut buf, self.seqs.len());
        for entry in &self.seqs {
            put_seq_entry(&mut buf, entry);
        }

        if version == TX_SNAPSHOT_V4 {
            put_count(&mut buf, self.tx_data.len());
            for data in &self.tx_data {
                put_pid(&mut buf, data.pid);
                buf.put_i64_le(data.tx_seq);
                buf.put_i32_le(data.tm);
            }
        } else {
            // v3 stores bare tx sequences; the coordinator partition is a
            // v4 addition
            put_count(&mut buf, self.tx_data.len());
            for data in &self.tx_data {
                put_pid(&mut buf, data.pid);
                buf.put_i64_le(data.tx_seq);
            }
        }

        put_count(&mut buf, self.expiration.len());
        for exp in &self.expiration {
            put_pid(&mut buf, exp.pid);
            buf.put_i64_le(exp.timeout_ms);
        }

        Ok(buf.freeze())
    }

    /// Deserialize, accepting versions 3 and 4. A v3 snapshot converts by
    /// defaulting every coordinator partition to unknown.
    pub fn decode(data: Bytes) -> Result<Self> {
        let mut buf = data;
        ensure(&buf, 1)?;
        let version = buf.get_u8();
        match version {
            TX_SNAPSHOT_V3 | TX_SNAPSHOT_V4 => {}
            v => return Err(WeirError::UnsupportedSnapshotVersion(v)),
        }

        let mut snapshot = TxSnapshot::default();

        let count = get_count(&mut buf)?;
        for _ in 0..count {
            snapshot.fenced.push(get_pid(&mut buf)?);
        }
        let count = get_count(&mut buf)?;
        for _ in 0..count {
            snapshot.ongoing.push(get_tx_range(&mut buf)?);
        }
        let count = get_count(&mut buf)?;
        for _ in 0..count {
            ensure(&buf, 12)?;
            let tm_partition = buf.get_i32_le();
            let tx_seq = buf.get_i64_le();
            let pid = get_pid(&mut buf)?;
            snapshot.prepared.push(PrepareMarker {
                tm_partition,
                tx_seq,
                pid,
            });
        }
        let count = get_count(&mut buf)?;
        for _ in 0..count {
            snapshot.aborted.push(get_tx_range(&mut buf)?);
        }
        let count = get_count(&mut buf)?;
        for _ in 0..count {
            ensure(&buf, 16)?;
            let first = buf.get_i64_le();
            let last = buf.get_i64_le();
            snapshot.abort_indexes.push(AbortIndex { first, last });
        }
        ensure(&buf, 8)?;
        snapshot.offset = buf.get_i64_le();
        let count = get_count(&mut buf)?;
        for _ in 0..count {
            snapshot.seqs.push(get_seq_entry(&mut buf)?);
        }

        let count = get_count(&mut buf)?;
        for _ in 0..count {
            let pid = get_pid(&mut buf)?;
            ensure(&buf, 8)?;
            let tx_seq = buf.get_i64_le();
            let tm = if version == TX_SNAPSHOT_V4 {
                ensure(&buf, 4)?;
                buf.get_i32_le()
            } else {
                UNKNOWN_TM_PARTITION
            };
            snapshot.tx_data.push(TxDataSnapshot { pid, tx_seq, tm });
        }

        let count = get_count(&mut buf)?;
        for _ in 0..count {
            let pid = get_pid(&mut buf)?;
            ensure(&buf, 8)?;
            let timeout_ms = buf.get_i64_le();
            snapshot
                .expiration
                .push(ExpirationSnapshot { pid, timeout_ms });
        }

        Ok(snapshot)
    }
}

// ---------------------------------------------------------------------
// abort segment

impl AbortSnapshot {
    /// Serialize as `{first, last, count, ranges}`
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(20 + self.aborted.len() * 26);
        buf.put_i64_le(self.first);
        buf.put_i64_le(self.last);
        buf.put_u32_le(self.aborted.len() as u32);
        for range in &self.aborted {
            put_tx_range(&mut buf, range);
        }
        buf.freeze()
    }

    pub fn decode(data: Bytes) -> Result<Self> {
        let mut buf = data;
        ensure(&buf, 20)?;
        let first = buf.get_i64_le();
        let last = buf.get_i64_le();
        let count = buf.get_u32_le() as usize;
        let mut aborted = Vec::with_capacity(count);
        for _ in 0..count {
            aborted.push(get_tx_range(&mut buf)?);
        }
        Ok(Self {
            first,
            last,
            aborted,
        })
    }
}
