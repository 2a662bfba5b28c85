//! Per-partition transactional semantics
//!
//! Everything the partition layer needs to overlay idempotent and
//! transactional producer guarantees onto a replicated log: identity
//! vocabulary, fence/marker codecs, the authoritative and speculative
//! state halves, versioned snapshots, and the manager that ties them to
//! the consensus and coordinator seams.

pub mod control;
pub mod identity;
pub mod log_state;
pub mod manager;
pub mod mem_state;
pub mod snapshot;

pub use control::{
    make_fence_batch_v1, make_fence_batch_v2, parse_tx_control_batch, read_fence_batch,
    FenceBatchData,
};
pub use identity::{
    AbortIndex, AbortOrigin, BatchIdentity, ExpirationInfo, Offset, Pid, PrepareMarker,
    ProducerEpoch, ProducerId, SequenceNumber, TermId, TmPartition, TxData, TxRange, TxSeq,
    UNKNOWN_TM_PARTITION,
};
pub use log_state::{LogState, SeqCacheEntry, SeqEntry, SeqEntryWrapper, SEQ_CACHE_SIZE};
pub use manager::{
    KafkaResult, KafkaStages, PartitionTxManager, TransactionInfo, TxStats, TxStatsSnapshot,
    TxStatus,
};
pub use mem_state::MemState;
pub use snapshot::{
    AbortSnapshot, ExpirationSnapshot, TxDataSnapshot, TxSnapshot, TX_SNAPSHOT_V3, TX_SNAPSHOT_V4,
};
