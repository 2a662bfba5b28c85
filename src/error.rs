//! Error types for weir
//!
//! This module defines the transactional error taxonomy used by the
//! partition resource manager and provides mapping to Kafka protocol error
//! codes so the partition layer can answer clients without translation
//! tables of its own.

use thiserror::Error;

/// Result type alias for weir operations
pub type Result<T> = std::result::Result<T, WeirError>;

/// Kafka protocol error codes relevant to transactional produce paths
/// See: <https://kafka.apache.org/protocol.html#protocol_error_codes>
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum KafkaErrorCode {
    /// No error
    None = 0,
    /// Unknown server error
    UnknownServerError = -1,
    /// Not leader for partition
    NotLeaderOrFollower = 6,
    /// Request timed out
    RequestTimedOut = 7,
    /// Broker is shutting down
    BrokerNotAvailable = 8,
    /// Coordinator not available
    CoordinatorNotAvailable = 15,
    /// Out of order sequence number
    OutOfOrderSequenceNumber = 45,
    /// Duplicate sequence number
    DuplicateSequenceNumber = 46,
    /// Invalid producer epoch
    InvalidProducerEpoch = 47,
    /// Invalid txn state
    InvalidTxnState = 48,
    /// Invalid producer id mapping
    InvalidProducerIdMapping = 49,
    /// Concurrent transactions
    ConcurrentTransactions = 51,
    /// Producer was fenced by a newer instance
    ProducerFenced = 90,
    /// Unknown producer id
    UnknownProducerId = 59,
    /// Disk error when trying to access log file
    KafkaStorageError = 56,
}

impl KafkaErrorCode {
    /// Returns true if this error is retriable by Kafka clients
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            KafkaErrorCode::NotLeaderOrFollower
                | KafkaErrorCode::RequestTimedOut
                | KafkaErrorCode::BrokerNotAvailable
                | KafkaErrorCode::CoordinatorNotAvailable
                | KafkaErrorCode::ConcurrentTransactions
                | KafkaErrorCode::KafkaStorageError
        )
    }

    /// Convert to the i16 error code used in the Kafka protocol
    pub fn as_i16(&self) -> i16 {
        *self as i16
    }
}

/// Errors produced by the transactional state machine proper.
///
/// Every variant is an observation, not a mutation: when an operation
/// returns one of these, the authoritative log state is unchanged and any
/// speculative reservations made earlier in the call have been rolled back.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TxError {
    /// Caller's epoch is below the fenced epoch for its producer id
    #[error("producer fenced: epoch {received} below current epoch {current}")]
    Fenced { current: i16, received: i16 },

    /// Epoch does not match any live producer session
    #[error("invalid producer epoch")]
    InvalidProducerEpoch,

    /// Sequence gap: the batch skips ahead of the last accepted sequence
    #[error("out of order sequence: expected {expected}, received {received}")]
    OutOfOrderSequence { expected: i32, received: i32 },

    /// Sequence already accepted and no cached offset is available
    #[error("duplicate sequence number {0}")]
    DuplicateSequence(i32),

    /// No state is tracked for this producer id
    #[error("unknown producer id {0}")]
    UnknownProducerId(i64),

    /// No transaction with the given sequence is tracked for the producer
    #[error("transaction not found")]
    TxNotFound,

    /// A different transaction is already open for the producer
    #[error("transaction already in progress")]
    TxAlreadyInProgress,

    /// The operation is not valid in the transaction's current state
    #[error("invalid transaction state")]
    InvalidTxState,

    /// The tx sequence belongs to an attempt the coordinator already
    /// finished; the caller holds stale information
    #[error("stale transaction sequence {0}")]
    Stale(i64),

    /// This replica is not the partition leader (or lost leadership
    /// mid-operation); the caller must re-route and re-issue begin
    #[error("not leader for partition")]
    NotLeader,

    /// The operation did not finish within its deadline; the underlying
    /// replication may still land, so the caller must re-query
    #[error("operation timed out")]
    Timeout,

    /// The transaction coordinator could not be reached for a decision
    #[error("transaction coordinator unreachable")]
    CoordinatorUnreachable,

    /// The partition is stopping; all in-flight operations are cancelled
    #[error("shutting down")]
    ShuttingDown,
}

impl TxError {
    /// Convert this error to the corresponding Kafka protocol error code
    pub fn kafka_error_code(&self) -> KafkaErrorCode {
        match self {
            TxError::Fenced { .. } => KafkaErrorCode::ProducerFenced,
            TxError::InvalidProducerEpoch => KafkaErrorCode::InvalidProducerEpoch,
            TxError::OutOfOrderSequence { .. } => KafkaErrorCode::OutOfOrderSequenceNumber,
            TxError::DuplicateSequence(_) => KafkaErrorCode::DuplicateSequenceNumber,
            TxError::UnknownProducerId(_) => KafkaErrorCode::UnknownProducerId,
            TxError::TxNotFound => KafkaErrorCode::InvalidProducerIdMapping,
            TxError::TxAlreadyInProgress => KafkaErrorCode::ConcurrentTransactions,
            TxError::InvalidTxState => KafkaErrorCode::InvalidTxnState,
            TxError::Stale(_) => KafkaErrorCode::InvalidProducerEpoch,
            TxError::NotLeader => KafkaErrorCode::NotLeaderOrFollower,
            TxError::Timeout => KafkaErrorCode::RequestTimedOut,
            TxError::CoordinatorUnreachable => KafkaErrorCode::CoordinatorNotAvailable,
            TxError::ShuttingDown => KafkaErrorCode::BrokerNotAvailable,
        }
    }

    /// Returns true if this error is retriable by Kafka clients
    pub fn is_retriable(&self) -> bool {
        self.kafka_error_code().is_retriable()
    }
}

/// Top-level error type for weir
#[derive(Debug, Error)]
pub enum WeirError {
    #[error("transaction error: {0}")]
    Tx(#[from] TxError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A local or abort snapshot failed structural validation. Fatal for
    /// the partition: `start()` must refuse to run on top of it.
    #[error("snapshot corrupted: {0}")]
    SnapshotCorrupted(String),

    #[error("unsupported snapshot version {0}")]
    UnsupportedSnapshotVersion(u8),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WeirError {
    /// Convert to the corresponding Kafka protocol error code
    pub fn kafka_error_code(&self) -> KafkaErrorCode {
        match self {
            WeirError::Tx(tx) => tx.kafka_error_code(),
            WeirError::Io(_) | WeirError::Storage(_) => KafkaErrorCode::KafkaStorageError,
            WeirError::SnapshotCorrupted(_) | WeirError::UnsupportedSnapshotVersion(_) => {
                KafkaErrorCode::KafkaStorageError
            }
            WeirError::Config(_) | WeirError::Serialization(_) => {
                KafkaErrorCode::UnknownServerError
            }
        }
    }
}

impl From<&WeirError> for i16 {
    fn from(err: &WeirError) -> i16 {
        err.kafka_error_code().as_i16()
    }
}
