#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! # Weir
//!
//! Weir is the per-partition transactional resource manager of a
//! Kafka-compatible, Raft-replicated log. One
//! [`PartitionTxManager`](transaction::PartitionTxManager) instance sits
//! on top of each replicated partition and overlays it with:
//!
//! - **Idempotent producers**: per-producer sequence deduplication with a
//!   bounded retry cache, so client retries never duplicate records
//! - **Epoch fencing**: stale producer instances are rejected the moment a
//!   newer epoch appears on the log
//! - **Transactions**: begin/commit/abort driven by a transaction
//!   coordinator, with automatic expiry of abandoned transactions
//! - **Last stable offset**: the read-committed horizon, monotonic across
//!   leadership changes
//! - **Aborted-range queries**: everything a read-committed consumer needs
//!   to filter aborted data, backed by segmented on-disk history
//! - **Versioned snapshots** of all of the above
//!
//! Weir does not implement consensus or the coordinator; it consumes both
//! through the seams in [`raft`] and [`coordinator`].
//!
//! ## Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use weir::config::TxManagerConfig;
//! use weir::producer::ProducerStateManager;
//! use weir::transaction::{PartitionTxManager, Pid};
//!
//! # async fn example(
//! #     raft: Arc<dyn weir::raft::RaftHandle>,
//! #     coordinator: Arc<dyn weir::coordinator::TxCoordinator>,
//! # ) -> weir::Result<()> {
//! let stm = PartitionTxManager::new(
//!     TxManagerConfig::default(),
//!     raft,
//!     coordinator,
//!     Arc::new(ProducerStateManager::new()),
//!     "/var/lib/partition-0/tx",
//! )?;
//! stm.start().await?;
//!
//! let pid = Pid::new(7, 0);
//! let term = stm.begin_tx(pid, 1, Duration::from_secs(30), 0).await?;
//! // ... replicate transactional batches ...
//! stm.commit_tx(pid, 1, Duration::from_secs(10)).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod memory;
pub mod producer;
pub mod raft;
pub mod storage;
pub mod testing;
pub mod transaction;

pub use config::TxManagerConfig;
pub use error::{KafkaErrorCode, Result, TxError, WeirError};
pub use transaction::{PartitionTxManager, Pid, TxRange};
