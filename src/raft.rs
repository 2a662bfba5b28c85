//! Consensus seam
//!
//! The resource manager does not implement consensus; it consumes a
//! replicate primitive and receives apply upcalls in commit order. This
//! module defines that boundary. A production deployment implements
//! [`RaftHandle`] on top of its consensus engine; tests use
//! [`InMemoryRaft`](crate::testing::InMemoryRaft).

use crate::error::Result;
use crate::storage::record::RecordBatch;
use crate::transaction::identity::{Offset, TermId};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Acknowledgement level for a replication request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckLevel {
    /// Wait for a quorum of replicas
    #[default]
    Quorum,
    /// Leader-local append only
    LeaderAck,
}

/// Options passed with every replication request
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplicateOptions {
    pub ack: AckLevel,
    /// When set, the request must land in exactly this term; a leadership
    /// change in between fails the request instead of replicating it under
    /// a different leader
    pub expect_term: Option<TermId>,
}

impl ReplicateOptions {
    pub fn quorum() -> Self {
        Self {
            ack: AckLevel::Quorum,
            expect_term: None,
        }
    }

    pub fn in_term(term: TermId) -> Self {
        Self {
            ack: AckLevel::Quorum,
            expect_term: Some(term),
        }
    }
}

/// Offsets assigned to a successfully replicated batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicateResult {
    pub term: TermId,
    pub base_offset: Offset,
    pub last_offset: Offset,
}

/// What the resource manager consumes from the consensus engine
#[async_trait]
pub trait RaftHandle: Send + Sync + 'static {
    /// Submit a batch for replication. Resolves with the assigned offsets
    /// once the requested acknowledgement level is met.
    async fn replicate(
        &self,
        batch: RecordBatch,
        opts: ReplicateOptions,
    ) -> Result<ReplicateResult>;

    fn current_term(&self) -> TermId;

    fn is_leader(&self) -> bool;

    /// Highest offset the attached state machines have applied
    fn last_applied_offset(&self) -> Offset;

    /// Highest offset known committed by the quorum
    fn committed_offset(&self) -> Offset;

    /// Wait until the applied offset reaches `offset`
    async fn wait_applied(&self, offset: Offset, timeout: Duration) -> Result<()>;
}

/// Upcall interface the consensus engine drives, in commit order
#[async_trait]
pub trait StateMachine: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Fold one committed batch into state. Invoked exactly once per batch
    /// in log order.
    async fn apply(&self, batch: &RecordBatch) -> Result<()>;

    /// The log prefix up to some offset has been replaced by a snapshot;
    /// rebuild state from the blob.
    async fn apply_raft_snapshot(&self, snapshot: Bytes) -> Result<()>;
}
