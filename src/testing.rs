//! Testing utilities
//!
//! In-process stand-ins for the two services the partition transaction
//! manager consumes: a single-node [`InMemoryRaft`] that assigns offsets
//! and drives apply upcalls in commit order, and a [`ScriptedCoordinator`]
//! whose transaction decisions tests choose up front.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use weir::testing::{InMemoryRaft, ScriptedCoordinator};
//! use weir::transaction::PartitionTxManager;
//!
//! #[tokio::test]
//! async fn replicate_round_trip() {
//!     let raft = Arc::new(InMemoryRaft::new());
//!     let coordinator = Arc::new(ScriptedCoordinator::new());
//!     let stm = PartitionTxManager::new(
//!         Default::default(),
//!         raft.clone(),
//!         coordinator,
//!         Default::default(),
//!         "/tmp/snapshots",
//!     )
//!     .unwrap();
//!     raft.attach(&stm);
//!     stm.start().await.unwrap();
//!     // drive the manager through its public API ...
//! }
//! ```

use crate::coordinator::{TxCoordinator, TxDecision};
use crate::error::{Result, TxError};
use crate::raft::{RaftHandle, ReplicateOptions, ReplicateResult, StateMachine};
use crate::storage::record::RecordBatch;
use crate::transaction::identity::{Offset, Pid, TermId, TxSeq};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;

struct RaftInner {
    log: Vec<RecordBatch>,
    pending_apply: VecDeque<RecordBatch>,
    term: TermId,
    leader: bool,
    next_offset: Offset,
    committed: Offset,
    applied: Offset,
    manual_apply: bool,
}

/// Single-node consensus: replication commits immediately and (unless
/// manual-apply mode is on) the attached state machine is applied inline,
/// in commit order.
pub struct InMemoryRaft {
    inner: Mutex<RaftInner>,
    applied_notify: Notify,
    /// serializes offset assignment + apply so upcalls arrive in order
    apply_gate: tokio::sync::Mutex<()>,
    sink: Mutex<Option<Weak<dyn StateMachine>>>,
}

impl Default for InMemoryRaft {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRaft {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RaftInner {
                log: Vec::new(),
                pending_apply: VecDeque::new(),
                term: 1,
                leader: true,
                next_offset: 0,
                committed: -1,
                applied: -1,
                manual_apply: false,
            }),
            applied_notify: Notify::new(),
            apply_gate: tokio::sync::Mutex::new(()),
            sink: Mutex::new(None),
        }
    }

    /// Attach the state machine receiving apply upcalls. Held weakly so
    /// the raft stub never keeps the partition alive.
    pub fn attach<S: StateMachine + 'static>(&self, sm: &Arc<S>) {
        let dyn_arc: Arc<dyn StateMachine> = sm.clone();
        *self.sink.lock() = Some(Arc::downgrade(&dyn_arc));
    }

    pub fn set_leader(&self, leader: bool) {
        self.inner.lock().leader = leader;
    }

    /// Advance the term (a leadership change as observed by the manager)
    pub fn bump_term(&self) {
        self.inner.lock().term += 1;
    }

    pub fn term(&self) -> TermId {
        self.inner.lock().term
    }

    /// When on, committed batches queue up until
    /// [`drain_applies`](Self::drain_applies) runs; lets tests observe the
    /// window where replication succeeded but the apply has not happened
    /// yet.
    pub fn set_manual_apply(&self, manual: bool) {
        self.inner.lock().manual_apply = manual;
    }

    /// Apply every queued batch in commit order
    pub async fn drain_applies(&self) -> Result<()> {
        let _gate = self.apply_gate.lock().await;
        loop {
            let batch = {
                let mut inner = self.inner.lock();
                inner.pending_apply.pop_front()
            };
            let Some(batch) = batch else { break };
            self.apply_one(batch).await?;
        }
        Ok(())
    }

    pub fn log_len(&self) -> usize {
        self.inner.lock().log.len()
    }

    /// Copy of the committed log, for replay-determinism assertions
    pub fn committed_batches(&self) -> Vec<RecordBatch> {
        self.inner.lock().log.clone()
    }

    /// Replay the whole committed log into a fresh state machine
    pub async fn replay_into(&self, sm: &dyn StateMachine) -> Result<()> {
        for batch in self.committed_batches() {
            sm.apply(&batch).await?;
        }
        Ok(())
    }

    async fn apply_one(&self, batch: RecordBatch) -> Result<()> {
        let sink = self.sink.lock().as_ref().and_then(|weak| weak.upgrade());
        if let Some(sink) = sink {
            sink.apply(&batch).await?;
        }
        {
            let mut inner = self.inner.lock();
            inner.applied = inner.applied.max(batch.header.last_offset());
        }
        self.applied_notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl RaftHandle for InMemoryRaft {
    async fn replicate(
        &self,
        mut batch: RecordBatch,
        opts: ReplicateOptions,
    ) -> Result<ReplicateResult> {
        let _gate = self.apply_gate.lock().await;
        let (result, batch, manual) = {
            let mut inner = self.inner.lock();
            if !inner.leader {
                return Err(TxError::NotLeader.into());
            }
            if let Some(term) = opts.expect_term {
                if term != inner.term {
                    return Err(TxError::NotLeader.into());
                }
            }

            let base = inner.next_offset;
            batch.header.base_offset = base;
            batch.header.term = inner.term;
            let count = batch.header.record_count.max(1) as i64;
            let last = base + count - 1;
            inner.next_offset = last + 1;
            inner.committed = last;
            inner.log.push(batch.clone());
            if inner.manual_apply {
                inner.pending_apply.push_back(batch.clone());
            }
            (
                ReplicateResult {
                    term: inner.term,
                    base_offset: base,
                    last_offset: last,
                },
                batch,
                inner.manual_apply,
            )
        };

        if !manual {
            self.apply_one(batch).await?;
        }
        Ok(result)
    }

    fn current_term(&self) -> TermId {
        self.inner.lock().term
    }

    fn is_leader(&self) -> bool {
        self.inner.lock().leader
    }

    fn last_applied_offset(&self) -> Offset {
        self.inner.lock().applied
    }

    fn committed_offset(&self) -> Offset {
        self.inner.lock().committed
    }

    async fn wait_applied(&self, offset: Offset, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.applied_notify.notified();
            if self.inner.lock().applied >= offset {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(TxError::Timeout.into());
            }
        }
    }
}

/// A coordinator whose answers are scripted per `(pid, tx_seq)`.
/// Unscripted transactions report [`TxDecision::Unknown`].
pub struct ScriptedCoordinator {
    decisions: Mutex<HashMap<(Pid, TxSeq), TxDecision>>,
    unreachable: AtomicBool,
    calls: AtomicU64,
}

impl Default for ScriptedCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedCoordinator {
    pub fn new() -> Self {
        Self {
            decisions: Mutex::new(HashMap::new()),
            unreachable: AtomicBool::new(false),
            calls: AtomicU64::new(0),
        }
    }

    /// Fix the decision the coordinator will report for a transaction
    pub fn script(&self, pid: Pid, tx_seq: TxSeq, decision: TxDecision) {
        self.decisions.lock().insert((pid, tx_seq), decision);
    }

    /// Simulate a coordinator outage
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::Relaxed);
    }

    /// How many decision requests were routed
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TxCoordinator for ScriptedCoordinator {
    async fn route_transaction_decision(&self, pid: Pid, tx_seq: TxSeq) -> Result<TxDecision> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if self.unreachable.load(Ordering::Relaxed) {
            return Err(TxError::CoordinatorUnreachable.into());
        }
        Ok(self
            .decisions
            .lock()
            .get(&(pid, tx_seq))
            .copied()
            .unwrap_or(TxDecision::Unknown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::record::Record;
    use crate::transaction::identity::BatchIdentity;
    use bytes::Bytes;

    fn data_batch(pid: Pid, base_seq: i32, records: usize) -> RecordBatch {
        let bid = BatchIdentity::idempotent(pid, base_seq, records as i32);
        RecordBatch::data(
            bid,
            (0..records)
                .map(|i| Record::new(None, Bytes::from(format!("r{i}"))))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_offsets_assigned_contiguously() {
        let raft = InMemoryRaft::new();
        let a = raft
            .replicate(data_batch(Pid::new(1, 0), 0, 3), ReplicateOptions::quorum())
            .await
            .unwrap();
        let b = raft
            .replicate(data_batch(Pid::new(1, 0), 3, 2), ReplicateOptions::quorum())
            .await
            .unwrap();
        assert_eq!((a.base_offset, a.last_offset), (0, 2));
        assert_eq!((b.base_offset, b.last_offset), (3, 4));
        assert_eq!(raft.committed_offset(), 4);
        assert_eq!(raft.last_applied_offset(), 4);
    }

    #[tokio::test]
    async fn test_not_leader_rejected() {
        let raft = InMemoryRaft::new();
        raft.set_leader(false);
        let err = raft
            .replicate(data_batch(Pid::new(1, 0), 0, 1), ReplicateOptions::quorum())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::WeirError::Tx(TxError::NotLeader)
        ));
    }

    #[tokio::test]
    async fn test_expect_term_mismatch_rejected() {
        let raft = InMemoryRaft::new();
        let stale = raft.term();
        raft.bump_term();
        let err = raft
            .replicate(
                data_batch(Pid::new(1, 0), 0, 1),
                ReplicateOptions::in_term(stale),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::WeirError::Tx(TxError::NotLeader)
        ));
    }

    #[tokio::test]
    async fn test_manual_apply_defers() {
        let raft = InMemoryRaft::new();
        raft.set_manual_apply(true);
        raft.replicate(data_batch(Pid::new(1, 0), 0, 2), ReplicateOptions::quorum())
            .await
            .unwrap();
        assert_eq!(raft.committed_offset(), 1);
        assert_eq!(raft.last_applied_offset(), -1);

        raft.drain_applies().await.unwrap();
        assert_eq!(raft.last_applied_offset(), 1);
    }

    #[tokio::test]
    async fn test_wait_applied_times_out() {
        let raft = InMemoryRaft::new();
        raft.set_manual_apply(true);
        raft.replicate(data_batch(Pid::new(1, 0), 0, 1), ReplicateOptions::quorum())
            .await
            .unwrap();
        let err = raft
            .wait_applied(0, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::WeirError::Tx(TxError::Timeout)));
    }

    #[tokio::test]
    async fn test_scripted_coordinator() {
        let coordinator = ScriptedCoordinator::new();
        let pid = Pid::new(7, 0);
        coordinator.script(pid, 42, TxDecision::Abort);

        assert_eq!(
            coordinator.route_transaction_decision(pid, 42).await.unwrap(),
            TxDecision::Abort
        );
        assert_eq!(
            coordinator.route_transaction_decision(pid, 43).await.unwrap(),
            TxDecision::Unknown
        );

        coordinator.set_unreachable(true);
        assert!(coordinator.route_transaction_decision(pid, 42).await.is_err());
        assert_eq!(coordinator.calls(), 3);
    }
}
