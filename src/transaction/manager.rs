//! Per-partition transaction manager
//!
//! One `PartitionTxManager` is attached to each replicated partition. It
//! overlays the raw log with idempotent-producer and transactional
//! semantics: sequence deduplication, epoch fencing, open-transaction
//! tracking, last-stable-offset publication, aborted-range queries and
//! snapshotting of all of the above.
//!
//! # Dual state
//!
//! State changes arrive on two paths: committed batches replayed through
//! [`apply`](PartitionTxManager::apply) (authoritative, deterministic) and
//! operations applied speculatively before their replication settles. The
//! two never share a structure: authoritative state lives in `LogState`,
//! speculative effects in `MemState`, and the overlay is wiped whenever
//! the term moves on. Collapsing them would let a failed replication
//! overwrite legitimate state.
//!
//! # Lock Ordering
//!
//! Several locks coexist; acquire them in this order and never hold the
//! field locks across an await:
//!
//! 1. per-producer lock (`tx_locks`, async, held across suspension points
//!    of one producer operation)
//! 2. `state_lock` (async rwlock; shared for producer-scoped operations,
//!    exclusive for snapshot take/apply, resets and leadership transfer)
//! 3. `log_state` (short critical sections)
//! 4. `mem_state` (short critical sections)

use crate::config::TxManagerConfig;
use crate::coordinator::{RetryBackoff, TxCoordinator, TxDecision};
use crate::error::{Result, TxError, WeirError};
use crate::memory::MemTracker;
use crate::producer::ProducerStateManager;
use crate::raft::{RaftHandle, ReplicateOptions, StateMachine};
use crate::storage::record::{BatchKind, ControlRecordKind, RecordBatch};
use crate::storage::snapshot::SnapshotManager;
use crate::transaction::control::{
    make_fence_batch_v1, make_fence_batch_v2, read_fence_batch, read_prepare_batch,
};
use crate::transaction::identity::{
    AbortIndex, AbortOrigin, BatchIdentity, ExpirationInfo, Offset, Pid, ProducerId,
    SequenceNumber, TermId, TmPartition, TxData, TxRange, TxSeq,
};
use crate::transaction::log_state::LogState;
use crate::transaction::mem_state::MemState;
use crate::transaction::snapshot::{AbortSnapshot, TxSnapshot, TX_SNAPSHOT_V3, TX_SNAPSHOT_V4};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{oneshot, Notify, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Attempts to obtain a coordinator decision within one auto-abort sweep
const MAX_DECISION_ATTEMPTS: u32 = 5;

/// Offsets assigned to a produced batch, as reported to the Kafka layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KafkaResult {
    pub base_offset: Offset,
    pub last_offset: Offset,
}

/// Two-stage replication handle: `enqueued` resolves once the request has
/// passed validation and entered the replication pipeline (ordering is
/// fixed from that point), `committed` resolves with the final outcome.
pub struct KafkaStages {
    pub enqueued: oneshot::Receiver<()>,
    pub committed: tokio::task::JoinHandle<Result<KafkaResult>>,
}

/// Where a transaction currently stands, for admin introspection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// Has at least one applied data batch
    Ongoing,
    /// A prepare attempt is in flight (legacy protocol stage)
    Preparing,
    /// The coordinator durably decided, marker applied (legacy stage)
    Prepared,
    /// Begun, no data batch applied yet
    Initiating,
}

impl std::fmt::Display for TxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TxStatus::Ongoing => write!(f, "ongoing"),
            TxStatus::Preparing => write!(f, "preparing"),
            TxStatus::Prepared => write!(f, "prepared"),
            TxStatus::Initiating => write!(f, "initiating"),
        }
    }
}

/// Introspection record for one open transaction
#[derive(Debug, Clone)]
pub struct TransactionInfo {
    pub status: TxStatus,
    /// First offset this transaction pins the LSO to
    pub lso_bound: Offset,
    pub expiration: Option<ExpirationInfo>,
    pub seq: Option<SequenceNumber>,
}

impl TransactionInfo {
    pub fn is_expired(&self, now: Instant) -> bool {
        match &self.expiration {
            Some(info) => info.is_expired(now),
            None => true,
        }
    }

    /// Time since the transaction last made progress, if it is still live
    pub fn staleness(&self, now: Instant) -> Option<Duration> {
        if self.is_expired(now) {
            return None;
        }
        self.expiration
            .as_ref()
            .map(|info| now.saturating_duration_since(info.last_update))
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.expiration.as_ref().map(|info| info.timeout)
    }
}

/// Atomic counters for the replicate and transaction paths
#[derive(Debug, Default)]
pub struct TxStats {
    pub replicated_batches: AtomicU64,
    /// Retries answered from the seq cache without a new log entry
    pub cached_replays: AtomicU64,
    pub duplicates_rejected: AtomicU64,
    pub out_of_order_rejected: AtomicU64,
    pub fence_rejections: AtomicU64,
    pub txs_begun: AtomicU64,
    pub txs_committed: AtomicU64,
    pub txs_aborted: AtomicU64,
    pub auto_aborts: AtomicU64,
}

/// Point-in-time snapshot of [`TxStats`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxStatsSnapshot {
    pub replicated_batches: u64,
    pub cached_replays: u64,
    pub duplicates_rejected: u64,
    pub out_of_order_rejected: u64,
    pub fence_rejections: u64,
    pub txs_begun: u64,
    pub txs_committed: u64,
    pub txs_aborted: u64,
    pub auto_aborts: u64,
}

enum SeqDecision {
    /// Retry of a remembered batch; answer with the cached offset
    Cached(Offset),
    Accept,
}

/// The per-partition resource manager state machine
pub struct PartitionTxManager {
    cfg: TxManagerConfig,
    raft: Arc<dyn RaftHandle>,
    coordinator: Arc<dyn TxCoordinator>,
    producers: Arc<ProducerStateManager>,

    mem_root: Arc<MemTracker>,
    log_state: Mutex<LogState>,
    mem_state: Mutex<MemState>,
    state_lock: RwLock<()>,
    tx_locks: DashMap<ProducerId, Arc<tokio::sync::Mutex<()>>>,

    snapshots: SnapshotManager,
    abort_snapshot_sizes: Mutex<std::collections::HashMap<(Offset, Offset), u64>>,

    /// Committed offset at start; LSO reads report not-ready until applies
    /// catch up to it
    bootstrap_committed_offset: OnceLock<Offset>,
    autoabort_enabled: AtomicBool,
    shutdown: Arc<AtomicBool>,
    expiry_notify: Arc<Notify>,
    stats: TxStats,
}

impl PartitionTxManager {
    pub fn new(
        cfg: TxManagerConfig,
        raft: Arc<dyn RaftHandle>,
        coordinator: Arc<dyn TxCoordinator>,
        producers: Arc<ProducerStateManager>,
        snapshot_dir: impl Into<PathBuf>,
    ) -> Result<Arc<Self>> {
        cfg.validate()?;
        let mem_root = MemTracker::root("tx-mem-root");
        let log_tracker = mem_root.child("log-state");
        let mem_tracker = mem_root.child("mem-state");
        let autoabort = cfg.is_autoabort_enabled;

        Ok(Arc::new(Self {
            cfg,
            raft,
            coordinator,
            producers,
            mem_root,
            log_state: Mutex::new(LogState::new(log_tracker)),
            mem_state: Mutex::new(MemState::new(mem_tracker)),
            state_lock: RwLock::new(()),
            tx_locks: DashMap::new(),
            snapshots: SnapshotManager::new(snapshot_dir)?,
            abort_snapshot_sizes: Mutex::new(std::collections::HashMap::new()),
            bootstrap_committed_offset: OnceLock::new(),
            autoabort_enabled: AtomicBool::new(autoabort),
            shutdown: Arc::new(AtomicBool::new(false)),
            expiry_notify: Arc::new(Notify::new()),
            stats: TxStats::default(),
        }))
    }

    /// Capture the bootstrap offset, register the producer eviction hook
    /// and spawn the background loops. Must run before the first client
    /// operation; a corrupted local snapshot surfaces before this through
    /// [`apply_local_snapshot`](Self::apply_local_snapshot), in which case
    /// the partition must not be started.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let committed = self.raft.committed_offset();
        let _ = self.bootstrap_committed_offset.set(committed);

        let weak = Arc::downgrade(self);
        self.producers.set_cleanup_hook(Box::new(move |pid| {
            if let Some(stm) = weak.upgrade() {
                stm.cleanup_producer_state(pid);
            }
        }));

        self.spawn_auto_abort_loop();
        self.spawn_stats_loop();

        info!(
            bootstrap_offset = committed,
            "partition transaction manager started"
        );
        Ok(())
    }

    /// Cancel background loops and drain in-flight operations
    pub async fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.expiry_notify.notify_waiters();
        // waiting for the write lock lets producer-scoped operations finish
        let _drain = self.state_lock.write().await;
        info!("partition transaction manager stopped");
    }

    /// Testing hook: suppress the auto-abort sweeps so tests control the
    /// transaction lifecycle explicitly
    pub fn testing_only_disable_auto_abort(&self) {
        self.autoabort_enabled.store(false, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // replicate pipeline

    /// Replicate a produced batch, enforcing idempotent/transactional
    /// semantics according to the batch identity.
    pub async fn replicate(
        &self,
        bid: BatchIdentity,
        batch: RecordBatch,
        opts: ReplicateOptions,
    ) -> Result<KafkaResult> {
        self.do_replicate(bid, batch, opts, None).await
    }

    /// Replicate with a two-stage handle: `enqueued` fires once ordering
    /// is fixed, `committed` carries the outcome.
    pub fn replicate_in_stages(
        self: &Arc<Self>,
        bid: BatchIdentity,
        batch: RecordBatch,
        opts: ReplicateOptions,
    ) -> KafkaStages {
        let (enqueued_tx, enqueued_rx) = oneshot::channel();
        let stm = self.clone();
        let committed = tokio::spawn(async move {
            stm.do_replicate(bid, batch, opts, Some(enqueued_tx)).await
        });
        KafkaStages {
            enqueued: enqueued_rx,
            committed,
        }
    }

    async fn do_replicate(
        &self,
        bid: BatchIdentity,
        batch: RecordBatch,
        opts: ReplicateOptions,
        enqueued: Option<oneshot::Sender<()>>,
    ) -> Result<KafkaResult> {
        if bid.is_transactional {
            self.transactional_replicate(bid, batch, enqueued).await
        } else if bid.is_idempotent() {
            self.idempotent_replicate(bid, batch, enqueued).await
        } else {
            // plain producers bypass sequencing entirely
            if let Some(tx) = enqueued {
                let _ = tx.send(());
            }
            let res = self.raft.replicate(batch, opts).await?;
            Ok(KafkaResult {
                base_offset: res.base_offset,
                last_offset: res.last_offset,
            })
        }
    }

    async fn idempotent_replicate(
        &self,
        bid: BatchIdentity,
        batch: RecordBatch,
        enqueued: Option<oneshot::Sender<()>>,
    ) -> Result<KafkaResult> {
        let producer = self.producers.acquire(bid.pid);
        let lock = self.tx_lock(bid.pid.producer_id);
        let _pid_guard = lock.lock().await;
        let _state_guard = self.state_lock.read().await;

        let term = self.sync(self.cfg.sync_timeout()).await?;
        self.check_fencing(bid.pid)?;

        match self.check_seq(bid)? {
            SeqDecision::Cached(last_offset) => {
                debug!(pid = %bid.pid, seq = bid.base_seq, last_offset, "replayed batch served from seq cache");
                return Ok(Self::cached_result(bid, last_offset));
            }
            SeqDecision::Accept => {}
        }

        // Reserve: the estimate bounds the LSO downward while the write is
        // in flight.
        let estimate = self.log_tail_estimate();
        {
            let mut mem = self.mem_state.lock();
            mem.estimated.insert(bid.pid, estimate);
        }

        if let Some(tx) = enqueued {
            let _ = tx.send(());
        }
        let outcome = self
            .raft
            .replicate(batch, ReplicateOptions::in_term(term))
            .await;

        match outcome {
            Ok(res) => {
                // Speculative seq update lets back-to-back writes pipeline
                // before the apply arrives; apply converges to the same
                // value. The offset reservation stays until apply_data
                // replaces it with the authoritative offsets.
                {
                    let mut log = self.log_state.lock();
                    log.observe_seq(bid.pid, bid.last_seq(), res.last_offset, term);
                }
                producer.touch();
                self.stats.replicated_batches.fetch_add(1, Ordering::Relaxed);
                Ok(KafkaResult {
                    base_offset: res.base_offset,
                    last_offset: res.last_offset,
                })
            }
            Err(e) => {
                // Roll back the reservation; the seq table was not touched
                // so the client's retry starts clean.
                let mut mem = self.mem_state.lock();
                if mem.term == term {
                    mem.clear_inflight(bid.pid);
                }
                Err(e)
            }
        }
    }

    async fn transactional_replicate(
        &self,
        bid: BatchIdentity,
        batch: RecordBatch,
        enqueued: Option<oneshot::Sender<()>>,
    ) -> Result<KafkaResult> {
        let producer = self.producers.acquire(bid.pid);
        let lock = self.tx_lock(bid.pid.producer_id);
        let _pid_guard = lock.lock().await;
        let _state_guard = self.state_lock.read().await;

        let term = self.sync(self.cfg.sync_timeout()).await?;
        self.check_fencing(bid.pid)?;

        // The session must have begun a transaction in this term. If the
        // fence is on the log but the overlay is gone, leadership moved
        // and the client must re-issue begin through the new leader.
        {
            let mem = self.mem_state.lock();
            if !mem.expected.contains_key(&bid.pid) {
                drop(mem);
                let log = self.log_state.lock();
                if log.current_txes.contains_key(&bid.pid) {
                    return Err(TxError::NotLeader.into());
                }
                warn!(pid = %bid.pid, "transactional write outside of a transaction");
                return Err(TxError::InvalidTxState.into());
            }
        }

        match self.check_seq(bid)? {
            SeqDecision::Cached(last_offset) => {
                debug!(pid = %bid.pid, seq = bid.base_seq, last_offset, "replayed tx batch served from seq cache");
                return Ok(Self::cached_result(bid, last_offset));
            }
            SeqDecision::Accept => {}
        }

        // First batch of the transaction: pin the LSO with an estimate of
        // the offset it will land at.
        let mut inserted_start = false;
        {
            let has_ongoing = {
                let log = self.log_state.lock();
                log.ongoing_map.contains_key(&bid.pid)
            };
            let mut mem = self.mem_state.lock();
            if !has_ongoing && !mem.tx_start.contains_key(&bid.pid) {
                mem.track_tx_start(bid.pid, self.log_tail_estimate());
                inserted_start = true;
            }
        }

        if let Some(tx) = enqueued {
            let _ = tx.send(());
        }
        let outcome = self
            .raft
            .replicate(batch, ReplicateOptions::in_term(term))
            .await;

        match outcome {
            Ok(res) => {
                {
                    let mut log = self.log_state.lock();
                    log.observe_seq(bid.pid, bid.last_seq(), res.last_offset, term);
                }
                producer.touch();
                self.stats.replicated_batches.fetch_add(1, Ordering::Relaxed);
                Ok(KafkaResult {
                    base_offset: res.base_offset,
                    last_offset: res.last_offset,
                })
            }
            Err(e) => {
                if inserted_start {
                    let mut mem = self.mem_state.lock();
                    if mem.term == term {
                        mem.clear_inflight(bid.pid);
                    }
                }
                Err(e)
            }
        }
    }

    fn cached_result(bid: BatchIdentity, last_offset: Offset) -> KafkaResult {
        let span = (bid.record_count.max(1) - 1) as i64;
        KafkaResult {
            base_offset: last_offset - span,
            last_offset,
        }
    }

    /// Sequence admission control under the log-state lock.
    ///
    /// The table stores the last sequence of each accepted batch, so a
    /// retried batch is recognized by its last sequence and answered with
    /// the remembered offset.
    fn check_seq(&self, bid: BatchIdentity) -> Result<SeqDecision> {
        let log = self.log_state.lock();
        if let Some(offset) = log.known_seq(bid.pid, bid.last_seq()) {
            self.stats.cached_replays.fetch_add(1, Ordering::Relaxed);
            return Ok(SeqDecision::Cached(offset));
        }
        match log.tail_seq(bid.pid) {
            Some(tail) => {
                if bid.base_seq == tail + 1 {
                    Ok(SeqDecision::Accept)
                } else if bid.base_seq <= tail {
                    self.stats.duplicates_rejected.fetch_add(1, Ordering::Relaxed);
                    Err(TxError::DuplicateSequence(bid.base_seq).into())
                } else {
                    self.stats
                        .out_of_order_rejected
                        .fetch_add(1, Ordering::Relaxed);
                    Err(TxError::OutOfOrderSequence {
                        expected: tail + 1,
                        received: bid.base_seq,
                    }
                    .into())
                }
            }
            None => {
                // a fresh session must start at sequence zero
                if bid.base_seq == 0 {
                    Ok(SeqDecision::Accept)
                } else {
                    self.stats
                        .out_of_order_rejected
                        .fetch_add(1, Ordering::Relaxed);
                    Err(TxError::OutOfOrderSequence {
                        expected: 0,
                        received: bid.base_seq,
                    }
                    .into())
                }
            }
        }
    }

    fn check_fencing(&self, pid: Pid) -> Result<()> {
        let log = self.log_state.lock();
        if let Some(&fenced) = log.fence_pid_epoch.get(&pid.producer_id) {
            if pid.epoch < fenced {
                drop(log);
                self.stats.fence_rejections.fetch_add(1, Ordering::Relaxed);
                return Err(TxError::Fenced {
                    current: fenced,
                    received: pid.epoch,
                }
                .into());
            }
        }
        Ok(())
    }

    /// Confirm leadership and drive applies up to the committed index of
    /// the current term. On success the mem overlay is scoped to `term`.
    async fn sync(&self, timeout: Duration) -> Result<TermId> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(TxError::ShuttingDown.into());
        }
        if !self.raft.is_leader() {
            return Err(TxError::NotLeader.into());
        }
        let term = self.raft.current_term();
        let committed = self.raft.committed_offset();
        self.raft.wait_applied(committed, timeout).await?;
        if !self.raft.is_leader() || self.raft.current_term() != term {
            return Err(TxError::NotLeader.into());
        }

        let mut mem = self.mem_state.lock();
        if mem.term != term {
            debug!(
                old_term = mem.term,
                new_term = term,
                "term advanced, wiping speculative state"
            );
            mem.wipe(term);
        }
        Ok(term)
    }

    /// Lower bound for the offset the next write will be assigned
    fn log_tail_estimate(&self) -> Offset {
        self.raft
            .committed_offset()
            .max(self.raft.last_applied_offset())
            + 1
    }

    fn tx_lock(&self, producer_id: ProducerId) -> Arc<tokio::sync::Mutex<()>> {
        self.tx_locks
            .entry(producer_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    // ------------------------------------------------------------------
    // transaction lifecycle

    /// Open a transaction for `pid`. Replicates a fence batch raising the
    /// session's epoch, arms the expiration timer and returns the term the
    /// coordinator must pin for the rest of the transaction.
    pub async fn begin_tx(
        &self,
        pid: Pid,
        tx_seq: TxSeq,
        tx_timeout: Duration,
        tm_partition: TmPartition,
    ) -> Result<TermId> {
        let producer = self.producers.acquire(pid);
        let lock = self.tx_lock(pid.producer_id);
        let _pid_guard = lock.lock().await;
        let _state_guard = self.state_lock.read().await;

        let term = self.sync(self.cfg.sync_timeout()).await?;
        self.check_fencing(pid)?;

        if let Some(current) = self.get_tx_seq(pid) {
            if current == tx_seq {
                // coordinator retry of the same begin; refresh the overlay
                let mut mem = self.mem_state.lock();
                mem.expected.insert(pid, tx_seq);
                return Ok(term);
            }
            return Err(TxError::TxAlreadyInProgress.into());
        }
        {
            let mem = self.mem_state.lock();
            if let Some(expected) = mem.expected.get(&pid) {
                if *expected != tx_seq {
                    return Err(TxError::TxAlreadyInProgress.into());
                }
            }
        }

        let batch = if self.cfg.transaction_partitioning {
            make_fence_batch_v2(pid, tx_seq, tx_timeout, tm_partition)
        } else {
            make_fence_batch_v1(pid, tx_seq, tx_timeout)
        };
        self.raft
            .replicate(batch, ReplicateOptions::in_term(term))
            .await?;

        {
            let mut mem = self.mem_state.lock();
            mem.expected.insert(pid, tx_seq);
            mem.preparing.remove(&pid);
        }
        {
            // arm expiry immediately; the applied fence re-arms it
            let mut log = self.log_state.lock();
            log.expiration.insert(pid, ExpirationInfo::new(tx_timeout));
        }
        self.expiry_notify.notify_one();
        producer.touch();
        self.stats.txs_begun.fetch_add(1, Ordering::Relaxed);

        debug!(%pid, tx_seq, tm_partition, timeout_ms = tx_timeout.as_millis() as u64, "transaction begun");
        Ok(term)
    }

    /// Commit the transaction. Success is reported only after the commit
    /// marker has been applied, so a subsequent LSO read reflects it.
    pub async fn commit_tx(&self, pid: Pid, tx_seq: TxSeq, timeout: Duration) -> Result<()> {
        let lock = self.tx_lock(pid.producer_id);
        let _pid_guard = lock.lock().await;
        let _state_guard = self.state_lock.read().await;

        let term = self.sync(timeout).await?;
        self.check_fencing(pid)?;

        match self.get_tx_seq(pid) {
            Some(current) if current == tx_seq => {}
            Some(current) => {
                return match self.abort_origin(current, tx_seq) {
                    AbortOrigin::PresentInThePast => Err(TxError::Stale(tx_seq).into()),
                    _ => Err(TxError::TxNotFound.into()),
                };
            }
            None => return Err(TxError::TxNotFound.into()),
        }

        let marker = RecordBatch::control(pid, ControlRecordKind::TxCommit);
        let res = self
            .raft
            .replicate(marker, ReplicateOptions::in_term(term))
            .await?;
        self.raft.wait_applied(res.last_offset, timeout).await?;

        debug!(%pid, tx_seq, "transaction committed");
        Ok(())
    }

    /// Abort the transaction. `tx_seq` is checked when given; auto-abort
    /// recovery passes `None` after the coordinator has decided.
    pub async fn abort_tx(
        &self,
        pid: Pid,
        tx_seq: Option<TxSeq>,
        timeout: Duration,
    ) -> Result<()> {
        let lock = self.tx_lock(pid.producer_id);
        let _pid_guard = lock.lock().await;
        let _state_guard = self.state_lock.read().await;

        let term = self.sync(timeout).await?;
        self.check_fencing(pid)?;
        self.do_abort_tx(pid, tx_seq, term, timeout).await
    }

    async fn do_abort_tx(
        &self,
        pid: Pid,
        tx_seq: Option<TxSeq>,
        term: TermId,
        timeout: Duration,
    ) -> Result<()> {
        match (self.get_tx_seq(pid), tx_seq) {
            (Some(current), Some(requested)) if current != requested => {
                return match self.abort_origin(current, requested) {
                    AbortOrigin::PresentInThePast => Err(TxError::Stale(requested).into()),
                    _ => Err(TxError::TxNotFound.into()),
                };
            }
            (None, Some(_)) => return Err(TxError::TxNotFound.into()),
            (None, None) => {
                // nothing on the log; clear any speculative residue
                let mut mem = self.mem_state.lock();
                mem.forget(pid);
                return Ok(());
            }
            _ => {}
        }

        let marker = RecordBatch::control(pid, ControlRecordKind::TxAbort);
        let res = self
            .raft
            .replicate(marker, ReplicateOptions::in_term(term))
            .await?;
        self.raft.wait_applied(res.last_offset, timeout).await?;

        debug!(%pid, ?tx_seq, "transaction aborted");
        Ok(())
    }

    /// Request expiration of the session's transaction; the auto-abort
    /// machinery resolves it with the coordinator's decision.
    pub async fn mark_expired(&self, pid: Pid) -> Result<()> {
        let lock = self.tx_lock(pid.producer_id);
        let _pid_guard = lock.lock().await;
        let _state_guard = self.state_lock.read().await;

        {
            let mut log = self.log_state.lock();
            if let Some(info) = log.expiration.get_mut(&pid) {
                info.is_expiration_requested = true;
            } else if log.current_txes.contains_key(&pid) {
                let mut info = ExpirationInfo::new(Duration::ZERO);
                info.is_expiration_requested = true;
                log.expiration.insert(pid, info);
            } else {
                return Err(TxError::TxNotFound.into());
            }
        }
        self.expiry_notify.notify_one();
        Ok(())
    }

    fn get_tx_seq(&self, pid: Pid) -> Option<TxSeq> {
        self.log_state.lock().tx_seq_of(pid)
    }

    /// Classify `incoming` relative to the session's current tx sequence
    fn abort_origin(&self, current: TxSeq, incoming: TxSeq) -> AbortOrigin {
        if incoming < current {
            AbortOrigin::PresentInThePast
        } else if incoming == current {
            AbortOrigin::Present
        } else {
            AbortOrigin::Future
        }
    }

    // ------------------------------------------------------------------
    // auto-abort

    fn spawn_auto_abort_loop(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let notify = self.expiry_notify.clone();
        let tick = self.cfg.abort_interval();
        tokio::spawn(async move {
            loop {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let sleep_for = match weak.upgrade() {
                    Some(stm) => stm.next_expiry_delay().unwrap_or(tick).min(tick),
                    None => break,
                };
                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {}
                    _ = notify.notified() => {}
                }
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let Some(stm) = weak.upgrade() else { break };
                if stm.autoabort_enabled.load(Ordering::Relaxed) {
                    stm.abort_old_txes().await;
                }
                // offload safety net in case an apply raced the threshold
                if let Err(e) = stm.offload_aborted_txns().await {
                    warn!(error = %e, "deferred abort-index offload failed");
                }
            }
            debug!("auto-abort loop exited");
        });
    }

    fn spawn_stats_loop(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let period = self.cfg.log_stats_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                match weak.upgrade() {
                    Some(stm) => stm.log_tx_stats(),
                    None => break,
                }
            }
        });
    }

    /// Delay until the earliest transaction deadline (plus grace)
    fn next_expiry_delay(&self) -> Option<Duration> {
        let log = self.log_state.lock();
        let earliest = log
            .expiration
            .values()
            .map(|info| info.deadline())
            .min()?;
        drop(log);
        let with_grace = earliest + self.cfg.tx_timeout_delay();
        Some(with_grace.saturating_duration_since(Instant::now()))
    }

    async fn abort_old_txes(&self) {
        let now = Instant::now();
        let grace = self.cfg.tx_timeout_delay();
        let expired: Vec<Pid> = {
            let log = self.log_state.lock();
            log.expiration
                .iter()
                .filter(|(_, info)| {
                    info.is_expiration_requested || info.deadline() + grace <= now
                })
                .map(|(pid, _)| *pid)
                .collect()
        };

        for pid in expired {
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }
            self.try_abort_old_tx(pid).await;
        }
    }

    /// Resolve one expired transaction with the coordinator's decision.
    /// The state never changes unilaterally: an unreachable or undecided
    /// coordinator leaves the transaction for the next sweep.
    async fn try_abort_old_tx(&self, pid: Pid) {
        let lock = self.tx_lock(pid.producer_id);
        let _pid_guard = lock.lock().await;
        let _state_guard = self.state_lock.read().await;

        let term = match self.sync(self.cfg.sync_timeout()).await {
            Ok(term) => term,
            Err(_) => return, // not the leader anymore, nothing to do here
        };

        let Some(tx_seq) = self.get_tx_seq(pid) else {
            // tx resolved while we waited for the lock
            let mut log = self.log_state.lock();
            log.expiration.remove(&pid);
            drop(log);
            let mut mem = self.mem_state.lock();
            mem.forget(pid);
            return;
        };

        // backoff scales with the configured grace so deployments with a
        // short expiry grace also re-ask the coordinator quickly
        let delay = self.cfg.tx_timeout_delay().max(Duration::from_millis(10));
        let mut backoff = RetryBackoff::new(delay, delay * 10);
        let decision = loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }
            match self.coordinator.route_transaction_decision(pid, tx_seq).await {
                Ok(TxDecision::Unknown) | Err(_) if backoff.attempts() < MAX_DECISION_ATTEMPTS => {
                    tokio::time::sleep(backoff.next_delay()).await;
                }
                Ok(decision) => break decision,
                Err(e) => {
                    warn!(%pid, tx_seq, error = %e, "coordinator unreachable, deferring expiry");
                    break TxDecision::Unknown;
                }
            }
        };

        match decision {
            TxDecision::Commit => {
                let marker = RecordBatch::control(pid, ControlRecordKind::TxCommit);
                match self
                    .raft
                    .replicate(marker, ReplicateOptions::in_term(term))
                    .await
                {
                    Ok(res) => {
                        let _ = self
                            .raft
                            .wait_applied(res.last_offset, self.cfg.sync_timeout())
                            .await;
                        info!(%pid, tx_seq, "expired transaction resolved as commit");
                    }
                    Err(e) => warn!(%pid, tx_seq, error = %e, "failed to replicate commit marker"),
                }
            }
            TxDecision::Abort => {
                let marker = RecordBatch::control(pid, ControlRecordKind::TxAbort);
                match self
                    .raft
                    .replicate(marker, ReplicateOptions::in_term(term))
                    .await
                {
                    Ok(res) => {
                        let _ = self
                            .raft
                            .wait_applied(res.last_offset, self.cfg.sync_timeout())
                            .await;
                        self.stats.auto_aborts.fetch_add(1, Ordering::Relaxed);
                        info!(%pid, tx_seq, "expired transaction aborted");
                    }
                    Err(e) => warn!(%pid, tx_seq, error = %e, "failed to replicate abort marker"),
                }
            }
            TxDecision::Unknown => {
                // push the deadline out one timeout so the sweep does not
                // spin on an undecided transaction
                let mut log = self.log_state.lock();
                if let Some(info) = log.expiration.get_mut(&pid) {
                    info.last_update = Instant::now();
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // apply path

    fn apply_data(&self, batch: &RecordBatch) {
        let bid = batch.header.batch_identity();
        if !bid.is_idempotent() {
            return;
        }
        let last_offset = batch.header.last_offset();
        {
            let mut log = self.log_state.lock();
            log.observe_seq(bid.pid, bid.last_seq(), last_offset, batch.header.term);
            if bid.is_transactional {
                log.extend_ongoing(bid.pid, batch.header.base_offset, last_offset);
            }
        }
        // the authoritative offsets replace the estimates
        let mut mem = self.mem_state.lock();
        mem.clear_inflight(bid.pid);
    }

    fn apply_fence(&self, batch: &RecordBatch) -> Result<()> {
        let data = read_fence_batch(batch)?;
        let pid = data.pid;

        let purged = {
            let mut log = self.log_state.lock();
            let raised = log.raise_fence(pid.producer_id, pid.epoch);
            let purged = if raised {
                log.purge_lower_epochs(pid.producer_id, pid.epoch)
            } else {
                Vec::new()
            };
            if let Some(tx_seq) = data.tx_seq {
                log.current_txes.insert(
                    pid,
                    TxData {
                        tx_seq,
                        tm_partition: data.tm_partition,
                    },
                );
                if let Some(timeout_ms) = data.transaction_timeout_ms {
                    log.expiration.insert(
                        pid,
                        ExpirationInfo::new(Duration::from_millis(timeout_ms.max(0) as u64)),
                    );
                }
            }
            purged
        };

        if !purged.is_empty() {
            debug!(%pid, purged = purged.len(), "fence purged lower-epoch sessions");
            let mut mem = self.mem_state.lock();
            for stale in purged {
                mem.forget(stale);
            }
        }
        self.expiry_notify.notify_one();
        Ok(())
    }

    fn apply_prepare(&self, batch: &RecordBatch) -> Result<()> {
        let marker = read_prepare_batch(batch)?;
        let mut log = self.log_state.lock();
        log.record_prepare(marker);
        Ok(())
    }

    fn apply_control(&self, batch: &RecordBatch) -> Result<()> {
        let kind = batch.control_record_kind()?;
        let pid = batch.header.pid();

        {
            let mut log = self.log_state.lock();
            match kind {
                ControlRecordKind::TxCommit => {
                    log.close_tx(pid);
                    self.stats.txs_committed.fetch_add(1, Ordering::Relaxed);
                }
                ControlRecordKind::TxAbort => {
                    if let Some(range) = log.close_tx(pid) {
                        log.record_aborted(range);
                    }
                    self.stats.txs_aborted.fetch_add(1, Ordering::Relaxed);
                }
                ControlRecordKind::Unknown => {
                    warn!(%pid, "ignoring control record of unknown kind");
                }
            }
        }

        let mut mem = self.mem_state.lock();
        mem.forget(pid);
        Ok(())
    }

    // ------------------------------------------------------------------
    // LSO and aborted ranges

    /// Offset below which no open transaction's effects can appear, or
    /// `None` while the partition is still replaying its log.
    pub fn last_stable_offset(&self) -> Option<Offset> {
        let bootstrap = *self.bootstrap_committed_offset.get()?;
        let applied = self.raft.last_applied_offset();
        if applied < bootstrap {
            return None;
        }

        let base = applied.min(self.raft.committed_offset());
        let ongoing_min = {
            let log = self.log_state.lock();
            log.ongoing_set.iter().next().copied()
        };

        let mut mem = self.mem_state.lock();
        let mut candidate = base + 1;
        for bound in [ongoing_min, mem.min_inflight_offset()].into_iter().flatten() {
            candidate = candidate.min(bound);
        }
        let lso = candidate.max(mem.last_lso);
        mem.last_lso = lso;
        Some(lso)
    }

    /// Highest offset the log may compact or upload, always strictly below
    /// any undecided offset
    pub fn max_collectible_offset(&self) -> Option<Offset> {
        self.last_stable_offset().map(|lso| lso - 1)
    }

    /// Every aborted range intersecting `[from, to]`, ascending by first
    /// offset. Offloaded segments are read back as needed.
    pub async fn aborted_transactions(&self, from: Offset, to: Offset) -> Result<Vec<TxRange>> {
        let _state_guard = self.state_lock.read().await;
        self.do_aborted_transactions(from, to).await
    }

    /// Alias used by the partition layer's compaction hooks
    pub async fn aborted_tx_ranges(&self, from: Offset, to: Offset) -> Result<Vec<TxRange>> {
        self.aborted_transactions(from, to).await
    }

    async fn do_aborted_transactions(&self, from: Offset, to: Offset) -> Result<Vec<TxRange>> {
        let (mut result, indexes) = {
            let log = self.log_state.lock();
            let in_memory: Vec<TxRange> = log
                .aborted
                .iter()
                .filter(|r| r.intersects(from, to))
                .copied()
                .collect();
            let indexes: Vec<AbortIndex> = log
                .abort_indexes
                .iter()
                .filter(|idx| idx.intersects(from, to))
                .copied()
                .collect();
            (in_memory, indexes)
        };

        for idx in indexes {
            let cached = {
                let log = self.log_state.lock();
                log.last_abort_snapshot
                    .as_ref()
                    .filter(|snap| snap.matches(idx))
                    .cloned()
            };
            let snapshot = match cached {
                Some(snapshot) => snapshot,
                None => match self.load_abort_snapshot(idx).await? {
                    Some(snapshot) => {
                        let mut log = self.log_state.lock();
                        log.last_abort_snapshot = Some(snapshot.clone());
                        snapshot
                    }
                    None => {
                        warn!(
                            first = idx.first,
                            last = idx.last,
                            "abort segment missing; ranges in it are unavailable"
                        );
                        continue;
                    }
                },
            };
            result.extend(
                snapshot
                    .aborted
                    .iter()
                    .filter(|r| r.intersects(from, to))
                    .copied(),
            );
        }

        result.sort_by_key(|r| r.first);
        Ok(result)
    }

    // ------------------------------------------------------------------
    // snapshots

    fn abort_snapshot_name(first: Offset, last: Offset) -> String {
        format!("abort.{first}.{last}.snapshot")
    }

    fn active_snapshot_version(&self) -> u8 {
        if self.cfg.transaction_partitioning {
            TX_SNAPSHOT_V4
        } else {
            TX_SNAPSHOT_V3
        }
    }

    /// Move the in-memory aborted list into an on-disk segment once it
    /// exceeds the configured size
    async fn offload_aborted_txns(&self) -> Result<()> {
        let snapshot = {
            let mut log = self.log_state.lock();
            if log.aborted.len() < self.cfg.abort_index_segment_size {
                return Ok(());
            }
            let batch = std::mem::take(&mut log.aborted);
            let first = batch.iter().map(|r| r.first).min().unwrap_or(0);
            let last = batch.iter().map(|r| r.last).max().unwrap_or(0);
            AbortSnapshot {
                first,
                last,
                aborted: batch,
            }
        };

        let name = Self::abort_snapshot_name(snapshot.first, snapshot.last);
        let size = self.snapshots.write(&name, &snapshot.encode())?;
        {
            let mut log = self.log_state.lock();
            let idx = AbortIndex {
                first: snapshot.first,
                last: snapshot.last,
            };
            let at = log.abort_indexes.partition_point(|i| i.first <= idx.first);
            log.abort_indexes.insert(at, idx);
        }
        self.abort_snapshot_sizes
            .lock()
            .insert((snapshot.first, snapshot.last), size);

        info!(
            first = snapshot.first,
            last = snapshot.last,
            ranges = snapshot.aborted.len(),
            bytes = size,
            "offloaded aborted ranges to segment"
        );
        Ok(())
    }

    async fn load_abort_snapshot(&self, idx: AbortIndex) -> Result<Option<AbortSnapshot>> {
        let name = Self::abort_snapshot_name(idx.first, idx.last);
        let Some(data) = self.snapshots.read(&name)? else {
            return Ok(None);
        };
        let snapshot = AbortSnapshot::decode(data)?;
        if !snapshot.matches(idx) {
            return Err(WeirError::SnapshotCorrupted(format!(
                "abort segment {name} covers [{}, {}], index says [{}, {}]",
                snapshot.first, snapshot.last, idx.first, idx.last
            )));
        }
        Ok(Some(snapshot))
    }

    /// Serialize the authoritative state at the current applied offset.
    /// Taken under the exclusive state lock so the capture is consistent.
    pub async fn take_local_snapshot(&self) -> Result<(Offset, Bytes)> {
        let _guard = self.state_lock.write().await;
        let offset = self.raft.last_applied_offset();
        let snapshot = {
            let log = self.log_state.lock();
            TxSnapshot::capture(&log, offset)
        };
        let bytes = snapshot.encode(self.active_snapshot_version())?;
        debug!(offset, bytes = bytes.len(), "took local snapshot");
        Ok((offset, bytes))
    }

    /// Replace the whole authoritative state from a local snapshot. The
    /// speculative overlay is wiped; the next operation re-syncs.
    pub async fn apply_local_snapshot(&self, data: Bytes) -> Result<()> {
        let _guard = self.state_lock.write().await;
        let snapshot = TxSnapshot::decode(data)?;
        self.install_snapshot(snapshot)
    }

    fn install_snapshot(&self, snapshot: TxSnapshot) -> Result<()> {
        {
            let mut log = self.log_state.lock();
            snapshot.restore(&mut log);
        }
        {
            let mut mem = self.mem_state.lock();
            mem.wipe(-1);
        }
        info!(
            offset = snapshot.offset,
            producers = snapshot.seqs.len(),
            ongoing = snapshot.ongoing.len(),
            "installed transaction state snapshot"
        );
        Ok(())
    }

    /// Delete all persisted abort segments (partition teardown)
    pub async fn remove_persistent_state(&self) -> Result<()> {
        self.snapshots.remove_all()?;
        self.abort_snapshot_sizes.lock().clear();
        Ok(())
    }

    /// Total bytes of persisted abort segments
    pub fn local_snapshot_size(&self) -> u64 {
        self.abort_snapshot_sizes.lock().values().sum()
    }

    // ------------------------------------------------------------------
    // introspection

    /// All transactions the partition currently tracks
    pub async fn get_transactions(&self) -> Result<BTreeMap<Pid, TransactionInfo>> {
        let _state_guard = self.state_lock.read().await;
        let mut result = BTreeMap::new();

        let log = self.log_state.lock();
        for (pid, range) in &log.ongoing_map {
            result.insert(
                *pid,
                TransactionInfo {
                    status: TxStatus::Ongoing,
                    lso_bound: range.first,
                    expiration: log.expiration.get(pid).copied(),
                    seq: log.tail_seq(*pid),
                },
            );
        }
        for pid in log.prepared.keys() {
            result.entry(*pid).or_insert(TransactionInfo {
                status: TxStatus::Prepared,
                lso_bound: -1,
                expiration: log.expiration.get(pid).copied(),
                seq: log.tail_seq(*pid),
            });
        }
        let expiration: Vec<(Pid, Option<ExpirationInfo>)> = log
            .current_txes
            .keys()
            .map(|pid| (*pid, log.expiration.get(pid).copied()))
            .collect();
        drop(log);

        let mem = self.mem_state.lock();
        for (pid, offset) in &mem.tx_start {
            result.entry(*pid).or_insert(TransactionInfo {
                status: TxStatus::Initiating,
                lso_bound: *offset,
                expiration: None,
                seq: None,
            });
        }
        for pid in mem.preparing.keys() {
            if let Some(info) = result.get_mut(pid) {
                info.status = TxStatus::Preparing;
            }
        }
        drop(mem);

        // sessions with a begun-but-empty transaction
        for (pid, expiration) in expiration {
            result.entry(pid).or_insert(TransactionInfo {
                status: TxStatus::Initiating,
                lso_bound: -1,
                expiration,
                seq: None,
            });
        }

        Ok(result)
    }

    /// Whether any state is tracked for the session
    pub fn is_known_session(&self, pid: Pid) -> bool {
        {
            let log = self.log_state.lock();
            if log.ongoing_map.contains_key(&pid) || log.current_txes.contains_key(&pid) {
                return true;
            }
        }
        let mem = self.mem_state.lock();
        mem.estimated.contains_key(&pid) || mem.tx_start.contains_key(&pid)
    }

    pub fn get_expiration_info(&self, pid: Pid) -> Option<ExpirationInfo> {
        self.log_state.lock().expiration.get(&pid).copied()
    }

    pub fn get_seq_number(&self, pid: Pid) -> Option<SequenceNumber> {
        self.log_state.lock().tail_seq(pid)
    }

    /// Point-in-time counters
    pub fn stats(&self) -> TxStatsSnapshot {
        TxStatsSnapshot {
            replicated_batches: self.stats.replicated_batches.load(Ordering::Relaxed),
            cached_replays: self.stats.cached_replays.load(Ordering::Relaxed),
            duplicates_rejected: self.stats.duplicates_rejected.load(Ordering::Relaxed),
            out_of_order_rejected: self.stats.out_of_order_rejected.load(Ordering::Relaxed),
            fence_rejections: self.stats.fence_rejections.load(Ordering::Relaxed),
            txs_begun: self.stats.txs_begun.load(Ordering::Relaxed),
            txs_committed: self.stats.txs_committed.load(Ordering::Relaxed),
            txs_aborted: self.stats.txs_aborted.load(Ordering::Relaxed),
            auto_aborts: self.stats.auto_aborts.load(Ordering::Relaxed),
        }
    }

    fn log_tx_stats(&self) {
        let (producers, ongoing, aborted, indexes) = {
            let log = self.log_state.lock();
            (
                log.seq_table.len(),
                log.ongoing_map.len(),
                log.aborted.len(),
                log.abort_indexes.len(),
            )
        };
        let stats = self.stats();
        info!(
            producers,
            ongoing,
            aborted,
            abort_indexes = indexes,
            replicated = stats.replicated_batches,
            cached_replays = stats.cached_replays,
            committed = stats.txs_committed,
            tx_aborted = stats.txs_aborted,
            mem_bytes = self.mem_root.consumption(),
            "transaction state"
        );
    }

    /// Quiesce the partition for a leadership handover: producer-scoped
    /// operations drain and new ones block until the guard drops.
    pub async fn prepare_transfer_leadership(&self) -> tokio::sync::RwLockWriteGuard<'_, ()> {
        self.state_lock.write().await
    }

    /// Producer-state-manager eviction callback
    fn cleanup_producer_state(&self, pid: Pid) {
        {
            let mut log = self.log_state.lock();
            log.forget(pid);
        }
        {
            let mut mem = self.mem_state.lock();
            mem.forget(pid);
        }
        self.tx_locks.remove(&pid.producer_id);
        debug!(%pid, "cleaned up evicted producer state");
    }
}

#[async_trait]
impl StateMachine for PartitionTxManager {
    fn name(&self) -> &'static str {
        "partition-tx"
    }

    async fn apply(&self, batch: &RecordBatch) -> Result<()> {
        match batch.header.kind {
            BatchKind::Data => self.apply_data(batch),
            BatchKind::Fence => self.apply_fence(batch)?,
            BatchKind::Prepare => self.apply_prepare(batch)?,
            BatchKind::Control => self.apply_control(batch)?,
        }

        let over_threshold = {
            let log = self.log_state.lock();
            log.aborted.len() >= self.cfg.abort_index_segment_size
        };
        if over_threshold {
            self.offload_aborted_txns().await?;
        }
        Ok(())
    }

    async fn apply_raft_snapshot(&self, snapshot: Bytes) -> Result<()> {
        let _guard = self.state_lock.write().await;
        let decoded = TxSnapshot::decode(snapshot)?;
        // the log prefix is gone; every derived structure restarts from
        // the snapshot
        self.producers.clear();
        self.tx_locks.clear();
        self.install_snapshot(decoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::record::Record;
    use crate::testing::{InMemoryRaft, ScriptedCoordinator};
    use crate::transaction::log_state::{SeqCacheEntry, SeqEntry};
    use bytes::Bytes;
    use tempfile::TempDir;

    struct Harness {
        stm: Arc<PartitionTxManager>,
        raft: Arc<InMemoryRaft>,
        coordinator: Arc<ScriptedCoordinator>,
        dir: TempDir,
    }

    async fn harness() -> Harness {
        harness_with(TxManagerConfig::default(), true).await
    }

    async fn harness_with(cfg: TxManagerConfig, disable_autoabort: bool) -> Harness {
        let raft = Arc::new(InMemoryRaft::new());
        let coordinator = Arc::new(ScriptedCoordinator::new());
        let dir = TempDir::new().unwrap();
        let stm = PartitionTxManager::new(
            cfg,
            raft.clone(),
            coordinator.clone(),
            Arc::new(ProducerStateManager::new()),
            dir.path().join("tx"),
        )
        .unwrap();
        raft.attach(&stm);
        stm.start().await.unwrap();
        if disable_autoabort {
            stm.testing_only_disable_auto_abort();
        }
        Harness {
            stm,
            raft,
            coordinator,
            dir,
        }
    }

    fn data(pid: Pid, base_seq: SequenceNumber, count: usize) -> (BatchIdentity, RecordBatch) {
        let bid = BatchIdentity::idempotent(pid, base_seq, count as i32);
        let batch = RecordBatch::data(
            bid,
            (0..count)
                .map(|i| Record::new(None, Bytes::from(format!("r{i}"))))
                .collect(),
        );
        (bid, batch)
    }

    fn tx_data(pid: Pid, base_seq: SequenceNumber, count: usize) -> (BatchIdentity, RecordBatch) {
        let bid = BatchIdentity::transactional(pid, base_seq, count as i32);
        let batch = RecordBatch::data(
            bid,
            (0..count)
                .map(|i| Record::new(None, Bytes::from(format!("t{i}"))))
                .collect(),
        );
        (bid, batch)
    }

    async fn produce(h: &Harness, pid: Pid, base_seq: SequenceNumber, count: usize) -> Result<KafkaResult> {
        let (bid, batch) = data(pid, base_seq, count);
        h.stm.replicate(bid, batch, ReplicateOptions::quorum()).await
    }

    async fn tx_produce(
        h: &Harness,
        pid: Pid,
        base_seq: SequenceNumber,
        count: usize,
    ) -> Result<KafkaResult> {
        let (bid, batch) = tx_data(pid, base_seq, count);
        h.stm.replicate(bid, batch, ReplicateOptions::quorum()).await
    }

    fn tx_err(result: Result<impl std::fmt::Debug>) -> TxError {
        match result.unwrap_err() {
            WeirError::Tx(tx) => tx,
            other => panic!("expected tx error, got {other}"),
        }
    }

    // ==================== Idempotent Replication ====================

    #[tokio::test]
    async fn test_idempotent_replay_returns_cached_offset() {
        let h = harness().await;
        let pid = Pid::new(7, 0);

        let first = produce(&h, pid, 0, 3).await.unwrap();
        assert_eq!(first.base_offset, 0);
        assert_eq!(first.last_offset, 2);

        let retry = produce(&h, pid, 0, 3).await.unwrap();
        assert_eq!(retry, first);
        assert_eq!(h.raft.log_len(), 1, "retry must not append");
        assert_eq!(h.stm.stats().cached_replays, 1);
    }

    #[tokio::test]
    async fn test_out_of_order_sequence_rejected() {
        let h = harness().await;
        let pid = Pid::new(7, 0);
        produce(&h, pid, 0, 3).await.unwrap();

        let err = tx_err(produce(&h, pid, 10, 1).await);
        assert_eq!(
            err,
            TxError::OutOfOrderSequence {
                expected: 3,
                received: 10
            }
        );
        // the table was not disturbed
        assert_eq!(h.stm.get_seq_number(pid), Some(2));
        assert_eq!(h.raft.log_len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_sequence_rejected() {
        let h = harness().await;
        let pid = Pid::new(7, 0);
        produce(&h, pid, 0, 3).await.unwrap();
        produce(&h, pid, 3, 3).await.unwrap();

        // base 1 does not match any remembered batch boundary
        let err = tx_err(produce(&h, pid, 1, 1).await);
        assert_eq!(err, TxError::DuplicateSequence(1));
    }

    #[tokio::test]
    async fn test_new_session_must_start_at_zero() {
        let h = harness().await;
        let err = tx_err(produce(&h, Pid::new(7, 0), 5, 1).await);
        assert_eq!(
            err,
            TxError::OutOfOrderSequence {
                expected: 0,
                received: 5
            }
        );
    }

    #[tokio::test]
    async fn test_pipelined_batches_advance_seq() {
        let h = harness().await;
        let pid = Pid::new(7, 0);
        produce(&h, pid, 0, 2).await.unwrap();
        produce(&h, pid, 2, 2).await.unwrap();
        let third = produce(&h, pid, 4, 1).await.unwrap();
        assert_eq!(third.base_offset, 4);
        assert_eq!(h.stm.get_seq_number(pid), Some(4));
    }

    #[tokio::test]
    async fn test_plain_producer_bypasses_sequencing() {
        let h = harness().await;
        let pid = Pid::new(-1, 0);
        let (bid, batch) = data(pid, 0, 1);
        let a = h.stm.replicate(bid, batch, ReplicateOptions::quorum()).await.unwrap();
        let (bid, batch) = data(pid, 0, 1);
        let b = h.stm.replicate(bid, batch, ReplicateOptions::quorum()).await.unwrap();
        // same "sequence" twice is fine, both batches landed
        assert_ne!(a.base_offset, b.base_offset);
        assert_eq!(h.raft.log_len(), 2);
    }

    // ==================== Fencing ====================

    #[tokio::test]
    async fn test_fence_rejects_lower_epoch() {
        let h = harness().await;
        let old = Pid::new(7, 0);
        let new = Pid::new(7, 1);

        h.stm.begin_tx(new, 1, Duration::from_secs(30), 0).await.unwrap();

        let err = tx_err(produce(&h, old, 0, 1).await);
        assert_eq!(
            err,
            TxError::Fenced {
                current: 1,
                received: 0
            }
        );
        assert_eq!(h.stm.stats().fence_rejections, 1);
    }

    #[tokio::test]
    async fn test_fence_purges_lower_epoch_state() {
        let h = harness().await;
        let old = Pid::new(7, 0);
        let new = Pid::new(7, 1);

        h.stm.begin_tx(old, 1, Duration::from_secs(30), 0).await.unwrap();
        tx_produce(&h, old, 0, 2).await.unwrap();
        assert!(h.stm.is_known_session(old));
        let gated = h.stm.last_stable_offset().unwrap();

        h.stm.begin_tx(new, 2, Duration::from_secs(30), 0).await.unwrap();

        assert!(!h.stm.is_known_session(old));
        // the old transaction no longer pins the LSO
        assert!(h.stm.last_stable_offset().unwrap() >= gated);
        let err = tx_err(h.stm.commit_tx(old, 1, Duration::from_secs(1)).await);
        assert!(matches!(err, TxError::Fenced { .. }));
    }

    #[tokio::test]
    async fn test_epoch_monotonic_over_life() {
        let h = harness().await;
        for epoch in [1i16, 3, 2, 5, 4] {
            let pid = Pid::new(7, epoch);
            let _ = h.stm.begin_tx(pid, epoch as i64, Duration::from_secs(30), 0).await;
        }
        let fenced = {
            let log = h.stm.log_state.lock();
            *log.fence_pid_epoch.get(&7).unwrap()
        };
        assert_eq!(fenced, 5);
    }

    // ==================== Transaction Lifecycle ====================

    #[tokio::test]
    async fn test_begin_requires_no_open_tx() {
        let h = harness().await;
        let pid = Pid::new(8, 0);
        h.stm.begin_tx(pid, 1, Duration::from_secs(30), 0).await.unwrap();

        let err = tx_err(h.stm.begin_tx(pid, 2, Duration::from_secs(30), 0).await);
        assert_eq!(err, TxError::TxAlreadyInProgress);

        // retry of the same begin is idempotent
        h.stm.begin_tx(pid, 1, Duration::from_secs(30), 0).await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_requires_matching_tx_seq() {
        let h = harness().await;
        let pid = Pid::new(8, 0);
        h.stm.begin_tx(pid, 5, Duration::from_secs(30), 0).await.unwrap();
        tx_produce(&h, pid, 0, 1).await.unwrap();

        assert_eq!(
            tx_err(h.stm.commit_tx(pid, 4, Duration::from_secs(1)).await),
            TxError::Stale(4)
        );
        assert_eq!(
            tx_err(h.stm.commit_tx(pid, 6, Duration::from_secs(1)).await),
            TxError::TxNotFound
        );
        h.stm.commit_tx(pid, 5, Duration::from_secs(1)).await.unwrap();
        assert!(!h.stm.is_known_session(pid));
    }

    #[tokio::test]
    async fn test_transactional_write_requires_begin() {
        let h = harness().await;
        let err = tx_err(tx_produce(&h, Pid::new(8, 0), 0, 1).await);
        assert_eq!(err, TxError::InvalidTxState);
    }

    #[tokio::test]
    async fn test_term_change_invalidates_open_tx() {
        let h = harness().await;
        let pid = Pid::new(8, 0);
        h.stm.begin_tx(pid, 1, Duration::from_secs(30), 0).await.unwrap();

        h.raft.bump_term();

        // the fence survives on the log but the overlay is gone: the
        // client must re-begin through the (new) leader
        let err = tx_err(tx_produce(&h, pid, 0, 1).await);
        assert_eq!(err, TxError::NotLeader);
    }

    #[tokio::test]
    async fn test_abort_records_aborted_range() {
        let h = harness().await;
        let pid = Pid::new(8, 0);
        h.stm.begin_tx(pid, 1, Duration::from_secs(30), 0).await.unwrap();
        let res = tx_produce(&h, pid, 0, 3).await.unwrap();

        h.stm.abort_tx(pid, Some(1), Duration::from_secs(1)).await.unwrap();

        let ranges = h
            .stm
            .aborted_transactions(0, i64::MAX)
            .await
            .unwrap();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].first, res.base_offset);
        assert_eq!(ranges[0].last, res.last_offset);
        assert_eq!(h.stm.stats().txs_aborted, 1);
    }

    #[tokio::test]
    async fn test_mark_expired_requires_known_tx() {
        let h = harness().await;
        let err = tx_err(h.stm.mark_expired(Pid::new(9, 0)).await);
        assert_eq!(err, TxError::TxNotFound);
    }

    // ==================== LSO ====================

    #[tokio::test]
    async fn test_lso_gates_open_transaction() {
        let h = harness().await;
        let pid = Pid::new(8, 0);
        h.stm.begin_tx(pid, 1, Duration::from_secs(30), 0).await.unwrap();

        let res = tx_produce(&h, pid, 0, 1).await.unwrap();
        assert_eq!(h.stm.last_stable_offset(), Some(res.base_offset));

        h.stm.commit_tx(pid, 1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(
            h.stm.last_stable_offset(),
            Some(h.raft.last_applied_offset() + 1)
        );
    }

    #[tokio::test]
    async fn test_lso_monotonic_across_operations() {
        let h = harness().await;
        let pid = Pid::new(8, 0);
        let mut last = h.stm.last_stable_offset().unwrap();

        for round in 0..3i64 {
            h.stm
                .begin_tx(Pid::new(8, 0), round + 1, Duration::from_secs(30), 0)
                .await
                .unwrap();
            let lso = h.stm.last_stable_offset().unwrap();
            assert!(lso >= last);
            last = lso;

            tx_produce(&h, pid, (round * 2) as i32, 2).await.unwrap();
            let lso = h.stm.last_stable_offset().unwrap();
            assert!(lso >= last);
            last = lso;

            h.stm
                .commit_tx(pid, round + 1, Duration::from_secs(1))
                .await
                .unwrap();
            let lso = h.stm.last_stable_offset().unwrap();
            assert!(lso >= last);
            last = lso;
        }
    }

    #[tokio::test]
    async fn test_max_collectible_is_prev_offset() {
        let h = harness().await;
        produce(&h, Pid::new(7, 0), 0, 5).await.unwrap();
        let lso = h.stm.last_stable_offset().unwrap();
        assert_eq!(h.stm.max_collectible_offset(), Some(lso - 1));
    }

    #[tokio::test]
    async fn test_inflight_write_bounds_lso() {
        let h = harness().await;
        // seed one applied batch so the LSO has a base
        produce(&h, Pid::new(7, 0), 0, 1).await.unwrap();
        let before = h.stm.last_stable_offset().unwrap();

        // replication succeeds but applies are held back
        h.raft.set_manual_apply(true);
        produce(&h, Pid::new(7, 0), 1, 1).await.unwrap();
        let speculative = h.stm.last_stable_offset().unwrap();
        assert!(speculative >= before);

        h.raft.drain_applies().await.unwrap();
        assert!(h.stm.last_stable_offset().unwrap() >= speculative);
    }

    // ==================== Abort offload ====================

    #[tokio::test]
    async fn test_abort_offload_to_segment() {
        let mut cfg = TxManagerConfig::default();
        cfg.abort_index_segment_size = 3;
        let h = harness_with(cfg, true).await;
        let pid = Pid::new(8, 0);

        for (tx_seq, base) in [(1i64, 0i32), (2, 5), (3, 10)] {
            h.stm
                .begin_tx(pid, tx_seq, Duration::from_secs(30), 0)
                .await
                .unwrap();
            tx_produce(&h, pid, base, 5).await.unwrap();
            h.stm
                .abort_tx(pid, Some(tx_seq), Duration::from_secs(1))
                .await
                .unwrap();
        }

        {
            let log = h.stm.log_state.lock();
            assert!(log.aborted.is_empty(), "in-memory list must be offloaded");
            assert_eq!(log.abort_indexes.len(), 1);
        }
        assert!(h.stm.local_snapshot_size() > 0);

        // every aborted range is still answerable through the segment
        let all = h.stm.aborted_transactions(0, i64::MAX).await.unwrap();
        assert_eq!(all.len(), 3);
        let firsts: Vec<i64> = all.iter().map(|r| r.first).collect();
        assert_eq!(firsts, {
            let mut sorted = firsts.clone();
            sorted.sort();
            sorted
        });

        // a narrower window intersects all three ranges here
        let some = h
            .stm
            .aborted_transactions(all[0].last, all[2].first)
            .await
            .unwrap();
        assert_eq!(some.len(), 3);
    }

    #[tokio::test]
    async fn test_remove_persistent_state_drops_segments() {
        let mut cfg = TxManagerConfig::default();
        cfg.abort_index_segment_size = 1;
        let h = harness_with(cfg, true).await;
        let pid = Pid::new(8, 0);

        h.stm.begin_tx(pid, 1, Duration::from_secs(30), 0).await.unwrap();
        tx_produce(&h, pid, 0, 2).await.unwrap();
        h.stm.abort_tx(pid, Some(1), Duration::from_secs(1)).await.unwrap();

        assert!(h.stm.local_snapshot_size() > 0);
        h.stm.remove_persistent_state().await.unwrap();
        assert_eq!(h.stm.local_snapshot_size(), 0);
    }

    // ==================== Snapshots ====================

    #[tokio::test]
    async fn test_local_snapshot_round_trip() {
        let h = harness().await;
        let pid = Pid::new(8, 2);
        produce(&h, Pid::new(7, 0), 0, 3).await.unwrap();
        h.stm.begin_tx(pid, 9, Duration::from_secs(30), 4).await.unwrap();
        tx_produce(&h, pid, 0, 2).await.unwrap();

        let (offset, bytes) = h.stm.take_local_snapshot().await.unwrap();
        assert_eq!(offset, h.raft.last_applied_offset());

        // a fresh manager over the same snapshot directory
        let h2 = harness().await;
        h2.stm.apply_local_snapshot(bytes).await.unwrap();

        let before = {
            let log = h.stm.log_state.lock();
            TxSnapshot::capture(&log, offset)
        };
        let after = {
            let log = h2.stm.log_state.lock();
            TxSnapshot::capture(&log, offset)
        };
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_v3_snapshot_loads_into_v4_manager() {
        let mut cfg = TxManagerConfig::default();
        cfg.transaction_partitioning = false;
        let h3 = harness_with(cfg, true).await;
        let pid = Pid::new(8, 0);
        h3.stm.begin_tx(pid, 9, Duration::from_secs(30), 4).await.unwrap();
        tx_produce(&h3, pid, 0, 2).await.unwrap();

        let (_, bytes) = h3.stm.take_local_snapshot().await.unwrap();
        assert_eq!(bytes[0], TX_SNAPSHOT_V3);

        let h4 = harness().await;
        h4.stm.apply_local_snapshot(bytes).await.unwrap();
        let log = h4.stm.log_state.lock();
        let tx = log.current_txes.get(&pid).unwrap();
        assert_eq!(tx.tx_seq, 9);
        assert_eq!(tx.tm_partition, crate::transaction::identity::UNKNOWN_TM_PARTITION);
    }

    #[tokio::test]
    async fn test_corrupted_snapshot_refused() {
        let h = harness().await;
        let err = h
            .stm
            .apply_local_snapshot(Bytes::from_static(&[4, 1, 2]))
            .await
            .unwrap_err();
        assert!(matches!(err, WeirError::SnapshotCorrupted(_)));

        let err = h
            .stm
            .apply_local_snapshot(Bytes::from_static(&[2]))
            .await
            .unwrap_err();
        assert!(matches!(err, WeirError::UnsupportedSnapshotVersion(2)));
    }

    #[tokio::test]
    async fn test_raft_snapshot_resets_state() {
        let h = harness().await;
        let pid = Pid::new(8, 0);
        h.stm.begin_tx(pid, 1, Duration::from_secs(30), 0).await.unwrap();
        tx_produce(&h, pid, 0, 2).await.unwrap();

        let snapshot = {
            let log = h.stm.log_state.lock();
            TxSnapshot::capture(&log, h.raft.last_applied_offset())
        };
        let bytes = snapshot.encode(TX_SNAPSHOT_V4).unwrap();

        let h2 = harness().await;
        produce(&h2, Pid::new(1, 0), 0, 1).await.unwrap();
        h2.stm.apply_raft_snapshot(bytes).await.unwrap();

        let log = h2.stm.log_state.lock();
        assert!(log.current_txes.contains_key(&pid));
        assert!(!log.seq_table.contains_key(&Pid::new(1, 0)));
    }

    // ==================== Replay determinism ====================

    #[tokio::test]
    async fn test_replay_rebuilds_identical_state() {
        let h = harness().await;
        let pid = Pid::new(8, 0);
        produce(&h, Pid::new(7, 0), 0, 3).await.unwrap();
        h.stm.begin_tx(pid, 1, Duration::from_secs(30), 0).await.unwrap();
        tx_produce(&h, pid, 0, 2).await.unwrap();
        h.stm.abort_tx(pid, Some(1), Duration::from_secs(1)).await.unwrap();
        produce(&h, Pid::new(7, 0), 3, 1).await.unwrap();

        let fresh = harness().await;
        h.raft.replay_into(fresh.stm.as_ref()).await.unwrap();

        let original = {
            let log = h.stm.log_state.lock();
            TxSnapshot::capture(&log, 0)
        };
        let replayed = {
            let log = fresh.stm.log_state.lock();
            TxSnapshot::capture(&log, 0)
        };
        // timestamps differ between runs; compare everything else
        assert_eq!(original.fenced, replayed.fenced);
        assert_eq!(original.ongoing, replayed.ongoing);
        assert_eq!(original.aborted, replayed.aborted);
        assert_eq!(original.tx_data, replayed.tx_data);
        let strip = |seqs: &[SeqEntry]| -> Vec<(Pid, i32, i64, Vec<SeqCacheEntry>)> {
            seqs.iter()
                .map(|e| (e.pid, e.seq, e.last_offset, e.seq_cache.iter().copied().collect()))
                .collect()
        };
        assert_eq!(strip(&original.seqs), strip(&replayed.seqs));
    }

    // ==================== Auto-abort ====================

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_auto_abort_follows_coordinator_decision() {
        let mut cfg = TxManagerConfig::default();
        cfg.abort_interval_ms = 25;
        cfg.tx_timeout_delay_ms = 10;
        let h = harness_with(cfg, false).await;
        let pid = Pid::new(8, 0);

        h.stm
            .begin_tx(pid, 7, Duration::from_millis(30), 0)
            .await
            .unwrap();
        tx_produce(&h, pid, 0, 2).await.unwrap();
        h.coordinator.script(pid, 7, TxDecision::Abort);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if h.stm.stats().auto_aborts >= 1 {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "auto-abort did not fire"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(h.coordinator.calls() >= 1);
        assert!(!h.stm.is_known_session(pid));
        let ranges = h.stm.aborted_transactions(0, i64::MAX).await.unwrap();
        assert_eq!(ranges.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_mark_expired_prompts_resolution() {
        let mut cfg = TxManagerConfig::default();
        cfg.abort_interval_ms = 25;
        cfg.tx_timeout_delay_ms = 10;
        let h = harness_with(cfg, false).await;
        let pid = Pid::new(8, 0);

        h.stm
            .begin_tx(pid, 3, Duration::from_secs(3600), 0)
            .await
            .unwrap();
        h.coordinator.script(pid, 3, TxDecision::Commit);
        h.stm.mark_expired(pid).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if !h.stm.is_known_session(pid) && h.stm.get_tx_seq(pid).is_none() {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "expiry request was not resolved"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(h.stm.stats().txs_committed, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unreachable_coordinator_defers_expiry() {
        let mut cfg = TxManagerConfig::default();
        cfg.abort_interval_ms = 25;
        cfg.tx_timeout_delay_ms = 10;
        let h = harness_with(cfg, false).await;
        let pid = Pid::new(8, 0);

        h.stm
            .begin_tx(pid, 3, Duration::from_millis(30), 0)
            .await
            .unwrap();
        tx_produce(&h, pid, 0, 1).await.unwrap();
        h.coordinator.set_unreachable(true);

        // the coordinator is asked, but nothing changes unilaterally
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while h.coordinator.calls() == 0 {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(h.stm.is_known_session(pid));
        assert_eq!(h.stm.get_tx_seq(pid), Some(3));
    }

    // ==================== Stages, shutdown, introspection ====================

    #[tokio::test]
    async fn test_replicate_in_stages() {
        let h = harness().await;
        let pid = Pid::new(7, 0);
        let (bid, batch) = data(pid, 0, 2);

        let stages = h
            .stm
            .replicate_in_stages(bid, batch, ReplicateOptions::quorum());
        stages.enqueued.await.unwrap();
        let result = stages.committed.await.unwrap().unwrap();
        assert_eq!(result.base_offset, 0);
        assert_eq!(result.last_offset, 1);
    }

    #[tokio::test]
    async fn test_stop_rejects_new_operations() {
        let h = harness().await;
        h.stm.stop().await;
        let err = tx_err(produce(&h, Pid::new(7, 0), 0, 1).await);
        assert_eq!(err, TxError::ShuttingDown);
    }

    #[tokio::test]
    async fn test_not_leader_rejected() {
        let h = harness().await;
        h.raft.set_leader(false);
        let err = tx_err(produce(&h, Pid::new(7, 0), 0, 1).await);
        assert_eq!(err, TxError::NotLeader);
    }

    #[tokio::test]
    async fn test_get_transactions_reports_states() {
        let h = harness().await;
        let ongoing = Pid::new(8, 0);
        h.stm.begin_tx(ongoing, 1, Duration::from_secs(30), 0).await.unwrap();
        tx_produce(&h, ongoing, 0, 2).await.unwrap();

        let initiating = Pid::new(9, 0);
        h.stm
            .begin_tx(initiating, 1, Duration::from_secs(30), 0)
            .await
            .unwrap();

        let txes = h.stm.get_transactions().await.unwrap();
        assert_eq!(txes.get(&ongoing).unwrap().status, TxStatus::Ongoing);
        assert_eq!(txes.get(&initiating).unwrap().status, TxStatus::Initiating);
        assert!(txes.get(&ongoing).unwrap().lso_bound >= 0);
    }

    #[tokio::test]
    async fn test_producer_eviction_forgets_state() {
        let h = harness().await;
        let producers = {
            // reach the same manager the harness wired in
            h.stm.producers.clone()
        };
        let pid = Pid::new(7, 0);
        produce(&h, pid, 0, 2).await.unwrap();
        assert_eq!(h.stm.get_seq_number(pid), Some(1));

        producers.evict(pid);
        assert_eq!(h.stm.get_seq_number(pid), None);
    }

    #[tokio::test]
    async fn test_abort_origin_classification() {
        let h = harness().await;
        assert_eq!(h.stm.abort_origin(5, 4), AbortOrigin::PresentInThePast);
        assert_eq!(h.stm.abort_origin(5, 5), AbortOrigin::Present);
        assert_eq!(h.stm.abort_origin(5, 6), AbortOrigin::Future);
    }

    #[tokio::test]
    async fn test_prepare_transfer_leadership_quiesces() {
        let h = harness().await;
        let guard = h.stm.prepare_transfer_leadership().await;
        // while held, a producer operation cannot make progress
        let stm = h.stm.clone();
        let attempt = tokio::spawn(async move {
            let (bid, batch) = data(Pid::new(7, 0), 0, 1);
            stm.replicate(bid, batch, ReplicateOptions::quorum()).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!attempt.is_finished());
        drop(guard);
        attempt.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_dir_is_used() {
        let h = harness().await;
        assert!(h.dir.path().join("tx").is_dir());
    }
}
