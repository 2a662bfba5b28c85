//! Transaction coordinator seam
//!
//! Open transactions whose producers go quiet are resolved by asking the
//! coordinator that owns the transaction for its durable decision. The
//! coordinator is a separate cluster service; the resource manager only
//! needs this one routed question, and it never overrides the answer.

use crate::transaction::identity::{Pid, TxSeq};
use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;

/// The coordinator's durable decision for one transaction attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxDecision {
    Commit,
    Abort,
    /// The coordinator has not decided (or does not know the attempt);
    /// the caller must retry later and change nothing in the meantime
    Unknown,
}

/// What the resource manager consumes from the coordinator service
#[async_trait]
pub trait TxCoordinator: Send + Sync + 'static {
    /// Route a decision request to the coordinator partition owning the
    /// transaction. Transport failures surface as
    /// [`TxError::CoordinatorUnreachable`](crate::error::TxError::CoordinatorUnreachable).
    async fn route_transaction_decision(
        &self,
        pid: Pid,
        tx_seq: TxSeq,
    ) -> crate::error::Result<TxDecision>;
}

/// Bounded exponential backoff with jitter for coordinator retries
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl RetryBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// Delay before the next attempt: `base * 2^attempt`, capped at `max`,
    /// with up to 25% random jitter so retries from many partitions do not
    /// align.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base.saturating_mul(1u32 << self.attempt.min(16));
        let capped = exp.min(self.max);
        self.attempt = self.attempt.saturating_add(1);

        let jitter_range = capped.as_millis() as u64 / 4;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(0..jitter_range)
        } else {
            0
        };
        capped + Duration::from_millis(jitter)
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
