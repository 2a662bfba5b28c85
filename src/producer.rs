//! Producer session handles and eviction
//!
//! The partition transaction manager tracks state per producer session.
//! Sessions are owned jointly: the manager here hands out shared handles,
//! decides when an idle producer should be evicted, and notifies the
//! partition through a cleanup hook so it can drop the session's
//! transactional state. Back-references go through the hook only; handles
//! never point at the partition.

use crate::transaction::identity::Pid;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Callback invoked when a producer's state must be dropped
pub type CleanupFn = Box<dyn Fn(Pid) + Send + Sync>;

/// Shared handle for one producer session
#[derive(Debug)]
pub struct ProducerHandle {
    pid: Pid,
    created_at_ms: i64,
    last_touched_ms: AtomicI64,
}

impl ProducerHandle {
    fn new(pid: Pid) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            pid,
            created_at_ms: now,
            last_touched_ms: AtomicI64::new(now),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn created_at_ms(&self) -> i64 {
        self.created_at_ms
    }

    /// Record activity; evictions consider the most recent touch
    pub fn touch(&self) {
        self.last_touched_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn idle_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis() - self.last_touched_ms.load(Ordering::Relaxed)
    }
}

/// Hands out producer handles and evicts idle ones
pub struct ProducerStateManager {
    producers: DashMap<Pid, Arc<ProducerHandle>>,
    cleanup_hook: RwLock<Option<CleanupFn>>,
}

impl Default for ProducerStateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ProducerStateManager {
    pub fn new() -> Self {
        Self {
            producers: DashMap::new(),
            cleanup_hook: RwLock::new(None),
        }
    }

    /// Register the partition's cleanup callback. Called once at start.
    pub fn set_cleanup_hook(&self, hook: CleanupFn) {
        *self.cleanup_hook.write() = Some(hook);
    }

    /// Get or create the handle for a session, touching it
    pub fn acquire(&self, pid: Pid) -> Arc<ProducerHandle> {
        let handle = self
            .producers
            .entry(pid)
            .or_insert_with(|| {
                debug!(%pid, "registered producer session");
                Arc::new(ProducerHandle::new(pid))
            })
            .clone();
        handle.touch();
        handle
    }

    pub fn get(&self, pid: Pid) -> Option<Arc<ProducerHandle>> {
        self.producers.get(&pid).map(|h| h.clone())
    }

    /// Drop a single session and notify the partition
    pub fn evict(&self, pid: Pid) {
        if self.producers.remove(&pid).is_some() {
            self.notify_cleanup(pid);
        }
    }

    /// Evict every session idle longer than `max_idle`. Returns the number
    /// of sessions evicted.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let cutoff = max_idle.as_millis() as i64;
        let stale: Vec<Pid> = self
            .producers
            .iter()
            .filter(|entry| entry.value().idle_ms() > cutoff)
            .map(|entry| *entry.key())
            .collect();

        for pid in &stale {
            self.producers.remove(pid);
            self.notify_cleanup(*pid);
        }
        if !stale.is_empty() {
            info!(evicted = stale.len(), "evicted idle producer sessions");
        }
        stale.len()
    }

    /// Drop all handles without cleanup callbacks (full state reset; the
    /// partition has already discarded its transactional state wholesale)
    pub fn clear(&self) {
        self.producers.clear();
    }

    pub fn len(&self) -> usize {
        self.producers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }

    fn notify_cleanup(&self, pid: Pid) {
        if let Some(hook) = self.cleanup_hook.read().as_ref() {
            hook(pid);
        }
    }
}
