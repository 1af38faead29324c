use std::sync::atomic::{AtomicU64, Ordering};

/// Cumulative counters for one queue instance. Not persisted. Read through
/// [`snapshot`](Self::snapshot); only the queue and engine write them.
///
/// ```compile_fail
/// let metrics = offline_sync::QueueMetrics::new();
/// metrics.enqueued.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
/// ```
#[derive(Debug, Default)]
pub struct QueueMetrics {
    pub(crate) enqueued: AtomicU64,
    pub(crate) delivered: AtomicU64,
    pub(crate) rejected: AtomicU64,
    pub(crate) dead_lettered: AtomicU64,
    pub(crate) dead_letters_evicted: AtomicU64,
    pub(crate) unreachable_halts: AtomicU64,
    pub(crate) storage_errors: AtomicU64,

    // Drain bookkeeping
    pub(crate) drains: AtomicU64,
    pub(crate) skipped_drains: AtomicU64,
}

impl QueueMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            dead_letters_evicted: self.dead_letters_evicted.load(Ordering::Relaxed),
            unreachable_halts: self.unreachable_halts.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
            drains: self.drains.load(Ordering::Relaxed),
            skipped_drains: self.skipped_drains.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub enqueued: u64,
    pub delivered: u64,
    pub rejected: u64,
    pub dead_lettered: u64,
    pub dead_letters_evicted: u64,
    pub unreachable_halts: u64,
    pub storage_errors: u64,
    pub drains: u64,
    pub skipped_drains: u64,
}
