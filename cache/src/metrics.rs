//! Context-passed counters, rather than global statics. A
//! [`Cache`](crate::cache::Cache) holds one `Arc<Metrics>` and every
//! component updates it directly instead of reaching for process-wide
//! singletons.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    pub blocks_in_memory: AtomicU64,
    pub blocks_evicted: AtomicU64,
    pub registered_snapshots: AtomicU64,
    pub registered_snapshot_blocks: AtomicU64,
    pub bufs_acquired: AtomicU64,
    pub bufs_held: AtomicU64,
    pub patch_flushes: AtomicU64,
    pub full_flushes: AtomicU64,
    pub patches_stored: AtomicU64,
    pub patches_size_per_write_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec(counter: &AtomicU64) {
        counter.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            blocks_in_memory: self.blocks_in_memory.load(Ordering::Relaxed),
            blocks_evicted: self.blocks_evicted.load(Ordering::Relaxed),
            registered_snapshots: self.registered_snapshots.load(Ordering::Relaxed),
            registered_snapshot_blocks: self.registered_snapshot_blocks.load(Ordering::Relaxed),
            bufs_acquired: self.bufs_acquired.load(Ordering::Relaxed),
            bufs_held: self.bufs_held.load(Ordering::Relaxed),
            patch_flushes: self.patch_flushes.load(Ordering::Relaxed),
            full_flushes: self.full_flushes.load(Ordering::Relaxed),
            patches_stored: self.patches_stored.load(Ordering::Relaxed),
        }
    }
}

/// Plain-data view of [`Metrics`], convenient for assertions in tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub blocks_in_memory: u64,
    pub blocks_evicted: u64,
    pub registered_snapshots: u64,
    pub registered_snapshot_blocks: u64,
    pub bufs_acquired: u64,
    pub bufs_held: u64,
    pub patch_flushes: u64,
    pub full_flushes: u64,
    pub patches_stored: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let m = Metrics::new();
        assert_eq!(m.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn inc_and_dec_track_live_count() {
        let m = Metrics::new();
        Metrics::inc(&m.blocks_in_memory);
        Metrics::inc(&m.blocks_in_memory);
        Metrics::dec(&m.blocks_in_memory);
        assert_eq!(m.snapshot().blocks_in_memory, 1);
    }
}
