//! Writeback: periodic dirty-buffer flush, patch materialization, and
//! sync coordination.
//!
//! Tracks dirty block-ids and an approximate dirty-byte total rather
//! than holding the buffers themselves — the page map remains the
//! source of truth for buffer data; writeback only decides *when* and
//! *how* (patch-log append vs. full-block write) a dirty block gets
//! persisted.

use crate::config::CacheConfig;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::version::BlockId;

struct WritebackState {
    dirty: HashSet<BlockId>,
    dirty_bytes: u64,
    waiting_txns: usize,
    flush_in_progress: bool,
}

/// Dirty-buffer bookkeeping and throttling. The actual flush pass
/// (reading patches/buffers back out of the page map and writing them
/// through the serializer) is driven by [`crate::cache::Cache::flush_pass`],
/// which has the page map and patch store this type doesn't.
pub struct Writeback {
    state: Mutex<WritebackState>,
    under_budget: Notify,
    flush_done: Notify,
}

impl Default for Writeback {
    fn default() -> Self {
        Self::new()
    }
}

impl Writeback {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WritebackState {
                dirty: HashSet::new(),
                dirty_bytes: 0,
                waiting_txns: 0,
                flush_in_progress: false,
            }),
            under_budget: Notify::new(),
            flush_done: Notify::new(),
        }
    }

    pub fn mark_dirty(&self, block_id: BlockId, size_estimate: u64) {
        let mut state = self.state.lock().unwrap();
        if state.dirty.insert(block_id) {
            state.dirty_bytes += size_estimate;
        }
    }

    pub fn clear_dirty(&self, block_id: BlockId, size_estimate: u64) {
        let mut state = self.state.lock().unwrap();
        if state.dirty.remove(&block_id) {
            state.dirty_bytes = state.dirty_bytes.saturating_sub(size_estimate);
        }
    }

    pub fn dirty_block_ids(&self) -> Vec<BlockId> {
        self.state.lock().unwrap().dirty.iter().copied().collect()
    }

    pub fn dirty_bytes(&self) -> u64 {
        self.state.lock().unwrap().dirty_bytes
    }

    pub fn dirty_count(&self) -> usize {
        self.state.lock().unwrap().dirty.len()
    }

    /// Throttles a new write transaction when the dirty-byte budget has
    /// been exceeded, waking once a flush pass brings it back under.
    /// Once `flush_waiting_threshold` transactions are queued here, the
    /// cache is expected to trigger an eager flush rather than wait for
    /// the periodic timer.
    pub async fn begin_transaction(&self, config: &CacheConfig) -> bool {
        let mut should_trigger_flush = false;
        loop {
            let over_budget = {
                let mut state = self.state.lock().unwrap();
                let over = state.dirty_bytes > config.max_dirty_size;
                if over {
                    state.waiting_txns += 1;
                    if state.waiting_txns >= config.flush_waiting_threshold {
                        should_trigger_flush = true;
                    }
                }
                over
            };
            if !over_budget {
                return should_trigger_flush;
            }
            self.under_budget.notified().await;
            self.state.lock().unwrap().waiting_txns -= 1;
        }
    }

    pub fn flush_in_progress(&self) -> bool {
        self.state.lock().unwrap().flush_in_progress
    }

    pub fn begin_flush(&self) {
        self.state.lock().unwrap().flush_in_progress = true;
    }

    /// Marks the current flush pass complete and wakes every waiter:
    /// throttled write transactions (dirty budget may now be satisfied)
    /// and `sync`/`sync_patiently` callers.
    pub fn end_flush(&self) {
        self.state.lock().unwrap().flush_in_progress = false;
        self.under_budget.notify_waiters();
        self.flush_done.notify_waiters();
    }

    /// Resolves once a flush pass completes. `sync_patiently` callers
    /// await this directly; `sync` callers should also call
    /// [`Self::begin_flush`] first if none is in progress.
    pub async fn wait_for_flush(&self) {
        self.flush_done.notified().await;
    }

    /// True if there is nothing dirty right now — `sync_patiently`
    /// should fire its callback immediately rather than waiting.
    pub fn is_clean(&self) -> bool {
        self.state.lock().unwrap().dirty.is_empty()
    }

    /// `sync_patiently(cb)`: calls `cb` once the next flush pass that
    /// covers everything dirty right now completes, without forcing one
    /// to start. Returns `true` if nothing is dirty, in which case `cb`
    /// runs immediately instead of after a flush.
    pub async fn sync_patiently(&self, cb: impl FnOnce()) -> bool {
        if self.is_clean() {
            cb();
            return true;
        }
        self.wait_for_flush().await;
        cb();
        false
    }

    /// Below 5x the page-replacement target, read-ahead offers may be
    /// accepted; above it, the cache should stop listening for them
    ///
    pub fn can_read_ahead_block_be_accepted(&self, block_id: BlockId, resident: bool) -> bool {
        !resident && !self.state.lock().unwrap().dirty.contains(&block_id)
    }
}

pub(crate) fn read_ahead_pressure_exceeded(resident_count: usize, unload_threshold: u64) -> bool {
    resident_count as u64 > unload_threshold.saturating_mul(5)
}
