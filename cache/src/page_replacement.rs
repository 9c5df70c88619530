//! Randomized page-replacement eviction: a dense array of resident
//! buffers, each recording its own index for O(1) swap-remove, and
//! victim selection by sampling a fixed number of random indices rather
//! than tracking recency.

use crate::inner_buffer::InnerBuffer;
use crate::metrics::Metrics;
use crate::page_map::PageMap;
use rand::Rng;
use std::sync::Arc;

/// How many random probes `make_space` takes before giving up on a pass.
const PAGE_REPL_NUM_TRIES: usize = 10;

pub struct PageReplacement {
    array: Vec<Arc<InnerBuffer>>,
    unload_threshold: u64,
}

impl PageReplacement {
    pub fn new(unload_threshold: u64) -> Self {
        Self { array: Vec::new(), unload_threshold }
    }

    pub fn len(&self) -> usize {
        self.array.len()
    }

    pub fn is_empty(&self) -> bool {
        self.array.is_empty()
    }

    /// True once capacity plus `space_needed` more resident buffers
    /// would exceed the unload threshold.
    pub fn is_full(&self, space_needed: u64) -> bool {
        self.array.len() as u64 + space_needed > self.unload_threshold
    }

    /// Registers `buf` as resident, recording its array index.
    pub fn track(&mut self, buf: Arc<InnerBuffer>) {
        let index = self.array.len();
        buf.set_repl_index(Some(index));
        self.array.push(buf);
    }

    fn swap_remove(&mut self, index: usize) -> Arc<InnerBuffer> {
        self.array[index].set_repl_index(None);
        let removed = self.array.swap_remove(index);
        if let Some(moved) = self.array.get(index) {
            moved.set_repl_index(Some(index));
        }
        removed
    }

    /// Untracks `buf` without evicting its data — used when a buffer is
    /// destroyed through a path other than `make_space` (e.g. a
    /// mark-deleted buffer released once `safe_to_unload`).
    pub fn untrack(&mut self, buf: &InnerBuffer) {
        if let Some(index) = buf.repl_index() {
            self.swap_remove(index);
        }
    }

    /// Evicts unpinned clean buffers until resident count falls to
    /// `unload_threshold.saturating_sub(space_needed)`, or until
    /// `PAGE_REPL_NUM_TRIES` consecutive probes find nothing evictable,
    /// whichever comes first — eviction is best-effort. Evicted buffers
    /// are dropped from `page_map` too, and their data freed, so they
    /// stop resolving to a resident block entirely.
    pub fn make_space(&mut self, space_needed: u64, page_map: &mut PageMap, metrics: &Metrics) {
        let target = self.unload_threshold.saturating_sub(space_needed);

        while self.array.len() as u64 > target {
            let victim_index = self.find_evictable_index();
            match victim_index {
                Some(index) => {
                    let victim = self.swap_remove(index);
                    victim.free_data();
                    page_map.remove(victim.block_id);
                    Metrics::inc(&metrics.blocks_evicted);
                    Metrics::dec(&metrics.blocks_in_memory);
                }
                None => {
                    let overshoot_allowance = target / 100 + 10;
                    if self.array.len() as u64 > target + overshoot_allowance {
                        log::warn!(
                            "page replacement exceeding memory target: {} blocks resident, target {}",
                            self.array.len(),
                            target
                        );
                    }
                    break;
                }
            }
        }
    }

    fn find_evictable_index(&self) -> Option<usize> {
        if self.array.is_empty() {
            return None;
        }
        let mut rng = rand::thread_rng();
        for _ in 0..PAGE_REPL_NUM_TRIES {
            let candidate = rng.gen_range(0..self.array.len());
            if self.array[candidate].safe_to_unload() {
                return Some(candidate);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;

    #[test]
    fn is_full_respects_threshold() {
        let repl = PageReplacement::new(4);
        assert!(!repl.is_full(4));
        assert!(repl.is_full(5));
    }

    #[test]
    fn make_space_evicts_unpinned_buffers_down_to_target() {
        let metrics = Metrics::new();
        let mut repl = PageReplacement::new(4);
        let mut page_map = PageMap::new();
        for i in 0..10 {
            let buf = Arc::new(InnerBuffer::allocate(i, 1, 16));
            page_map.insert(Arc::clone(&buf));
            repl.track(buf);
        }
        repl.make_space(0, &mut page_map, &metrics);
        assert!(repl.len() <= 4 + 4 / 100 + 10);
        assert_eq!(page_map.len(), repl.len());
    }

    #[test]
    fn pinned_buffers_are_never_evicted() {
        let metrics = Metrics::new();
        let mut repl = PageReplacement::new(0);
        let mut page_map = PageMap::new();
        let pinned = Arc::new(InnerBuffer::allocate(1, 1, 16));
        pinned.pin();
        page_map.insert(Arc::clone(&pinned));
        repl.track(pinned.clone());
        repl.make_space(0, &mut page_map, &metrics);
        assert_eq!(repl.len(), 1);
        pinned.unpin();
    }
}
