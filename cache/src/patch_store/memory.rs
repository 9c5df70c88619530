//! In-memory patch store.
//!
//! Keyed by block-id, holding an ordered `Vec<Patch>` per block whose
//! mutations have not yet reached the on-disk patch log. Shaped like a
//! keydir-style map: a plain `HashMap` behind no lock of its own, since
//! the cache accesses it only from its single home-thread task graph.

use crate::patch::Patch;
use crate::version::{BlockId, PatchCounter};
use std::collections::HashMap;

#[derive(Default)]
pub struct PatchStore {
    patches: HashMap<BlockId, Vec<Patch>>,
    last_materialized: HashMap<BlockId, PatchCounter>,
}

impl PatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `patch`. Panics (a programmer-error invariant, not a
    /// `Result`) if the patch counter doesn't strictly increase.
    pub fn store_patch(&mut self, patch: Patch) {
        let entry = self.patches.entry(patch.block_id).or_default();
        if let Some(last) = entry.last() {
            debug_assert!(
                patch.counter > last.counter,
                "patch counters must strictly increase per block"
            );
        }
        entry.push(patch);
    }

    /// Discards all patches for `block_id` — used when switching to a
    /// full-block flush, or after the patch log has absorbed them.
    pub fn drop_patches(&mut self, block_id: BlockId) {
        self.patches.remove(&block_id);
    }

    /// Applies every stored patch for `block_id`, in order, into `buf`.
    pub fn apply_patches(&self, block_id: BlockId, buf: &mut [u8]) {
        if let Some(patches) = self.patches.get(&block_id) {
            for patch in patches {
                patch.apply(buf);
            }
        }
    }

    pub fn get_affected_data_size(&self, block_id: BlockId) -> u64 {
        self.patches
            .get(&block_id)
            .map(|ps| ps.iter().map(Patch::affected_data_size).sum())
            .unwrap_or(0)
    }

    pub fn last_patch_materialized_or_zero(&self, block_id: BlockId) -> PatchCounter {
        self.last_materialized.get(&block_id).copied().unwrap_or(0)
    }

    /// The highest patch counter currently stored for `block_id`, or 0.
    /// Patches are pushed in counter order, so the last entry is the max.
    pub fn highest_counter_for_block(&self, block_id: BlockId) -> PatchCounter {
        self.patches.get(&block_id).and_then(|ps| ps.last()).map(|p| p.counter).unwrap_or(0)
    }

    /// Records that `counter` is the highest patch now durable for
    /// `block_id`, without touching any in-memory patches (used after a
    /// full-block flush, which makes every prior patch moot).
    pub fn mark_materialized(&mut self, block_id: BlockId, counter: PatchCounter) {
        let slot = self.last_materialized.entry(block_id).or_insert(0);
        *slot = (*slot).max(counter);
    }

    /// The raw patch list for `block_id`, for writeback's materialization
    /// step (it needs the actual patches, not just whether any exist).
    pub fn patches_for_block(&self, block_id: BlockId) -> Vec<Patch> {
        self.patches.get(&block_id).cloned().unwrap_or_default()
    }

    pub fn has_patches_for_block(&self, block_id: BlockId) -> bool {
        self.patches.get(&block_id).is_some_and(|p| !p.is_empty())
    }

    /// All block-ids with at least one stored patch, for writeback's
    /// dirty-scan.
    pub fn dirty_block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.patches.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::PatchKind;

    fn copy_patch(block_id: BlockId, counter: PatchCounter, offset: u32, byte: u8) -> Patch {
        Patch::new(block_id, counter, PatchKind::Copy { offset, bytes: vec![byte] })
    }

    #[test]
    fn applies_patches_in_order() {
        let mut store = PatchStore::new();
        store.store_patch(copy_patch(1, 1, 0, 0xAA));
        store.store_patch(copy_patch(1, 2, 0, 0xBB));
        let mut buf = vec![0u8; 4];
        store.apply_patches(1, &mut buf);
        assert_eq!(buf[0], 0xBB);
    }

    #[test]
    fn mark_materialized_advances_watermark_without_dropping_patches() {
        let mut store = PatchStore::new();
        store.store_patch(copy_patch(1, 1, 0, 1));
        store.store_patch(copy_patch(1, 2, 0, 2));
        store.store_patch(copy_patch(1, 3, 0, 3));
        store.mark_materialized(1, 2);
        assert_eq!(store.last_patch_materialized_or_zero(1), 2);
        assert_eq!(store.highest_counter_for_block(1), 3);
        assert!(store.has_patches_for_block(1));
    }

    #[test]
    fn drop_patches_clears_block() {
        let mut store = PatchStore::new();
        store.store_patch(copy_patch(1, 1, 0, 1));
        store.drop_patches(1);
        assert!(!store.has_patches_for_block(1));
    }

    #[test]
    #[should_panic(expected = "strictly increase")]
    fn store_patch_rejects_non_monotone_counter() {
        let mut store = PatchStore::new();
        store.store_patch(copy_patch(1, 2, 0, 1));
        store.store_patch(copy_patch(1, 1, 0, 2));
    }
}
