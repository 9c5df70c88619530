//! Block-id to inner-buffer lookup.
//!
//! O(1) expected, backed by a `HashMap`. The page map does not own
//! buffers in the Rust sense of "last owner" — inner buffers are
//! `Arc`-shared so handles and the page-replacement array can each hold
//! a reference — but it is the single place a buffer is looked up by
//! block-id, and `remove` is the only way a block-id stops resolving to
//! one, keeping each block-id resident at most once.

use crate::inner_buffer::InnerBuffer;
use crate::version::BlockId;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct PageMap {
    entries: HashMap<BlockId, Arc<InnerBuffer>>,
}

impl PageMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, block_id: BlockId) -> Option<Arc<InnerBuffer>> {
        self.entries.get(&block_id).cloned()
    }

    /// Registers a freshly created buffer. Panics if one is already
    /// resident for this block-id (invariant 1 violation).
    pub fn insert(&mut self, buf: Arc<InnerBuffer>) {
        let prev = self.entries.insert(buf.block_id, buf);
        debug_assert!(prev.is_none(), "page map uniqueness violated");
    }

    pub fn remove(&mut self, block_id: BlockId) -> Option<Arc<InnerBuffer>> {
        self.entries.remove(&block_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &Arc<InnerBuffer>> {
        self.entries.values()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
