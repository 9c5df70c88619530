//! In-memory [`Serializer`] used for tests, benches and `cache-demo`.
//!
//! A `HashMap`-backed store behind a `Mutex`, with no on-disk persistence
//! at all: block-id -> bytes plus the bookkeeping (recency,
//! last-transaction-id, free list, read-ahead listeners) the serializer
//! trait boundary requires.

use super::{BlockWrite, IoAccount, ReadAheadListener, Recency, Serializer};
use crate::error::{CResult, Error};
use crate::version::{BlockId, SerializerTransactionId, SUPERBLOCK_ID};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

struct State {
    blocks: HashMap<BlockId, Vec<u8>>,
    recency: HashMap<BlockId, Recency>,
    txn_ids: HashMap<BlockId, SerializerTransactionId>,
    read_ahead_listeners: Vec<Arc<dyn ReadAheadListener>>,
}

struct Inner {
    block_size: usize,
    next_block_id: AtomicU64,
    next_txn_id: AtomicU64,
    state: Mutex<State>,
}

/// A plain in-memory serializer: no persistence, fixed block size, a
/// monotone block-id free list starting just past the superblock.
/// Cheap to clone — every clone shares the same backing store, so a
/// test can retain a handle (e.g. to call [`Self::offer_read_ahead`])
/// after handing one off to a [`crate::cache::Cache`].
#[derive(Clone)]
pub struct MemSerializer {
    inner: Arc<Inner>,
}

impl MemSerializer {
    pub fn new(block_size: usize) -> Self {
        let mut blocks = HashMap::new();
        blocks.insert(SUPERBLOCK_ID, vec![0u8; block_size]);
        Self {
            inner: Arc::new(Inner {
                block_size,
                next_block_id: AtomicU64::new(SUPERBLOCK_ID + 1),
                next_txn_id: AtomicU64::new(1),
                state: Mutex::new(State {
                    blocks,
                    recency: HashMap::new(),
                    txn_ids: HashMap::new(),
                    read_ahead_listeners: Vec::new(),
                }),
            }),
        }
    }

    /// Test/demo helper: push bytes for `block_id` directly onto disk, as
    /// if a previous cache instance had flushed them, and bump its
    /// transaction id. Used to simulate crash-recovery scenarios.
    pub fn seed_block(&self, block_id: BlockId, data: Vec<u8>) {
        let txn_id = self.inner.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let mut state = self.inner.state.lock().unwrap();
        state.blocks.insert(block_id, data);
        state.txn_ids.insert(block_id, txn_id);
    }

    /// Test/demo helper: offers `block_id`'s current on-disk bytes to
    /// every registered read-ahead listener, as if a background
    /// read-ahead scan had just completed for it.
    pub fn offer_read_ahead(&self, block_id: BlockId, recency: Recency) {
        let (buf, listeners) = {
            let state = self.inner.state.lock().unwrap();
            let Some(buf) = state.blocks.get(&block_id).cloned() else { return };
            (buf, state.read_ahead_listeners.clone())
        };
        for listener in listeners {
            listener.offer_read_ahead_buf(block_id, buf.clone(), recency);
        }
    }
}

impl Serializer for MemSerializer {
    fn block_size(&self) -> usize {
        self.inner.block_size
    }

    async fn read(&self, block_id: BlockId, buf: &mut [u8], _account: &IoAccount) -> CResult<()> {
        let state = self.inner.state.lock().unwrap();
        match state.blocks.get(&block_id) {
            Some(stored) if stored.len() == buf.len() => {
                buf.copy_from_slice(stored);
                Ok(())
            }
            Some(_) => Err(Error::Corruption(format!(
                "block {block_id} has unexpected length on disk"
            ))),
            None => {
                buf.fill(0);
                Ok(())
            }
        }
    }

    async fn write(&self, writes: &[BlockWrite<'_>], _account: &IoAccount) -> CResult<()> {
        let txn_id = self.inner.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let mut state = self.inner.state.lock().unwrap();
        for write in writes {
            match write.data {
                Some(data) => {
                    state.blocks.insert(write.block_id, data.to_vec());
                }
                None => {
                    state.blocks.remove(&write.block_id);
                }
            }
            state.recency.insert(write.block_id, write.recency);
            state.txn_ids.insert(write.block_id, txn_id);
        }
        Ok(())
    }

    fn recency(&self, block_id: BlockId) -> Recency {
        self.inner.state.lock().unwrap().recency.get(&block_id).copied().unwrap_or(Recency::INVALID)
    }

    fn current_transaction_id(&self, block_id: BlockId) -> SerializerTransactionId {
        self.inner.state.lock().unwrap().txn_ids.get(&block_id).copied().unwrap_or(0)
    }

    fn register_read_ahead(&self, listener: Arc<dyn ReadAheadListener>) {
        self.inner.state.lock().unwrap().read_ahead_listeners.push(listener);
    }

    fn unregister_read_ahead(&self, listener: &Arc<dyn ReadAheadListener>) {
        let mut state = self.inner.state.lock().unwrap();
        state.read_ahead_listeners.retain(|l| !Arc::ptr_eq(l, listener));
    }

    fn gen_block_id(&self) -> CResult<BlockId> {
        Ok(self.inner.next_block_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> IoAccount {
        IoAccount { priority: 100, outstanding_limit: 16 }
    }

    #[tokio::test]
    async fn round_trips_a_block() {
        let ser = MemSerializer::new(4096);
        let id = ser.gen_block_id().unwrap();
        let mut data = vec![0u8; 4096];
        data[0] = 0x42;
        ser.write(&[BlockWrite { block_id: id, data: Some(&data), recency: Recency(1) }], &account())
            .await
            .unwrap();

        let mut out = vec![0u8; 4096];
        ser.read(id, &mut out, &account()).await.unwrap();
        assert_eq!(out[0], 0x42);
    }

    #[tokio::test]
    async fn missing_block_reads_as_zero() {
        let ser = MemSerializer::new(16);
        let mut out = vec![0xFFu8; 16];
        ser.read(999, &mut out, &account()).await.unwrap();
        assert_eq!(out, vec![0u8; 16]);
    }

    #[test]
    fn block_ids_are_monotone_and_skip_the_superblock() {
        let ser = MemSerializer::new(16);
        assert_eq!(ser.gen_block_id().unwrap(), SUPERBLOCK_ID + 1);
        assert_eq!(ser.gen_block_id().unwrap(), SUPERBLOCK_ID + 2);
    }
}
