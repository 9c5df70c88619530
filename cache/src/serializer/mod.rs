//! The serializer trait boundary.
//!
//! Persistent block I/O, block allocation, and recency metadata are out
//! of scope for this crate, consumed only through a trait boundary. This
//! module defines exactly that trait, generic over the storage backend
//! rather than hardcoded to one. [`mem::MemSerializer`] is the in-memory
//! reference implementation used by this crate's own tests and by
//! `cache-demo` — it is not a production persistence layer.

pub mod mem;

use crate::error::CResult;
use crate::version::{BlockId, SerializerTransactionId};
use std::sync::Arc;

/// A timestamp used for subtree-recency propagation.
/// Opaque to the cache beyond ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Recency(pub u64);

impl Recency {
    pub const INVALID: Recency = Recency(0);
}

/// An I/O account, as returned by [`Serializer::make_io_account`]. Carries
/// the priority-queue weight the serializer should use for requests
/// submitted under it; opaque otherwise.
#[derive(Debug, Clone, Copy)]
pub struct IoAccount {
    pub priority: u32,
    pub outstanding_limit: usize,
}

/// One entry of a batched write, as passed to [`Serializer::write`].
pub struct BlockWrite<'a> {
    pub block_id: BlockId,
    pub data: Option<&'a [u8]>,
    pub recency: Recency,
}

/// Callback interface a cache registers to accept read-ahead offers from
/// the serializer. The serializer owns the buffer until
/// `offer_read_ahead_buf` returns; the listener must either keep it (by
/// constructing an inner buffer around it) or let it drop.
pub trait ReadAheadListener: Send + Sync {
    fn offer_read_ahead_buf(&self, block_id: BlockId, buf: Vec<u8>, recency: Recency);
}

/// A block-addressable persistent store, consumed by the cache.
///
/// Every method here corresponds 1:1 to an entry in the
/// "Serializer trait (consumed)" list.
pub trait Serializer: Send + Sync {
    fn block_size(&self) -> usize;

    /// Allocates a zeroed buffer of `block_size()` bytes.
    fn malloc(&self) -> Vec<u8> {
        vec![0u8; self.block_size()]
    }

    /// Releases a buffer obtained from `malloc`/`clone_block`/`read`. The
    /// default is a no-op since `Vec<u8>` buffers free themselves; a real
    /// pooling serializer would override this.
    fn free(&self, _buf: Vec<u8>) {}

    fn clone_block(&self, buf: &[u8]) -> Vec<u8> {
        buf.to_vec()
    }

    /// Reads `block_id` into `buf` (which must be `block_size()` bytes).
    async fn read(&self, block_id: BlockId, buf: &mut [u8], account: &IoAccount) -> CResult<()>;

    /// Writes a batch of blocks. A `None` payload with `do_delete` history
    /// upstream indicates "free this block" to the serializer.
    async fn write(&self, writes: &[BlockWrite<'_>], account: &IoAccount) -> CResult<()>;

    fn recency(&self, block_id: BlockId) -> Recency;

    fn current_transaction_id(&self, block_id: BlockId) -> SerializerTransactionId;

    fn make_io_account(&self, priority: u32, outstanding_limit: usize) -> IoAccount {
        IoAccount { priority, outstanding_limit }
    }

    fn register_read_ahead(&self, listener: Arc<dyn ReadAheadListener>);

    fn unregister_read_ahead(&self, listener: &Arc<dyn ReadAheadListener>);

    /// Hands out a fresh block id from the free list.
    fn gen_block_id(&self) -> CResult<BlockId>;
}
