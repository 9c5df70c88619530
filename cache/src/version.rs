//! Version-ids: the cache's own monotone MVCC timestamp.
//!
//! A version is a plain monotone `u64`, assigned per snapshot
//! registration rather than per write transaction.

/// A block identifier. Id zero is reserved for the superblock.
pub type BlockId = u64;

pub const SUPERBLOCK_ID: BlockId = 0;

/// Monotonically increasing version assigned by the cache.
pub type Version = u64;

/// Distinguished "unassigned" version. Versions handed out by the cache
/// start at 1, so 0 can never collide with a real one.
pub const FAUX_VERSION: Version = 0;

/// A 1-based, per-block patch counter.
pub type PatchCounter = u64;

/// The serializer's own transaction id for a block's last flush. `NULL_TXN`
/// marks a block that has never been flushed (freshly allocated), which per
/// a block that's never been durably written may not accept patches.
pub type SerializerTransactionId = u64;

pub const NULL_TXN: SerializerTransactionId = 0;
