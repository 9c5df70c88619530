//! `bcache` is a mirrored buffer cache: the component of a disk-backed
//! key-value store that sits between a higher-level data structure (a
//! B-tree, say) and a block-addressable persistent store. It hands out
//! block-sized buffers under a reader/writer lock, batches logical
//! mutations into a patch log rather than rewriting whole blocks on
//! every write, and gives read-only transactions a consistent MVCC
//! snapshot of the blocks they touch.
//!
//! Persistence, block allocation, and on-disk layout below the block
//! level are out of scope here — the cache consumes them through the
//! [`serializer::Serializer`] trait. [`serializer::mem::MemSerializer`]
//! is the in-memory reference implementation this crate's own tests and
//! `cache-demo` build against.
//!
//! ## Getting started
//!
//! ```rust
//! use bcache::cache::Cache;
//! use bcache::config::CacheConfig;
//! use bcache::lock::LockMode;
//! use bcache::serializer::mem::MemSerializer;
//! use bcache::serializer::Recency;
//! use bcache::transaction::Access;
//!
//! # #[tokio::main]
//! # async fn main() -> bcache::error::CResult<()> {
//! let cache = Cache::create(MemSerializer::new(4096), CacheConfig::default()).await?;
//!
//! let mut txn = cache.begin_transaction(Access::Write, 1, Recency(1)).await;
//! let handle = txn.allocate().await?;
//! let block_id = handle.block_id();
//! handle.set_data(0, b"hello", 5);
//! handle.release().await;
//! txn.commit().await?;
//!
//! let mut read_txn = cache.begin_transaction(Access::Read, 0, Recency(1)).await;
//! let handle = read_txn.acquire(block_id, LockMode::Read, None, true).await?;
//! assert_eq!(&handle.read_data(|d| d.map(|b| b.to_vec())).unwrap()[..5], b"hello");
//! # Ok(())
//! # }
//! ```

pub mod buffer_handle;
pub mod cache;
pub mod config;
pub mod error;
pub mod inner_buffer;
pub mod lock;
pub mod metrics;
pub mod page_map;
pub mod page_replacement;
pub mod patch;
pub mod patch_store;
pub mod scheduler;
pub mod serializer;
pub mod transaction;
pub mod version;
pub mod writeback;

pub use buffer_handle::BufferHandle;
pub use cache::Cache;
pub use config::CacheConfig;
pub use error::{CResult, Error};
pub use transaction::{Access, Transaction, Transactor};
