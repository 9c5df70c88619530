//! Transaction: the unit of access a caller holds across a sequence of
//! block acquisitions.

use crate::buffer_handle::BufferHandle;
use crate::cache::{flush_pass, CacheShared};
use crate::error::CResult;
use crate::inner_buffer::InnerBuffer;
use crate::lock::LockMode;
use crate::metrics::Metrics;
use crate::serializer::{Recency, Serializer};
use crate::version::{BlockId, Version, FAUX_VERSION};
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    ReadSync,
    Write,
}

pub struct Transaction<S: Serializer> {
    pub(crate) shared: Arc<CacheShared<S>>,
    access: Access,
    snapshot_version: Version,
    snapshotted: bool,
    wants_snapshot: bool,
    version_assigned: bool,
    recency_timestamp: Recency,
    #[allow(dead_code)]
    expected_change_count: u64,
    finished: bool,
}

impl<S: Serializer> Transaction<S> {
    pub(crate) fn new(
        shared: Arc<CacheShared<S>>,
        access: Access,
        expected_change_count: u64,
        recency: Recency,
    ) -> Self {
        Self {
            shared,
            access,
            snapshot_version: FAUX_VERSION,
            snapshotted: false,
            wants_snapshot: false,
            version_assigned: false,
            recency_timestamp: recency,
            expected_change_count,
            finished: false,
        }
    }

    pub fn access(&self) -> Access {
        self.access
    }

    /// Opts a read-only transaction into MVCC snapshot isolation. Must
    /// be called before the first `acquire`.
    pub fn snapshot(&mut self) {
        assert!(
            matches!(self.access, Access::Read | Access::ReadSync),
            "snapshot() is only valid on read-only transactions"
        );
        assert!(!self.version_assigned, "snapshot() must precede the first acquire");
        self.wants_snapshot = true;
    }

    fn ensure_version_assigned(&mut self) {
        if self.version_assigned {
            return;
        }
        self.snapshot_version = {
            let mut snapshots = self.shared.snapshots.lock().unwrap();
            let v = snapshots.alloc_version();
            if self.wants_snapshot {
                snapshots.register(v);
                self.snapshotted = true;
                Metrics::inc(&self.shared.metrics.registered_snapshots);
            }
            v
        };
        self.version_assigned = true;
    }

    /// Acquires `block_id` in `mode`, loading it from the serializer if
    /// not already resident. `on_in_line`, if given, runs once this
    /// request reaches the head of the block's wait queue, before the
    /// lock itself is granted — lets a caller pipeline follow-up work
    /// against a block it's about to hold rather than waiting for the
    /// full round trip. `should_load == false` is only meaningful for
    /// write transactions that intend to fully overwrite the block.
    pub async fn acquire(
        &mut self,
        block_id: BlockId,
        mode: LockMode,
        on_in_line: Option<Box<dyn FnOnce() + Send>>,
        should_load: bool,
    ) -> CResult<BufferHandle<S>> {
        self.ensure_version_assigned();

        let existing = self.shared.page_map.lock().unwrap().get(block_id);
        let buf = match existing {
            Some(buf) => {
                if buf.data_len().is_none() && should_load {
                    self.load_into(&buf).await?;
                }
                buf
            }
            None => {
                let buf = if should_load || self.access != Access::Write {
                    let account = self.shared.serializer.make_io_account(self.shared.config.io_priority_reads, 1);
                    let mut store = self.shared.patch_store.lock().unwrap();
                    InnerBuffer::load(block_id, &self.shared.serializer, &account, &mut store).await?
                } else {
                    InnerBuffer::new_unloaded(block_id, self.snapshot_version)
                };
                let arc = Arc::new(buf);
                {
                    let mut page_map = self.shared.page_map.lock().unwrap();
                    let mut page_replacement = self.shared.page_replacement.lock().unwrap();
                    if page_replacement.is_full(1) {
                        page_replacement.make_space(1, &mut page_map, &self.shared.metrics);
                    }
                    page_map.insert(Arc::clone(&arc));
                    page_replacement.track(Arc::clone(&arc));
                }
                Metrics::inc(&self.shared.metrics.blocks_in_memory);
                arc
            }
        };

        Metrics::inc(&self.shared.metrics.bufs_acquired);
        Ok(BufferHandle::acquire(
            Arc::clone(&self.shared),
            buf,
            mode,
            self.snapshot_version,
            self.snapshotted,
            self.recency_timestamp,
            on_in_line,
        )
        .await)
    }

    async fn load_into(&self, buf: &Arc<InnerBuffer>) -> CResult<()> {
        let account = self.shared.serializer.make_io_account(self.shared.config.io_priority_reads, 1);
        let mut data = self.shared.serializer.malloc();
        let guard = buf.acquire_lock(LockMode::Write).await;
        self.shared.serializer.read(buf.block_id, &mut data, &account).await?;
        buf.set_data(data);
        drop(guard);
        let store = self.shared.patch_store.lock().unwrap();
        buf.replay_patches(&store);
        Ok(())
    }

    /// Allocates a brand-new block (write transactions only): a fresh
    /// block-id from the free list, zeroed data.
    pub async fn allocate(&mut self) -> CResult<BufferHandle<S>> {
        assert_eq!(self.access, Access::Write, "allocate() is write-transaction only");
        self.ensure_version_assigned();

        let block_id = self.shared.serializer.gen_block_id()?;
        let buf = Arc::new(InnerBuffer::allocate(block_id, self.snapshot_version, self.shared.block_size));
        {
            let mut page_map = self.shared.page_map.lock().unwrap();
            let mut page_replacement = self.shared.page_replacement.lock().unwrap();
            if page_replacement.is_full(1) {
                page_replacement.make_space(1, &mut page_map, &self.shared.metrics);
            }
            page_map.insert(Arc::clone(&buf));
            page_replacement.track(Arc::clone(&buf));
        }
        Metrics::inc(&self.shared.metrics.blocks_in_memory);
        Metrics::inc(&self.shared.metrics.bufs_acquired);

        Ok(BufferHandle::acquire(
            Arc::clone(&self.shared),
            buf,
            LockMode::Write,
            self.snapshot_version,
            false,
            self.recency_timestamp,
            None,
        )
        .await)
    }

    /// Explicit commit: unregisters this transaction's snapshot (if any),
    /// releases retained snapshot copies, and — for write transactions in
    /// `wait_for_flush` mode — waits for a flush pass that covers every
    /// block dirty as of this call before returning.
    ///
    /// Async commit logic cannot run inside `Drop`, so callers that care
    /// about durability must call this explicitly; `Drop` only performs
    /// the synchronous bookkeeping as a safety net.
    pub async fn commit(mut self) -> CResult<()> {
        self.finish_bookkeeping();
        if self.access == Access::Write && self.shared.config.wait_for_flush && !self.shared.writeback.is_clean() {
            if self.shared.writeback.flush_in_progress() {
                self.shared.writeback.wait_for_flush().await;
            } else {
                flush_pass(&self.shared).await?;
            }
        }
        Ok(())
    }

    fn finish_bookkeeping(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if self.snapshotted {
            self.shared.snapshots.lock().unwrap().unregister(self.snapshot_version);
            for (buf, version) in self.shared.take_pending_snapshot_releases(self.snapshot_version) {
                buf.release_snapshot(version);
            }
        }
        self.shared.live_txn_count.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<S: Serializer> Drop for Transaction<S> {
    fn drop(&mut self) {
        if !self.finished && self.access == Access::Write && self.shared.config.wait_for_flush {
            log::warn!("write transaction dropped without an explicit commit(); durable sync was not awaited");
        }
        self.finish_bookkeeping();
    }
}

/// Scoped RAII wrapper over a write transaction: begins on construction,
/// commits on drop. Since commit's durable-sync wait is async and `Drop`
/// cannot await, the commit is spawned onto the runtime rather than run
/// in-line; callers that need to observe the sync's completion should
/// call [`Transaction::commit`] directly instead of using this wrapper.
pub struct Transactor<S: Serializer> {
    txn: Option<Transaction<S>>,
}

impl<S: Serializer + 'static> Transactor<S> {
    pub fn new(txn: Transaction<S>) -> Self {
        Self { txn: Some(txn) }
    }

    pub fn get_mut(&mut self) -> &mut Transaction<S> {
        self.txn.as_mut().expect("Transactor used after its transaction was taken")
    }
}

impl<S: Serializer + 'static> Drop for Transactor<S> {
    fn drop(&mut self) {
        if let Some(txn) = self.txn.take() {
            let scheduler = Arc::clone(&txn.shared.scheduler);
            scheduler.spawn_detached(Box::pin(async move {
                if let Err(err) = txn.commit().await {
                    log::error!("scoped transaction commit failed: {err}");
                }
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::config::CacheConfig;
    use crate::serializer::mem::MemSerializer;

    async fn test_cache() -> Cache<MemSerializer> {
        Cache::create(MemSerializer::new(16), CacheConfig::default()).await.unwrap()
    }

    #[tokio::test]
    async fn allocate_then_commit_round_trips() {
        let cache = test_cache().await;
        let mut txn = cache.begin_transaction(Access::Write, 1, Recency(1)).await;
        let handle = txn.allocate().await.unwrap();
        let block_id = handle.block_id();
        handle.release().await;
        txn.commit().await.unwrap();

        let mut read_txn = cache.begin_transaction(Access::Read, 0, Recency(1)).await;
        let handle = read_txn.acquire(block_id, LockMode::Read, None, true).await.unwrap();
        assert!(handle.read_data(|d| d.map(|b| b.to_vec())).is_some());
    }

    #[tokio::test]
    async fn snapshot_before_first_acquire_is_required() {
        let cache = test_cache().await;
        let mut txn = cache.begin_transaction(Access::Read, 0, Recency(1)).await;
        txn.snapshot();
        let _ = txn.acquire(0, LockMode::Read, None, true).await;
    }

    #[tokio::test]
    async fn on_in_line_hook_fires_during_acquire() {
        let cache = test_cache().await;
        let mut txn = cache.begin_transaction(Access::Write, 1, Recency(1)).await;
        let handle = txn.allocate().await.unwrap();
        let block_id = handle.block_id();
        handle.release().await;
        txn.commit().await.unwrap();

        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired2 = Arc::clone(&fired);
        let mut read_txn = cache.begin_transaction(Access::Read, 0, Recency(1)).await;
        let handle = read_txn
            .acquire(block_id, LockMode::Read, Some(Box::new(move || fired2.store(true, Ordering::SeqCst))), true)
            .await
            .unwrap();
        handle.release().await;
        assert!(fired.load(Ordering::SeqCst));
    }
}
