//! The cache container: wires every other component
//! together and owns the snapshot registry and (through the
//! serializer) the free list.

use crate::config::CacheConfig;
use crate::error::CResult;
use crate::metrics::Metrics;
use crate::page_map::PageMap;
use crate::page_replacement::PageReplacement;
use crate::patch_store::disk::DiskPatchLog;
use crate::patch_store::memory::PatchStore;
use crate::scheduler::{Scheduler, TokioScheduler};
use crate::serializer::{BlockWrite, IoAccount, ReadAheadListener, Recency, Serializer};
use crate::transaction::{Access, Transaction, Transactor};
use crate::version::{BlockId, Version, SUPERBLOCK_ID};
use crate::writeback::{read_ahead_pressure_exceeded, Writeback};
use crate::inner_buffer::InnerBuffer;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Version-to-transaction-count registry: which `snapshotted` readers
/// are alive at which version, consulted by `snapshot_if_needed`
/// at which version.
pub(crate) struct SnapshotRegistry {
    active: BTreeMap<Version, usize>,
    next_version: Version,
}

impl SnapshotRegistry {
    fn new() -> Self {
        Self { active: BTreeMap::new(), next_version: 1 }
    }

    fn alloc_version(&mut self) -> Version {
        let v = self.next_version;
        self.next_version += 1;
        v
    }

    fn register(&mut self, version: Version) {
        *self.active.entry(version).or_insert(0) += 1;
    }

    fn unregister(&mut self, version: Version) {
        if let Some(count) = self.active.get_mut(&version) {
            *count -= 1;
            if *count == 0 {
                self.active.remove(&version);
            }
        }
    }

    pub(crate) fn active_versions(&self) -> Vec<Version> {
        self.active.keys().copied().collect()
    }
}

/// State shared by every `Transaction`/`BufferHandle` issued by one
/// `Cache`. Kept behind `Arc` so handles can outlive the `Cache` value
/// that created them without a borrow-checker fight, even though the
/// concurrency model treats all of it as single-home-thread
/// state.
pub(crate) struct CacheShared<S: Serializer> {
    pub(crate) serializer: S,
    pub(crate) config: CacheConfig,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) block_size: usize,
    pub(crate) page_map: Mutex<PageMap>,
    pub(crate) page_replacement: Mutex<PageReplacement>,
    pub(crate) patch_store: Mutex<PatchStore>,
    pub(crate) disk_log: Mutex<Option<DiskPatchLog>>,
    pub(crate) writeback: Writeback,
    pub(crate) snapshots: Mutex<SnapshotRegistry>,
    /// Snapshot entries a write created that must outlive some reader
    /// transaction, keyed by that reader's version — released from
    /// `Transaction::finish_bookkeeping` when that reader commits, since
    /// the reader may never itself touch the affected block.
    pub(crate) pending_snapshot_releases: Mutex<HashMap<Version, Vec<(Arc<InnerBuffer>, Version)>>>,
    pub(crate) live_txn_count: AtomicU64,
    pub(crate) shutting_down: AtomicBool,
    pub(crate) scheduler: Arc<dyn Scheduler>,
}

/// The mirrored buffer cache. Cheap to clone (an `Arc` underneath);
/// clones all refer to the same underlying state.
pub struct Cache<S: Serializer> {
    pub(crate) shared: Arc<CacheShared<S>>,
}

impl<S: Serializer> CacheShared<S> {
    pub(crate) fn register_pending_snapshot_release(&self, reader_version: Version, buf: Arc<InnerBuffer>, snapshotted_version: Version) {
        self.pending_snapshot_releases.lock().unwrap().entry(reader_version).or_default().push((buf, snapshotted_version));
    }

    pub(crate) fn take_pending_snapshot_releases(&self, reader_version: Version) -> Vec<(Arc<InnerBuffer>, Version)> {
        self.pending_snapshot_releases.lock().unwrap().remove(&reader_version).unwrap_or_default()
    }

    pub(crate) fn accepts_read_ahead(&self, block_id: BlockId) -> bool {
        if self.shutting_down.load(Ordering::SeqCst) {
            return false;
        }
        let resident = self.page_map.lock().unwrap().get(block_id).is_some();
        let resident_count = self.page_replacement.lock().unwrap().len();
        let unload_threshold = self.config.unload_threshold_blocks(self.block_size as u64);
        if read_ahead_pressure_exceeded(resident_count, unload_threshold) {
            return false;
        }
        self.writeback.can_read_ahead_block_be_accepted(block_id, resident)
    }
}

/// A `Cache` registers its shared state as the serializer's read-ahead
/// listener: an offer that clears [`Self::accepts_read_ahead`] is
/// adopted as a freshly resident buffer instead of being dropped back
/// to the serializer, so a later `acquire` finds it already loaded.
impl<S: Serializer + 'static> ReadAheadListener for CacheShared<S> {
    fn offer_read_ahead_buf(&self, block_id: BlockId, buf: Vec<u8>, recency: Recency) {
        if !self.accepts_read_ahead(block_id) {
            return;
        }
        let transaction_id = self.serializer.current_transaction_id(block_id);
        let inner = {
            let mut store = self.patch_store.lock().unwrap();
            InnerBuffer::accept_read_ahead(block_id, buf, recency, transaction_id, &mut store)
        };

        let mut page_map = self.page_map.lock().unwrap();
        if page_map.get(block_id).is_some() {
            // Lost a race with a concurrent load of the same block; let
            // that copy stand and drop this offer.
            return;
        }
        let mut page_replacement = self.page_replacement.lock().unwrap();
        if page_replacement.is_full(1) {
            page_replacement.make_space(1, &mut page_map, &self.metrics);
        }
        let arc = Arc::new(inner);
        page_map.insert(Arc::clone(&arc));
        page_replacement.track(arc);
        drop(page_replacement);
        drop(page_map);
        Metrics::inc(&self.metrics.blocks_in_memory);
    }
}

impl<S: Serializer> Clone for Cache<S> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<S: Serializer + 'static> Cache<S> {
    /// Brings up a cache over `serializer`: writes a zeroed superblock
    /// and starts with an empty, purely in-memory patch store. Use
    /// [`Self::create_with_patch_log`] to additionally recover patches
    /// from a prior run's on-disk log.
    pub async fn create(serializer: S, config: CacheConfig) -> CResult<Self> {
        config.validate()?;
        let block_size = serializer.block_size();
        let account = serializer.make_io_account(config.io_priority_writes, 1);
        serializer
            .write(
                &[BlockWrite { block_id: SUPERBLOCK_ID, data: Some(&vec![0u8; block_size]), recency: Recency::INVALID }],
                &account,
            )
            .await?;

        let unload_threshold = config.unload_threshold_blocks(block_size as u64);
        let metrics = Arc::new(Metrics::new());
        let cache = Self {
            shared: Arc::new(CacheShared {
                serializer,
                config,
                metrics,
                block_size,
                page_map: Mutex::new(PageMap::new()),
                page_replacement: Mutex::new(PageReplacement::new(unload_threshold)),
                patch_store: Mutex::new(PatchStore::new()),
                disk_log: Mutex::new(None),
                writeback: Writeback::new(),
                snapshots: Mutex::new(SnapshotRegistry::new()),
                pending_snapshot_releases: Mutex::new(HashMap::new()),
                live_txn_count: AtomicU64::new(0),
                shutting_down: AtomicBool::new(false),
                scheduler: Arc::new(TokioScheduler),
            }),
        };
        let listener: Arc<dyn ReadAheadListener> = Arc::clone(&cache.shared);
        cache.shared.serializer.register_read_ahead(listener);
        Ok(cache)
    }

    /// Same as [`Self::create`], but also opens (or creates) an
    /// append-only patch log at `log_path` and replays it into the
    /// in-memory patch store before returning — the crash-recovery path
    /// crash-recovery path.
    pub async fn create_with_patch_log(serializer: S, config: CacheConfig, log_path: PathBuf) -> CResult<Self> {
        let cache = Self::create(serializer, config).await?;
        let mut log = DiskPatchLog::open(log_path)?;
        let recovered = log.load_patches()?;
        *cache.shared.patch_store.lock().unwrap() = recovered;
        *cache.shared.disk_log.lock().unwrap() = Some(log);
        Ok(cache)
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.shared.metrics)
    }

    pub fn create_account(&self, priority: u32) -> IoAccount {
        self.shared.serializer.make_io_account(priority, self.shared.config.max_concurrent_flushes)
    }

    /// Begins a new transaction, suspending first if writeback's dirty
    /// budget is currently exceeded.
    pub async fn begin_transaction(&self, access: Access, expected_change_count: u64, recency: Recency) -> Transaction<S> {
        self.shared.live_txn_count.fetch_add(1, Ordering::SeqCst);
        let should_flush = self.shared.writeback.begin_transaction(&self.shared.config).await;
        if should_flush && !self.shared.writeback.flush_in_progress() {
            let shared = Arc::clone(&self.shared);
            self.shared.scheduler.spawn_detached(Box::pin(async move {
                let _ = flush_pass(&shared).await;
            }));
        }
        Transaction::new(Arc::clone(&self.shared), access, expected_change_count, recency)
    }

    pub(crate) fn alloc_snapshot_version(&self) -> Version {
        self.shared.snapshots.lock().unwrap().alloc_version()
    }

    /// Begins a write transaction wrapped in a [`Transactor`], which
    /// commits on drop instead of requiring an explicit `commit()` call.
    pub async fn begin_scoped(&self, expected_change_count: u64, recency: Recency) -> Transactor<S> {
        let txn = self.begin_transaction(Access::Write, expected_change_count, recency).await;
        Transactor::new(txn)
    }

    /// Runs one writeback flush pass immediately.
    pub async fn flush_pass(&self) -> CResult<()> {
        flush_pass(&self.shared).await
    }

    /// Waits until every block dirty as of this call has been flushed,
    /// forcing a flush pass to start if none is already running. Plain
    /// wrapper over [`Self::sync`] for callers with nothing to run on
    /// completion.
    /// `sync(cb)`: forces a flush pass to start if none is already in
    /// progress, then calls `cb` once a flush covering everything dirty
    /// as of this call has completed. Returns `true` if nothing was
    /// dirty, in which case `cb` already ran before this returned.
    pub async fn sync(&self, cb: impl FnOnce()) -> CResult<bool> {
        if self.shared.writeback.is_clean() {
            cb();
            return Ok(true);
        }
        if !self.shared.writeback.flush_in_progress() {
            self.flush_pass().await?;
            cb();
            return Ok(false);
        }
        self.shared.writeback.wait_for_flush().await;
        cb();
        Ok(false)
    }

    /// `sync_patiently(cb)`: calls `cb` once the next flush that covers
    /// everything dirty right now completes, without forcing one to
    /// start. Returns `true` if nothing is dirty, in which case `cb`
    /// already ran before this returned.
    pub async fn sync_patiently(&self, cb: impl FnOnce()) -> bool {
        self.shared.writeback.sync_patiently(cb).await
    }

    /// Graceful shutdown: stop accepting read-ahead,
    /// drain in-flight transactions, flush once more, then free every
    /// resident buffer. Consumes the last handle to this cache's shared
    /// state if it's the only one outstanding.
    pub async fn shutdown(self) -> CResult<()> {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        while self.shared.live_txn_count.load(Ordering::SeqCst) > 0 {
            self.shared.scheduler.yield_now().await;
        }
        self.shared.serializer.unregister_read_ahead(&(Arc::clone(&self.shared) as Arc<dyn ReadAheadListener>));
        self.flush_pass().await?;
        let mut page_map = self.shared.page_map.lock().unwrap();
        let mut page_replacement = self.shared.page_replacement.lock().unwrap();
        for buf in page_map.values() {
            page_replacement.untrack(buf);
        }
        page_map.clear();
        Ok(())
    }
}

/// A flush pass: for every dirty block, either
/// materialize its accumulated patches into the on-disk log, or write
/// the full block, based on whether it's marked `needs_flush` or has
/// exceeded its per-block patch budget.
pub(crate) async fn flush_pass<S: Serializer>(shared: &Arc<CacheShared<S>>) -> CResult<()> {
    shared.writeback.begin_flush();

    let dirty_ids = shared.writeback.dirty_block_ids();
    let account = shared.serializer.make_io_account(shared.config.io_priority_writes, shared.config.max_concurrent_flushes);
    let budget = shared.config.max_patch_budget_bytes(shared.block_size as u64);

    for block_id in dirty_ids {
        let Some(buf) = shared.page_map.lock().unwrap().get(block_id) else { continue };

        let force_full = buf.do_delete() || buf.needs_flush() || {
            let store = shared.patch_store.lock().unwrap();
            store.get_affected_data_size(block_id) > budget
        };

        if force_full {
            let owned_data: Option<Vec<u8>> = if buf.do_delete() {
                buf.write_empty_deleted_block().then(|| vec![0u8; shared.block_size])
            } else {
                buf.clone_data()
            };
            shared.serializer.write(&[BlockWrite { block_id, data: owned_data.as_deref(), recency: Recency::INVALID }], &account).await?;
            buf.set_transaction_id(shared.serializer.current_transaction_id(block_id));
            shared.patch_store.lock().unwrap().drop_patches(block_id);
            if let Some(mut log) = shared.disk_log.lock().unwrap().take() {
                let result = log.append_reset(block_id);
                *shared.disk_log.lock().unwrap() = Some(log);
                result?;
            }
            Metrics::inc(&shared.metrics.full_flushes);
        } else {
            let pending = shared.patch_store.lock().unwrap().patches_for_block(block_id);
            if !pending.is_empty() {
                if let Some(mut log) = shared.disk_log.lock().unwrap().take() {
                    let result = log.append(&pending);
                    *shared.disk_log.lock().unwrap() = Some(log);
                    result?;
                }
                let highest = pending.iter().map(|p| p.counter).max().unwrap_or(0);
                let mut store = shared.patch_store.lock().unwrap();
                store.mark_materialized(block_id, highest);
                store.drop_patches(block_id);
                Metrics::inc(&shared.metrics.patch_flushes);
            }
        }

        buf.clear_dirty();
        shared.writeback.clear_dirty(block_id, shared.block_size as u64);
    }

    shared.writeback.end_flush();
    Ok(())
}
