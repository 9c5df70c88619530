//! The cache's record for one resident block.
//!
//! Arena-owned by the cache (Design Note "Ownership of inner buffers and
//! handles"): addressed by block-id through the page map, never shared
//! by strong reference outside it. Buffer handles hold only a
//! non-owning `&InnerBuffer` plus a pin. Mutable bookkeeping lives
//! behind one `std::sync::Mutex` per buffer — the cache's state
//! conceptually lives on a single home thread, but a
//! `Mutex` here costs nothing under no contention and keeps the type
//! `Send + Sync` for the async runtime driving it.

use crate::error::CResult;
use crate::patch_store::memory::PatchStore;
use crate::lock::{BlockLock, LockMode};
use crate::serializer::{IoAccount, Recency, Serializer};
use crate::version::{BlockId, PatchCounter, SerializerTransactionId, Version, FAUX_VERSION, NULL_TXN};
use std::sync::Arc;

/// A retained copy of a block's data at a past version, held open for
/// snapshotting readers.
pub struct SnapshotEntry {
    pub snapshotted_version: Version,
    pub data: Vec<u8>,
    pub refcount: u64,
}

/// Result of a write actually taking a snapshot: which readers the new
/// entry must outlive, so the caller can arrange for each to release it.
pub struct SnapshotTaken {
    pub old_version: Version,
    pub overlapping_versions: Vec<Version>,
}

pub(crate) struct InnerState {
    pub data: Option<Vec<u8>>,
    pub version_id: Version,
    pub transaction_id: SerializerTransactionId,
    pub subtree_recency: Recency,
    pub refcount: u64,
    pub cow_refcount: u64,
    pub do_delete: bool,
    pub write_empty_deleted_block: bool,
    pub next_patch_counter: PatchCounter,
    pub last_patch_materialized: PatchCounter,
    pub snapshots: Vec<SnapshotEntry>,
    pub dirty: bool,
    pub needs_flush: bool,
    pub recency_dirty: bool,
    /// Index into the page-replacement engine's dense array, kept in
    /// sync by that module via swap-remove.
    pub repl_index: Option<usize>,
}

pub struct InnerBuffer {
    pub block_id: BlockId,
    pub lock: BlockLock,
    pub(crate) state: std::sync::Mutex<InnerState>,
}

#[cfg(debug_assertions)]
const ALLOC_POISON: u8 = 0xCD;
#[cfg(debug_assertions)]
const FREE_POISON: u8 = 0xDD;

impl InnerBuffer {
    /// Fresh allocation: a new block-id from the free list, zeroed (or
    /// poisoned in debug builds) data, stamped with the caller's version.
    pub fn allocate(block_id: BlockId, version: Version, block_size: usize) -> Self {
        let mut data = vec![0u8; block_size];
        #[cfg(debug_assertions)]
        data.fill(ALLOC_POISON);
        Self::new(block_id, Some(data), version, NULL_TXN, Recency::INVALID)
    }

    /// Registers a block-id with no data loaded yet — the write-without-load
    /// path of `acquire`, for when the caller intends to fully
    /// overwrite the block anyway.
    pub fn new_unloaded(block_id: BlockId, version: Version) -> Self {
        Self::new(block_id, None, version, NULL_TXN, Recency::INVALID)
    }

    /// Loads `block_id` from the serializer under a write lock, then
    /// replays any outstanding patches into the freshly read data.
    pub async fn load(
        block_id: BlockId,
        serializer: &(impl Serializer + ?Sized),
        account: &IoAccount,
        patch_store: &mut PatchStore,
    ) -> CResult<Self> {
        let mut data = serializer.malloc();
        let buf = Self::new(block_id, None, FAUX_VERSION, NULL_TXN, Recency::INVALID);
        let guard = buf.lock.acquire(crate::lock::LockMode::Write).await;
        serializer.read(block_id, &mut data, account).await?;
        {
            let mut state = buf.state.lock().unwrap();
            state.data = Some(data);
            state.transaction_id = serializer.current_transaction_id(block_id);
            state.subtree_recency = serializer.recency(block_id);
        }
        drop(guard);
        buf.replay_patches(patch_store);
        Ok(buf)
    }

    /// Accepts a buffer the serializer offered via read-ahead, without
    /// issuing a read of its own, then still replays outstanding patches.
    pub fn accept_read_ahead(
        block_id: BlockId,
        data: Vec<u8>,
        recency: Recency,
        transaction_id: SerializerTransactionId,
        patch_store: &mut PatchStore,
    ) -> Self {
        let buf = Self::new(block_id, Some(data), FAUX_VERSION, transaction_id, recency);
        buf.apply_outstanding_patches(patch_store);
        buf
    }

    fn new(
        block_id: BlockId,
        data: Option<Vec<u8>>,
        version: Version,
        transaction_id: SerializerTransactionId,
        recency: Recency,
    ) -> Self {
        Self {
            block_id,
            lock: BlockLock::new(),
            state: std::sync::Mutex::new(InnerState {
                data,
                version_id: version,
                transaction_id,
                subtree_recency: recency,
                refcount: 0,
                cow_refcount: 0,
                do_delete: false,
                write_empty_deleted_block: false,
                next_patch_counter: 1,
                last_patch_materialized: 0,
                snapshots: Vec::new(),
                dirty: false,
                needs_flush: false,
                recency_dirty: false,
                repl_index: None,
            }),
        }
    }

    /// Eviction requires the lock be free, the
    /// buffer clean, no outstanding pins, and no retained snapshots.
    pub fn safe_to_unload(&self) -> bool {
        let state = self.state.lock().unwrap();
        !self.lock.is_held() && !state.dirty && state.refcount == 0 && state.cow_refcount == 0
            && state.snapshots.is_empty()
    }

    pub fn pin(&self) {
        self.state.lock().unwrap().refcount += 1;
    }

    pub fn unpin(&self) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.refcount > 0);
        state.refcount -= 1;
    }

    pub fn pin_cow(&self) {
        self.state.lock().unwrap().cow_refcount += 1;
    }

    pub fn unpin_cow(&self) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.cow_refcount > 0);
        state.cow_refcount -= 1;
    }

    pub fn version_id(&self) -> Version {
        self.state.lock().unwrap().version_id
    }

    pub fn transaction_id(&self) -> SerializerTransactionId {
        self.state.lock().unwrap().transaction_id
    }

    /// Records the serializer's transaction id for this block's most
    /// recent full flush, so a never-flushed block (`NULL_TXN`) starts
    /// accepting patches once it has a base version to patch against.
    pub fn set_transaction_id(&self, id: SerializerTransactionId) {
        self.state.lock().unwrap().transaction_id = id;
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().unwrap().dirty
    }

    pub fn mark_dirty(&self) {
        self.state.lock().unwrap().dirty = true;
    }

    /// Called once a flush pass has handled this block, whichever form
    /// it took. Clears `needs_flush` too: that flag only forces the
    /// *next pending* flush to take the full-block form, and this
    /// block's pending write has just been satisfied.
    pub fn clear_dirty(&self) {
        let mut state = self.state.lock().unwrap();
        state.dirty = false;
        state.needs_flush = false;
    }

    pub fn needs_flush(&self) -> bool {
        self.state.lock().unwrap().needs_flush
    }

    pub fn set_needs_flush(&self) {
        self.state.lock().unwrap().needs_flush = true;
    }

    pub fn do_delete(&self) -> bool {
        self.state.lock().unwrap().do_delete
    }

    pub fn write_empty_deleted_block(&self) -> bool {
        self.state.lock().unwrap().write_empty_deleted_block
    }

    pub fn data_len(&self) -> Option<usize> {
        self.state.lock().unwrap().data.as_ref().map(Vec::len)
    }

    /// Copies the live data out, for callers that need an owned buffer
    /// (buffer-handle's live path clones before mutating).
    pub fn clone_data(&self) -> Option<Vec<u8>> {
        self.state.lock().unwrap().data.clone()
    }

    pub fn read_data<T>(&self, f: impl FnOnce(Option<&[u8]>) -> T) -> T {
        let state = self.state.lock().unwrap();
        f(state.data.as_deref())
    }

    pub fn set_data(&self, data: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        state.data = Some(data);
    }

    /// Mutates the live buffer in place. Used by the full-flush-forced
    /// write path, which bypasses the patch log entirely.
    pub fn with_data_mut(&self, f: impl FnOnce(&mut [u8])) {
        let mut state = self.state.lock().unwrap();
        if let Some(data) = state.data.as_mut() {
            f(data);
        }
    }

    pub fn next_patch_counter(&self) -> PatchCounter {
        self.state.lock().unwrap().next_patch_counter
    }

    pub fn advance_patch_counter(&self) -> PatchCounter {
        let mut state = self.state.lock().unwrap();
        let counter = state.next_patch_counter;
        state.next_patch_counter += 1;
        counter
    }

    pub fn last_patch_materialized(&self) -> PatchCounter {
        self.state.lock().unwrap().last_patch_materialized
    }

    pub fn repl_index(&self) -> Option<usize> {
        self.state.lock().unwrap().repl_index
    }

    pub fn set_repl_index(&self, idx: Option<usize>) {
        self.state.lock().unwrap().repl_index = idx;
    }

    /// Free the data buffer (used on eviction and on `mark_deleted`'s
    /// un-snapshotted path). Poisons in debug builds first.
    pub fn free_data(&self) {
        let mut state = self.state.lock().unwrap();
        #[cfg(debug_assertions)]
        if let Some(data) = state.data.as_mut() {
            data.fill(FREE_POISON);
        }
        state.data = None;
    }

    pub fn mark_deleted(&self, write_null: bool) {
        let mut state = self.state.lock().unwrap();
        state.do_delete = true;
        state.write_empty_deleted_block = write_null;
    }

    pub fn touch_recency(&self, recency: Recency) {
        let mut state = self.state.lock().unwrap();
        state.subtree_recency = recency;
        state.recency_dirty = true;
    }

    /// Counts active snapshotting transactions whose version falls in
    /// `[self.version_id, new_version)`; if any exist (or a pending
    /// `read-outdated-ok` pin does), retains the current data as a
    /// snapshot entry and bumps `version_id`. Returns the prior version
    /// and the list of reader versions the new entry must outlive, so
    /// the caller can arrange for each of those readers to release it
    /// on commit — or `None` if no snapshot was needed.
    pub fn snapshot_if_needed(&self, new_version: Version, active_snapshot_versions: &[Version]) -> Option<SnapshotTaken> {
        let mut state = self.state.lock().unwrap();
        let old_version = state.version_id;
        let overlapping: Vec<Version> =
            active_snapshot_versions.iter().copied().filter(|v| *v >= old_version && *v < new_version).collect();

        if overlapping.is_empty() && state.cow_refcount == 0 {
            state.version_id = new_version;
            return None;
        }

        let data = state.data.clone().unwrap_or_default();
        state.snapshots.push(SnapshotEntry {
            snapshotted_version: old_version,
            data,
            refcount: overlapping.len().max(1) as u64,
        });
        state.cow_refcount = 0;
        state.version_id = new_version;
        Some(SnapshotTaken { old_version, overlapping_versions: overlapping })
    }

    /// The newest retained snapshot with `snapshotted_version <=
    /// version_to_access`, if any, paired with the entry's own version
    /// (needed to release the right entry later) (buffer-handle's
    /// snapshot read path).
    pub fn snapshot_for_version(&self, version_to_access: Version) -> Option<(Version, Vec<u8>)> {
        let state = self.state.lock().unwrap();
        state
            .snapshots
            .iter()
            .rev()
            .find(|s| s.snapshotted_version <= version_to_access)
            .map(|s| (s.snapshotted_version, s.data.clone()))
    }

    /// Releases one reference to the snapshot entry at `snapshotted_version`;
    /// once its refcount reaches zero the entry is dropped.
    pub fn release_snapshot(&self, snapshotted_version: Version) {
        let mut state = self.state.lock().unwrap();
        if let Some(pos) = state.snapshots.iter().position(|s| s.snapshotted_version == snapshotted_version) {
            state.snapshots[pos].refcount -= 1;
            if state.snapshots[pos].refcount == 0 {
                state.snapshots.remove(pos);
            }
        }
    }

    fn apply_outstanding_patches(&self, patch_store: &PatchStore) {
        let mut state = self.state.lock().unwrap();
        if let Some(data) = state.data.as_mut() {
            patch_store.apply_patches(self.block_id, data);
        }
        let materialized = patch_store.last_patch_materialized_or_zero(self.block_id);
        let highest_stored = patch_store.highest_counter_for_block(self.block_id);
        state.last_patch_materialized = materialized;
        state.next_patch_counter = materialized.max(highest_stored) + 1;
    }

    /// Applies whatever patches `patch_store` still holds for this block
    /// on top of the data just read from the serializer. The store itself
    /// is responsible for only holding patches not yet reflected in that
    /// base data — a full flush resets the block's on-disk log entries,
    /// so anything remaining here genuinely postdates it.
    pub fn replay_patches(&self, patch_store: &PatchStore) {
        self.apply_outstanding_patches(patch_store);
    }

    /// Acquires this buffer's block-lock in `mode`, returning an owned
    /// guard tied to an `Arc` clone rather than a borrow — needed since
    /// buffer handles hold inner buffers by `Arc`, not by reference.
    pub async fn acquire_lock(self: &Arc<Self>, mode: LockMode) -> BufferLockGuard {
        let mode = self.lock.acquire_owned(mode).await;
        BufferLockGuard { buf: Arc::clone(self), mode, released: false }
    }

    /// Same as [`Self::acquire_lock`], but also resolves `on_in_line`
    /// once this request reaches the head of the wait queue, before the
    /// grant itself lands — lets a caller pipeline follow-up work (e.g.
    /// kicking off a read) against a block it's about to hold.
    pub async fn acquire_lock_with_in_line_hook(
        self: &Arc<Self>,
        mode: LockMode,
        on_in_line: impl FnOnce(),
    ) -> BufferLockGuard {
        let mode = self.lock.acquire_owned_with_in_line_hook(mode, on_in_line).await;
        BufferLockGuard { buf: Arc::clone(self), mode, released: false }
    }
}

/// An owned lock guard over an `Arc<InnerBuffer>`. Releases on drop.
pub struct BufferLockGuard {
    buf: Arc<InnerBuffer>,
    mode: LockMode,
    released: bool,
}

impl BufferLockGuard {
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for BufferLockGuard {
    fn drop(&mut self) {
        if !self.released {
            self.buf.lock.release(self.mode);
            self.released = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::mem::MemSerializer;

    #[test]
    fn fresh_allocation_is_safe_to_unload_until_pinned() {
        let buf = InnerBuffer::allocate(1, 1, 16);
        assert!(buf.safe_to_unload());
        buf.pin();
        assert!(!buf.safe_to_unload());
        buf.unpin();
        assert!(buf.safe_to_unload());
    }

    #[test]
    fn snapshot_if_needed_retains_old_data_for_active_readers() {
        let buf = InnerBuffer::allocate(1, 1, 4);
        buf.set_data(vec![1, 2, 3, 4]);
        let took = buf.snapshot_if_needed(2, &[1]);
        assert_eq!(took.unwrap().overlapping_versions, vec![1]);
        assert_eq!(buf.snapshot_for_version(1), Some((1, vec![1, 2, 3, 4])));
        assert_eq!(buf.version_id(), 2);
    }

    #[test]
    fn snapshot_if_needed_skips_when_no_readers_overlap() {
        let buf = InnerBuffer::allocate(1, 1, 4);
        let took = buf.snapshot_if_needed(2, &[]);
        assert!(took.is_none());
        assert_eq!(buf.version_id(), 2);
    }

    #[tokio::test]
    async fn load_applies_outstanding_patches() {
        let ser = MemSerializer::new(4);
        let id = ser.gen_block_id().unwrap();
        let account = ser.make_io_account(100, 8);
        ser.write(
            &[crate::serializer::BlockWrite { block_id: id, data: Some(&[0u8; 4]), recency: crate::serializer::Recency(1) }],
            &account,
        )
        .await
        .unwrap();

        let mut store = PatchStore::new();
        store.store_patch(crate::patch::Patch::new(
            id,
            1,
            crate::patch::PatchKind::Copy { offset: 0, bytes: vec![0x7F] },
        ));

        let buf = InnerBuffer::load(id, &ser, &account, &mut store).await.unwrap();
        let mut seen = None;
        buf.read_data(|d| seen = d.map(|b| b.to_vec()));
        assert_eq!(seen, Some(vec![0x7F, 0, 0, 0]));
    }
}
