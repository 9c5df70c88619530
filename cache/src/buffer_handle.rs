//! The handle a transaction gets back from `acquire`/`allocate`: the
//! caller-facing view over one resident block for the duration of one
//! access.
//!
//! Two quite different paths live behind one type. A snapshotting
//! reader whose version predates the buffer's current version reads a
//! retained [`crate::inner_buffer::SnapshotEntry`] directly, taking no
//! lock at all — the data can't change underneath it since nothing
//! holds a mutable reference to a past snapshot. Every other access
//! goes through the block-lock, and a write additionally triggers
//! `snapshot_if_needed` before handing back a freshly cloned, private
//! copy of the data to mutate.

use crate::cache::CacheShared;
use crate::inner_buffer::{BufferLockGuard, InnerBuffer};
use crate::lock::LockMode;
use crate::metrics::Metrics;
use crate::patch::{Patch, PatchKind};
use crate::serializer::{Recency, Serializer};
use crate::version::{BlockId, Version, NULL_TXN};
use std::sync::Arc;

enum Access {
    /// A read against a retained past version; no lock held.
    Snapshot { data: Option<Vec<u8>>, used_version: Option<Version> },
    /// A read or write against the live buffer.
    Live { guard: Option<BufferLockGuard> },
}

/// A caller's access to one resident block, returned by
/// [`crate::transaction::Transaction::acquire`] and
/// [`crate::transaction::Transaction::allocate`].
pub struct BufferHandle<S: Serializer> {
    shared: Arc<CacheShared<S>>,
    buf: Arc<InnerBuffer>,
    mode: LockMode,
    version_to_access: Version,
    access: Access,
    released: bool,
}

impl<S: Serializer> BufferHandle<S> {
    pub(crate) async fn acquire(
        shared: Arc<CacheShared<S>>,
        buf: Arc<InnerBuffer>,
        mode: LockMode,
        version_to_access: Version,
        snapshotted: bool,
        recency: Recency,
        on_in_line: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        buf.pin();
        Metrics::inc(&shared.metrics.bufs_held);

        if snapshotted && version_to_access < buf.version_id() {
            assert!(
                matches!(mode, LockMode::Read | LockMode::ReadSync),
                "a snapshotting reader may only take read modes"
            );
            // A snapshot read never queues behind the live lock, so it's
            // always already "in line" — run the hook immediately.
            if let Some(cb) = on_in_line {
                cb();
            }
            match buf.snapshot_for_version(version_to_access) {
                Some((entry_version, data)) => {
                    return Self {
                        shared,
                        buf,
                        mode,
                        version_to_access,
                        access: Access::Snapshot { data: Some(data), used_version: Some(entry_version) },
                        released: false,
                    };
                }
                None => {
                    // No retained entry is old enough; there's nothing
                    // concurrent that could still mutate data this old,
                    // so reading the live buffer directly is safe.
                    let data = buf.clone_data();
                    return Self {
                        shared,
                        buf,
                        mode,
                        version_to_access,
                        access: Access::Snapshot { data, used_version: None },
                        released: false,
                    };
                }
            }
        }

        let guard = match mode {
            LockMode::ReadOutdatedOk => {
                if let Some(cb) = on_in_line {
                    cb();
                }
                buf.lock.acquire_read_outdated_ok(|| buf.pin_cow()).await;
                None
            }
            LockMode::Write => {
                let guard = match on_in_line {
                    Some(cb) => buf.acquire_lock_with_in_line_hook(LockMode::Write, cb).await,
                    None => buf.acquire_lock(LockMode::Write).await,
                };
                let active_versions = shared.snapshots.lock().unwrap().active_versions();
                if let Some(taken) = buf.snapshot_if_needed(version_to_access, &active_versions) {
                    Metrics::inc(&shared.metrics.registered_snapshot_blocks);
                    for reader_version in taken.overlapping_versions {
                        shared.register_pending_snapshot_release(reader_version, Arc::clone(&buf), taken.old_version);
                    }
                }
                let data = buf.clone_data().unwrap_or_else(|| vec![0u8; shared.block_size]);
                buf.set_data(data);
                buf.touch_recency(recency);
                Some(guard)
            }
            LockMode::Read | LockMode::ReadSync => Some(match on_in_line {
                Some(cb) => buf.acquire_lock_with_in_line_hook(mode, cb).await,
                None => buf.acquire_lock(mode).await,
            }),
        };

        Self { shared, buf, mode, version_to_access, access: Access::Live { guard }, released: false }
    }

    pub fn block_id(&self) -> BlockId {
        self.buf.block_id
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Reads the block's data as of this handle's version. `None` means
    /// a deleted or never-loaded block.
    pub fn read_data<T>(&self, f: impl FnOnce(Option<&[u8]>) -> T) -> T {
        match &self.access {
            Access::Snapshot { data, .. } => f(data.as_deref()),
            Access::Live { .. } => self.buf.read_data(f),
        }
    }

    /// Mutable access to the whole block, bypassing the patch log
    /// entirely: the block is marked for a full flush rather than a
    /// patch-materializing one, since this path doesn't produce a
    /// `Patch` the log could replay.
    pub fn write_data(&self, f: impl FnOnce(&mut [u8])) {
        assert!(matches!(self.mode, LockMode::Write), "write_data requires a write-mode handle");
        self.buf.with_data_mut(f);
        self.buf.set_needs_flush();
        self.buf.mark_dirty();
        self.shared.writeback.mark_dirty(self.buf.block_id, self.shared.block_size as u64);
    }

    /// Overwrites `n` bytes at `dst` with `src`, as a patch unless the
    /// block is already forced to a full flush.
    pub fn set_data(&self, dst: u32, src: &[u8], n: u32) {
        assert!(matches!(self.mode, LockMode::Write), "set_data requires a write-mode handle");
        if self.buf.needs_flush() {
            let (dst, n) = (dst as usize, n as usize);
            self.buf.with_data_mut(|buf| buf[dst..dst + n].copy_from_slice(&src[..n]));
            self.buf.mark_dirty();
            self.shared.writeback.mark_dirty(self.buf.block_id, self.shared.block_size as u64);
            return;
        }
        let counter = self.buf.advance_patch_counter();
        let patch = Patch::new(self.buf.block_id, counter, PatchKind::Copy { offset: dst, bytes: src[..n as usize].to_vec() });
        self.apply_patch(patch);
    }

    /// memmoves `len` bytes from `src` to `dst` within the block, as a
    /// patch unless the block is already forced to a full flush.
    pub fn move_data(&self, dst: u32, src: u32, len: u32) {
        assert!(matches!(self.mode, LockMode::Write), "move_data requires a write-mode handle");
        if self.buf.needs_flush() {
            let (dst, src, len) = (dst as usize, src as usize, len as usize);
            self.buf.with_data_mut(|buf| buf.copy_within(src..src + len, dst));
            self.buf.mark_dirty();
            self.shared.writeback.mark_dirty(self.buf.block_id, self.shared.block_size as u64);
            return;
        }
        let counter = self.buf.advance_patch_counter();
        let patch = Patch::new(self.buf.block_id, counter, PatchKind::Move { src, dst, len });
        self.apply_patch(patch);
    }

    /// Applies `patch` to the live buffer and, unless it instead forces
    /// a full flush, records it for the next materialization pass. A
    /// never-flushed block (`NULL_TXN`) or one whose accumulated patch
    /// size would exceed its per-block budget forces a full flush
    /// instead of growing the patch log further.
    fn apply_patch(&self, patch: Patch) {
        self.buf.with_data_mut(|buf| patch.apply(buf));
        self.buf.mark_dirty();
        self.shared.writeback.mark_dirty(self.buf.block_id, self.shared.block_size as u64);

        let forces_full = self.buf.transaction_id() == NULL_TXN || {
            let store = self.shared.patch_store.lock().unwrap();
            let budget = self.shared.config.max_patch_budget_bytes(self.shared.block_size as u64);
            store.get_affected_data_size(self.buf.block_id) + patch.affected_data_size() > budget
        };

        if forces_full {
            self.buf.set_needs_flush();
            self.shared.patch_store.lock().unwrap().drop_patches(self.buf.block_id);
            return;
        }

        let mut store = self.shared.patch_store.lock().unwrap();
        if patch.counter == 1 {
            store.drop_patches(self.buf.block_id);
        }
        Metrics::inc(&self.shared.metrics.patches_stored);
        Metrics::add(&self.shared.metrics.patches_size_per_write_total, patch.affected_data_size());
        store.store_patch(patch);
    }

    /// Marks the block deleted. Any snapshot an active reader needed was
    /// already taken when this handle was acquired (every write-mode
    /// `acquire` calls `snapshot_if_needed` up front) — the pre-delete
    /// data is retained there if so, so it's safe to free the live copy
    /// unconditionally here.
    pub fn mark_deleted(&self, write_null: bool) {
        assert!(matches!(self.mode, LockMode::Write), "mark_deleted requires a write-mode handle");
        self.buf.free_data();
        self.buf.mark_deleted(write_null);
        self.buf.mark_dirty();
        self.shared.writeback.mark_dirty(self.buf.block_id, self.shared.block_size as u64);
    }

    pub fn touch_recency(&self, recency: Recency) {
        self.buf.touch_recency(recency);
    }

    /// Releases this handle: drops the lock (if any) or the snapshot
    /// pin, unpins the buffer, and — for a deleted block that's now
    /// safe to unload — removes it from residency entirely.
    pub async fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        match &mut self.access {
            Access::Snapshot { used_version, .. } => {
                if let Some(version) = used_version.take() {
                    self.buf.release_snapshot(version);
                }
            }
            Access::Live { guard } => {
                *guard = None;
            }
        }

        self.buf.unpin();
        Metrics::dec(&self.shared.metrics.bufs_held);

        if self.buf.do_delete() && self.buf.safe_to_unload() {
            let mut page_map = self.shared.page_map.lock().unwrap();
            let mut page_replacement = self.shared.page_replacement.lock().unwrap();
            page_replacement.untrack(&self.buf);
            page_map.remove(self.buf.block_id);
            drop(page_replacement);
            drop(page_map);
            Metrics::dec(&self.shared.metrics.blocks_in_memory);
        }
    }
}

impl<S: Serializer> Drop for BufferHandle<S> {
    fn drop(&mut self) {
        self.release_inner();
    }
}
