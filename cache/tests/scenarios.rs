//! End-to-end scenarios exercising the cache through its public API
//! only (no internal module access), the way a caller embedding it as
//! a storage layer would.

use bcache::cache::Cache;
use bcache::config::CacheConfig;
use bcache::lock::LockMode;
use bcache::serializer::mem::MemSerializer;
use bcache::serializer::Recency;
use bcache::transaction::Access;
use pretty_assertions::assert_eq;

async fn test_cache() -> Cache<MemSerializer> {
    Cache::create(MemSerializer::new(64), CacheConfig::default()).await.unwrap()
}

/// A write transaction's data is visible to a later reader once
/// committed.
#[tokio::test]
async fn write_then_read_round_trips() {
    let cache = test_cache().await;

    let mut txn = cache.begin_transaction(Access::Write, 1, Recency(1)).await;
    let handle = txn.allocate().await.unwrap();
    let block_id = handle.block_id();
    handle.set_data(0, b"durable bytes", 13);
    handle.release().await;
    txn.commit().await.unwrap();

    let mut read_txn = cache.begin_transaction(Access::Read, 0, Recency(1)).await;
    let handle = read_txn.acquire(block_id, LockMode::Read, None, true).await.unwrap();
    let data = handle.read_data(|d| d.map(|b| b.to_vec())).unwrap();
    assert_eq!(&data[..13], b"durable bytes");
}

/// A reader that opts into snapshot isolation keeps seeing the data as
/// of its own start, even after a concurrent writer commits a change to
/// the same block.
#[tokio::test]
async fn snapshot_reader_is_isolated_from_a_later_writer() {
    let cache = test_cache().await;

    let mut setup = cache.begin_transaction(Access::Write, 1, Recency(1)).await;
    let handle = setup.allocate().await.unwrap();
    let block_id = handle.block_id();
    handle.set_data(0, b"before", 6);
    handle.release().await;
    setup.commit().await.unwrap();

    // Taking the lock once under `ReadOutdatedOk` registers this
    // transaction's version as a reader the next writer must snapshot
    // around, without holding the block lock across the writer's turn.
    let mut reader = cache.begin_transaction(Access::Read, 0, Recency(2)).await;
    reader.snapshot();
    reader.acquire(block_id, LockMode::ReadOutdatedOk, None, true).await.unwrap().release().await;

    let mut writer = cache.begin_transaction(Access::Write, 1, Recency(3)).await;
    let writer_handle = writer.acquire(block_id, LockMode::Write, None, true).await.unwrap();
    writer_handle.set_data(0, b"after!", 6);
    writer_handle.release().await;
    writer.commit().await.unwrap();

    // Still within the same snapshot, re-acquiring the block now takes
    // the retained pre-write copy rather than the live (updated) data.
    let reader_handle = reader.acquire(block_id, LockMode::Read, None, true).await.unwrap();
    let seen = reader_handle.read_data(|d| d.map(|b| b[..6].to_vec())).unwrap();
    assert_eq!(seen, b"before");
    reader_handle.release().await;
    reader.commit().await.unwrap();

    // A fresh, non-snapshotting reader now sees the write.
    let mut later = cache.begin_transaction(Access::Read, 0, Recency(4)).await;
    let later_handle = later.acquire(block_id, LockMode::Read, None, true).await.unwrap();
    let seen = later_handle.read_data(|d| d.map(|b| b[..6].to_vec())).unwrap();
    assert_eq!(seen, b"after!");
}

/// A freshly allocated block has never been flushed, so its first write
/// forces a full flush rather than a patch (there's no base version on
/// disk yet for a patch to apply against). Once that flush lands, later
/// small writes accumulate as patches instead.
#[tokio::test]
async fn a_never_flushed_block_forces_a_full_flush_first() {
    // Budget = block_size / 8 = 64 bytes; a single 1-byte copy patch's
    // fixed accounting overhead (1 + 8 + 8 + 16 + payload) is 34 bytes,
    // comfortably under budget once the block has a base version.
    let config = CacheConfig { wait_for_flush: false, ..CacheConfig::default() };
    let cache = Cache::create(MemSerializer::new(512), config).await.unwrap();

    let mut txn = cache.begin_transaction(Access::Write, 1, Recency(1)).await;
    let handle = txn.allocate().await.unwrap();
    let block_id = handle.block_id();
    handle.set_data(0, &[0x11], 1);
    handle.release().await;
    txn.commit().await.unwrap();
    cache.sync(|| {}).await.unwrap();
    assert_eq!(cache.metrics().snapshot().full_flushes, 1);

    let mut txn2 = cache.begin_transaction(Access::Write, 1, Recency(2)).await;
    let handle = txn2.acquire(block_id, LockMode::Write, None, true).await.unwrap();
    handle.set_data(1, &[0x22], 1);
    handle.release().await;
    txn2.commit().await.unwrap();
    cache.sync(|| {}).await.unwrap();

    let metrics = cache.metrics().snapshot();
    assert_eq!(metrics.full_flushes, 1, "the second write should have landed as a patch, not another full flush");
    assert!(metrics.patch_flushes >= 1);

    let mut read_txn = cache.begin_transaction(Access::Read, 0, Recency(3)).await;
    let handle = read_txn.acquire(block_id, LockMode::Read, None, true).await.unwrap();
    let data = handle.read_data(|d| d.map(|b| b.to_vec())).unwrap();
    assert_eq!(&data[..2], &[0x11, 0x22]);
}

/// Once a block's accumulated, not-yet-materialized patches exceed its
/// per-block budget, the next write forces a full flush rather than
/// growing the patch chain further.
#[tokio::test]
async fn dense_patches_cross_the_budget_and_force_a_full_flush() {
    // Budget = 512 / 8 = 64 bytes. One patch's accounting is 34 bytes,
    // so a second patch in the same write transaction (34 + 34 = 68)
    // crosses the budget and forces a full flush instead.
    let config = CacheConfig { wait_for_flush: false, ..CacheConfig::default() };
    let cache = Cache::create(MemSerializer::new(512), config).await.unwrap();

    let mut txn = cache.begin_transaction(Access::Write, 1, Recency(1)).await;
    let handle = txn.allocate().await.unwrap();
    let block_id = handle.block_id();
    handle.set_data(0, &[0x11], 1);
    handle.release().await;
    txn.commit().await.unwrap();
    cache.sync(|| {}).await.unwrap();
    assert_eq!(cache.metrics().snapshot().full_flushes, 1);

    let mut txn2 = cache.begin_transaction(Access::Write, 1, Recency(2)).await;
    let handle = txn2.acquire(block_id, LockMode::Write, None, true).await.unwrap();
    handle.set_data(1, &[0x22], 1);
    handle.set_data(2, &[0x33], 1);
    handle.release().await;
    txn2.commit().await.unwrap();
    cache.sync(|| {}).await.unwrap();

    assert_eq!(cache.metrics().snapshot().full_flushes, 2);
}

/// Deleting a block that a snapshotting reader still holds open
/// preserves the pre-delete data for that reader; once the reader
/// commits, the block is gone for good.
#[tokio::test]
async fn mark_deleted_is_invisible_once_the_reader_releases() {
    let cache = test_cache().await;

    let mut setup = cache.begin_transaction(Access::Write, 1, Recency(1)).await;
    let handle = setup.allocate().await.unwrap();
    let block_id = handle.block_id();
    handle.set_data(0, b"about to go", 11);
    handle.release().await;
    setup.commit().await.unwrap();

    let mut reader = cache.begin_transaction(Access::Read, 0, Recency(2)).await;
    reader.snapshot();
    reader.acquire(block_id, LockMode::ReadOutdatedOk, None, true).await.unwrap().release().await;

    let mut deleter = cache.begin_transaction(Access::Write, 1, Recency(3)).await;
    let delete_handle = deleter.acquire(block_id, LockMode::Write, None, true).await.unwrap();
    delete_handle.mark_deleted(true);
    delete_handle.release().await;
    deleter.commit().await.unwrap();

    let reader_handle = reader.acquire(block_id, LockMode::Read, None, true).await.unwrap();
    let seen = reader_handle.read_data(|d| d.map(|b| b[..11].to_vec())).unwrap();
    assert_eq!(seen, b"about to go");
    reader_handle.release().await;
    reader.commit().await.unwrap();
}

/// Once resident buffers exceed the memory budget, allocating past it
/// evicts unpinned, clean, already-flushed blocks to make room, rather
/// than growing residency without bound.
#[tokio::test]
async fn allocating_past_the_memory_budget_evicts_clean_blocks() {
    // block_size 64, max_size 128 => an unload threshold of 2 blocks.
    let config = CacheConfig { max_size: 128, wait_for_flush: false, ..CacheConfig::default() };
    let cache = Cache::create(MemSerializer::new(64), config).await.unwrap();

    let mut first_block_id = None;
    for i in 0..4u8 {
        let mut txn = cache.begin_transaction(Access::Write, 1, Recency(i as u64)).await;
        let handle = txn.allocate().await.unwrap();
        if first_block_id.is_none() {
            first_block_id = Some(handle.block_id());
        }
        handle.set_data(0, &[i], 1);
        handle.release().await;
        txn.commit().await.unwrap();
        // Flush so the block is clean and therefore evictable once
        // nothing else is holding it.
        cache.sync(|| {}).await.unwrap();
    }

    let metrics = cache.metrics().snapshot();
    assert!(metrics.blocks_evicted >= 2, "expected eviction once residency crossed the 2-block budget");
    assert!(metrics.blocks_in_memory <= 2);

    // The earliest-allocated block was evicted, but it's still readable
    // through the public API — `acquire` reloads it from the serializer.
    let mut read_txn = cache.begin_transaction(Access::Read, 0, Recency(5)).await;
    let handle = read_txn.acquire(first_block_id.unwrap(), LockMode::Read, None, true).await.unwrap();
    let data = handle.read_data(|d| d.map(|b| b.to_vec())).unwrap();
    assert_eq!(data[0], 0);
}

/// A block offered through the serializer's read-ahead path is adopted
/// into residency without any transaction having asked for it, and a
/// later read finds it already there rather than issuing its own load.
#[tokio::test]
async fn read_ahead_offer_is_adopted_into_residency() {
    let serializer = MemSerializer::new(64);
    let block_id = serializer.gen_block_id().unwrap();
    serializer.seed_block(block_id, vec![0x7A; 64]);

    let cache = Cache::create(serializer.clone(), CacheConfig::default()).await.unwrap();
    assert_eq!(cache.metrics().snapshot().blocks_in_memory, 0);

    serializer.offer_read_ahead(block_id, Recency(1));
    assert_eq!(cache.metrics().snapshot().blocks_in_memory, 1, "the offered block should be resident now");

    let mut txn = cache.begin_transaction(Access::Read, 0, Recency(2)).await;
    let handle = txn.acquire(block_id, LockMode::Read, None, true).await.unwrap();
    let data = handle.read_data(|d| d.map(|b| b.to_vec())).unwrap();
    assert_eq!(data, vec![0x7A; 64]);
    assert_eq!(cache.metrics().snapshot().blocks_in_memory, 1, "adoption shouldn't have double-counted residency");
}

/// A patch materialized into the on-disk log survives the cache being
/// dropped and reopened against the same log path and a fresh (as if
/// post-crash) serializer whose base data for the block is still zero.
#[tokio::test]
async fn patch_log_survives_a_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("patches.log");

    let block_id;
    {
        let config = CacheConfig { wait_for_flush: false, ..CacheConfig::default() };
        let serializer = MemSerializer::new(512);
        let cache = Cache::create_with_patch_log(serializer, config, log_path.clone()).await.unwrap();

        // Establishes a base version so the block becomes patchable.
        let mut setup = cache.begin_transaction(Access::Write, 1, Recency(1)).await;
        let handle = setup.allocate().await.unwrap();
        block_id = handle.block_id();
        handle.set_data(0, &[0u8; 9], 9);
        handle.release().await;
        setup.commit().await.unwrap();
        cache.sync(|| {}).await.unwrap();

        // A small patch, materialized into the on-disk log by `sync`.
        let mut txn = cache.begin_transaction(Access::Write, 1, Recency(2)).await;
        let handle = txn.acquire(block_id, LockMode::Write, None, true).await.unwrap();
        handle.set_data(0, b"recovered", 9);
        handle.release().await;
        txn.commit().await.unwrap();
        cache.sync(|| {}).await.unwrap();
        assert_eq!(cache.metrics().snapshot().patch_flushes, 1);
        // Dropped without a clean shutdown — the on-disk log is the only
        // record of this second write surviving into the next `Cache`.
    }

    {
        let config = CacheConfig { wait_for_flush: false, ..CacheConfig::default() };
        let serializer = MemSerializer::new(512);
        let cache = Cache::create_with_patch_log(serializer, config, log_path).await.unwrap();
        let mut txn = cache.begin_transaction(Access::Read, 0, Recency(3)).await;
        let handle = txn.acquire(block_id, LockMode::Read, None, true).await.unwrap();
        let data = handle.read_data(|d| d.map(|b| b.to_vec())).unwrap();
        assert_eq!(&data[..9], b"recovered");
    }
}
