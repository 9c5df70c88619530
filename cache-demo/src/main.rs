use bcache::cache::Cache;
use bcache::config::CacheConfig;
use bcache::error::CResult;
use bcache::lock::LockMode;
use bcache::serializer::mem::MemSerializer;
use bcache::serializer::Recency;
use bcache::transaction::Access;

#[tokio::main]
async fn main() {
    env_logger::init();
    run().await.unwrap();
    println!("Bye~");
}

async fn run() -> CResult<()> {
    println!("Hello, buffer cache!");

    let cache = Cache::create(MemSerializer::new(4096), CacheConfig::default()).await?;

    let mut txn = cache.begin_transaction(Access::Write, 1, Recency(1)).await;
    let handle = txn.allocate().await?;
    let block_id = handle.block_id();
    handle.set_data(0, b"hello, block", 12);
    handle.release().await;
    txn.commit().await?;

    // A second writer layers a couple more patches onto the same block
    // rather than rewriting it whole.
    let mut txn = cache.begin_transaction(Access::Write, 1, Recency(2)).await;
    let handle = txn.acquire(block_id, LockMode::Write, None, true).await?;
    handle.set_data(0, b"goodbye", 7);
    handle.release().await;
    txn.commit().await?;

    let mut read_txn = cache.begin_transaction(Access::Read, 0, Recency(3)).await;
    let handle = read_txn.acquire(block_id, LockMode::Read, None, true).await?;
    let data = handle.read_data(|d| d.map(|b| b[..12].to_vec())).unwrap();
    assert_eq!(&data, b"goodbyeblock");
    handle.release().await;
    read_txn.commit().await?;

    println!("read back: {:?}", String::from_utf8_lossy(&data));

    let mut delete_txn = cache.begin_transaction(Access::Write, 1, Recency(4)).await;
    let handle = delete_txn.acquire(block_id, LockMode::Write, None, true).await?;
    handle.mark_deleted(true);
    handle.release().await;
    delete_txn.commit().await?;

    cache.shutdown().await?;
    Ok(())
}
