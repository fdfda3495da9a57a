//! Unit tests for the part buffer pool and its interaction with writers

use std::sync::Arc;
use std::time::{Duration, Instant};

use s3stream_core::storage::buffer_pool;
use s3stream_core::storage::{InMemoryObjectStore, S3FileSystem, WriterConfig};
use s3stream_core::{ExecutorConfig, FileBufferPool, PoolConfig, S3StreamError, UploadExecutor};

fn executor(workers: usize) -> Arc<UploadExecutor> {
    UploadExecutor::new(ExecutorConfig {
        workers,
        thread_name: "pool-test".into(),
    })
    .unwrap()
}

fn small_parts() -> WriterConfig {
    WriterConfig {
        min_part_size: 32,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_buffers_return_to_pool_after_upload() {
    let pool = FileBufferPool::new(PoolConfig {
        buffer_size: 32,
        max_buffers: 4,
    })
    .unwrap();
    let store = Arc::new(InMemoryObjectStore::with_min_part_size(32));
    let fs = S3FileSystem::new(store.clone(), "memory://", "b", pool.clone(), executor(2), small_parts()).unwrap();

    let mut writer = fs.create_file("reuse");
    for _ in 0..20 {
        writer.appendv(&[&[7u8; 32]]).await.unwrap();
    }
    writer.close().await.unwrap();

    // Every slot is free again and memory was recycled rather than grown
    assert_eq!(pool.available(), 4);
    assert!(pool.idle_buffers() <= 4);
    assert_eq!(store.object("b", "reuse").unwrap().len(), 640);
}

#[tokio::test]
async fn test_exhausted_pool_throttles_writer() {
    let pool = FileBufferPool::new(PoolConfig {
        buffer_size: 32,
        max_buffers: 1,
    })
    .unwrap();
    let store = Arc::new(InMemoryObjectStore::with_min_part_size(32));
    store.set_part_delay(Duration::from_millis(50));
    let fs = S3FileSystem::new(store.clone(), "memory://", "b", pool.clone(), executor(4), small_parts()).unwrap();

    let start = Instant::now();
    let mut writer = fs.create_file("throttled");
    // Three full parts through a single buffer: each allocation waits for the previous upload
    writer.appendv(&[&[1u8; 96]]).await.unwrap();
    assert!(start.elapsed() >= Duration::from_millis(100));

    writer.close().await.unwrap();
    assert_eq!(store.object_part_sizes("b", "throttled"), Some(vec![32, 32, 32]));
}

#[tokio::test]
async fn test_global_pool_lifecycle() {
    let store = Arc::new(InMemoryObjectStore::with_min_part_size(32));
    let executor = executor(1);

    let result = S3FileSystem::with_global_pool(store.clone(), "memory://", "b", executor.clone(), small_parts());
    assert!(matches!(result, Err(S3StreamError::PoolNotInitialized)));

    let config = PoolConfig {
        buffer_size: 32,
        max_buffers: 2,
    };
    buffer_pool::init_global(config.clone()).unwrap();
    assert!(matches!(
        buffer_pool::init_global(config),
        Err(S3StreamError::InvalidConfig { .. })
    ));

    let fs = S3FileSystem::with_global_pool(store.clone(), "memory://", "b", executor.clone(), small_parts()).unwrap();
    let mut writer = fs.create_file("global");
    writer.appendv(&[&[3u8; 40]]).await.unwrap();

    // Teardown does not pull buffers from a writer that already holds the pool
    buffer_pool::shutdown_global().unwrap();
    assert!(matches!(buffer_pool::global(), Err(S3StreamError::PoolNotInitialized)));

    writer.close().await.unwrap();
    assert_eq!(store.object("b", "global").unwrap().len(), 40);
}
