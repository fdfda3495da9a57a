//! Stress tests for concurrent writers sharing one pool and executor
//!
//! Run with: cargo test --release --test stress_writer -- --nocapture

use std::sync::Arc;
use std::time::{Duration, Instant};

use s3stream_core::metrics::standard;
use s3stream_core::storage::{InMemoryObjectStore, S3FileSystem, WriterConfig};
use s3stream_core::{ExecutorConfig, FileBufferPool, PoolConfig, UploadExecutor};

/// Configuration for stress tests
struct StressConfig {
    num_writers: usize,
    object_size: usize,
    part_size: usize,
    max_buffers: usize,
    workers: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            num_writers: 16,
            object_size: 256 * 1024 + 17,
            part_size: 8 * 1024,
            max_buffers: 8,
            workers: 4,
        }
    }
}

fn object_bytes(writer_id: usize, size: usize) -> Vec<u8> {
    (0..size).map(|i| ((writer_id * 7 + i) % 251) as u8).collect()
}

fn setup(config: &StressConfig) -> (Arc<InMemoryObjectStore>, S3FileSystem) {
    let store = Arc::new(InMemoryObjectStore::with_min_part_size(config.part_size));
    store.set_part_delay(Duration::from_micros(200));
    let pool = FileBufferPool::new(PoolConfig {
        buffer_size: config.part_size,
        max_buffers: config.max_buffers,
    })
    .unwrap();
    let executor = UploadExecutor::new(ExecutorConfig {
        workers: config.workers,
        thread_name: "stress-upload".into(),
    })
    .unwrap();
    let writer_config = WriterConfig {
        min_part_size: config.part_size,
        ..Default::default()
    };
    let fs = S3FileSystem::new(store.clone(), "memory://", "stress", pool, executor, writer_config).unwrap();
    (store, fs)
}

/// Many writers share a pool smaller than their combined demand
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stress_concurrent_writers() {
    let config = StressConfig::default();
    let (store, fs) = setup(&config);
    let start = Instant::now();

    let mut handles = Vec::new();
    for writer_id in 0..config.num_writers {
        let fs = fs.clone();
        let size = config.object_size;
        handles.push(tokio::spawn(async move {
            let data = object_bytes(writer_id, size);
            let mut writer = fs.create_file(&format!("object-{}", writer_id));
            // Odd-sized appends so slices straddle part boundaries
            for chunk in data.chunks(3001) {
                writer.appendv(&[chunk]).await.unwrap();
            }
            writer.close().await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = config.num_writers * config.object_size;
    println!(
        "Wrote {} objects ({} bytes) in {:.2}s, {:.1} MB/s",
        config.num_writers,
        total,
        elapsed.as_secs_f64(),
        total as f64 / elapsed.as_secs_f64() / 1e6
    );

    let parts = config.object_size.div_ceil(config.part_size);
    for writer_id in 0..config.num_writers {
        let key = format!("object-{}", writer_id);
        let object = store.object("stress", &key).unwrap();
        assert_eq!(&object[..], &object_bytes(writer_id, config.object_size)[..]);
        assert_eq!(store.object_part_sizes("stress", &key).unwrap().len(), parts);
    }
    assert_eq!(store.pending_uploads(), 0);
    assert_eq!(fs.pool().available(), config.max_buffers);
    assert!(standard::PARTS_UPLOADED.get() >= (config.num_writers * parts) as u64);
}

/// One failing writer does not disturb the others
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stress_failure_isolation() {
    let config = StressConfig {
        num_writers: 8,
        ..Default::default()
    };
    let (store, fs) = setup(&config);

    let mut handles = Vec::new();
    for writer_id in 0..config.num_writers {
        let fs = fs.clone();
        let size = config.object_size;
        handles.push(tokio::spawn(async move {
            let data = object_bytes(writer_id, size);
            let mut writer = fs.create_file(&format!("object-{}", writer_id));
            writer.appendv(&[&data]).await.unwrap();
            if writer_id == 0 {
                writer.abort().await.unwrap();
                return false;
            }
            writer.close().await.unwrap();
            true
        }));
    }

    let mut completed = 0;
    for handle in handles {
        if handle.await.unwrap() {
            completed += 1;
        }
    }

    assert_eq!(completed, config.num_writers - 1);
    assert!(!store.object_exists("stress", "object-0"));
    for writer_id in 1..config.num_writers {
        assert!(store.object_exists("stress", &format!("object-{}", writer_id)));
    }
    assert_eq!(store.pending_uploads(), 0);
}
