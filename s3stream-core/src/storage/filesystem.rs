//! Parent file system for S3 writers
//!
//! Bundles what every writer of one bucket shares: the client, the buffer
//! pool, the upload executor and the writer configuration.

use std::sync::Arc;

use tracing::debug;

use super::buffer_pool::{self, FileBufferPool};
use super::client::ObjectStoreClient;
use super::multipart::{S3FileWriter, WriterConfig};
use crate::error::Result;
use crate::runtime::UploadExecutor;

/// Handle creating writers for objects in one bucket
#[derive(Clone)]
pub struct S3FileSystem {
    client: Arc<dyn ObjectStoreClient>,
    endpoint: String,
    bucket: String,
    pool: Arc<FileBufferPool>,
    executor: Arc<UploadExecutor>,
    config: WriterConfig,
}

impl S3FileSystem {
    /// Create a file system, checking `config` against the pool's part size
    pub fn new(
        client: Arc<dyn ObjectStoreClient>,
        endpoint: impl Into<String>,
        bucket: impl Into<String>,
        pool: Arc<FileBufferPool>,
        executor: Arc<UploadExecutor>,
        config: WriterConfig,
    ) -> Result<Self> {
        config.validate(pool.buffer_size())?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            bucket: bucket.into(),
            pool,
            executor,
            config,
        })
    }

    /// Create a file system on the process-wide buffer pool
    pub fn with_global_pool(
        client: Arc<dyn ObjectStoreClient>,
        endpoint: impl Into<String>,
        bucket: impl Into<String>,
        executor: Arc<UploadExecutor>,
        config: WriterConfig,
    ) -> Result<Self> {
        let pool = buffer_pool::global()?;
        Self::new(client, endpoint, bucket, pool, executor, config)
    }

    /// New writer for `path`, a key within the bucket. Leading slashes are
    /// ignored.
    pub fn create_file(&self, path: &str) -> S3FileWriter {
        let key = path.trim_start_matches('/');
        debug!("Creating writer for {}/{} at {}", self.bucket, key, self.endpoint);
        S3FileWriter::new(
            self.client.clone(),
            self.bucket.clone(),
            key,
            self.pool.clone(),
            self.executor.clone(),
            self.config.clone(),
        )
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn pool(&self) -> &Arc<FileBufferPool> {
        &self.pool
    }

    pub fn executor(&self) -> &Arc<UploadExecutor> {
        &self.executor
    }

    pub fn config(&self) -> &WriterConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ExecutorConfig;
    use crate::storage::{InMemoryObjectStore, PoolConfig};

    #[test]
    fn test_rejects_part_size_below_minimum() {
        let pool = FileBufferPool::new(PoolConfig {
            buffer_size: 1024,
            max_buffers: 2,
        })
        .unwrap();
        let executor = UploadExecutor::new(ExecutorConfig {
            workers: 1,
            ..Default::default()
        })
        .unwrap();
        let store = Arc::new(InMemoryObjectStore::new());

        let result = S3FileSystem::new(
            store.clone(),
            "memory://",
            "bucket",
            pool.clone(),
            executor.clone(),
            WriterConfig::default(),
        );
        assert!(result.is_err());

        let config = WriterConfig {
            min_part_size: 1024,
            ..Default::default()
        };
        let fs = S3FileSystem::new(store, "memory://", "bucket", pool, executor, config).unwrap();
        let writer = fs.create_file("/dir/object.bin");
        assert_eq!(writer.key(), "dir/object.bin");
        assert_eq!(writer.path(), "s3://bucket/dir/object.bin");
        assert!(!writer.is_opened());
    }
}
