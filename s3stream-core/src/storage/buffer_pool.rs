//! Bounded pool of part buffers
//!
//! Caps how many part buffers exist at once. `allocate` waits for a permit
//! when every buffer is out, which throttles writers that outrun the
//! uploaders. Freed memory is kept for reuse.

use std::sync::{Arc, LazyLock};

use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use super::file_buffer::FileBuffer;
use crate::error::{Result, S3StreamError};
use crate::metrics::standard;
use crate::DEFAULT_WRITE_BUFFER_SIZE;

/// Configuration for the buffer pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Capacity of every buffer, i.e. the part size
    pub buffer_size: usize,
    /// Upper bound on buffers alive at once
    pub max_buffers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            max_buffers: 32,
        }
    }
}

/// Thread-safe bounded buffer pool
pub struct FileBufferPool {
    free: Mutex<Vec<BytesMut>>,
    permits: Arc<Semaphore>,
    config: PoolConfig,
}

impl FileBufferPool {
    /// Create a new buffer pool
    pub fn new(config: PoolConfig) -> Result<Arc<Self>> {
        if config.buffer_size == 0 || config.max_buffers == 0 {
            return Err(S3StreamError::InvalidConfig {
                reason: format!(
                    "buffer pool needs a non-zero buffer size and count, got {} x {}",
                    config.max_buffers, config.buffer_size
                ),
            });
        }

        Ok(Arc::new(Self {
            free: Mutex::new(Vec::new()),
            permits: Arc::new(Semaphore::new(config.max_buffers)),
            config,
        }))
    }

    /// Take a buffer, waiting while the pool is exhausted
    pub async fn allocate(self: &Arc<Self>) -> Result<FileBuffer> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| S3StreamError::Internal {
                message: "buffer pool semaphore closed".into(),
            })?;
        Ok(self.checkout(permit))
    }

    /// Take a buffer without waiting
    pub fn try_allocate(self: &Arc<Self>) -> Option<FileBuffer> {
        let permit = self.permits.clone().try_acquire_owned().ok()?;
        Some(self.checkout(permit))
    }

    fn checkout(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> FileBuffer {
        let data = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.config.buffer_size));
        standard::BUFFERS_IN_USE.inc();

        FileBuffer::from_parts(
            data,
            self.config.buffer_size,
            Some(PoolLease {
                pool: self.clone(),
                _permit: permit,
            }),
        )
    }

    fn release(&self, data: Option<BytesMut>) {
        standard::BUFFERS_IN_USE.dec();
        let Some(mut data) = data else {
            return;
        };
        data.clear();

        let mut free = self.free.lock();
        if free.len() < self.config.max_buffers && data.capacity() >= self.config.buffer_size {
            free.push(data);
        }
        // Otherwise the memory is dropped and reallocated on demand
    }

    /// Buffers that can be handed out right now
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Allocated memory regions kept for reuse
    pub fn idle_buffers(&self) -> usize {
        self.free.lock().len()
    }

    /// Capacity of every buffer
    pub fn buffer_size(&self) -> usize {
        self.config.buffer_size
    }

    /// Upper bound on live buffers
    pub fn max_buffers(&self) -> usize {
        self.config.max_buffers
    }

    fn trim(&self) {
        self.free.lock().clear();
    }
}

/// Ties a checked-out buffer to its pool slot
pub(crate) struct PoolLease {
    pool: Arc<FileBufferPool>,
    _permit: OwnedSemaphorePermit,
}

impl PoolLease {
    /// Return memory (when still uniquely owned) and then the slot
    pub(crate) fn release(self, data: Option<BytesMut>) {
        self.pool.release(data);
    }
}

// ========== Process-wide pool ==========

static GLOBAL_POOL: LazyLock<RwLock<Option<Arc<FileBufferPool>>>> =
    LazyLock::new(|| RwLock::new(None));

/// Initialize the process-wide pool. Must run before any writer uses it.
pub fn init_global(config: PoolConfig) -> Result<Arc<FileBufferPool>> {
    let mut slot = GLOBAL_POOL.write();
    if slot.is_some() {
        return Err(S3StreamError::InvalidConfig {
            reason: "global buffer pool already initialized".into(),
        });
    }

    let pool = FileBufferPool::new(config)?;
    info!(
        "Initialized global buffer pool: {} buffers of {} bytes",
        pool.max_buffers(),
        pool.buffer_size()
    );
    *slot = Some(pool.clone());
    Ok(pool)
}

/// The process-wide pool
pub fn global() -> Result<Arc<FileBufferPool>> {
    GLOBAL_POOL
        .read()
        .clone()
        .ok_or(S3StreamError::PoolNotInitialized)
}

/// Tear down the process-wide pool.
///
/// Writers that already hold the pool keep using it; new lookups fail until
/// `init_global` runs again.
pub fn shutdown_global() -> Option<Arc<FileBufferPool>> {
    let pool = GLOBAL_POOL.write().take()?;
    pool.trim();
    debug!("Global buffer pool torn down");
    Some(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_buffer_pool() {
        let pool = FileBufferPool::new(PoolConfig {
            buffer_size: 1024,
            max_buffers: 2,
        })
        .unwrap();

        // Acquire all buffers
        let b1 = pool.allocate().await.unwrap();
        let b2 = pool.allocate().await.unwrap();
        assert_eq!(pool.available(), 0);
        assert_eq!(b1.capacity(), 1024);

        // Exhausted
        assert!(pool.try_allocate().is_none());

        // Release buffers
        drop(b1);
        drop(b2);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.idle_buffers(), 2);

        // Reused memory comes back empty
        let b3 = pool.allocate().await.unwrap();
        assert_eq!(b3.size(), 0);
        assert_eq!(pool.idle_buffers(), 1);
    }

    #[tokio::test]
    async fn test_allocate_waits_for_release() {
        let pool = FileBufferPool::new(PoolConfig {
            buffer_size: 16,
            max_buffers: 1,
        })
        .unwrap();

        let held = pool.allocate().await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(20), pool.allocate()).await;
        assert!(blocked.is_err());

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.allocate().await.map(|b| b.capacity()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);

        assert_eq!(waiter.await.unwrap().unwrap(), 16);
    }

    #[test]
    fn test_rejects_empty_config() {
        assert!(FileBufferPool::new(PoolConfig { buffer_size: 0, max_buffers: 4 }).is_err());
        assert!(FileBufferPool::new(PoolConfig { buffer_size: 16, max_buffers: 0 }).is_err());
    }

    #[test]
    fn test_global_lifecycle() {
        let config = PoolConfig {
            buffer_size: 64,
            max_buffers: 2,
        };

        let pool = init_global(config.clone()).unwrap();
        assert!(init_global(config.clone()).is_err());
        assert!(Arc::ptr_eq(&pool, &global().unwrap()));

        let torn_down = shutdown_global().unwrap();
        assert!(Arc::ptr_eq(&pool, &torn_down));
        assert!(matches!(global(), Err(S3StreamError::PoolNotInitialized)));

        // A writer still holding the old pool keeps working
        assert!(pool.try_allocate().is_some());

        init_global(config).unwrap();
        shutdown_global();
    }
}
