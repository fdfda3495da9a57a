//! s3stream core - Streaming multipart writer for S3-compatible object stores
//!
//! This crate turns an unbounded stream of appends into a pipelined
//! multipart upload:
//! - Fixed-size part buffers from a bounded, process-wide pool
//! - A dedicated upload executor running parts concurrently
//! - A writer state machine covering initiate, parts, complete and abort
//! - A reqwest S3 client with SigV4 signing and an in-memory store for tests

pub mod error;
pub mod metrics;
pub mod runtime;
pub mod storage;
pub mod writer;

pub use error::{ErrorKind, RemoteError, Result, S3StreamError};
pub use runtime::{ExecutorConfig, UploadExecutor, WaitGroup};
pub use storage::{
    FileBuffer, FileBufferPool, InMemoryObjectStore, ObjectStoreClient, PoolConfig, S3Client, S3Config,
    S3FileSystem, S3FileWriter, WriterConfig,
};
pub use writer::{FileWriter, LocalFileWriter};

/// Default part size (5 MiB)
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 5 * 1024 * 1024;

/// Smallest part S3 accepts for all but the last part (5 MiB)
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Largest part S3 accepts (5 GiB)
pub const MAX_PART_SIZE: usize = 5 * 1024 * 1024 * 1024;

/// Most parts in one multipart upload
pub const MAX_PARTS: u32 = 10_000;

/// Default interval between "still waiting" warnings in close/abort
pub const DEFAULT_WAIT_WARN_INTERVAL_SECS: u64 = 300;
