//! Object storage side of the writer
//!
//! Part buffers and their pool, the object store protocol with its HTTP and
//! in-memory implementations, and the multipart writer built on them.

pub mod buffer_pool;
pub mod client;
pub mod file_buffer;
pub mod filesystem;
pub mod memory;
pub mod multipart;
pub mod s3;
pub mod sigv4;

pub use buffer_pool::{FileBufferPool, PoolConfig};
pub use client::{content_md5, CompletedPart, ObjectStoreClient, RemoteResult, UploadPartRequest};
pub use file_buffer::{FileBuffer, PartPayload};
pub use filesystem::S3FileSystem;
pub use memory::{InMemoryObjectStore, RequestCounts};
pub use multipart::{S3FileWriter, WriterConfig};
pub use s3::{S3Client, S3Config};
