//! File writer capability shared by all destinations
//!
//! The enclosing file system hands out `Box<dyn FileWriter>`; S3 and local
//! writers implement it independently.

pub mod local;

use async_trait::async_trait;

use crate::error::Result;

pub use local::LocalFileWriter;

/// Streaming writer for one file or object
#[async_trait]
pub trait FileWriter: Send {
    /// Destination of the writer
    fn path(&self) -> &str;

    /// Prepare the destination. Appending opens lazily.
    async fn open(&mut self) -> Result<()>;

    /// Append slices as one contiguous byte stream
    async fn appendv(&mut self, slices: &[&[u8]]) -> Result<()>;

    async fn append(&mut self, data: &[u8]) -> Result<()> {
        self.appendv(&[data]).await
    }

    /// Flush buffered bytes without publishing the file
    async fn finalize(&mut self) -> Result<()>;

    /// Publish the file. Idempotent.
    async fn close(&mut self) -> Result<()>;

    /// Discard everything written
    async fn abort(&mut self) -> Result<()>;

    /// Bytes passed to `appendv` so far
    fn bytes_appended(&self) -> u64;
}

#[async_trait]
impl FileWriter for crate::storage::S3FileWriter {
    fn path(&self) -> &str {
        crate::storage::S3FileWriter::path(self)
    }

    async fn open(&mut self) -> Result<()> {
        crate::storage::S3FileWriter::open(self).await
    }

    async fn appendv(&mut self, slices: &[&[u8]]) -> Result<()> {
        crate::storage::S3FileWriter::appendv(self, slices).await
    }

    async fn finalize(&mut self) -> Result<()> {
        crate::storage::S3FileWriter::finalize(self).await
    }

    async fn close(&mut self) -> Result<()> {
        crate::storage::S3FileWriter::close(self).await
    }

    async fn abort(&mut self) -> Result<()> {
        crate::storage::S3FileWriter::abort(self).await
    }

    fn bytes_appended(&self) -> u64 {
        crate::storage::S3FileWriter::bytes_appended(self)
    }
}
