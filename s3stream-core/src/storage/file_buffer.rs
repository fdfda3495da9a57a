//! Part buffer handed from a writer to the upload executor
//!
//! A `FileBuffer` is filled by exactly one writer, then submitted to the
//! executor which runs its upload callback. Dropping a submitted buffer
//! returns its memory to the pool and then fires `finish_upload`, so the
//! writer's wait group is released on every termination path.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;

use super::buffer_pool::PoolLease;
use crate::error::{Result, S3StreamError};
use crate::runtime::UploadExecutor;

/// Runs the remote upload for one buffer
pub type UploadCallback = Box<dyn FnOnce(PartPayload) -> BoxFuture<'static, ()> + Send>;

/// Signals the owner that the buffer's upload terminated
pub type FinishCallback = Box<dyn FnOnce() + Send>;

/// Lets the uploader skip work once the writer has failed
pub type CancelCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Reports a terminal upload error to the writer
pub type FailureCallback = Arc<dyn Fn(S3StreamError) + Send + Sync>;

enum Contents {
    /// Owned by the writer and still accepting bytes
    Filling(BytesMut),
    /// Frozen at submission; clones share the same memory
    Sealed(Bytes),
}

/// Fixed-capacity, append-only byte region for one part
pub struct FileBuffer {
    contents: Contents,
    capacity: usize,
    file_offset: u64,
    submitted: bool,
    upload_remote: Option<UploadCallback>,
    finish_upload: Option<FinishCallback>,
    is_cancel: Option<CancelCheck>,
    on_failed: Option<FailureCallback>,
    lease: Option<PoolLease>,
}

impl FileBuffer {
    /// Create a standalone buffer that is not backed by a pool
    pub fn new(capacity: usize) -> Self {
        Self::from_parts(BytesMut::with_capacity(capacity), capacity, None)
    }

    pub(crate) fn from_parts(mut data: BytesMut, capacity: usize, lease: Option<PoolLease>) -> Self {
        data.clear();
        Self {
            contents: Contents::Filling(data),
            capacity,
            file_offset: 0,
            submitted: false,
            upload_remote: None,
            finish_upload: None,
            is_cancel: None,
            on_failed: None,
            lease,
        }
    }

    /// Copy bytes into the buffer
    pub fn append_data(&mut self, data: &[u8]) -> Result<()> {
        let remaining = self.remaining();
        match &mut self.contents {
            Contents::Filling(buf) if data.len() <= remaining => {
                buf.extend_from_slice(data);
                Ok(())
            }
            Contents::Filling(_) => Err(S3StreamError::Internal {
                message: format!(
                    "append of {} bytes overflows buffer with {} of {} bytes free",
                    data.len(),
                    remaining,
                    self.capacity
                ),
            }),
            Contents::Sealed(_) => Err(S3StreamError::Internal {
                message: "append to a submitted buffer".into(),
            }),
        }
    }

    /// Bytes held
    pub fn size(&self) -> usize {
        match &self.contents {
            Contents::Filling(buf) => buf.len(),
            Contents::Sealed(bytes) => bytes.len(),
        }
    }

    /// Configured capacity (the part size)
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes that still fit
    pub fn remaining(&self) -> usize {
        self.capacity - self.size()
    }

    /// True once the buffer holds exactly `capacity` bytes
    pub fn is_full(&self) -> bool {
        self.size() == self.capacity
    }

    /// Offset of the first byte of this buffer within the written file
    pub fn file_offset(&self) -> u64 {
        self.file_offset
    }

    /// Set the offset of the first byte within the written file
    pub fn set_file_offset(&mut self, offset: u64) {
        self.file_offset = offset;
    }

    /// Replayable view of the contents, positioned at the first byte.
    ///
    /// Once sealed this is a cheap reference-counted clone.
    pub fn stream(&self) -> Bytes {
        match &self.contents {
            Contents::Filling(buf) => Bytes::copy_from_slice(buf),
            Contents::Sealed(bytes) => bytes.clone(),
        }
    }

    /// Install the callback that performs the remote upload
    pub fn set_upload_remote_callback<F>(&mut self, callback: F)
    where
        F: FnOnce(PartPayload) -> BoxFuture<'static, ()> + Send + 'static,
    {
        self.upload_remote = Some(Box::new(callback));
    }

    /// Install the completion signal fired after the upload terminates
    pub fn set_finish_upload<F>(&mut self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.finish_upload = Some(Box::new(callback));
    }

    /// Install the cancellation check
    pub fn set_is_cancel<F>(&mut self, callback: F)
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.is_cancel = Some(Arc::new(callback));
    }

    /// Install the failure reporter
    pub fn set_on_failed<F>(&mut self, callback: F)
    where
        F: Fn(S3StreamError) + Send + Sync + 'static,
    {
        self.on_failed = Some(Arc::new(callback));
    }

    /// Whether the owner has asked uploads to stop
    pub fn is_cancelled(&self) -> bool {
        self.is_cancel.as_ref().map_or(false, |check| check())
    }

    /// Hand the buffer to the executor.
    ///
    /// From here on the executor owns it; `finish_upload` fires exactly once
    /// when it is dropped, even if the executor rejects it.
    pub fn submit(mut self, executor: &UploadExecutor) -> Result<()> {
        self.seal();
        self.submitted = true;
        executor.execute(self)
    }

    fn seal(&mut self) {
        if let Contents::Filling(buf) = &mut self.contents {
            let bytes = std::mem::take(buf).freeze();
            self.contents = Contents::Sealed(bytes);
        }
    }

    fn payload(&self) -> PartPayload {
        PartPayload {
            body: self.stream(),
            file_offset: self.file_offset,
            is_cancel: self.is_cancel.clone(),
            on_failed: self.on_failed.clone(),
        }
    }

    /// Run the installed upload callback. Called by executor workers.
    pub(crate) async fn run_upload(mut self) {
        if let Some(upload) = self.upload_remote.take() {
            let payload = self.payload();
            upload(payload).await;
        }
    }
}

impl Drop for FileBuffer {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            let data = match std::mem::replace(&mut self.contents, Contents::Sealed(Bytes::new())) {
                Contents::Filling(buf) => Some(buf),
                Contents::Sealed(bytes) => bytes.try_into_mut().ok(),
            };
            lease.release(data);
        }

        if self.submitted {
            if let Some(finish) = self.finish_upload.take() {
                finish();
            }
        }
    }
}

/// What an upload callback sees of its buffer
pub struct PartPayload {
    body: Bytes,
    file_offset: u64,
    is_cancel: Option<CancelCheck>,
    on_failed: Option<FailureCallback>,
}

impl PartPayload {
    /// The part body; the same bytes must be hashed and sent
    pub fn stream(&self) -> Bytes {
        self.body.clone()
    }

    pub fn size(&self) -> usize {
        self.body.len()
    }

    pub fn file_offset(&self) -> u64 {
        self.file_offset
    }

    /// Whether the owning writer has failed
    pub fn is_cancelled(&self) -> bool {
        self.is_cancel.as_ref().map_or(false, |check| check())
    }

    /// Report a terminal error to the owning writer
    pub fn on_failed(&self, err: S3StreamError) {
        if let Some(report) = &self.on_failed {
            report(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_append_and_stream() {
        let mut buf = FileBuffer::new(8);
        buf.set_file_offset(16);
        buf.append_data(b"abc").unwrap();
        buf.append_data(b"de").unwrap();

        assert_eq!(buf.size(), 5);
        assert_eq!(buf.remaining(), 3);
        assert_eq!(buf.file_offset(), 16);
        assert!(!buf.is_full());

        // the view is replayable
        assert_eq!(&buf.stream()[..], b"abcde");
        assert_eq!(&buf.stream()[..], b"abcde");

        buf.append_data(b"fgh").unwrap();
        assert!(buf.is_full());
    }

    #[test]
    fn test_append_past_capacity_is_rejected() {
        let mut buf = FileBuffer::new(4);
        buf.append_data(b"abc").unwrap();
        assert!(buf.append_data(b"de").is_err());
        assert_eq!(buf.size(), 3);
    }

    #[test]
    fn test_finish_upload_only_fires_when_submitted() {
        let finished = Arc::new(AtomicUsize::new(0));

        let mut buf = FileBuffer::new(4);
        let counter = finished.clone();
        buf.set_finish_upload(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(buf);
        assert_eq!(finished.load(Ordering::SeqCst), 0);

        let mut buf = FileBuffer::new(4);
        let counter = finished.clone();
        buf.set_finish_upload(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        buf.seal();
        buf.submitted = true;
        drop(buf);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_payload_carries_callbacks() {
        let failures = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut buf = FileBuffer::new(4);
        buf.append_data(b"data").unwrap();
        buf.set_is_cancel(|| false);
        let counter = failures.clone();
        buf.set_on_failed(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let sink = seen.clone();
        buf.set_upload_remote_callback(move |part| {
            Box::pin(async move {
                assert!(!part.is_cancelled());
                sink.lock().extend_from_slice(&part.stream());
                part.on_failed(S3StreamError::Internal { message: "test".into() });
            })
        });

        buf.seal();
        buf.run_upload().await;

        assert_eq!(&seen.lock()[..], b"data");
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }
}
