//! Streaming multipart writer
//!
//! `S3FileWriter` turns a sequence of appends into a multipart upload.
//! Bytes are packed into pool buffers of exactly `buffer_size` bytes; each
//! full buffer becomes one part and is uploaded by the executor while the
//! caller keeps appending. `close` waits for every part and issues Complete,
//! `abort` waits and issues Abort.
//!
//! Uploaders never touch the writer itself. They share an `UploadShared`
//! holding the client, the failed flag, the completed part list and the
//! wait group.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::buffer_pool::FileBufferPool;
use super::client::{content_md5, CompletedPart, ObjectStoreClient, UploadPartRequest};
use super::file_buffer::{FileBuffer, PartPayload};
use crate::error::{Result, S3StreamError};
use crate::metrics::standard;
use crate::runtime::{UploadExecutor, WaitGroup};
use crate::{DEFAULT_WAIT_WARN_INTERVAL_SECS, MAX_PARTS, MAX_PART_SIZE, MIN_PART_SIZE};

/// Writer configuration
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Smallest part the remote accepts for anything but the last part
    pub min_part_size: usize,
    /// Most parts the remote accepts for one upload
    pub max_parts: u32,
    /// How long close/abort wait before logging that uploads are still running
    pub wait_warn_interval: Duration,
    /// Content type sent with Initiate and single-request puts
    pub content_type: Option<String>,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            min_part_size: MIN_PART_SIZE,
            max_parts: MAX_PARTS,
            wait_warn_interval: Duration::from_secs(DEFAULT_WAIT_WARN_INTERVAL_SECS),
            content_type: None,
        }
    }
}

impl WriterConfig {
    /// Check the config against the part size the pool hands out
    pub fn validate(&self, buffer_size: usize) -> Result<()> {
        if buffer_size < self.min_part_size {
            return Err(S3StreamError::InvalidConfig {
                reason: format!(
                    "write_buffer_size {} is below the minimum part size {}",
                    buffer_size, self.min_part_size
                ),
            });
        }
        if buffer_size > MAX_PART_SIZE {
            return Err(S3StreamError::InvalidConfig {
                reason: format!(
                    "write_buffer_size {} is above the maximum part size {}",
                    buffer_size, MAX_PART_SIZE
                ),
            });
        }
        if self.max_parts == 0 || self.max_parts > MAX_PARTS {
            return Err(S3StreamError::InvalidConfig {
                reason: format!("max_parts must be between 1 and {}, got {}", MAX_PARTS, self.max_parts),
            });
        }
        if self.wait_warn_interval.is_zero() {
            return Err(S3StreamError::InvalidConfig {
                reason: "wait_warn_interval must be non-zero".into(),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
struct UploadState {
    parts: Vec<CompletedPart>,
    bytes_written: u64,
    /// First recorded failure
    status: Option<S3StreamError>,
}

/// State shared between a writer and the uploads it submitted
struct UploadShared {
    client: Arc<dyn ObjectStoreClient>,
    bucket: String,
    key: String,
    path: String,
    wait_warn_interval: Duration,
    failed: AtomicBool,
    state: Mutex<UploadState>,
    wait: WaitGroup,
}

impl UploadShared {
    fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Set `failed` and keep the first status
    fn record_failure(&self, err: S3StreamError) {
        let mut state = self.state.lock();
        self.failed.store(true, Ordering::Release);
        if state.status.is_none() {
            state.status = Some(err);
        }
    }

    fn failure(&self) -> S3StreamError {
        self.state.lock().status.clone().unwrap_or_else(|| S3StreamError::Internal {
            message: format!("writer for {} failed without a recorded status", self.path),
        })
    }

    fn bytes_written(&self) -> u64 {
        self.state.lock().bytes_written
    }

    async fn upload_one_part(self: Arc<Self>, upload_id: String, part_num: u32, part: PartPayload) {
        if part.is_cancelled() {
            debug!("Skipping part {} of {}: writer already failed", part_num, self.path);
            return;
        }

        // Hash the exact bytes that go on the wire
        let body = part.stream();
        let size = body.len() as u64;
        let request = UploadPartRequest {
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            upload_id: upload_id.clone(),
            part_number: part_num,
            content_md5: content_md5(&body),
            content_length: size,
            body,
        };

        let start = Instant::now();
        match self.client.upload_part(request).await {
            Ok(etag) => {
                standard::PART_UPLOAD_DURATION.observe_since(start);
                standard::PARTS_UPLOADED.inc();
                standard::BYTES_UPLOADED.inc_by(size);

                let mut state = self.state.lock();
                state.parts.push(CompletedPart {
                    part_number: part_num,
                    etag,
                });
                state.bytes_written += size;
                debug!(
                    "Uploaded part {} of {} ({} bytes at offset {})",
                    part_num,
                    self.path,
                    size,
                    part.file_offset()
                );
            }
            Err(source) => {
                standard::PART_FAILURES.inc();
                let err = S3StreamError::UploadPartFailed {
                    bucket: self.bucket.clone(),
                    key: self.key.clone(),
                    part_num,
                    upload_id,
                    source,
                };
                warn!("{}", err);
                part.on_failed(err);
            }
        }
    }

    /// Wait until no part upload is in flight, warning each slow round
    async fn wait_for_uploads(&self, op: &str) {
        let mut waited = Duration::ZERO;
        while !self.wait.wait(self.wait_warn_interval).await {
            waited += self.wait_warn_interval;
            warn!(
                "{} of {} has waited {:?} for {} part uploads to finish",
                op,
                self.path,
                waited,
                self.wait.count()
            );
        }
    }

    /// Abort the remote upload; an upload that is already gone counts as aborted
    async fn abort_remote(&self, upload_id: &str) -> Result<()> {
        match self
            .client
            .abort_multipart_upload(&self.bucket, &self.key, upload_id)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_no_such_upload() || e.is_not_found() => {
                debug!("Upload {} of {} already gone: {}", upload_id, self.path, e);
                Ok(())
            }
            Err(source) => Err(S3StreamError::AbortFailed {
                bucket: self.bucket.clone(),
                key: self.key.clone(),
                upload_id: upload_id.to_string(),
                source,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Aborted,
}

/// Writer streaming one object through a multipart upload
pub struct S3FileWriter {
    shared: Arc<UploadShared>,
    pool: Arc<FileBufferPool>,
    executor: Arc<UploadExecutor>,
    config: WriterConfig,
    upload_id: Option<String>,
    /// Part number of the next buffer to allocate
    cur_part_num: u32,
    bytes_appended: u64,
    pending_buf: Option<FileBuffer>,
    opened: bool,
    closed: bool,
    finalized: bool,
    outcome: Option<Outcome>,
}

impl S3FileWriter {
    /// Create a writer for `bucket/key`. Nothing is sent until `open` or the
    /// first append.
    pub fn new(
        client: Arc<dyn ObjectStoreClient>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        pool: Arc<FileBufferPool>,
        executor: Arc<UploadExecutor>,
        config: WriterConfig,
    ) -> Self {
        let bucket = bucket.into();
        let key = key.into();
        let path = format!("s3://{}/{}", bucket, key);

        Self {
            shared: Arc::new(UploadShared {
                client,
                bucket,
                key,
                path,
                wait_warn_interval: config.wait_warn_interval,
                failed: AtomicBool::new(false),
                state: Mutex::new(UploadState::default()),
                wait: WaitGroup::new(),
            }),
            pool,
            executor,
            config,
            upload_id: None,
            cur_part_num: 1,
            bytes_appended: 0,
            pending_buf: None,
            opened: false,
            closed: false,
            finalized: false,
            outcome: None,
        }
    }

    /// Initiate the multipart upload
    pub async fn open(&mut self) -> Result<()> {
        if self.opened {
            return Err(self.invalid_state("already opened"));
        }
        if self.closed {
            return Err(self.invalid_state("open after close"));
        }

        let upload_id = self
            .shared
            .client
            .create_multipart_upload(&self.shared.bucket, &self.shared.key, self.config.content_type.as_deref())
            .await
            .map_err(|source| S3StreamError::InitiateFailed {
                bucket: self.shared.bucket.clone(),
                key: self.shared.key.clone(),
                source,
            })?;

        debug!("Opened {} with upload_id={}", self.shared.path, upload_id);
        self.upload_id = Some(upload_id);
        self.opened = true;
        self.closed = false;
        Ok(())
    }

    /// Append slices as one contiguous byte stream.
    ///
    /// Waits only when the buffer pool is exhausted. Part upload failures
    /// surface from `close`.
    pub async fn appendv(&mut self, slices: &[&[u8]]) -> Result<()> {
        if self.closed {
            return Err(self.invalid_state("append after close"));
        }
        let total: usize = slices.iter().map(|s| s.len()).sum();
        if total == 0 {
            return Ok(());
        }
        if self.finalized {
            return Err(S3StreamError::Internal {
                message: format!(
                    "append to {} after finalize would leave a short part in the middle",
                    self.shared.path
                ),
            });
        }
        if !self.opened {
            self.open().await?;
        }

        for slice in slices {
            let mut data: &[u8] = slice;
            while !data.is_empty() {
                let mut buf = match self.pending_buf.take() {
                    Some(buf) => buf,
                    None => self.allocate_buffer().await?,
                };

                let n = buf.remaining().min(data.len());
                buf.append_data(&data[..n])?;
                self.bytes_appended += n as u64;
                data = &data[n..];

                if buf.is_full() {
                    self.submit_buffer(buf)?;
                } else {
                    self.pending_buf = Some(buf);
                }
            }
        }
        Ok(())
    }

    /// Append one slice
    pub async fn append(&mut self, data: &[u8]) -> Result<()> {
        self.appendv(&[data]).await
    }

    /// Submit the partial buffer, if any, as the last part.
    ///
    /// Does not wait and does not complete the upload.
    pub async fn finalize(&mut self) -> Result<()> {
        if self.closed {
            return Err(self.invalid_state("finalize after close"));
        }
        if let Some(buf) = self.pending_buf.take() {
            self.submit_buffer(buf)?;
        }
        self.finalized = true;
        Ok(())
    }

    /// Flush, wait for all parts and complete the upload.
    ///
    /// A second call returns ok without talking to the remote.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let start = Instant::now();
        if let Some(buf) = self.pending_buf.take() {
            if let Err(e) = self.submit_buffer(buf) {
                debug!("Last part of {} was not submitted: {}", self.shared.path, e);
            }
        }
        let result = self.complete().await;
        standard::CLOSE_DURATION.observe_since(start);

        if let Err(e) = &result {
            warn!("Close of {} failed: {}", self.shared.path, e);
        }
        result
    }

    async fn complete(&mut self) -> Result<()> {
        if self.shared.is_failed() {
            return Err(self.shared.failure());
        }

        self.shared.wait_for_uploads("Close").await;
        // A part may have failed while we waited
        if self.shared.is_failed() {
            return Err(self.shared.failure());
        }

        let submitted = self.cur_part_num - 1;
        if submitted == 0 {
            return self.put_empty_object().await;
        }

        let upload_id = self.upload_id.clone().ok_or_else(|| S3StreamError::Internal {
            message: format!("{} has parts but no upload id", self.shared.path),
        })?;

        let (parts, bytes_written) = {
            let mut state = self.shared.state.lock();
            state.parts.sort_by_key(|p| p.part_number);
            (state.parts.clone(), state.bytes_written)
        };

        let contiguous = parts.len() == submitted as usize
            && parts.iter().zip(1..).all(|(p, expected)| p.part_number == expected);
        if !contiguous || bytes_written != self.bytes_appended {
            let err = S3StreamError::Internal {
                message: format!(
                    "{} has {} of {} parts and {} of {} bytes uploaded",
                    self.shared.path,
                    parts.len(),
                    submitted,
                    bytes_written,
                    self.bytes_appended
                ),
            };
            self.shared.record_failure(err.clone());
            return Err(err);
        }

        if let Err(source) = self
            .shared
            .client
            .complete_multipart_upload(&self.shared.bucket, &self.shared.key, &upload_id, &parts)
            .await
        {
            let err = S3StreamError::CompleteFailed {
                bucket: self.shared.bucket.clone(),
                key: self.shared.key.clone(),
                upload_id,
                source,
            };
            self.shared.record_failure(err.clone());
            return Err(err);
        }

        self.outcome = Some(Outcome::Completed);
        standard::UPLOADS_COMPLETED.inc();
        info!(
            "Completed {} ({} parts, {} bytes)",
            self.shared.path, submitted, self.bytes_appended
        );
        Ok(())
    }

    /// Zero bytes were written: drop the multipart upload and store an
    /// empty object instead, since Complete needs at least one part.
    async fn put_empty_object(&mut self) -> Result<()> {
        if let Some(upload_id) = &self.upload_id {
            if let Err(e) = self.shared.abort_remote(upload_id).await {
                warn!("Failed to abort unused upload for {}: {}", self.shared.path, e);
            }
        }

        self.shared
            .client
            .put_object(
                &self.shared.bucket,
                &self.shared.key,
                bytes::Bytes::new(),
                self.config.content_type.as_deref(),
            )
            .await
            .map_err(|source| {
                let err = S3StreamError::PutObjectFailed {
                    bucket: self.shared.bucket.clone(),
                    key: self.shared.key.clone(),
                    source,
                };
                self.shared.record_failure(err.clone());
                err
            })?;

        self.outcome = Some(Outcome::Completed);
        standard::UPLOADS_COMPLETED.inc();
        info!("Completed {} as an empty object", self.shared.path);
        Ok(())
    }

    /// Cancel the upload and discard its parts.
    ///
    /// Marks the writer failed, so a later `close` publishes nothing. No
    /// remote traffic when the writer never opened or already finished.
    /// Still sends Abort after a failed `close`.
    pub async fn abort(&mut self) -> Result<()> {
        if self.outcome == Some(Outcome::Completed) {
            return Ok(());
        }
        self.shared.record_failure(S3StreamError::Cancelled {
            path: self.shared.path.clone(),
        });
        if !self.opened || self.outcome.is_some() {
            return Ok(());
        }
        self.closed = true;
        self.pending_buf = None;

        self.shared.wait_for_uploads("Abort").await;

        let upload_id = self.upload_id.clone().ok_or_else(|| S3StreamError::Internal {
            message: format!("{} is open without an upload id", self.shared.path),
        })?;
        self.shared.abort_remote(&upload_id).await?;

        self.outcome = Some(Outcome::Aborted);
        standard::UPLOADS_ABORTED.inc();
        info!("Aborted {} (upload_id={})", self.shared.path, upload_id);
        Ok(())
    }

    async fn allocate_buffer(&mut self) -> Result<FileBuffer> {
        if self.cur_part_num > self.config.max_parts {
            let err = S3StreamError::TooManyParts {
                bucket: self.shared.bucket.clone(),
                key: self.shared.key.clone(),
                max_parts: self.config.max_parts,
            };
            warn!("{}", err);
            self.shared.record_failure(err.clone());
            return Err(err);
        }
        let upload_id = self.upload_id.clone().ok_or_else(|| S3StreamError::Internal {
            message: format!("buffer requested for {} before open", self.shared.path),
        })?;

        let mut buf = self.pool.allocate().await?;
        buf.set_file_offset(self.bytes_appended);

        let part_num = self.cur_part_num;
        let shared = self.shared.clone();
        buf.set_upload_remote_callback(move |part| Box::pin(shared.upload_one_part(upload_id, part_num, part)));

        let shared = self.shared.clone();
        buf.set_finish_upload(move || shared.wait.done());

        let shared = self.shared.clone();
        buf.set_is_cancel(move || shared.is_failed());

        let shared = self.shared.clone();
        buf.set_on_failed(move |err| shared.record_failure(err));

        Ok(buf)
    }

    fn submit_buffer(&mut self, buf: FileBuffer) -> Result<()> {
        let part_num = self.cur_part_num;
        self.shared.wait.add();
        self.cur_part_num += 1;

        debug!(
            "Submitting part {} of {} ({} bytes)",
            part_num,
            self.shared.path,
            buf.size()
        );
        buf.submit(&self.executor).map_err(|e| {
            self.shared.record_failure(e.clone());
            e
        })
    }

    fn invalid_state(&self, message: &str) -> S3StreamError {
        S3StreamError::InvalidState {
            path: self.shared.path.clone(),
            message: message.into(),
        }
    }

    /// `s3://bucket/key`
    pub fn path(&self) -> &str {
        &self.shared.path
    }

    pub fn bucket(&self) -> &str {
        &self.shared.bucket
    }

    pub fn key(&self) -> &str {
        &self.shared.key
    }

    /// Upload id issued by Initiate
    pub fn upload_id(&self) -> Option<&str> {
        self.upload_id.as_deref()
    }

    /// Bytes passed to `appendv`
    pub fn bytes_appended(&self) -> u64 {
        self.bytes_appended
    }

    /// Bytes acknowledged by successful part uploads
    pub fn bytes_written(&self) -> u64 {
        self.shared.bytes_written()
    }

    /// Parts submitted to the executor so far
    pub fn parts_submitted(&self) -> u32 {
        self.cur_part_num - 1
    }

    /// Part uploads still in flight
    pub fn inflight_parts(&self) -> usize {
        self.shared.wait.count()
    }

    pub fn is_opened(&self) -> bool {
        self.opened
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_failed(&self) -> bool {
        self.shared.is_failed()
    }

    /// First recorded failure
    pub fn status(&self) -> Option<S3StreamError> {
        self.shared.state.lock().status.clone()
    }
}

impl Drop for S3FileWriter {
    fn drop(&mut self) {
        if !self.opened || self.outcome.is_some() {
            return;
        }
        let Some(upload_id) = self.upload_id.clone() else {
            return;
        };

        self.shared.record_failure(S3StreamError::Cancelled {
            path: self.shared.path.clone(),
        });
        self.pending_buf = None;
        warn!(
            "Writer for {} dropped before close or abort, aborting upload {} in the background",
            self.shared.path, upload_id
        );

        let shared = self.shared.clone();
        self.executor.spawn_cleanup(async move {
            shared.wait_for_uploads("Background abort").await;
            match shared.abort_remote(&upload_id).await {
                Ok(()) => {
                    standard::UPLOADS_ABORTED.inc();
                    info!("Aborted {} (upload_id={})", shared.path, upload_id);
                }
                Err(e) => error!("Background abort of {} failed: {}", shared.path, e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_config_validation() {
        let config = WriterConfig::default();
        assert!(config.validate(MIN_PART_SIZE).is_ok());
        assert!(config.validate(MIN_PART_SIZE - 1).is_err());
        assert!(config.validate(MAX_PART_SIZE + 1).is_err());

        let config = WriterConfig {
            max_parts: 0,
            ..Default::default()
        };
        assert!(config.validate(MIN_PART_SIZE).is_err());

        let config = WriterConfig {
            max_parts: MAX_PARTS + 1,
            ..Default::default()
        };
        assert!(config.validate(MIN_PART_SIZE).is_err());

        let config = WriterConfig {
            wait_warn_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(MIN_PART_SIZE),
            Err(S3StreamError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_small_parts_allowed_when_minimum_lowered() {
        let config = WriterConfig {
            min_part_size: 16,
            ..Default::default()
        };
        assert!(config.validate(16).is_ok());
    }
}
