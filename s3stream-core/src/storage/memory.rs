//! In-process object store
//!
//! Enforces the multipart rules S3 applies (part number range, Content-MD5,
//! ascending part lists with matching etags, minimum non-final part size)
//! and supports fault injection and inspection. Used by tests and dry runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use md5::{Digest, Md5};
use parking_lot::Mutex;

use super::client::{content_md5, CompletedPart, ObjectStoreClient, RemoteResult, UploadPartRequest};
use crate::error::RemoteError;
use crate::{MAX_PARTS, MIN_PART_SIZE};

/// Requests received per operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestCounts {
    pub initiate: usize,
    pub upload_part: usize,
    pub complete: usize,
    pub abort: usize,
    pub put_object: usize,
}

impl RequestCounts {
    /// Sum over all operations
    pub fn total(&self) -> usize {
        self.initiate + self.upload_part + self.complete + self.abort + self.put_object
    }
}

struct StoredPart {
    etag: String,
    data: Bytes,
}

struct PendingUpload {
    bucket: String,
    key: String,
    content_type: Option<String>,
    parts: BTreeMap<u32, StoredPart>,
}

struct StoredObject {
    data: Bytes,
    /// Empty for objects stored with a single put
    part_sizes: Vec<usize>,
    content_type: Option<String>,
}

#[derive(Default)]
struct Faults {
    initiate: Option<RemoteError>,
    parts: HashMap<u32, RemoteError>,
    complete: Option<RemoteError>,
    abort: Option<RemoteError>,
}

#[derive(Default)]
struct StoreState {
    objects: HashMap<(String, String), StoredObject>,
    uploads: HashMap<String, PendingUpload>,
    faults: Faults,
    counts: RequestCounts,
    last_complete: Option<Vec<u32>>,
    part_delay: Duration,
    part_delays: HashMap<u32, Duration>,
}

/// Object store held entirely in memory
pub struct InMemoryObjectStore {
    state: Mutex<StoreState>,
    min_part_size: usize,
    next_upload: AtomicU64,
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryObjectStore {
    /// Store with the standard 5 MiB minimum part size
    pub fn new() -> Self {
        Self::with_min_part_size(MIN_PART_SIZE)
    }

    /// Store with a custom minimum size for non-final parts
    pub fn with_min_part_size(min_part_size: usize) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            min_part_size,
            next_upload: AtomicU64::new(1),
        }
    }

    // ========== Fault injection ==========

    /// Fail every upload of `part_number` with `status`
    pub fn fail_part(&self, part_number: u32, status: u16) {
        self.state
            .lock()
            .faults
            .parts
            .insert(part_number, injected(status, None));
    }

    /// Fail InitiateMultipartUpload with `status`
    pub fn fail_initiate(&self, status: u16) {
        self.state.lock().faults.initiate = Some(injected(status, None));
    }

    /// Fail CompleteMultipartUpload with `status`
    pub fn fail_complete(&self, status: u16) {
        self.state.lock().faults.complete = Some(injected(status, None));
    }

    /// Fail AbortMultipartUpload with `status` and an optional S3 code
    pub fn fail_abort(&self, status: u16, code: Option<&str>) {
        self.state.lock().faults.abort = Some(injected(status, code));
    }

    /// Remove all injected faults
    pub fn clear_faults(&self) {
        self.state.lock().faults = Faults::default();
    }

    /// Delay every UploadPart by `delay`
    pub fn set_part_delay(&self, delay: Duration) {
        self.state.lock().part_delay = delay;
    }

    /// Delay uploads of one part number, overriding the global delay
    pub fn delay_part(&self, part_number: u32, delay: Duration) {
        self.state.lock().part_delays.insert(part_number, delay);
    }

    // ========== Inspection ==========

    /// Contents of a stored object
    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.state
            .lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.data.clone())
    }

    /// Whether an object is visible at `bucket/key`
    pub fn object_exists(&self, bucket: &str, key: &str) -> bool {
        self.object(bucket, key).is_some()
    }

    /// Sizes of the parts a multipart object was assembled from
    pub fn object_part_sizes(&self, bucket: &str, key: &str) -> Option<Vec<usize>> {
        self.state
            .lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.part_sizes.clone())
    }

    /// Content type recorded for a stored object
    pub fn object_content_type(&self, bucket: &str, key: &str) -> Option<String> {
        self.state
            .lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .and_then(|o| o.content_type.clone())
    }

    /// Part numbers sent with the last successful Complete
    pub fn last_completed_parts(&self) -> Option<Vec<u32>> {
        self.state.lock().last_complete.clone()
    }

    /// Multipart uploads initiated but neither completed nor aborted
    pub fn pending_uploads(&self) -> usize {
        self.state.lock().uploads.len()
    }

    /// Part numbers received so far for an in-progress upload
    pub fn uploaded_parts(&self, upload_id: &str) -> Vec<u32> {
        self.state
            .lock()
            .uploads
            .get(upload_id)
            .map(|u| u.parts.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Requests received so far
    pub fn request_counts(&self) -> RequestCounts {
        self.state.lock().counts.clone()
    }
}

fn injected(status: u16, code: Option<&str>) -> RemoteError {
    let code = code.unwrap_or(match status {
        404 => "NoSuchKey",
        500 => "InternalError",
        503 => "SlowDown",
        _ => "InjectedFault",
    });
    RemoteError::new(status, Some(code), "injected failure")
}

fn no_such_upload(upload_id: &str) -> RemoteError {
    RemoteError::new(
        404,
        Some("NoSuchUpload"),
        format!("The specified upload does not exist: {}", upload_id),
    )
}

fn etag_of(data: &[u8]) -> String {
    format!("\"{}\"", hex::encode(Md5::digest(data)))
}

#[async_trait]
impl ObjectStoreClient for InMemoryObjectStore {
    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
    ) -> RemoteResult<String> {
        let mut state = self.state.lock();
        state.counts.initiate += 1;
        if let Some(err) = &state.faults.initiate {
            return Err(err.clone());
        }

        let upload_id = format!("upload-{}", self.next_upload.fetch_add(1, Ordering::Relaxed));
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                content_type: content_type.map(str::to_string),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(&self, request: UploadPartRequest) -> RemoteResult<String> {
        let delay = {
            let mut state = self.state.lock();
            state.counts.upload_part += 1;
            state
                .part_delays
                .get(&request.part_number)
                .copied()
                .unwrap_or(state.part_delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if let Some(err) = state.faults.parts.get(&request.part_number) {
            return Err(err.clone());
        }
        if !(1..=MAX_PARTS).contains(&request.part_number) {
            return Err(RemoteError::new(
                400,
                Some("InvalidArgument"),
                format!("Part number must be between 1 and {}", MAX_PARTS),
            ));
        }
        if request.content_length != request.body.len() as u64 {
            return Err(RemoteError::new(
                400,
                Some("IncompleteBody"),
                "Content-Length does not match the body",
            ));
        }
        if content_md5(&request.body) != request.content_md5 {
            return Err(RemoteError::new(
                400,
                Some("BadDigest"),
                "The Content-MD5 you specified did not match what was received",
            ));
        }

        let upload = match state.uploads.get_mut(&request.upload_id) {
            Some(upload) if upload.bucket == request.bucket && upload.key == request.key => upload,
            _ => return Err(no_such_upload(&request.upload_id)),
        };

        let etag = etag_of(&request.body);
        // Copy so the caller's buffer memory is not pinned by the store
        upload.parts.insert(
            request.part_number,
            StoredPart {
                etag: etag.clone(),
                data: Bytes::copy_from_slice(&request.body),
            },
        );
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> RemoteResult<()> {
        let mut state = self.state.lock();
        state.counts.complete += 1;
        if let Some(err) = &state.faults.complete {
            return Err(err.clone());
        }

        let upload = match state.uploads.get(upload_id) {
            Some(upload) if upload.bucket == bucket && upload.key == key => upload,
            _ => return Err(no_such_upload(upload_id)),
        };

        if parts.is_empty() {
            return Err(RemoteError::new(
                400,
                Some("MalformedXML"),
                "You must specify at least one part",
            ));
        }
        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(RemoteError::new(
                400,
                Some("InvalidPartOrder"),
                "The list of parts was not in ascending order",
            ));
        }

        let mut data = BytesMut::new();
        let mut part_sizes = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let stored = match upload.parts.get(&part.part_number) {
                Some(stored) if stored.etag == part.etag => stored,
                _ => {
                    return Err(RemoteError::new(
                        400,
                        Some("InvalidPart"),
                        format!("Part {} was not uploaded or its etag does not match", part.part_number),
                    ))
                }
            };
            if i + 1 < parts.len() && stored.data.len() < self.min_part_size {
                return Err(RemoteError::new(
                    400,
                    Some("EntityTooSmall"),
                    format!(
                        "Part {} is {} bytes, below the minimum of {}",
                        part.part_number,
                        stored.data.len(),
                        self.min_part_size
                    ),
                ));
            }
            data.extend_from_slice(&stored.data);
            part_sizes.push(stored.data.len());
        }

        let content_type = upload.content_type.clone();
        state.uploads.remove(upload_id);
        state.last_complete = Some(parts.iter().map(|p| p.part_number).collect());
        state.objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data: data.freeze(),
                part_sizes,
                content_type,
            },
        );
        Ok(())
    }

    async fn abort_multipart_upload(&self, _bucket: &str, _key: &str, upload_id: &str) -> RemoteResult<()> {
        let mut state = self.state.lock();
        state.counts.abort += 1;
        if let Some(err) = &state.faults.abort {
            return Err(err.clone());
        }

        match state.uploads.remove(upload_id) {
            Some(_) => Ok(()),
            None => Err(no_such_upload(upload_id)),
        }
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> RemoteResult<String> {
        let mut state = self.state.lock();
        state.counts.put_object += 1;

        let etag = etag_of(&body);
        state.objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data: Bytes::copy_from_slice(&body),
                part_sizes: Vec::new(),
                content_type: content_type.map(str::to_string),
            },
        );
        Ok(etag)
    }
}
