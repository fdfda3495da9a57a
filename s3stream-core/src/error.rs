//! Error types for s3stream
//!
//! Error taxonomy covering remote object-store failures, writer state
//! violations, and cancellation observed by uploaders.

use std::fmt;

use thiserror::Error;

/// Coarse error classes a caller can branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A remote RPC (or local file I/O) failed
    Io,
    /// A precondition was violated or an invariant broke
    Internal,
    /// The writer failed or was aborted before the work ran
    Cancelled,
}

/// Failure reported by the object store or the transport in front of it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    /// HTTP status, when a response was received
    pub status: Option<u16>,
    /// S3 error code such as `NoSuchUpload`
    pub code: Option<String>,
    /// Human readable message from the remote or the transport
    pub message: String,
}

impl RemoteError {
    /// Create an error for a response with a status and an optional code
    pub fn new(status: u16, code: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            code: code.map(str::to_string),
            message: message.into(),
        }
    }

    /// Create an error for a request that never got a response
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: None,
            message: message.into(),
        }
    }

    /// The upload id is unknown to the remote (already completed or aborted)
    pub fn is_no_such_upload(&self) -> bool {
        self.code.as_deref() == Some("NoSuchUpload")
    }

    /// HTTP 404
    pub fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }

    /// 5xx, throttling, or no response at all
    pub fn is_retryable(&self) -> bool {
        match self.status {
            None => true,
            Some(status) => status >= 500 || status == 429,
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.code, self.status) {
            (Some(code), Some(status)) => write!(f, "{} (status {}): {}", code, status, self.message),
            (None, Some(status)) => write!(f, "status {}: {}", status, self.message),
            (Some(code), None) => write!(f, "{}: {}", code, self.message),
            (None, None) => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for RemoteError {}

/// Primary error type for all s3stream operations
#[derive(Debug, Clone, Error)]
pub enum S3StreamError {
    // ========== Remote Errors ==========

    /// InitiateMultipartUpload failed
    #[error("failed to create multipart upload (bucket={bucket}, key={key}): {source}")]
    InitiateFailed {
        bucket: String,
        key: String,
        #[source]
        source: RemoteError,
    },

    /// UploadPart failed
    #[error("failed to upload part (bucket={bucket}, key={key}, part_num={part_num}, upload_id={upload_id}): {source}")]
    UploadPartFailed {
        bucket: String,
        key: String,
        part_num: u32,
        upload_id: String,
        #[source]
        source: RemoteError,
    },

    /// CompleteMultipartUpload failed
    #[error("failed to complete multipart upload (bucket={bucket}, key={key}, upload_id={upload_id}): {source}")]
    CompleteFailed {
        bucket: String,
        key: String,
        upload_id: String,
        #[source]
        source: RemoteError,
    },

    /// AbortMultipartUpload failed with something other than not-found
    #[error("failed to abort multipart upload (bucket={bucket}, key={key}, upload_id={upload_id}): {source}")]
    AbortFailed {
        bucket: String,
        key: String,
        upload_id: String,
        #[source]
        source: RemoteError,
    },

    /// Single-request PutObject failed
    #[error("failed to put object (bucket={bucket}, key={key}): {source}")]
    PutObjectFailed {
        bucket: String,
        key: String,
        #[source]
        source: RemoteError,
    },

    /// HTTP client could not be built or a response could not be read
    #[error("Storage error: {message}")]
    StorageError { message: String },

    // ========== Writer Errors ==========

    /// The object would need more parts than the remote accepts
    #[error("too many parts for {bucket}/{key}: the remote accepts at most {max_parts} parts, raise write_buffer_size")]
    TooManyParts {
        bucket: String,
        key: String,
        max_parts: u32,
    },

    /// Operation not allowed in the writer's current state
    #[error("Invalid writer state for {path}: {message}")]
    InvalidState { path: String, message: String },

    /// Configuration rejected at construction time
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// The writer failed or was aborted, so the work was skipped
    #[error("Upload cancelled for {path}")]
    Cancelled { path: String },

    /// Local file I/O failed
    #[error("I/O error on {path}: {message}")]
    LocalIo { path: String, message: String },

    // ========== Runtime Errors ==========

    /// The process-wide buffer pool has not been initialized
    #[error("Buffer pool not initialized")]
    PoolNotInitialized,

    /// The upload executor no longer accepts work
    #[error("Upload executor is shut down")]
    ExecutorShutdown,

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl S3StreamError {
    /// Map onto the coarse error classes
    pub fn kind(&self) -> ErrorKind {
        match self {
            S3StreamError::InitiateFailed { .. }
            | S3StreamError::UploadPartFailed { .. }
            | S3StreamError::CompleteFailed { .. }
            | S3StreamError::AbortFailed { .. }
            | S3StreamError::PutObjectFailed { .. }
            | S3StreamError::StorageError { .. }
            | S3StreamError::LocalIo { .. } => ErrorKind::Io,
            S3StreamError::Cancelled { .. } => ErrorKind::Cancelled,
            S3StreamError::TooManyParts { .. }
            | S3StreamError::InvalidState { .. }
            | S3StreamError::InvalidConfig { .. }
            | S3StreamError::PoolNotInitialized
            | S3StreamError::ExecutorShutdown
            | S3StreamError::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Returns true if rebuilding the writer and retrying may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            S3StreamError::InitiateFailed { source, .. }
            | S3StreamError::UploadPartFailed { source, .. }
            | S3StreamError::CompleteFailed { source, .. }
            | S3StreamError::AbortFailed { source, .. }
            | S3StreamError::PutObjectFailed { source, .. } => source.is_retryable(),
            S3StreamError::StorageError { .. } => true,
            _ => false,
        }
    }

    /// The remote error behind this failure, if any
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            S3StreamError::InitiateFailed { source, .. }
            | S3StreamError::UploadPartFailed { source, .. }
            | S3StreamError::CompleteFailed { source, .. }
            | S3StreamError::AbortFailed { source, .. }
            | S3StreamError::PutObjectFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Result type alias for s3stream operations
pub type Result<T> = std::result::Result<T, S3StreamError>;
