//! Object store protocol used by the multipart writer
//!
//! Initiate, UploadPart, Complete and Abort, plus a single-request put for
//! objects that never got a part.

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use md5::{Digest, Md5};

use crate::error::RemoteError;

/// Result of a single remote call
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// One UploadPart call
#[derive(Debug, Clone)]
pub struct UploadPartRequest {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    /// 1-based part number
    pub part_number: u32,
    pub body: Bytes,
    pub content_length: u64,
    /// Base64 MD5 of `body`
    pub content_md5: String,
}

/// A part acknowledged by the remote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// S3-compatible multipart upload API
#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    /// Start a multipart upload and return its upload id
    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
    ) -> RemoteResult<String>;

    /// Upload one part and return its etag
    async fn upload_part(&self, request: UploadPartRequest) -> RemoteResult<String>;

    /// Assemble the object from parts listed in ascending part-number order
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> RemoteResult<()>;

    /// Discard an upload and its parts
    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> RemoteResult<()>;

    /// Store a whole object in one request and return its etag
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> RemoteResult<String>;
}

/// Base64-encoded MD5 digest, the value of a `Content-MD5` header
pub fn content_md5(data: &[u8]) -> String {
    general_purpose::STANDARD.encode(Md5::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_md5() {
        // RFC 1864 style values
        assert_eq!(content_md5(b""), "1B2M2Y8AsgTpgAmY7PhCfg==");
        assert_eq!(content_md5(b"hello world"), "XrY7u+Ae7tCTyyK7j1rNww==");
    }
}
