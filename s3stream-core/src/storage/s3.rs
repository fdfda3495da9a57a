//! S3-compatible storage client
//!
//! Pure-Rust async client using reqwest with manual AWS SigV4 signing.
//! Implements the multipart subset the streaming writer needs.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use quick_xml::{de, se};
use reqwest::{Client, Method, Response, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::client::{content_md5, CompletedPart, ObjectStoreClient, RemoteResult, UploadPartRequest};
use super::sigv4::{self, CanonicalRequest, Credentials};
use crate::error::{RemoteError, Result, S3StreamError};

/// Configuration for S3 client
#[derive(Debug, Clone)]
pub struct S3Config {
    /// S3 endpoint URL
    pub endpoint: String,
    /// Bucket name
    pub bucket: String,
    /// AWS region
    pub region: String,
    /// Access key ID
    pub access_key_id: Option<String>,
    /// Secret access key
    pub secret_access_key: Option<String>,
    /// Session token for temporary credentials
    pub session_token: Option<String>,
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
    /// Request timeout in seconds
    pub request_timeout_secs: u64,
    /// Address buckets as `endpoint/bucket/key` instead of `bucket.endpoint/key`
    pub path_style: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9000".into(),
            bucket: "s3stream".into(),
            region: "us-east-1".into(),
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            connect_timeout_secs: 10,
            request_timeout_secs: 300,
            path_style: true,
        }
    }
}

/// S3-compatible storage client using reqwest
pub struct S3Client {
    client: Client,
    endpoint: Url,
    credentials: Option<Credentials>,
    config: S3Config,
}

impl S3Client {
    /// Create a new S3 client
    pub fn new(config: S3Config) -> Result<Self> {
        let endpoint = Url::parse(&config.endpoint).map_err(|e| S3StreamError::InvalidConfig {
            reason: format!("invalid S3 endpoint {}: {}", config.endpoint, e),
        })?;
        if endpoint.host_str().is_none() {
            return Err(S3StreamError::InvalidConfig {
                reason: format!("S3 endpoint {} has no host", config.endpoint),
            });
        }

        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(std::time::Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| S3StreamError::StorageError {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        let credentials = match (&config.access_key_id, &config.secret_access_key) {
            (Some(access_key_id), Some(secret_access_key)) => Some(Credentials {
                access_key_id: access_key_id.clone(),
                secret_access_key: secret_access_key.clone(),
                session_token: config.session_token.clone(),
            }),
            _ => None,
        };

        Ok(Self {
            client,
            endpoint,
            credentials,
            config,
        })
    }

    /// Get bucket name
    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    /// Endpoint URL as configured
    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    /// Host header value and unencoded path for an object
    fn locate(&self, bucket: &str, key: &str) -> (String, String) {
        let host = self.endpoint.host_str().unwrap_or_default();
        let host = match self.endpoint.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        let prefix = self.endpoint.path().trim_end_matches('/');

        if self.config.path_style {
            (host, format!("{}/{}/{}", prefix, bucket, key))
        } else {
            (format!("{}.{}", bucket, host), format!("{}/{}", prefix, key))
        }
    }

    /// Build URL for an object request
    fn object_url(&self, bucket: &str, key: &str, query: &[(String, String)]) -> String {
        let (host, path) = self.locate(bucket, key);
        let mut url = format!(
            "{}://{}{}",
            self.endpoint.scheme(),
            host,
            sigv4::uri_encode(&path, false)
        );
        if !query.is_empty() {
            let rendered: Vec<String> = query
                .iter()
                .map(|(k, v)| format!("{}={}", sigv4::uri_encode(k, true), sigv4::uri_encode(v, true)))
                .collect();
            url.push('?');
            url.push_str(&rendered.join("&"));
        }
        url
    }

    /// Send one request, signing it when credentials are configured.
    ///
    /// Non-2xx responses are turned into `RemoteError`s carrying the S3 code.
    async fn send(
        &self,
        method: Method,
        bucket: &str,
        key: &str,
        query: Vec<(String, String)>,
        headers: Vec<(String, String)>,
        body: Bytes,
    ) -> RemoteResult<Response> {
        let url = self.object_url(bucket, key, &query);
        let mut request = self.client.request(method.clone(), &url);
        for (name, value) in &headers {
            request = request.header(name.as_str(), value.as_str());
        }

        if let Some(credentials) = &self.credentials {
            let (host, path) = self.locate(bucket, key);
            let mut signed = headers.clone();
            signed.push(("host".into(), host));
            let payload_hash = sigv4::sha256_hex(&body);
            let canonical = CanonicalRequest {
                method: method.as_str(),
                path: &path,
                query: &query,
                headers: &signed,
                payload_hash: &payload_hash,
            };
            for (name, value) in sigv4::sign(credentials, &self.config.region, &canonical, Utc::now()).to_pairs() {
                request = request.header(name, value);
            }
        }

        let resp = request
            .body(body)
            .send()
            .await
            .map_err(|e| RemoteError::transport(format!("{} {} failed: {}", method, url, e)))?;

        if resp.status().is_success() {
            return Ok(resp);
        }

        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        Err(parse_error(status, &text))
    }
}

#[async_trait]
impl ObjectStoreClient for S3Client {
    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
    ) -> RemoteResult<String> {
        let mut headers = Vec::new();
        if let Some(content_type) = content_type {
            headers.push(("content-type".to_string(), content_type.to_string()));
        }

        let resp = self
            .send(Method::POST, bucket, key, vec![("uploads".into(), String::new())], headers, Bytes::new())
            .await?;
        let status = resp.status().as_u16();
        let body = read_text(resp).await?;

        let upload_id = de::from_str::<InitiateMultipartUploadResult>(&body)
            .map(|result| result.upload_id)
            .map_err(|e| RemoteError::new(status, None, format!("malformed InitiateMultipartUploadResult: {}", e)))?;

        debug!("Created multipart upload for {}/{}, upload_id={}", bucket, key, upload_id);
        Ok(upload_id)
    }

    async fn upload_part(&self, request: UploadPartRequest) -> RemoteResult<String> {
        let query = vec![
            ("partNumber".to_string(), request.part_number.to_string()),
            ("uploadId".to_string(), request.upload_id.clone()),
        ];
        if request.content_length != request.body.len() as u64 {
            return Err(RemoteError::transport(format!(
                "content length {} does not match a {} byte body",
                request.content_length,
                request.body.len()
            )));
        }
        // Content-Length comes from the body itself
        let headers = vec![("content-md5".to_string(), request.content_md5.clone())];

        let resp = self
            .send(Method::PUT, &request.bucket, &request.key, query, headers, request.body)
            .await?;
        let status = resp.status().as_u16();
        let etag = header_etag(&resp).ok_or_else(|| RemoteError::new(status, None, "response carries no ETag"))?;

        debug!(
            "Uploaded part {} of {}/{}, etag={}",
            request.part_number, request.bucket, request.key, etag
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
        let body = Bytes::from(complete_body(parts)?);
        let headers = vec![
            ("content-type".to_string(), "application/xml".to_string()),
            ("content-md5".to_string(), content_md5(&body)),
        ];

        let resp = self
            .send(Method::POST, bucket, key, vec![("uploadId".into(), upload_id.into())], headers, body)
            .await?;
        let status = resp.status().as_u16();
        let text = read_text(resp).await?;

        // Complete can fail after the 200 header went out
        if error_body(&text).is_some() {
            return Err(parse_error(status, &text));
        }

        debug!("Completed multipart upload {} for {}/{}", upload_id, bucket, key);
        Ok(())
    }

    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> RemoteResult<()> {
        self.send(
            Method::DELETE,
            bucket,
            key,
            vec![("uploadId".into(), upload_id.into())],
            Vec::new(),
            Bytes::new(),
        )
        .await?;

        debug!("Aborted multipart upload {} for {}/{}", upload_id, bucket, key);
        Ok(())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: Option<&str>,
    ) -> RemoteResult<String> {
        let mut headers = vec![("content-md5".to_string(), content_md5(&body))];
        if let Some(content_type) = content_type {
            headers.push(("content-type".to_string(), content_type.to_string()));
        }

        let resp = self.send(Method::PUT, bucket, key, Vec::new(), headers, body).await?;
        let etag = header_etag(&resp).unwrap_or_default();

        debug!("Put {}/{} complete, etag={}", bucket, key, etag);
        Ok(etag)
    }
}

async fn read_text(resp: Response) -> RemoteResult<String> {
    let status = resp.status().as_u16();
    resp.text()
        .await
        .map_err(|e| RemoteError::new(status, None, format!("failed to read response body: {}", e)))
}

fn header_etag(resp: &Response) -> Option<String> {
    resp.headers()
        .get("etag")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// `InitiateMultipartUploadResult` response document
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InitiateMultipartUploadResult {
    upload_id: String,
}

/// `CompleteMultipartUpload` request document
#[derive(Debug, Serialize)]
#[serde(rename = "CompleteMultipartUpload")]
struct CompleteMultipartUploadRequest<'a> {
    #[serde(rename = "Part")]
    parts: Vec<CompleteMultipartUploadRequestPart<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CompleteMultipartUploadRequestPart<'a> {
    part_number: u32,
    #[serde(rename = "ETag")]
    etag: &'a str,
}

/// S3 `<Error>` document
#[derive(Default, Debug, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct S3ErrorBody {
    code: String,
    message: String,
    request_id: String,
}

fn complete_body(parts: &[CompletedPart]) -> RemoteResult<String> {
    let request = CompleteMultipartUploadRequest {
        parts: parts
            .iter()
            .map(|part| CompleteMultipartUploadRequestPart {
                part_number: part.part_number,
                etag: &part.etag,
            })
            .collect(),
    };
    se::to_string(&request)
        .map_err(|e| RemoteError::transport(format!("failed to encode CompleteMultipartUpload: {}", e)))
}

/// The `<Error>` document in `body`, if it is one
fn error_body(body: &str) -> Option<S3ErrorBody> {
    de::from_str::<S3ErrorBody>(body)
        .ok()
        .filter(|err| !err.code.is_empty())
}

fn parse_error(status: u16, body: &str) -> RemoteError {
    let Some(err) = error_body(body) else {
        return RemoteError::new(status, None, format!("request failed with status {}", status));
    };

    let mut message = if err.message.is_empty() {
        format!("request failed with status {}", status)
    } else {
        err.message
    };
    if !err.request_id.is_empty() {
        message = format!("{} (request id {})", message, err.request_id);
    }
    RemoteError::new(status, Some(err.code.as_str()), message)
}
