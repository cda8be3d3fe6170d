//! Google Cloud Storage JSON API client.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{header, Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::pin::Pin;

use stashbox_common::{Error, Result};

use super::auth::{Credentials, TokenManager};

/// Production GCS endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";

/// Payloads above this size go through a resumable upload session.
pub const SIMPLE_UPLOAD_LIMIT: usize = 8 * 1024 * 1024;

/// Chunk size for resumable uploads (must be a multiple of 256KiB).
pub const CHUNK_SIZE: usize = 4 * 256 * 1024;

/// Characters left unescaped in bucket and object path segments.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Download body stream.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Object resource returned by the JSON API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredObject {
    /// Bucket name.
    pub bucket: String,
    /// Object name.
    pub name: String,
    /// Size in bytes, as a decimal string.
    #[serde(default)]
    pub size: Option<String>,
    /// Content generation.
    #[serde(default)]
    pub generation: Option<String>,
    /// Base64 MD5 of the content.
    #[serde(default)]
    pub md5_hash: Option<String>,
    /// Last modification time.
    #[serde(default)]
    pub updated: Option<DateTime<Utc>>,
}

impl StoredObject {
    /// Get size as u64.
    pub fn size_bytes(&self) -> Option<u64> {
        self.size.as_ref().and_then(|s| s.parse().ok())
    }
}

/// Outcome of a resumable chunk upload.
#[derive(Debug)]
pub enum ChunkStatus {
    /// The session expects more data; `persisted` bytes are stored.
    Incomplete { persisted: u64 },
    /// The object is complete.
    Complete(StoredObject),
}

/// Bytes stored by a resumable session, from a 308 `Range: bytes=0-N` header.
///
/// A missing header means nothing has been persisted yet.
fn persisted_bytes(headers: &header::HeaderMap) -> Result<u64> {
    let Some(range) = headers.get(header::RANGE) else {
        return Ok(0);
    };
    range
        .to_str()
        .ok()
        .and_then(|r| r.strip_prefix("bytes=0-"))
        .and_then(|last| last.parse::<u64>().ok())
        .map(|last| last + 1)
        .ok_or_else(|| Error::Network(format!("Invalid Range header: {:?}", range)))
}

/// Google Cloud Storage API client.
pub struct GcsClient {
    http: Client,
    endpoint: String,
    token_manager: TokenManager,
}

impl GcsClient {
    /// Create a new client for `endpoint`.
    ///
    /// # Errors
    /// - HTTP client or OAuth2 client construction failed
    pub fn new(endpoint: impl Into<String>, credentials: Credentials) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("stashbox/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        let token_manager = TokenManager::new(credentials, http.clone())?;
        let endpoint = endpoint.into().trim_end_matches('/').to_string();

        Ok(Self {
            http,
            endpoint,
            token_manager,
        })
    }

    /// Base URL requests are sent to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// URL of an object resource.
    pub fn object_url(&self, bucket: &str, object: &str) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}",
            self.endpoint,
            utf8_percent_encode(bucket, PATH_SEGMENT),
            utf8_percent_encode(object, PATH_SEGMENT)
        )
    }

    /// URL objects are uploaded to.
    pub fn upload_url(&self, bucket: &str) -> String {
        format!(
            "{}/upload/storage/v1/b/{}/o",
            self.endpoint,
            utf8_percent_encode(bucket, PATH_SEGMENT)
        )
    }

    /// Attach the authorization header, if the credentials carry one.
    async fn authorize(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        match self.token_manager.get_access_token().await? {
            Some(token) => Ok(request.bearer_auth(token)),
            None => Ok(request),
        }
    }

    /// Start downloading object content.
    ///
    /// # Errors
    /// - `NotFound` if the object does not exist
    /// - Authentication and network errors
    pub async fn download(&self, bucket: &str, object: &str) -> Result<ByteStream> {
        let request = self
            .http
            .get(self.object_url(bucket, object))
            .query(&[("alt", "media")]);

        let response = self
            .authorize(request)
            .await?
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to start download: {}", e)))?;

        let response = self.check_status(response, bucket, object).await?;

        let stream = response
            .bytes_stream()
            .map(|result| result.map_err(std::io::Error::other));

        Ok(Box::pin(stream))
    }

    /// Upload a small object in a single request.
    pub async fn upload_simple(
        &self,
        bucket: &str,
        object: &str,
        data: Bytes,
    ) -> Result<StoredObject> {
        let request = self
            .http
            .post(self.upload_url(bucket))
            .query(&[("uploadType", "media"), ("name", object)])
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(data);

        let response = self
            .authorize(request)
            .await?
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to upload object: {}", e)))?;

        self.handle_response(response, bucket, object).await
    }

    /// Start a resumable upload session of unknown length, returning the
    /// session URI.
    pub async fn start_resumable_upload(&self, bucket: &str, object: &str) -> Result<String> {
        let request = self
            .http
            .post(self.upload_url(bucket))
            .query(&[("uploadType", "resumable"), ("name", object)])
            .header("X-Upload-Content-Type", "application/octet-stream")
            .body(Vec::<u8>::new());

        let response = self
            .authorize(request)
            .await?
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to start resumable upload: {}", e)))?;

        let response = self.check_status(response, bucket, object).await?;

        // Extract upload URI from Location header
        let upload_uri = response
            .headers()
            .get(header::LOCATION)
            .ok_or_else(|| Error::Network("No upload URI in response".to_string()))?
            .to_str()
            .map_err(|e| Error::Network(format!("Invalid upload URI: {}", e)))?
            .to_string();

        Ok(upload_uri)
    }

    /// Upload a chunk starting at byte `start` to a resumable session.
    ///
    /// `total` is only known for the final chunk. The server may persist
    /// less than the whole chunk, so callers resume from the reported offset.
    pub async fn upload_chunk(
        &self,
        upload_uri: &str,
        data: Bytes,
        start: u64,
        total: Option<u64>,
    ) -> Result<ChunkStatus> {
        debug_assert!(!data.is_empty());
        let end = start + data.len() as u64 - 1;
        let content_range = match total {
            Some(total) => format!("bytes {}-{}/{}", start, end, total),
            None => format!("bytes {}-{}/*", start, end),
        };

        let response = self
            .http
            .put(upload_uri)
            .header(header::CONTENT_RANGE, content_range)
            .body(data)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to upload chunk: {}", e)))?;

        let status = response.status();

        if status == StatusCode::OK || status == StatusCode::CREATED {
            let object: StoredObject = response
                .json()
                .await
                .map_err(|e| Error::Network(format!("Failed to parse upload response: {}", e)))?;
            Ok(ChunkStatus::Complete(object))
        } else if status == StatusCode::PERMANENT_REDIRECT {
            // 308 Resume Incomplete
            let persisted = persisted_bytes(response.headers())?;
            Ok(ChunkStatus::Incomplete { persisted })
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Error::Network(format!(
                "Chunk upload failed: {} - {}",
                status, body
            )))
        }
    }

    /// Map a non-success status to an error, passing successes through.
    async fn check_status(
        &self,
        response: reqwest::Response,
        bucket: &str,
        object: &str,
    ) -> Result<reqwest::Response> {
        let status = response.status();

        if status.is_success() {
            Ok(response)
        } else if status == StatusCode::NOT_FOUND {
            Err(Error::NotFound(format!("gs://{}/{}", bucket, object)))
        } else if status == StatusCode::UNAUTHORIZED {
            Err(Error::Authentication(
                "Invalid or expired token".to_string(),
            ))
        } else if status == StatusCode::FORBIDDEN {
            Err(Error::PermissionDenied(format!(
                "Access denied to gs://{}/{}",
                bucket, object
            )))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Error::Network(format!("API error: {} - {}", status, body)))
        }
    }

    /// Handle API response with error checking.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
        bucket: &str,
        object: &str,
    ) -> Result<T> {
        self.check_status(response, bucket, object)
            .await?
            .json()
            .await
            .map_err(|e| Error::Network(format!("Failed to parse response: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anonymous(endpoint: &str) -> GcsClient {
        GcsClient::new(endpoint, Credentials::Anonymous).unwrap()
    }

    #[test]
    fn test_object_url_encodes_names() {
        let client = anonymous("https://storage.googleapis.com");
        assert_eq!(
            client.object_url("my-bucket", "dir/file name.txt"),
            "https://storage.googleapis.com/storage/v1/b/my-bucket/o/dir%2Ffile%20name.txt"
        );
    }

    #[test]
    fn test_upload_url() {
        let client = anonymous("http://localhost:4443/");
        assert_eq!(client.endpoint(), "http://localhost:4443");
        assert_eq!(
            client.upload_url("bucket"),
            "http://localhost:4443/upload/storage/v1/b/bucket/o"
        );
    }

    #[test]
    fn test_stored_object_parse() {
        let object: StoredObject = serde_json::from_value(serde_json::json!({
            "kind": "storage#object",
            "bucket": "b",
            "name": "f.txt",
            "size": "12345",
            "generation": "1700000000000000",
            "md5Hash": "XUFAKrxLKna5cZ2REBfFkg==",
            "updated": "2024-01-01T00:00:00Z"
        }))
        .unwrap();

        assert_eq!(object.size_bytes(), Some(12345));
        assert_eq!(object.md5_hash.as_deref(), Some("XUFAKrxLKna5cZ2REBfFkg=="));
        assert!(object.updated.is_some());
    }

    #[test]
    fn test_stored_object_minimal() {
        let object: StoredObject =
            serde_json::from_value(serde_json::json!({ "bucket": "b", "name": "n" })).unwrap();
        assert_eq!(object.size_bytes(), None);
        assert_eq!(object.generation, None);
    }

    #[test]
    fn test_persisted_bytes_from_range() {
        let mut headers = header::HeaderMap::new();
        assert_eq!(persisted_bytes(&headers).unwrap(), 0);

        headers.insert(header::RANGE, "bytes=0-524287".parse().unwrap());
        assert_eq!(persisted_bytes(&headers).unwrap(), 524288);

        headers.insert(header::RANGE, "bytes=100-200".parse().unwrap());
        assert!(matches!(persisted_bytes(&headers), Err(Error::Network(_))));
    }

    #[tokio::test]
    async fn test_download_unreachable_endpoint() {
        // Port 9 (discard) is not served on the loopback interface in CI.
        let client = anonymous("http://127.0.0.1:9");
        let result = client.download("b", "o").await;
        assert!(matches!(result, Err(Error::Network(_))));
    }
}
