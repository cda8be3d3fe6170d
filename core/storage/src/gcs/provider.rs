//! Google Cloud Storage provider implementation.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::provider::{BucketHandle, ObjectHandle, ReadStream, StorageProvider, WriteStream};
use stashbox_common::{Error, Result};

use super::auth::Credentials;
use super::client::{ByteStream, GcsClient, DEFAULT_ENDPOINT};
use super::stream::Cancellable;
use super::upload::UploadWriter;

/// Registry id of the GCS provider.
pub const PROVIDER_ID: &str = "gcs";

/// Environment variable pointing at a GCS emulator.
pub const EMULATOR_HOST_ENV: &str = "STORAGE_EMULATOR_HOST";

/// Google Cloud Storage provider configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GcsConfig {
    /// API endpoint; falls back to `STORAGE_EMULATOR_HOST`, then production.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Explicit credentials.
    #[serde(default)]
    pub credentials: Option<Credentials>,
    /// Credentials file, used when `credentials` is not set.
    #[serde(default)]
    pub credentials_file: Option<PathBuf>,
}

impl GcsConfig {
    /// Resolve the endpoint and credentials against the environment.
    fn resolve(self) -> Result<(String, Credentials)> {
        let emulator = std::env::var(EMULATOR_HOST_ENV)
            .ok()
            .filter(|host| !host.is_empty());

        let endpoint = match (&self.endpoint, &emulator) {
            (Some(endpoint), _) => endpoint.clone(),
            (None, Some(host)) => with_scheme(host),
            (None, None) => DEFAULT_ENDPOINT.to_string(),
        };

        let credentials = if let Some(credentials) = self.credentials {
            credentials
        } else if let Some(path) = self.credentials_file {
            Credentials::from_file(path)?
        } else if self.endpoint.is_none() && emulator.is_some() {
            Credentials::Anonymous
        } else {
            Credentials::discover()?
        };

        Ok((endpoint, credentials))
    }
}

/// Emulator hosts are often given without a scheme (`localhost:4443`).
fn with_scheme(host: &str) -> String {
    if host.contains("://") {
        host.to_string()
    } else {
        format!("http://{}", host)
    }
}

/// Google Cloud Storage provider.
///
/// Owns one API client shared by every bucket and object handle it creates.
pub struct GcsProvider {
    client: Arc<GcsClient>,
}

impl GcsProvider {
    /// Create a new GCS provider.
    ///
    /// # Errors
    /// - Invalid configuration
    /// - Credentials file unreadable or of an unsupported type
    pub fn new(config: GcsConfig) -> Result<Self> {
        let (endpoint, credentials) = config.resolve()?;
        let client = GcsClient::new(endpoint, credentials)?;
        info!(endpoint = client.endpoint(), "Created GCS provider");

        Ok(Self {
            client: Arc::new(client),
        })
    }

    /// Create a provider from ambient configuration only.
    pub fn from_env() -> Result<Self> {
        Self::new(GcsConfig::default())
    }

    /// The shared API client.
    pub fn client(&self) -> &GcsClient {
        &self.client
    }
}

impl StorageProvider for GcsProvider {
    fn name(&self) -> &str {
        PROVIDER_ID
    }

    fn bucket(&self, name: &str) -> Box<dyn BucketHandle> {
        Box::new(GcsBucket {
            client: self.client.clone(),
            name: name.to_string(),
        })
    }
}

/// A GCS bucket.
pub struct GcsBucket {
    client: Arc<GcsClient>,
    name: String,
}

impl BucketHandle for GcsBucket {
    fn name(&self) -> &str {
        &self.name
    }

    fn object(&self, name: &str) -> Box<dyn ObjectHandle> {
        Box::new(GcsObject {
            client: self.client.clone(),
            bucket: self.name.clone(),
            name: name.to_string(),
            reader: None,
            writer: None,
        })
    }
}

type GcsReader = Cancellable<StreamReader<ByteStream, Bytes>>;
type GcsWriter = Cancellable<UploadWriter>;

/// A GCS object.
///
/// Writers stream large objects through a resumable session; the object
/// only becomes visible once [`ObjectHandle::close`] sends the last chunk.
/// Dropping the handle with an open writer discards the data.
pub struct GcsObject {
    client: Arc<GcsClient>,
    bucket: String,
    name: String,
    // At most one of these is set.
    reader: Option<GcsReader>,
    writer: Option<GcsWriter>,
}

impl GcsObject {
    /// Implicit close before a new open. Errors are logged, not returned.
    async fn release(&mut self) {
        if let Err(e) = self.close().await {
            warn!(
                bucket = %self.bucket,
                object = %self.name,
                error = %e,
                "Failed to close previous stream"
            );
        }
    }
}

#[async_trait]
impl ObjectHandle for GcsObject {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn close(&mut self) -> Result<()> {
        if self.reader.take().is_some() {
            debug!(bucket = %self.bucket, object = %self.name, "Closed reader");
        }

        if let Some(writer) = self.writer.take() {
            let token = writer.token().clone();
            let upload = writer.into_inner();

            let stored = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(Error::Cancelled),
                result = upload.finish() => result?,
            };

            debug!(
                bucket = %stored.bucket,
                object = %stored.name,
                size = ?stored.size_bytes(),
                generation = ?stored.generation,
                "Upload completed"
            );
        }

        Ok(())
    }

    async fn new_reader(&mut self, ctx: &CancellationToken) -> Result<&mut ReadStream> {
        self.release().await;

        let stream = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(Error::Cancelled),
            result = self.client.download(&self.bucket, &self.name) => result?,
        };
        debug!(bucket = %self.bucket, object = %self.name, "Opened reader");

        let reader: &mut ReadStream = self
            .reader
            .insert(Cancellable::new(StreamReader::new(stream), ctx.clone()));
        Ok(reader)
    }

    async fn new_writer(&mut self, ctx: &CancellationToken) -> Result<&mut WriteStream> {
        self.release().await;

        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }
        debug!(bucket = %self.bucket, object = %self.name, "Opened writer");

        let upload = UploadWriter::new(self.client.clone(), &self.bucket, &self.name);
        let writer: &mut WriteStream = self.writer.insert(Cancellable::new(upload, ctx.clone()));
        Ok(writer)
    }
}

/// Create a GCS provider from registry settings.
///
/// `null` means ambient configuration; otherwise the settings must
/// deserialize into [`GcsConfig`].
pub fn create_gcs_provider(settings: Value) -> Result<Arc<dyn StorageProvider>> {
    let config: GcsConfig = if settings.is_null() {
        GcsConfig::default()
    } else {
        serde_json::from_value(settings)
            .map_err(|e| Error::Configuration(format!("Invalid GCS config: {}", e)))?
    };

    Ok(Arc::new(GcsProvider::new(config)?))
}
