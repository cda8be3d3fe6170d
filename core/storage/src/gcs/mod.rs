//! Google Cloud Storage provider for Stashbox.
//!
//! This module provides a storage backend using the GCS JSON API with:
//! - Ambient credential discovery (credentials file, gcloud, metadata server)
//! - User refresh tokens and service account keys
//! - Emulator support through `STORAGE_EMULATOR_HOST`
//! - Streaming resumable uploads for large objects
//! - Cancellation of reads, writes and uploads through a `CancellationToken`

pub mod auth;
pub mod client;
pub mod provider;
pub mod stream;
pub mod upload;

pub use auth::{AccessToken, AuthorizedUser, Credentials, ServiceAccountKey, TokenManager};
pub use client::{ChunkStatus, GcsClient, StoredObject};
pub use provider::{
    create_gcs_provider, GcsBucket, GcsConfig, GcsObject, GcsProvider, EMULATOR_HOST_ENV,
    PROVIDER_ID,
};
pub use stream::Cancellable;
pub use upload::UploadWriter;
