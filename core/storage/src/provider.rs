//! Storage provider, bucket and object handle traits.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use stashbox_common::Result;

/// Byte stream returned by [`ObjectHandle::new_reader`].
pub type ReadStream = dyn AsyncRead + Send + Unpin;

/// Byte sink returned by [`ObjectHandle::new_writer`].
pub type WriteStream = dyn AsyncWrite + Send + Unpin;

/// A storage backend (local filesystem, Google Cloud Storage, ...).
///
/// Providers are cheap to share: bucket handles created from a provider keep
/// whatever client state they need, so a provider may be swapped out of the
/// registry while older handles keep working against it.
pub trait StorageProvider: Send + Sync {
    /// Get the provider name (e.g., "local", "gcs").
    fn name(&self) -> &str;

    /// Get a handle to the bucket with the given name.
    ///
    /// No existence check is performed; a missing bucket surfaces on the
    /// first object operation.
    fn bucket(&self, name: &str) -> Box<dyn BucketHandle>;
}

/// A named container of objects.
pub trait BucketHandle: Send + Sync {
    /// Bucket name as given by the caller.
    fn name(&self) -> &str;

    /// Get a handle to an object in this bucket.
    fn object(&self, name: &str) -> Box<dyn ObjectHandle>;
}

/// A named blob within a bucket.
///
/// The handle owns at most one open resource (a reader or a writer) at a
/// time. Opening a new reader or writer first closes the previous resource,
/// and the returned stream borrows the handle, so a stream cannot outlive the
/// next open or `close`.
///
/// State machine: `Idle -> ReaderOpen | WriterOpen` on a successful open;
/// back to `Idle` on `close` or on the implicit close of the next open.
#[async_trait]
pub trait ObjectHandle: Send {
    /// Name of the bucket this object belongs to.
    fn bucket(&self) -> &str;

    /// Object name as given by the caller.
    fn name(&self) -> &str;

    /// Close the open resource, if any.
    ///
    /// # Postconditions
    /// - Handle is idle
    /// - For writers, the written data is committed to the backend
    ///
    /// # Errors
    /// - Flush or upload failures of an open writer
    async fn close(&mut self) -> Result<()>;

    /// Open the object for reading.
    ///
    /// # Errors
    /// - `NotFound` if the object does not exist
    /// - I/O, network, or authentication errors
    async fn new_reader(&mut self, ctx: &CancellationToken) -> Result<&mut ReadStream>;

    /// Open the object for writing, replacing any existing content.
    ///
    /// Completion may only be reported by [`ObjectHandle::close`].
    async fn new_writer(&mut self, ctx: &CancellationToken) -> Result<&mut WriteStream>;
}
