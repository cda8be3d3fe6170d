//! Local filesystem storage provider.
//!
//! Buckets are directories and objects are files inside them. Names are
//! joined onto the provider root without normalization, so callers must
//! trust the names they pass in.

use async_trait::async_trait;
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::provider::{BucketHandle, ObjectHandle, ReadStream, StorageProvider, WriteStream};
use stashbox_common::{Error, Result};

/// Registry id of the local provider.
pub const PROVIDER_ID: &str = "local";

/// Alias under which the local provider is the process default.
pub const DEFAULT_ALIAS: &str = "storage.default.storage";

/// Permissions for directories created on write.
#[cfg(unix)]
const DIR_MODE: u32 = 0o770;

/// Local filesystem storage provider.
#[derive(Debug, Clone)]
pub struct LocalProvider {
    root: PathBuf,
}

impl LocalProvider {
    /// Create a provider that resolves bucket names against `root`.
    ///
    /// Absolute bucket names ignore the root. Nothing is created until the
    /// first write.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Root directory bucket names are resolved against.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Default for LocalProvider {
    fn default() -> Self {
        Self::new(".")
    }
}

impl StorageProvider for LocalProvider {
    fn name(&self) -> &str {
        PROVIDER_ID
    }

    fn bucket(&self, name: &str) -> Box<dyn BucketHandle> {
        Box::new(LocalBucket {
            name: name.to_string(),
            dir: self.root.join(name),
        })
    }
}

/// A directory of objects.
#[derive(Debug, Clone)]
pub struct LocalBucket {
    name: String,
    dir: PathBuf,
}

impl BucketHandle for LocalBucket {
    fn name(&self) -> &str {
        &self.name
    }

    fn object(&self, name: &str) -> Box<dyn ObjectHandle> {
        Box::new(LocalObject {
            bucket: self.name.clone(),
            name: name.to_string(),
            path: self.dir.join(name),
            file: None,
        })
    }
}

/// A file inside a bucket directory.
///
/// The same file slot serves readers and writers.
#[derive(Debug)]
pub struct LocalObject {
    bucket: String,
    name: String,
    path: PathBuf,
    file: Option<File>,
}

impl LocalObject {
    /// Filesystem path of the object.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Implicit close before a new open. Errors are logged, not returned.
    async fn release(&mut self) {
        if let Err(e) = self.close().await {
            warn!(path = %self.path.display(), error = %e, "Failed to close previous file");
        }
    }

    async fn create_parent(&self) -> Result<()> {
        let Some(parent) = self.path.parent() else {
            return Ok(());
        };
        if parent.as_os_str().is_empty() {
            return Ok(());
        }

        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(DIR_MODE);
        builder.create(parent).await?;
        Ok(())
    }

    fn not_found(&self) -> Error {
        Error::NotFound(format!("Object not found: {}", self.path.display()))
    }
}

#[async_trait]
impl ObjectHandle for LocalObject {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            // tokio completes writes in the background; flush before drop
            file.flush().await?;
            debug!(path = %self.path.display(), "Closed file");
        }
        Ok(())
    }

    async fn new_reader(&mut self, _ctx: &CancellationToken) -> Result<&mut ReadStream> {
        // The file may still vanish between this check and the open below.
        if let Err(e) = fs::metadata(&self.path).await {
            return Err(match e.kind() {
                ErrorKind::NotFound => self.not_found(),
                _ => Error::Io(e),
            });
        }

        self.release().await;

        let file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(self.not_found()),
            Err(e) => return Err(Error::Io(e)),
        };
        debug!(path = %self.path.display(), "Opened file for reading");

        let reader: &mut ReadStream = self.file.insert(file);
        Ok(reader)
    }

    async fn new_writer(&mut self, _ctx: &CancellationToken) -> Result<&mut WriteStream> {
        self.create_parent().await?;

        self.release().await;

        let file = File::create(&self.path).await?;
        debug!(path = %self.path.display(), "Opened file for writing");

        let writer: &mut WriteStream = self.file.insert(file);
        Ok(writer)
    }
}

/// Create a local provider from registry settings.
///
/// Accepts `null` or `{ "root": "<dir>" }`.
pub fn create_local_provider(settings: Value) -> Result<Arc<dyn StorageProvider>> {
    let provider = match settings.get("root") {
        None | Some(Value::Null) => LocalProvider::default(),
        Some(Value::String(root)) => LocalProvider::new(root),
        Some(other) => {
            return Err(Error::Configuration(format!(
                "Local provider 'root' must be a string, got {}",
                other
            )))
        }
    };
    Ok(Arc::new(provider))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    async fn write_object(obj: &mut dyn ObjectHandle, data: &[u8]) {
        let ctx = CancellationToken::new();
        let writer = obj.new_writer(&ctx).await.unwrap();
        writer.write_all(data).await.unwrap();
        obj.close().await.unwrap();
    }

    async fn read_object(obj: &mut dyn ObjectHandle) -> Vec<u8> {
        let ctx = CancellationToken::new();
        let reader = obj.new_reader(&ctx).await.unwrap();
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await.unwrap();
        obj.close().await.unwrap();
        data
    }

    #[tokio::test]
    async fn test_local_write_then_read() {
        let temp = TempDir::new().unwrap();
        let bucket_dir = temp.path().join("b");
        let provider = LocalProvider::default();
        let bucket = provider.bucket(bucket_dir.to_str().unwrap());

        let mut obj = bucket.object("f.txt");
        write_object(obj.as_mut(), b"hello").await;

        let mut fresh = bucket.object("f.txt");
        assert_eq!(read_object(fresh.as_mut()).await, b"hello");
    }

    #[tokio::test]
    async fn test_local_writer_creates_parent_dirs() {
        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::new(temp.path());
        let bucket = provider.bucket("a/b/c");
        let mut obj = bucket.object("nested/file.bin");

        write_object(obj.as_mut(), &[1, 2, 3]).await;

        let path = temp.path().join("a/b/c/nested/file.bin");
        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_created_dirs_use_group_mode() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::new(temp.path());
        let mut obj = provider.bucket("fresh").object("f.txt");
        write_object(obj.as_mut(), b"x").await;

        let mode = std::fs::metadata(temp.path().join("fresh"))
            .unwrap()
            .permissions()
            .mode();
        // umask may clear bits but never adds "other" permissions
        assert_eq!(mode & 0o007, 0);
    }

    #[tokio::test]
    async fn test_local_reader_missing_object() {
        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::new(temp.path());
        let mut obj = provider.bucket("b").object("missing.txt");

        let ctx = CancellationToken::new();
        let err = obj.new_reader(&ctx).await.err().unwrap();
        assert!(err.is_not_found());
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_local_close_without_resource() {
        let provider = LocalProvider::default();
        let mut obj = provider.bucket("never").object("opened");

        obj.close().await.unwrap();
        obj.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_local_second_writer_replaces_first() {
        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::new(temp.path());
        let mut obj = provider.bucket("b").object("f.txt");
        let ctx = CancellationToken::new();

        let first = obj.new_writer(&ctx).await.unwrap();
        first.write_all(b"first version").await.unwrap();

        let second = obj.new_writer(&ctx).await.unwrap();
        second.write_all(b"second").await.unwrap();
        obj.close().await.unwrap();

        let mut fresh = provider.bucket("b").object("f.txt");
        assert_eq!(read_object(fresh.as_mut()).await, b"second");
    }

    #[tokio::test]
    async fn test_local_reader_after_writer_sees_flushed_data() {
        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::new(temp.path());
        let mut obj = provider.bucket("b").object("f.txt");
        let ctx = CancellationToken::new();

        let writer = obj.new_writer(&ctx).await.unwrap();
        writer.write_all(b"implicitly closed").await.unwrap();

        // Opening the reader closes the writer first.
        assert_eq!(read_object(obj.as_mut()).await, b"implicitly closed");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_failed_reader_keeps_open_writer() {
        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::new(temp.path());
        let bucket = provider.bucket("b");
        let ctx = CancellationToken::new();

        let mut obj = bucket.object("f.txt");
        let writer = obj.new_writer(&ctx).await.unwrap();
        writer.write_all(b"kept").await.unwrap();

        std::fs::remove_file(temp.path().join("b/f.txt")).unwrap();
        let err = obj.new_reader(&ctx).await.err().unwrap();
        assert!(err.is_not_found());

        // The writer was still open, so close flushes without error.
        obj.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_absolute_bucket_ignores_root() {
        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::new("/nonexistent/root");
        let bucket_dir = temp.path().join("abs");
        let bucket = provider.bucket(bucket_dir.to_str().unwrap());
        assert_eq!(bucket.name(), bucket_dir.to_str().unwrap());

        let mut obj = bucket.object("x");
        assert_eq!(obj.name(), "x");
        write_object(obj.as_mut(), b"abs").await;

        assert_eq!(std::fs::read(bucket_dir.join("x")).unwrap(), b"abs");
    }

    #[test]
    fn test_create_local_provider_settings() {
        let provider = create_local_provider(Value::Null).unwrap();
        assert_eq!(provider.name(), "local");

        let provider = create_local_provider(serde_json::json!({ "root": "/data" })).unwrap();
        assert_eq!(provider.name(), "local");

        let result = create_local_provider(serde_json::json!({ "root": 42 }));
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    proptest! {
        #[test]
        fn prop_close_on_fresh_handle_is_noop(
            bucket in "[a-z0-9_./-]{0,24}",
            object in "[a-z0-9_./-]{0,24}",
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let provider = LocalProvider::new("/nonexistent");
            let mut obj = provider.bucket(&bucket).object(&object);

            let result = runtime.block_on(obj.close());
            prop_assert!(result.is_ok());
        }
    }
}
