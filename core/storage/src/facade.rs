//! Storage facade over the provider registry.

use std::sync::Arc;
use tracing::warn;

use crate::provider::{BucketHandle, StorageProvider};
use crate::registry::{create_default_registry, ProviderConfig, ProviderRegistry};
use stashbox_common::{Error, ProviderType, Result};

/// Id of the storage provider [`Storage::with_defaults`] activates.
pub const DEFAULT_PROVIDER: &str = crate::local::PROVIDER_ID;

/// Entry point for bucket access.
///
/// Resolves the active storage provider on every [`Storage::bucket`] call,
/// so swapping the provider affects subsequent lookups only.
#[derive(Clone)]
pub struct Storage {
    registry: Arc<ProviderRegistry>,
}

impl Storage {
    /// Create a facade over an existing registry.
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }

    /// Create a facade with the built-in providers registered and the local
    /// provider active under its default alias.
    ///
    /// # Errors
    /// - Provider registration or construction failed
    pub fn with_defaults() -> Result<Self> {
        let storage = Self::new(Arc::new(create_default_registry()?));
        storage.configure(&ProviderConfig::storage(crate::local::DEFAULT_ALIAS))?;
        Ok(storage)
    }

    /// The underlying registry.
    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Activate a storage provider.
    ///
    /// # Errors
    /// - `UnsupportedProviderType` unless `config.kind` is storage
    /// - Provider not registered or failed to construct
    pub fn configure(&self, config: &ProviderConfig) -> Result<Arc<dyn StorageProvider>> {
        if config.kind != ProviderType::STORAGE {
            return Err(Error::UnsupportedProviderType(config.kind));
        }
        self.registry.activate(config)
    }

    /// Replace the active storage provider.
    ///
    /// Handles obtained before the swap keep using the old provider. A
    /// provider id that was already built must be given the same settings.
    ///
    /// # Errors
    /// - `UnsupportedProviderType` unless `config.kind` is storage
    /// - `NoProvider` if nothing was configured yet
    /// - Provider not registered or failed to construct
    pub fn update_config(&self, config: &ProviderConfig) -> Result<Arc<dyn StorageProvider>> {
        if config.kind != ProviderType::STORAGE {
            return Err(Error::UnsupportedProviderType(config.kind));
        }
        if self.active_provider().is_none() {
            return Err(Error::NoProvider(ProviderType::STORAGE));
        }
        self.registry.activate(config)
    }

    /// The active storage provider, if any.
    pub fn active_provider(&self) -> Option<Arc<dyn StorageProvider>> {
        self.registry.active(ProviderType::STORAGE)
    }

    /// Get a bucket from the active provider.
    ///
    /// Returns `None` when no storage provider is active.
    pub fn bucket(&self, name: &str) -> Option<Box<dyn BucketHandle>> {
        match self.active_provider() {
            Some(provider) => Some(provider.bucket(name)),
            None => {
                warn!(bucket = name, "No storage provider configured");
                None
            }
        }
    }

    /// Like [`Storage::bucket`], but a missing provider is an error.
    pub fn try_bucket(&self, name: &str) -> Result<Box<dyn BucketHandle>> {
        self.active_provider()
            .map(|provider| provider.bucket(name))
            .ok_or(Error::NoProvider(ProviderType::STORAGE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalProvider;
    use crate::provider::ObjectHandle;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::sync::CancellationToken;

    fn two_local_roots(a: &TempDir, b: &TempDir) -> Storage {
        let mut registry = ProviderRegistry::new();
        let root_a = a.path().to_path_buf();
        let root_b = b.path().to_path_buf();
        registry
            .register(
                "local-a",
                ProviderType::STORAGE,
                move |_| Ok(Arc::new(LocalProvider::new(&root_a))),
            )
            .unwrap();
        registry
            .register(
                "local-b",
                ProviderType::STORAGE,
                move |_| Ok(Arc::new(LocalProvider::new(&root_b))),
            )
            .unwrap();
        Storage::new(Arc::new(registry))
    }

    async fn write(obj: &mut dyn ObjectHandle, data: &[u8]) {
        let ctx = CancellationToken::new();
        obj.new_writer(&ctx).await.unwrap().write_all(data).await.unwrap();
        obj.close().await.unwrap();
    }

    #[test]
    fn test_bucket_without_provider_is_none() {
        let storage = Storage::new(Arc::new(ProviderRegistry::new()));

        assert!(storage.bucket("b").is_none());
        assert!(matches!(
            storage.try_bucket("b"),
            Err(Error::NoProvider(kind)) if kind == ProviderType::STORAGE
        ));
    }

    #[test]
    fn test_with_defaults_uses_local() {
        let storage = Storage::with_defaults().unwrap();

        let provider = storage.active_provider().unwrap();
        assert_eq!(provider.name(), "local");

        let bucket = storage.bucket("some/dir").unwrap();
        assert_eq!(bucket.name(), "some/dir");
    }

    #[test]
    fn test_configure_rejects_other_types() {
        let storage = Storage::with_defaults().unwrap();
        let config = ProviderConfig::new("local", ProviderType::new(21));

        assert!(matches!(
            storage.configure(&config),
            Err(Error::UnsupportedProviderType(_))
        ));
        assert!(matches!(
            storage.update_config(&config),
            Err(Error::UnsupportedProviderType(_))
        ));
    }

    #[test]
    fn test_update_config_requires_active_provider() {
        let storage = Storage::new(Arc::new(create_default_registry().unwrap()));

        let result = storage.update_config(&ProviderConfig::storage("local"));
        assert!(matches!(result, Err(Error::NoProvider(_))));
    }

    #[tokio::test]
    async fn test_hot_swap_routes_new_buckets() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let storage = two_local_roots(&a, &b);

        storage.configure(&ProviderConfig::storage("local-a")).unwrap();
        let old_bucket = storage.bucket("data").unwrap();

        storage
            .update_config(&ProviderConfig::storage("local-b"))
            .unwrap();
        let new_bucket = storage.bucket("data").unwrap();

        write(old_bucket.object("f.txt").as_mut(), b"old").await;
        write(new_bucket.object("f.txt").as_mut(), b"new").await;

        assert_eq!(std::fs::read(a.path().join("data/f.txt")).unwrap(), b"old");
        assert_eq!(std::fs::read(b.path().join("data/f.txt")).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_update_config_with_new_settings_is_rejected() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let storage = Storage::new(Arc::new(create_default_registry().unwrap()));

        let settings = |dir: &TempDir| serde_json::json!({ "root": dir.path() });
        storage
            .configure(&ProviderConfig::storage("local").with_settings(settings(&a)))
            .unwrap();

        let result =
            storage.update_config(&ProviderConfig::storage("local").with_settings(settings(&b)));
        assert!(matches!(result, Err(Error::Configuration(_))));

        // The provider built for `a` stays active.
        write(storage.bucket("data").unwrap().object("f.txt").as_mut(), b"x").await;
        assert!(a.path().join("data/f.txt").exists());
        assert!(!b.path().join("data/f.txt").exists());
    }

    #[test]
    fn test_default_alias_is_local_instance() {
        let storage = Storage::with_defaults().unwrap();
        let active = storage.active_provider().unwrap();

        let local = storage
            .registry()
            .resolve("local", serde_json::Value::Null)
            .unwrap();
        assert!(Arc::ptr_eq(&active, &local));
    }

    #[tokio::test]
    async fn test_roundtrip_through_facade() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::with_defaults().unwrap();
        let bucket_dir = temp.path().join("b");
        let bucket = storage.bucket(bucket_dir.to_str().unwrap()).unwrap();

        write(bucket.object("f.txt").as_mut(), b"hello").await;

        let mut obj = bucket.object("f.txt");
        let ctx = CancellationToken::new();
        let mut data = String::new();
        obj.new_reader(&ctx)
            .await
            .unwrap()
            .read_to_string(&mut data)
            .await
            .unwrap();
        obj.close().await.unwrap();

        assert_eq!(data, "hello");
    }
}
