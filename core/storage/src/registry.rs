//! Provider registry for dynamic provider resolution.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::info;

use crate::provider::StorageProvider;
use stashbox_common::{Error, ProviderType, Result};

/// Factory function type for creating providers from their settings.
pub type ProviderFactory = Box<dyn Fn(Value) -> Result<Arc<dyn StorageProvider>> + Send + Sync>;

/// Selects a registered provider and the settings to build it with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Registered provider id (e.g., "local", "gcs").
    pub id: String,
    /// Capability the provider is activated for.
    pub kind: ProviderType,
    /// Provider-specific settings.
    #[serde(default)]
    pub settings: Value,
}

impl ProviderConfig {
    /// Create a config for the given id and type with no settings.
    pub fn new(id: impl Into<String>, kind: ProviderType) -> Self {
        Self {
            id: id.into(),
            kind,
            settings: Value::Null,
        }
    }

    /// Create a storage provider config.
    pub fn storage(id: impl Into<String>) -> Self {
        Self::new(id, ProviderType::STORAGE)
    }

    /// Replace the provider settings.
    pub fn with_settings(mut self, settings: Value) -> Self {
        self.settings = settings;
        self
    }
}

struct Registration {
    kind: ProviderType,
    factory: ProviderFactory,
}

/// A constructed provider and the settings it was built from.
struct Instance {
    settings: Value,
    provider: Arc<dyn StorageProvider>,
}

/// Registry for storage provider factories and active providers.
///
/// Each registered provider is constructed at most once; later resolutions
/// return the cached instance. One provider per [`ProviderType`] can be
/// active at a time, and activating another one swaps it in for subsequent
/// lookups. Aliases resolve to the same instance as their target.
pub struct ProviderRegistry {
    factories: HashMap<String, Registration>,
    aliases: HashMap<String, String>,
    instances: Mutex<HashMap<String, Instance>>,
    active: RwLock<HashMap<ProviderType, Arc<dyn StorageProvider>>>,
}

impl ProviderRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            aliases: HashMap::new(),
            instances: Mutex::new(HashMap::new()),
            active: RwLock::new(HashMap::new()),
        }
    }

    /// Register a provider factory.
    ///
    /// # Preconditions
    /// - `id` must be unique within the registry
    ///
    /// # Errors
    /// - Returns error if id is already registered
    pub fn register<F>(
        &mut self,
        id: impl Into<String>,
        kind: ProviderType,
        factory: F,
    ) -> Result<()>
    where
        F: Fn(Value) -> Result<Arc<dyn StorageProvider>> + Send + Sync + 'static,
    {
        let id = id.into();
        self.ensure_unused(&id)?;
        self.factories.insert(
            id,
            Registration {
                kind,
                factory: Box::new(factory),
            },
        );
        Ok(())
    }

    /// Register `alias` as another id for the provider registered as `target`.
    ///
    /// # Errors
    /// - `AlreadyExists` if `alias` is already a provider id or alias
    /// - `NotFound` if `target` is not registered
    pub fn register_alias(
        &mut self,
        alias: impl Into<String>,
        target: impl Into<String>,
    ) -> Result<()> {
        let alias = alias.into();
        let target = target.into();
        self.ensure_unused(&alias)?;
        if !self.factories.contains_key(&target) {
            return Err(Error::NotFound(format!(
                "Provider '{}' is not registered",
                target
            )));
        }
        self.aliases.insert(alias, target);
        Ok(())
    }

    /// Resolve a provider by id or alias, constructing it on first use.
    ///
    /// Construction is serialized, so concurrent first use still builds a
    /// single instance. Later resolutions must pass the same settings the
    /// instance was built with.
    ///
    /// # Errors
    /// - Provider not registered
    /// - `Configuration` if the provider was already built with other settings
    /// - Factory failure (invalid settings, missing credentials, ...)
    pub fn resolve(&self, id: &str, settings: Value) -> Result<Arc<dyn StorageProvider>> {
        let (id, registration) = self.registration(id)?;

        let mut instances = self
            .instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(instance) = instances.get(id) {
            if instance.settings != settings {
                return Err(Error::Configuration(format!(
                    "Provider '{}' is already built with different settings",
                    id
                )));
            }
            return Ok(instance.provider.clone());
        }

        let provider = (registration.factory)(settings.clone())?;
        info!(provider = id, "Constructed storage provider");
        instances.insert(
            id.to_string(),
            Instance {
                settings,
                provider: provider.clone(),
            },
        );
        Ok(provider)
    }

    /// Make the configured provider the active one for its type.
    ///
    /// Replaces any provider previously active for the same type. Handles
    /// obtained from the previous provider stay bound to it.
    ///
    /// # Errors
    /// - Provider not registered
    /// - `UnsupportedProviderType` if the provider was registered for a
    ///   different type than `config.kind`
    /// - Factory failure
    pub fn activate(&self, config: &ProviderConfig) -> Result<Arc<dyn StorageProvider>> {
        let (_, registration) = self.registration(&config.id)?;
        if registration.kind != config.kind {
            return Err(Error::UnsupportedProviderType(config.kind));
        }

        let instance = self.resolve(&config.id, config.settings.clone())?;
        self.active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(config.kind, instance.clone());

        info!(provider = %config.id, kind = %config.kind, "Activated provider");
        Ok(instance)
    }

    /// Get the active provider for a type.
    pub fn active(&self, kind: ProviderType) -> Option<Arc<dyn StorageProvider>> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
    }

    /// Remove the active provider for a type, returning it.
    pub fn deactivate(&self, kind: ProviderType) -> Option<Arc<dyn StorageProvider>> {
        self.active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&kind)
    }

    /// Get list of registered provider ids, without aliases.
    pub fn providers(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Check if a provider id or alias is registered.
    pub fn has_provider(&self, id: &str) -> bool {
        self.factories.contains_key(id) || self.aliases.contains_key(id)
    }

    fn ensure_unused(&self, id: &str) -> Result<()> {
        if self.has_provider(id) {
            return Err(Error::AlreadyExists(format!(
                "Provider '{}' is already registered",
                id
            )));
        }
        Ok(())
    }

    /// Canonical id and registration for an id or alias.
    fn registration<'a>(&'a self, id: &'a str) -> Result<(&'a str, &'a Registration)> {
        let id = self.aliases.get(id).map(String::as_str).unwrap_or(id);
        self.factories
            .get_key_value(id)
            .map(|(id, registration)| (id.as_str(), registration))
            .ok_or_else(|| Error::NotFound(format!("Provider '{}' is not registered", id)))
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with the built-in storage providers.
///
/// Registers `local` (also reachable as `storage.default.storage`) and `gcs`
/// for [`ProviderType::STORAGE`]; none is active.
pub fn create_default_registry() -> Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();

    registry.register(
        crate::local::PROVIDER_ID,
        ProviderType::STORAGE,
        crate::local::create_local_provider,
    )?;
    registry.register_alias(crate::local::DEFAULT_ALIAS, crate::local::PROVIDER_ID)?;

    registry.register(
        crate::gcs::PROVIDER_ID,
        ProviderType::STORAGE,
        crate::gcs::create_gcs_provider,
    )?;

    Ok(registry)
}
