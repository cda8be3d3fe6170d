//! Common error types for Stashbox.

use thiserror::Error;

use crate::types::ProviderType;

/// Top-level error type for storage operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Object or path is absent.
    #[error("Not found: {0}")]
    NotFound(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A provider was configured under a type this component does not serve.
    #[error("Unsupported provider type: {0}")]
    UnsupportedProviderType(ProviderType),

    /// No provider is active for the requested type.
    #[error("No provider configured for type {0}")]
    NoProvider(ProviderType),

    /// Provider construction or settings are invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Credentials could not be obtained or were rejected.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Access denied by the backend.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Network or remote API failure.
    #[error("Network error: {0}")]
    Network(String),

    /// The operation's cancellation token fired.
    #[error("Operation cancelled")]
    Cancelled,

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),
}

impl Error {
    /// Whether this error means the object or path does not exist.
    ///
    /// Covers both the explicit [`Error::NotFound`] kind and raw I/O errors
    /// of kind [`std::io::ErrorKind::NotFound`].
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
