//! Common utilities and types shared across Stashbox crates.
//!
//! Provides the error taxonomy used by every storage provider and the
//! provider type tag used by the registry.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::ProviderType;
