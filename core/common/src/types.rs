//! Common types used throughout Stashbox.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Tag identifying the capability a provider implements.
///
/// The registry keys its active providers by this tag, so a process can hold
/// one active implementation per capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderType(u16);

impl ProviderType {
    /// Bucket/object storage.
    pub const STORAGE: Self = Self(20);

    /// Create a provider type from its raw tag.
    pub const fn new(tag: u16) -> Self {
        Self(tag)
    }

    /// Get the raw tag.
    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
