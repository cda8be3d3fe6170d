//! Pluggable bucket/object storage for Stashbox.
//!
//! This crate provides a trait-based interface over storage backends (local
//! filesystem, Google Cloud Storage) and a provider registry that selects the
//! active backend at runtime.
//!
//! # Design Principles
//! - Provider isolation: callers only see buckets, objects and byte streams
//! - Async operations: all I/O is async on tokio
//! - One open resource per object handle: opening a stream closes the last
//! - Unified error semantics: consistent error kinds across providers

pub mod facade;
pub mod gcs;
pub mod local;
pub mod provider;
pub mod registry;

pub use facade::Storage;
pub use gcs::{GcsConfig, GcsProvider};
pub use local::LocalProvider;
pub use provider::{BucketHandle, ObjectHandle, ReadStream, StorageProvider, WriteStream};
pub use registry::{create_default_registry, ProviderConfig, ProviderFactory, ProviderRegistry};
pub use tokio_util::sync::CancellationToken;
