//! Registry access.
//!
//! This module handles:
//! - Resolving upstream descriptors with pull credentials
//! - Copying images into the cache registry, filtered to target architectures
//! - Deleting cached images by digest
//!
//! Cache registry layout is `<cache>/<canonical upstream host>/<repository>:<tag|digest>`,
//! so images from different upstreams never share a destination.

mod auth;
mod client;
mod error;
pub mod manifest;

use async_trait::async_trait;
use bytes::Bytes;
use imagecache_pull_secrets::RegistryAuth;
use imagecache_reference::ImageReference;

pub use auth::Challenge;
pub use client::{RegistryClient, RegistryClientConfig};
pub use error::RegistryError;
pub use manifest::{Descriptor, Platform};

/// An upstream manifest as fetched, kept so the copy reuses it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteImage {
    pub descriptor: Descriptor,
    pub manifest: Bytes,
}

impl RemoteImage {
    pub fn digest(&self) -> &str {
        &self.descriptor.digest
    }
}

/// Operations the engine needs from registries.
#[async_trait]
pub trait ImageRegistry: Send + Sync {
    /// Resolve the upstream manifest of an image.
    async fn get_descriptor(
        &self,
        image: &ImageReference,
        auth: &RegistryAuth,
    ) -> Result<RemoteImage, RegistryError>;

    /// Resolve the cached copy of an image; [`RegistryError::NotFound`] if absent.
    async fn get_local_descriptor(&self, image: &ImageReference) -> Result<Descriptor, RegistryError>;

    /// Copy an image into the cache registry.
    async fn cache_image(
        &self,
        image: &ImageReference,
        remote: &RemoteImage,
        auth: &RegistryAuth,
        architectures: &[String],
    ) -> Result<(), RegistryError>;

    /// Remove a cached image. Returns false if it was already absent.
    async fn delete_image(&self, image: &ImageReference) -> Result<bool, RegistryError>;

    /// Check that a registry serves the distribution API.
    async fn health_check(&self, registry: &str) -> Result<(), RegistryError>;
}
