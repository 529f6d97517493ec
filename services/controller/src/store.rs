//! Persistence of cache entries.
//!
//! Every write carries the `resourceVersion` of the copy it was computed from,
//! so a concurrent writer surfaces as [`StoreError::Conflict`] instead of a
//! lost update.

use async_trait::async_trait;
use imagecache_reconcile::Conflicting;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::crd::{CachedImage, CachedImageSpec, CachedImageStatus};

/// Errors from the entry store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("write conflict on {0}")]
    Conflict(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[source] kube::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<kube::Error> for StoreError {
    fn from(error: kube::Error) -> Self {
        match &error {
            kube::Error::Api(response) if response.code == 409 && response.reason == "AlreadyExists" => {
                StoreError::AlreadyExists(response.message.clone())
            }
            kube::Error::Api(response) if response.code == 409 => {
                StoreError::Conflict(response.message.clone())
            }
            kube::Error::Api(response) if response.code == 404 => {
                StoreError::NotFound(response.message.clone())
            }
            _ => StoreError::Kube(error),
        }
    }
}

impl Conflicting for StoreError {
    fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

/// Metadata changes applied as one patch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataPatch {
    /// Replacement finalizer list.
    pub finalizers: Option<Vec<String>>,
    /// Annotation keys to drop.
    pub remove_annotations: Vec<String>,
}

/// Access to cache entry objects.
#[async_trait]
pub trait CachedImageStore: Send + Sync {
    /// Read an entry; `None` if it does not exist.
    async fn get(&self, name: &str) -> Result<Option<CachedImage>, StoreError>;

    /// List all entries.
    async fn list(&self) -> Result<Vec<CachedImage>, StoreError>;

    /// Create an entry; [`StoreError::AlreadyExists`] if the name is taken.
    async fn create(&self, image: &CachedImage) -> Result<CachedImage, StoreError>;

    /// Replace the spec of `current`.
    async fn patch_spec(
        &self,
        current: &CachedImage,
        spec: &CachedImageSpec,
    ) -> Result<CachedImage, StoreError>;

    /// Replace the status of `current`.
    async fn patch_status(
        &self,
        current: &CachedImage,
        status: &CachedImageStatus,
    ) -> Result<CachedImage, StoreError>;

    /// Apply metadata changes to `current`.
    async fn patch_metadata(
        &self,
        current: &CachedImage,
        patch: &MetadataPatch,
    ) -> Result<CachedImage, StoreError>;

    /// Request deletion. Succeeds if the entry is already gone.
    async fn delete(&self, name: &str) -> Result<(), StoreError>;
}

/// Store backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeStore {
    api: Api<CachedImage>,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

/// Merge patch body pinned to the version it was computed from.
fn versioned(current: &CachedImage, mut metadata: Map<String, Value>, extra: Option<(&str, Value)>) -> Value {
    metadata.insert(
        "resourceVersion".to_string(),
        json!(current.resource_version()),
    );

    let mut body = Map::new();
    body.insert("metadata".to_string(), Value::Object(metadata));
    if let Some((key, value)) = extra {
        body.insert(key.to_string(), value);
    }
    Value::Object(body)
}

#[async_trait]
impl CachedImageStore for KubeStore {
    async fn get(&self, name: &str) -> Result<Option<CachedImage>, StoreError> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn list(&self) -> Result<Vec<CachedImage>, StoreError> {
        Ok(self.api.list(&ListParams::default()).await?.items)
    }

    async fn create(&self, image: &CachedImage) -> Result<CachedImage, StoreError> {
        Ok(self.api.create(&PostParams::default(), image).await?)
    }

    async fn patch_spec(
        &self,
        current: &CachedImage,
        spec: &CachedImageSpec,
    ) -> Result<CachedImage, StoreError> {
        let patch = versioned(current, Map::new(), Some(("spec", serde_json::to_value(spec)?)));
        Ok(self
            .api
            .patch(&current.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn patch_status(
        &self,
        current: &CachedImage,
        status: &CachedImageStatus,
    ) -> Result<CachedImage, StoreError> {
        let patch = versioned(current, Map::new(), Some(("status", serde_json::to_value(status)?)));
        Ok(self
            .api
            .patch_status(&current.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn patch_metadata(
        &self,
        current: &CachedImage,
        patch: &MetadataPatch,
    ) -> Result<CachedImage, StoreError> {
        let mut metadata = Map::new();
        if let Some(finalizers) = &patch.finalizers {
            metadata.insert("finalizers".to_string(), json!(finalizers));
        }
        if !patch.remove_annotations.is_empty() {
            let removed: Map<String, Value> = patch
                .remove_annotations
                .iter()
                .map(|key| (key.clone(), Value::Null))
                .collect();
            metadata.insert("annotations".to_string(), Value::Object(removed));
        }

        let body = versioned(current, metadata, None);
        Ok(self
            .api
            .patch(&current.name_any(), &PatchParams::default(), &Patch::Merge(&body))
            .await?)
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) => match StoreError::from(e) {
                StoreError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }
}
