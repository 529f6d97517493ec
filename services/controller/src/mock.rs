//! In-memory implementations of the engine's collaborators.
//!
//! Used by the test suites and for running the engine without a cluster.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use imagecache_pull_secrets::{RegistryAuth, DOCKER_CONFIG_JSON_KEY};
use imagecache_reference::ImageReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use tracing::debug;

use crate::credentials::SecretSource;
use crate::crd::{CachedImage, CachedImageSpec, CachedImageStatus, Phase};
use crate::events::{EventSink, LifecycleEvent};
use crate::registry::manifest::OCI_IMAGE_MANIFEST;
use crate::registry::{Descriptor, ImageRegistry, RegistryError, RemoteImage};
use crate::store::{CachedImageStore, MetadataPatch, StoreError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct StoreState {
    objects: BTreeMap<String, CachedImage>,
    version: u64,
    writes: usize,
    injected_conflicts: u32,
    vanish_next_write: bool,
    phases: Vec<(String, Phase)>,
}

impl StoreState {
    fn next_version(&mut self) -> Option<String> {
        self.version += 1;
        Some(self.version.to_string())
    }

    /// Load the stored copy `current` was read from, or fail like the API would.
    fn checked(&mut self, current: &CachedImage) -> Result<String, StoreError> {
        let name = current.name_any();

        if std::mem::take(&mut self.vanish_next_write) {
            // Deleted by someone else after the read
            self.objects.remove(&name);
            return Err(StoreError::NotFound(name));
        }
        if self.injected_conflicts > 0 {
            self.injected_conflicts -= 1;
            // Someone else wrote in between
            let version = self.next_version();
            if let Some(stored) = self.objects.get_mut(&name) {
                stored.metadata.resource_version = version;
            }
            return Err(StoreError::Conflict(name));
        }

        let stored = self
            .objects
            .get(&name)
            .ok_or_else(|| StoreError::NotFound(name.clone()))?;
        if stored.metadata.resource_version != current.metadata.resource_version {
            return Err(StoreError::Conflict(name));
        }
        Ok(name)
    }

    fn commit(&mut self, name: &str, mut image: CachedImage) -> CachedImage {
        image.metadata.resource_version = self.next_version();
        self.writes += 1;

        if image.is_deleting() && image.finalizers().is_empty() {
            self.objects.remove(name);
        } else {
            self.objects.insert(name.to_string(), image.clone());
        }
        image
    }
}

/// Cache entry store with API-server write semantics: version checks,
/// finalizer-gated deletion and status ignored on create.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    /// Seed an entry as if it had been created through the API.
    pub fn insert(&self, mut image: CachedImage) {
        let mut state = lock(&self.state);
        image.metadata.resource_version = state.next_version();
        if image.metadata.creation_timestamp.is_none() {
            image.metadata.creation_timestamp = Some(Time(Utc::now()));
        }
        state.objects.insert(image.name_any(), image);
    }

    /// Stored copy of an entry.
    pub fn snapshot(&self, name: &str) -> Option<CachedImage> {
        lock(&self.state).objects.get(name).cloned()
    }

    /// Names of all stored entries.
    pub fn names(&self) -> Vec<String> {
        lock(&self.state).objects.keys().cloned().collect()
    }

    /// Number of writes accepted so far.
    pub fn writes(&self) -> usize {
        lock(&self.state).writes
    }

    /// Make the next `count` writes lose a concurrency race.
    pub fn fail_next_writes(&self, count: u32) {
        lock(&self.state).injected_conflicts = count;
    }

    /// Remove the entry right before the next write reaches it.
    pub fn vanish_before_next_write(&self) {
        lock(&self.state).vanish_next_write = true;
    }

    /// Every phase written for an entry, in order.
    pub fn phase_history(&self, name: &str) -> Vec<Phase> {
        lock(&self.state)
            .phases
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, phase)| *phase)
            .collect()
    }
}

#[async_trait]
impl CachedImageStore for MemoryStore {
    async fn get(&self, name: &str) -> Result<Option<CachedImage>, StoreError> {
        Ok(self.snapshot(name))
    }

    async fn list(&self) -> Result<Vec<CachedImage>, StoreError> {
        Ok(lock(&self.state).objects.values().cloned().collect())
    }

    async fn create(&self, image: &CachedImage) -> Result<CachedImage, StoreError> {
        let mut state = lock(&self.state);
        let name = image.name_any();
        if state.objects.contains_key(&name) {
            return Err(StoreError::AlreadyExists(name));
        }

        let mut created = image.clone();
        created.status = None;
        created.metadata.deletion_timestamp = None;
        created.metadata.creation_timestamp = Some(Time(Utc::now()));
        debug!(name = %name, "[MOCK] Creating cache entry");
        Ok(state.commit(&name, created))
    }

    async fn patch_spec(
        &self,
        current: &CachedImage,
        spec: &CachedImageSpec,
    ) -> Result<CachedImage, StoreError> {
        let mut state = lock(&self.state);
        let name = state.checked(current)?;
        let mut updated = state.objects[&name].clone();
        updated.spec = spec.clone();
        Ok(state.commit(&name, updated))
    }

    async fn patch_status(
        &self,
        current: &CachedImage,
        status: &CachedImageStatus,
    ) -> Result<CachedImage, StoreError> {
        let mut state = lock(&self.state);
        let name = state.checked(current)?;
        let mut updated = state.objects[&name].clone();
        updated.status = Some(status.clone());
        state.phases.push((name.clone(), status.phase));
        Ok(state.commit(&name, updated))
    }

    async fn patch_metadata(
        &self,
        current: &CachedImage,
        patch: &MetadataPatch,
    ) -> Result<CachedImage, StoreError> {
        let mut state = lock(&self.state);
        let name = state.checked(current)?;
        let mut updated = state.objects[&name].clone();

        if let Some(finalizers) = &patch.finalizers {
            updated.metadata.finalizers = Some(finalizers.clone());
        }
        if let Some(annotations) = updated.metadata.annotations.as_mut() {
            for key in &patch.remove_annotations {
                annotations.remove(key);
            }
        }
        Ok(state.commit(&name, updated))
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        let Some(mut image) = state.objects.get(name).cloned() else {
            return Ok(());
        };

        if image.metadata.deletion_timestamp.is_none() {
            image.metadata.deletion_timestamp = Some(Time(Utc::now()));
        }
        debug!(name = %name, "[MOCK] Deleting cache entry");
        state.commit(name, image);
        Ok(())
    }
}

#[derive(Default)]
struct RegistryState {
    upstream: HashMap<String, String>,
    cached: HashMap<String, String>,
    required_auth: HashMap<String, RegistryAuth>,
    upstream_status: Option<u16>,
    cache_lookup_failure: bool,
    delete_failure: bool,
    pulls: usize,
    architectures: Vec<String>,
}

fn image_key(image: &ImageReference) -> String {
    format!("{}:{}", image.cache_repository(), image.manifest_reference())
}

/// Key of a reference given as text; unparsable text is used verbatim.
fn reference_key(reference: &str) -> String {
    ImageReference::parse(reference)
        .map(|image| image_key(&image))
        .unwrap_or_else(|_| reference.to_string())
}

/// Upstream and cache registries held in memory.
#[derive(Default)]
pub struct MockRegistry {
    state: Mutex<RegistryState>,
}

impl MockRegistry {
    /// Publish (or move) an image upstream.
    pub fn add_upstream(&self, reference: &str, digest: &str) {
        lock(&self.state)
            .upstream
            .insert(reference_key(reference), digest.to_string());
    }

    /// Remove an image from upstream.
    pub fn remove_upstream(&self, reference: &str) {
        lock(&self.state).upstream.remove(&reference_key(reference));
    }

    /// Put an image in the cache directly.
    pub fn add_cached(&self, reference: &str, digest: &str) {
        lock(&self.state)
            .cached
            .insert(reference_key(reference), digest.to_string());
    }

    /// Only accept `auth` for upstream requests to `registry`.
    pub fn require_auth(&self, registry: &str, auth: RegistryAuth) {
        lock(&self.state)
            .required_auth
            .insert(registry.to_string(), auth);
    }

    /// Answer upstream requests with an HTTP status error.
    pub fn fail_upstream(&self, status: Option<u16>) {
        lock(&self.state).upstream_status = status;
    }

    /// Make cache registry lookups fail.
    pub fn fail_cache_lookups(&self, fail: bool) {
        lock(&self.state).cache_lookup_failure = fail;
    }

    /// Make cache deletions fail.
    pub fn fail_deletes(&self, fail: bool) {
        lock(&self.state).delete_failure = fail;
    }

    pub fn is_cached(&self, reference: &str) -> bool {
        lock(&self.state)
            .cached
            .contains_key(&reference_key(reference))
    }

    pub fn cached_digest(&self, reference: &str) -> Option<String> {
        lock(&self.state)
            .cached
            .get(&reference_key(reference))
            .cloned()
    }

    /// Number of copies performed.
    pub fn pulls(&self) -> usize {
        lock(&self.state).pulls
    }

    /// Architectures requested by the last copy.
    pub fn last_architectures(&self) -> Vec<String> {
        lock(&self.state).architectures.clone()
    }
}

#[async_trait]
impl ImageRegistry for MockRegistry {
    async fn get_descriptor(
        &self,
        image: &ImageReference,
        auth: &RegistryAuth,
    ) -> Result<RemoteImage, RegistryError> {
        let state = lock(&self.state);

        if let Some(status) = state.upstream_status {
            return Err(RegistryError::Status {
                registry: image.registry().to_string(),
                status,
                message: "mock failure".to_string(),
            });
        }
        if let Some(required) = state.required_auth.get(image.registry()) {
            if required != auth {
                return Err(RegistryError::Unauthorized {
                    registry: image.registry().to_string(),
                    credentials_supplied: auth.has_credentials(),
                });
            }
        }

        let digest = state
            .upstream
            .get(&image_key(image))
            .ok_or_else(|| RegistryError::NotFound(image.to_string()))?;
        Ok(RemoteImage {
            descriptor: Descriptor {
                media_type: OCI_IMAGE_MANIFEST.to_string(),
                digest: digest.clone(),
                size: 0,
                platform: None,
            },
            manifest: Bytes::new(),
        })
    }

    async fn get_local_descriptor(&self, image: &ImageReference) -> Result<Descriptor, RegistryError> {
        let state = lock(&self.state);
        if state.cache_lookup_failure {
            return Err(RegistryError::Status {
                registry: "cache".to_string(),
                status: 503,
                message: "mock failure".to_string(),
            });
        }

        let digest = state
            .cached
            .get(&image_key(image))
            .ok_or_else(|| RegistryError::NotFound(image.to_string()))?;
        Ok(Descriptor {
            media_type: OCI_IMAGE_MANIFEST.to_string(),
            digest: digest.clone(),
            size: 0,
            platform: None,
        })
    }

    async fn cache_image(
        &self,
        image: &ImageReference,
        remote: &RemoteImage,
        _auth: &RegistryAuth,
        architectures: &[String],
    ) -> Result<(), RegistryError> {
        let mut state = lock(&self.state);
        debug!(image = %image, digest = %remote.descriptor.digest, "[MOCK] Caching image");
        state.pulls += 1;
        state.architectures = architectures.to_vec();
        state
            .cached
            .insert(image_key(image), remote.descriptor.digest.clone());
        Ok(())
    }

    async fn delete_image(&self, image: &ImageReference) -> Result<bool, RegistryError> {
        let mut state = lock(&self.state);
        if state.delete_failure {
            return Err(RegistryError::Status {
                registry: "cache".to_string(),
                status: 500,
                message: "mock failure".to_string(),
            });
        }
        Ok(state.cached.remove(&image_key(image)).is_some())
    }

    async fn health_check(&self, _registry: &str) -> Result<(), RegistryError> {
        Ok(())
    }
}

/// Event sink remembering every event.
#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<(String, LifecycleEvent)>>,
}

impl RecordingEvents {
    /// Events published for an entry, in order.
    pub fn events(&self, name: &str) -> Vec<LifecycleEvent> {
        lock(&self.events)
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, event)| event.clone())
            .collect()
    }

    /// Reasons of the events published for an entry, in order.
    pub fn reasons(&self, name: &str) -> Vec<&'static str> {
        self.events(name).iter().map(LifecycleEvent::reason).collect()
    }
}

#[async_trait]
impl EventSink for RecordingEvents {
    async fn publish(&self, image: &CachedImage, event: LifecycleEvent) {
        lock(&self.events).push((image.name_any(), event));
    }
}

/// Secrets held in memory.
#[derive(Default)]
pub struct MemorySecrets {
    secrets: Mutex<BTreeMap<(String, String), BTreeMap<String, Vec<u8>>>>,
}

impl MemorySecrets {
    /// Store one data key of a secret.
    pub fn insert(&self, namespace: &str, name: &str, key: &str, value: &[u8]) {
        lock(&self.secrets)
            .entry((namespace.to_string(), name.to_string()))
            .or_default()
            .insert(key.to_string(), value.to_vec());
    }

    /// Store a `kubernetes.io/dockerconfigjson` secret.
    pub fn insert_docker_config(&self, namespace: &str, name: &str, payload: &str) {
        self.insert(namespace, name, DOCKER_CONFIG_JSON_KEY, payload.as_bytes());
    }
}

#[async_trait]
impl SecretSource for MemorySecrets {
    async fn secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, StoreError> {
        Ok(lock(&self.secrets)
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }
}
