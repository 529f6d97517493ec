//! Migration of entries stored under a non-canonical name.
//!
//! Entries created before the naming scheme settled may carry a name that no
//! longer matches their source. Each is moved in two phases: first the twin
//! under the canonical name is created (or merged into), then the old object
//! is released and deleted. A crash between the phases leaves both objects,
//! and the next run resumes at the second phase.

use imagecache_reconcile::{optimistic, Conflicting};
use imagecache_reference::canonical_name;
use kube::ResourceExt;
use thiserror::Error;
use tracing::{info, warn};

use crate::crd::{CachedImage, FINALIZER};
use crate::desired::{upsert, DesiredEntry, DesiredError, UpsertOutcome};
use crate::store::{CachedImageStore, MetadataPatch, StoreError};

/// Errors from migrating one entry.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("failed to create canonical twin of {name}: {source}")]
    Twin {
        name: String,
        #[source]
        source: DesiredError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Conflicting for MigrationError {
    fn is_conflict(&self) -> bool {
        match self {
            MigrationError::Twin { source, .. } => source.is_conflict(),
            MigrationError::Store(e) => e.is_conflict(),
        }
    }
}

/// Result of migrating one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Migration {
    /// The entry already carries its canonical name.
    AlreadyCorrect,
    /// Nothing to do now: the source is invalid, or the entry or its twin is
    /// being deleted.
    Skipped,
    Migrated { from: String, to: String },
}

/// Migrate one entry to its canonical name.
pub async fn migrate(
    store: &dyn CachedImageStore,
    image: &CachedImage,
    attempts: u32,
) -> Result<Migration, MigrationError> {
    let name = image.name_any();
    let Ok(canonical) = canonical_name(&image.spec.source_image) else {
        // Invalid sources are reported by the engine
        return Ok(Migration::Skipped);
    };
    if canonical == name {
        return Ok(Migration::AlreadyCorrect);
    }
    if image.is_deleting() {
        return Ok(Migration::Skipped);
    }

    let entry = DesiredEntry {
        source_image: image.spec.source_image.clone(),
        retain: image.spec.retain,
        pull_secret_names: image.spec.pull_secret_names.clone(),
        pull_secrets_namespace: image.spec.pull_secrets_namespace.clone(),
    };
    let outcome = upsert(store, &entry, attempts)
        .await
        .map_err(|source| MigrationError::Twin {
            name: name.clone(),
            source,
        })?;
    if let UpsertOutcome::PendingDeletion(_) = outcome {
        return Ok(Migration::Skipped);
    }

    // The twin owns the same cache content, so the old object must not clean it up
    optimistic(
        attempts,
        || store.get(&name),
        |current: &CachedImage| {
            current.has_finalizer().then(|| MetadataPatch {
                finalizers: Some(
                    current
                        .finalizers()
                        .iter()
                        .filter(|f| f.as_str() != FINALIZER)
                        .cloned()
                        .collect(),
                ),
                ..Default::default()
            })
        },
        |current: CachedImage, patch: MetadataPatch| async move {
            store.patch_metadata(&current, &patch).await
        },
    )
    .await?;
    store.delete(&name).await?;

    info!(from = %name, to = %canonical, "Migrated cache entry");
    Ok(Migration::Migrated {
        from: name,
        to: canonical,
    })
}

/// Migrate every stored entry, logging failures individually.
///
/// Returns the number of entries migrated.
pub async fn migrate_all(store: &dyn CachedImageStore, attempts: u32) -> Result<usize, StoreError> {
    let mut migrated = 0;

    for image in store.list().await? {
        match migrate(store, &image, attempts).await {
            Ok(Migration::Migrated { .. }) => migrated += 1,
            Ok(_) => {}
            Err(e) => warn!(name = %image.name_any(), error = %e, "Failed to migrate cache entry"),
        }
    }

    Ok(migrated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::CachedImageSpec;
    use crate::mock::MemoryStore;

    fn legacy(name: &str, source: &str, retain: bool) -> CachedImage {
        let mut image = CachedImage::new(
            name,
            CachedImageSpec {
                source_image: source.to_string(),
                retain,
                ..Default::default()
            },
        );
        image.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        image
    }

    #[tokio::test]
    async fn test_canonical_entry_untouched() {
        let store = MemoryStore::default();
        let image = legacy("docker.io-library-nginx-latest", "nginx", false);
        store.insert(image.clone());

        assert_eq!(migrate(&store, &image, 3).await.unwrap(), Migration::AlreadyCorrect);
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn test_legacy_entry_moves() {
        let store = MemoryStore::default();
        store.insert(legacy("nginx", "nginx", true));

        let migrated = migrate_all(&store, 3).await.unwrap();
        assert_eq!(migrated, 1);
        assert_eq!(store.names(), vec!["docker.io-library-nginx-latest".to_string()]);

        let twin = store.snapshot("docker.io-library-nginx-latest").unwrap();
        assert!(twin.spec.retain);

        // Second run finds nothing left
        assert_eq!(migrate_all(&store, 3).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_resumes_after_partial_run() {
        let store = MemoryStore::default();
        store.insert(legacy("old-alpine", "alpine", false));
        store.insert(legacy("docker.io-library-alpine-latest", "alpine", false));

        assert_eq!(migrate_all(&store, 3).await.unwrap(), 1);
        assert_eq!(
            store.names(),
            vec!["docker.io-library-alpine-latest".to_string()]
        );
        assert!(store
            .snapshot("docker.io-library-alpine-latest")
            .unwrap()
            .has_finalizer());
    }

    #[tokio::test]
    async fn test_invalid_source_skipped() {
        let store = MemoryStore::default();
        let image = legacy("broken", "not a reference", false);
        store.insert(image.clone());

        assert_eq!(migrate(&store, &image, 3).await.unwrap(), Migration::Skipped);
        assert!(store.snapshot("broken").is_some());
    }
}
