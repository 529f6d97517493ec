//! Create-or-merge of desired cache entries.
//!
//! Entries are keyed by the canonical name of their source, so concurrent
//! producers referencing the same image (`nginx`, `docker.io/library/nginx:latest`)
//! converge on one object: the loser of the creation race merges into the
//! winner instead of failing.

use std::collections::BTreeMap;

use imagecache_reconcile::{optimistic, Conflicting, Transaction};
use imagecache_reference::{canonical_name, repository_name, ImageReference, ReferenceError};
use kube::api::ObjectMeta;
use thiserror::Error;
use tracing::{debug, info};

use crate::crd::{CachedImage, CachedImageSpec, REPOSITORY_LABEL};
use crate::store::{CachedImageStore, StoreError};

/// Errors from [`upsert`].
#[derive(Debug, Error)]
pub enum DesiredError {
    #[error("invalid source image: {0}")]
    Reference(#[from] ReferenceError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Conflicting for DesiredError {
    fn is_conflict(&self) -> bool {
        matches!(self, DesiredError::Store(e) if e.is_conflict())
    }
}

/// An image that should be cached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredEntry {
    pub source_image: String,
    pub retain: bool,
    pub pull_secret_names: Vec<String>,
    pub pull_secrets_namespace: Option<String>,
}

impl DesiredEntry {
    pub fn new(source_image: impl Into<String>) -> Self {
        Self {
            source_image: source_image.into(),
            ..Default::default()
        }
    }

    fn spec(&self) -> CachedImageSpec {
        CachedImageSpec {
            source_image: self.source_image.clone(),
            retain: self.retain,
            pull_secret_names: self.pull_secret_names.clone(),
            pull_secrets_namespace: self.pull_secrets_namespace.clone(),
        }
    }
}

/// What [`upsert`] did; each variant carries the entry name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created(String),
    Updated(String),
    Unchanged(String),
    /// An entry with this name is still being deleted; try again later.
    PendingDeletion(String),
}

impl UpsertOutcome {
    pub fn name(&self) -> &str {
        match self {
            Self::Created(name)
            | Self::Updated(name)
            | Self::Unchanged(name)
            | Self::PendingDeletion(name) => name,
        }
    }
}

/// Build the object for a desired entry under its canonical name.
pub fn build(entry: &DesiredEntry) -> Result<CachedImage, ReferenceError> {
    let image = ImageReference::parse(&entry.source_image)?;
    let name = canonical_name(&entry.source_image)?;

    Ok(CachedImage {
        metadata: ObjectMeta {
            name: Some(name),
            labels: Some(BTreeMap::from([(
                REPOSITORY_LABEL.to_string(),
                repository_name(&image),
            )])),
            ..Default::default()
        },
        spec: entry.spec(),
        status: None,
    })
}

/// Create the entry, or merge into the existing one.
///
/// The source of an existing entry is kept. Any producer asking for `retain`
/// sets it, and pull secrets are replaced only when the request names some.
pub async fn upsert(
    store: &dyn CachedImageStore,
    entry: &DesiredEntry,
    attempts: u32,
) -> Result<UpsertOutcome, DesiredError> {
    let object = build(entry)?;
    let name = object.metadata.name.clone().unwrap_or_default();

    match store.create(&object).await {
        Ok(_) => {
            info!(name = %name, source = %entry.source_image, "Cache entry created");
            return Ok(UpsertOutcome::Created(name));
        }
        Err(StoreError::AlreadyExists(_)) => {
            debug!(name = %name, "Cache entry exists, merging");
        }
        Err(e) => return Err(e.into()),
    }

    let mut pending_deletion = false;
    let transaction = optimistic(
        attempts,
        || async { Ok::<_, DesiredError>(store.get(&name).await?) },
        |current: &CachedImage| {
            pending_deletion = current.is_deleting();
            if pending_deletion {
                return None;
            }
            let merged = merge(&current.spec, entry);
            (merged != current.spec).then_some(merged)
        },
        |current: CachedImage, spec: CachedImageSpec| async move {
            Ok(store.patch_spec(&current, &spec).await?)
        },
    )
    .await?;

    Ok(match transaction {
        Transaction::Written(_) => {
            info!(name = %name, "Cache entry updated");
            UpsertOutcome::Updated(name)
        }
        Transaction::Unchanged(_) if pending_deletion => {
            info!(name = %name, "Cache entry is being deleted, not recreating yet");
            UpsertOutcome::PendingDeletion(name)
        }
        Transaction::Unchanged(_) => UpsertOutcome::Unchanged(name),
        // Deleted between the create and the read
        Transaction::Missing => UpsertOutcome::PendingDeletion(name),
    })
}

fn merge(current: &CachedImageSpec, entry: &DesiredEntry) -> CachedImageSpec {
    let mut merged = current.clone();
    merged.retain |= entry.retain;
    if !entry.pull_secret_names.is_empty() {
        merged.pull_secret_names = entry.pull_secret_names.clone();
        merged.pull_secrets_namespace = entry.pull_secrets_namespace.clone();
    }
    merged
}
