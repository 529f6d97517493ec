//! Reconciliation engine for cache entries.
//!
//! The engine:
//! - Guards cache content with a finalizer and removes it on deletion
//! - Tracks consumers and expires entries nobody uses
//! - Keeps the cached copy in sync with the upstream digest
//!
//! Each pass re-reads the entry and is safe to run any number of times. Every
//! write is computed from a fresh read and pinned to its `resourceVersion`;
//! unchanged status is never written.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use imagecache_pull_secrets::RegistryAuth;
use imagecache_reconcile::{delay_until, optimistic, Conflicting, DEFAULT_CONFLICT_ATTEMPTS};
use imagecache_reference::ImageReference;
use kube::ResourceExt;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::credentials::{CredentialError, CredentialResolver};
use crate::crd::{CachedImage, CachedImageStatus, Phase, UsedBy, FINALIZER, REFRESH_ANNOTATION};
use crate::events::{EventSink, LifecycleEvent};
use crate::expiry::{self, ExpiryState};
use crate::metrics::MetricsSink;
use crate::registry::{ImageRegistry, RegistryError, RemoteImage};
use crate::store::{CachedImageStore, MetadataPatch, StoreError};
use crate::usage::UsageTracker;

/// Errors from a reconciliation pass.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Credentials(#[from] CredentialError),
}

impl Conflicting for ReconcileError {
    fn is_conflict(&self) -> bool {
        matches!(self, ReconcileError::Store(e) if e.is_conflict())
    }
}

impl ReconcileError {
    /// Earliest retry the registry asked for.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ReconcileError::Registry(RegistryError::RateLimited { retry_after, .. }) => *retry_after,
            _ => None,
        }
    }

    /// Returns true if retrying cannot help until something is reconfigured.
    pub fn is_permanent(&self) -> bool {
        matches!(self, ReconcileError::Registry(e) if !e.is_transient())
    }
}

/// What to do after a successful pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Outcome {
    /// Run again after this delay even without a change.
    pub requeue_after: Option<Duration>,
}

impl Outcome {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn requeue(after: Duration) -> Self {
        Self {
            requeue_after: Some(after),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long an unused entry is kept.
    pub expiry_delay: TimeDelta,
    /// Architectures copied from multi-platform images.
    pub architectures: Vec<String>,
    /// Attempts per optimistic write before giving up with a conflict.
    pub conflict_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            expiry_delay: TimeDelta::days(30),
            architectures: vec!["amd64".to_string()],
            conflict_attempts: DEFAULT_CONFLICT_ATTEMPTS,
        }
    }
}

/// Cache entry reconciliation engine.
pub struct Engine {
    store: Arc<dyn CachedImageStore>,
    registry: Arc<dyn ImageRegistry>,
    credentials: CredentialResolver,
    usage: Arc<UsageTracker>,
    events: Arc<dyn EventSink>,
    metrics: Arc<dyn MetricsSink>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        store: Arc<dyn CachedImageStore>,
        registry: Arc<dyn ImageRegistry>,
        credentials: CredentialResolver,
        usage: Arc<UsageTracker>,
        events: Arc<dyn EventSink>,
        metrics: Arc<dyn MetricsSink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            registry,
            credentials,
            usage,
            events,
            metrics,
            config,
        }
    }

    /// Reconcile one entry by name.
    pub async fn reconcile(&self, name: &str) -> Result<Outcome, ReconcileError> {
        self.reconcile_at(name, Utc::now()).await
    }

    /// Reconcile one entry as of `now`.
    #[instrument(skip_all, fields(name = %name))]
    pub async fn reconcile_at(&self, name: &str, now: DateTime<Utc>) -> Result<Outcome, ReconcileError> {
        match self.pass(name, now).await {
            Err(ReconcileError::Store(StoreError::NotFound(_))) => {
                debug!("Cache entry removed during the pass");
                Ok(Outcome::done())
            }
            result => result,
        }
    }

    async fn pass(&self, name: &str, now: DateTime<Utc>) -> Result<Outcome, ReconcileError> {
        let Some(image) = self.store.get(name).await? else {
            debug!("Cache entry no longer exists");
            return Ok(Outcome::done());
        };

        if image.is_deleting() {
            return self.finalize(&image).await;
        }

        let Some(image) = self.ensure_finalizer(name).await? else {
            return Ok(Outcome::done());
        };
        if image.is_deleting() {
            return self.finalize(&image).await;
        }

        // Consumers and expiry
        let consumers = self.usage.consumers(name).await;
        let count = consumers.len();
        let used_by = UsedBy::new(consumers);
        let retain = image.spec.retain;
        let delay = self.config.expiry_delay;
        let previous_expiry = image.status.as_ref().and_then(|s| s.expires_at);

        let Some(image) = self
            .update_status(name, |status| {
                status.used_by = used_by.clone();
                status.expires_at = expiry::next_expiry(status.expires_at, count, retain, now, delay);
            })
            .await?
        else {
            return Ok(Outcome::done());
        };

        let expires_at = image.status.as_ref().and_then(|s| s.expires_at);
        if let (None, Some(at)) = (previous_expiry, expires_at) {
            info!(expires_at = %at, "No consumers left, expiry scheduled");
            self.events
                .publish(&image, LifecycleEvent::Expiring { at })
                .await;
        }

        let requeue_after = match expiry::evaluate(expires_at, now) {
            ExpiryState::Due => {
                info!("Cache entry expired");
                self.events.publish(&image, LifecycleEvent::Expired).await;
                self.store.delete(name).await?;
                return Ok(Outcome::done());
            }
            ExpiryState::Pending(at) => Some(delay_until(at, now)),
            ExpiryState::Never => None,
        };

        let refresh = image.refresh_requested();
        if refresh {
            info!("Refresh requested");
        }

        self.synchronize(&image, refresh, now).await?;

        // Kept on failure so the refresh is retried with the next pass
        if refresh {
            self.update_metadata(name, |current| {
                current.refresh_requested().then(|| MetadataPatch {
                    remove_annotations: vec![REFRESH_ANNOTATION.to_string()],
                    ..Default::default()
                })
            })
            .await?;
        }

        Ok(Outcome { requeue_after })
    }

    /// Bring the cached copy in line with upstream.
    async fn synchronize(
        &self,
        image: &CachedImage,
        refresh: bool,
        now: DateTime<Utc>,
    ) -> Result<(), ReconcileError> {
        let name = image.name_any();
        let status = image.current_status();
        // A failed entry moves straight to its next settled phase
        let retrying = status.phase == Phase::ErrImagePull;

        let reference = match ImageReference::parse(&image.spec.source_image) {
            Ok(reference) => reference,
            Err(e) => {
                // Nothing to retry until the object changes
                let message = format!("invalid source image: {e}");
                warn!(error = %e, "Invalid source image");
                let changed = status.phase != Phase::ErrImagePull
                    || status.message.as_deref() != Some(message.as_str());
                self.update_status(&name, |s| {
                    s.phase = Phase::ErrImagePull;
                    s.is_cached = false;
                    s.message = Some(message.clone());
                })
                .await?;
                if changed {
                    self.events
                        .publish(image, LifecycleEvent::CacheFailed { message })
                        .await;
                }
                return Ok(());
            }
        };

        if status.phase == Phase::New {
            self.update_status(&name, |s| s.phase = Phase::Synchronizing)
                .await?;
            self.events.publish(image, LifecycleEvent::Queued).await;
        }

        let local = match self.registry.get_local_descriptor(&reference).await {
            Ok(descriptor) => Some(descriptor),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };

        if local.is_some() && !refresh {
            self.mark_ready(&name).await?;
            return Ok(());
        }

        if !retrying {
            self.update_status(&name, |s| {
                s.phase = Phase::Synchronizing;
                s.is_cached = false;
            })
            .await?;
        }

        let (auth, remote) = match self.fetch_upstream(image, &reference).await {
            Ok(found) => found,
            Err(e) => {
                let unavailable = matches!(e, ReconcileError::Registry(_));
                return self.fail(image, &status, e, unavailable).await;
            }
        };

        let upstream_digest = remote.digest().to_string();
        let up_to_date = status.digest.as_deref() == Some(upstream_digest.as_str());
        self.update_status(&name, |s| {
            s.available_upstream = true;
            s.upstream_digest = Some(upstream_digest.clone());
            s.up_to_date = up_to_date;
            s.last_sync = Some(now);
        })
        .await?;

        if up_to_date && local.is_some() {
            self.mark_ready(&name).await?;
            return Ok(());
        }

        info!(digest = %upstream_digest, "Caching image");
        if !retrying {
            self.update_status(&name, |s| s.phase = Phase::Pulling)
                .await?;
            self.events.publish(image, LifecycleEvent::Caching).await;
        }

        if let Err(e) = self
            .registry
            .cache_image(&reference, &remote, &auth, &self.config.architectures)
            .await
        {
            return self.fail(image, &status, e.into(), false).await;
        }

        self.update_status(&name, |s| {
            s.phase = Phase::Ready;
            s.is_cached = true;
            s.digest = Some(upstream_digest.clone());
            s.up_to_date = true;
            s.last_successful_pull = Some(now);
            s.message = None;
        })
        .await?;
        self.metrics.image_cached();
        self.events
            .publish(
                image,
                LifecycleEvent::Cached {
                    digest: upstream_digest,
                },
            )
            .await;

        Ok(())
    }

    async fn fetch_upstream(
        &self,
        image: &CachedImage,
        reference: &ImageReference,
    ) -> Result<(RegistryAuth, RemoteImage), ReconcileError> {
        let auth = self
            .credentials
            .resolve(
                reference,
                image.spec.pull_secrets_namespace.as_deref(),
                &image.spec.pull_secret_names,
            )
            .await?;
        let remote = self.registry.get_descriptor(reference, &auth).await?;
        Ok((auth, remote))
    }

    async fn mark_ready(&self, name: &str) -> Result<(), StoreError> {
        self.update_status(name, |s| {
            s.phase = Phase::Ready;
            s.is_cached = true;
            s.message = None;
        })
        .await?;
        Ok(())
    }

    /// Record a caching failure and hand the error back for retry.
    async fn fail(
        &self,
        image: &CachedImage,
        previous: &CachedImageStatus,
        error: ReconcileError,
        upstream_unavailable: bool,
    ) -> Result<(), ReconcileError> {
        let message = error.to_string();
        warn!(error = %message, "Caching failed");

        self.update_status(&image.name_any(), |s| {
            s.phase = Phase::ErrImagePull;
            s.is_cached = false;
            s.message = Some(message.clone());
            if upstream_unavailable {
                s.available_upstream = false;
            }
        })
        .await?;

        let repeated = previous.phase == Phase::ErrImagePull
            && previous.message.as_deref() == Some(message.as_str());
        if !repeated {
            self.events
                .publish(image, LifecycleEvent::CacheFailed { message })
                .await;
        }

        Err(error)
    }

    /// Remove cache content, then release the object.
    async fn finalize(&self, image: &CachedImage) -> Result<Outcome, ReconcileError> {
        if !image.has_finalizer() {
            debug!("Deletion in progress, nothing to clean up");
            return Ok(Outcome::done());
        }
        let name = image.name_any();

        if image.phase() != Phase::Terminating {
            self.update_status(&name, |s| s.phase = Phase::Terminating)
                .await?;
            self.events.publish(image, LifecycleEvent::CleaningUp).await;
        }

        match ImageReference::parse(&image.spec.source_image) {
            Ok(reference) => match self.registry.delete_image(&reference).await {
                Ok(true) => {
                    self.metrics.image_removed();
                    self.events.publish(image, LifecycleEvent::CleanedUp).await;
                }
                Ok(false) => debug!("Image was not in the cache"),
                Err(e) => {
                    let message = e.to_string();
                    warn!(error = %message, "Failed to remove image from cache");
                    self.update_status(&name, |s| s.message = Some(message.clone()))
                        .await?;
                    self.events
                        .publish(image, LifecycleEvent::CleanupFailed { message })
                        .await;
                    return Err(e.into());
                }
            },
            Err(e) => debug!(error = %e, "Invalid source image, nothing was cached"),
        }

        self.update_metadata(&name, |current| {
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
        })
        .await?;

        info!("Cache entry finalized");
        Ok(Outcome::done())
    }

    async fn ensure_finalizer(&self, name: &str) -> Result<Option<CachedImage>, StoreError> {
        self.update_metadata(name, |image| {
            (!image.has_finalizer() && !image.is_deleting()).then(|| {
                let mut finalizers = image.finalizers().to_vec();
                finalizers.push(FINALIZER.to_string());
                MetadataPatch {
                    finalizers: Some(finalizers),
                    ..Default::default()
                }
            })
        })
        .await
    }

    /// Optimistically rewrite the status; returns the latest copy, `None` if
    /// the entry is gone.
    async fn update_status<F>(&self, name: &str, mut mutate: F) -> Result<Option<CachedImage>, StoreError>
    where
        F: FnMut(&mut CachedImageStatus) + Send,
    {
        let store = self.store.as_ref();
        let transaction = optimistic(
            self.config.conflict_attempts,
            || store.get(name),
            |image: &CachedImage| {
                let current = image.current_status();
                let mut next = current.clone();
                mutate(&mut next);
                (image.status.is_none() || next != current).then_some(next)
            },
            |image: CachedImage, status: CachedImageStatus| async move {
                store.patch_status(&image, &status).await
            },
        )
        .await?;

        Ok(transaction.into_inner())
    }

    /// Optimistically patch metadata; returns the latest copy, `None` if the
    /// entry is gone.
    async fn update_metadata<F>(&self, name: &str, plan: F) -> Result<Option<CachedImage>, StoreError>
    where
        F: FnMut(&CachedImage) -> Option<MetadataPatch> + Send,
    {
        let store = self.store.as_ref();
        let transaction = optimistic(
            self.config.conflict_attempts,
            || store.get(name),
            plan,
            |image: CachedImage, patch: MetadataPatch| async move {
                store.patch_metadata(&image, &patch).await
            },
        )
        .await?;

        Ok(transaction.into_inner())
    }
}
