//! Controller runtime wiring.
//!
//! Watches cache entries and consumer pods and drives the engine with a
//! bounded number of concurrent reconciliations. Pod changes are folded into
//! the usage index first and then trigger the entries they affect.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context as _, Result};
use futures_util::StreamExt;
use imagecache_reconcile::{BackoffTracker, Conflicting};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::crd::CachedImage;
use crate::credentials::{CredentialResolver, KubeSecrets};
use crate::engine::{Engine, Outcome, ReconcileError};
use crate::events::KubeEvents;
use crate::metrics::CacheCounters;
use crate::migration::migrate_all;
use crate::registry::{ImageRegistry, RegistryClient};
use crate::store::KubeStore;
use crate::usage::{ConsumerEvent, UsageTracker, REWRITTEN_LABEL};

/// Name reported on events.
pub const CONTROLLER_NAME: &str = "imagecache-controller";

/// State shared by reconciliations.
pub struct Context {
    engine: Engine,
    backoff: Mutex<BackoffTracker>,
}

impl Context {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            backoff: Mutex::new(BackoffTracker::default()),
        }
    }

    fn backoff(&self) -> std::sync::MutexGuard<'_, BackoffTracker> {
        self.backoff.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Map an engine outcome to a controller action.
pub fn action_for(outcome: Outcome) -> Action {
    match outcome.requeue_after {
        Some(delay) => Action::requeue(delay),
        None => Action::await_change(),
    }
}

async fn reconcile(image: Arc<CachedImage>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let name = image.name_any();
    let outcome = ctx.engine.reconcile(&name).await?;
    ctx.backoff().clear(&name);
    Ok(action_for(outcome))
}

/// Delay before retrying a failed entry.
///
/// Lost races retry at once and are not counted. Failures that need a
/// configuration change wait the full backoff ceiling, and a rate limit is
/// never retried before the registry allows it.
pub fn retry_delay(error: &ReconcileError, backoff: &mut BackoffTracker, name: &str) -> Duration {
    if error.is_conflict() {
        return Duration::ZERO;
    }

    backoff.prune();
    let mut delay = backoff.record_failure(name);
    if error.is_permanent() {
        delay = backoff.ceiling();
    }
    match error.retry_after() {
        Some(floor) => delay.max(floor),
        None => delay,
    }
}

fn error_policy(image: Arc<CachedImage>, error: &ReconcileError, ctx: Arc<Context>) -> Action {
    let name = image.name_any();
    let delay = retry_delay(error, &mut ctx.backoff(), &name);

    if error.is_conflict() {
        debug!(name = %name, "Write conflict, requeueing");
    } else {
        warn!(name = %name, error = %error, retry_in_secs = delay.as_secs(), "Reconciliation failed");
    }
    Action::requeue(delay)
}

/// Run the controller until shutdown is signalled.
pub async fn run(config: Config) -> Result<()> {
    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let store = Arc::new(KubeStore::new(client.clone()));
    let registry = Arc::new(RegistryClient::new(config.registry_client_config()?)?);
    if let Err(e) = registry.health_check(&config.registry_url).await {
        warn!(registry = %config.registry_url, error = %e, "Cache registry is not reachable yet");
    }

    let usage = Arc::new(UsageTracker::new());
    let counters = Arc::new(CacheCounters::default());
    let engine = Engine::new(
        store.clone(),
        registry,
        CredentialResolver::new(
            Arc::new(KubeSecrets::new(client.clone())),
            config.pull_secrets_namespace.clone(),
        ),
        usage.clone(),
        Arc::new(KubeEvents::new(client.clone(), CONTROLLER_NAME)),
        counters.clone(),
        config.engine_config()?,
    );

    let migrated = migrate_all(store.as_ref(), config.conflict_attempts)
        .await
        .context("failed to list cache entries for migration")?;
    if migrated > 0 {
        info!(migrated, "Migrated cache entries to canonical names");
    }

    let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
    let tracker = tokio::spawn(track_consumers(client.clone(), usage.clone(), trigger_tx));

    info!("Waiting for the initial pod listing");
    usage.wait_ready().await;
    info!(workers = config.workers, "Starting reconciliation");

    let entries = Api::<CachedImage>::all(client);
    Controller::new(entries, watcher::Config::default())
        .with_config(controller::Config::default().concurrency(config.workers))
        .reconcile_on(UnboundedReceiverStream::new(trigger_rx))
        .shutdown_on_signal()
        .run(reconcile, error_policy, Arc::new(Context::new(engine)))
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!(name = %object.name, "Reconciled"),
                Err(e) => debug!(error = %e, "Reconciliation error"),
            }
        })
        .await;

    tracker.abort();
    info!(
        cached = counters.cached(),
        removed = counters.removed(),
        "Controller stopped"
    );
    Ok(())
}

/// Keep the usage index current and trigger the entries each change affects.
async fn track_consumers(
    client: Client,
    usage: Arc<UsageTracker>,
    triggers: mpsc::UnboundedSender<ObjectRef<CachedImage>>,
) {
    let pods = Api::<Pod>::all(client);
    let selector = format!("{REWRITTEN_LABEL}=true");
    let mut stream = watcher(pods, watcher::Config::default().labels(&selector))
        .default_backoff()
        .boxed();

    while let Some(event) = stream.next().await {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                error!(error = %e, "Pod watch failed");
                continue;
            }
        };
        let Some(event) = ConsumerEvent::from_watch(event) else {
            continue;
        };

        for name in usage.apply(event).await {
            if triggers.send(ObjectRef::new(&name)).is_err() {
                // Controller is gone
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use imagecache_reconcile::DEFAULT_BACKOFF_MAX;

    use super::*;
    use crate::registry::RegistryError;
    use crate::store::StoreError;

    fn rate_limited(retry_after: Option<Duration>) -> ReconcileError {
        RegistryError::RateLimited {
            registry: "docker.io".to_string(),
            retry_after,
        }
        .into()
    }

    #[test]
    fn test_rate_limit_sets_minimum_delay() {
        let mut backoff = BackoffTracker::default();

        let delay = retry_delay(&rate_limited(Some(Duration::from_secs(120))), &mut backoff, "a");
        assert_eq!(delay, Duration::from_secs(120));

        // Backoff already longer than the hint wins
        let mut backoff = BackoffTracker::new(
            Duration::from_secs(600),
            Duration::from_secs(900),
            Duration::from_secs(3600),
        );
        let delay = retry_delay(&rate_limited(Some(Duration::from_secs(30))), &mut backoff, "a");
        assert_eq!(delay, Duration::from_secs(600));

        let mut backoff = BackoffTracker::default();
        let delay = retry_delay(&rate_limited(None), &mut backoff, "a");
        assert_eq!(delay, Duration::from_secs(5));
    }

    #[test]
    fn test_transient_failures_back_off_exponentially() {
        let mut backoff = BackoffTracker::default();
        let error: ReconcileError = RegistryError::Status {
            registry: "ghcr.io".to_string(),
            status: 503,
            message: String::new(),
        }
        .into();

        assert_eq!(retry_delay(&error, &mut backoff, "a"), Duration::from_secs(5));
        assert_eq!(retry_delay(&error, &mut backoff, "a"), Duration::from_secs(10));
        assert_eq!(backoff.failures("a"), 2);
    }

    #[test]
    fn test_permanent_failures_wait_the_ceiling() {
        let mut backoff = BackoffTracker::default();
        let unauthorized: ReconcileError = RegistryError::Unauthorized {
            registry: "ghcr.io".to_string(),
            credentials_supplied: true,
        }
        .into();
        let invalid: ReconcileError = RegistryError::InvalidManifest("truncated".to_string()).into();

        assert_eq!(retry_delay(&unauthorized, &mut backoff, "a"), DEFAULT_BACKOFF_MAX);
        assert_eq!(retry_delay(&invalid, &mut backoff, "b"), DEFAULT_BACKOFF_MAX);
    }

    #[test]
    fn test_conflicts_retry_immediately_uncounted() {
        let mut backoff = BackoffTracker::default();
        let conflict: ReconcileError = StoreError::Conflict("a".to_string()).into();

        assert_eq!(retry_delay(&conflict, &mut backoff, "a"), Duration::ZERO);
        assert_eq!(backoff.failures("a"), 0);
    }

    #[test]
    fn test_action_for_outcome() {
        assert_eq!(action_for(Outcome::done()), Action::await_change());
        assert_eq!(
            action_for(Outcome::requeue(Duration::from_secs(60))),
            Action::requeue(Duration::from_secs(60))
        );
    }
}
