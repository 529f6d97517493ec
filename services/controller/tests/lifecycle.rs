//! End-to-end cache entry lifecycles against the in-memory store and registry.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use imagecache_controller::crd::{CachedImage, Phase, PodReference, REFRESH_ANNOTATION};
use imagecache_controller::credentials::CredentialResolver;
use imagecache_controller::desired::{upsert, DesiredEntry, UpsertOutcome};
use imagecache_controller::engine::{Engine, EngineConfig};
use imagecache_controller::metrics::CacheCounters;
use imagecache_controller::migration::migrate_all;
use imagecache_controller::mock::{MemorySecrets, MemoryStore, MockRegistry, RecordingEvents};
use imagecache_controller::store::CachedImageStore;
use imagecache_controller::usage::{ConsumerEvent, ConsumerRecord, UsageTracker};
use imagecache_pull_secrets::RegistryAuth;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::ResourceExt;
use rstest::rstest;

const NGINX: &str = "docker.io-library-nginx-latest";
const SECRETS_NAMESPACE: &str = "imagecache-system";

struct Harness {
    store: Arc<MemoryStore>,
    registry: Arc<MockRegistry>,
    secrets: Arc<MemorySecrets>,
    usage: Arc<UsageTracker>,
    events: Arc<RecordingEvents>,
    metrics: Arc<CacheCounters>,
    engine: Engine,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(MemoryStore::default());
        let registry = Arc::new(MockRegistry::default());
        let secrets = Arc::new(MemorySecrets::default());
        let usage = Arc::new(UsageTracker::new());
        let events = Arc::new(RecordingEvents::default());
        let metrics = Arc::new(CacheCounters::default());

        let engine = Engine::new(
            store.clone(),
            registry.clone(),
            CredentialResolver::new(secrets.clone(), SECRETS_NAMESPACE),
            usage.clone(),
            events.clone(),
            metrics.clone(),
            EngineConfig {
                expiry_delay: TimeDelta::hours(1),
                ..Default::default()
            },
        );

        Self {
            store,
            registry,
            secrets,
            usage,
            events,
            metrics,
            engine,
        }
    }

    async fn desire(&self, entry: DesiredEntry) -> String {
        upsert(self.store.as_ref(), &entry, 3)
            .await
            .unwrap()
            .name()
            .to_string()
    }

    fn entry(&self, name: &str) -> CachedImage {
        self.store.snapshot(name).unwrap()
    }

    async fn start_pod(&self, namespace: &str, name: &str, image: &str) {
        let record = ConsumerRecord::from_pod(&pod(namespace, name, image, false)).unwrap();
        self.usage.apply(ConsumerEvent::Upserted(record)).await;
    }

    async fn stop_pod(&self, namespace: &str, name: &str) {
        self.usage
            .apply(ConsumerEvent::Removed(PodReference::new(namespace, name)))
            .await;
    }
}

fn pod(namespace: &str, name: &str, image: &str, terminating: bool) -> Pod {
    Pod {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            annotations: Some(BTreeMap::from([(
                "imagecache.io/original-image-app".to_string(),
                image.to_string(),
            )])),
            deletion_timestamp: terminating.then(|| Time(t0())),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).unwrap()
}

#[tokio::test]
async fn test_nginx_lifecycle() {
    let h = Harness::new();
    h.registry.add_upstream("nginx:latest", "sha256:aaa");

    let name = h.desire(DesiredEntry::new("nginx")).await;
    assert_eq!(name, NGINX);
    h.start_pod("web", "frontend-0", "nginx").await;

    // Cached while in use, no expiry
    let outcome = h.engine.reconcile_at(NGINX, t0()).await.unwrap();
    assert_eq!(outcome.requeue_after, None);
    let status = h.entry(NGINX).status.unwrap();
    assert_eq!(status.phase, Phase::Ready);
    assert!(status.is_cached);
    assert!(status.up_to_date);
    assert_eq!(status.digest.as_deref(), Some("sha256:aaa"));
    assert_eq!(status.used_by.count, 1);
    assert_eq!(status.expires_at, None);
    assert!(h.registry.is_cached("docker.io/library/nginx:latest"));
    let mut phases = h.store.phase_history(NGINX);
    phases.dedup();
    assert_eq!(
        phases,
        vec![Phase::New, Phase::Synchronizing, Phase::Pulling, Phase::Ready]
    );

    // Last consumer leaves
    h.stop_pod("web", "frontend-0").await;
    let t1 = t0() + TimeDelta::minutes(10);
    let outcome = h.engine.reconcile_at(NGINX, t1).await.unwrap();
    assert_eq!(outcome.requeue_after, Some(Duration::from_secs(3600)));
    let status = h.entry(NGINX).status.unwrap();
    assert_eq!(status.used_by.count, 0);
    assert_eq!(status.expires_at, Some(t1 + TimeDelta::hours(1)));

    // Expiry is not pushed back by later passes
    let outcome = h
        .engine
        .reconcile_at(NGINX, t1 + TimeDelta::minutes(30))
        .await
        .unwrap();
    assert_eq!(outcome.requeue_after, Some(Duration::from_secs(30 * 60)));

    // Expired: deletion requested, content still guarded
    let t2 = t1 + TimeDelta::hours(1);
    h.engine.reconcile_at(NGINX, t2).await.unwrap();
    assert!(h.entry(NGINX).is_deleting());
    assert!(h.registry.is_cached("docker.io/library/nginx:latest"));

    // Finalization removes the cached image, then the object
    h.engine.reconcile_at(NGINX, t2).await.unwrap();
    assert!(h.store.snapshot(NGINX).is_none());
    assert!(!h.registry.is_cached("docker.io/library/nginx:latest"));
    assert_eq!(h.metrics.cached(), 1);
    assert_eq!(h.metrics.removed(), 1);
    assert_eq!(
        h.events.reasons(NGINX),
        vec![
            "Queued",
            "Caching",
            "Cached",
            "Expiring",
            "Expired",
            "CleaningUp",
            "CleanedUp"
        ]
    );
}

#[tokio::test]
async fn test_repeated_passes_write_nothing() {
    let h = Harness::new();
    h.registry.add_upstream("nginx", "sha256:aaa");
    h.desire(DesiredEntry::new("nginx")).await;
    h.start_pod("web", "frontend-0", "nginx").await;

    h.engine.reconcile_at(NGINX, t0()).await.unwrap();
    let writes = h.store.writes();
    let events = h.events.reasons(NGINX).len();

    for minutes in 1..4 {
        h.engine
            .reconcile_at(NGINX, t0() + TimeDelta::minutes(minutes))
            .await
            .unwrap();
    }

    assert_eq!(h.store.writes(), writes);
    assert_eq!(h.events.reasons(NGINX).len(), events);
    assert_eq!(h.registry.pulls(), 1);
}

#[tokio::test]
async fn test_returning_consumer_clears_expiry() {
    let h = Harness::new();
    h.registry.add_upstream("nginx", "sha256:aaa");
    h.desire(DesiredEntry::new("nginx")).await;

    h.engine.reconcile_at(NGINX, t0()).await.unwrap();
    assert!(h.entry(NGINX).status.unwrap().expires_at.is_some());

    h.start_pod("batch", "job-1", "docker.io/library/nginx:latest").await;
    let outcome = h
        .engine
        .reconcile_at(NGINX, t0() + TimeDelta::minutes(5))
        .await
        .unwrap();

    let status = h.entry(NGINX).status.unwrap();
    assert_eq!(status.expires_at, None);
    assert_eq!(status.used_by.pods, vec![PodReference::new("batch", "job-1")]);
    assert_eq!(outcome.requeue_after, None);
}

#[tokio::test]
async fn test_terminating_pods_do_not_count() {
    let h = Harness::new();
    h.registry.add_upstream("nginx", "sha256:aaa");
    h.desire(DesiredEntry::new("nginx")).await;

    let record = ConsumerRecord::from_pod(&pod("web", "old", "nginx", true)).unwrap();
    h.usage.apply(ConsumerEvent::Upserted(record)).await;

    h.engine.reconcile_at(NGINX, t0()).await.unwrap();
    let status = h.entry(NGINX).status.unwrap();
    assert_eq!(status.used_by.count, 0);
    assert_eq!(status.expires_at, Some(t0() + TimeDelta::hours(1)));
}

#[tokio::test]
async fn test_retained_entry_never_expires() {
    let h = Harness::new();
    h.registry.add_upstream("redis:7", "sha256:bbb");
    let name = h
        .desire(DesiredEntry {
            retain: true,
            ..DesiredEntry::new("redis:7")
        })
        .await;

    let outcome = h.engine.reconcile_at(&name, t0()).await.unwrap();
    assert_eq!(outcome.requeue_after, None);

    let later = t0() + TimeDelta::days(365);
    h.engine.reconcile_at(&name, later).await.unwrap();
    let image = h.entry(&name);
    assert!(!image.is_deleting());
    assert_eq!(image.status.unwrap().expires_at, None);
}

#[tokio::test]
async fn test_refresh_annotation_repulls() {
    let h = Harness::new();
    h.registry.add_upstream("nginx", "sha256:aaa");
    h.desire(DesiredEntry::new("nginx")).await;
    h.start_pod("web", "frontend-0", "nginx").await;
    h.engine.reconcile_at(NGINX, t0()).await.unwrap();

    // A moved tag is not noticed without a refresh
    h.registry.add_upstream("nginx", "sha256:ccc");
    h.engine.reconcile_at(NGINX, t0()).await.unwrap();
    assert_eq!(h.registry.pulls(), 1);

    let mut image = h.entry(NGINX);
    image
        .annotations_mut()
        .insert(REFRESH_ANNOTATION.to_string(), "now".to_string());
    h.store.insert(image);

    h.engine.reconcile_at(NGINX, t0()).await.unwrap();
    let image = h.entry(NGINX);
    let status = image.status.clone().unwrap();
    assert_eq!(h.registry.pulls(), 2);
    assert_eq!(status.digest.as_deref(), Some("sha256:ccc"));
    assert_eq!(status.upstream_digest.as_deref(), Some("sha256:ccc"));
    assert_eq!(status.phase, Phase::Ready);
    assert!(!image.refresh_requested());
    assert_eq!(
        h.registry.cached_digest("nginx").as_deref(),
        Some("sha256:ccc")
    );
}

#[rstest]
#[case::no_secret(None, "requires credentials and none are configured")]
#[case::wrong_password(Some("wrong"), "rejected the configured credentials")]
#[tokio::test]
async fn test_private_registry_failures(#[case] password: Option<&str>, #[case] expected: &str) {
    let h = Harness::new();
    h.registry.add_upstream("ghcr.io/acme/api:v2", "sha256:ddd");
    h.registry.require_auth(
        "ghcr.io",
        RegistryAuth::Basic {
            username: "bot".to_string(),
            password: "s3cret".to_string(),
        },
    );
    let mut pull_secret_names = Vec::new();
    if let Some(password) = password {
        h.secrets.insert_docker_config(
            SECRETS_NAMESPACE,
            "ghcr",
            &format!(r#"{{"auths":{{"ghcr.io":{{"username":"bot","password":"{password}"}}}}}}"#),
        );
        pull_secret_names.push("ghcr".to_string());
    }
    let name = h
        .desire(DesiredEntry {
            pull_secret_names,
            ..DesiredEntry::new("ghcr.io/acme/api:v2")
        })
        .await;

    let err = h.engine.reconcile_at(&name, t0()).await.unwrap_err();
    assert!(err.to_string().contains(expected), "{err}");

    let status = h.entry(&name).status.unwrap();
    assert_eq!(status.phase, Phase::ErrImagePull);
    assert!(!status.available_upstream);
    assert!(status.message.unwrap().contains(expected));
    assert_eq!(h.events.reasons(&name).last(), Some(&"CacheFailed"));
}

#[tokio::test]
async fn test_private_registry_recovers_with_credentials() {
    let h = Harness::new();
    h.registry.add_upstream("ghcr.io/acme/api:v2", "sha256:ddd");
    h.registry.require_auth(
        "ghcr.io",
        RegistryAuth::Basic {
            username: "bot".to_string(),
            password: "s3cret".to_string(),
        },
    );
    let name = h
        .desire(DesiredEntry {
            pull_secret_names: vec!["missing".to_string(), "ghcr".to_string()],
            pull_secrets_namespace: Some("team-a".to_string()),
            ..DesiredEntry::new("ghcr.io/acme/api:v2")
        })
        .await;

    // A named secret that does not exist is an error, not anonymous access
    assert!(h.engine.reconcile_at(&name, t0()).await.is_err());

    h.secrets.insert_docker_config(
        "team-a",
        "missing",
        r#"{"auths":{"quay.io":{"auth":"dTpw"}}}"#,
    );
    h.secrets.insert_docker_config(
        "team-a",
        "ghcr",
        r#"{"auths":{"https://ghcr.io":{"username":"bot","password":"s3cret"}}}"#,
    );
    h.engine.reconcile_at(&name, t0()).await.unwrap();

    let status = h.entry(&name).status.unwrap();
    assert_eq!(status.phase, Phase::Ready);
    assert!(status.available_upstream);
    assert_eq!(status.message, None);
}

#[tokio::test]
async fn test_failed_cleanup_keeps_finalizer() {
    let h = Harness::new();
    h.registry.add_upstream("nginx", "sha256:aaa");
    h.desire(DesiredEntry::new("nginx")).await;
    h.engine.reconcile_at(NGINX, t0()).await.unwrap();

    h.registry.fail_deletes(true);
    h.store.delete(NGINX).await.unwrap();
    assert!(h.engine.reconcile_at(NGINX, t0()).await.is_err());

    let image = h.entry(NGINX);
    assert!(image.has_finalizer());
    assert_eq!(image.phase(), Phase::Terminating);
    assert!(image.status.unwrap().message.is_some());
    assert!(h.events.reasons(NGINX).contains(&"CleanupFailed"));

    h.registry.fail_deletes(false);
    h.engine.reconcile_at(NGINX, t0()).await.unwrap();
    assert!(h.store.snapshot(NGINX).is_none());
    assert!(!h.registry.is_cached("nginx"));
}

#[tokio::test]
async fn test_recreate_waits_for_finalization() {
    let h = Harness::new();
    h.registry.add_upstream("nginx", "sha256:aaa");
    h.desire(DesiredEntry::new("nginx")).await;
    h.engine.reconcile_at(NGINX, t0()).await.unwrap();
    h.store.delete(NGINX).await.unwrap();

    let outcome = upsert(h.store.as_ref(), &DesiredEntry::new("nginx"), 3)
        .await
        .unwrap();
    assert_eq!(outcome, UpsertOutcome::PendingDeletion(NGINX.to_string()));

    h.engine.reconcile_at(NGINX, t0()).await.unwrap();
    let outcome = upsert(h.store.as_ref(), &DesiredEntry::new("nginx"), 3)
        .await
        .unwrap();
    assert_eq!(outcome, UpsertOutcome::Created(NGINX.to_string()));

    // The new entry caches the image again
    h.engine.reconcile_at(NGINX, t0()).await.unwrap();
    assert_eq!(h.entry(NGINX).phase(), Phase::Ready);
    assert_eq!(h.registry.pulls(), 2);
}

#[tokio::test]
async fn test_migrated_entry_keeps_cached_content() {
    let h = Harness::new();
    h.registry.add_upstream("nginx", "sha256:aaa");
    h.registry.add_cached("nginx", "sha256:aaa");

    let mut legacy = CachedImage::new(
        "nginx",
        imagecache_controller::crd::CachedImageSpec {
            source_image: "nginx".to_string(),
            retain: true,
            ..Default::default()
        },
    );
    legacy.metadata.finalizers = Some(vec![imagecache_controller::crd::FINALIZER.to_string()]);
    h.store.insert(legacy);

    assert_eq!(migrate_all(h.store.as_ref(), 3).await.unwrap(), 1);
    assert_eq!(h.store.names(), vec![NGINX.to_string()]);
    assert!(h.registry.is_cached("nginx"));

    h.engine.reconcile_at(NGINX, t0()).await.unwrap();
    let image = h.entry(NGINX);
    assert!(image.spec.retain);
    assert_eq!(image.phase(), Phase::Ready);
    assert_eq!(h.registry.pulls(), 0);
    assert_eq!(image.name_any(), NGINX);
}
