//! Reverse index from cache entries to the pods consuming them.
//!
//! Pods rewritten by the admission webhook carry one annotation per container
//! with the original image reference. Those references are mapped to entry
//! names with the same naming function the webhook uses.

use std::collections::{BTreeSet, HashMap};

use imagecache_reference::canonical_name;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher;
use kube::ResourceExt;
use tokio::sync::{watch, RwLock};
use tracing::debug;

use crate::crd::PodReference;

/// Annotation prefix for the original image of a container.
pub const ORIGINAL_IMAGE_ANNOTATION_PREFIX: &str = "imagecache.io/original-image-";

/// Annotation prefix for the original image of an init container.
pub const ORIGINAL_INIT_IMAGE_ANNOTATION_PREFIX: &str = "imagecache.io/original-init-image-";

/// Label the webhook sets on pods it rewrote.
pub const REWRITTEN_LABEL: &str = "imagecache.io/images-rewritten";

/// What the index knows about one pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRecord {
    pub pod: PodReference,
    /// Entry names referenced by the pod.
    pub entries: BTreeSet<String>,
    /// Deletion requested; still indexed but not counted.
    pub terminating: bool,
}

impl ConsumerRecord {
    /// Build the record of a pod. Returns `None` for pods without identity.
    pub fn from_pod(pod: &Pod) -> Option<Self> {
        let pod_ref = pod_reference(pod)?;

        let entries = pod
            .annotations()
            .iter()
            .filter(|(key, _)| {
                key.starts_with(ORIGINAL_IMAGE_ANNOTATION_PREFIX)
                    || key.starts_with(ORIGINAL_INIT_IMAGE_ANNOTATION_PREFIX)
            })
            .filter_map(|(key, source)| match canonical_name(source) {
                Ok(name) => Some(name),
                Err(e) => {
                    debug!(pod = %pod_ref, annotation = %key, error = %e, "Ignoring unparsable original image");
                    None
                }
            })
            .collect();

        Some(Self {
            pod: pod_ref,
            entries,
            terminating: pod.metadata.deletion_timestamp.is_some(),
        })
    }
}

fn pod_reference(pod: &Pod) -> Option<PodReference> {
    let name = pod.metadata.name.clone()?;
    let namespace = pod.namespace()?;
    Some(PodReference::new(namespace, name))
}

/// Index updates, converted once from watch events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerEvent {
    Upserted(ConsumerRecord),
    Removed(PodReference),
    /// A full relist begins; records until `ResyncFinished` replace the index.
    ResyncStarted,
    ResyncUpserted(ConsumerRecord),
    ResyncFinished,
}

impl ConsumerEvent {
    pub fn from_watch(event: watcher::Event<Pod>) -> Option<Self> {
        match event {
            watcher::Event::Apply(pod) => ConsumerRecord::from_pod(&pod).map(Self::Upserted),
            watcher::Event::Delete(pod) => pod_reference(&pod).map(Self::Removed),
            watcher::Event::Init => Some(Self::ResyncStarted),
            watcher::Event::InitApply(pod) => {
                ConsumerRecord::from_pod(&pod).map(Self::ResyncUpserted)
            }
            watcher::Event::InitDone => Some(Self::ResyncFinished),
        }
    }
}

#[derive(Debug, Default)]
struct UsageIndex {
    pods: HashMap<PodReference, ConsumerRecord>,
    by_entry: HashMap<String, BTreeSet<PodReference>>,
    resync: Option<HashMap<PodReference, ConsumerRecord>>,
}

impl UsageIndex {
    fn upsert(&mut self, record: ConsumerRecord) -> BTreeSet<String> {
        if self.pods.get(&record.pod) == Some(&record) {
            return BTreeSet::new();
        }

        let mut affected = self.remove(&record.pod);
        for entry in &record.entries {
            self.by_entry
                .entry(entry.clone())
                .or_default()
                .insert(record.pod.clone());
            affected.insert(entry.clone());
        }
        self.pods.insert(record.pod.clone(), record);
        affected
    }

    fn remove(&mut self, pod: &PodReference) -> BTreeSet<String> {
        let Some(previous) = self.pods.remove(pod) else {
            return BTreeSet::new();
        };

        for entry in &previous.entries {
            if let Some(pods) = self.by_entry.get_mut(entry) {
                pods.remove(pod);
                if pods.is_empty() {
                    self.by_entry.remove(entry);
                }
            }
        }
        previous.entries
    }

    fn replace_all(&mut self, records: HashMap<PodReference, ConsumerRecord>) -> BTreeSet<String> {
        let stale: Vec<PodReference> = self
            .pods
            .keys()
            .filter(|pod| !records.contains_key(*pod))
            .cloned()
            .collect();

        let mut affected = BTreeSet::new();
        for pod in stale {
            affected.extend(self.remove(&pod));
        }
        for record in records.into_values() {
            affected.extend(self.upsert(record));
        }
        affected
    }

    fn consumers(&self, entry: &str) -> Vec<PodReference> {
        self.by_entry
            .get(entry)
            .into_iter()
            .flatten()
            .filter(|pod| self.pods.get(*pod).is_some_and(|r| !r.terminating))
            .cloned()
            .collect()
    }
}

/// Shared usage index.
pub struct UsageTracker {
    index: RwLock<UsageIndex>,
    ready: watch::Sender<bool>,
}

impl UsageTracker {
    pub fn new() -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            index: RwLock::new(UsageIndex::default()),
            ready,
        }
    }

    /// Apply an update; returns the entries whose consumers may have changed.
    pub async fn apply(&self, event: ConsumerEvent) -> BTreeSet<String> {
        let mut index = self.index.write().await;
        match event {
            ConsumerEvent::Upserted(record) => index.upsert(record),
            ConsumerEvent::Removed(pod) => index.remove(&pod),
            ConsumerEvent::ResyncStarted => {
                index.resync = Some(HashMap::new());
                BTreeSet::new()
            }
            ConsumerEvent::ResyncUpserted(record) => match index.resync.as_mut() {
                Some(buffer) => {
                    buffer.insert(record.pod.clone(), record);
                    BTreeSet::new()
                }
                None => index.upsert(record),
            },
            ConsumerEvent::ResyncFinished => {
                let affected = match index.resync.take() {
                    Some(records) => index.replace_all(records),
                    None => BTreeSet::new(),
                };
                self.ready.send_replace(true);
                debug!(pods = index.pods.len(), entries = index.by_entry.len(), "Usage index synchronized");
                affected
            }
        }
    }

    /// Pods consuming an entry, sorted, excluding pods pending deletion.
    pub async fn consumers(&self, entry: &str) -> Vec<PodReference> {
        self.index.read().await.consumers(entry)
    }

    /// Returns true once the first full listing was applied.
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait for the first full listing.
    pub async fn wait_ready(&self) {
        let mut ready = self.ready.subscribe();
        // The sender lives as long as self, so this cannot fail
        let _ = ready.wait_for(|ready| *ready).await;
    }
}

impl Default for UsageTracker {
    fn default() -> Self {
        Self::new()
    }
}
