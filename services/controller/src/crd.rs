//! The `CachedImage` custom resource.
//!
//! One object per uniquely identified image. The object name is the
//! canonical name of `spec.sourceImage`; see [`imagecache_reference::canonical_name`].

use std::fmt;

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Finalizer guarding cache registry content.
pub const FINALIZER: &str = "imagecache.io/cached-image";

/// Annotation requesting a re-pull on the next reconciliation (any value).
pub const REFRESH_ANNOTATION: &str = "imagecache.io/refresh";

/// Label carrying the sanitized cache repository name.
pub const REPOSITORY_LABEL: &str = "imagecache.io/repository";

/// Desired state of a cache entry.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "imagecache.io",
    version = "v1alpha1",
    kind = "CachedImage",
    plural = "cachedimages",
    shortname = "ci",
    status = "CachedImageStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Cached","type":"boolean","jsonPath":".status.isCached"}"#,
    printcolumn = r#"{"name":"Retain","type":"boolean","jsonPath":".spec.retain"}"#,
    printcolumn = r#"{"name":"Expires","type":"string","format":"date-time","jsonPath":".status.expiresAt"}"#,
    printcolumn = r#"{"name":"Pods","type":"integer","jsonPath":".status.usedBy.count"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CachedImageSpec {
    /// Image reference as written by workloads.
    pub source_image: String,

    /// Never expire this entry, even without consumers.
    #[serde(default)]
    pub retain: bool,

    /// Pull secrets tried in order for upstream credentials.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pull_secret_names: Vec<String>,

    /// Namespace of `pull_secret_names`; the operator default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_secrets_namespace: Option<String>,
}

/// Observed state of a cache entry.
///
/// Optional fields serialize as `null` so a merge patch of the whole status
/// clears them.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CachedImageStatus {
    #[serde(default)]
    pub phase: Phase,

    #[serde(default)]
    pub is_cached: bool,

    /// Upstream digest at the time of the last successful copy.
    #[serde(default)]
    pub digest: Option<String>,

    #[serde(default)]
    pub upstream_digest: Option<String>,

    #[serde(default)]
    pub up_to_date: bool,

    #[serde(default)]
    pub available_upstream: bool,

    /// Last time the upstream registry was contacted.
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,

    #[serde(default)]
    pub last_successful_pull: Option<DateTime<Utc>>,

    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub used_by: UsedBy,

    /// Last failure reason, cleared on success.
    #[serde(default)]
    pub message: Option<String>,
}

/// Lifecycle phase of a cache entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum Phase {
    /// Never reconciled.
    #[default]
    #[serde(rename = "")]
    New,
    Synchronizing,
    Pulling,
    Ready,
    ErrImagePull,
    Terminating,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::New => "",
            Phase::Synchronizing => "Synchronizing",
            Phase::Pulling => "Pulling",
            Phase::Ready => "Ready",
            Phase::ErrImagePull => "ErrImagePull",
            Phase::Terminating => "Terminating",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Consumers of a cache entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UsedBy {
    #[serde(default)]
    pub pods: Vec<PodReference>,
    #[serde(default)]
    pub count: u32,
}

impl UsedBy {
    /// Build from a consumer list, sorted for deterministic writes.
    pub fn new(mut pods: Vec<PodReference>) -> Self {
        pods.sort();
        pods.dedup();
        let count = u32::try_from(pods.len()).unwrap_or(u32::MAX);
        Self { pods, count }
    }
}

/// A pod consuming a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize, JsonSchema)]
pub struct PodReference {
    pub namespace: String,
    pub name: String,
}

impl PodReference {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PodReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl CachedImage {
    /// Returns true if the cleanup finalizer is present.
    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == FINALIZER)
    }

    /// Returns true if deletion was requested.
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Returns true if a re-pull was requested.
    pub fn refresh_requested(&self) -> bool {
        self.annotations().contains_key(REFRESH_ANNOTATION)
    }

    /// Current status, or the default for a never-reconciled entry.
    pub fn current_status(&self) -> CachedImageStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }
}
