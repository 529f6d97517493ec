//! Kubernetes events for cache entry transitions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use tracing::warn;

use crate::crd::CachedImage;

/// A significant lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Queued,
    Caching,
    Cached { digest: String },
    CacheFailed { message: String },
    Expiring { at: DateTime<Utc> },
    Expired,
    CleaningUp,
    CleanedUp,
    CleanupFailed { message: String },
}

impl LifecycleEvent {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Queued => "Queued",
            Self::Caching => "Caching",
            Self::Cached { .. } => "Cached",
            Self::CacheFailed { .. } => "CacheFailed",
            Self::Expiring { .. } => "Expiring",
            Self::Expired => "Expired",
            Self::CleaningUp => "CleaningUp",
            Self::CleanedUp => "CleanedUp",
            Self::CleanupFailed { .. } => "CleanupFailed",
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Self::Queued | Self::Caching | Self::Cached { .. } | Self::CacheFailed { .. } => "Cache",
            Self::Expiring { .. } | Self::Expired => "Expire",
            Self::CleaningUp | Self::CleanedUp | Self::CleanupFailed { .. } => "Cleanup",
        }
    }

    pub fn is_warning(&self) -> bool {
        matches!(self, Self::CacheFailed { .. } | Self::CleanupFailed { .. })
    }

    /// Human-readable note for an image.
    pub fn note(&self, source: &str) -> String {
        match self {
            Self::Queued => format!("Image {source} queued for caching"),
            Self::Caching => format!("Caching image {source}"),
            Self::Cached { digest } => format!("Image {source} cached at {digest}"),
            Self::CacheFailed { message } => format!("Failed to cache image {source}: {message}"),
            Self::Expiring { at } => format!("Image {source} is unused and expires at {}", at.to_rfc3339()),
            Self::Expired => format!("Image {source} expired"),
            Self::CleaningUp => format!("Removing image {source} from the cache"),
            Self::CleanedUp => format!("Image {source} removed from the cache"),
            Self::CleanupFailed { message } => {
                format!("Failed to remove image {source} from the cache: {message}")
            }
        }
    }
}

/// Publishes lifecycle events. Publishing never fails the caller.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, image: &CachedImage, event: LifecycleEvent);
}

/// Events recorded on the cache entry object.
pub struct KubeEvents {
    recorder: Recorder,
}

impl KubeEvents {
    pub fn new(client: Client, controller: &str) -> Self {
        let reporter = Reporter {
            controller: controller.to_string(),
            instance: std::env::var("HOSTNAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventSink for KubeEvents {
    async fn publish(&self, image: &CachedImage, event: LifecycleEvent) {
        let event_type = if event.is_warning() {
            EventType::Warning
        } else {
            EventType::Normal
        };
        let record = Event {
            type_: event_type,
            reason: event.reason().to_string(),
            note: Some(event.note(&image.spec.source_image)),
            action: event.action().to_string(),
            secondary: None,
        };

        if let Err(e) = self.recorder.publish(&record, &image.object_ref(&())).await {
            warn!(reason = event.reason(), error = %e, "Failed to publish event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reasons_and_severity() {
        let failed = LifecycleEvent::CacheFailed {
            message: "boom".to_string(),
        };
        assert_eq!(failed.reason(), "CacheFailed");
        assert_eq!(failed.action(), "Cache");
        assert!(failed.is_warning());

        assert_eq!(LifecycleEvent::Expired.action(), "Expire");
        assert!(!LifecycleEvent::CleanedUp.is_warning());
    }

    #[test]
    fn test_notes() {
        let cached = LifecycleEvent::Cached {
            digest: "sha256:abc".to_string(),
        };
        assert_eq!(cached.note("nginx"), "Image nginx cached at sha256:abc");
        assert_eq!(
            LifecycleEvent::CleanupFailed {
                message: "timeout".to_string()
            }
            .note("nginx"),
            "Failed to remove image nginx from the cache: timeout"
        );
    }
}
