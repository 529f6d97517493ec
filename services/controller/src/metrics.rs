//! Cache counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Receives cache-in and cache-removal counts.
pub trait MetricsSink: Send + Sync {
    fn image_cached(&self);
    fn image_removed(&self);
}

/// In-process monotonic counters.
#[derive(Debug, Default)]
pub struct CacheCounters {
    cached: AtomicU64,
    removed: AtomicU64,
}

impl CacheCounters {
    pub fn cached(&self) -> u64 {
        self.cached.load(Ordering::Relaxed)
    }

    pub fn removed(&self) -> u64 {
        self.removed.load(Ordering::Relaxed)
    }
}

impl MetricsSink for CacheCounters {
    fn image_cached(&self) {
        self.cached.fetch_add(1, Ordering::Relaxed);
    }

    fn image_removed(&self) {
        self.removed.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let counters = CacheCounters::default();
        counters.image_cached();
        counters.image_cached();
        counters.image_removed();

        assert_eq!(counters.cached(), 2);
        assert_eq!(counters.removed(), 1);
    }
}
