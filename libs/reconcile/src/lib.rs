//! Reconciliation loop primitives.
//!
//! This library provides helpers for implementing reconciliation loops
//! that converge desired state to current state. Key concepts:
//!
//! - **Optimistic update**: read a fresh copy, compute a change, write it
//!   back guarded by the version that was read. A lost race starts over from
//!   the read.
//! - **Backoff**: failed resources are retried with an exponentially growing
//!   delay that resets once the resource succeeds.
//! - **Deadlines**: future work is expressed as "run again no earlier than T".
//!
//! # Invariants
//!
//! - All operations are idempotent
//! - Decisions are deterministic given the same inputs
//! - A write is only issued when the computed change is non-empty

use std::collections::BTreeMap;
use std::future::Future;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Errors that can signal a lost optimistic-concurrency race.
pub trait Conflicting {
    /// Returns true if the write was rejected because the stored version moved.
    fn is_conflict(&self) -> bool;
}

/// Result of an optimistic update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transaction<T> {
    /// The object does not exist (anymore).
    Missing,

    /// The computed change was empty; nothing was written.
    Unchanged(T),

    /// The change was written; holds the stored object after the write.
    Written(T),
}

impl<T> Transaction<T> {
    /// The latest known copy of the object, if it exists.
    pub fn into_inner(self) -> Option<T> {
        match self {
            Self::Missing => None,
            Self::Unchanged(value) | Self::Written(value) => Some(value),
        }
    }
}

/// Run a read → apply → write transaction, starting over from the read when
/// the write loses a concurrency race.
///
/// `apply` inspects the freshly read object and returns the change to write,
/// or `None` when the object is already in the desired state. `write`
/// receives the read object (carrying the version to compare against) and
/// the change.
///
/// After `max_attempts` lost races the conflict error is returned to the
/// caller, which is expected to retry the whole reconciliation.
pub async fn optimistic<T, P, E, R, RF, A, W, WF>(
    max_attempts: u32,
    mut read: R,
    mut apply: A,
    mut write: W,
) -> Result<Transaction<T>, E>
where
    E: Conflicting,
    R: FnMut() -> RF,
    RF: Future<Output = Result<Option<T>, E>>,
    A: FnMut(&T) -> Option<P>,
    W: FnMut(T, P) -> WF,
    WF: Future<Output = Result<T, E>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let Some(current) = read().await? else {
            return Ok(Transaction::Missing);
        };

        let Some(change) = apply(&current) else {
            return Ok(Transaction::Unchanged(current));
        };

        match write(current, change).await {
            Ok(written) => return Ok(Transaction::Written(written)),
            Err(e) if e.is_conflict() && attempt < max_attempts => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Delay until `deadline`, never negative.
///
/// Used to turn "run again at T" into a requeue interval.
pub fn delay_until(deadline: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (deadline - now).to_std().unwrap_or(Duration::ZERO)
}

/// Per-resource exponential backoff for failed reconciliations.
#[derive(Debug, Clone)]
pub struct BackoffTracker {
    /// Delay after the first failure.
    base: Duration,

    /// Upper bound on the delay.
    max: Duration,

    /// A failure streak older than this is forgotten.
    window: Duration,

    /// Tracked failures: resource_key -> (count, last_failure_time).
    failures: BTreeMap<String, (u32, Instant)>,
}

impl Default for BackoffTracker {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX, DEFAULT_BACKOFF_WINDOW)
    }
}

impl BackoffTracker {
    /// Create a new backoff tracker.
    pub fn new(base: Duration, max: Duration, window: Duration) -> Self {
        Self {
            base,
            max,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for a resource.
    ///
    /// Returns the delay before the resource should be retried.
    pub fn record_failure(&mut self, resource_key: &str) -> Duration {
        let now = Instant::now();

        let (count, last) = self
            .failures
            .entry(resource_key.to_string())
            .or_insert((0, now));

        // Reset if the streak went quiet
        if now.duration_since(*last) > self.window {
            *count = 0;
        }

        *count += 1;
        *last = now;

        let exponent = (*count - 1).min(16);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }

    /// Longest delay this tracker hands out.
    pub fn ceiling(&self) -> Duration {
        self.max
    }

    /// Number of consecutive failures recorded for a resource.
    pub fn failures(&self, resource_key: &str) -> u32 {
        self.failures
            .get(resource_key)
            .map(|(count, _)| *count)
            .unwrap_or(0)
    }

    /// Clear failure tracking for a resource (on success).
    pub fn clear(&mut self, resource_key: &str) {
        self.failures.remove(resource_key);
    }

    /// Prune entries whose last failure is outside the window.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.failures
            .retain(|_, (_, last)| now.duration_since(*last) <= self.window);
    }
}

/// Default delay after a first failure.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(5);

/// Default backoff ceiling.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(5 * 60);

/// Default window after which a failure streak is forgotten.
pub const DEFAULT_BACKOFF_WINDOW: Duration = Duration::from_secs(10 * 60); // 10 minutes

/// Default number of optimistic write attempts before giving up.
pub const DEFAULT_CONFLICT_ATTEMPTS: u32 = 3;
