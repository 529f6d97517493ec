//! Expiry of unused cache entries.

use chrono::{DateTime, TimeDelta, Utc};

/// Where an entry stands with respect to expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryState {
    /// No expiry is set.
    Never,
    /// Expires at the given instant.
    Pending(DateTime<Utc>),
    /// The expiry instant has passed.
    Due,
}

/// Compute the expiry an entry should carry.
///
/// An entry without consumers and without `retain` expires `delay` after it
/// was first seen unused; an existing expiry is never pushed back. Any
/// consumer or `retain` clears it.
pub fn next_expiry(
    current: Option<DateTime<Utc>>,
    consumers: usize,
    retain: bool,
    now: DateTime<Utc>,
    delay: TimeDelta,
) -> Option<DateTime<Utc>> {
    if consumers > 0 || retain {
        return None;
    }
    Some(current.unwrap_or(now + delay))
}

/// Evaluate an expiry against the current time.
pub fn evaluate(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> ExpiryState {
    match expires_at {
        None => ExpiryState::Never,
        Some(at) if at <= now => ExpiryState::Due,
        Some(at) => ExpiryState::Pending(at),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_expiry_set_when_unused() {
        let delay = TimeDelta::days(30);
        assert_eq!(
            next_expiry(None, 0, false, now(), delay),
            Some(now() + delay)
        );
    }

    #[test]
    fn test_existing_expiry_kept() {
        let earlier = now() - TimeDelta::hours(1);
        assert_eq!(
            next_expiry(Some(earlier), 0, false, now(), TimeDelta::days(30)),
            Some(earlier)
        );
    }

    #[test]
    fn test_expiry_cleared() {
        let set = Some(now());
        assert_eq!(next_expiry(set, 1, false, now(), TimeDelta::days(1)), None);
        assert_eq!(next_expiry(set, 0, true, now(), TimeDelta::days(1)), None);
        assert_eq!(next_expiry(None, 3, true, now(), TimeDelta::days(1)), None);
    }

    #[test]
    fn test_evaluate() {
        assert_eq!(evaluate(None, now()), ExpiryState::Never);
        assert_eq!(evaluate(Some(now()), now()), ExpiryState::Due);
        assert_eq!(
            evaluate(Some(now() - TimeDelta::seconds(1)), now()),
            ExpiryState::Due
        );
        let later = now() + TimeDelta::minutes(5);
        assert_eq!(evaluate(Some(later), now()), ExpiryState::Pending(later));
    }
}
