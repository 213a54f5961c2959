//! Duplicate-delivery detection
//!
//! At-least-once transports may hand the same event over more than once.
//! [`RecentEvents`] remembers processed event IDs for a fixed TTL so a
//! redelivery within that window is recognized and dropped.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::trace;

/// Event IDs processed recently, with the time they were recorded
#[derive(Debug)]
pub struct RecentEvents {
    seen: DashMap<String, DateTime<Utc>>,
    ttl: Duration,
}

impl RecentEvents {
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Whether `id` was recorded and has not yet expired at `now`
    pub fn contains(&self, id: &str, now: DateTime<Utc>) -> bool {
        self.seen
            .get(id)
            .map(|recorded| now - *recorded <= self.ttl)
            .unwrap_or(false)
    }

    /// Record `id` as processed at `now`
    pub fn record(&self, id: impl Into<String>, now: DateTime<Utc>) {
        self.seen.insert(id.into(), now);
    }

    /// Record `id` unless it is already present
    ///
    /// Returns true when the ID was new.
    pub fn check_and_record(&self, id: &str, now: DateTime<Utc>) -> bool {
        if self.contains(id, now) {
            return false;
        }
        self.record(id, now);
        true
    }

    /// Drop IDs older than the TTL, returning how many were removed
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.seen.len();
        self.seen.retain(|_, recorded| now - *recorded <= self.ttl);
        let removed = before - self.seen.len();
        if removed > 0 {
            trace!(removed, "Evicted expired event IDs");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_detected_within_ttl() {
        let cache = RecentEvents::new(Duration::minutes(5));
        let now = Utc::now();

        assert!(cache.check_and_record("evt-1", now));
        assert!(!cache.check_and_record("evt-1", now + Duration::minutes(4)));
        assert!(cache.check_and_record("evt-2", now));
    }

    #[test]
    fn test_expired_id_is_new_again() {
        let cache = RecentEvents::new(Duration::minutes(1));
        let now = Utc::now();

        cache.record("evt-1", now);
        assert!(!cache.contains("evt-1", now + Duration::seconds(61)));
    }

    #[test]
    fn test_evict_expired() {
        let cache = RecentEvents::new(Duration::minutes(5));
        let now = Utc::now();

        cache.record("old", now - Duration::minutes(6));
        cache.record("new", now);

        assert_eq!(cache.evict_expired(now), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains("new", now));
    }
}
