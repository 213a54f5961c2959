//! Per-trigger condition window
//!
//! The window holds the latest accepted event of every dependency that has
//! fired since the last reset, along with the reset bookkeeping used to
//! reject stale deliveries.

use ae_core::Event;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// An event held in the window for one dependency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowEntry {
    pub event: Event,
    /// Transport timestamp of the delivery that produced this entry
    pub timestamp: DateTime<Utc>,
    /// Transport sequence, when the transport assigns one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    /// Last time the transport (re)delivered this entry
    pub last_delivered: DateTime<Utc>,
}

impl WindowEntry {
    pub fn new(event: Event, timestamp: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            event,
            timestamp,
            sequence: None,
            last_delivered: now,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }
}

/// Which dependencies have fired since the last reset
#[derive(Debug, Clone, Default)]
pub struct ConditionWindow {
    last_reset_time: Option<DateTime<Utc>>,
    entries: HashMap<String, WindowEntry>,
}

impl ConditionWindow {
    pub fn new(last_reset_time: Option<DateTime<Utc>>) -> Self {
        Self {
            last_reset_time,
            entries: HashMap::new(),
        }
    }

    pub fn last_reset_time(&self) -> Option<DateTime<Utc>> {
        self.last_reset_time
    }

    /// Move the reset time forward
    ///
    /// Returns false if `t` is not later than the current reset time. Held
    /// entries are never touched here; only an explicit clear drops them.
    pub fn advance_reset_time(&mut self, t: DateTime<Utc>) -> bool {
        if matches!(self.last_reset_time, Some(current) if t <= current) {
            return false;
        }
        self.last_reset_time = Some(t);
        true
    }

    /// Whether a delivery timestamped `t` predates the last reset
    pub fn is_stale(&self, t: DateTime<Utc>) -> bool {
        matches!(self.last_reset_time, Some(reset) if t < reset)
    }

    pub fn get(&self, dependency: &str) -> Option<&WindowEntry> {
        self.entries.get(dependency)
    }

    pub fn get_mut(&mut self, dependency: &str) -> Option<&mut WindowEntry> {
        self.entries.get_mut(dependency)
    }

    /// Mark a dependency fired, replacing any entry it held
    pub fn mark(&mut self, dependency: impl Into<String>, entry: WindowEntry) {
        self.entries.insert(dependency.into(), entry);
    }

    /// Un-fire a single dependency
    pub fn unmark(&mut self, dependency: &str) -> Option<WindowEntry> {
        self.entries.remove(dependency)
    }

    pub fn is_fired(&self, dependency: &str) -> bool {
        self.entries.contains_key(dependency)
    }

    pub fn fired_set(&self) -> HashSet<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &WindowEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry and return the held events
    pub fn take(&mut self) -> HashMap<String, Event> {
        self.entries
            .drain()
            .map(|(dep, entry)| (dep, entry.event))
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drop entries timestamped before `t`, returning their dependency names
    pub fn clear_before(&mut self, t: DateTime<Utc>) -> Vec<String> {
        self.remove_where(|entry| entry.timestamp < t)
    }

    /// Drop entries the transport has not redelivered since `cutoff`
    pub fn evict_undelivered_since(&mut self, cutoff: DateTime<Utc>) -> Vec<String> {
        self.remove_where(|entry| entry.last_delivered < cutoff)
    }

    fn remove_where<F: Fn(&WindowEntry) -> bool>(&mut self, predicate: F) -> Vec<String> {
        let removed: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| predicate(entry))
            .map(|(dep, _)| dep.clone())
            .collect();
        for dep in &removed {
            self.unmark(dep);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn entry(ts: DateTime<Utc>) -> WindowEntry {
        WindowEntry::new(Event::new("src", "evt", "test", json!({})), ts, ts)
    }

    #[test]
    fn test_reset_time_is_monotonic() {
        let t0 = Utc::now();
        let mut window = ConditionWindow::new(Some(t0));

        assert!(!window.advance_reset_time(t0 - Duration::seconds(5)));
        assert!(!window.advance_reset_time(t0));
        assert_eq!(window.last_reset_time(), Some(t0));

        assert!(window.advance_reset_time(t0 + Duration::seconds(1)));
        assert_eq!(window.last_reset_time(), Some(t0 + Duration::seconds(1)));
    }

    #[test]
    fn test_stale_is_strictly_before_reset() {
        let t0 = Utc::now();
        let window = ConditionWindow::new(Some(t0));

        assert!(window.is_stale(t0 - Duration::milliseconds(1)));
        assert!(!window.is_stale(t0));
        assert!(!ConditionWindow::new(None).is_stale(t0));
    }

    #[test]
    fn test_take_clears_everything() {
        let now = Utc::now();
        let mut window = ConditionWindow::default();
        window.mark("a", entry(now));
        window.mark("b", entry(now));

        let taken = window.take();
        assert_eq!(taken.len(), 2);
        assert!(window.is_empty());
        assert!(window.fired_set().is_empty());
    }

    #[test]
    fn test_clear_before() {
        let now = Utc::now();
        let mut window = ConditionWindow::default();
        window.mark("old", entry(now - Duration::minutes(5)));
        window.mark("new", entry(now));

        let removed = window.clear_before(now - Duration::minutes(1));
        assert_eq!(removed, vec!["old".to_string()]);
        assert!(window.is_fired("new"));
        assert!(!window.is_fired("old"));
    }

    #[test]
    fn test_advancing_reset_time_keeps_entries() {
        let t0 = Utc::now();
        let mut window = ConditionWindow::new(Some(t0));
        window.mark("a", entry(t0 + Duration::seconds(1)));

        assert!(window.advance_reset_time(t0 + Duration::minutes(5)));
        assert!(window.is_fired("a"));
    }

    #[test]
    fn test_evict_undelivered() {
        let now = Utc::now();
        let mut window = ConditionWindow::default();
        let mut held = entry(now - Duration::minutes(20));
        held.last_delivered = now - Duration::minutes(11);
        window.mark("held", held);
        window.mark("fresh", entry(now));

        let evicted = window.evict_undelivered_since(now - Duration::minutes(10));
        assert_eq!(evicted, vec!["held".to_string()]);
        assert_eq!(window.len(), 1);
    }
}
