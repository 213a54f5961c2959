//! Condition engine
//!
//! A [`ConditionEngine`] owns the [`ConditionWindow`] of one trigger and
//! decides, event by event, whether the trigger's dependency expression is
//! satisfied. It performs no I/O: the caller feeds deliveries in, invokes
//! the trigger action on [`Outcome::Fired`], and acknowledges messages.

use crate::dedup::RecentEvents;
use crate::expr::DependencyExpression;
use crate::window::{ConditionWindow, WindowEntry};
use ae_core::Event;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// How long a held entry may go without redelivery before it is dropped
pub const DEFAULT_HELD_ENTRY_TTL_SECS: i64 = 600;

/// A transform rejected an event
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to transform event for dependency '{dependency}': {reason}")]
pub struct TransformError {
    pub dependency: String,
    pub reason: String,
}

impl TransformError {
    pub fn new(dependency: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            dependency: dependency.into(),
            reason: reason.into(),
        }
    }
}

/// Rewrites an event before it enters the window
pub type TransformFn = Arc<dyn Fn(&str, Event) -> Result<Event, TransformError> + Send + Sync>;

/// Decides whether an event is of interest to a dependency
pub type FilterFn = Arc<dyn Fn(&str, &Event) -> bool + Send + Sync>;

/// One inbound event resolved to a dependency
#[derive(Debug, Clone)]
pub struct Delivery {
    pub dependency: String,
    pub event: Event,
    /// Transport timestamp of the message
    pub timestamp: DateTime<Utc>,
    pub sequence: Option<u64>,
}

impl Delivery {
    pub fn new(dependency: impl Into<String>, event: Event, timestamp: DateTime<Utc>) -> Self {
        Self {
            dependency: dependency.into(),
            event,
            timestamp,
            sequence: None,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }
}

/// Events handed to the trigger action when the expression is satisfied
#[derive(Debug, Clone)]
pub struct Firing {
    pub events: HashMap<String, Event>,
    /// Timestamp of the delivery that completed the expression
    pub at: DateTime<Utc>,
}

/// Result of processing one delivery
#[derive(Debug)]
pub enum Outcome {
    /// Event ID already processed within the duplicate window
    Duplicate,
    /// Timestamped before the last reset
    Stale,
    /// Dependency is not referenced by the expression
    Ignored,
    /// Rejected by the filter
    Filtered,
    /// Transform failed; the window is unchanged
    TransformFailed(TransformError),
    /// Redelivery of the entry already held for this dependency
    Redelivered,
    /// Older than the entry already held for this dependency
    Superseded,
    /// Accepted, expression not yet satisfied
    Pending,
    /// Expression satisfied; the window has been cleared
    Fired(Firing),
}

impl Outcome {
    pub fn is_fired(&self) -> bool {
        matches!(self, Outcome::Fired(_))
    }

    /// Short label used in logs and counters
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Duplicate => "duplicate",
            Outcome::Stale => "stale",
            Outcome::Ignored => "ignored",
            Outcome::Filtered => "filtered",
            Outcome::TransformFailed(_) => "transform_failed",
            Outcome::Redelivered => "redelivered",
            Outcome::Superseded => "superseded",
            Outcome::Pending => "pending",
            Outcome::Fired(_) => "fired",
        }
    }
}

/// Evaluates a dependency expression over a window of fired dependencies
pub struct ConditionEngine {
    expression: DependencyExpression,
    window: ConditionWindow,
    transform: Option<TransformFn>,
    filter: Option<FilterFn>,
    held_entry_ttl: Option<Duration>,
    recent: Option<Arc<RecentEvents>>,
}

impl fmt::Debug for ConditionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionEngine")
            .field("expression", &self.expression.as_str())
            .field("window", &self.window)
            .field("held_entry_ttl", &self.held_entry_ttl)
            .finish_non_exhaustive()
    }
}

impl ConditionEngine {
    /// Create an engine whose window starts at `last_reset_time`
    pub fn new(expression: DependencyExpression, last_reset_time: Option<DateTime<Utc>>) -> Self {
        Self {
            expression,
            window: ConditionWindow::new(last_reset_time),
            transform: None,
            filter: None,
            held_entry_ttl: None,
            recent: None,
        }
    }

    pub fn with_transform(mut self, transform: TransformFn) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn with_filter(mut self, filter: FilterFn) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Drop held entries the transport stops redelivering for `ttl`
    ///
    /// Only meaningful for transports that redeliver unacknowledged messages.
    pub fn with_held_entry_ttl(mut self, ttl: Duration) -> Self {
        self.held_entry_ttl = Some(ttl);
        self
    }

    /// Drop redeliveries of events already consumed
    pub fn with_dedup(mut self, recent: Arc<RecentEvents>) -> Self {
        self.recent = Some(recent);
        self
    }

    pub fn expression(&self) -> &DependencyExpression {
        &self.expression
    }

    pub fn window(&self) -> &ConditionWindow {
        &self.window
    }

    pub fn last_reset_time(&self) -> Option<DateTime<Utc>> {
        self.window.last_reset_time()
    }

    /// Process one delivery at wall-clock time `now`
    pub fn process(&mut self, delivery: Delivery, now: DateTime<Utc>) -> Outcome {
        let Delivery {
            dependency,
            event,
            timestamp,
            sequence,
        } = delivery;

        if let Some(recent) = &self.recent {
            if recent.contains(&event.id, now) {
                info!(dependency = %dependency, event_id = %event.id, "Duplicate delivery detected");
                return Outcome::Duplicate;
            }
        }

        if self.window.is_stale(timestamp) {
            debug!(
                dependency = %dependency,
                event_id = %event.id,
                "Dropping event timestamped before the last reset"
            );
            self.remember(&event.id, now);
            return Outcome::Stale;
        }

        if !self.expression.variables().contains(&dependency.as_str()) {
            trace!(dependency = %dependency, "Dependency not referenced by expression");
            return Outcome::Ignored;
        }

        if let Some(filter) = &self.filter {
            if !filter(&dependency, &event) {
                debug!(dependency = %dependency, event_id = %event.id, "Event filtered out");
                return Outcome::Filtered;
            }
        }

        let event = match &self.transform {
            Some(transform) => match transform(&dependency, event) {
                Ok(event) => event,
                Err(e) => {
                    warn!(dependency = %dependency, error = %e, "Failed to apply event transformation");
                    return Outcome::TransformFailed(e);
                }
            },
            None => event,
        };

        if !self.expression.requires_and() {
            debug!(dependency = %dependency, "Expression has no conjunction, firing immediately");
            self.remember(&event.id, now);
            let mut events = HashMap::new();
            events.insert(dependency, event);
            return Outcome::Fired(Firing {
                events,
                at: timestamp,
            });
        }

        if let Some(held) = self.window.get_mut(&dependency) {
            if timestamp == held.timestamp {
                held.last_delivered = now;
                trace!(dependency = %dependency, "Refreshed delivery time of held event");
                return Outcome::Redelivered;
            }
            if timestamp < held.timestamp {
                debug!(
                    dependency = %dependency,
                    event_id = %event.id,
                    "Dropping event, a later one already satisfies the dependency"
                );
                let id = event.id.clone();
                self.remember(&id, now);
                return Outcome::Superseded;
            }
        }

        let mut entry = WindowEntry::new(event, timestamp, now);
        if let Some(seq) = sequence {
            entry = entry.with_sequence(seq);
        }
        self.window.mark(dependency.as_str(), entry);

        if let Some(ttl) = self.held_entry_ttl {
            for evicted in self.window.evict_undelivered_since(now - ttl) {
                info!(dependency = %evicted, "Dropping held event that is no longer redelivered");
            }
        }

        let window = &self.window;
        if !self.expression.evaluate(|name| window.is_fired(name)) {
            debug!(
                dependency = %dependency,
                fired = ?window.fired_set(),
                "Trigger conditions not met"
            );
            return Outcome::Pending;
        }

        // lastResetTime is left alone: a late delivery on another subject
        // may still carry an earlier timestamp
        let events = self.window.take();
        for fired in events.values() {
            self.remember(&fired.id, now);
        }
        info!(
            expression = %self.expression,
            dependencies = ?events.keys().collect::<Vec<_>>(),
            "Trigger conditions met"
        );

        Outcome::Fired(Firing {
            events,
            at: timestamp,
        })
    }

    fn remember(&self, id: &str, now: DateTime<Utc>) {
        if let Some(recent) = &self.recent {
            recent.record(id, now);
        }
    }

    /// Clear the window and move the reset time to `at`
    ///
    /// Returns the number of entries discarded.
    pub fn reset(&mut self, at: DateTime<Utc>) -> usize {
        let discarded = self.window.len();
        self.window.clear();
        self.window.advance_reset_time(at);
        info!(discarded, reset_time = %at, "Condition window reset");
        discarded
    }

    /// Put back an entry persisted by a previous connection
    ///
    /// Entries predating the last reset, or for dependencies the expression
    /// does not reference, are refused.
    pub fn restore(&mut self, dependency: &str, entry: WindowEntry) -> bool {
        if self.window.is_stale(entry.timestamp)
            || !self.expression.variables().contains(&dependency)
        {
            return false;
        }
        self.window.mark(dependency, entry);
        true
    }

    /// Whether the restored window already satisfies the expression
    pub fn is_satisfied(&self) -> bool {
        self.expression.evaluate(|name| self.window.is_fired(name))
    }

    /// Fire from the current window contents
    ///
    /// Used after [`restore`](Self::restore) when persisted entries already
    /// satisfy the expression.
    pub fn fire_restored(&mut self, now: DateTime<Utc>) -> Option<Firing> {
        if self.window.is_empty() || !self.is_satisfied() {
            return None;
        }
        let at = self
            .window
            .entries()
            .map(|(_, entry)| entry.timestamp)
            .max()
            .unwrap_or(now);
        let events = self.window.take();
        Some(Firing { events, at })
    }
}
