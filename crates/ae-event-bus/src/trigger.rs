//! Trigger connections
//!
//! A [`TriggerConnection`] is the live subscription of one trigger of one
//! sensor. It feeds inbound events through a
//! [`ConditionEngine`](ae_condition::ConditionEngine) and runs the trigger
//! action when the dependency expression is satisfied.

use crate::error::{ActionError, ActionResult, EventBusResult};
use ae_condition::{FilterFn, Outcome, ResetReceiver, TransformFn};
use ae_core::Event;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Upper bound on a single action invocation
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Trigger action, invoked with the events that satisfied the expression
pub type ActionFn =
    Arc<dyn Fn(HashMap<String, Event>) -> BoxFuture<'static, ActionResult> + Send + Sync>;

/// Caller-supplied hooks of a trigger
#[derive(Clone)]
pub struct TriggerHandlers {
    pub action: ActionFn,
    pub transform: Option<TransformFn>,
    pub filter: Option<FilterFn>,
    pub action_timeout: Duration,
}

impl std::fmt::Debug for TriggerHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerHandlers")
            .field("transform", &self.transform.is_some())
            .field("filter", &self.filter.is_some())
            .field("action_timeout", &self.action_timeout)
            .finish()
    }
}

impl TriggerHandlers {
    pub fn new(action: ActionFn) -> Self {
        Self {
            action,
            transform: None,
            filter: None,
            action_timeout: DEFAULT_ACTION_TIMEOUT,
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

    pub fn with_action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = timeout;
        self
    }

    /// Run the action, bounded by the action timeout
    pub(crate) async fn invoke(
        &self,
        events: HashMap<String, Event>,
        stats: &TriggerStats,
    ) -> ActionResult {
        let result = match tokio::time::timeout(self.action_timeout, (self.action)(events)).await {
            Ok(result) => result,
            Err(_) => Err(ActionError::Timeout(self.action_timeout)),
        };

        match &result {
            Ok(()) => {
                stats.actions_fired.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                stats.actions_failed.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "Trigger action failed");
            }
        }
        result
    }
}

/// Counters kept per trigger connection
#[derive(Debug, Default)]
pub struct TriggerStats {
    pub events_received: AtomicU64,
    pub duplicates: AtomicU64,
    pub stale: AtomicU64,
    pub filtered: AtomicU64,
    pub transform_failures: AtomicU64,
    pub actions_fired: AtomicU64,
    pub actions_failed: AtomicU64,
    pub decode_failures: AtomicU64,
    pub subscription_errors: AtomicU64,
    pub connection_errors: AtomicU64,
}

/// Point-in-time copy of [`TriggerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerStatsSnapshot {
    pub events_received: u64,
    pub duplicates: u64,
    pub stale: u64,
    pub filtered: u64,
    pub transform_failures: u64,
    pub actions_fired: u64,
    pub actions_failed: u64,
    pub decode_failures: u64,
    pub subscription_errors: u64,
    pub connection_errors: u64,
}

impl TriggerStats {
    pub fn snapshot(&self) -> TriggerStatsSnapshot {
        TriggerStatsSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            transform_failures: self.transform_failures.load(Ordering::Relaxed),
            actions_fired: self.actions_fired.load(Ordering::Relaxed),
            actions_failed: self.actions_failed.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            subscription_errors: self.subscription_errors.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
        }
    }

    /// Count the drop reason of a processed delivery
    pub(crate) fn record(&self, outcome: &Outcome) {
        let counter = match outcome {
            Outcome::Duplicate => &self.duplicates,
            Outcome::Stale => &self.stale,
            Outcome::Filtered => &self.filtered,
            Outcome::TransformFailed(_) => &self.transform_failures,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Live subscription of one trigger
///
/// Created by a sensor driver. The caller drives it with
/// [`subscribe`](TriggerConnection::subscribe) and owns reconnects: when
/// `subscribe` returns an error or [`is_closed`](TriggerConnection::is_closed)
/// reports true, the connection is discarded and a new one is made.
#[async_trait]
pub trait TriggerConnection: Send + Sync {
    fn sensor_name(&self) -> &str;

    fn trigger_name(&self) -> &str;

    fn client_id(&self) -> &str;

    /// Subscribe and process events until `shutdown` is cancelled
    ///
    /// Resets arriving on `resets` clear the condition window. Events
    /// timestamped before `last_reset_time` are dropped as stale. On return
    /// the subscription has been removed and the connection closed.
    async fn subscribe(
        &self,
        shutdown: CancellationToken,
        resets: ResetReceiver,
        last_reset_time: Option<DateTime<Utc>>,
        handlers: TriggerHandlers,
    ) -> EventBusResult<()>;

    /// Whether the underlying bus connection is down
    fn is_closed(&self) -> bool;

    /// Close the underlying bus connection; later calls do nothing
    async fn close(&self) -> EventBusResult<()>;

    fn stats(&self) -> Arc<TriggerStats>;
}

/// Log the outcome of a processed delivery at the level it deserves
pub(crate) fn log_outcome(trigger: &str, dependency: &str, outcome: &Outcome) {
    match outcome {
        Outcome::TransformFailed(e) => {
            warn!(trigger, dependency, error = %e, "Dropped event after transform failure")
        }
        Outcome::Fired(firing) => info!(
            trigger,
            dependency,
            events = firing.events.len(),
            "Triggering actions"
        ),
        _ => {}
    }
}
