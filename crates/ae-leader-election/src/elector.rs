//! Elector contract

use crate::error::ElectionResult;
use ae_config::ENV_LEADER_ELECTION;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// How long a cancelled leader task may take to wind down
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Work to run while leading; the token is cancelled when leadership ends
pub type StartedLeadingFn = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, ()> + Send + Sync>;

/// Called synchronously once leadership has ended
pub type StoppedLeadingFn = Arc<dyn Fn() + Send + Sync>;

/// Hooks invoked on leadership transitions
#[derive(Clone)]
pub struct LeaderCallbacks {
    pub on_started_leading: StartedLeadingFn,
    pub on_stopped_leading: StoppedLeadingFn,
}

impl std::fmt::Debug for LeaderCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderCallbacks").finish_non_exhaustive()
    }
}

impl LeaderCallbacks {
    pub fn new(on_started_leading: StartedLeadingFn, on_stopped_leading: StoppedLeadingFn) -> Self {
        Self {
            on_started_leading,
            on_stopped_leading,
        }
    }
}

/// Tracks the task started for the current leadership term
///
/// Starting spawns the callback bound to a fresh child of `parent`;
/// stopping cancels that child, waits for the task (aborting it after
/// [`STOP_GRACE`]), then calls `on_stopped_leading`.
pub(crate) struct Leadership {
    parent: CancellationToken,
    callbacks: LeaderCallbacks,
    current: Option<(CancellationToken, tokio::task::JoinHandle<()>)>,
}

impl Leadership {
    pub(crate) fn new(parent: CancellationToken, callbacks: LeaderCallbacks) -> Self {
        Self {
            parent,
            callbacks,
            current: None,
        }
    }

    pub(crate) fn is_leading(&self) -> bool {
        self.current.is_some()
    }

    pub(crate) fn start(&mut self) {
        if self.current.is_some() {
            return;
        }
        let token = self.parent.child_token();
        let task = tokio::spawn((self.callbacks.on_started_leading)(token.clone()));
        self.current = Some((token, task));
    }

    /// Returns whether leadership was held
    pub(crate) async fn stop(&mut self) -> bool {
        let Some((token, task)) = self.current.take() else {
            return false;
        };
        token.cancel();
        let abort = task.abort_handle();
        if tokio::time::timeout(STOP_GRACE, task).await.is_err() {
            warn!(grace = ?STOP_GRACE, "Leader task ignored cancellation, aborting it");
            abort.abort();
        }
        (self.callbacks.on_stopped_leading)();
        true
    }
}

/// Runs for the life of `shutdown`, invoking callbacks as leadership changes
///
/// When `shutdown` is cancelled while leading, `on_stopped_leading` has been
/// called by the time `run_or_die` returns. An error means the process can no
/// longer tell whether it is leader and should exit.
#[async_trait]
pub trait Elector: Send + Sync {
    async fn run_or_die(
        &self,
        shutdown: CancellationToken,
        callbacks: LeaderCallbacks,
    ) -> ElectionResult<()>;
}

/// Which elector a deployment runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectorKind {
    /// Raft-style election over the event bus
    Bus,
    /// Lease held through an external coordination service
    Lease,
}

impl ElectorKind {
    /// `k8s` (any case) selects leases, anything else the bus
    pub fn from_value(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.eq_ignore_ascii_case("k8s") => ElectorKind::Lease,
            _ => ElectorKind::Bus,
        }
    }

    pub fn from_env() -> Self {
        Self::from_value(std::env::var(ENV_LEADER_ELECTION).ok().as_deref())
    }
}
