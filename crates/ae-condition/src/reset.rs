//! Condition resets
//!
//! A trigger's window is cleared on a schedule (`conditionsReset.byTime`) or
//! on a manual signal. Every source feeds the same channel so the consumer
//! never needs to know where a reset came from.
//!
//! Cron expressions take five fields (minute precision) or six fields with
//! leading seconds. Each valid criterion runs in its own task; a criterion
//! that fails to parse is logged and skipped without affecting the others.

use ae_config::ConditionsResetCriteria;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors building a reset schedule
#[derive(Debug, Error)]
pub enum ResetScheduleError {
    #[error("invalid cron expression '{expr}': {source}")]
    InvalidCron {
        expr: String,
        #[source]
        source: cron::error::Error,
    },

    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),
}

/// Result type for reset schedule operations
pub type ResetScheduleResult<T> = Result<T, ResetScheduleError>;

/// Where a reset came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetSource {
    /// A cron criterion, by expression
    Schedule(String),
    /// An external signal
    Manual(String),
}

/// Request to clear a condition window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetSignal {
    pub at: DateTime<Utc>,
    pub source: ResetSource,
}

/// A parsed cron criterion bound to a timezone
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expr: String,
    schedule: Schedule,
    timezone: Tz,
}

impl CronSchedule {
    /// Parse a cron expression with an optional IANA timezone (UTC if absent)
    pub fn parse(expr: &str, timezone: Option<&str>) -> ResetScheduleResult<Self> {
        let timezone = match timezone.map(str::trim).filter(|tz| !tz.is_empty()) {
            Some(name) => {
                Tz::from_str(name).map_err(|_| ResetScheduleError::UnknownTimezone(name.to_string()))?
            }
            None => Tz::UTC,
        };

        let normalized = normalize_cron(expr);
        let schedule =
            Schedule::from_str(&normalized).map_err(|source| ResetScheduleError::InvalidCron {
                expr: expr.to_string(),
                source,
            })?;

        Ok(Self {
            expr: expr.to_string(),
            schedule,
            timezone,
        })
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Most recent scheduled time strictly before `now`
    pub fn previous_before(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = now.with_timezone(&self.timezone);
        self.schedule
            .after(&local)
            .next_back()
            .map(|t| t.with_timezone(&Utc))
            .filter(|t| *t < now)
    }

    /// Next scheduled time strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&self.timezone);
        self.schedule
            .after(&local)
            .next()
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Accept standard five-field cron by pinning the seconds field to zero
fn normalize_cron(expr: &str) -> String {
    let expr = expr.trim();
    if !expr.starts_with('@') && expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    }
}

/// A signal in flight, acknowledged once the consumer has taken it
#[derive(Debug)]
struct Handoff {
    signal: ResetSignal,
    received: oneshot::Sender<()>,
}

/// Send `signal` and wait until the consumer has received it
async fn hand_off(tx: &mpsc::Sender<Handoff>, signal: ResetSignal) -> bool {
    let (received, ack) = oneshot::channel();
    if tx.send(Handoff { signal, received }).await.is_err() {
        return false;
    }
    ack.await.is_ok()
}

/// Sends manual reset signals into a trigger's reset channel
#[derive(Debug, Clone)]
pub struct ManualReset {
    tx: mpsc::Sender<Handoff>,
}

impl ManualReset {
    /// Request a reset, waiting until the consumer has received it
    ///
    /// Returns false if the consumer has gone away first.
    pub async fn reset(&self, reason: impl Into<String>) -> bool {
        let signal = ResetSignal {
            at: Utc::now(),
            source: ResetSource::Manual(reason.into()),
        };
        hand_off(&self.tx, signal).await
    }
}

/// Reset criteria of one trigger
#[derive(Debug)]
pub struct ResetEngine {
    schedules: Vec<CronSchedule>,
    skipped: Vec<ResetScheduleError>,
}

impl ResetEngine {
    /// Build from a trigger's reset criteria, skipping any that fail to parse
    pub fn new(criteria: &[ConditionsResetCriteria]) -> Self {
        let mut schedules = Vec::new();
        let mut skipped = Vec::new();

        for by_time in criteria.iter().filter_map(|c| c.by_time.as_ref()) {
            match CronSchedule::parse(&by_time.cron, by_time.timezone.as_deref()) {
                Ok(schedule) => schedules.push(schedule),
                Err(e) => {
                    warn!(cron = %by_time.cron, error = %e, "Skipping invalid reset criterion");
                    skipped.push(e);
                }
            }
        }

        Self { schedules, skipped }
    }

    pub fn schedules(&self) -> &[CronSchedule] {
        &self.schedules
    }

    /// Criteria that failed to parse
    pub fn skipped(&self) -> &[ResetScheduleError] {
        &self.skipped
    }

    /// Latest scheduled reset strictly before `now` across all criteria
    pub fn last_reset_time(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedules
            .iter()
            .filter_map(|s| s.previous_before(now))
            .max()
    }

    /// Start one task per schedule
    ///
    /// Delivery is a hand-off: a sender completes only once the consumer has
    /// received its signal, so no reset sits buffered while the window keeps
    /// filling. A consumer that stops receiving stalls the senders and nothing
    /// else.
    pub fn spawn(self, shutdown: CancellationToken) -> ResetReceiver {
        let (tx, rx) = mpsc::channel(1);

        let tasks = self
            .schedules
            .into_iter()
            .map(|schedule| tokio::spawn(run_schedule(schedule, tx.clone(), shutdown.clone())))
            .collect();

        ResetReceiver {
            rx,
            manual: ManualReset { tx },
            tasks,
        }
    }
}

async fn run_schedule(
    schedule: CronSchedule,
    tx: mpsc::Sender<Handoff>,
    shutdown: CancellationToken,
) {
    let mut last_fire = Utc::now();
    info!(cron = %schedule.expr(), timezone = %schedule.timezone(), "Reset schedule started");

    loop {
        let Some(next) = schedule.next_after(last_fire.max(Utc::now())) else {
            info!(cron = %schedule.expr(), "Reset schedule has no further fire times");
            return;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or_default();

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        last_fire = next;
        debug!(cron = %schedule.expr(), at = %next, "Reset schedule fired");

        let signal = ResetSignal {
            at: next,
            source: ResetSource::Schedule(schedule.expr().to_string()),
        };
        tokio::select! {
            _ = shutdown.cancelled() => break,
            delivered = hand_off(&tx, signal) => {
                if !delivered {
                    break;
                }
            }
        }
    }

    debug!(cron = %schedule.expr(), "Reset schedule stopped");
}

/// Receiving side of a trigger's resets
#[derive(Debug)]
pub struct ResetReceiver {
    rx: mpsc::Receiver<Handoff>,
    manual: ManualReset,
    tasks: Vec<JoinHandle<()>>,
}

impl ResetReceiver {
    /// Next reset signal from any source
    pub async fn recv(&mut self) -> Option<ResetSignal> {
        let Handoff { signal, received } = self.rx.recv().await?;
        let _ = received.send(());
        Some(signal)
    }

    /// Handle for sending manual resets
    pub fn manual(&self) -> ManualReset {
        self.manual.clone()
    }

    /// Number of running schedule tasks
    pub fn schedule_count(&self) -> usize {
        self.tasks.iter().filter(|t| !t.is_finished()).count()
    }
}

impl Drop for ResetReceiver {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
