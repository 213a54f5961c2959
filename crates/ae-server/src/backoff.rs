//! Retry backoff owned by the runners
//!
//! Bus drivers never retry internally; every connect, initialize and
//! publish retry in this crate goes through a [`BackoffPolicy`]. The delay
//! for attempt `n` is `first * factor^n` clamped to `max`, with jitter
//! applied to the clamped value only, so jitter never feeds back into later
//! delays.

use crate::error::{ServerError, ServerResult};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Randomization applied to each delay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JitterPolicy {
    #[default]
    None,
    /// Uniform in `[0, delay]`
    Full,
    /// Uniform in `[delay / 2, delay]`
    Equal,
}

impl JitterPolicy {
    fn apply(self, delay: Duration) -> Duration {
        let millis = delay.as_millis() as u64;
        if millis == 0 {
            return delay;
        }
        let mut rng = rand::thread_rng();
        match self {
            JitterPolicy::None => delay,
            JitterPolicy::Full => Duration::from_millis(rng.gen_range(0..=millis)),
            JitterPolicy::Equal => Duration::from_millis(rng.gen_range(millis / 2..=millis)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub first: Duration,
    pub max: Duration,
    pub factor: f64,
    pub jitter: JitterPolicy,
    /// Attempts before giving up; `None` retries until cancelled
    pub steps: Option<u32>,
}

impl Default for BackoffPolicy {
    /// Five attempts one second apart with equal jitter
    fn default() -> Self {
        Self {
            first: Duration::from_secs(1),
            max: Duration::from_secs(30),
            factor: 1.0,
            jitter: JitterPolicy::Equal,
            steps: Some(5),
        }
    }
}

impl BackoffPolicy {
    /// Doubling delays capped at 30 s, never giving up
    pub fn forever() -> Self {
        Self {
            first: Duration::from_secs(1),
            max: Duration::from_secs(30),
            factor: 2.0,
            jitter: JitterPolicy::Equal,
            steps: None,
        }
    }

    /// Delay after the failed attempt `attempt` (0-indexed)
    pub fn next(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);
        let base = if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        };
        self.jitter.apply(base)
    }

    /// Whether another attempt is allowed after `attempts` failures
    pub fn allows(&self, attempts: u32) -> bool {
        self.steps.map_or(true, |steps| attempts < steps)
    }
}

/// Run `op` until it succeeds, the policy gives up, or `shutdown` fires
pub async fn retry<T, F, Fut>(
    policy: &BackoffPolicy,
    operation: &'static str,
    shutdown: &CancellationToken,
    mut op: F,
) -> ServerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ServerResult<T>>,
{
    let mut attempts = 0;
    loop {
        if shutdown.is_cancelled() {
            return Err(ServerError::Cancelled);
        }
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        attempts += 1;
        if !policy.allows(attempts) {
            return Err(ServerError::RetriesExhausted {
                operation,
                attempts,
                source: Box::new(err),
            });
        }

        let delay = policy.next(attempts - 1);
        warn!(operation, attempt = attempts, delay = ?delay, error = %err, "Retrying");
        tokio::select! {
            _ = shutdown.cancelled() => return Err(ServerError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ae_event_bus::EventBusError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fixed(first_ms: u64, factor: f64, steps: Option<u32>) -> BackoffPolicy {
        BackoffPolicy {
            first: Duration::from_millis(first_ms),
            max: Duration::from_secs(1),
            factor,
            jitter: JitterPolicy::None,
            steps,
        }
    }

    #[test]
    fn test_exponential_delays_capped() {
        let policy = fixed(100, 2.0, None);
        assert_eq!(policy.next(0), Duration::from_millis(100));
        assert_eq!(policy.next(2), Duration::from_millis(400));
        assert_eq!(policy.next(10), Duration::from_secs(1));
        assert_eq!(policy.next(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_equal_jitter_bounds() {
        let policy = BackoffPolicy {
            jitter: JitterPolicy::Equal,
            ..fixed(1000, 1.0, None)
        };
        for attempt in 0..20 {
            let delay = policy.next(attempt);
            assert!(delay >= Duration::from_millis(500) && delay <= Duration::from_secs(1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let shutdown = CancellationToken::new();

        let value = retry(&fixed(10, 1.0, Some(5)), "connect", &shutdown, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ServerError::Bus(EventBusError::Closed))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_steps() {
        let shutdown = CancellationToken::new();
        let result: ServerResult<()> = retry(&fixed(10, 1.0, Some(3)), "connect", &shutdown, || async {
            Err(ServerError::Bus(EventBusError::Closed))
        })
        .await;

        match result {
            Err(ServerError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retry_stops_when_cancelled() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let result: ServerResult<()> =
            retry(&fixed(10, 1.0, None), "connect", &shutdown, || async { Ok(()) }).await;
        assert!(matches!(result, Err(ServerError::Cancelled)));
    }
}
