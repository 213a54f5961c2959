//! Lease-based elector
//!
//! Mutual exclusion is delegated to a lease record held by an external
//! coordination service behind [`LeaseLock`]. The holder renews the lease
//! every retry period; other candidates take it over once it has gone
//! unrenewed for the lease duration. [`MemoryLeaseStore`] keeps leases in
//! process.

use crate::elector::{Elector, LeaderCallbacks, Leadership};
use crate::error::{ElectionError, ElectionResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The lease as stored by the coordination service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    /// Identity of the holder; empty when released
    pub holder: String,
    pub lease_duration_secs: u64,
    pub acquired_at: DateTime<Utc>,
    pub renewed_at: DateTime<Utc>,
    /// Number of times the lease changed hands
    pub transitions: u32,
}

impl LeaseRecord {
    fn is_held_by_other(&self, identity: &str, now: DateTime<Utc>) -> bool {
        if self.holder.is_empty() || self.holder == identity {
            return false;
        }
        let expiry = self.renewed_at + chrono::Duration::seconds(self.lease_duration_secs as i64);
        expiry > now
    }
}

/// A lease record with the version it was read at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedLease {
    pub record: LeaseRecord,
    pub version: u64,
}

/// Compare-and-swap access to one named lease
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Identity this lock acquires the lease as
    fn identity(&self) -> &str;

    async fn get(&self) -> ElectionResult<Option<VersionedLease>>;

    /// Write `record` if the stored version is still `expected`
    ///
    /// `expected = None` creates the lease and fails if it already exists.
    /// Returns false when another writer got there first.
    async fn compare_and_swap(
        &self,
        expected: Option<u64>,
        record: LeaseRecord,
    ) -> ElectionResult<bool>;
}

/// Lease timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseTiming {
    /// How long a lease stays valid without renewal
    pub lease_duration: Duration,
    /// How long the holder keeps trying to renew before giving up
    pub renew_deadline: Duration,
    /// Interval between acquire and renew attempts
    pub retry_period: Duration,
}

impl Default for LeaseTiming {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(5),
            renew_deadline: Duration::from_secs(2),
            retry_period: Duration::from_secs(1),
        }
    }
}

impl LeaseTiming {
    pub fn validate(&self) -> ElectionResult<()> {
        if self.lease_duration <= self.renew_deadline {
            return Err(ElectionError::InvalidSettings(
                "lease duration must be greater than the renew deadline".to_string(),
            ));
        }
        if self.renew_deadline <= self.retry_period {
            return Err(ElectionError::InvalidSettings(
                "renew deadline must be greater than the retry period".to_string(),
            ));
        }
        if self.lease_duration.as_secs() == 0 {
            return Err(ElectionError::InvalidSettings(
                "lease duration must be at least one second".to_string(),
            ));
        }
        Ok(())
    }
}

/// Elector holding a lease through a [`LeaseLock`]
pub struct LeaseElector {
    lock: Arc<dyn LeaseLock>,
    timing: LeaseTiming,
    release_on_cancel: bool,
}

impl LeaseElector {
    pub fn new(lock: Arc<dyn LeaseLock>) -> Self {
        Self {
            lock,
            timing: LeaseTiming::default(),
            release_on_cancel: true,
        }
    }

    pub fn with_timing(mut self, timing: LeaseTiming) -> ElectionResult<Self> {
        timing.validate()?;
        self.timing = timing;
        Ok(self)
    }

    pub fn with_release_on_cancel(mut self, release: bool) -> Self {
        self.release_on_cancel = release;
        self
    }

    pub fn identity(&self) -> &str {
        self.lock.identity()
    }

    /// One attempt to take or keep the lease
    async fn try_acquire_or_renew(&self) -> ElectionResult<bool> {
        let identity = self.lock.identity();
        let now = Utc::now();
        let fresh = LeaseRecord {
            holder: identity.to_string(),
            lease_duration_secs: self.timing.lease_duration.as_secs(),
            acquired_at: now,
            renewed_at: now,
            transitions: 0,
        };

        let Some(current) = self.lock.get().await? else {
            return self.lock.compare_and_swap(None, fresh).await;
        };
        if current.record.is_held_by_other(identity, now) {
            return Ok(false);
        }

        let record = if current.record.holder == identity {
            LeaseRecord {
                acquired_at: current.record.acquired_at,
                transitions: current.record.transitions,
                ..fresh
            }
        } else {
            LeaseRecord {
                transitions: current.record.transitions + 1,
                ..fresh
            }
        };
        self.lock
            .compare_and_swap(Some(current.version), record)
            .await
    }

    /// Wait until the lease is ours; false if cancelled first
    async fn acquire(&self, shutdown: &CancellationToken) -> bool {
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity(), "Acquired lease");
                    return true;
                }
                Ok(false) => debug!(identity = %self.identity(), "Lease held elsewhere"),
                Err(e) => warn!(identity = %self.identity(), error = %e, "Failed to acquire lease"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = tokio::time::sleep(self.timing.retry_period) => {}
            }
        }
    }

    /// Renew until shutdown or until renewal fails for the renew deadline
    ///
    /// Returns true when stopped by shutdown.
    async fn renew(&self, shutdown: &CancellationToken) -> bool {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return true,
                _ = tokio::time::sleep(self.timing.retry_period) => {}
            }

            let attempt = async {
                loop {
                    match self.try_acquire_or_renew().await {
                        Ok(true) => return,
                        Ok(false) => {}
                        Err(e) => warn!(identity = %self.identity(), error = %e, "Failed to renew lease"),
                    }
                    tokio::time::sleep(self.timing.retry_period / 4).await;
                }
            };
            tokio::select! {
                _ = shutdown.cancelled() => return true,
                renewed = tokio::time::timeout(self.timing.renew_deadline, attempt) => {
                    if renewed.is_err() {
                        warn!(identity = %self.identity(), "Failed to renew lease within the deadline");
                        return false;
                    }
                }
            }
        }
    }

    /// Hand the lease back so the next candidate need not wait for expiry
    async fn release(&self) {
        let result: ElectionResult<bool> = async {
            let Some(current) = self.lock.get().await? else {
                return Ok(false);
            };
            if current.record.holder != self.lock.identity() {
                return Ok(false);
            }
            let now = Utc::now();
            let released = LeaseRecord {
                holder: String::new(),
                lease_duration_secs: 1,
                acquired_at: now,
                renewed_at: now,
                transitions: current.record.transitions,
            };
            self.lock
                .compare_and_swap(Some(current.version), released)
                .await
        }
        .await;

        match result {
            Ok(true) => info!(identity = %self.identity(), "Released lease"),
            Ok(false) => debug!(identity = %self.identity(), "Lease no longer ours to release"),
            Err(e) => warn!(identity = %self.identity(), error = %e, "Failed to release lease"),
        }
    }
}

#[async_trait]
impl Elector for LeaseElector {
    async fn run_or_die(
        &self,
        shutdown: CancellationToken,
        callbacks: LeaderCallbacks,
    ) -> ElectionResult<()> {
        let mut leadership = Leadership::new(shutdown.clone(), callbacks);

        // Losing the lease ends one round; the next round competes again
        while self.acquire(&shutdown).await {
            leadership.start();
            let cancelled = self.renew(&shutdown).await;
            leadership.stop().await;
            if cancelled && self.release_on_cancel {
                self.release().await;
            }
            if cancelled {
                break;
            }
            warn!(identity = %self.identity(), "Lost lease");
        }
        info!(identity = %self.identity(), "Exiting leader election");
        Ok(())
    }
}

/// In-process lease storage shared by the locks created from it
#[derive(Debug, Clone, Default)]
pub struct MemoryLeaseStore {
    leases: Arc<Mutex<HashMap<String, VersionedLease>>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock on lease `name` acquiring as `identity`
    pub fn lock(&self, name: impl Into<String>, identity: impl Into<String>) -> MemoryLeaseLock {
        MemoryLeaseLock {
            store: self.clone(),
            name: name.into(),
            identity: identity.into(),
        }
    }

    /// Current holder of lease `name`, if any
    pub fn holder(&self, name: &str) -> Option<String> {
        self.with_leases(|leases| {
            leases
                .get(name)
                .map(|l| l.record.holder.clone())
                .filter(|h| !h.is_empty())
        })
    }

    fn with_leases<T>(&self, f: impl FnOnce(&mut HashMap<String, VersionedLease>) -> T) -> T {
        match self.leases.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryLeaseLock {
    store: MemoryLeaseStore,
    name: String,
    identity: String,
}

#[async_trait]
impl LeaseLock for MemoryLeaseLock {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn get(&self) -> ElectionResult<Option<VersionedLease>> {
        Ok(self.store.with_leases(|leases| leases.get(&self.name).cloned()))
    }

    async fn compare_and_swap(
        &self,
        expected: Option<u64>,
        record: LeaseRecord,
    ) -> ElectionResult<bool> {
        Ok(self.store.with_leases(|leases| {
            let current = leases.get(&self.name).map(|l| l.version);
            if current != expected {
                return false;
            }
            let version = current.map_or(1, |v| v + 1);
            leases.insert(self.name.clone(), VersionedLease { record, version });
            true
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing() -> LeaseTiming {
        LeaseTiming {
            lease_duration: Duration::from_secs(1),
            renew_deadline: Duration::from_millis(400),
            retry_period: Duration::from_millis(50),
        }
    }

    #[test]
    fn test_default_timing_is_valid() {
        assert!(LeaseTiming::default().validate().is_ok());
        let bad = LeaseTiming {
            lease_duration: Duration::from_secs(1),
            renew_deadline: Duration::from_secs(2),
            retry_period: Duration::from_millis(100),
        };
        assert!(bad.validate().is_err());
    }

    #[tokio::test]
    async fn test_compare_and_swap_versions() {
        let store = MemoryLeaseStore::new();
        let lock = store.lock("sensor", "a");
        let now = Utc::now();
        let record = LeaseRecord {
            holder: "a".to_string(),
            lease_duration_secs: 5,
            acquired_at: now,
            renewed_at: now,
            transitions: 0,
        };

        assert!(lock.compare_and_swap(None, record.clone()).await.unwrap());
        assert!(!lock.compare_and_swap(None, record.clone()).await.unwrap());
        assert!(!lock.compare_and_swap(Some(7), record.clone()).await.unwrap());
        assert!(lock.compare_and_swap(Some(1), record).await.unwrap());
        assert_eq!(lock.get().await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_second_candidate_blocked_while_lease_fresh() {
        let store = MemoryLeaseStore::new();
        let a = LeaseElector::new(Arc::new(store.lock("sensor", "a")))
            .with_timing(timing())
            .unwrap();
        let b = LeaseElector::new(Arc::new(store.lock("sensor", "b")))
            .with_timing(timing())
            .unwrap();

        assert!(a.try_acquire_or_renew().await.unwrap());
        assert!(!b.try_acquire_or_renew().await.unwrap());
        // Renewal by the holder keeps the acquisition time
        let before = store.lock("sensor", "x").get().await.unwrap().unwrap();
        assert!(a.try_acquire_or_renew().await.unwrap());
        let after = store.lock("sensor", "x").get().await.unwrap().unwrap();
        assert_eq!(before.record.acquired_at, after.record.acquired_at);
        assert_eq!(store.holder("sensor").as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_expired_lease_taken_over() {
        let store = MemoryLeaseStore::new();
        let lock = store.lock("sensor", "a");
        let stale = Utc::now() - chrono::Duration::seconds(30);
        lock.compare_and_swap(
            None,
            LeaseRecord {
                holder: "a".to_string(),
                lease_duration_secs: 1,
                acquired_at: stale,
                renewed_at: stale,
                transitions: 0,
            },
        )
        .await
        .unwrap();

        let b = LeaseElector::new(Arc::new(store.lock("sensor", "b")))
            .with_timing(timing())
            .unwrap();
        assert!(b.try_acquire_or_renew().await.unwrap());
        let lease = store.lock("sensor", "b").get().await.unwrap().unwrap();
        assert_eq!(lease.record.holder, "b");
        assert_eq!(lease.record.transitions, 1);
    }

    #[tokio::test]
    async fn test_release_clears_holder() {
        let store = MemoryLeaseStore::new();
        let a = LeaseElector::new(Arc::new(store.lock("sensor", "a")));
        assert!(a.try_acquire_or_renew().await.unwrap());

        a.release().await;
        assert_eq!(store.holder("sensor"), None);
    }
}
