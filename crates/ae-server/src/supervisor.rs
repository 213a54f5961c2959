//! Running workloads under leader election
//!
//! Every sensor and event source is elected on its own: only the leading
//! replica runs it. A workload that fails while leading takes the whole
//! election down with it, so the process exits instead of holding a
//! leadership it cannot serve.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::sensor::SensorRunner;
use crate::source::EventSourceRunner;
use ae_event_bus::DriverContext;
use ae_leader_election::{
    BusElector, ClusterInfo, Elector, ElectorKind, LeaderCallbacks, LeaseElector,
    MemoryLeaseStore,
};
use async_trait::async_trait;
use futures::FutureExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Something only the leading replica runs
#[async_trait]
pub trait Workload: Send + Sync + 'static {
    /// Election cluster and lease name, e.g. `sensor-ci`
    fn cluster_name(&self) -> String;

    async fn run(&self, shutdown: CancellationToken) -> ServerResult<()>;
}

#[async_trait]
impl Workload for SensorRunner {
    fn cluster_name(&self) -> String {
        format!("sensor-{}", self.name())
    }

    async fn run(&self, shutdown: CancellationToken) -> ServerResult<()> {
        SensorRunner::run(self, shutdown).await
    }
}

#[async_trait]
impl Workload for EventSourceRunner {
    fn cluster_name(&self) -> String {
        format!("eventsource-{}", self.name())
    }

    async fn run(&self, shutdown: CancellationToken) -> ServerResult<()> {
        EventSourceRunner::run(self, shutdown).await
    }
}

/// Build the elector for one workload's cluster
pub fn build_elector(
    kind: ElectorKind,
    cluster_name: &str,
    config: &ServerConfig,
    context: &DriverContext,
    leases: &MemoryLeaseStore,
) -> ServerResult<Arc<dyn Elector>> {
    let elector: Arc<dyn Elector> = match kind {
        ElectorKind::Lease => Arc::new(LeaseElector::new(Arc::new(
            leases.lock(cluster_name, config.hostname()),
        ))),
        ElectorKind::Bus => Arc::new(BusElector::new(
            ClusterInfo::new(cluster_name, config.replicas),
            config.event_bus.url()?,
            Arc::clone(&context.connector),
            context.auth.clone(),
            config.state_dir.join(format!("{}.json", cluster_name)),
        )?),
    };
    info!(cluster = %cluster_name, ?kind, replicas = config.replicas, "Created leader elector");
    Ok(elector)
}

/// Run `workload` whenever `elector` makes this replica leader
///
/// Returns when `shutdown` is cancelled, when the election fails, or when
/// the workload fails while leading.
pub async fn run_elected(
    elector: Arc<dyn Elector>,
    workload: Arc<dyn Workload>,
    shutdown: CancellationToken,
) -> ServerResult<()> {
    let name = workload.cluster_name();
    let (failed_tx, mut failed_rx) = mpsc::unbounded_channel::<ServerError>();

    let started_name = name.clone();
    let stopped_name = name.clone();
    let callbacks = LeaderCallbacks::new(
        Arc::new(move |token: CancellationToken| {
            let workload = Arc::clone(&workload);
            let failed = failed_tx.clone();
            let name = started_name.clone();
            async move {
                info!(workload = %name, "Started leading");
                if let Err(e) = workload.run(token).await {
                    error!(workload = %name, error = %e, "Workload failed while leading");
                    let _ = failed.send(e);
                }
            }
            .boxed()
        }),
        Arc::new(move || info!(workload = %stopped_name, "Stopped leading")),
    );

    let election = shutdown.child_token();
    let elected = elector.run_or_die(election.clone(), callbacks);
    tokio::pin!(elected);

    tokio::select! {
        result = &mut elected => {
            result?;
            Ok(())
        }
        Some(e) = failed_rx.recv() => {
            election.cancel();
            if let Err(election_error) = elected.await {
                error!(workload = %name, error = %election_error, "Leader election ended with an error");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Flaky {
        runs: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Workload for Flaky {
        fn cluster_name(&self) -> String {
            "sensor-flaky".to_string()
        }

        async fn run(&self, shutdown: CancellationToken) -> ServerResult<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ServerError::EventSourceStopped("flaky".to_string()));
            }
            shutdown.cancelled().await;
            Ok(())
        }
    }

    fn lease_elector(store: &MemoryLeaseStore) -> Arc<dyn Elector> {
        Arc::new(LeaseElector::new(Arc::new(store.lock("sensor-flaky", "replica-a"))))
    }

    #[tokio::test]
    async fn test_workload_runs_while_leading() {
        let store = MemoryLeaseStore::new();
        let workload = Arc::new(Flaky {
            runs: AtomicUsize::new(0),
            fail: false,
        });
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(run_elected(
            lease_elector(&store),
            workload.clone(),
            shutdown.clone(),
        ));
        tokio::time::timeout(Duration::from_secs(5), async {
            while workload.runs.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(store.holder("sensor-flaky"), None);
    }

    #[tokio::test]
    async fn test_workload_failure_ends_election() {
        let store = MemoryLeaseStore::new();
        let workload = Arc::new(Flaky {
            runs: AtomicUsize::new(0),
            fail: true,
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            run_elected(lease_elector(&store), workload, CancellationToken::new()),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(ServerError::EventSourceStopped(_))));
    }
}
