//! At most one replica leads at a time

use ae_event_bus::{Auth, AuthResolver, MemoryBroker};
use ae_leader_election::{
    BusElector, ClusterInfo, ElectionError, ElectionResult, ElectionTiming, Elector,
    LeaderCallbacks, LeaseElector, LeaseTiming, MemoryLeaseStore, StateLog,
};
use futures::FutureExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(10);

/// Tracks how many replicas are leading across a test
#[derive(Default)]
struct Observer {
    active: AtomicUsize,
    max_active: AtomicUsize,
    starts: AtomicUsize,
}

impl Observer {
    fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    async fn wait_for_leader(&self) {
        tokio::time::timeout(WAIT, async {
            while self.active() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("no leader elected");
    }
}

fn callbacks(observer: Arc<Observer>, leading: Arc<AtomicBool>) -> LeaderCallbacks {
    let stopped = Arc::clone(&observer);
    let stopped_flag = Arc::clone(&leading);
    LeaderCallbacks::new(
        Arc::new(move |token: CancellationToken| {
            let observer = Arc::clone(&observer);
            let leading = Arc::clone(&leading);
            async move {
                let now = observer.active.fetch_add(1, Ordering::SeqCst) + 1;
                observer.max_active.fetch_max(now, Ordering::SeqCst);
                observer.starts.fetch_add(1, Ordering::SeqCst);
                leading.store(true, Ordering::SeqCst);
                token.cancelled().await;
            }
            .boxed()
        }),
        Arc::new(move || {
            stopped_flag.store(false, Ordering::SeqCst);
            stopped.active.fetch_sub(1, Ordering::SeqCst);
        }),
    )
}

struct Replica {
    shutdown: CancellationToken,
    leading: Arc<AtomicBool>,
    task: JoinHandle<ElectionResult<()>>,
}

fn spawn(elector: Arc<dyn Elector>, observer: &Arc<Observer>) -> Replica {
    let shutdown = CancellationToken::new();
    let leading = Arc::new(AtomicBool::new(false));
    let cb = callbacks(Arc::clone(observer), Arc::clone(&leading));
    let token = shutdown.clone();
    let task = tokio::spawn(async move { elector.run_or_die(token, cb).await });
    Replica {
        shutdown,
        leading,
        task,
    }
}

fn fast_election() -> ElectionTiming {
    ElectionTiming {
        heartbeat_interval: Duration::from_millis(20),
        min_election_timeout: Duration::from_millis(150),
        max_election_timeout: Duration::from_millis(300),
    }
}

fn bus_elector(broker: &MemoryBroker, dir: &TempDir, index: usize, size: usize) -> BusElector {
    BusElector::new(
        ClusterInfo::new("ci-sensor", size),
        "mem://bus",
        Arc::new(broker.clone()),
        AuthResolver::fixed(Auth::none()),
        dir.path().join(format!("node-{}.json", index)),
    )
    .unwrap()
    .with_timing(fast_election())
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bus_election_single_leader_and_failover() {
    let broker = MemoryBroker::new();
    let dir = TempDir::new().unwrap();
    let observer = Arc::new(Observer::default());

    let mut replicas: Vec<Replica> = (0..3)
        .map(|i| spawn(Arc::new(bus_elector(&broker, &dir, i, 3)), &observer))
        .collect();

    observer.wait_for_leader().await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(observer.active(), 1);

    let leader = replicas
        .iter()
        .position(|r| r.leading.load(Ordering::SeqCst))
        .unwrap();
    let old = replicas.remove(leader);
    old.shutdown.cancel();
    tokio::time::timeout(WAIT, old.task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(!old.leading.load(Ordering::SeqCst));

    observer.wait_for_leader().await;
    assert_eq!(observer.active(), 1);
    assert!(observer.starts.load(Ordering::SeqCst) >= 2);
    assert_eq!(observer.max_active.load(Ordering::SeqCst), 1);

    for replica in replicas {
        replica.shutdown.cancel();
        tokio::time::timeout(WAIT, replica.task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
    assert_eq!(observer.active(), 0);
}

#[tokio::test]
async fn test_single_node_cluster_persists_term() {
    let broker = MemoryBroker::new();
    let dir = TempDir::new().unwrap();
    let observer = Arc::new(Observer::default());

    let replica = spawn(Arc::new(bus_elector(&broker, &dir, 0, 1)), &observer);
    observer.wait_for_leader().await;
    replica.shutdown.cancel();
    tokio::time::timeout(WAIT, replica.task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let state = StateLog::new(dir.path().join("node-0.json")).load().await.unwrap();
    assert!(state.term >= 1);
    assert!(state.voted_for.is_some());
}

#[tokio::test]
async fn test_feed_closed_while_leading_is_fatal() {
    let broker = MemoryBroker::new();
    let dir = TempDir::new().unwrap();
    let observer = Arc::new(Observer::default());

    let replica = spawn(Arc::new(bus_elector(&broker, &dir, 0, 1)), &observer);
    observer.wait_for_leader().await;

    broker.set_online(false);
    let result = tokio::time::timeout(WAIT, replica.task).await.unwrap().unwrap();
    let err = result.unwrap_err();
    assert!(matches!(err, ElectionError::LeadershipLostUnexpectedly));
    assert!(err.is_fatal());
    assert_eq!(observer.active(), 0);
}

fn lease_elector(store: &MemoryLeaseStore, identity: &str) -> LeaseElector {
    LeaseElector::new(Arc::new(store.lock("ci-sensor", identity)))
        .with_timing(LeaseTiming {
            lease_duration: Duration::from_secs(1),
            renew_deadline: Duration::from_millis(400),
            retry_period: Duration::from_millis(50),
        })
        .unwrap()
}

#[tokio::test]
async fn test_lease_election_single_leader_and_handover() {
    let store = MemoryLeaseStore::new();
    let observer = Arc::new(Observer::default());

    let a = spawn(Arc::new(lease_elector(&store, "replica-a")), &observer);
    observer.wait_for_leader().await;
    assert_eq!(store.holder("ci-sensor").as_deref(), Some("replica-a"));

    let b = spawn(Arc::new(lease_elector(&store, "replica-b")), &observer);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(observer.active(), 1);
    assert!(!b.leading.load(Ordering::SeqCst));

    // Cancelling releases the lease, so the standby takes over without waiting for expiry
    a.shutdown.cancel();
    tokio::time::timeout(WAIT, a.task).await.unwrap().unwrap().unwrap();
    observer.wait_for_leader().await;
    assert_eq!(store.holder("ci-sensor").as_deref(), Some("replica-b"));
    assert_eq!(observer.max_active.load(Ordering::SeqCst), 1);

    b.shutdown.cancel();
    tokio::time::timeout(WAIT, b.task).await.unwrap().unwrap().unwrap();
    assert_eq!(observer.active(), 0);
    assert_eq!(store.holder("ci-sensor"), None);
}
