//! Bus connection
//!
//! [`BusConnection`] owns one transport client. Liveness flags are written
//! by a watcher task following the transport's state channel and read by
//! callers through [`BusConnection::is_closed`]; both sides go through
//! atomics.

use crate::error::{EventBusError, EventBusResult};
use crate::transport::{ConnectOptions, Connector, TransportClient};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Upper bound on a single publish
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct Liveness {
    connected: AtomicBool,
    session: AtomicBool,
}

/// One connection to the bus
pub struct BusConnection {
    client: Arc<dyn TransportClient>,
    client_id: String,
    requires_session: bool,
    liveness: Arc<Liveness>,
    closed: AtomicBool,
    publish_timeout: Duration,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for BusConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusConnection")
            .field("client_id", &self.client_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl BusConnection {
    /// Connect once
    ///
    /// Failure is returned as [`EventBusError::Connection`]; there is no
    /// internal retry.
    pub async fn connect(
        connector: &dyn Connector,
        url: &str,
        options: ConnectOptions,
    ) -> EventBusResult<Self> {
        let client_id = options.client_id.clone();
        let requires_session = options.cluster_id.is_some();

        let client = connector.connect(url, options).await.map_err(|source| {
            error!(client_id = %client_id, url, error = %source, "Failed to connect to event bus");
            EventBusError::Connection {
                url: url.to_string(),
                source,
            }
        })?;
        info!(client_id = %client_id, url, "Connected to event bus");

        let mut state = client.state();
        let initial = *state.borrow_and_update();
        let liveness = Arc::new(Liveness {
            connected: AtomicBool::new(initial.connected),
            session: AtomicBool::new(initial.session),
        });

        let flags = Arc::clone(&liveness);
        let watched_id = client_id.clone();
        let watcher = tokio::spawn(async move {
            while state.changed().await.is_ok() {
                let current = *state.borrow_and_update();
                let was_connected = flags.connected.swap(current.connected, Ordering::SeqCst);
                flags.session.store(current.session, Ordering::SeqCst);
                match (was_connected, current.connected) {
                    (true, false) => error!(client_id = %watched_id, "Event bus connection lost"),
                    (false, true) => info!(client_id = %watched_id, "Event bus connection restored"),
                    _ => debug!(client_id = %watched_id, ?current, "Event bus connection state changed"),
                }
            }
        });

        Ok(Self {
            client,
            client_id,
            requires_session,
            liveness,
            closed: AtomicBool::new(false),
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            watcher: Mutex::new(Some(watcher)),
        })
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn client(&self) -> &Arc<dyn TransportClient> {
        &self.client
    }

    /// Publish `payload` on `subject`, bounded by the publish timeout
    pub async fn publish(&self, subject: &str, payload: Vec<u8>) -> EventBusResult<()> {
        if self.is_closed() {
            return Err(EventBusError::Publish {
                subject: subject.to_string(),
                reason: "connection is closed".to_string(),
            });
        }

        match tokio::time::timeout(self.publish_timeout, self.client.publish(subject, payload))
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(EventBusError::Publish {
                subject: subject.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(EventBusError::Publish {
                subject: subject.to_string(),
                reason: format!("timed out after {:?}", self.publish_timeout),
            }),
        }
    }

    /// Whether the transport or the protocol session is down
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
            || !self.liveness.connected.load(Ordering::SeqCst)
            || (self.requires_session && !self.liveness.session.load(Ordering::SeqCst))
    }

    /// Resolves once the connection is closed or its transport goes down
    pub async fn wait_closed(&self) {
        let mut state = self.client.state();
        loop {
            let current = *state.borrow_and_update();
            if self.closed.load(Ordering::SeqCst)
                || !current.connected
                || (self.requires_session && !current.session)
            {
                return;
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    /// Close the connection; later calls do nothing
    pub async fn close(&self) -> EventBusResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop_watcher();
        self.client.close().await;
        info!(client_id = %self.client_id, "Closed event bus connection");
        Ok(())
    }

    fn stop_watcher(&self) {
        let handle = match self.watcher.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl Drop for BusConnection {
    fn drop(&mut self) {
        self.stop_watcher();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Auth;
    use crate::memory::{BrokerAuth, MemoryBroker};
    use crate::transport::SubscribeOptions;

    fn options(client_id: &str, cluster: Option<&str>) -> ConnectOptions {
        ConnectOptions {
            client_id: client_id.to_string(),
            cluster_id: cluster.map(str::to_string),
            auth: Auth::none(),
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_connect_and_publish() {
        let broker = MemoryBroker::new();
        let conn = BusConnection::connect(&broker, "mem://", options("c", None))
            .await
            .unwrap();
        let mut sub = conn
            .client()
            .subscribe("s", SubscribeOptions::default())
            .await
            .unwrap();

        conn.publish("s", b"x".to_vec()).await.unwrap();
        assert_eq!(sub.next().await.unwrap().payload, b"x");
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_connection_error_not_retried() {
        let broker = MemoryBroker::with_auth(BrokerAuth::Token("t".to_string()));
        let err = BusConnection::connect(&broker, "mem://bus", options("c", None))
            .await
            .unwrap_err();
        assert!(matches!(err, EventBusError::Connection { .. }));
        assert_eq!(broker.client_count(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let broker = MemoryBroker::new();
        let conn = BusConnection::connect(&broker, "mem://", options("c", None))
            .await
            .unwrap();

        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert!(conn.is_closed());
        assert!(!broker.is_registered("c"));

        let err = conn.publish("s", vec![]).await.unwrap_err();
        assert!(matches!(err, EventBusError::Publish { .. }));
    }

    #[tokio::test]
    async fn test_liveness_follows_transport() {
        let broker = MemoryBroker::new();
        let conn = BusConnection::connect(&broker, "mem://", options("c", Some("cluster")))
            .await
            .unwrap();
        assert!(!conn.is_closed());

        broker.set_online(false);
        settle().await;
        assert!(conn.is_closed());
        assert!(conn.publish("s", vec![]).await.is_err());

        broker.set_online(true);
        settle().await;
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_lost_session_counts_as_closed() {
        let broker = MemoryBroker::new();
        let conn = BusConnection::connect(&broker, "mem://", options("c", Some("cluster")))
            .await
            .unwrap();

        broker.expire_session("c");
        settle().await;
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_wait_closed_resolves_on_outage() {
        let broker = MemoryBroker::new();
        let conn = BusConnection::connect(&broker, "mem://", options("c", None))
            .await
            .unwrap();

        let outage = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            outage.set_online(false);
        });

        tokio::time::timeout(Duration::from_secs(2), conn.wait_closed())
            .await
            .unwrap();
    }
}
