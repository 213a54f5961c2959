//! Event source runner
//!
//! Publishes the events handed to it onto the bus. The runner owns the
//! retry loop around the driver: initialize and connect are retried with
//! backoff, a health check replaces a closed connection with one under a
//! fresh client ID, and each publish is retried before it is reported as
//! failed.

use crate::backoff::{retry, BackoffPolicy};
use crate::error::{ServerError, ServerResult};
use ae_config::{BusConfig, EventSourceSpec};
use ae_core::Event;
use ae_event_bus::{source_driver, DriverContext, SourceConnection, SourceDriver};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Events buffered between producers and the bus
pub const EVENT_BUFFER: usize = 1024;

/// How often the connection is checked and replaced if closed
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(5);

/// Client ID of a publishing connection: `client-{hostname}-{0..999}`
pub fn source_client_id(hostname: &str) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..1000);
    format!("client-{}-{}", hostname.replace('.', "_"), suffix)
}

#[derive(Debug, Default)]
pub struct PublishStats {
    pub published: AtomicU64,
    pub failed: AtomicU64,
    /// Events rejected before reaching the bus
    pub rejected: AtomicU64,
}

pub struct EventSourceRunner {
    spec: EventSourceSpec,
    bus: BusConfig,
    context: DriverContext,
    hostname: String,
    connect_backoff: BackoffPolicy,
    publish_backoff: BackoffPolicy,
    health_interval: Duration,
    sender: mpsc::Sender<Event>,
    feed: Arc<Mutex<mpsc::Receiver<Event>>>,
    stats: Arc<PublishStats>,
}

impl std::fmt::Debug for EventSourceRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSourceRunner")
            .field("source", &self.spec.name)
            .field("hostname", &self.hostname)
            .finish_non_exhaustive()
    }
}

impl EventSourceRunner {
    pub fn new(
        spec: EventSourceSpec,
        bus: BusConfig,
        context: DriverContext,
        hostname: impl Into<String>,
    ) -> ServerResult<Self> {
        bus.bus_type()?;
        let (sender, feed) = mpsc::channel(EVENT_BUFFER);
        Ok(Self {
            spec,
            bus,
            context,
            hostname: hostname.into(),
            connect_backoff: BackoffPolicy::default(),
            publish_backoff: BackoffPolicy::default(),
            health_interval: DEFAULT_HEALTH_INTERVAL,
            sender,
            feed: Arc::new(Mutex::new(feed)),
            stats: Arc::new(PublishStats::default()),
        })
    }

    pub fn with_backoff(mut self, connect: BackoffPolicy, publish: BackoffPolicy) -> Self {
        self.connect_backoff = connect;
        self.publish_backoff = publish;
        self
    }

    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Sender feeding events to this runner
    ///
    /// Events are buffered while this replica is not leading.
    pub fn sender(&self) -> mpsc::Sender<Event> {
        self.sender.clone()
    }

    pub fn stats(&self) -> Arc<PublishStats> {
        Arc::clone(&self.stats)
    }

    /// Publish fed events until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) -> ServerResult<()> {
        info!(event_source = %self.spec.name, "Starting event source");
        let driver = source_driver(&self.bus, self.context.clone())?;

        let connected = retry(&self.connect_backoff, "connect event source", &shutdown, || {
            self.connect(driver.as_ref(), true)
        })
        .await;
        let mut conn = match connected {
            Err(ServerError::Cancelled) => return Ok(()),
            other => other?,
        };

        let mut feed = self.feed.lock().await;
        let mut health = tokio::time::interval(self.health_interval);
        health.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = health.tick() => {
                    if conn.is_closed() {
                        info!(event_source = %self.spec.name, "Event bus connection lost, reconnecting");
                        match self.connect(driver.as_ref(), false).await {
                            Ok(fresh) => {
                                let _ = conn.close().await;
                                conn = fresh;
                                info!(event_source = %self.spec.name, client_id = %conn.client_id(), "Reconnected to event bus");
                            }
                            Err(e) => error!(event_source = %self.spec.name, error = %e, "Failed to reconnect to event bus"),
                        }
                    }
                }
                event = feed.recv() => match event {
                    Some(event) => self.publish(conn.as_ref(), event, &shutdown).await,
                    None => {
                        warn!(event_source = %self.spec.name, "Event feed closed");
                        break;
                    }
                },
            }
        }

        if let Err(e) = conn.close().await {
            debug!(event_source = %self.spec.name, error = %e, "Closing event bus connection failed");
        }
        info!(event_source = %self.spec.name, "Event source stopped");
        Ok(())
    }

    async fn connect(
        &self,
        driver: &dyn SourceDriver,
        initialize: bool,
    ) -> ServerResult<Box<dyn SourceConnection>> {
        if initialize {
            driver.initialize().await?;
        }
        Ok(driver.connect(&source_client_id(&self.hostname)).await?)
    }

    fn accepts(&self, event: &Event) -> bool {
        if event.source != self.spec.name {
            warn!(event_source = %self.spec.name, source = %event.source, "Dropping event from another source");
            return false;
        }
        if !self.spec.events.is_empty() && !self.spec.events.contains(&event.subject) {
            warn!(event_source = %self.spec.name, event_name = %event.subject, "Dropping undeclared event");
            return false;
        }
        true
    }

    async fn publish(&self, conn: &dyn SourceConnection, event: Event, shutdown: &CancellationToken) {
        if !self.accepts(&event) {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if conn.is_closed() {
            error!(event_source = %self.spec.name, event_id = %event.id, "Failed to publish event, event bus connection closed");
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let result = retry(&self.publish_backoff, "publish event", shutdown, || async {
            conn.publish(&event).await.map_err(ServerError::from)
        })
        .await;
        match result {
            Ok(()) => {
                self.stats.published.fetch_add(1, Ordering::Relaxed);
                info!(event_source = %self.spec.name, event_name = %event.subject, event_id = %event.id, "Published event");
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                error!(event_source = %self.spec.name, event_name = %event.subject, event_id = %event.id, error = %e, "Failed to publish event");
            }
        }
    }
}
