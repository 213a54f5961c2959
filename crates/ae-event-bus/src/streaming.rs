//! Streaming bus driver
//!
//! Every event travels on one subject. Each trigger joins a queue group
//! named after its durable identity, so replicas of a sensor share the
//! stream and a restarted replica resumes from the group's last
//! acknowledged message. Messages held in a trigger's condition window stay
//! unacknowledged until the window fires or is reset, which keeps them
//! safe across restarts.

use crate::auth::AuthResolver;
use crate::connection::BusConnection;
use crate::driver::{DriverContext, SensorDriver, SourceConnection, SourceDriver};
use crate::error::{EventBusError, EventBusResult};
use crate::identity;
use crate::transport::{ConnectOptions, DeliverPolicy, SubscribeOptions, TransportMessage};
use crate::trigger::{log_outcome, TriggerConnection, TriggerHandlers, TriggerStats};
use ae_condition::{
    ConditionEngine, Delivery, DependencyExpression, Outcome, RecentEvents, ResetReceiver,
    DEFAULT_HELD_ENTRY_TTL_SECS,
};
use ae_config::AuthStrategy;
use ae_core::{Dependency, DependencyMatcher, Event};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Subject used when none is configured
pub const DEFAULT_STREAMING_SUBJECT: &str = "eventbus-default";

/// How long processed event IDs are remembered
const DUPLICATE_TTL_SECS: i64 = 300;

const DEDUP_EVICTION_INTERVAL: Duration = Duration::from_secs(60);

fn connect_options(
    client_id: &str,
    cluster_id: &str,
    auth: &AuthResolver,
) -> EventBusResult<ConnectOptions> {
    // Only none and token are accepted by streaming clusters
    if auth.strategy() == AuthStrategy::Basic {
        return Err(EventBusError::UnsupportedAuth(AuthStrategy::Basic));
    }
    Ok(ConnectOptions {
        client_id: client_id.to_string(),
        cluster_id: Some(cluster_id.to_string()),
        auth: auth.current(),
    })
}

/// Event source side of the streaming bus
pub struct StreamingSourceDriver {
    url: String,
    cluster_id: String,
    context: DriverContext,
}

impl StreamingSourceDriver {
    pub fn new(url: impl Into<String>, cluster_id: impl Into<String>, context: DriverContext) -> Self {
        Self {
            url: url.into(),
            cluster_id: cluster_id.into(),
            context,
        }
    }
}

#[async_trait]
impl SourceDriver for StreamingSourceDriver {
    async fn initialize(&self) -> EventBusResult<()> {
        Ok(())
    }

    async fn connect(&self, client_id: &str) -> EventBusResult<Box<dyn SourceConnection>> {
        let options = connect_options(client_id, &self.cluster_id, &self.context.auth)?;
        let conn = BusConnection::connect(self.context.connector.as_ref(), &self.url, options)
            .await?
            .with_publish_timeout(self.context.publish_timeout);
        Ok(Box::new(StreamingSourceConnection {
            conn,
            subject: self.context.streaming_subject.clone(),
        }))
    }
}

/// Publishing connection of an event source
pub struct StreamingSourceConnection {
    conn: BusConnection,
    subject: String,
}

#[async_trait]
impl SourceConnection for StreamingSourceConnection {
    fn client_id(&self) -> &str {
        self.conn.client_id()
    }

    async fn publish(&self, event: &Event) -> EventBusResult<()> {
        let payload = event.encode()?;
        self.conn.publish(&self.subject, payload).await?;
        debug!(subject = %self.subject, event_id = %event.id, "Published event");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    async fn close(&self) -> EventBusResult<()> {
        self.conn.close().await
    }
}

/// Sensor side of the streaming bus
pub struct StreamingSensorDriver {
    sensor_name: String,
    url: String,
    cluster_id: String,
    context: DriverContext,
}

impl StreamingSensorDriver {
    pub fn new(
        sensor_name: impl Into<String>,
        url: impl Into<String>,
        cluster_id: impl Into<String>,
        context: DriverContext,
    ) -> Self {
        Self {
            sensor_name: sensor_name.into(),
            url: url.into(),
            cluster_id: cluster_id.into(),
            context,
        }
    }
}

#[async_trait]
impl SensorDriver for StreamingSensorDriver {
    async fn initialize(&self) -> EventBusResult<()> {
        Ok(())
    }

    async fn connect(
        &self,
        trigger_name: &str,
        expression: &str,
        dependencies: &[Dependency],
    ) -> EventBusResult<Box<dyn TriggerConnection>> {
        let stable = identity::stable_id(&self.sensor_name, trigger_name, Some(expression));
        let client_id = identity::client_id(&stable);
        let group = identity::group_from_client_id(&client_id)?;

        let options = connect_options(&client_id, &self.cluster_id, &self.context.auth)?;
        let conn = BusConnection::connect(self.context.connector.as_ref(), &self.url, options)
            .await
            .map_err(|e| {
                warn!(sensor = %self.sensor_name, trigger = trigger_name, "Trigger connection failed");
                e
            })?;

        info!(
            sensor = %self.sensor_name,
            trigger = trigger_name,
            client_id = %client_id,
            "Trigger connection established"
        );
        Ok(Box::new(StreamingTriggerConnection {
            conn,
            sensor_name: self.sensor_name.clone(),
            trigger_name: trigger_name.to_string(),
            expression: expression.to_string(),
            dependencies: dependencies.to_vec(),
            subject: self.context.streaming_subject.clone(),
            group,
            stats: Arc::new(TriggerStats::default()),
        }))
    }
}

/// Unacknowledged messages backing the entries of a condition window
#[derive(Default)]
struct HeldMessages {
    messages: HashMap<String, TransportMessage>,
}

impl HeldMessages {
    /// Apply the acknowledgement rules for a processed message
    fn settle(&mut self, dependency: String, message: TransportMessage, outcome: &Outcome) {
        match outcome {
            Outcome::Pending => {
                if let Some(previous) = self.messages.insert(dependency, message) {
                    previous.ack();
                }
            }
            Outcome::Redelivered => {
                self.messages.insert(dependency, message);
            }
            Outcome::Fired(_) => {
                self.ack_all();
                message.ack();
            }
            _ => message.ack(),
        }
    }

    /// Acknowledge messages whose window entry is gone
    fn release_missing(&mut self, engine: &ConditionEngine) {
        self.messages.retain(|dependency, message| {
            if engine.window().is_fired(dependency) {
                true
            } else {
                message.ack();
                false
            }
        });
    }

    fn ack_all(&mut self) {
        for (_, message) in self.messages.drain() {
            message.ack();
        }
    }
}

/// Trigger subscription on the streaming bus
pub struct StreamingTriggerConnection {
    conn: BusConnection,
    sensor_name: String,
    trigger_name: String,
    expression: String,
    dependencies: Vec<Dependency>,
    subject: String,
    group: String,
    stats: Arc<TriggerStats>,
}

impl StreamingTriggerConnection {
    pub fn group(&self) -> &str {
        &self.group
    }

    async fn handle_message(
        &self,
        message: TransportMessage,
        matcher: &DependencyMatcher,
        engine: &mut ConditionEngine,
        held: &mut HeldMessages,
        handlers: &TriggerHandlers,
    ) {
        self.stats.events_received.fetch_add(1, Ordering::Relaxed);

        let event = match Event::decode(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                error!(trigger = %self.trigger_name, error = %e, "Failed to decode event, discarding it");
                message.ack();
                return;
            }
        };

        let Some(dependency) = matcher
            .resolve(&event.source, &event.subject)
            .first()
            .map(|name| name.to_string())
        else {
            debug!(
                trigger = %self.trigger_name,
                source = %event.source,
                subject = %event.subject,
                "Event matches no dependency"
            );
            message.ack();
            return;
        };

        let delivery =
            Delivery::new(dependency.as_str(), event, message.timestamp).with_sequence(message.sequence);
        let outcome = engine.process(delivery, Utc::now());
        self.stats.record(&outcome);
        log_outcome(&self.trigger_name, &dependency, &outcome);

        if let Outcome::Fired(firing) = &outcome {
            debug!(client_id = %self.conn.client_id(), "Triggering actions");
            let _ = handlers.invoke(firing.events.clone(), &self.stats).await;
        }

        held.settle(dependency, message, &outcome);
        held.release_missing(engine);
    }
}

#[async_trait]
impl TriggerConnection for StreamingTriggerConnection {
    fn sensor_name(&self) -> &str {
        &self.sensor_name
    }

    fn trigger_name(&self) -> &str {
        &self.trigger_name
    }

    fn client_id(&self) -> &str {
        self.conn.client_id()
    }

    async fn subscribe(
        &self,
        shutdown: CancellationToken,
        mut resets: ResetReceiver,
        last_reset_time: Option<DateTime<Utc>>,
        handlers: TriggerHandlers,
    ) -> EventBusResult<()> {
        let expression = DependencyExpression::parse(&self.expression)?;
        expression.validate(self.dependencies.iter().map(|d| d.name.as_str()))?;
        let matcher = DependencyMatcher::new(&self.dependencies)?;

        let recent = Arc::new(RecentEvents::new(chrono::Duration::seconds(DUPLICATE_TTL_SECS)));
        let mut engine = ConditionEngine::new(expression, last_reset_time)
            .with_held_entry_ttl(chrono::Duration::seconds(DEFAULT_HELD_ENTRY_TTL_SECS))
            .with_dedup(Arc::clone(&recent));
        if let Some(filter) = &handlers.filter {
            engine = engine.with_filter(Arc::clone(filter));
        }
        if let Some(transform) = &handlers.transform {
            engine = engine.with_transform(Arc::clone(transform));
        }

        let options = SubscribeOptions {
            queue_group: Some(self.group.clone()),
            durable: Some(self.group.clone()),
            manual_ack: true,
            deliver: DeliverPolicy::New,
        };
        let mut subscription = match self.conn.client().subscribe(&self.subject, options).await {
            Ok(sub) => sub,
            Err(source) => {
                self.stats.subscription_errors.fetch_add(1, Ordering::Relaxed);
                error!(
                    sensor = %self.sensor_name,
                    trigger = %self.trigger_name,
                    subject = %self.subject,
                    error = %source,
                    "Failed to subscribe"
                );
                let _ = self.conn.close().await;
                return Err(EventBusError::Subscription {
                    subject: self.subject.clone(),
                    source,
                });
            }
        };
        info!(
            trigger = %self.trigger_name,
            subject = %self.subject,
            durable = %self.group,
            "Subscribed to subject"
        );

        let mut held = HeldMessages::default();
        let mut eviction = tokio::time::interval(DEDUP_EVICTION_INTERVAL);
        eviction.tick().await;

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(trigger = %self.trigger_name, "Closing subscription");
                    break Ok(());
                }
                _ = self.conn.wait_closed() => {
                    self.stats.connection_errors.fetch_add(1, Ordering::Relaxed);
                    error!(trigger = %self.trigger_name, "Event bus connection lost, leaving subscription");
                    break Err(EventBusError::Closed);
                }
                Some(signal) = resets.recv() => {
                    info!(trigger = %self.trigger_name, source = ?signal.source, "Resetting conditions");
                    engine.reset(signal.at);
                    held.ack_all();
                }
                _ = eviction.tick() => {
                    let evicted = recent.evict_expired(Utc::now());
                    debug!(trigger = %self.trigger_name, evicted, "Evicted cached event IDs");
                }
                message = subscription.next() => match message {
                    Some(message) => {
                        self.handle_message(message, &matcher, &mut engine, &mut held, &handlers)
                            .await;
                    }
                    None => {
                        warn!(trigger = %self.trigger_name, "Subscription ended by the transport");
                        break Err(EventBusError::Closed);
                    }
                },
            }
        };

        if let Err(e) = self.conn.client().unsubscribe(subscription.id).await {
            debug!(trigger = %self.trigger_name, error = %e, "Unsubscribe failed");
        }
        self.conn.close().await?;
        info!(trigger = %self.trigger_name, subject = %self.subject, "Subscription closed");
        result
    }

    fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    async fn close(&self) -> EventBusResult<()> {
        self.conn.close().await
    }

    fn stats(&self) -> Arc<TriggerStats> {
        Arc::clone(&self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Auth;
    use crate::memory::MemoryBroker;

    fn context(broker: &MemoryBroker, auth: Auth) -> DriverContext {
        DriverContext::new(Arc::new(broker.clone()), AuthResolver::fixed(auth))
    }

    #[tokio::test]
    async fn test_basic_auth_rejected() {
        let broker = MemoryBroker::new();
        let driver = StreamingSensorDriver::new(
            "sensor",
            "mem://",
            "cluster",
            context(&broker, Auth::basic("u", "p")),
        );

        let err = driver
            .connect("trigger", "a", &[Dependency::new("a", "s", "e")])
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EventBusError::UnsupportedAuth(AuthStrategy::Basic)));

        let source = StreamingSourceDriver::new("mem://", "cluster", context(&broker, Auth::basic("u", "p")));
        assert!(source.connect("source-1").await.is_err());
        assert_eq!(broker.client_count(), 0);
    }

    #[tokio::test]
    async fn test_trigger_client_joins_stable_group() {
        let broker = MemoryBroker::new();
        let driver =
            StreamingSensorDriver::new("sensor", "mem://", "cluster", context(&broker, Auth::none()));
        let deps = [Dependency::new("a", "s", "e")];

        let conn = driver.connect("trigger", "a", &deps).await.unwrap();
        let stable = identity::stable_id("sensor", "trigger", Some("a"));
        assert!(conn.client_id().starts_with(&format!("client-{}-", stable)));
        assert!(broker.is_registered(conn.client_id()));
        assert_eq!(conn.trigger_name(), "trigger");
        assert_eq!(conn.sensor_name(), "sensor");

        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_source_publishes_on_configured_subject() {
        let broker = MemoryBroker::new();
        let mut ctx = context(&broker, Auth::none());
        ctx.streaming_subject = "eventbus-test".to_string();
        let driver = StreamingSourceDriver::new("mem://", "cluster", ctx);

        let conn = driver.connect("source-1").await.unwrap();
        conn.publish(&Event::new("webhook", "push", "webhook", serde_json::Value::Null))
            .await
            .unwrap();
        assert_eq!(broker.message_count().await, 1);

        conn.close().await.unwrap();
        assert!(conn.publish(&Event::new("s", "e", "t", serde_json::Value::Null)).await.is_err());
    }

    #[test]
    fn test_held_messages_ack_rules() {
        use std::sync::Mutex;

        #[derive(Default)]
        struct Recorder(Mutex<Vec<u64>>);
        impl crate::transport::Acker for Recorder {
            fn ack(&self, sequence: u64) {
                self.0.lock().unwrap().push(sequence);
            }
        }

        let recorder = Arc::new(Recorder::default());
        let message = |seq: u64| {
            TransportMessage::new("s", vec![], seq, Utc::now()).with_acker(recorder.clone())
        };

        let mut held = HeldMessages::default();
        held.settle("a".to_string(), message(1), &Outcome::Pending);
        held.settle("a".to_string(), message(1), &Outcome::Redelivered);
        assert!(recorder.0.lock().unwrap().is_empty());

        held.settle("a".to_string(), message(2), &Outcome::Pending);
        assert_eq!(*recorder.0.lock().unwrap(), vec![1]);

        held.settle("b".to_string(), message(3), &Outcome::Stale);
        assert_eq!(*recorder.0.lock().unwrap(), vec![1, 3]);

        held.ack_all();
        assert_eq!(*recorder.0.lock().unwrap(), vec![1, 3, 2]);
    }
}
