//! Stream/consumer bus driver
//!
//! Events are published to `default.{eventSourceName}.{eventName}` and
//! retained in the `default` stream. Each dependency of each trigger reads
//! through its own durable consumer. Every message is acknowledged as soon
//! as it is processed; events waiting for the rest of an expression are
//! kept in the sensor's key-value bucket instead.

use crate::connection::BusConnection;
use crate::driver::{DriverContext, SensorDriver, SourceConnection, SourceDriver};
use crate::error::{EventBusError, EventBusResult};
use crate::identity;
use crate::sensor_state::{MsgInfo, SensorState, WindowStore};
use crate::transport::{ConnectOptions, StreamConfig, SubscribeOptions, Subscription, TransportMessage};
use crate::trigger::{log_outcome, TriggerConnection, TriggerHandlers, TriggerStats};
use ae_condition::{
    ConditionEngine, Delivery, DependencyExpression, Outcome, RecentEvents, ResetReceiver,
};
use ae_config::{SensorSpec, StreamSettings};
use ae_core::subject::{dependency_subject, event_subject, stream_subjects};
use ae_core::{Dependency, DependencyMatcher, Event, DEFAULT_STREAM_NAME};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, SelectAll, StreamExt};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long processed event IDs are remembered
const DUPLICATE_TTL_SECS: i64 = 60;

fn default_stream(settings: &StreamSettings) -> StreamConfig {
    StreamConfig {
        name: DEFAULT_STREAM_NAME.to_string(),
        subjects: vec![stream_subjects(DEFAULT_STREAM_NAME)],
        settings: settings.clone(),
    }
}

fn connect_options(client_id: &str, context: &DriverContext) -> ConnectOptions {
    ConnectOptions {
        client_id: client_id.to_string(),
        cluster_id: None,
        auth: context.auth.current(),
    }
}

/// Open a short-lived connection for provisioning
async fn management_connection(url: &str, context: &DriverContext) -> EventBusResult<BusConnection> {
    let client_id = identity::client_id(&identity::hash(&format!("management-{}", url)));
    BusConnection::connect(context.connector.as_ref(), url, connect_options(&client_id, context)).await
}

async fn ensure_stream(conn: &BusConnection, settings: &StreamSettings) -> EventBusResult<()> {
    let config = default_stream(settings);
    conn.client()
        .ensure_stream(&config)
        .await
        .map_err(|e| EventBusError::InvalidConfig(format!("failed to create stream '{}': {}", config.name, e)))?;
    info!(stream = %config.name, "Stream ready");
    Ok(())
}

/// Event source side of the stream/consumer bus
pub struct JetStreamSourceDriver {
    url: String,
    settings: StreamSettings,
    context: DriverContext,
}

impl JetStreamSourceDriver {
    pub fn new(url: impl Into<String>, settings: StreamSettings, context: DriverContext) -> Self {
        Self {
            url: url.into(),
            settings,
            context,
        }
    }
}

#[async_trait]
impl SourceDriver for JetStreamSourceDriver {
    async fn initialize(&self) -> EventBusResult<()> {
        let conn = management_connection(&self.url, &self.context).await?;
        let result = ensure_stream(&conn, &self.settings).await;
        conn.close().await?;
        result
    }

    async fn connect(&self, client_id: &str) -> EventBusResult<Box<dyn SourceConnection>> {
        let conn = BusConnection::connect(
            self.context.connector.as_ref(),
            &self.url,
            connect_options(client_id, &self.context),
        )
        .await?
        .with_publish_timeout(self.context.publish_timeout);
        Ok(Box::new(JetStreamSourceConnection { conn }))
    }
}

/// Publishing connection of an event source
pub struct JetStreamSourceConnection {
    conn: BusConnection,
}

#[async_trait]
impl SourceConnection for JetStreamSourceConnection {
    fn client_id(&self) -> &str {
        self.conn.client_id()
    }

    async fn publish(&self, event: &Event) -> EventBusResult<()> {
        let subject = event_subject(DEFAULT_STREAM_NAME, &event.source, &event.subject);
        let payload = event.encode()?;
        self.conn.publish(&subject, payload).await?;
        debug!(subject = %subject, event_id = %event.id, "Published event");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    async fn close(&self) -> EventBusResult<()> {
        self.conn.close().await
    }
}

/// Sensor side of the stream/consumer bus
pub struct JetStreamSensorDriver {
    sensor: SensorSpec,
    url: String,
    settings: StreamSettings,
    context: DriverContext,
}

impl JetStreamSensorDriver {
    pub fn new(
        sensor: SensorSpec,
        url: impl Into<String>,
        settings: StreamSettings,
        context: DriverContext,
    ) -> Self {
        Self {
            sensor,
            url: url.into(),
            settings,
            context,
        }
    }
}

#[async_trait]
impl SensorDriver for JetStreamSensorDriver {
    /// Provision the stream and the sensor's bucket, then reconcile stored state
    async fn initialize(&self) -> EventBusResult<()> {
        let conn = management_connection(&self.url, &self.context).await?;
        let result = async {
            ensure_stream(&conn, &self.settings).await?;
            let kv = conn
                .client()
                .key_value(&self.sensor.name)
                .await
                .map_err(|e| EventBusError::KeyValue {
                    key: self.sensor.name.clone(),
                    reason: e.to_string(),
                })?;
            info!(sensor = %self.sensor.name, "Located key-value store for sensor");
            SensorState::new(&self.sensor.name, kv, Arc::clone(conn.client()))
                .reconcile(&self.sensor)
                .await
        }
        .await;
        conn.close().await?;
        result.map(|_| ())
    }

    async fn connect(
        &self,
        trigger_name: &str,
        expression: &str,
        dependencies: &[Dependency],
    ) -> EventBusResult<Box<dyn TriggerConnection>> {
        let stable = identity::stable_id(&self.sensor.name, trigger_name, Some(expression));
        let client_id = identity::client_id(&stable);
        let conn = BusConnection::connect(
            self.context.connector.as_ref(),
            &self.url,
            connect_options(&client_id, &self.context),
        )
        .await?;

        info!(
            sensor = %self.sensor.name,
            trigger = trigger_name,
            client_id = %client_id,
            "Trigger connection established"
        );
        Ok(Box::new(JetStreamTriggerConnection {
            conn,
            sensor_name: self.sensor.name.clone(),
            trigger_name: trigger_name.to_string(),
            expression: expression.to_string(),
            dependencies: dependencies.to_vec(),
            stats: Arc::new(TriggerStats::default()),
        }))
    }
}

/// Per-subscribe processing state
struct Processor<'a> {
    trigger_name: &'a str,
    dependency_names: Vec<&'a str>,
    matcher: DependencyMatcher,
    engine: ConditionEngine,
    store: WindowStore,
    recent: RecentEvents,
    stats: &'a TriggerStats,
}

impl Processor<'_> {
    async fn handle(&mut self, message: TransportMessage, handlers: &TriggerHandlers) {
        self.stats.events_received.fetch_add(1, Ordering::Relaxed);
        self.process(&message, handlers).await;
        message.ack();
    }

    async fn process(&mut self, message: &TransportMessage, handlers: &TriggerHandlers) {
        let now = Utc::now();
        let event = match Event::decode(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                error!(trigger = self.trigger_name, error = %e, "Failed to decode event, discarding it");
                return;
            }
        };

        if self.recent.contains(&event.id, now) {
            self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(trigger = self.trigger_name, event_id = %event.id, "Already received event, ignoring it");
            return;
        }

        let dependencies: Vec<String> = self
            .matcher
            .resolve(&event.source, &event.subject)
            .into_iter()
            .map(str::to_string)
            .collect();
        if dependencies.is_empty() {
            warn!(
                trigger = self.trigger_name,
                source = %event.source,
                subject = %event.subject,
                "Event not associated with any dependency"
            );
            return;
        }

        for dependency in &dependencies {
            let delivery = Delivery::new(dependency.as_str(), event.clone(), message.timestamp)
                .with_sequence(message.sequence);
            let outcome = self.engine.process(delivery, now);
            self.stats.record(&outcome);
            log_outcome(self.trigger_name, dependency, &outcome);

            match &outcome {
                Outcome::Pending => {
                    if let Some(entry) = self.engine.window().get(dependency) {
                        let info = MsgInfo::from_entry(entry);
                        if let Err(e) = self.store.save(dependency, &info).await {
                            error!(trigger = self.trigger_name, dependency = %dependency, error = %e, "Failed to persist held event");
                        }
                    }
                }
                Outcome::Fired(firing) => {
                    let _ = handlers.invoke(firing.events.clone(), self.stats).await;
                    if let Err(e) = self.store.clear_all(self.dependency_names.clone()).await {
                        error!(trigger = self.trigger_name, error = %e, "Failed to clear held events");
                    }
                }
                _ => {}
            }

            if let Err(e) = self.store.sync(&self.engine).await {
                error!(trigger = self.trigger_name, error = %e, "Failed to sync held events");
            }
        }

        self.recent.record(event.id, now);
        self.recent.evict_expired(now);
    }

    /// Fire a restored window that already satisfies the expression
    async fn fire_restored(&mut self, handlers: &TriggerHandlers) {
        let Some(firing) = self.engine.fire_restored(Utc::now()) else {
            return;
        };
        info!(trigger = self.trigger_name, events = firing.events.len(), "Restored events satisfy the trigger");
        let _ = handlers.invoke(firing.events, self.stats).await;
        if let Err(e) = self.store.clear_all(self.dependency_names.clone()).await {
            error!(trigger = self.trigger_name, error = %e, "Failed to clear held events");
        }
    }

    async fn reset(&mut self, at: DateTime<Utc>) {
        self.engine.reset(at);
        if let Err(e) = self.store.clear_all(self.dependency_names.clone()).await {
            error!(trigger = self.trigger_name, error = %e, "Failed to clear held events on reset");
        }
    }
}

/// Trigger subscription on the stream/consumer bus
pub struct JetStreamTriggerConnection {
    conn: BusConnection,
    sensor_name: String,
    trigger_name: String,
    expression: String,
    dependencies: Vec<Dependency>,
    stats: Arc<TriggerStats>,
}

impl JetStreamTriggerConnection {
    /// One durable subscription per distinct dependency subject
    async fn subscribe_all(&self) -> EventBusResult<Vec<Subscription>> {
        let mut subjects: BTreeMap<String, &Dependency> = BTreeMap::new();
        for dep in &self.dependencies {
            subjects.insert(dependency_subject(DEFAULT_STREAM_NAME, dep), dep);
        }

        let mut subscriptions = Vec::with_capacity(subjects.len());
        for (subject, dep) in subjects {
            let durable = identity::durable_name(&self.sensor_name, &self.trigger_name, &dep.name);
            match self
                .conn
                .client()
                .subscribe(&subject, SubscribeOptions::durable(durable.as_str()))
                .await
            {
                Ok(sub) => {
                    info!(trigger = %self.trigger_name, subject = %subject, durable = %durable, "Subscribed to subject");
                    subscriptions.push(sub);
                }
                Err(source) => {
                    self.stats.subscription_errors.fetch_add(1, Ordering::Relaxed);
                    error!(
                        sensor = %self.sensor_name,
                        trigger = %self.trigger_name,
                        dependency = %dep.name,
                        subject = %subject,
                        durable = %durable,
                        error = %source,
                        "Failed to subscribe"
                    );
                    self.unsubscribe_all(&subscriptions).await;
                    return Err(EventBusError::Subscription { subject, source });
                }
            }
        }
        Ok(subscriptions)
    }

    async fn unsubscribe_all(&self, subscriptions: &[Subscription]) {
        for sub in subscriptions {
            if let Err(e) = self.conn.client().unsubscribe(sub.id).await {
                debug!(subject = %sub.subject, error = %e, "Unsubscribe failed");
            }
        }
    }
}

fn merge(subscriptions: Vec<Subscription>) -> SelectAll<BoxStream<'static, TransportMessage>> {
    stream::select_all(subscriptions.into_iter().map(|sub| {
        stream::unfold(sub, |mut sub| async move { sub.next().await.map(|m| (m, sub)) }).boxed()
    }))
}

#[async_trait]
impl TriggerConnection for JetStreamTriggerConnection {
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

        let kv = self
            .conn
            .client()
            .key_value(&self.sensor_name)
            .await
            .map_err(|e| EventBusError::KeyValue {
                key: self.sensor_name.clone(),
                reason: e.to_string(),
            })?;

        let mut engine = ConditionEngine::new(expression, last_reset_time);
        if let Some(filter) = &handlers.filter {
            engine = engine.with_filter(Arc::clone(filter));
        }
        if let Some(transform) = &handlers.transform {
            engine = engine.with_transform(Arc::clone(transform));
        }

        let dependency_names: Vec<&str> = self.dependencies.iter().map(|d| d.name.as_str()).collect();
        let mut store = WindowStore::new(self.trigger_name.as_str(), kv);
        let restored = store.restore(&mut engine, dependency_names.clone()).await?;
        if restored > 0 {
            info!(trigger = %self.trigger_name, restored, "Restored held events");
        }

        let subscriptions = match self.subscribe_all().await {
            Ok(subs) => subs,
            Err(e) => {
                let _ = self.conn.close().await;
                return Err(e);
            }
        };
        let ids: Vec<_> = subscriptions.iter().map(|s| (s.id, s.subject.clone())).collect();
        let mut messages = merge(subscriptions);

        let mut processor = Processor {
            trigger_name: &self.trigger_name,
            dependency_names,
            matcher,
            engine,
            store,
            recent: RecentEvents::new(chrono::Duration::seconds(DUPLICATE_TTL_SECS)),
            stats: &self.stats,
        };
        processor.fire_restored(&handlers).await;

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(trigger = %self.trigger_name, "Closing subscriptions");
                    break Ok(());
                }
                _ = self.conn.wait_closed() => {
                    self.stats.connection_errors.fetch_add(1, Ordering::Relaxed);
                    error!(trigger = %self.trigger_name, "Event bus connection lost, leaving subscriptions");
                    break Err(EventBusError::Closed);
                }
                Some(signal) = resets.recv() => {
                    info!(trigger = %self.trigger_name, source = ?signal.source, "Resetting conditions");
                    processor.reset(signal.at).await;
                }
                message = messages.next() => match message {
                    Some(message) => processor.handle(message, &handlers).await,
                    None => {
                        warn!(trigger = %self.trigger_name, "Subscriptions ended by the transport");
                        break Err(EventBusError::Closed);
                    }
                },
            }
        };

        for (id, subject) in ids {
            if let Err(e) = self.conn.client().unsubscribe(id).await {
                debug!(subject = %subject, error = %e, "Unsubscribe failed");
            }
        }
        self.conn.close().await?;
        info!(trigger = %self.trigger_name, "Subscriptions closed");
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
