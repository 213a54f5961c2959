//! Sensor and event source drivers running against the in-process broker

use ae_condition::{ResetEngine, ResetReceiver};
use ae_config::SensorSpec;
use ae_core::{Dependency, Event};
use ae_event_bus::{
    identity, sensor_driver, source_driver, ActionFn, Auth, AuthResolver, BrokerAuth,
    DriverContext, EventBusError, EventBusResult, MemoryBroker, SensorDriver, SourceConnection,
    TriggerConnection, TriggerHandlers,
};
use ae_config::{BusConfig, JetStreamBusConfig, NatsBusConfig};
use futures::FutureExt;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

fn streaming_config() -> BusConfig {
    BusConfig {
        nats: Some(NatsBusConfig {
            url: "mem://bus".to_string(),
            cluster_id: "eventbus".to_string(),
            auth: None,
        }),
        jetstream: None,
    }
}

fn jetstream_config() -> BusConfig {
    BusConfig {
        nats: None,
        jetstream: Some(JetStreamBusConfig {
            url: "mem://bus".to_string(),
            stream_config: "maxAge: 72h\nreplicas: 1\n".to_string(),
            access_secret: false,
        }),
    }
}

fn sensor(conditions: &str) -> SensorSpec {
    serde_json::from_value(json!({
        "name": "ci-sensor",
        "dependencies": [
            {"name": "a", "eventSourceName": "webhook", "eventName": "a"},
            {"name": "b", "eventSourceName": "webhook", "eventName": "b"}
        ],
        "triggers": [{"name": "deploy", "conditions": conditions}]
    }))
    .unwrap()
}

fn context(broker: &MemoryBroker) -> DriverContext {
    DriverContext::new(Arc::new(broker.clone()), AuthResolver::fixed(Auth::none()))
}

type Fired = mpsc::UnboundedReceiver<HashMap<String, Event>>;

fn recording_action() -> (ActionFn, Fired) {
    let (tx, rx) = mpsc::unbounded_channel();
    let action: ActionFn = Arc::new(move |events| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(events);
            Ok(())
        }
        .boxed()
    });
    (action, rx)
}

async fn wait_for_subscriptions(broker: &MemoryBroker, count: usize) {
    tokio::time::timeout(WAIT, async {
        while broker.subscription_count() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("subscriptions not established");
}

struct Running {
    shutdown: CancellationToken,
    task: JoinHandle<EventBusResult<()>>,
    client_id: String,
}

impl Running {
    async fn stop(self) -> EventBusResult<()> {
        self.shutdown.cancel();
        tokio::time::timeout(WAIT, self.task).await.unwrap().unwrap()
    }
}

async fn start_trigger(
    driver: &dyn SensorDriver,
    spec: &SensorSpec,
    resets: ResetReceiver,
    handlers: TriggerHandlers,
) -> Running {
    let trigger = &spec.triggers[0];
    let conn: Box<dyn TriggerConnection> = driver
        .connect(&trigger.name, &spec.trigger_expression(trigger), &spec.dependencies)
        .await
        .unwrap();
    let client_id = conn.client_id().to_string();
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let task = tokio::spawn(async move { conn.subscribe(token, resets, None, handlers).await });
    Running {
        shutdown,
        task,
        client_id,
    }
}

fn no_resets() -> ResetReceiver {
    ResetEngine::new(&[]).spawn(CancellationToken::new())
}

async fn publisher(config: &BusConfig, broker: &MemoryBroker) -> Box<dyn SourceConnection> {
    let driver = source_driver(config, context(broker)).unwrap();
    driver.initialize().await.unwrap();
    driver.connect("webhook-source").await.unwrap()
}

fn event(name: &str) -> Event {
    Event::new("webhook", name, "webhook", json!({ "name": name }))
}

async fn expect_fire(fired: &mut Fired) -> HashMap<String, Event> {
    tokio::time::timeout(WAIT, fired.recv())
        .await
        .expect("trigger did not fire")
        .unwrap()
}

async fn expect_no_fire(fired: &mut Fired) {
    assert!(tokio::time::timeout(Duration::from_millis(200), fired.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn test_streaming_and_expression_fires_with_both_events() {
    let broker = MemoryBroker::new();
    let config = streaming_config();
    let spec = sensor("a && b");
    let driver = sensor_driver(&config, spec.clone(), context(&broker)).unwrap();
    driver.initialize().await.unwrap();

    let (action, mut fired) = recording_action();
    let running = start_trigger(driver.as_ref(), &spec, no_resets(), TriggerHandlers::new(action)).await;
    wait_for_subscriptions(&broker, 1).await;

    let source = publisher(&config, &broker).await;
    source.publish(&event("a")).await.unwrap();
    expect_no_fire(&mut fired).await;
    source.publish(&event("b")).await.unwrap();

    let events = expect_fire(&mut fired).await;
    assert_eq!(events.len(), 2);
    assert_eq!(events["a"].subject, "a");
    assert_eq!(events["b"].subject, "b");

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_streaming_held_event_survives_restart() {
    let broker = MemoryBroker::new();
    let config = streaming_config();
    let spec = sensor("a && b");
    let driver = sensor_driver(&config, spec.clone(), context(&broker)).unwrap();

    let (action, mut fired) = recording_action();
    let first = start_trigger(driver.as_ref(), &spec, no_resets(), TriggerHandlers::new(action.clone())).await;
    wait_for_subscriptions(&broker, 1).await;

    let source = publisher(&config, &broker).await;
    let held = event("a");
    source.publish(&held).await.unwrap();
    expect_no_fire(&mut fired).await;
    first.stop().await.unwrap();

    // The held message was never acknowledged, so the group redelivers it
    let second = start_trigger(driver.as_ref(), &spec, no_resets(), TriggerHandlers::new(action)).await;
    wait_for_subscriptions(&broker, 1).await;
    source.publish(&event("b")).await.unwrap();

    let events = expect_fire(&mut fired).await;
    assert_eq!(events["a"].id, held.id);
    second.stop().await.unwrap();
}

#[tokio::test]
async fn test_streaming_manual_reset_clears_window() {
    let broker = MemoryBroker::new();
    let config = streaming_config();
    let spec = sensor("a && b");
    let driver = sensor_driver(&config, spec.clone(), context(&broker)).unwrap();

    let resets = no_resets();
    let manual = resets.manual();
    let (action, mut fired) = recording_action();
    let running = start_trigger(driver.as_ref(), &spec, resets, TriggerHandlers::new(action)).await;
    wait_for_subscriptions(&broker, 1).await;

    let source = publisher(&config, &broker).await;
    source.publish(&event("a")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(manual.reset("operator").await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    source.publish(&event("b")).await.unwrap();
    expect_no_fire(&mut fired).await;

    let second_a = event("a");
    source.publish(&second_a).await.unwrap();
    let events = expect_fire(&mut fired).await;
    assert_eq!(events["a"].id, second_a.id);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_jetstream_or_expression_fires_per_event() {
    let broker = MemoryBroker::new();
    let config = jetstream_config();
    let spec = sensor("a || b");
    let driver = sensor_driver(&config, spec.clone(), context(&broker)).unwrap();
    driver.initialize().await.unwrap();

    let (action, mut fired) = recording_action();
    let running = start_trigger(driver.as_ref(), &spec, no_resets(), TriggerHandlers::new(action)).await;
    wait_for_subscriptions(&broker, 2).await;

    let source = publisher(&config, &broker).await;
    source.publish(&event("a")).await.unwrap();
    let events = expect_fire(&mut fired).await;
    assert_eq!(events.keys().map(String::as_str).collect::<Vec<_>>(), vec!["a"]);

    source.publish(&event("b")).await.unwrap();
    let events = expect_fire(&mut fired).await;
    assert_eq!(events.keys().map(String::as_str).collect::<Vec<_>>(), vec!["b"]);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn test_jetstream_held_event_persisted_across_restart() {
    let broker = MemoryBroker::new();
    let config = jetstream_config();
    let spec = sensor("a && b");
    let driver = sensor_driver(&config, spec.clone(), context(&broker)).unwrap();
    driver.initialize().await.unwrap();

    let (action, mut fired) = recording_action();
    let first = start_trigger(driver.as_ref(), &spec, no_resets(), TriggerHandlers::new(action.clone())).await;
    wait_for_subscriptions(&broker, 2).await;

    let source = publisher(&config, &broker).await;
    let held = event("a");
    source.publish(&held).await.unwrap();
    expect_no_fire(&mut fired).await;
    first.stop().await.unwrap();

    let bucket = broker.bucket("ci-sensor").unwrap();
    assert!(bucket.contains_key("deploy/a"));

    let second = start_trigger(driver.as_ref(), &spec, no_resets(), TriggerHandlers::new(action)).await;
    wait_for_subscriptions(&broker, 2).await;
    source.publish(&event("b")).await.unwrap();

    let events = expect_fire(&mut fired).await;
    assert_eq!(events["a"].id, held.id);
    // Firing clears the persisted window
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!bucket.contains_key("deploy/a"));
    assert!(!bucket.contains_key("deploy/b"));

    second.stop().await.unwrap();
}

#[tokio::test]
async fn test_jetstream_changed_dependency_purged_on_initialize() {
    let broker = MemoryBroker::new();
    let config = jetstream_config();
    let spec = sensor("a && b");
    let driver = sensor_driver(&config, spec.clone(), context(&broker)).unwrap();
    driver.initialize().await.unwrap();

    let (action, _fired) = recording_action();
    let running = start_trigger(driver.as_ref(), &spec, no_resets(), TriggerHandlers::new(action)).await;
    wait_for_subscriptions(&broker, 2).await;
    let source = publisher(&config, &broker).await;
    source.publish(&event("a")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    running.stop().await.unwrap();

    let durable_a = identity::durable_name("ci-sensor", "deploy", "a");
    assert!(broker.has_durable(&durable_a));
    assert!(broker.bucket("ci-sensor").unwrap().contains_key("deploy/a"));

    let mut changed = spec.clone();
    changed.dependencies[0] = Dependency::new("a", "webhook", "a-renamed");
    let driver = sensor_driver(&config, changed, context(&broker)).unwrap();
    driver.initialize().await.unwrap();

    assert!(!broker.has_durable(&durable_a));
    assert!(!broker.bucket("ci-sensor").unwrap().contains_key("deploy/a"));
}

#[tokio::test]
async fn test_shutdown_releases_client() {
    let broker = MemoryBroker::new();
    let config = jetstream_config();
    let spec = sensor("a");
    let driver = sensor_driver(&config, spec.clone(), context(&broker)).unwrap();
    driver.initialize().await.unwrap();

    let (action, _fired) = recording_action();
    let running = start_trigger(driver.as_ref(), &spec, no_resets(), TriggerHandlers::new(action)).await;
    wait_for_subscriptions(&broker, 1).await;
    let client_id = running.client_id.clone();
    assert!(broker.is_registered(&client_id));

    running.stop().await.unwrap();
    assert!(!broker.is_registered(&client_id));
    assert_eq!(broker.subscription_count(), 0);
}

#[tokio::test]
async fn test_connection_loss_ends_subscription() {
    let broker = MemoryBroker::new();
    let config = streaming_config();
    let spec = sensor("a && b");
    let driver = sensor_driver(&config, spec.clone(), context(&broker)).unwrap();

    let (action, _fired) = recording_action();
    let running = start_trigger(driver.as_ref(), &spec, no_resets(), TriggerHandlers::new(action)).await;
    wait_for_subscriptions(&broker, 1).await;

    broker.set_online(false);
    let result = tokio::time::timeout(WAIT, running.task).await.unwrap().unwrap();
    assert!(matches!(result, Err(EventBusError::Closed)));
}

#[tokio::test]
async fn test_rejected_credential_is_connection_error() {
    let broker = MemoryBroker::with_auth(BrokerAuth::Token("secret".to_string()));
    let wrong = DriverContext::new(
        Arc::new(broker.clone()),
        AuthResolver::fixed(Auth::token("guess")),
    );
    let driver = source_driver(&streaming_config(), wrong).unwrap();

    let err = driver.connect("webhook-source").await.err().unwrap();
    assert!(matches!(err, EventBusError::Connection { .. }));

    let right = DriverContext::new(
        Arc::new(broker.clone()),
        AuthResolver::fixed(Auth::token("secret")),
    );
    let driver = source_driver(&streaming_config(), right).unwrap();
    assert!(driver.connect("webhook-source").await.is_ok());
}
