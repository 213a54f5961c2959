//! Event bus drivers
//!
//! Event sources publish through a [`SourceConnection`]; sensors consume
//! through one [`TriggerConnection`] per trigger. Two bus variants are
//! supported:
//!
//! - streaming ([`StreamingSourceDriver`], [`StreamingSensorDriver`]) - one
//!   subject, queue groups, held messages stay unacknowledged
//! - stream/consumer ([`JetStreamSourceDriver`], [`JetStreamSensorDriver`]) -
//!   per-event subjects, a durable consumer per dependency, held events
//!   persisted in a key-value bucket
//!
//! Both speak to the bus through the [`Connector`] interface.
//! [`MemoryBroker`] is the in-process implementation.
//!
//! # Example
//!
//! ```ignore
//! use ae_event_bus::{sensor_driver, AuthResolver, DriverContext, MemoryBroker};
//!
//! let context = DriverContext::new(Arc::new(MemoryBroker::new()), auth);
//! let driver = sensor_driver(&bus_config, sensor, context)?;
//! driver.initialize().await?;
//! let conn = driver.connect("trigger", "a && b", &sensor.dependencies).await?;
//! conn.subscribe(shutdown, resets, last_reset, handlers).await?;
//! ```

mod auth;
mod connection;
mod driver;
mod error;
pub mod identity;
mod jetstream;
mod memory;
mod sensor_state;
mod streaming;
mod transport;
mod trigger;

pub use auth::{Auth, AuthResolver, AuthWatcher};
pub use connection::{BusConnection, DEFAULT_PUBLISH_TIMEOUT};
pub use driver::{
    sensor_driver, source_driver, DriverContext, SensorDriver, SourceConnection, SourceDriver,
};
pub use error::{ActionError, ActionResult, EventBusError, EventBusResult};
pub use jetstream::{
    JetStreamSensorDriver, JetStreamSourceConnection, JetStreamSourceDriver,
    JetStreamTriggerConnection,
};
pub use memory::{BrokerAuth, MemoryBroker, MemoryKeyValue};
pub use sensor_state::{
    dependency_hash, dependency_key, trigger_expression_key, MsgInfo, Reconciliation,
    SensorState, WindowStore, DEPENDENCY_DEFS_KEY, TRIGGERS_KEY,
};
pub use streaming::{
    StreamingSensorDriver, StreamingSourceConnection, StreamingSourceDriver,
    StreamingTriggerConnection, DEFAULT_STREAMING_SUBJECT,
};
pub use transport::{
    Acker, ConnectOptions, ConnectionState, Connector, DeliverPolicy, KeyValue, StreamConfig,
    SubscribeOptions, Subscription, SubscriptionId, TransportClient, TransportError,
    TransportMessage, TransportResult,
};
pub use trigger::{
    ActionFn, TriggerConnection, TriggerHandlers, TriggerStats, TriggerStatsSnapshot,
    DEFAULT_ACTION_TIMEOUT,
};
