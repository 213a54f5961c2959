//! Bus drivers
//!
//! A driver is selected once from the bus configuration and then hands out
//! connections: publishing connections for event sources, trigger
//! connections for sensors.

use crate::auth::AuthResolver;
use crate::connection::DEFAULT_PUBLISH_TIMEOUT;
use crate::error::EventBusResult;
use crate::jetstream::{JetStreamSensorDriver, JetStreamSourceDriver};
use crate::streaming::{StreamingSensorDriver, StreamingSourceDriver, DEFAULT_STREAMING_SUBJECT};
use crate::transport::Connector;
use crate::trigger::TriggerConnection;
use ae_config::{BusConfig, EventBusType, SensorSpec, StreamSettings};
use ae_core::{Dependency, Event};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// What every driver needs besides its bus settings
#[derive(Clone)]
pub struct DriverContext {
    pub connector: Arc<dyn Connector>,
    pub auth: AuthResolver,
    /// Subject carrying all events on the streaming bus
    pub streaming_subject: String,
    pub publish_timeout: Duration,
}

impl std::fmt::Debug for DriverContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverContext")
            .field("auth", &self.auth)
            .field("streaming_subject", &self.streaming_subject)
            .field("publish_timeout", &self.publish_timeout)
            .finish()
    }
}

impl DriverContext {
    pub fn new(connector: Arc<dyn Connector>, auth: AuthResolver) -> Self {
        Self {
            connector,
            auth,
            streaming_subject: DEFAULT_STREAMING_SUBJECT.to_string(),
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    pub fn with_streaming_subject(mut self, subject: impl Into<String>) -> Self {
        self.streaming_subject = subject.into();
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }
}

/// Driver used by event sources
#[async_trait]
pub trait SourceDriver: Send + Sync {
    /// Provision whatever the bus needs before publishing
    async fn initialize(&self) -> EventBusResult<()>;

    /// Open a publishing connection under `client_id`
    async fn connect(&self, client_id: &str) -> EventBusResult<Box<dyn SourceConnection>>;
}

/// Publishing connection of an event source
#[async_trait]
pub trait SourceConnection: Send + Sync {
    fn client_id(&self) -> &str;

    async fn publish(&self, event: &Event) -> EventBusResult<()>;

    fn is_closed(&self) -> bool;

    async fn close(&self) -> EventBusResult<()>;
}

/// Driver used by sensors
#[async_trait]
pub trait SensorDriver: Send + Sync {
    /// Provision bus resources and reconcile stored state with the sensor
    async fn initialize(&self) -> EventBusResult<()>;

    /// Open a connection for one trigger
    ///
    /// `expression` is the trigger's effective dependency expression and
    /// `dependencies` the sensor's dependencies it may refer to.
    async fn connect(
        &self,
        trigger_name: &str,
        expression: &str,
        dependencies: &[Dependency],
    ) -> EventBusResult<Box<dyn TriggerConnection>>;
}

/// Select the event source driver for `config`
pub fn source_driver(config: &BusConfig, context: DriverContext) -> EventBusResult<Box<dyn SourceDriver>> {
    let driver: Box<dyn SourceDriver> = match config.bus_type()? {
        EventBusType::Nats => {
            let nats = streaming_config(config)?;
            Box::new(StreamingSourceDriver::new(&nats.url, &nats.cluster_id, context))
        }
        EventBusType::JetStream => {
            let (url, settings) = jetstream_config(config)?;
            Box::new(JetStreamSourceDriver::new(url, settings, context))
        }
    };
    info!(bus = ?config.bus_type()?, "Selected event source driver");
    Ok(driver)
}

/// Select the sensor driver for `config`
pub fn sensor_driver(
    config: &BusConfig,
    sensor: SensorSpec,
    context: DriverContext,
) -> EventBusResult<Box<dyn SensorDriver>> {
    sensor.validate()?;
    let driver: Box<dyn SensorDriver> = match config.bus_type()? {
        EventBusType::Nats => {
            let nats = streaming_config(config)?;
            Box::new(StreamingSensorDriver::new(
                sensor.name,
                &nats.url,
                &nats.cluster_id,
                context,
            ))
        }
        EventBusType::JetStream => {
            let (url, settings) = jetstream_config(config)?;
            Box::new(JetStreamSensorDriver::new(sensor, url, settings, context))
        }
    };
    info!(bus = ?config.bus_type()?, "Selected sensor driver");
    Ok(driver)
}

fn streaming_config(config: &BusConfig) -> EventBusResult<&ae_config::NatsBusConfig> {
    config.nats.as_ref().ok_or_else(|| {
        crate::error::EventBusError::InvalidConfig("streaming bus settings missing".to_string())
    })
}

fn jetstream_config(config: &BusConfig) -> EventBusResult<(String, StreamSettings)> {
    let js = config.jetstream.as_ref().ok_or_else(|| {
        crate::error::EventBusError::InvalidConfig("stream bus settings missing".to_string())
    })?;
    let settings = StreamSettings::parse(&js.stream_config)?;
    Ok((js.url.clone(), settings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Auth;
    use crate::error::EventBusError;
    use crate::memory::MemoryBroker;
    use ae_config::{JetStreamBusConfig, NatsBusConfig};

    fn context() -> DriverContext {
        DriverContext::new(Arc::new(MemoryBroker::new()), AuthResolver::fixed(Auth::none()))
    }

    fn sensor() -> SensorSpec {
        serde_json::from_value(serde_json::json!({
            "name": "sensor",
            "dependencies": [{"name": "a", "eventSourceName": "s", "eventName": "a"}],
            "triggers": [{"name": "t"}]
        }))
        .unwrap()
    }

    #[test]
    fn test_no_bus_configured() {
        let err = source_driver(&BusConfig::default(), context()).err().unwrap();
        assert!(matches!(err, EventBusError::Credential(_)));
    }

    #[test]
    fn test_bad_stream_settings_rejected() {
        let config = BusConfig {
            nats: None,
            jetstream: Some(JetStreamBusConfig {
                url: "mem://".to_string(),
                stream_config: "retention: 9".to_string(),
                access_secret: false,
            }),
        };
        assert!(sensor_driver(&config, sensor(), context()).is_err());
    }

    #[test]
    fn test_invalid_sensor_rejected() {
        let config = BusConfig {
            nats: Some(NatsBusConfig {
                url: "mem://".to_string(),
                cluster_id: "c".to_string(),
                auth: None,
            }),
            jetstream: None,
        };
        let mut spec = sensor();
        spec.dependencies.clear();
        assert!(sensor_driver(&config, spec, context()).is_err());
        assert!(sensor_driver(&config, sensor(), context()).is_ok());
    }

    #[test]
    fn test_context_defaults() {
        let ctx = context().with_streaming_subject("custom");
        assert_eq!(ctx.streaming_subject, "custom");
        assert_eq!(ctx.publish_timeout, DEFAULT_PUBLISH_TIMEOUT);
    }
}
