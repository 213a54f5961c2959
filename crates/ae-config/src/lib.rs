//! YAML configuration for the event bus
//!
//! This crate loads the configuration consumed by event sources and sensors:
//!
//! - [`BusConfig`] - which bus variant to use and where it lives
//! - [`StreamSettings`] - stream provisioning for the stream/consumer variant
//! - [`SensorSpec`] / [`EventSourceSpec`] - what to subscribe to and publish
//! - [`AuthCredential`] - the mounted bus credential file
//!
//! YAML files may use two custom tags:
//!
//! - `!include path` - Include another YAML file
//! - `!env_var VAR [default]` - Environment variable substitution
//!
//! # Example
//!
//! ```ignore
//! use ae_config::{load_config, SensorSpec};
//!
//! let sensor: SensorSpec = load_config("/etc/sensor/sensor.yaml")?;
//! sensor.validate()?;
//! ```

mod bus;
mod credentials;
mod error;
mod loader;
mod sensor;

pub use bus::{
    parse_duration, AuthStrategy, BusConfig, DiscardPolicy, EventBusType, JetStreamBusConfig,
    NatsBusConfig, RetentionPolicy, StreamSettings,
};
pub use credentials::{AuthCredential, EVENT_BUS_AUTH_FILE_MOUNT_PATH, EVENT_BUS_AUTH_FILE_NAME};
pub use error::{ConfigError, ConfigResult};
pub use loader::{load_config, load_yaml, YamlLoader};
pub use sensor::{
    ConditionsResetByTime, ConditionsResetCriteria, EventSourceSpec, SensorSpec, TriggerSpec,
};

/// Environment variable selecting the leader election mechanism (`k8s` for leases)
pub const ENV_LEADER_ELECTION: &str = "EVENTBUS_LEADER_ELECTION";

// Re-export serde_yaml::Value for convenience
pub use serde_yaml::Value;
