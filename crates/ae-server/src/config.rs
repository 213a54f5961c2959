//! Server configuration file

use ae_config::{
    load_config, BusConfig, ConfigError, ConfigResult, EventSourceSpec, SensorSpec,
    EVENT_BUS_AUTH_FILE_MOUNT_PATH,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Environment variable pointing at the configuration file
pub const ENV_CONFIG_PATH: &str = "EVENTBUS_CONFIG";

/// Configuration file used when [`ENV_CONFIG_PATH`] is unset
pub const DEFAULT_CONFIG_PATH: &str = "/etc/argo-events/config.yaml";

/// Everything one server process runs
///
/// ```yaml
/// eventBus:
///   jetstream:
///     url: nats://eventbus:4222
///     streamConfig: |
///       maxAge: 72h
/// replicas: 2
/// eventSources:
///   - name: webhook
///     events: [push]
/// sensors:
///   - name: ci
///     dependencies: [...]
///     triggers: [...]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub event_bus: BusConfig,

    #[serde(default)]
    pub event_sources: Vec<EventSourceSpec>,

    #[serde(default)]
    pub sensors: Vec<SensorSpec>,

    /// Replicas of each workload taking part in leader election
    ///
    /// Replicas only coordinate when they share a broker and a lease store.
    /// The bundled binary keeps both in-process, so two copies of it never
    /// elect against each other.
    #[serde(default = "default_replicas")]
    pub replicas: usize,

    /// Where bus electors keep their term and vote
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default = "default_auth_mount_path")]
    pub auth_mount_path: PathBuf,

    /// Identity of this replica; defaults to `HOSTNAME`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

fn default_replicas() -> usize {
    1
}

fn default_state_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_auth_mount_path() -> PathBuf {
    PathBuf::from(EVENT_BUS_AUTH_FILE_MOUNT_PATH)
}

impl ServerConfig {
    /// Load and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let config: ServerConfig = load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.event_bus.bus_type()?;

        if self.event_sources.is_empty() && self.sensors.is_empty() {
            return Err(ConfigError::ValidationFailed {
                message: "nothing to run: no event sources or sensors configured".to_string(),
            });
        }
        if self.replicas == 0 {
            return Err(ConfigError::InvalidValue {
                key: "replicas".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let mut names = HashSet::new();
        for source in &self.event_sources {
            if source.name.is_empty() || !names.insert(source.name.as_str()) {
                return Err(ConfigError::ValidationFailed {
                    message: format!("event source name '{}' is empty or repeated", source.name),
                });
            }
        }

        let mut names = HashSet::new();
        for sensor in &self.sensors {
            sensor.validate()?;
            if !names.insert(sensor.name.as_str()) {
                return Err(ConfigError::ValidationFailed {
                    message: format!("duplicate sensor name '{}'", sensor.name),
                });
            }
        }
        Ok(())
    }

    /// Replica identity used for client IDs and leases
    pub fn hostname(&self) -> String {
        self.hostname
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "localhost".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const CONFIG: &str = r#"
eventBus:
  nats:
    url: nats://eventbus:4222
    clusterId: eventbus
eventSources:
  - name: webhook
    events: [push]
sensors:
  - name: ci
    dependencies:
      - name: push
        eventSourceName: webhook
        eventName: push
    triggers:
      - name: deploy
"#;

    #[test]
    fn test_load_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, CONFIG).unwrap();

        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config.replicas, 1);
        assert_eq!(config.event_sources[0].events, vec!["push"]);
        assert_eq!(config.sensors[0].triggers[0].name, "deploy");
        assert_eq!(
            config.auth_mount_path,
            PathBuf::from(EVENT_BUS_AUTH_FILE_MOUNT_PATH)
        );
    }

    #[test]
    fn test_empty_workload_rejected() {
        let config: ServerConfig = parse_config(
            "eventBus:\n  nats:\n    url: nats://x\n    clusterId: c\n",
        );
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationFailed { .. })
        ));
    }

    #[test]
    fn test_duplicate_source_rejected() {
        let mut config: ServerConfig = parse_config(CONFIG);
        config.event_sources.push(config.event_sources[0].clone());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_hostname_override() {
        let mut config: ServerConfig = parse_config(CONFIG);
        config.hostname = Some("replica-1".to_string());
        assert_eq!(config.hostname(), "replica-1");
    }

    fn parse_config(yaml: &str) -> ServerConfig {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, yaml).unwrap();
        load_config(&path).unwrap()
    }
}
