//! Event bus configuration
//!
//! Exactly one bus variant is configured per deployment: the streaming
//! variant (`nats`, cluster-ID addressed) or the stream/consumer variant
//! (`jetstream`, subject addressed with durable consumers and a key-value
//! side store).

use crate::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How connections authenticate against the bus
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthStrategy {
    /// No credential
    #[default]
    None,
    /// Token credential
    Token,
    /// Username and password credential
    Basic,
}

impl std::fmt::Display for AuthStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthStrategy::None => write!(f, "none"),
            AuthStrategy::Token => write!(f, "token"),
            AuthStrategy::Basic => write!(f, "basic"),
        }
    }
}

/// Bus variant selected by configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventBusType {
    /// Streaming variant: one subject, queue groups with durable names
    Nats,
    /// Stream/consumer variant: per-dependency subjects, pull consumers, KV store
    JetStream,
}

/// Streaming variant settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NatsBusConfig {
    pub url: String,
    pub cluster_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthStrategy>,
}

/// Stream/consumer variant settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JetStreamBusConfig {
    pub url: String,
    /// Embedded YAML document parsed by [`StreamSettings::parse`]
    #[serde(default)]
    pub stream_config: String,
    /// Whether a basic-auth access secret is mounted
    #[serde(default)]
    pub access_secret: bool,
}

/// Bus configuration shared by event sources and sensors
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nats: Option<NatsBusConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jetstream: Option<JetStreamBusConfig>,
}

impl BusConfig {
    /// Determine which variant is configured
    pub fn bus_type(&self) -> ConfigResult<EventBusType> {
        match (&self.nats, &self.jetstream) {
            (Some(_), Some(_)) => Err(ConfigError::InvalidValue {
                key: "eventBus".to_string(),
                reason: "nats and jetstream must not both be specified".to_string(),
            }),
            (Some(_), None) => Ok(EventBusType::Nats),
            (None, Some(_)) => Ok(EventBusType::JetStream),
            (None, None) => Err(ConfigError::InvalidValue {
                key: "eventBus".to_string(),
                reason: "no event bus configured".to_string(),
            }),
        }
    }

    /// Bus URL of the configured variant
    pub fn url(&self) -> ConfigResult<&str> {
        Ok(match self.bus_type()? {
            EventBusType::Nats => self.nats.as_ref().map(|n| n.url.as_str()),
            EventBusType::JetStream => self.jetstream.as_ref().map(|j| j.url.as_str()),
        }
        .unwrap_or_default())
    }

    /// Auth strategy implied by the configured variant
    pub fn auth_strategy(&self) -> ConfigResult<AuthStrategy> {
        Ok(match self.bus_type()? {
            EventBusType::Nats => self
                .nats
                .as_ref()
                .and_then(|n| n.auth)
                .unwrap_or_default(),
            EventBusType::JetStream => match &self.jetstream {
                Some(js) if js.access_secret => AuthStrategy::Basic,
                _ => AuthStrategy::None,
            },
        })
    }
}

/// Message retention policy of the stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetentionPolicy {
    #[default]
    Limits,
    Interest,
    WorkQueue,
}

/// What to discard when a stream hits its limits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DiscardPolicy {
    #[default]
    Old,
    New,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStreamSettings {
    retention: Option<i64>,
    discard: Option<i64>,
    max_msgs: Option<i64>,
    max_bytes: Option<i64>,
    max_age: Option<String>,
    replicas: Option<usize>,
    duplicates: Option<String>,
}

/// Stream provisioning settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSettings {
    pub retention: RetentionPolicy,
    pub discard: DiscardPolicy,
    /// `-1` means unlimited
    pub max_msgs: i64,
    /// `-1` means unlimited
    pub max_bytes: i64,
    /// Zero means unlimited
    pub max_age: Duration,
    pub replicas: usize,
    /// Window for publish-side duplicate detection
    pub duplicates: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            retention: RetentionPolicy::Limits,
            discard: DiscardPolicy::Old,
            max_msgs: -1,
            max_bytes: -1,
            max_age: Duration::ZERO,
            replicas: 3,
            duplicates: Duration::from_secs(300),
        }
    }
}

impl StreamSettings {
    /// Parse the embedded stream settings document
    pub fn parse(yaml: &str) -> ConfigResult<Self> {
        let raw: RawStreamSettings = if yaml.trim().is_empty() {
            RawStreamSettings::default()
        } else {
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::Yaml {
                path: "streamConfig".into(),
                source: e,
            })?
        };

        let defaults = Self::default();

        let retention = match raw.retention.unwrap_or(0) {
            0 => RetentionPolicy::Limits,
            1 => RetentionPolicy::Interest,
            2 => RetentionPolicy::WorkQueue,
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "retention".to_string(),
                    reason: format!("unknown retention policy {}", other),
                })
            }
        };

        let discard = match raw.discard.unwrap_or(0) {
            0 => DiscardPolicy::Old,
            1 => DiscardPolicy::New,
            other => {
                return Err(ConfigError::InvalidValue {
                    key: "discard".to_string(),
                    reason: format!("unknown discard policy {}", other),
                })
            }
        };

        let max_age = match raw.max_age {
            Some(s) => parse_duration("maxAge", &s)?,
            None => defaults.max_age,
        };
        let duplicates = match raw.duplicates {
            Some(s) => parse_duration("duplicates", &s)?,
            None => defaults.duplicates,
        };

        Ok(Self {
            retention,
            discard,
            max_msgs: raw.max_msgs.unwrap_or(defaults.max_msgs),
            max_bytes: raw.max_bytes.unwrap_or(defaults.max_bytes),
            max_age,
            replicas: raw.replicas.unwrap_or(defaults.replicas),
            duplicates,
        })
    }
}

/// Parse durations such as `72h`, `1m30s`, `500ms`
pub fn parse_duration(key: &str, input: &str) -> ConfigResult<Duration> {
    let invalid = |reason: &str| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: format!("{} in duration '{}'", reason, input),
    };

    let input = input.trim();
    if input == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| invalid("missing unit"))?;
        if digits == 0 {
            return Err(invalid("expected number"));
        }
        let amount: u64 = rest[..digits]
            .parse()
            .map_err(|_| invalid("number out of range"))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        total += match unit {
            "ms" => Duration::from_millis(amount),
            "s" => Duration::from_secs(amount),
            "m" => Duration::from_secs(amount * 60),
            "h" => Duration::from_secs(amount * 3600),
            _ => return Err(invalid("unknown unit")),
        };
    }

    Ok(total)
}
