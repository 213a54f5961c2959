//! CloudEvents-style envelope carried on the bus

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// CloudEvents spec version written on every event
pub const CLOUDEVENTS_SPEC_VERSION: &str = "1.0";

/// An occurrence published by an event source
///
/// `source` is the event source name and `subject` is the event name inside
/// that source. Together they select which sensor dependencies the event
/// satisfies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier, used for duplicate-delivery detection
    pub id: String,

    /// Event source name
    pub source: String,

    /// Event name within the source
    pub subject: String,

    /// Event type (e.g. `webhook`, `calendar`)
    #[serde(rename = "type")]
    pub event_type: String,

    /// CloudEvents spec version
    #[serde(rename = "specversion", default = "default_spec_version")]
    pub spec_version: String,

    /// When the occurrence happened
    pub time: DateTime<Utc>,

    /// Content type of `data`
    #[serde(
        rename = "datacontenttype",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub data_content_type: Option<String>,

    /// Event payload
    #[serde(default)]
    pub data: serde_json::Value,
}

fn default_spec_version() -> String {
    CLOUDEVENTS_SPEC_VERSION.to_string()
}

impl Event {
    /// Create a new event stamped with a fresh ULID and the current time
    pub fn new(
        source: impl Into<String>,
        subject: impl Into<String>,
        event_type: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: Ulid::new().to_string(),
            source: source.into(),
            subject: subject.into(),
            event_type: event_type.into(),
            spec_version: default_spec_version(),
            time: Utc::now(),
            data_content_type: Some("application/json".to_string()),
            data,
        }
    }

    /// Replace the event ID
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Replace the event time
    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = time;
        self
    }

    /// Serialize to the JSON wire format
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse from the JSON wire format
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
