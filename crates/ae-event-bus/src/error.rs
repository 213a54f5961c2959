//! Event bus errors

use crate::transport::TransportError;
use ae_condition::ExpressionError;
use ae_config::{AuthStrategy, ConfigError};
use ae_core::MatcherError;
use std::time::Duration;
use thiserror::Error;

/// Result type for event bus operations
pub type EventBusResult<T> = Result<T, EventBusError>;

/// Errors surfaced by bus connections and drivers
#[derive(Debug, Error)]
pub enum EventBusError {
    /// Transport unreachable or credentials rejected; the caller owns retries
    #[error("failed to connect to {url}: {source}")]
    Connection {
        url: String,
        #[source]
        source: TransportError,
    },

    #[error("failed to publish to '{subject}': {reason}")]
    Publish { subject: String, reason: String },

    #[error("failed to subscribe to '{subject}': {source}")]
    Subscription {
        subject: String,
        #[source]
        source: TransportError,
    },

    #[error("key-value operation on '{key}' failed: {reason}")]
    KeyValue { key: String, reason: String },

    #[error("unsupported auth strategy '{0}'")]
    UnsupportedAuth(AuthStrategy),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Credential(#[from] ConfigError),

    #[error("failed to watch credential file: {0}")]
    Watch(String),

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error(transparent)]
    Matcher(#[from] MatcherError),

    #[error("connection is closed")]
    Closed,
}

/// Errors reported by a trigger action
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("action did not complete within {0:?}")]
    Timeout(Duration),

    #[error("action failed: {0}")]
    Failed(String),
}

/// Result type for trigger actions
pub type ActionResult = Result<(), ActionError>;
