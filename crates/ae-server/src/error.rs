//! Server errors

use ae_config::ConfigError;
use ae_event_bus::EventBusError;
use ae_leader_election::ElectionError;
use thiserror::Error;

/// Result type for the runners
pub type ServerResult<T> = Result<T, ServerError>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Bus(#[from] EventBusError),

    #[error(transparent)]
    Election(#[from] ElectionError),

    /// Retries were exhausted; carries the last failure
    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: Box<ServerError>,
    },

    #[error("no event source named '{0}'")]
    UnknownEventSource(String),

    #[error("event source '{0}' is not running")]
    EventSourceStopped(String),

    #[error("cancelled")]
    Cancelled,
}

impl ServerError {
    /// Whether the process must exit rather than keep running
    pub fn is_fatal(&self) -> bool {
        match self {
            ServerError::Election(e) => e.is_fatal(),
            ServerError::RetriesExhausted { source, .. } => source.is_fatal(),
            _ => false,
        }
    }
}
