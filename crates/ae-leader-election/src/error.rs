//! Leader election errors

use ae_event_bus::EventBusError;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for leader election
pub type ElectionResult<T> = Result<T, ElectionError>;

#[derive(Debug, Error)]
pub enum ElectionError {
    /// The election feed closed while this replica was leading
    ///
    /// Fatal: the process is expected to exit rather than keep running
    /// work another replica may have taken over.
    #[error("leadership lost unexpectedly: election feed closed while leading")]
    LeadershipLostUnexpectedly,

    /// The election feed closed while following
    #[error("election feed closed")]
    FeedClosed,

    #[error(transparent)]
    Bus(#[from] EventBusError),

    #[error("failed to access election state file {path}: {source}")]
    StateFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode election state: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("lease operation failed: {0}")]
    Lease(String),

    #[error("invalid election settings: {0}")]
    InvalidSettings(String),
}

impl ElectionError {
    /// Whether the process must stop instead of retrying
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ElectionError::LeadershipLostUnexpectedly | ElectionError::FeedClosed
        )
    }
}
