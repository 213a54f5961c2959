//! Sensor and event source runners
//!
//! A [`Server`] runs every sensor and event source of a [`ServerConfig`],
//! each under its own leader election so that only one replica processes
//! at a time:
//!
//! - [`SensorRunner`] - one trigger connection per trigger, reset engines,
//!   reconnect with backoff
//! - [`EventSourceRunner`] - publishes fed events, replaces closed
//!   connections
//! - [`BackoffPolicy`] - retry delays for everything the bus drivers leave
//!   to their callers

mod backoff;
mod config;
mod error;
mod sensor;
mod server;
mod source;
mod supervisor;

pub use backoff::{retry, BackoffPolicy, JitterPolicy};
pub use config::{ServerConfig, DEFAULT_CONFIG_PATH, ENV_CONFIG_PATH};
pub use error::{ServerError, ServerResult};
pub use sensor::SensorRunner;
pub use server::{Publisher, Server};
pub use source::{
    source_client_id, EventSourceRunner, PublishStats, DEFAULT_HEALTH_INTERVAL, EVENT_BUFFER,
};
pub use supervisor::{build_elector, run_elected, Workload};
