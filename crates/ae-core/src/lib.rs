//! Core types for the event bus
//!
//! This crate provides the value types shared by event sources, sensors and
//! the bus drivers: the CloudEvents-style [`Event`] envelope, the
//! [`Dependency`] binding a sensor to one event stream, and the subject
//! naming rules publishers and subscribers agree on.

mod dependency;
mod event;
pub mod subject;

pub use dependency::{Dependency, DependencyMatcher, MatcherError};
pub use event::{Event, CLOUDEVENTS_SPEC_VERSION};

/// Name of the stream (and subject prefix) used by the stream/consumer bus
pub const DEFAULT_STREAM_NAME: &str = "default";
