//! Leader election
//!
//! Sensors and event sources run several replicas but only one may process
//! at a time. An [`Elector`] decides which: it calls
//! `on_started_leading` with a token that is cancelled when leadership ends,
//! and `on_stopped_leading` once it has.
//!
//! - [`BusElector`] - Raft-style election over the event bus
//! - [`LeaseElector`] - a lease behind a [`LeaseLock`]
//!
//! [`ElectorKind::from_env`] picks between them.

mod bus_elector;
mod elector;
mod error;
mod lease;

pub use bus_elector::{
    BusElector, ClusterInfo, ElectionTiming, NodeState, PersistedState, StateChange, StateLog,
};
pub use elector::{Elector, ElectorKind, LeaderCallbacks, StartedLeadingFn, StoppedLeadingFn};
pub use error::{ElectionError, ElectionResult};
pub use lease::{
    LeaseElector, LeaseLock, LeaseRecord, LeaseTiming, MemoryLeaseLock, MemoryLeaseStore,
    VersionedLease,
};
