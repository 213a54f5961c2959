//! Client and consumer identities
//!
//! A durable identity is stable across restarts so a restarted sensor
//! rejoins the same logical consumer and keeps its delivery position. The
//! client ID adds a random suffix on top of it: during a rolling restart the
//! old pod's connection may not have expired yet, and reusing its exact ID
//! would be refused by the transport.

use crate::error::{EventBusError, EventBusResult};
use rand::Rng;
use sha2::{Digest, Sha256};

/// Hex characters kept from the digest
const HASH_LEN: usize = 32;

/// Deterministic hex digest of `value`
pub fn hash(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    let mut encoded = hex::encode(digest);
    encoded.truncate(HASH_LEN);
    encoded
}

/// Durable identity of one trigger of one sensor
pub fn stable_id(sensor_name: &str, trigger_name: &str, expression: Option<&str>) -> String {
    let key = match expression {
        Some(expr) => format!("{}-{}-{}", sensor_name, trigger_name, expr),
        None => format!("{}-{}", sensor_name, trigger_name),
    };
    hash(&key)
}

/// Client ID for a new connection instance: `client-{stable}-{0..99}`
pub fn client_id(stable_id: &str) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..100);
    format!("client-{}-{}", stable_id, suffix)
}

/// Queue group a client belongs to: the client ID without its last `-` segment
pub fn group_from_client_id(client_id: &str) -> EventBusResult<String> {
    match client_id.rsplit_once('-') {
        Some((group, _)) if !group.is_empty() => Ok(group.to_string()),
        _ => Err(EventBusError::InvalidConfig(format!(
            "expected client ID to contain a dash: {}",
            client_id
        ))),
    }
}

/// Durable consumer name of one dependency of one trigger
pub fn durable_name(sensor_name: &str, trigger_name: &str, dependency_name: &str) -> String {
    let key = format!("{}-{}-{}", sensor_name, trigger_name, dependency_name);
    format!("group-{}", hash(&key))
}
