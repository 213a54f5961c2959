//! Sensor bookkeeping in the key-value side store
//!
//! The stream/consumer bus keeps one bucket per sensor:
//!
//! | Key | Value |
//! |---|---|
//! | `Triggers` | JSON list of trigger names |
//! | `Deps` | JSON map of dependency name to definition hash |
//! | `{trigger}/Expression` | the trigger's dependency expression |
//! | `{trigger}/{dependency}` | [`MsgInfo`] of an event held in the trigger's window |
//!
//! [`SensorState::reconcile`] compares the stored spec with the current one
//! when a sensor starts and purges what no longer applies, including the
//! durable consumers of purged dependencies.

use crate::error::{EventBusError, EventBusResult};
use crate::identity;
use crate::transport::{KeyValue, TransportClient, TransportError};
use ae_condition::{ConditionEngine, DependencyExpression, WindowEntry};
use ae_config::SensorSpec;
use ae_core::{Dependency, Event, DEFAULT_STREAM_NAME};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const TRIGGERS_KEY: &str = "Triggers";
pub const DEPENDENCY_DEFS_KEY: &str = "Deps";

pub fn dependency_key(trigger_name: &str, dependency_name: &str) -> String {
    format!("{}/{}", trigger_name, dependency_name)
}

pub fn trigger_expression_key(trigger_name: &str) -> String {
    format!("{}/Expression", trigger_name)
}

/// Hash of a dependency definition, used to detect changed dependencies
pub fn dependency_hash(dependency: &Dependency) -> EventBusResult<String> {
    let encoded = serde_json::to_string(dependency)?;
    Ok(identity::hash(&encoded))
}

/// An event held in a trigger's window, as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MsgInfo {
    pub stream_seq: u64,
    pub timestamp: DateTime<Utc>,
    pub event: Event,
}

impl MsgInfo {
    pub fn from_entry(entry: &WindowEntry) -> Self {
        Self {
            stream_seq: entry.sequence.unwrap_or_default(),
            timestamp: entry.timestamp,
            event: entry.event.clone(),
        }
    }

    pub fn into_entry(self, now: DateTime<Utc>) -> WindowEntry {
        WindowEntry::new(self.event, self.timestamp, now).with_sequence(self.stream_seq)
    }
}

fn kv_error(key: &str, source: TransportError) -> EventBusError {
    EventBusError::KeyValue {
        key: key.to_string(),
        reason: source.to_string(),
    }
}

async fn get_json<T: serde::de::DeserializeOwned>(
    kv: &dyn KeyValue,
    key: &str,
) -> EventBusResult<Option<T>> {
    match kv.get(key).await.map_err(|e| kv_error(key, e))? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| EventBusError::KeyValue {
                key: key.to_string(),
                reason: format!("undecodable value: {}", e),
            }),
        None => Ok(None),
    }
}

async fn put_json<T: Serialize>(kv: &dyn KeyValue, key: &str, value: &T) -> EventBusResult<()> {
    let bytes = serde_json::to_vec(value)?;
    kv.put(key, bytes).await.map_err(|e| kv_error(key, e))
}

/// What reconciliation found and purged
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub changed_dependencies: Vec<String>,
    pub removed_dependencies: Vec<String>,
    pub changed_triggers: Vec<String>,
    pub removed_triggers: Vec<String>,
    pub valid_triggers: Vec<String>,
}

/// Stored spec of one sensor
pub struct SensorState {
    sensor_name: String,
    kv: Arc<dyn KeyValue>,
    client: Arc<dyn TransportClient>,
}

impl SensorState {
    pub fn new(
        sensor_name: impl Into<String>,
        kv: Arc<dyn KeyValue>,
        client: Arc<dyn TransportClient>,
    ) -> Self {
        Self {
            sensor_name: sensor_name.into(),
            kv,
            client,
        }
    }

    /// Bring the bucket in line with `spec` and store `spec` as the new baseline
    pub async fn reconcile(&self, spec: &SensorSpec) -> EventBusResult<Reconciliation> {
        info!(sensor = %self.sensor_name, "Comparing stored sensor spec with the current one");

        let mut result = Reconciliation::default();

        let current_deps: HashMap<&str, &Dependency> = spec
            .dependencies
            .iter()
            .map(|d| (d.name.as_str(), d))
            .collect();
        let stored_deps: BTreeMap<String, String> =
            get_json(self.kv.as_ref(), DEPENDENCY_DEFS_KEY).await?.unwrap_or_default();
        for (name, stored_hash) in &stored_deps {
            let Some(dep) = current_deps.get(name.as_str()) else {
                result.removed_dependencies.push(name.clone());
                continue;
            };
            if dependency_hash(dep)? != *stored_hash {
                result.changed_dependencies.push(name.clone());
            }
        }

        let stored_triggers: Vec<String> =
            get_json(self.kv.as_ref(), TRIGGERS_KEY).await?.unwrap_or_default();
        for name in stored_triggers {
            match spec.trigger(&name) {
                None => result.removed_triggers.push(name),
                Some(trigger) => {
                    let stored = self.trigger_expression(&name).await?;
                    if stored.as_deref() == Some(spec.trigger_expression(trigger).as_str()) {
                        result.valid_triggers.push(name);
                    } else {
                        result.changed_triggers.push(name);
                    }
                }
            }
        }

        info!(
            sensor = %self.sensor_name,
            changed_dependencies = ?result.changed_dependencies,
            removed_dependencies = ?result.removed_dependencies,
            changed_triggers = ?result.changed_triggers,
            removed_triggers = ?result.removed_triggers,
            "Reconciling sensor state"
        );

        for trigger in &result.valid_triggers {
            for dep in result
                .changed_dependencies
                .iter()
                .chain(&result.removed_dependencies)
            {
                self.purge_dependency(trigger, dep).await?;
            }
        }
        for trigger in result.changed_triggers.iter().chain(&result.removed_triggers) {
            self.purge_all_dependencies(trigger).await?;
        }

        self.save_spec(spec, &result.removed_triggers).await?;
        Ok(result)
    }

    async fn trigger_expression(&self, trigger_name: &str) -> EventBusResult<Option<String>> {
        let key = trigger_expression_key(trigger_name);
        let value = self.kv.get(&key).await.map_err(|e| kv_error(&key, e))?;
        Ok(value.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    async fn save_spec(&self, spec: &SensorSpec, removed_triggers: &[String]) -> EventBusResult<()> {
        for trigger in removed_triggers {
            let key = trigger_expression_key(trigger);
            self.kv.delete(&key).await.map_err(|e| kv_error(&key, e))?;
            debug!(key = %key, "Removed trigger expression");
        }

        let mut hashes = BTreeMap::new();
        for dep in &spec.dependencies {
            hashes.insert(dep.name.clone(), dependency_hash(dep)?);
        }
        put_json(self.kv.as_ref(), DEPENDENCY_DEFS_KEY, &hashes).await?;

        let triggers: Vec<&str> = spec.triggers.iter().map(|t| t.name.as_str()).collect();
        put_json(self.kv.as_ref(), TRIGGERS_KEY, &triggers).await?;

        for trigger in &spec.triggers {
            let key = trigger_expression_key(&trigger.name);
            let expression = spec.trigger_expression(trigger);
            self.kv
                .put(&key, expression.into_bytes())
                .await
                .map_err(|e| kv_error(&key, e))?;
        }
        Ok(())
    }

    /// Remove a held event and the durable consumer feeding it
    pub async fn purge_dependency(&self, trigger_name: &str, dependency_name: &str) -> EventBusResult<()> {
        let key = dependency_key(trigger_name, dependency_name);
        let durable = identity::durable_name(&self.sensor_name, trigger_name, dependency_name);
        debug!(key = %key, durable = %durable, "Purging dependency");

        self.kv.delete(&key).await.map_err(|e| kv_error(&key, e))?;

        // The consumer may never have been created
        match self.client.delete_consumer(DEFAULT_STREAM_NAME, &durable).await {
            Ok(()) => info!(durable = %durable, "Deleted durable consumer"),
            Err(e) => debug!(durable = %durable, error = %e, "Durable consumer not deleted"),
        }
        Ok(())
    }

    /// Purge every dependency named by the trigger's stored expression
    pub async fn purge_all_dependencies(&self, trigger_name: &str) -> EventBusResult<()> {
        let Some(stored) = self.trigger_expression(trigger_name).await? else {
            return Ok(());
        };
        let expression = match DependencyExpression::parse(&stored) {
            Ok(expression) => expression,
            Err(e) => {
                warn!(trigger = trigger_name, error = %e, "Stored trigger expression does not parse");
                return Ok(());
            }
        };
        for dep in expression.variables() {
            self.purge_dependency(trigger_name, dep).await?;
        }
        Ok(())
    }
}

/// Persisted copy of one trigger's condition window
pub struct WindowStore {
    trigger_name: String,
    kv: Arc<dyn KeyValue>,
    persisted: HashSet<String>,
}

impl WindowStore {
    pub fn new(trigger_name: impl Into<String>, kv: Arc<dyn KeyValue>) -> Self {
        Self {
            trigger_name: trigger_name.into(),
            kv,
            persisted: HashSet::new(),
        }
    }

    pub async fn load(&self, dependency_name: &str) -> EventBusResult<Option<MsgInfo>> {
        let key = dependency_key(&self.trigger_name, dependency_name);
        get_json(self.kv.as_ref(), &key).await
    }

    pub async fn save(&mut self, dependency_name: &str, info: &MsgInfo) -> EventBusResult<()> {
        let key = dependency_key(&self.trigger_name, dependency_name);
        put_json(self.kv.as_ref(), &key, info).await?;
        self.persisted.insert(dependency_name.to_string());
        Ok(())
    }

    pub async fn delete(&mut self, dependency_name: &str) -> EventBusResult<()> {
        let key = dependency_key(&self.trigger_name, dependency_name);
        self.kv.delete(&key).await.map_err(|e| kv_error(&key, e))?;
        self.persisted.remove(dependency_name);
        Ok(())
    }

    /// Delete the held events of all `dependencies`
    pub async fn clear_all<'a, I>(&mut self, dependencies: I) -> EventBusResult<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        for dep in dependencies {
            self.delete(dep).await?;
        }
        Ok(())
    }

    /// Load persisted entries into `engine`
    ///
    /// Entries timestamped before the engine's last reset time are deleted
    /// instead. Returns the number of entries restored.
    pub async fn restore<'a, I>(&mut self, engine: &mut ConditionEngine, dependencies: I) -> EventBusResult<usize>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let now = Utc::now();
        let mut restored = 0;
        for dep in dependencies {
            let Some(info) = self.load(dep).await? else {
                continue;
            };
            if engine.restore(dep, info.into_entry(now)) {
                self.persisted.insert(dep.to_string());
                restored += 1;
            } else {
                debug!(trigger = %self.trigger_name, dependency = dep, "Clearing held event older than the last reset");
                self.delete(dep).await?;
            }
        }
        Ok(restored)
    }

    /// Delete persisted entries that have left the engine's window
    pub async fn sync(&mut self, engine: &ConditionEngine) -> EventBusResult<()> {
        let gone: Vec<String> = self
            .persisted
            .iter()
            .filter(|dep| !engine.window().is_fired(dep))
            .cloned()
            .collect();
        for dep in gone {
            self.delete(&dep).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Auth;
    use crate::memory::MemoryBroker;
    use crate::transport::{ConnectOptions, Connector, StreamConfig, SubscribeOptions};
    use ae_config::TriggerSpec;

    fn spec(deps: &[(&str, &str, &str)], triggers: &[(&str, Option<&str>)]) -> SensorSpec {
        SensorSpec {
            name: "sensor".to_string(),
            dependencies: deps
                .iter()
                .map(|(n, s, e)| Dependency::new(*n, *s, *e))
                .collect(),
            triggers: triggers
                .iter()
                .map(|(name, conditions)| TriggerSpec {
                    name: name.to_string(),
                    conditions: conditions.map(str::to_string),
                    conditions_reset: vec![],
                })
                .collect(),
        }
    }

    async fn setup(broker: &MemoryBroker) -> (SensorState, Arc<dyn KeyValue>) {
        let client = broker
            .connect(
                "mem://",
                ConnectOptions {
                    client_id: "mgmt".to_string(),
                    cluster_id: None,
                    auth: Auth::none(),
                },
            )
            .await
            .unwrap();
        client
            .ensure_stream(&StreamConfig {
                name: DEFAULT_STREAM_NAME.to_string(),
                subjects: vec!["default.*.*".to_string()],
                settings: Default::default(),
            })
            .await
            .unwrap();
        let kv = client.key_value("sensor").await.unwrap();
        (SensorState::new("sensor", Arc::clone(&kv), client), kv)
    }

    fn held(id: &str) -> Vec<u8> {
        serde_json::to_vec(&MsgInfo {
            stream_seq: 1,
            timestamp: Utc::now(),
            event: Event::new("s", "e", "t", serde_json::Value::Null).with_id(id),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_first_run_saves_spec() {
        let broker = MemoryBroker::new();
        let (state, kv) = setup(&broker).await;
        let spec = spec(&[("a", "s", "a"), ("b", "s", "b")], &[("t1", Some("a && b"))]);

        let result = state.reconcile(&spec).await.unwrap();
        assert_eq!(result, Reconciliation::default());

        let triggers: Vec<String> =
            serde_json::from_slice(&kv.get("Triggers").await.unwrap().unwrap()).unwrap();
        assert_eq!(triggers, vec!["t1"]);
        assert_eq!(
            kv.get("t1/Expression").await.unwrap(),
            Some(b"a && b".to_vec())
        );
        let hashes: BTreeMap<String, String> =
            serde_json::from_slice(&kv.get("Deps").await.unwrap().unwrap()).unwrap();
        assert_eq!(hashes.len(), 2);
    }

    #[tokio::test]
    async fn test_changed_dependency_purged_for_valid_trigger() {
        let broker = MemoryBroker::new();
        let (state, kv) = setup(&broker).await;
        let before = spec(&[("a", "s", "a"), ("b", "s", "b")], &[("t1", Some("a && b"))]);
        state.reconcile(&before).await.unwrap();

        kv.put("t1/a", held("1")).await.unwrap();
        kv.put("t1/b", held("2")).await.unwrap();

        let after = spec(&[("a", "s", "a"), ("b", "s", "other")], &[("t1", Some("a && b"))]);
        let result = state.reconcile(&after).await.unwrap();

        assert_eq!(result.changed_dependencies, vec!["b"]);
        assert_eq!(result.valid_triggers, vec!["t1"]);
        assert!(kv.get("t1/a").await.unwrap().is_some());
        assert!(kv.get("t1/b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_changed_trigger_purges_all_and_deletes_consumers() {
        let broker = MemoryBroker::new();
        let (state, kv) = setup(&broker).await;
        let before = spec(&[("a", "s", "a"), ("b", "s", "b")], &[("t1", Some("a && b"))]);
        state.reconcile(&before).await.unwrap();

        kv.put("t1/a", held("1")).await.unwrap();
        let durable = identity::durable_name("sensor", "t1", "a");
        let consumer = broker
            .connect(
                "mem://",
                ConnectOptions {
                    client_id: "consumer".to_string(),
                    cluster_id: None,
                    auth: Auth::none(),
                },
            )
            .await
            .unwrap();
        let _sub = consumer
            .subscribe("default.s.a", SubscribeOptions::durable(durable.clone()))
            .await
            .unwrap();
        assert!(broker.has_durable(&durable));

        let after = spec(&[("a", "s", "a"), ("b", "s", "b")], &[("t1", Some("a || b"))]);
        let result = state.reconcile(&after).await.unwrap();

        assert_eq!(result.changed_triggers, vec!["t1"]);
        assert!(kv.get("t1/a").await.unwrap().is_none());
        assert!(!broker.has_durable(&durable));
        assert_eq!(
            kv.get("t1/Expression").await.unwrap(),
            Some(b"a || b".to_vec())
        );
    }

    #[tokio::test]
    async fn test_removed_trigger_forgotten() {
        let broker = MemoryBroker::new();
        let (state, kv) = setup(&broker).await;
        let before = spec(&[("a", "s", "a")], &[("t1", None), ("t2", None)]);
        state.reconcile(&before).await.unwrap();
        kv.put("t2/a", held("1")).await.unwrap();

        let after = spec(&[("a", "s", "a")], &[("t1", None)]);
        let result = state.reconcile(&after).await.unwrap();

        assert_eq!(result.removed_triggers, vec!["t2"]);
        assert!(kv.get("t2/a").await.unwrap().is_none());
        assert!(kv.get("t2/Expression").await.unwrap().is_none());
        assert!(kv.get("t1/Expression").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_window_store_restore_and_sync() {
        let broker = MemoryBroker::new();
        let (_, kv) = setup(&broker).await;
        let reset = Utc::now();

        let old = MsgInfo {
            stream_seq: 1,
            timestamp: reset - chrono::Duration::seconds(10),
            event: Event::new("s", "a", "t", serde_json::Value::Null),
        };
        let fresh = MsgInfo {
            stream_seq: 2,
            timestamp: reset + chrono::Duration::seconds(10),
            event: Event::new("s", "b", "t", serde_json::Value::Null),
        };
        kv.put("t1/a", serde_json::to_vec(&old).unwrap()).await.unwrap();
        kv.put("t1/b", serde_json::to_vec(&fresh).unwrap()).await.unwrap();

        let mut engine = ConditionEngine::new(
            DependencyExpression::parse("a && b && c").unwrap(),
            Some(reset),
        );
        let mut store = WindowStore::new("t1", Arc::clone(&kv));
        let restored = store.restore(&mut engine, ["a", "b", "c"]).await.unwrap();

        assert_eq!(restored, 1);
        assert!(engine.window().is_fired("b"));
        assert!(kv.get("t1/a").await.unwrap().is_none());

        engine.reset(Utc::now());
        store.sync(&engine).await.unwrap();
        assert!(kv.get("t1/b").await.unwrap().is_none());
    }
}
