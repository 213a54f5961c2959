//! Sensor and event source specifications

use crate::error::{ConfigError, ConfigResult};
use ae_core::Dependency;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Time-based reset: a cron schedule with an optional IANA timezone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionsResetByTime {
    /// Cron expression (5-field or 6-field with seconds)
    pub cron: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

/// One rule that clears a trigger's condition window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionsResetCriteria {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by_time: Option<ConditionsResetByTime>,
}

/// A trigger fired when its dependency expression is satisfied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerSpec {
    pub name: String,

    /// Dependency expression, e.g. `(dep-a || dep-b) && dep-c`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions_reset: Vec<ConditionsResetCriteria>,
}

/// A sensor: dependencies plus the triggers that consume them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorSpec {
    pub name: String,
    pub dependencies: Vec<Dependency>,
    pub triggers: Vec<TriggerSpec>,
}

impl SensorSpec {
    /// Check names are present and unique
    pub fn validate(&self) -> ConfigResult<()> {
        if self.name.is_empty() {
            return Err(ConfigError::ValidationFailed {
                message: "sensor name must be set".to_string(),
            });
        }
        if self.dependencies.is_empty() {
            return Err(ConfigError::ValidationFailed {
                message: format!("sensor '{}' has no dependencies", self.name),
            });
        }

        let mut seen = HashSet::new();
        for dep in &self.dependencies {
            if !seen.insert(dep.name.as_str()) {
                return Err(ConfigError::ValidationFailed {
                    message: format!("duplicate dependency name '{}'", dep.name),
                });
            }
        }

        let mut seen = HashSet::new();
        for trigger in &self.triggers {
            if !seen.insert(trigger.name.as_str()) {
                return Err(ConfigError::ValidationFailed {
                    message: format!("duplicate trigger name '{}'", trigger.name),
                });
            }
        }

        Ok(())
    }

    /// Dependency expression for a trigger
    ///
    /// Without explicit conditions every dependency is required.
    pub fn trigger_expression(&self, trigger: &TriggerSpec) -> String {
        match &trigger.conditions {
            Some(expr) if !expr.trim().is_empty() => expr.clone(),
            _ => self
                .dependencies
                .iter()
                .map(|d| d.name.as_str())
                .collect::<Vec<_>>()
                .join(" && "),
        }
    }

    /// Look up a trigger by name
    pub fn trigger(&self, name: &str) -> Option<&TriggerSpec> {
        self.triggers.iter().find(|t| t.name == name)
    }
}

/// An event source and the event names it publishes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSourceSpec {
    pub name: String,
    #[serde(default)]
    pub events: Vec<String>,
}
