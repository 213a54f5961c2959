//! Sensor runner
//!
//! Runs every trigger of one sensor against the bus. Each trigger gets its
//! own task that connects, subscribes, and starts over on a new connection
//! (and so a new client ID) whenever the subscription ends with an error.

use crate::backoff::{retry, BackoffPolicy};
use crate::error::{ServerError, ServerResult};
use ae_condition::ResetEngine;
use ae_config::{BusConfig, SensorSpec, TriggerSpec};
use ae_core::Dependency;
use ae_event_bus::{
    sensor_driver, ActionFn, DriverContext, SensorDriver, TriggerHandlers, TriggerStats,
    TriggerStatsSnapshot,
};
use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Action used for triggers nobody registered handlers for
fn log_only_action(sensor: &str, trigger: &str) -> ActionFn {
    let sensor = sensor.to_string();
    let trigger = trigger.to_string();
    Arc::new(move |events| {
        let mut dependencies: Vec<_> = events.keys().cloned().collect();
        dependencies.sort();
        info!(sensor = %sensor, trigger = %trigger, ?dependencies, "Trigger fired");
        async { Ok(()) }.boxed()
    })
}

pub struct SensorRunner {
    sensor: SensorSpec,
    bus: BusConfig,
    context: DriverContext,
    handlers: HashMap<String, TriggerHandlers>,
    initialize_backoff: BackoffPolicy,
    reconnect_backoff: BackoffPolicy,
    stats: Arc<DashMap<String, Arc<TriggerStats>>>,
}

impl std::fmt::Debug for SensorRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorRunner")
            .field("sensor", &self.sensor.name)
            .field("triggers", &self.sensor.triggers.len())
            .finish_non_exhaustive()
    }
}

impl SensorRunner {
    pub fn new(sensor: SensorSpec, bus: BusConfig, context: DriverContext) -> ServerResult<Self> {
        sensor.validate()?;
        bus.bus_type()?;
        Ok(Self {
            sensor,
            bus,
            context,
            handlers: HashMap::new(),
            initialize_backoff: BackoffPolicy::default(),
            reconnect_backoff: BackoffPolicy::forever(),
            stats: Arc::new(DashMap::new()),
        })
    }

    /// Hooks for one trigger; triggers without hooks only log when they fire
    pub fn with_handlers(mut self, trigger: impl Into<String>, handlers: TriggerHandlers) -> Self {
        self.set_handlers(trigger, handlers);
        self
    }

    pub fn set_handlers(&mut self, trigger: impl Into<String>, handlers: TriggerHandlers) {
        self.handlers.insert(trigger.into(), handlers);
    }

    pub fn with_action(self, trigger: impl Into<String>, action: ActionFn) -> Self {
        self.with_handlers(trigger, TriggerHandlers::new(action))
    }

    pub fn with_backoff(mut self, initialize: BackoffPolicy, reconnect: BackoffPolicy) -> Self {
        self.initialize_backoff = initialize;
        self.reconnect_backoff = reconnect;
        self
    }

    pub fn name(&self) -> &str {
        &self.sensor.name
    }

    /// Counters of the current connection of `trigger`
    pub fn stats(&self, trigger: &str) -> Option<TriggerStatsSnapshot> {
        self.stats.get(trigger).map(|s| s.snapshot())
    }

    /// Run all triggers until `shutdown` is cancelled
    ///
    /// Fails only when the sensor cannot be initialized within the
    /// initialize backoff; trigger connections retry until shutdown.
    pub async fn run(&self, shutdown: CancellationToken) -> ServerResult<()> {
        info!(sensor = %self.sensor.name, "Starting sensor");
        let driver: Arc<dyn SensorDriver> = Arc::from(sensor_driver(
            &self.bus,
            self.sensor.clone(),
            self.context.clone(),
        )?);

        let initialized = retry(&self.initialize_backoff, "initialize sensor", &shutdown, || async {
            driver.initialize().await.map_err(ServerError::from)
        })
        .await;
        match initialized {
            Err(ServerError::Cancelled) => return Ok(()),
            other => other?,
        }

        let mut tasks = JoinSet::new();
        for trigger in &self.sensor.triggers {
            let handlers = self
                .handlers
                .get(&trigger.name)
                .cloned()
                .unwrap_or_else(|| TriggerHandlers::new(log_only_action(&self.sensor.name, &trigger.name)));
            let worker = TriggerWorker {
                sensor: self.sensor.name.clone(),
                expression: self.sensor.trigger_expression(trigger),
                trigger: trigger.clone(),
                dependencies: self.sensor.dependencies.clone(),
                handlers,
                driver: Arc::clone(&driver),
                backoff: self.reconnect_backoff,
                stats: Arc::clone(&self.stats),
            };
            tasks.spawn(worker.run(shutdown.clone()));
        }
        if tasks.is_empty() {
            warn!(sensor = %self.sensor.name, "Sensor has no triggers");
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(sensor = %self.sensor.name, error = %e, "Trigger task panicked");
            }
        }
        info!(sensor = %self.sensor.name, "Sensor stopped");
        Ok(())
    }
}

struct TriggerWorker {
    sensor: String,
    trigger: TriggerSpec,
    expression: String,
    dependencies: Vec<Dependency>,
    handlers: TriggerHandlers,
    driver: Arc<dyn SensorDriver>,
    backoff: BackoffPolicy,
    stats: Arc<DashMap<String, Arc<TriggerStats>>>,
}

impl TriggerWorker {
    async fn run(self, shutdown: CancellationToken) {
        let mut failures = 0;
        while !shutdown.is_cancelled() {
            match self.session(&shutdown, &mut failures).await {
                Ok(()) => break,
                Err(e) => {
                    failures += 1;
                    error!(
                        sensor = %self.sensor,
                        trigger = %self.trigger.name,
                        attempt = failures,
                        error = %e,
                        "Trigger subscription failed"
                    );
                    if !self.backoff.allows(failures) {
                        error!(sensor = %self.sensor, trigger = %self.trigger.name, "Giving up on trigger");
                        return;
                    }
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.backoff.next(failures - 1)) => {}
                    }
                }
            }
        }
        info!(sensor = %self.sensor, trigger = %self.trigger.name, "Trigger stopped");
    }

    /// One connection's lifetime; `Ok` means shutdown
    async fn session(&self, shutdown: &CancellationToken, failures: &mut u32) -> ServerResult<()> {
        let conn = self
            .driver
            .connect(&self.trigger.name, &self.expression, &self.dependencies)
            .await?;
        // A live connection starts the backoff over
        *failures = 0;
        self.stats.insert(self.trigger.name.clone(), conn.stats());

        let resets = ResetEngine::new(&self.trigger.conditions_reset);
        let last_reset_time = resets.last_reset_time(Utc::now());
        let resets = resets.spawn(shutdown.child_token());

        info!(
            sensor = %self.sensor,
            trigger = %self.trigger.name,
            client_id = %conn.client_id(),
            expression = %self.expression,
            "Subscribing trigger"
        );
        conn.subscribe(shutdown.clone(), resets, last_reset_time, self.handlers.clone())
            .await?;
        Ok(())
    }
}
