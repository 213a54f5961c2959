//! Server assembly
//!
//! Wires configuration, auth, drivers and electors into one process that
//! runs every configured sensor and event source.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::sensor::SensorRunner;
use crate::source::EventSourceRunner;
use crate::supervisor::{build_elector, run_elected, Workload};
use ae_config::AuthStrategy;
use ae_core::Event;
use ae_event_bus::{AuthResolver, Connector, DriverContext, TriggerHandlers};
use ae_leader_election::{ElectorKind, MemoryLeaseStore};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Routes events to the runner of the event source that produced them
#[derive(Debug, Clone, Default)]
pub struct Publisher {
    senders: HashMap<String, mpsc::Sender<Event>>,
}

impl Publisher {
    /// Queue `event` for the event source named by `event.source`
    pub async fn publish(&self, event: Event) -> ServerResult<()> {
        let sender = self
            .senders
            .get(&event.source)
            .ok_or_else(|| ServerError::UnknownEventSource(event.source.clone()))?;
        let source = event.source.clone();
        sender
            .send(event)
            .await
            .map_err(|_| ServerError::EventSourceStopped(source))
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.senders.keys().map(String::as_str)
    }
}

pub struct Server {
    config: ServerConfig,
    context: DriverContext,
    kind: ElectorKind,
    leases: MemoryLeaseStore,
    sensors: Vec<SensorRunner>,
    sources: Vec<EventSourceRunner>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("kind", &self.kind)
            .field("sensors", &self.sensors)
            .field("sources", &self.sources)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Validate `config`, resolve the bus credential and build the runners
    pub fn new(
        config: ServerConfig,
        connector: Arc<dyn Connector>,
        kind: ElectorKind,
    ) -> ServerResult<Self> {
        config.validate()?;
        let auth = AuthResolver::load(config.event_bus.auth_strategy()?, &config.auth_mount_path)?;
        let context = DriverContext::new(connector, auth);
        let hostname = config.hostname();

        let sensors = config
            .sensors
            .iter()
            .map(|sensor| SensorRunner::new(sensor.clone(), config.event_bus.clone(), context.clone()))
            .collect::<ServerResult<Vec<_>>>()?;
        let sources = config
            .event_sources
            .iter()
            .map(|spec| {
                EventSourceRunner::new(
                    spec.clone(),
                    config.event_bus.clone(),
                    context.clone(),
                    hostname.clone(),
                )
            })
            .collect::<ServerResult<Vec<_>>>()?;

        Ok(Self {
            config,
            context,
            kind,
            leases: MemoryLeaseStore::new(),
            sensors,
            sources,
        })
    }

    /// Use a shared lease store instead of a private one
    ///
    /// Lease election only excludes servers holding the same store; by
    /// default each server has its own and leads every workload.
    pub fn with_leases(mut self, leases: MemoryLeaseStore) -> Self {
        self.leases = leases;
        self
    }

    /// Attach hooks to one trigger of one sensor
    pub fn with_trigger_handlers(
        mut self,
        sensor: &str,
        trigger: &str,
        handlers: TriggerHandlers,
    ) -> ServerResult<Self> {
        let runner = self
            .sensors
            .iter_mut()
            .find(|r| r.name() == sensor)
            .ok_or_else(|| ae_config::ConfigError::ValidationFailed {
                message: format!("no sensor named '{}'", sensor),
            })?;
        runner.set_handlers(trigger, handlers);
        Ok(self)
    }

    pub fn publisher(&self) -> Publisher {
        Publisher {
            senders: self
                .sources
                .iter()
                .map(|s| (s.name().to_string(), s.sender()))
                .collect(),
        }
    }

    /// Run every workload until `shutdown` is cancelled
    ///
    /// The first workload to fail cancels the others; its error is returned.
    pub async fn run(self, shutdown: CancellationToken) -> ServerResult<()> {
        let _watcher = match self.context.auth.strategy() {
            AuthStrategy::None => None,
            _ => Some(self.context.auth.watch()?),
        };

        let workloads: Vec<Arc<dyn Workload>> = self
            .sensors
            .into_iter()
            .map(|r| Arc::new(r) as Arc<dyn Workload>)
            .chain(
                self.sources
                    .into_iter()
                    .map(|r| Arc::new(r) as Arc<dyn Workload>),
            )
            .collect();

        let stop = shutdown.child_token();
        let mut tasks = JoinSet::new();
        for workload in workloads {
            let cluster = workload.cluster_name();
            let elector = build_elector(self.kind, &cluster, &self.config, &self.context, &self.leases)?;
            tasks.spawn(run_elected(elector, workload, stop.clone()));
        }
        info!(workloads = tasks.len(), elector = ?self.kind, "Server started");

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    error!(error = %e, "Workload task panicked");
                    continue;
                }
            };
            if let Err(e) = result {
                error!(error = %e, "Workload stopped with an error, shutting down");
                stop.cancel();
                first_error.get_or_insert(e);
            }
        }

        info!("Server stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
