//! Event bus server
//!
//! Runs the sensors and event sources of one configuration file against an
//! in-process bus. Events for the event sources are read from stdin, one
//! JSON object per line: `{"source": "webhook", "subject": "push", "data": {}}`.
//!
//! The bus and the lease store both live inside this process. Separate
//! processes started from the same file do not see each other: each one
//! elects itself and runs every workload. `replicas` only coordinates
//! servers that share one broker and one lease store, which embedders of
//! the library arrange with `Server::with_leases`.

use ae_core::Event;
use ae_event_bus::MemoryBroker;
use ae_leader_election::ElectorKind;
use ae_server::{Publisher, Server, ServerConfig, DEFAULT_CONFIG_PATH, ENV_CONFIG_PATH};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Deserialize)]
struct FeedLine {
    source: String,
    subject: String,
    #[serde(default = "default_event_type", rename = "type")]
    event_type: String,
    #[serde(default)]
    data: serde_json::Value,
}

fn default_event_type() -> String {
    "stdin".to_string()
}

async fn feed_stdin(publisher: Publisher, shutdown: CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => return,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                error!(error = %e, "Failed to read stdin");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let feed: FeedLine = match serde_json::from_str(&line) {
            Ok(feed) => feed,
            Err(e) => {
                warn!(error = %e, "Skipping malformed event line");
                continue;
            }
        };
        let event = Event::new(feed.source, feed.subject, feed.event_type, feed.data);
        if let Err(e) = publisher.publish(event).await {
            warn!(error = %e, "Failed to queue event");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    let path = std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = ServerConfig::load(&path).with_context(|| format!("failed to load {}", path))?;
    let kind = ElectorKind::from_env();
    info!(config = %path, elector = ?kind, "Starting event bus server");

    let broker = MemoryBroker::new();
    let server = Server::new(config, Arc::new(broker), kind)?;
    let shutdown = CancellationToken::new();

    if server.publisher().sources().next().is_some() {
        tokio::spawn(feed_stdin(server.publisher(), shutdown.clone()));
    }

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutting down...");
                signal.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for the shutdown signal"),
        }
    });

    if let Err(e) = server.run(shutdown).await {
        if e.is_fatal() {
            error!(error = %e, "Leadership lost, exiting");
        }
        return Err(e).context("server stopped");
    }
    Ok(())
}
