//! Transport collaborator interface
//!
//! The drivers in this crate do not speak a wire protocol themselves. They
//! drive a pub/sub transport through [`Connector`] and [`TransportClient`]:
//! connect, publish, subscribe (optionally as a queue group member or a
//! durable consumer), plus the stream, consumer and key-value primitives the
//! stream/consumer variant needs. [`MemoryBroker`](crate::MemoryBroker) is the
//! in-process implementation.

use crate::auth::Auth;
use ae_config::StreamSettings;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// Errors raised by a transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport unreachable: {0}")]
    Unreachable(String),

    #[error("authorization rejected: {0}")]
    AuthRejected(String),

    #[error("client ID '{0}' is already registered")]
    ClientIdInUse(String),

    #[error("not connected")]
    Disconnected,

    #[error("stream '{0}' does not exist")]
    NoSuchStream(String),

    #[error("consumer '{0}' does not exist")]
    NoSuchConsumer(String),

    #[error("operation not supported by this transport: {0}")]
    Unsupported(&'static str),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Liveness reported by a transport connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionState {
    /// The underlying network connection is up
    pub connected: bool,
    /// The protocol-level session (e.g. a streaming cluster session) is up
    pub session: bool,
}

impl ConnectionState {
    pub fn up() -> Self {
        Self {
            connected: true,
            session: true,
        }
    }
}

/// Options for opening a transport connection
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Client identity, unique among live connections
    pub client_id: String,
    /// Cluster to open a streaming session against, if any
    pub cluster_id: Option<String>,
    pub auth: Auth,
}

/// Where a new consumer starts reading
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliverPolicy {
    /// Every retained message
    All,
    /// Only messages published after the consumer was created
    #[default]
    New,
}

/// Options for a subscription
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Messages are shared round-robin among members of the same group
    pub queue_group: Option<String>,
    /// Durable consumer name; delivery position survives reconnects
    pub durable: Option<String>,
    /// Messages must be acknowledged explicitly
    pub manual_ack: bool,
    pub deliver: DeliverPolicy,
}

impl SubscribeOptions {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            durable: Some(name.into()),
            manual_ack: true,
            ..Default::default()
        }
    }

    pub fn with_queue_group(mut self, group: impl Into<String>) -> Self {
        self.queue_group = Some(group.into());
        self
    }
}

/// Acknowledges a delivered message
pub trait Acker: Send + Sync {
    fn ack(&self, sequence: u64);
}

/// A message delivered by a subscription
#[derive(Clone)]
pub struct TransportMessage {
    pub subject: String,
    pub payload: Vec<u8>,
    /// Position of the message in the transport's log
    pub sequence: u64,
    /// When the transport accepted the message
    pub timestamp: DateTime<Utc>,
    acker: Option<Arc<dyn Acker>>,
}

impl fmt::Debug for TransportMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportMessage")
            .field("subject", &self.subject)
            .field("sequence", &self.sequence)
            .field("timestamp", &self.timestamp)
            .field("len", &self.payload.len())
            .finish()
    }
}

impl TransportMessage {
    pub fn new(
        subject: impl Into<String>,
        payload: Vec<u8>,
        sequence: u64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            subject: subject.into(),
            payload,
            sequence,
            timestamp,
            acker: None,
        }
    }

    pub fn with_acker(mut self, acker: Arc<dyn Acker>) -> Self {
        self.acker = Some(acker);
        self
    }

    /// Acknowledge the message; a no-op for subscriptions without manual ack
    pub fn ack(&self) {
        if let Some(acker) = &self.acker {
            acker.ack(self.sequence);
        }
    }
}

/// Identifier of a live subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// A live subscription
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub subject: String,
    receiver: mpsc::UnboundedReceiver<TransportMessage>,
}

impl Subscription {
    pub fn new(
        id: SubscriptionId,
        subject: impl Into<String>,
        receiver: mpsc::UnboundedReceiver<TransportMessage>,
    ) -> Self {
        Self {
            id,
            subject: subject.into(),
            receiver,
        }
    }

    /// Next message, or None once the subscription has been closed
    pub async fn next(&mut self) -> Option<TransportMessage> {
        self.receiver.recv().await
    }
}

/// Stream to provision on the stream/consumer variant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub name: String,
    pub subjects: Vec<String>,
    pub settings: StreamSettings,
}

/// Key-value side store used for trigger bookkeeping
#[async_trait]
pub trait KeyValue: Send + Sync {
    async fn get(&self, key: &str) -> TransportResult<Option<Vec<u8>>>;
    async fn put(&self, key: &str, value: Vec<u8>) -> TransportResult<()>;
    /// Deleting a missing key is not an error
    async fn delete(&self, key: &str) -> TransportResult<()>;
    async fn keys(&self) -> TransportResult<Vec<String>>;
}

/// An open transport connection
#[async_trait]
pub trait TransportClient: Send + Sync {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> TransportResult<()>;

    async fn subscribe(
        &self,
        subject: &str,
        options: SubscribeOptions,
    ) -> TransportResult<Subscription>;

    async fn unsubscribe(&self, id: SubscriptionId) -> TransportResult<()>;

    /// Close the connection; closing twice is harmless
    async fn close(&self);

    /// Connection liveness, updated by the transport as it changes
    fn state(&self) -> watch::Receiver<ConnectionState>;

    /// Create the stream if it does not exist yet
    async fn ensure_stream(&self, _config: &StreamConfig) -> TransportResult<()> {
        Err(TransportError::Unsupported("streams"))
    }

    async fn delete_consumer(&self, _stream: &str, _durable: &str) -> TransportResult<()> {
        Err(TransportError::Unsupported("consumers"))
    }

    /// Open (creating if needed) a key-value bucket
    async fn key_value(&self, _bucket: &str) -> TransportResult<Arc<dyn KeyValue>> {
        Err(TransportError::Unsupported("key-value"))
    }
}

/// Opens transport connections
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        options: ConnectOptions,
    ) -> TransportResult<Arc<dyn TransportClient>>;
}
