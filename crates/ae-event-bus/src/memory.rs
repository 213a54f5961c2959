//! In-process transport
//!
//! [`MemoryBroker`] implements the transport interface inside the process:
//! an append-only message log, live subscriptions with queue groups,
//! durable consumers that resume from their last unacknowledged message,
//! streams, and key-value buckets. It also enforces a configurable
//! credential and unique client IDs the way a real bus does, and can be
//! taken offline to exercise disconnect handling.

use crate::transport::{
    Acker, ConnectOptions, ConnectionState, Connector, DeliverPolicy, KeyValue, StreamConfig,
    SubscribeOptions, Subscription, SubscriptionId, TransportClient, TransportError,
    TransportMessage, TransportResult,
};
use ae_core::subject::subject_matches;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, trace, warn};

/// Credential the broker requires from connecting clients
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum BrokerAuth {
    #[default]
    Open,
    Token(String),
    Basic { username: String, password: String },
}

#[derive(Debug, Clone)]
struct StoredMessage {
    subject: String,
    payload: Vec<u8>,
    sequence: u64,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MessageLog {
    messages: Vec<StoredMessage>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl MessageLog {
    fn last_sequence(&self) -> u64 {
        self.messages.last().map(|m| m.sequence).unwrap_or(0)
    }

    fn append(&mut self, subject: &str, payload: Vec<u8>) -> StoredMessage {
        let now = Utc::now();
        // Timestamps stay strictly increasing so redeliveries are recognizable
        let timestamp = match self.last_timestamp {
            Some(last) if now <= last => last + Duration::nanoseconds(1),
            _ => now,
        };
        self.last_timestamp = Some(timestamp);

        let message = StoredMessage {
            subject: subject.to_string(),
            payload,
            sequence: self.last_sequence() + 1,
            timestamp,
        };
        self.messages.push(message.clone());
        message
    }
}

struct LiveSubscription {
    client_id: String,
    filter: String,
    queue_group: Option<String>,
    durable: Option<String>,
    manual_ack: bool,
    tx: mpsc::UnboundedSender<TransportMessage>,
}

#[derive(Debug)]
struct DurableState {
    filter: String,
    start_sequence: u64,
    acked: HashSet<u64>,
}

struct ClientEntry {
    state: Arc<watch::Sender<ConnectionState>>,
    has_session: bool,
}

struct BrokerInner {
    online: AtomicBool,
    auth: RwLock<BrokerAuth>,
    clients: DashMap<String, ClientEntry>,
    log: Mutex<MessageLog>,
    subscriptions: DashMap<u64, LiveSubscription>,
    durables: DashMap<String, DurableState>,
    round_robin: DashMap<String, AtomicUsize>,
    streams: DashMap<String, StreamConfig>,
    buckets: DashMap<String, Arc<MemoryKeyValue>>,
    next_subscription_id: AtomicU64,
}

impl BrokerInner {
    fn required_auth(&self) -> BrokerAuth {
        match self.auth.read() {
            Ok(auth) => auth.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn to_transport(
        self: &Arc<Self>,
        message: &StoredMessage,
        durable: Option<&str>,
        manual_ack: bool,
    ) -> TransportMessage {
        let delivered = TransportMessage::new(
            message.subject.clone(),
            message.payload.clone(),
            message.sequence,
            message.timestamp,
        );
        match durable {
            Some(name) if manual_ack => delivered.with_acker(Arc::new(DurableAcker {
                broker: Arc::downgrade(self),
                durable: name.to_string(),
            })),
            _ => delivered,
        }
    }

    fn dispatch(self: &Arc<Self>, message: &StoredMessage) {
        let mut groups: BTreeMap<String, Vec<u64>> = BTreeMap::new();
        let mut direct = Vec::new();

        for entry in self.subscriptions.iter() {
            let sub = entry.value();
            if !subject_matches(&sub.filter, &message.subject) {
                continue;
            }
            match &sub.queue_group {
                Some(group) => groups
                    .entry(format!("{}|{}", sub.filter, group))
                    .or_default()
                    .push(*entry.key()),
                None => direct.push(*entry.key()),
            }
        }

        for (key, mut members) in groups {
            members.sort_unstable();
            let counter = self
                .round_robin
                .entry(key)
                .or_insert_with(|| AtomicUsize::new(0));
            let pick = counter.fetch_add(1, Ordering::Relaxed) % members.len();
            direct.push(members[pick]);
        }

        for id in direct {
            if let Some(sub) = self.subscriptions.get(&id) {
                let delivered = self.to_transport(message, sub.durable.as_deref(), sub.manual_ack);
                if sub.tx.send(delivered).is_err() {
                    trace!(subscription = id, "Subscriber gone, message not delivered");
                }
            }
        }
    }

    async fn publish(self: &Arc<Self>, subject: &str, payload: Vec<u8>) -> TransportResult<()> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        let mut log = self.log.lock().await;
        let message = log.append(subject, payload);
        trace!(subject, sequence = message.sequence, "Message appended");
        self.dispatch(&message);
        Ok(())
    }

    async fn subscribe(
        self: &Arc<Self>,
        client_id: &str,
        subject: &str,
        options: SubscribeOptions,
    ) -> TransportResult<Subscription> {
        let log = self.log.lock().await;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_subscription_id.fetch_add(1, Ordering::SeqCst);

        let backlog: Vec<&StoredMessage> = match &options.durable {
            Some(durable) => {
                let state = self
                    .durables
                    .entry(durable.clone())
                    .or_insert_with(|| DurableState {
                        filter: subject.to_string(),
                        start_sequence: match options.deliver {
                            DeliverPolicy::All => 0,
                            DeliverPolicy::New => log.last_sequence(),
                        },
                        acked: HashSet::new(),
                    });
                log.messages
                    .iter()
                    .filter(|m| {
                        m.sequence > state.start_sequence
                            && !state.acked.contains(&m.sequence)
                            && subject_matches(&state.filter, &m.subject)
                    })
                    .collect()
            }
            None => match options.deliver {
                DeliverPolicy::All => log
                    .messages
                    .iter()
                    .filter(|m| subject_matches(subject, &m.subject))
                    .collect(),
                DeliverPolicy::New => Vec::new(),
            },
        };

        if !backlog.is_empty() {
            debug!(subject, count = backlog.len(), "Delivering backlog to new subscription");
        }
        for message in backlog {
            let _ = tx.send(self.to_transport(message, options.durable.as_deref(), options.manual_ack));
        }

        self.subscriptions.insert(
            id,
            LiveSubscription {
                client_id: client_id.to_string(),
                filter: subject.to_string(),
                queue_group: options.queue_group.clone(),
                durable: options.durable.clone(),
                manual_ack: options.manual_ack,
                tx,
            },
        );
        drop(log);

        Ok(Subscription::new(SubscriptionId(id), subject, rx))
    }
}

struct DurableAcker {
    broker: Weak<BrokerInner>,
    durable: String,
}

impl Acker for DurableAcker {
    fn ack(&self, sequence: u64) {
        if let Some(broker) = self.broker.upgrade() {
            if let Some(mut state) = broker.durables.get_mut(&self.durable) {
                state.acked.insert(sequence);
            }
        }
    }
}

/// In-process pub/sub broker
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("online", &self.inner.online.load(Ordering::SeqCst))
            .field("clients", &self.inner.clients.len())
            .field("subscriptions", &self.inner.subscriptions.len())
            .finish()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_auth(BrokerAuth::Open)
    }

    /// Broker that rejects clients not presenting `auth`
    pub fn with_auth(auth: BrokerAuth) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                online: AtomicBool::new(true),
                auth: RwLock::new(auth),
                clients: DashMap::new(),
                log: Mutex::new(MessageLog::default()),
                subscriptions: DashMap::new(),
                durables: DashMap::new(),
                round_robin: DashMap::new(),
                streams: DashMap::new(),
                buckets: DashMap::new(),
                next_subscription_id: AtomicU64::new(1),
            }),
        }
    }

    /// Change the credential required from new connections
    pub fn set_auth(&self, auth: BrokerAuth) {
        match self.inner.auth.write() {
            Ok(mut current) => *current = auth,
            Err(poisoned) => *poisoned.into_inner() = auth,
        }
    }

    /// Take the broker offline or bring it back
    ///
    /// Every connected client observes the change through its state watch.
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
        for entry in self.inner.clients.iter() {
            let state = if online {
                ConnectionState {
                    connected: true,
                    session: entry.has_session,
                }
            } else {
                ConnectionState::default()
            };
            entry.state.send_replace(state);
        }
        info!(online, "Memory broker availability changed");
    }

    /// Drop the protocol-level session of one client, leaving its network link up
    pub fn expire_session(&self, client_id: &str) {
        if let Some(entry) = self.inner.clients.get(client_id) {
            entry.state.send_modify(|state| state.session = false);
        }
    }

    pub fn is_registered(&self, client_id: &str) -> bool {
        self.inner.clients.contains_key(client_id)
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    pub fn has_durable(&self, name: &str) -> bool {
        self.inner.durables.contains_key(name)
    }

    pub fn stream(&self, name: &str) -> Option<StreamConfig> {
        self.inner.streams.get(name).map(|s| s.clone())
    }

    pub fn bucket(&self, name: &str) -> Option<Arc<MemoryKeyValue>> {
        self.inner.buckets.get(name).map(|b| Arc::clone(&b))
    }

    /// Number of messages in the log
    pub async fn message_count(&self) -> usize {
        self.inner.log.lock().await.messages.len()
    }

    fn check_auth(&self, options: &ConnectOptions) -> TransportResult<()> {
        match self.inner.required_auth() {
            BrokerAuth::Open => Ok(()),
            BrokerAuth::Token(expected) => match options.auth.token_value() {
                Some(token) if token == expected => Ok(()),
                _ => Err(TransportError::AuthRejected("invalid token".to_string())),
            },
            BrokerAuth::Basic { username, password } => match options.auth.basic_values() {
                Some((u, p)) if u == username && p == password => Ok(()),
                _ => Err(TransportError::AuthRejected(
                    "invalid username or password".to_string(),
                )),
            },
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(
        &self,
        url: &str,
        options: ConnectOptions,
    ) -> TransportResult<Arc<dyn TransportClient>> {
        if !self.inner.online.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable(url.to_string()));
        }
        self.check_auth(&options)?;

        let has_session = options.cluster_id.is_some();
        let (state_tx, _) = watch::channel(ConnectionState {
            connected: true,
            session: has_session,
        });
        let state = Arc::new(state_tx);

        match self.inner.clients.entry(options.client_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                warn!(client_id = %options.client_id, "Client ID already registered");
                return Err(TransportError::ClientIdInUse(options.client_id));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(ClientEntry {
                    state: Arc::clone(&state),
                    has_session,
                });
            }
        }

        debug!(client_id = %options.client_id, url, "Client connected to memory broker");
        Ok(Arc::new(MemoryClient {
            broker: Arc::clone(&self.inner),
            client_id: options.client_id,
            state,
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryClient {
    broker: Arc<BrokerInner>,
    client_id: String,
    state: Arc<watch::Sender<ConnectionState>>,
    closed: AtomicBool,
}

impl MemoryClient {
    fn ensure_usable(&self) -> TransportResult<()> {
        if self.closed.load(Ordering::SeqCst) || !self.state.borrow().connected {
            return Err(TransportError::Disconnected);
        }
        Ok(())
    }
}

#[async_trait]
impl TransportClient for MemoryClient {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> TransportResult<()> {
        self.ensure_usable()?;
        self.broker.publish(subject, payload).await
    }

    async fn subscribe(
        &self,
        subject: &str,
        options: SubscribeOptions,
    ) -> TransportResult<Subscription> {
        self.ensure_usable()?;
        self.broker.subscribe(&self.client_id, subject, options).await
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> TransportResult<()> {
        self.broker.subscriptions.remove(&id.0);
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.broker
            .subscriptions
            .retain(|_, sub| sub.client_id != self.client_id);
        self.broker.clients.remove(&self.client_id);
        self.state.send_replace(ConnectionState::default());
        debug!(client_id = %self.client_id, "Client disconnected from memory broker");
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    async fn ensure_stream(&self, config: &StreamConfig) -> TransportResult<()> {
        self.ensure_usable()?;
        self.broker
            .streams
            .entry(config.name.clone())
            .or_insert_with(|| {
                info!(stream = %config.name, subjects = ?config.subjects, "Created stream");
                config.clone()
            });
        Ok(())
    }

    async fn delete_consumer(&self, stream: &str, durable: &str) -> TransportResult<()> {
        self.ensure_usable()?;
        if !self.broker.streams.contains_key(stream) {
            return Err(TransportError::NoSuchStream(stream.to_string()));
        }
        if self.broker.durables.remove(durable).is_none() {
            return Err(TransportError::NoSuchConsumer(durable.to_string()));
        }
        self.broker
            .subscriptions
            .retain(|_, sub| sub.durable.as_deref() != Some(durable));
        debug!(stream, durable, "Deleted consumer");
        Ok(())
    }

    async fn key_value(&self, bucket: &str) -> TransportResult<Arc<dyn KeyValue>> {
        self.ensure_usable()?;
        let kv: Arc<dyn KeyValue> = self
            .broker
            .buckets
            .entry(bucket.to_string())
            .or_insert_with(|| Arc::new(MemoryKeyValue::default()))
            .clone();
        Ok(kv)
    }
}

/// In-process key-value bucket
#[derive(Debug, Default)]
pub struct MemoryKeyValue {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryKeyValue {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

#[async_trait]
impl KeyValue for MemoryKeyValue {
    async fn get(&self, key: &str) -> TransportResult<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|v| v.clone()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> TransportResult<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> TransportResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn keys(&self) -> TransportResult<Vec<String>> {
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        Ok(keys)
    }
}
