//! Bus-coordinated elector
//!
//! Replicas of one cluster run a Raft-style election over three bus
//! subjects: the leader broadcasts heartbeats, candidates broadcast vote
//! requests, and each node receives vote responses on a subject of its
//! own. A node that hears no heartbeat within a randomized election timeout
//! becomes a candidate for the next term and leads once a majority of the
//! configured cluster size has voted for it. The current term and the vote
//! cast in it are written to a state file before any vote leaves the node,
//! so a restarted replica never votes twice in one term.

use crate::elector::{Elector, LeaderCallbacks, Leadership};
use crate::error::{ElectionError, ElectionResult};
use ae_event_bus::{
    AuthResolver, BusConnection, ConnectOptions, Connector, SubscribeOptions, Subscription,
    TransportMessage,
};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Role of a node in its cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Follower,
    Candidate,
    Leader,
    /// The election feed is gone; terminal
    Closed,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Follower => write!(f, "FOLLOWER"),
            NodeState::Candidate => write!(f, "CANDIDATE"),
            NodeState::Leader => write!(f, "LEADER"),
            NodeState::Closed => write!(f, "CLOSED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub from: NodeState,
    pub to: NodeState,
}

/// Identity and size of an election cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterInfo {
    pub name: String,
    pub size: usize,
}

impl ClusterInfo {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }

    /// Votes needed to lead
    pub fn majority(&self) -> usize {
        self.size / 2 + 1
    }

    fn heartbeat_subject(&self) -> String {
        format!("election.{}.heartbeat", self.name)
    }

    fn vote_request_subject(&self) -> String {
        format!("election.{}.vote.request", self.name)
    }

    fn vote_response_subject(&self, node_id: &str) -> String {
        format!("election.{}.vote.response.{}", self.name, node_id)
    }
}

/// Heartbeat and election timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectionTiming {
    pub heartbeat_interval: Duration,
    pub min_election_timeout: Duration,
    pub max_election_timeout: Duration,
}

impl Default for ElectionTiming {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(100),
            min_election_timeout: Duration::from_millis(500),
            max_election_timeout: Duration::from_secs(2),
        }
    }
}

impl ElectionTiming {
    pub fn validate(&self) -> ElectionResult<()> {
        if self.min_election_timeout > self.max_election_timeout {
            return Err(ElectionError::InvalidSettings(
                "min election timeout exceeds max election timeout".to_string(),
            ));
        }
        if self.heartbeat_interval >= self.min_election_timeout {
            return Err(ElectionError::InvalidSettings(
                "heartbeat interval must be shorter than the election timeout".to_string(),
            ));
        }
        Ok(())
    }

    fn election_timeout(&self) -> Duration {
        let min = self.min_election_timeout.as_millis() as u64;
        let max = self.max_election_timeout.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

/// Term and vote that must survive a restart
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub term: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voted_for: Option<String>,
}

/// JSON file holding a node's [`PersistedState`]
#[derive(Debug, Clone)]
pub struct StateLog {
    path: PathBuf,
}

impl StateLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the state; a missing file is a fresh node
    pub async fn load(&self) -> ElectionResult<PersistedState> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PersistedState::default()),
            Err(source) => Err(ElectionError::StateFile {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Replace the state file atomically
    pub async fn save(&self, state: &PersistedState) -> ElectionResult<()> {
        let bytes = serde_json::to_vec(state)?;
        let tmp = self.path.with_extension("tmp");
        let io_err = |source| ElectionError::StateFile {
            path: self.path.clone(),
            source,
        };
        tokio::fs::write(&tmp, bytes).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)?;
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Heartbeat {
    term: u64,
    leader: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct VoteRequest {
    term: u64,
    candidate: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct VoteResponse {
    term: u64,
    voter: String,
    granted: bool,
}

enum NodeEvent {
    Changed(StateChange),
    Failed(ElectionError),
}

struct Node {
    id: String,
    cluster: ClusterInfo,
    timing: ElectionTiming,
    conn: BusConnection,
    log: StateLog,
    state: NodeState,
    term: u64,
    voted_for: Option<String>,
    leader: Option<String>,
    votes: HashSet<String>,
    deadline: Instant,
    events: mpsc::UnboundedSender<NodeEvent>,
}

impl Node {
    async fn run(mut self, shutdown: CancellationToken) {
        if let Err(e) = self.election_loop(&shutdown).await {
            error!(node = %self.id, error = %e, "Election node failed");
            let _ = self.events.send(NodeEvent::Failed(e));
        }
        if let Err(e) = self.conn.close().await {
            debug!(node = %self.id, error = %e, "Closing election connection failed");
        }
    }

    async fn subscribe(&self, subject: &str) -> ElectionResult<Subscription> {
        self.conn
            .client()
            .subscribe(subject, SubscribeOptions::default())
            .await
            .map_err(|source| {
                ElectionError::Bus(ae_event_bus::EventBusError::Subscription {
                    subject: subject.to_string(),
                    source,
                })
            })
    }

    async fn election_loop(&mut self, shutdown: &CancellationToken) -> ElectionResult<()> {
        let mut heartbeats = self.subscribe(&self.cluster.heartbeat_subject()).await?;
        let mut requests = self.subscribe(&self.cluster.vote_request_subject()).await?;
        let mut responses = self
            .subscribe(&self.cluster.vote_response_subject(&self.id))
            .await?;

        self.deadline = Instant::now() + self.timing.election_timeout();
        let timer = tokio::time::sleep_until(self.deadline);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = self.conn.wait_closed() => {
                    self.set_state(NodeState::Closed);
                    return Ok(());
                }
                message = heartbeats.next() => match decode::<Heartbeat>(message) {
                    Some(Ok(hb)) => self.on_heartbeat(hb).await?,
                    Some(Err(e)) => warn!(error = %e, "Discarding malformed heartbeat"),
                    None => return self.feed_ended(),
                },
                message = requests.next() => match decode::<VoteRequest>(message) {
                    Some(Ok(req)) => self.on_vote_request(req).await?,
                    Some(Err(e)) => warn!(error = %e, "Discarding malformed vote request"),
                    None => return self.feed_ended(),
                },
                message = responses.next() => match decode::<VoteResponse>(message) {
                    Some(Ok(resp)) => self.on_vote_response(resp).await?,
                    Some(Err(e)) => warn!(error = %e, "Discarding malformed vote response"),
                    None => return self.feed_ended(),
                },
                _ = &mut timer => self.on_timeout().await?,
            }
            timer.as_mut().reset(self.deadline);
        }
    }

    fn feed_ended(&mut self) -> ElectionResult<()> {
        self.set_state(NodeState::Closed);
        Ok(())
    }

    fn set_state(&mut self, to: NodeState) {
        if self.state == to {
            return;
        }
        let change = StateChange {
            from: self.state,
            to,
        };
        self.state = to;
        info!(node = %self.id, term = self.term, from = %change.from, to = %change.to, "Election state changed");
        let _ = self.events.send(NodeEvent::Changed(change));
    }

    async fn persist(&self) -> ElectionResult<()> {
        self.log
            .save(&PersistedState {
                term: self.term,
                voted_for: self.voted_for.clone(),
            })
            .await
    }

    async fn publish<T: Serialize>(&self, subject: &str, message: &T) -> ElectionResult<()> {
        let payload = serde_json::to_vec(message)?;
        if let Err(e) = self.conn.publish(subject, payload).await {
            warn!(node = %self.id, subject, error = %e, "Failed to publish election message");
        }
        Ok(())
    }

    fn restart_election_timer(&mut self) {
        self.deadline = Instant::now() + self.timing.election_timeout();
    }

    /// Adopt a newer term seen from another node
    async fn adopt_term(&mut self, term: u64) -> ElectionResult<()> {
        self.term = term;
        self.voted_for = None;
        self.leader = None;
        self.persist().await?;
        self.set_state(NodeState::Follower);
        Ok(())
    }

    async fn on_timeout(&mut self) -> ElectionResult<()> {
        match self.state {
            NodeState::Leader => {
                self.send_heartbeat().await?;
                self.deadline = Instant::now() + self.timing.heartbeat_interval;
            }
            NodeState::Follower | NodeState::Candidate => self.start_election().await?,
            NodeState::Closed => {}
        }
        Ok(())
    }

    async fn start_election(&mut self) -> ElectionResult<()> {
        self.term += 1;
        self.voted_for = Some(self.id.clone());
        self.leader = None;
        self.persist().await?;

        self.votes.clear();
        self.votes.insert(self.id.clone());
        self.set_state(NodeState::Candidate);
        debug!(node = %self.id, term = self.term, "Requesting votes");

        if self.votes.len() >= self.cluster.majority() {
            return self.become_leader().await;
        }

        let request = VoteRequest {
            term: self.term,
            candidate: self.id.clone(),
        };
        self.publish(&self.cluster.vote_request_subject(), &request).await?;
        self.restart_election_timer();
        Ok(())
    }

    async fn become_leader(&mut self) -> ElectionResult<()> {
        self.leader = Some(self.id.clone());
        self.set_state(NodeState::Leader);
        self.send_heartbeat().await?;
        self.deadline = Instant::now() + self.timing.heartbeat_interval;
        Ok(())
    }

    async fn send_heartbeat(&self) -> ElectionResult<()> {
        let hb = Heartbeat {
            term: self.term,
            leader: self.id.clone(),
        };
        self.publish(&self.cluster.heartbeat_subject(), &hb).await
    }

    async fn on_heartbeat(&mut self, hb: Heartbeat) -> ElectionResult<()> {
        if hb.leader == self.id || hb.term < self.term {
            return Ok(());
        }
        if hb.term > self.term {
            self.adopt_term(hb.term).await?;
        }
        if self.leader.as_deref() != Some(hb.leader.as_str()) {
            debug!(node = %self.id, leader = %hb.leader, term = hb.term, "Following leader");
        }
        self.leader = Some(hb.leader);
        self.set_state(NodeState::Follower);
        self.restart_election_timer();
        Ok(())
    }

    async fn on_vote_request(&mut self, req: VoteRequest) -> ElectionResult<()> {
        if req.candidate == self.id {
            return Ok(());
        }
        if req.term > self.term {
            self.adopt_term(req.term).await?;
        }

        let granted = req.term == self.term
            && self
                .voted_for
                .as_deref()
                .map_or(true, |voted| voted == req.candidate);
        if granted {
            self.voted_for = Some(req.candidate.clone());
            self.persist().await?;
            self.restart_election_timer();
        }
        debug!(node = %self.id, candidate = %req.candidate, term = req.term, granted, "Answered vote request");

        let response = VoteResponse {
            term: self.term,
            voter: self.id.clone(),
            granted,
        };
        self.publish(&self.cluster.vote_response_subject(&req.candidate), &response)
            .await
    }

    async fn on_vote_response(&mut self, resp: VoteResponse) -> ElectionResult<()> {
        if resp.term > self.term {
            self.adopt_term(resp.term).await?;
            self.restart_election_timer();
            return Ok(());
        }
        if self.state != NodeState::Candidate || resp.term != self.term || !resp.granted {
            return Ok(());
        }
        self.votes.insert(resp.voter);
        if self.votes.len() >= self.cluster.majority() {
            self.become_leader().await?;
        }
        Ok(())
    }
}

fn decode<T: for<'de> Deserialize<'de>>(
    message: Option<TransportMessage>,
) -> Option<Result<T, serde_json::Error>> {
    message.map(|m| serde_json::from_slice(&m.payload))
}

/// Elector coordinating replicas over the event bus
pub struct BusElector {
    cluster: ClusterInfo,
    url: String,
    connector: Arc<dyn Connector>,
    auth: AuthResolver,
    timing: ElectionTiming,
    log: StateLog,
    node_id: String,
}

impl BusElector {
    pub fn new(
        cluster: ClusterInfo,
        url: impl Into<String>,
        connector: Arc<dyn Connector>,
        auth: AuthResolver,
        state_path: impl Into<PathBuf>,
    ) -> ElectionResult<Self> {
        if cluster.size == 0 {
            return Err(ElectionError::InvalidSettings(
                "cluster size must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            cluster,
            url: url.into(),
            connector,
            auth,
            timing: ElectionTiming::default(),
            log: StateLog::new(state_path),
            node_id: ulid::Ulid::new().to_string().to_lowercase(),
        })
    }

    pub fn with_timing(mut self, timing: ElectionTiming) -> ElectionResult<Self> {
        timing.validate()?;
        self.timing = timing;
        Ok(self)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn cluster(&self) -> &ClusterInfo {
        &self.cluster
    }

    async fn start_node(
        &self,
        shutdown: CancellationToken,
    ) -> ElectionResult<(mpsc::UnboundedReceiver<NodeEvent>, tokio::task::JoinHandle<()>)> {
        let persisted = self.log.load().await?;
        let options = ConnectOptions {
            client_id: format!("elector-{}", self.node_id),
            cluster_id: None,
            auth: self.auth.current(),
        };
        let conn = BusConnection::connect(self.connector.as_ref(), &self.url, options).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let node = Node {
            id: self.node_id.clone(),
            cluster: self.cluster.clone(),
            timing: self.timing,
            conn,
            log: self.log.clone(),
            state: NodeState::Follower,
            term: persisted.term,
            voted_for: persisted.voted_for,
            leader: None,
            votes: HashSet::new(),
            deadline: Instant::now(),
            events: tx,
        };
        info!(
            node = %self.node_id,
            cluster = %self.cluster.name,
            size = self.cluster.size,
            term = persisted.term,
            "Joined election cluster"
        );
        Ok((rx, tokio::spawn(node.run(shutdown))))
    }
}

async fn apply(change: StateChange, leadership: &mut Leadership) -> ElectionResult<()> {
    match change.to {
        NodeState::Leader => {
            info!("I'm the LEADER, starting ...");
            leadership.start();
        }
        NodeState::Follower | NodeState::Candidate => {
            info!(state = %change.to, "Standing by");
            if change.from == NodeState::Leader {
                leadership.stop().await;
            }
        }
        NodeState::Closed => {
            error!("Leader elector connection was CLOSED");
            return Err(if leadership.stop().await {
                ElectionError::LeadershipLostUnexpectedly
            } else {
                ElectionError::FeedClosed
            });
        }
    }
    Ok(())
}

#[async_trait]
impl Elector for BusElector {
    async fn run_or_die(
        &self,
        shutdown: CancellationToken,
        callbacks: LeaderCallbacks,
    ) -> ElectionResult<()> {
        let node_token = shutdown.child_token();
        let (mut events, node) = self.start_node(node_token.clone()).await?;
        let mut leadership = Leadership::new(shutdown.clone(), callbacks);

        let result = loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Exiting leader election");
                    break Ok(());
                }
                event = events.recv() => match event {
                    Some(NodeEvent::Changed(change)) => {
                        if let Err(e) = apply(change, &mut leadership).await {
                            break Err(e);
                        }
                    }
                    Some(NodeEvent::Failed(e)) => break Err(e),
                    None => break Err(ElectionError::FeedClosed),
                },
            }
        };

        leadership.stop().await;
        node_token.cancel();
        let _ = node.await;
        result
    }
}
