//! Swarm coordinator.
//!
//! Obtain a [`SwarmHandle`] before calling [`SwarmNode::run`] so you can join
//! topics and listen while the coordinator runs inside a spawned task.
//!
//! The coordinator is the only owner of the peer registry. Introducers and
//! transports push candidates into one ingestion channel, connection tasks and
//! backoff timers send [`Report`]s back, and handles send commands; all three
//! are drained by a single `select!` loop, so registry mutations are strictly
//! serialized while dialing, splicing and discovery run concurrently.

pub mod backoff;
mod connection;
mod registry;

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    sync::Arc,
    time::Duration,
};

use futures::future;
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::AbortHandle,
};
use tracing::{debug, warn};

pub use backoff::ReconnectPolicy;
pub use registry::{DiscardReason, PeerStatus, SwarmStats};

use crate::{
    error::SwarmError,
    introducer::{Introducer, JoinContext, JoinOptions},
    peer::{Address, Dialer, PeerCandidate, PeerSink, StreamHandler},
    topic::Topic,
    transport::{ListenContext, Server, Transport, TransportMap},
};
use connection::{ConnectionTask, Report};
use registry::{Admission, PeerRegistry, PeerState};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Peer lifecycle log record: `info` with the debug flag set, `trace` otherwise.
macro_rules! lifecycle {
    ($debug:expr, $($arg:tt)+) => {
        if $debug {
            tracing::info!($($arg)+);
        } else {
            tracing::trace!($($arg)+);
        }
    };
}

// ── Configuration ─────────────────────────────────────────────────────────────

pub struct SwarmConfig {
    /// This node's id; candidates carrying it are rejected.
    pub id: String,
    /// 0 means unbounded.
    pub max_connections: usize,
    /// Raise peer lifecycle logging to `info`.
    pub debug: bool,
    pub policy: ReconnectPolicy,
    pub transports: TransportMap,
    pub introducers: Vec<Arc<dyn Introducer>>,
    /// Application stream factory. Without one, peers are registered but
    /// never dialed.
    pub handler: Option<Arc<dyn StreamHandler>>,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            id: hex::encode(rand::random::<[u8; 32]>()),
            max_connections: 0,
            debug: false,
            policy: ReconnectPolicy::default(),
            transports: TransportMap::new(),
            introducers: Vec::new(),
            handler: None,
        }
    }
}

impl SwarmConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_transport(mut self, tag: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        self.transports.insert(tag.into(), transport);
        self
    }

    pub fn with_introducer(mut self, introducer: Arc<dyn Introducer>) -> Self {
        self.introducers.push(introducer);
        self
    }

    pub fn with_handler(mut self, handler: impl StreamHandler) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }
}

impl fmt::Debug for SwarmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwarmConfig")
            .field("id", &self.id)
            .field("max_connections", &self.max_connections)
            .field("debug", &self.debug)
            .field("policy", &self.policy)
            .field("transports", &self.transports.keys().collect::<Vec<_>>())
            .field("introducers", &self.introducers.len())
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

// ── Public event / result types ───────────────────────────────────────────────

/// Observable peer lifecycle. Publishing never blocks the coordinator; slow
/// subscribers lag.
#[derive(Debug, Clone)]
pub enum SwarmEvent {
    Registered { peer: String, topic: Option<Topic> },
    Dialing { peer: String, retries: u32 },
    Connected { peer: String },
    Disconnected { peer: String, error: Option<SwarmError> },
    Reconnecting { peer: String, retries: u32, delay: Duration },
    Abandoned { peer: String },
    Multiplexed { peer: String, topic: Topic },
    Discarded { peer: String, reason: DiscardReason },
    ListenFailed { transport: String, error: SwarmError },
}

/// Per-transport outcome of [`SwarmHandle::listen`].
#[derive(Debug, Default)]
pub struct ListenReport {
    pub results: Vec<(String, Result<u16, SwarmError>)>,
}

impl ListenReport {
    pub fn port(&self, transport: &str) -> Option<u16> {
        self.results
            .iter()
            .find(|(tag, _)| tag == transport)
            .and_then(|(_, r)| r.as_ref().ok().copied())
    }

    pub fn failed(&self) -> impl Iterator<Item = (&str, &SwarmError)> {
        self.results
            .iter()
            .filter_map(|(tag, r)| r.as_ref().err().map(|e| (tag.as_str(), e)))
    }

    /// Bound ports, or the first failure.
    pub fn into_result(self) -> Result<Vec<(String, u16)>, SwarmError> {
        self.results.into_iter().map(|(tag, r)| r.map(|port| (tag, port))).collect()
    }
}

#[derive(Debug)]
enum SwarmCommand {
    /// Replies with the bound transport addresses if the topic is new.
    Join { topic: Topic, reply: oneshot::Sender<Option<BTreeMap<String, Address>>> },
    Leave { topic: Topic, reply: oneshot::Sender<()> },
    Listened { servers: Vec<(String, Server)>, reply: oneshot::Sender<()> },
    /// Replies with the topics that were joined.
    Close { reply: oneshot::Sender<Vec<Topic>> },
    Stats { reply: oneshot::Sender<SwarmStats> },
    PeerState { id: String, reply: oneshot::Sender<Option<PeerStatus>> },
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Cheap-to-clone handle to a running [`SwarmNode`].
///
/// Fan-out to introducers and transports happens here, on the caller's task,
/// so slow discovery backends never stall the coordinator.
#[derive(Clone)]
pub struct SwarmHandle {
    local_id: String,
    cmd_tx: mpsc::Sender<SwarmCommand>,
    event_tx: broadcast::Sender<SwarmEvent>,
    sink: PeerSink,
    transports: Arc<TransportMap>,
    introducers: Arc<Vec<Arc<dyn Introducer>>>,
}

impl SwarmHandle {
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SwarmEvent> {
        self.event_tx.subscribe()
    }

    /// The swarm's ingestion channel, for candidates from outside the
    /// registered introducers and transports.
    pub fn peer_sink(&self) -> PeerSink {
        self.sink.clone()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SwarmCommand,
    ) -> Result<T, SwarmError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(make(tx)).await.map_err(|_| SwarmError::Shutdown)?;
        rx.await.map_err(|_| SwarmError::Shutdown)
    }

    /// Join `topic`. A topic already joined is left untouched.
    pub async fn join(&self, topic: &Topic, options: JoinOptions) -> Result<(), SwarmError> {
        let reply = self.request(|reply| SwarmCommand::Join { topic: topic.clone(), reply }).await?;
        let Some(addresses) = reply else {
            return Ok(());
        };
        let ctx = JoinContext {
            local_id: self.local_id.clone(),
            options,
            addresses,
            sink: self.sink.clone(),
        };
        for introducer in self.introducers.iter() {
            introducer.join(topic, ctx.clone()).await;
        }
        for (tag, transport) in self.transports.iter() {
            if let Err(e) = transport.announce(topic, &ctx).await {
                warn!(transport = %tag, topic = %topic, "announce failed: {e}");
            }
        }
        Ok(())
    }

    /// Leave `topic`, tearing down every peer found under it. Introducers and
    /// transports are told even if the topic was never joined.
    pub async fn leave(&self, topic: &Topic) -> Result<(), SwarmError> {
        self.request(|reply| SwarmCommand::Leave { topic: topic.clone(), reply }).await?;
        self.forget(topic).await;
        Ok(())
    }

    async fn forget(&self, topic: &Topic) {
        for introducer in self.introducers.iter() {
            introducer.leave(topic).await;
        }
        for transport in self.transports.values() {
            transport.unannounce(topic).await;
        }
    }

    /// Start every transport listening on `port`, concurrently. Resolves once
    /// all of them have succeeded or failed; one failure never cancels the
    /// others.
    pub async fn listen(&self, port: u16) -> Result<ListenReport, SwarmError> {
        let ctx = ListenContext { local_id: self.local_id.clone(), sink: self.sink.clone() };
        let attempts = self.transports.iter().map(|(tag, transport)| {
            let ctx = ctx.clone();
            async move { (tag.clone(), transport.listen(port, ctx).await) }
        });

        let mut report = ListenReport::default();
        let mut servers = Vec::new();
        for (tag, outcome) in future::join_all(attempts).await {
            match outcome {
                Ok(server) => {
                    debug!(transport = %tag, "listening on {}", server.address());
                    report.results.push((tag.clone(), Ok(server.port())));
                    servers.push((tag, server));
                }
                Err(e) => {
                    warn!(transport = %tag, "listen failed: {e}");
                    let _ = self
                        .event_tx
                        .send(SwarmEvent::ListenFailed { transport: tag.clone(), error: e.clone() });
                    report.results.push((tag, Err(e)));
                }
            }
        }
        self.request(|reply| SwarmCommand::Listened { servers, reply }).await?;
        Ok(report)
    }

    /// Leave every topic, drop every connection and close every server. The
    /// ingestion channel closes with the coordinator, so emitters stop.
    pub async fn close(&self) -> Result<(), SwarmError> {
        let topics = self.request(|reply| SwarmCommand::Close { reply }).await?;
        for topic in &topics {
            self.forget(topic).await;
        }
        Ok(())
    }

    pub async fn stats(&self) -> Result<SwarmStats, SwarmError> {
        self.request(|reply| SwarmCommand::Stats { reply }).await
    }

    pub async fn peer_state(&self, id: &str) -> Result<Option<PeerStatus>, SwarmError> {
        self.request(|reply| SwarmCommand::PeerState { id: id.to_string(), reply }).await
    }
}

impl fmt::Debug for SwarmHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwarmHandle").field("local_id", &self.local_id).finish()
    }
}

// ── SwarmNode ─────────────────────────────────────────────────────────────────

pub struct SwarmNode {
    handle: SwarmHandle,
    cmd_rx: mpsc::Receiver<SwarmCommand>,
    candidate_rx: mpsc::UnboundedReceiver<PeerCandidate>,
    report_tx: mpsc::UnboundedSender<Report>,
    report_rx: mpsc::UnboundedReceiver<Report>,
    registry: PeerRegistry,
    policy: ReconnectPolicy,
    debug: bool,
    handler: Option<Arc<dyn StreamHandler>>,
    servers: Vec<(String, Server)>,
    /// Connection task or backoff timer per peer; at most one of either.
    tasks: HashMap<String, AbortHandle>,
}

impl SwarmNode {
    pub fn new(config: SwarmConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (candidate_tx, candidate_rx) = mpsc::unbounded_channel();
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let handle = SwarmHandle {
            local_id: config.id.clone(),
            cmd_tx,
            event_tx,
            sink: PeerSink::new(candidate_tx),
            transports: Arc::new(config.transports),
            introducers: Arc::new(config.introducers),
        };
        Self {
            handle,
            cmd_rx,
            candidate_rx,
            report_tx,
            report_rx,
            registry: PeerRegistry::new(config.id, config.max_connections),
            policy: config.policy,
            debug: config.debug,
            handler: config.handler,
            servers: Vec::new(),
            tasks: HashMap::new(),
        }
    }

    pub fn handle(&self) -> SwarmHandle {
        self.handle.clone()
    }

    /// Build a node, spawn its loop and return its handle.
    pub fn spawn(config: SwarmConfig) -> SwarmHandle {
        let node = Self::new(config);
        let handle = node.handle();
        tokio::spawn(node.run());
        handle
    }

    /// Run the coordinator until `close()` or until every handle is dropped.
    pub async fn run(mut self) {
        let event_tx = self.handle.event_tx.clone();
        // Release our own command sender so the loop ends with the last handle.
        self.handle.cmd_tx = mpsc::channel(1).0;
        debug!(id = %self.handle.local_id, "swarm starting");

        macro_rules! emit {
            ($ev:expr) => {
                let _ = event_tx.send($ev);
            };
        }

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        if !self.on_command(cmd) {
                            break;
                        }
                    }
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(candidate) = self.candidate_rx.recv() => {
                    for ev in self.ingest(candidate) {
                        emit!(ev);
                    }
                }
                Some(report) = self.report_rx.recv() => {
                    for ev in self.on_report(report) {
                        emit!(ev);
                    }
                }
            }
        }
        debug!(id = %self.handle.local_id, "swarm stopped");
    }

    /// Returns `false` once the swarm is closed.
    fn on_command(&mut self, cmd: SwarmCommand) -> bool {
        match cmd {
            SwarmCommand::Join { topic, reply } => {
                let fresh = self.registry.join(&topic);
                lifecycle!(self.debug, topic = %topic, fresh, "join");
                let _ = reply.send(fresh.then(|| self.addresses()));
            }
            SwarmCommand::Leave { topic, reply } => {
                for entry in self.registry.leave(&topic) {
                    if let Some(task) = self.tasks.remove(&entry.id) {
                        task.abort();
                    }
                    lifecycle!(self.debug, peer = %entry.id, topic = %topic, "removed on leave");
                }
                let _ = reply.send(());
            }
            SwarmCommand::Listened { servers, reply } => {
                self.servers.extend(servers);
                let _ = reply.send(());
            }
            SwarmCommand::Stats { reply } => {
                let _ = reply.send(self.registry.stats());
            }
            SwarmCommand::PeerState { id, reply } => {
                let _ = reply.send(self.registry.status(&id));
            }
            SwarmCommand::Close { reply } => {
                let _ = reply.send(self.shutdown());
                return false;
            }
        }
        true
    }

    fn addresses(&self) -> BTreeMap<String, Address> {
        self.servers.iter().map(|(tag, server)| (tag.clone(), server.address().clone())).collect()
    }

    fn shutdown(&mut self) -> Vec<Topic> {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
        let (topics, entries) = self.registry.clear();
        lifecycle!(self.debug, topics = topics.len(), peers = entries.len(), "swarm closing");
        for (tag, server) in self.servers.drain(..) {
            debug!(transport = %tag, "closing server on {}", server.address());
            server.close();
        }
        topics
    }

    // ── Candidate ingestion ───────────────────────────────────────────────────

    fn ingest(&mut self, mut candidate: PeerCandidate) -> Vec<SwarmEvent> {
        let peer = candidate.id.clone();
        match self.registry.assess(&candidate) {
            Admission::Discard(reason) => {
                lifecycle!(self.debug, peer = %peer, "discarded: {reason}");
                vec![SwarmEvent::Discarded { peer, reason }]
            }
            Admission::Multiplex(topic) => {
                if !self.registry.multiplex(&peer, &topic) {
                    debug!(peer = %peer, topic = %topic, "application stream no longer listens for topics");
                }
                lifecycle!(self.debug, peer = %peer, topic = %topic, "multiplexed");
                vec![SwarmEvent::Multiplexed { peer, topic }]
            }
            Admission::Register => {
                if let Some(task) = self.tasks.remove(&peer) {
                    task.abort();
                }
                if candidate.dialer.is_none() {
                    candidate.dialer = self.transport_dialer(&candidate);
                }
                let topic = candidate.topic.clone();
                let generation = self.registry.register(candidate, self.policy.default_retries());
                lifecycle!(self.debug, peer = %peer, generation, "registered");
                let mut events = vec![SwarmEvent::Registered { peer: peer.clone(), topic }];
                events.extend(self.dial(&peer, generation));
                events
            }
        }
    }

    /// Dialer that connects through the candidate's named transport.
    fn transport_dialer(&self, candidate: &PeerCandidate) -> Option<Dialer> {
        let tag = candidate.transport_type.as_ref()?;
        let Some(transport) = self.handle.transports.get(tag).cloned() else {
            debug!(peer = %candidate.id, "{}", SwarmError::UnknownTransport(tag.clone()));
            return None;
        };
        let id = candidate.id.clone();
        let address = candidate.address.clone();
        Some(Dialer::new(move || {
            let transport = transport.clone();
            let id = id.clone();
            let address = address.clone();
            async move { transport.connect(&id, address.as_ref()).await }
        }))
    }

    /// Start a connection task for the current registration of `id`, if it
    /// can be dialed at all. Otherwise it stays `Discovered`.
    fn dial(&mut self, id: &str, generation: u64) -> Option<SwarmEvent> {
        let handler = self.handler.clone()?;
        let entry = self.registry.current(id, generation)?;
        let task = ConnectionTask {
            id: entry.id.clone(),
            generation,
            topic: entry.topic.clone(),
            transport_type: entry.transport_type.clone(),
            address: entry.address.clone(),
            dialer: entry.dialer.clone()?,
            handler,
        };
        let retries = entry.retries;
        self.registry.set_state(id, PeerState::Dialing);
        lifecycle!(self.debug, peer = %id, retries, "dialing");

        let running = tokio::spawn(task.run(self.report_tx.clone()));
        self.tasks.insert(id.to_string(), running.abort_handle());
        Some(SwarmEvent::Dialing { peer: id.to_string(), retries })
    }

    // ── Connection reports ────────────────────────────────────────────────────

    fn on_report(&mut self, report: Report) -> Vec<SwarmEvent> {
        match report {
            Report::Opened { id, generation, topics } => {
                let Some(entry) = self.registry.current(&id, generation) else {
                    return Vec::new();
                };
                let delivered: HashSet<String> = entry.topic.iter().map(Topic::hex).collect();
                self.registry.set_state(&id, PeerState::Connected { topics, delivered });
                lifecycle!(self.debug, peer = %id, "connected");
                vec![SwarmEvent::Connected { peer: id }]
            }
            Report::Ended { id, generation, error } => self.on_ended(id, generation, error),
            Report::RedialDue { id, generation } => {
                let due = matches!(
                    self.registry.current(&id, generation),
                    Some(entry) if matches!(entry.state, PeerState::Reconnecting)
                );
                if !due {
                    return Vec::new();
                }
                self.tasks.remove(&id);
                self.dial(&id, generation).into_iter().collect()
            }
        }
    }

    fn on_ended(&mut self, id: String, generation: u64, error: Option<SwarmError>) -> Vec<SwarmEvent> {
        let Some(entry) = self.registry.current(&id, generation) else {
            return Vec::new();
        };
        let retries = entry.retries;
        let delay = self.policy.delay(retries);
        if delay.is_some() {
            entry.retries += 1;
        }
        self.tasks.remove(&id);

        match &error {
            Some(e) => debug!(peer = %id, "connection ended: {e}"),
            None => lifecycle!(self.debug, peer = %id, "connection closed"),
        }
        let mut events = vec![SwarmEvent::Disconnected { peer: id.clone(), error }];

        match delay {
            Some(delay) => {
                self.registry.set_state(&id, PeerState::Reconnecting);
                let reports = self.report_tx.clone();
                let peer = id.clone();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = reports.send(Report::RedialDue { id: peer, generation });
                });
                self.tasks.insert(id.clone(), timer.abort_handle());
                lifecycle!(self.debug, peer = %id, retries, ?delay, "reconnecting");
                events.push(SwarmEvent::Reconnecting { peer: id, retries, delay });
            }
            None => {
                self.registry.set_state(&id, PeerState::Abandoned);
                lifecycle!(self.debug, peer = %id, "abandoned");
                events.push(SwarmEvent::Abandoned { peer: id });
            }
        }
        events
    }
}
