//! Peer candidates and the stream plumbing shared by transports, introducers
//! and the swarm coordinator.

use std::{
    fmt,
    future::Future,
    str::FromStr,
    sync::{Arc, Mutex},
};

use futures::{future::BoxFuture, FutureExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};

use crate::{error::SwarmError, topic::Topic};

// ── Streams ───────────────────────────────────────────────────────────────────

/// Any duplex byte stream a transport or application can hand over.
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> DuplexStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxStream = Box<dyn DuplexStream>;

type DialFuture = BoxFuture<'static, Result<BoxStream, SwarmError>>;

/// Asynchronous factory producing a transport stream to one peer.
///
/// Invoked once per connection attempt, so reconnects call it again.
#[derive(Clone)]
pub struct Dialer(Arc<dyn Fn() -> DialFuture + Send + Sync>);

impl Dialer {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<BoxStream, SwarmError>> + Send + 'static,
    {
        Self(Arc::new(move || f().boxed()))
    }

    /// Wrap a stream that has already been accepted. The first dial hands it
    /// out; later dials fail with [`SwarmError::StreamConsumed`].
    pub fn once(id: impl Into<String>, stream: impl DuplexStream) -> Self {
        let id = id.into();
        let slot: Arc<Mutex<Option<BoxStream>>> =
            Arc::new(Mutex::new(Some(Box::new(stream) as BoxStream)));
        Self::new(move || {
            let taken = slot.lock().unwrap().take();
            let id = id.clone();
            async move { taken.ok_or(SwarmError::StreamConsumed(id)) }
        })
    }

    pub fn dial(&self) -> BoxFuture<'static, Result<BoxStream, SwarmError>> {
        (self.0)()
    }
}

impl fmt::Debug for Dialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Dialer(..)")
    }
}

// ── Addressing ────────────────────────────────────────────────────────────────

/// Host plus optional port, or transport-specific addressing in `host`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub host: String,
    pub port: Option<u16>,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port: Some(port) }
    }

    pub fn host(host: impl Into<String>) -> Self {
        Self { host: host.into(), port: None }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.host, port),
            None => f.write_str(&self.host),
        }
    }
}

impl FromStr for Address {
    type Err = SwarmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(SwarmError::InvalidPeerUri("empty address".into()));
        }
        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && !host.ends_with(':') => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| SwarmError::InvalidPeerUri(format!("bad port in {s:?}")))?;
                Ok(Self::new(host.trim_start_matches('[').trim_end_matches(']'), port))
            }
            _ => Ok(Self::host(s)),
        }
    }
}

// ── Candidates ────────────────────────────────────────────────────────────────

/// A candidate remote endpoint surfaced by an introducer or a transport.
#[derive(Debug, Clone)]
pub struct PeerCandidate {
    /// Deduplication key: `host:port`, a signaling id, a gateway URL, ...
    pub id: String,
    /// Topic this candidate was discovered for. `None` for inbound
    /// connections, which are not topic-scoped.
    pub topic: Option<Topic>,
    /// Registered transport that should dial this peer when no dialer is set.
    pub transport_type: Option<String>,
    pub address: Option<Address>,
    pub dialer: Option<Dialer>,
    /// Initial backoff index. `None` takes the swarm's default; `Some(0)`
    /// also forces re-admission of an id that is registered but idle.
    pub retries: Option<u32>,
}

impl PeerCandidate {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            topic: None,
            transport_type: None,
            address: None,
            dialer: None,
            retries: None,
        }
    }

    pub fn with_topic(mut self, topic: Topic) -> Self {
        self.topic = Some(topic);
        self
    }

    pub fn with_transport(mut self, transport_type: impl Into<String>, address: Address) -> Self {
        self.transport_type = Some(transport_type.into());
        self.address = Some(address);
        self
    }

    pub fn with_address(mut self, address: Address) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_dialer(mut self, dialer: Dialer) -> Self {
        self.dialer = Some(dialer);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }
}

/// Emitting end of the swarm's single candidate-ingestion channel.
///
/// Introducers and transports hold a clone and push every candidate they see.
/// Once the swarm closes, [`PeerSink::emit`] fails and emitters should stop.
#[derive(Debug, Clone)]
pub struct PeerSink {
    tx: mpsc::UnboundedSender<PeerCandidate>,
}

impl PeerSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<PeerCandidate>) -> Self {
        Self { tx }
    }

    /// Free-standing sink/receiver pair, for driving an introducer or
    /// transport without a swarm.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PeerCandidate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, candidate: PeerCandidate) -> Result<(), SwarmError> {
        self.tx.send(candidate).map_err(|_| SwarmError::Shutdown)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ── Application streams ───────────────────────────────────────────────────────

/// Receives topics multiplexed onto an existing connection.
pub type TopicReceiver = mpsc::UnboundedReceiver<Topic>;

/// Everything the application learns about a freshly opened connection.
#[derive(Debug)]
pub struct PeerContext {
    pub id: String,
    pub topic: Option<Topic>,
    pub transport_type: Option<String>,
    pub address: Option<Address>,
    /// Yields each additional topic the same remote becomes reachable under
    /// for as long as this connection lives.
    pub topics: TopicReceiver,
}

/// Caller-supplied factory for the application stream spliced onto every
/// established transport stream.
pub trait StreamHandler: Send + Sync + 'static {
    fn open(&self, ctx: PeerContext) -> Result<BoxStream, SwarmError>;
}

impl<F> StreamHandler for F
where
    F: Fn(PeerContext) -> Result<BoxStream, SwarmError> + Send + Sync + 'static,
{
    fn open(&self, ctx: PeerContext) -> Result<BoxStream, SwarmError> {
        self(ctx)
    }
}
