//! Transport contract.
//!
//! A `Transport` is one connection technology: it accepts inbound duplex
//! streams and opens outbound ones. It never retries on its own and never
//! touches swarm state; inbound peers are pushed into the [`PeerSink`] handed
//! over at `listen` time.

pub mod memory;
pub mod tcp;

use std::{collections::BTreeMap, fmt, sync::Arc};

use async_trait::async_trait;

use crate::{
    error::SwarmError,
    introducer::JoinContext,
    peer::{Address, BoxStream, PeerSink},
    topic::Topic,
};

/// Transports registered with a swarm, keyed by transport-type tag.
pub type TransportMap = BTreeMap<String, Arc<dyn Transport>>;

/// What a transport gets when asked to listen.
#[derive(Debug, Clone)]
pub struct ListenContext {
    /// The swarm's own id, for transports that address by node id.
    pub local_id: String,
    /// Inbound connections are emitted here as peer candidates.
    pub sink: PeerSink,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Start accepting inbound peers. Each accepted peer is emitted on
    /// `ctx.sink`; dropping or closing the returned [`Server`] stops accepting.
    async fn listen(&self, port: u16, ctx: ListenContext) -> Result<Server, SwarmError>;

    /// Open one outbound stream. Fails on timeout or rejection; no retries.
    async fn connect(
        &self,
        peer_id: &str,
        address: Option<&Address>,
    ) -> Result<BoxStream, SwarmError>;

    /// Topic-scoped announcement, called on every swarm `join`.
    async fn announce(&self, _topic: &Topic, _ctx: &JoinContext) -> Result<(), SwarmError> {
        Ok(())
    }

    /// Counterpart of [`Transport::announce`], called on every swarm `leave`.
    async fn unannounce(&self, _topic: &Topic) {}
}

/// Handle on a listening transport.
pub struct Server {
    address: Address,
    on_close: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Server {
    pub fn new(address: Address, on_close: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self { address, on_close: Some(Box::new(on_close)) }
    }

    /// Where this server can be reached; announced to introducers.
    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.address.port.unwrap_or(0)
    }

    /// Stop accepting and release the transport's resources.
    pub fn close(self) {}
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(close) = self.on_close.take() {
            close();
        }
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server").field("address", &self.address).finish()
    }
}
