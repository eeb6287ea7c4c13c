//! In-process transport without sockets, for tests and local demos.
//!
//! Every `MemoryTransport` built on the same [`MemoryNetwork`] can reach the
//! others by port number. A dial produces a `tokio::io::duplex` pair: one half
//! is returned to the dialer, the other is emitted to the listener as an
//! inbound peer candidate identified by the dialer's swarm id.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tracing::debug;

use crate::{
    error::SwarmError,
    peer::{Address, BoxStream, Dialer, PeerCandidate, PeerSink},
    transport::{ListenContext, Server, Transport},
};

pub const MEMORY: &str = "memory";

const MEMORY_HOST: &str = "memory";

#[derive(Debug, Default)]
struct Inner {
    listeners: HashMap<u16, PeerSink>,
    next_port: u16,
}

/// Shared switchboard; clones see the same listeners.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_listening(&self, port: u16) -> bool {
        self.inner.lock().unwrap().listeners.contains_key(&port)
    }
}

pub struct MemoryTransport {
    network: MemoryNetwork,
    buffer: usize,
    local_id: Mutex<Option<String>>,
}

impl MemoryTransport {
    pub fn new(network: MemoryNetwork) -> Self {
        Self { network, buffer: 64 * 1024, local_id: Mutex::new(None) }
    }

    fn local_id(&self) -> String {
        self.local_id
            .lock()
            .unwrap()
            .get_or_insert_with(|| format!("memory-{}", uuid::Uuid::new_v4()))
            .clone()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn listen(&self, port: u16, ctx: ListenContext) -> Result<Server, SwarmError> {
        *self.local_id.lock().unwrap() = Some(ctx.local_id.clone());

        let port = {
            let mut g = self.network.inner.lock().unwrap();
            let port = if port == 0 {
                let mut candidate = g.next_port.max(1);
                while g.listeners.contains_key(&candidate) {
                    candidate = candidate.checked_add(1).ok_or_else(|| SwarmError::Listen {
                        transport: MEMORY.into(),
                        reason: "no free ports".into(),
                    })?;
                }
                g.next_port = candidate.saturating_add(1);
                candidate
            } else {
                port
            };
            if g.listeners.contains_key(&port) {
                return Err(SwarmError::Listen {
                    transport: MEMORY.into(),
                    reason: format!("port {port} already in use"),
                });
            }
            g.listeners.insert(port, ctx.sink);
            port
        };
        debug!("memory transport listening on port {port}");

        let network = self.network.clone();
        Ok(Server::new(Address::new(MEMORY_HOST, port), move || {
            network.inner.lock().unwrap().listeners.remove(&port);
        }))
    }

    async fn connect(
        &self,
        _peer_id: &str,
        address: Option<&Address>,
    ) -> Result<BoxStream, SwarmError> {
        let port = address
            .and_then(|a| a.port)
            .ok_or_else(|| SwarmError::Dial("memory peer has no port".into()))?;
        let sink = self
            .network
            .inner
            .lock()
            .unwrap()
            .listeners
            .get(&port)
            .cloned()
            .ok_or_else(|| SwarmError::Dial(format!("connection refused on memory port {port}")))?;

        let (local, remote) = tokio::io::duplex(self.buffer);
        let id = self.local_id();
        let inbound = PeerCandidate::new(id.clone())
            .with_address(Address::host(MEMORY_HOST))
            .with_dialer(Dialer::once(id, remote));
        sink.emit(inbound)
            .map_err(|_| SwarmError::Dial(format!("memory port {port} is closing")))?;
        Ok(Box::new(local))
    }
}
