//! Direct TCP sockets.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::{
    error::SwarmError,
    peer::{Address, BoxStream, Dialer, PeerCandidate},
    transport::{ListenContext, Server, Transport},
};

/// Transport-type tag peers use to select this transport.
pub const TCP: &str = "tcp";

/// Pause after a failed accept, so persistent errors (fd exhaustion) do not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct TcpTransport {
    bind_host: String,
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(bind_host: impl Into<String>, connect_timeout: Duration) -> Self {
        Self { bind_host: bind_host.into(), connect_timeout }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new("0.0.0.0", Duration::from_secs(10))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn listen(&self, port: u16, ctx: ListenContext) -> Result<Server, SwarmError> {
        let listener = TcpListener::bind((self.bind_host.as_str(), port))
            .await
            .map_err(|e| SwarmError::Listen { transport: TCP.into(), reason: e.to_string() })?;
        let local = listener.local_addr()?;
        debug!("tcp listening on {local}");

        let task = tokio::spawn(async move {
            loop {
                let (socket, remote) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("tcp accept failed: {e}");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                };
                let _ = socket.set_nodelay(true);
                let id = remote.to_string();
                let candidate = PeerCandidate::new(id.clone())
                    .with_address(Address::new(remote.ip().to_string(), remote.port()))
                    .with_dialer(Dialer::once(id, socket));
                if ctx.sink.emit(candidate).is_err() {
                    debug!("tcp listener on {local} has no consumer, stopping");
                    break;
                }
            }
        });

        let address = Address::new(local.ip().to_string(), local.port());
        Ok(Server::new(address, move || task.abort()))
    }

    async fn connect(
        &self,
        _peer_id: &str,
        address: Option<&Address>,
    ) -> Result<BoxStream, SwarmError> {
        let address = address.ok_or_else(|| SwarmError::Dial("tcp peer has no address".into()))?;
        let port = address
            .port
            .ok_or_else(|| SwarmError::Dial(format!("tcp address {address} has no port")))?;

        let socket = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((address.host.as_str(), port)),
        )
        .await
        .map_err(|_| SwarmError::ConnectTimeout)?
        .map_err(|e| SwarmError::Dial(format!("{address}: {e}")))?;
        let _ = socket.set_nodelay(true);
        debug!("tcp connected to {address}");
        Ok(Box::new(socket))
    }
}
