//! Fixed peer list, e.g. from configuration or a directory service response.
//!
//! URIs:
//!   `tcp://host:port`   → id = the URI itself, dialed with the `tcp` transport
//!   `wrtc://host/<id>`  → id = `<id>`, dialed with the `webrtc` transport via
//!                         the signaling hub at `host`

use std::{collections::HashSet, sync::Mutex};

use async_trait::async_trait;
use tracing::warn;

use crate::{
    error::SwarmError,
    introducer::{Introducer, JoinContext},
    peer::{Address, PeerCandidate},
    signaling::WEBRTC,
    topic::Topic,
    transport::tcp::TCP,
};

pub fn parse_peer_uri(uri: &str) -> Result<PeerCandidate, SwarmError> {
    if let Some(rest) = uri.strip_prefix("wrtc://") {
        let (host, id) = rest
            .split_once('/')
            .filter(|(host, id)| !host.is_empty() && !id.is_empty())
            .ok_or_else(|| SwarmError::InvalidPeerUri(uri.to_string()))?;
        return Ok(PeerCandidate::new(id).with_transport(WEBRTC, Address::host(host)));
    }
    if let Some(rest) = uri.strip_prefix("tcp://") {
        let address: Address = rest
            .parse()
            .map_err(|_| SwarmError::InvalidPeerUri(uri.to_string()))?;
        if address.port.is_none() {
            return Err(SwarmError::InvalidPeerUri(format!("{uri}: missing port")));
        }
        return Ok(PeerCandidate::new(uri).with_transport(TCP, address));
    }
    Err(SwarmError::InvalidPeerUri(format!("unknown protocol in {uri}")))
}

/// Emits the same fixed set of peers for every joined topic.
pub struct StaticIntroducer {
    peers: Vec<PeerCandidate>,
    retries: Option<u32>,
    joined: Mutex<HashSet<String>>,
}

impl StaticIntroducer {
    pub fn new(peers: Vec<PeerCandidate>) -> Self {
        Self { peers, retries: None, joined: Mutex::new(HashSet::new()) }
    }

    /// Parse `uris`, logging and skipping the ones that are not understood.
    pub fn from_uris<I, S>(uris: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let peers = uris
            .into_iter()
            .filter_map(|uri| match parse_peer_uri(uri.as_ref()) {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!("skipping peer: {e}");
                    None
                }
            })
            .collect();
        Self::new(peers)
    }

    /// Explicit retry budget for every emitted peer (backoff index to start
    /// from). Gateway-style single-shot peers use a budget near exhaustion.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[async_trait]
impl Introducer for StaticIntroducer {
    async fn join(&self, topic: &Topic, ctx: JoinContext) {
        if !self.joined.lock().unwrap().insert(topic.hex()) {
            return;
        }
        for peer in &self.peers {
            let mut candidate = peer.clone().with_topic(topic.clone());
            if let Some(retries) = self.retries {
                candidate.retries = Some(retries);
            }
            if ctx.sink.emit(candidate).is_err() {
                return;
            }
        }
    }

    async fn leave(&self, topic: &Topic) {
        self.joined.lock().unwrap().remove(&topic.hex());
    }
}
