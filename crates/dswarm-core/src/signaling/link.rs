//! Direct peer links negotiated through offer/answer descriptors.
//!
//! `LinkFactory` stands where a WebRTC peer-connection implementation would:
//! the initiator creates an offer, the responder turns that offer into an
//! answer, the initiator applies the answer, and both sides then wait for the
//! link to come up.

use std::{
    collections::HashMap,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use async_trait::async_trait;
use serde_json::json;
use tokio::{
    io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf},
    sync::oneshot,
};

use crate::{error::SwarmError, peer::BoxStream, signaling::message::Descriptor};

/// A half-formed link. Dropping it tears the attempt down.
#[async_trait]
pub trait PendingLink: Send {
    /// Feed the remote side's descriptor. Only the initiator needs this; the
    /// responder consumed the offer when it was created.
    fn apply(&mut self, remote: &Descriptor) -> Result<(), SwarmError>;

    /// Resolves once the link is up.
    async fn established(self: Box<Self>) -> Result<BoxStream, SwarmError>;
}

pub trait LinkFactory: Send + Sync + 'static {
    /// Start an initiating link; returns the offer to broadcast.
    fn initiate(&self) -> Result<(Descriptor, Box<dyn PendingLink>), SwarmError>;

    /// Answer a received offer; returns the answer to send back.
    fn respond(&self, offer: &Descriptor) -> Result<(Descriptor, Box<dyn PendingLink>), SwarmError>;
}

// ── In-process links ──────────────────────────────────────────────────────────

const LINK_BUFFER: usize = 64 * 1024;

struct Rendezvous {
    offer_token: String,
    stream: DuplexStream,
    accepted: oneshot::Sender<()>,
}

/// In-process `LinkFactory`: offers and answers carry tokens into a shared
/// rendezvous table, and an established link is a `tokio::io::duplex` pair.
#[derive(Clone, Default)]
pub struct MemoryLinks {
    pending: Arc<Mutex<HashMap<String, Rendezvous>>>,
}

impl MemoryLinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers issued but not yet applied by their initiator.
    pub fn pending_answers(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

fn token_field(d: &Descriptor, field: &str) -> Result<String, SwarmError> {
    d.get(field)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| SwarmError::Signaling(format!("descriptor has no {field:?}")))
}

impl LinkFactory for MemoryLinks {
    fn initiate(&self) -> Result<(Descriptor, Box<dyn PendingLink>), SwarmError> {
        let token = uuid::Uuid::new_v4().to_string();
        let offer = json!({ "token": token });
        let link = InitiatorLink { links: self.clone(), token, stream: None };
        Ok((offer, Box::new(link)))
    }

    fn respond(&self, offer: &Descriptor) -> Result<(Descriptor, Box<dyn PendingLink>), SwarmError> {
        let offer_token = token_field(offer, "token")?;
        let answer_token = uuid::Uuid::new_v4().to_string();
        let (ours, theirs) = tokio::io::duplex(LINK_BUFFER);
        let (accepted_tx, accepted_rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(
            answer_token.clone(),
            Rendezvous { offer_token: offer_token.clone(), stream: theirs, accepted: accepted_tx },
        );
        let answer = json!({ "token": offer_token, "answer": answer_token });
        let link = ResponderLink {
            links: self.clone(),
            answer_token,
            stream: Some(ours),
            accepted: Some(accepted_rx),
        };
        Ok((answer, Box::new(link)))
    }
}

struct InitiatorLink {
    links: MemoryLinks,
    token: String,
    stream: Option<DuplexStream>,
}

#[async_trait]
impl PendingLink for InitiatorLink {
    fn apply(&mut self, remote: &Descriptor) -> Result<(), SwarmError> {
        if token_field(remote, "token")? != self.token {
            return Err(SwarmError::Signaling("answer is for a different offer".into()));
        }
        let answer = token_field(remote, "answer")?;
        let rendezvous = self
            .links
            .pending
            .lock()
            .unwrap()
            .remove(&answer)
            .ok_or_else(|| SwarmError::Signaling("answer expired".into()))?;
        if rendezvous.offer_token != self.token {
            return Err(SwarmError::Signaling("answer is for a different offer".into()));
        }
        let _ = rendezvous.accepted.send(());
        self.stream = Some(rendezvous.stream);
        Ok(())
    }

    async fn established(self: Box<Self>) -> Result<BoxStream, SwarmError> {
        let mut this = self;
        match this.stream.take() {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(SwarmError::Signaling("no answer applied".into())),
        }
    }
}

struct ResponderLink {
    links: MemoryLinks,
    answer_token: String,
    stream: Option<DuplexStream>,
    accepted: Option<oneshot::Receiver<()>>,
}

#[async_trait]
impl PendingLink for ResponderLink {
    fn apply(&mut self, _remote: &Descriptor) -> Result<(), SwarmError> {
        Ok(())
    }

    async fn established(self: Box<Self>) -> Result<BoxStream, SwarmError> {
        let mut this = self;
        let accepted = this
            .accepted
            .take()
            .ok_or_else(|| SwarmError::Signaling("link already consumed".into()))?;
        accepted
            .await
            .map_err(|_| SwarmError::Signaling("offerer went away".into()))?;
        this.stream
            .take()
            .map(|s| Box::new(s) as BoxStream)
            .ok_or_else(|| SwarmError::Signaling("link already consumed".into()))
    }
}

impl Drop for ResponderLink {
    fn drop(&mut self) {
        self.links.pending.lock().unwrap().remove(&self.answer_token);
    }
}

// ── Connection tracking ───────────────────────────────────────────────────────

/// Remote ids with a live or pending link, with a holder count each.
pub(crate) type ConnectedSet = Arc<Mutex<HashMap<String, usize>>>;

/// Marks a remote id as linked until dropped.
pub(crate) struct Claim {
    id: String,
    connected: ConnectedSet,
}

impl Claim {
    pub(crate) fn new(id: impl Into<String>, connected: &ConnectedSet) -> Self {
        let id = id.into();
        *connected.lock().unwrap().entry(id.clone()).or_insert(0) += 1;
        Self { id, connected: connected.clone() }
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        let mut g = self.connected.lock().unwrap();
        if let Some(holders) = g.get_mut(&self.id) {
            *holders -= 1;
            if *holders == 0 {
                g.remove(&self.id);
            }
        }
    }
}

/// Link stream that keeps its remote id claimed for as long as it lives.
pub(crate) struct TrackedStream {
    inner: BoxStream,
    _claim: Claim,
}

impl TrackedStream {
    pub(crate) fn new(inner: BoxStream, claim: Claim) -> Self {
        Self { inner, _claim: claim }
    }
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
