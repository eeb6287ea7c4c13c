//! Rendezvous transport over a relayed publish/subscribe channel.
//!
//! Two peers with no routable address meet on a relay channel and swap
//! connection descriptors:
//!
//! * topic side (`announce`): the channel is the topic's hex key. An
//!   announcing node keeps one live offer on it; whoever answers gets paired,
//!   and the offer is renewed right after every pairing.
//! * node side (`listen` / `connect`): the channel is a node's own id.
//!   `connect(peer)` offers on the peer's channel and waits for the peer's
//!   answer addressed back to us.
//!
//! A remote counts as connected only once its link is up. When two
//! announcing nodes see each other's offers, only the higher id answers.
//!
//! Every wait is bounded by the connect timeout. Half-formed links are dropped
//! on every failure path and subscriptions never outlive their caller.

pub mod hub;
#[cfg(feature = "http")]
pub mod http;
pub mod link;
pub mod message;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::oneshot, task::AbortHandle};
use tracing::{debug, warn};

use crate::{
    error::SwarmError,
    introducer::JoinContext,
    peer::{Address, BoxStream, Dialer, PeerCandidate, PeerSink},
    signaling::{
        hub::{SignalHub, Subscription},
        link::{Claim, ConnectedSet, LinkFactory, PendingLink, TrackedStream},
        message::{Descriptor, SignalMessage},
    },
    topic::Topic,
    transport::{ListenContext, Server, Transport},
};

/// Transport-type tag peers use to select this transport.
pub const WEBRTC: &str = "webrtc";

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

struct TopicSession {
    listener: AbortHandle,
    /// Our single outstanding offer on this topic, as published.
    offer: Option<(Descriptor, Box<dyn PendingLink>)>,
}

impl Drop for TopicSession {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

struct Shared {
    hub: Arc<dyn SignalHub>,
    links: Arc<dyn LinkFactory>,
    timeout: Duration,
    local_id: Mutex<Option<String>>,
    sessions: Mutex<HashMap<String, TopicSession>>,
    /// Remote ids with an established link.
    connected: ConnectedSet,
    /// Remote ids with a link still being set up.
    pending: ConnectedSet,
}

pub struct SignalingTransport {
    shared: Arc<Shared>,
}

impl SignalingTransport {
    pub fn new(hub: Arc<dyn SignalHub>, links: Arc<dyn LinkFactory>) -> Self {
        Self {
            shared: Arc::new(Shared {
                hub,
                links,
                timeout: DEFAULT_CONNECT_TIMEOUT,
                local_id: Mutex::new(None),
                sessions: Mutex::new(HashMap::new()),
                connected: ConnectedSet::default(),
                pending: ConnectedSet::default(),
            }),
        }
    }

    /// Must be called before the transport is shared.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.timeout = timeout;
        }
        self
    }

    /// Whether a link to `id` is up.
    pub fn is_connected(&self, id: &str) -> bool {
        self.shared.is_connected(id)
    }

    /// Whether a link to `id` is being set up.
    pub fn is_pending(&self, id: &str) -> bool {
        self.shared.is_pending(id)
    }

    /// Topics with a live session.
    pub fn announced(&self) -> usize {
        self.shared.sessions.lock().unwrap().len()
    }
}

impl Shared {
    fn set_local_id(&self, id: &str) {
        *self.local_id.lock().unwrap() = Some(id.to_string());
    }

    fn local_id(&self) -> String {
        self.local_id
            .lock()
            .unwrap()
            .get_or_insert_with(|| hex::encode(rand::random::<[u8; 32]>()))
            .clone()
    }

    fn is_connected(&self, id: &str) -> bool {
        self.connected.lock().unwrap().contains_key(id)
    }

    fn is_pending(&self, id: &str) -> bool {
        self.pending.lock().unwrap().contains_key(id)
    }

    async fn send(&self, channel: &str, msg: &SignalMessage) -> Result<(), SwarmError> {
        self.hub.broadcast(channel, msg.encode()?).await
    }

    async fn publish(&self, channel: &str, offer: Descriptor) -> Result<(), SwarmError> {
        debug!(topic = %channel, "broadcasting offer");
        self.send(channel, &SignalMessage::Offer { id: self.local_id(), offer }).await
    }

    /// Replace the session's outstanding offer with a fresh one and publish it.
    async fn broadcast_offer(&self, channel: &str) -> Result<(), SwarmError> {
        let (offer, link) = self.links.initiate()?;
        {
            let mut sessions = self.sessions.lock().unwrap();
            match sessions.get_mut(channel) {
                Some(session) => session.offer = Some((offer.clone(), link)),
                None => return Ok(()),
            }
        }
        self.publish(channel, offer).await
    }

    /// Publish the session's outstanding offer again, if it has one.
    async fn republish_offer(&self, channel: &str) -> Result<(), SwarmError> {
        match self.outstanding_offer(channel) {
            Some(offer) => self.publish(channel, offer).await,
            None => Ok(()),
        }
    }

    fn outstanding_offer(&self, channel: &str) -> Option<Descriptor> {
        let sessions = self.sessions.lock().unwrap();
        sessions.get(channel)?.offer.as_ref().map(|(offer, _)| offer.clone())
    }

    fn take_offer(&self, channel: &str) -> Option<(Descriptor, Box<dyn PendingLink>)> {
        self.sessions.lock().unwrap().get_mut(channel).and_then(|s| s.offer.take())
    }

    fn restore_offer(&self, channel: &str, offer: (Descriptor, Box<dyn PendingLink>)) {
        if let Some(session) = self.sessions.lock().unwrap().get_mut(channel) {
            session.offer.get_or_insert(offer);
        }
    }

    /// Wait for `link` under the connect timeout. The remote id moves from
    /// pending to connected once the link is up.
    async fn establish(
        &self,
        id: &str,
        link: Box<dyn PendingLink>,
        pending: Claim,
    ) -> Result<TrackedStream, SwarmError> {
        let outcome = tokio::time::timeout(self.timeout, link.established()).await;
        let stream = match outcome {
            Ok(Ok(stream)) => TrackedStream::new(stream, Claim::new(id, &self.connected)),
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(SwarmError::ConnectTimeout),
        };
        drop(pending);
        Ok(stream)
    }

    /// Answer `offer` on `channel`. The link is set up in the background; the
    /// returned dialer hands it out once it is up.
    async fn answer(
        self: &Arc<Self>,
        channel: &str,
        offerer: &str,
        offer: &Descriptor,
    ) -> Result<Dialer, SwarmError> {
        let (answer, link) = self.links.respond(offer)?;
        let pending = Claim::new(offerer, &self.pending);
        self.send(
            channel,
            &SignalMessage::Signal {
                id: self.local_id(),
                target: offerer.to_string(),
                signal: answer,
            },
        )
        .await?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let this = self.clone();
        let channel = channel.to_string();
        let id = offerer.to_string();
        tokio::spawn(async move {
            let outcome = this.establish(&id, link, pending).await;
            let failed = outcome.is_err();
            if let Err(e) = &outcome {
                debug!(peer = %id, "answered link failed: {e}");
            }
            let _ = ready_tx.send(outcome);
            // Lets the offerer meet us again on the next round.
            if failed {
                if let Err(e) = this.republish_offer(&channel).await {
                    debug!(topic = %channel, "could not republish offer: {e}");
                }
            }
        });

        let slot = Arc::new(Mutex::new(Some(ready_rx)));
        let offerer = offerer.to_string();
        Ok(Dialer::new(move || {
            let taken = slot.lock().unwrap().take();
            let id = offerer.clone();
            async move {
                let ready = taken.ok_or(SwarmError::StreamConsumed(id))?;
                let stream = ready
                    .await
                    .map_err(|_| SwarmError::Signaling("link setup abandoned".into()))??;
                Ok(Box::new(stream) as BoxStream)
            }
        }))
    }

    /// Answer every offer from an unlinked remote seen on `channel`, emitting
    /// a candidate per answer. Runs until the subscription or sink closes.
    async fn serve_offers(
        self: Arc<Self>,
        channel: String,
        topic: Option<Topic>,
        mut sub: Subscription,
        sink: PeerSink,
    ) {
        while let Some(raw) = sub.recv().await {
            let Some(msg) = SignalMessage::decode(&raw) else { continue };
            match msg {
                SignalMessage::Offer { id, offer } => {
                    let local = self.local_id();
                    if id == local || self.is_connected(&id) || self.is_pending(&id) {
                        continue;
                    }
                    // Both sides offering: the lower id waits to be answered.
                    if local < id {
                        if let Some(own) = self.outstanding_offer(&channel) {
                            if let Err(e) = self.publish(&channel, own).await {
                                debug!(topic = %channel, "could not republish offer: {e}");
                            }
                            continue;
                        }
                    }
                    let dialer = match self.answer(&channel, &id, &offer).await {
                        Ok(d) => d,
                        Err(e) => {
                            debug!(peer = %id, "not answering offer: {e}");
                            continue;
                        }
                    };
                    let mut candidate = PeerCandidate::new(id.clone())
                        .with_transport(WEBRTC, Address::host(id.as_str()))
                        .with_dialer(dialer);
                    candidate.topic = topic.clone();
                    if sink.emit(candidate).is_err() {
                        return;
                    }
                }
                SignalMessage::Signal { id, target, signal } => {
                    if topic.is_none() || target != self.local_id() {
                        continue;
                    }
                    let Some((published, mut link)) = self.take_offer(&channel) else { continue };
                    if let Err(e) = link.apply(&signal) {
                        debug!(peer = %id, "ignoring answer: {e}");
                        self.restore_offer(&channel, (published, link));
                        continue;
                    }
                    let pending = Claim::new(id.as_str(), &self.pending);
                    let this = self.clone();
                    let sink = sink.clone();
                    let topic = topic.clone();
                    tokio::spawn(async move {
                        match this.establish(&id, link, pending).await {
                            Ok(stream) => {
                                let mut candidate = PeerCandidate::new(id.clone())
                                    .with_transport(WEBRTC, Address::host(id.as_str()))
                                    .with_dialer(Dialer::once(id.as_str(), stream));
                                candidate.topic = topic;
                                let _ = sink.emit(candidate);
                            }
                            Err(e) => debug!(peer = %id, "link failed: {e}"),
                        }
                    });
                    if let Err(e) = self.broadcast_offer(&channel).await {
                        warn!(topic = %channel, "could not renew offer: {e}");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Transport for SignalingTransport {
    async fn listen(&self, _port: u16, ctx: ListenContext) -> Result<Server, SwarmError> {
        self.shared.set_local_id(&ctx.local_id);
        let sub = self.shared.hub.subscribe(&ctx.local_id).await.map_err(|e| {
            SwarmError::Listen { transport: WEBRTC.into(), reason: e.to_string() }
        })?;
        let task = tokio::spawn(self.shared.clone().serve_offers(
            ctx.local_id.clone(),
            None,
            sub,
            ctx.sink,
        ));
        debug!("signaling listening on channel {}", ctx.local_id);
        Ok(Server::new(Address::host(ctx.local_id), move || task.abort()))
    }

    async fn connect(
        &self,
        peer_id: &str,
        _address: Option<&Address>,
    ) -> Result<BoxStream, SwarmError> {
        let shared = &self.shared;
        let local = shared.local_id();
        let mut sub = shared.hub.subscribe(peer_id).await?;
        let (offer, mut link) = shared.links.initiate()?;
        let pending = Claim::new(peer_id, &shared.pending);
        shared.send(peer_id, &SignalMessage::Offer { id: local.clone(), offer }).await?;

        let answered = tokio::time::timeout(shared.timeout, async {
            loop {
                let raw = sub
                    .recv()
                    .await
                    .ok_or_else(|| SwarmError::Signaling("relay channel closed".into()))?;
                match SignalMessage::decode(&raw) {
                    Some(SignalMessage::Signal { id, target, signal })
                        if id == peer_id && target == local =>
                    {
                        match link.apply(&signal) {
                            Ok(()) => return Ok::<(), SwarmError>(()),
                            Err(e) => debug!(peer = %peer_id, "ignoring answer: {e}"),
                        }
                    }
                    _ => continue,
                }
            }
        })
        .await;
        drop(sub);
        match answered {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(SwarmError::ConnectTimeout),
        }

        let stream = shared.establish(peer_id, link, pending).await?;
        Ok(Box::new(stream))
    }

    async fn announce(&self, topic: &Topic, ctx: &JoinContext) -> Result<(), SwarmError> {
        self.shared.set_local_id(&ctx.local_id);
        let channel = topic.hex();
        if self.shared.sessions.lock().unwrap().contains_key(&channel) {
            return Ok(());
        }
        let sub = self.shared.hub.subscribe(&channel).await?;
        // The offer is in place before the listener sees any remote offer.
        let offer = if ctx.options.announce { Some(self.shared.links.initiate()?) } else { None };
        let published = offer.as_ref().map(|(descriptor, _)| descriptor.clone());
        {
            let mut sessions = self.shared.sessions.lock().unwrap();
            if sessions.contains_key(&channel) {
                return Ok(());
            }
            let listener = tokio::spawn(self.shared.clone().serve_offers(
                channel.clone(),
                Some(topic.clone()),
                sub,
                ctx.sink.clone(),
            ))
            .abort_handle();
            sessions.insert(channel.clone(), TopicSession { listener, offer });
        }
        if let Some(offer) = published {
            self.shared.publish(&channel, offer).await?;
        }
        Ok(())
    }

    async fn unannounce(&self, topic: &Topic) {
        self.shared.sessions.lock().unwrap().remove(&topic.hex());
    }
}
