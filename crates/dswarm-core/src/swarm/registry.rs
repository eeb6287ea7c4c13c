//! Peer registry and the admission rules that guard it.
//!
//! Pure bookkeeping, no I/O: the coordinator task owns the only instance and
//! every mutation goes through it. [`PeerRegistry::set_state`] and
//! [`PeerRegistry::remove`] are the only writers of the connection counter.

use std::{
    collections::{HashMap, HashSet},
    fmt,
};

use tokio::sync::mpsc;

use crate::{
    peer::{Address, Dialer, PeerCandidate},
    topic::Topic,
};

/// Lifecycle of one registered peer.
#[derive(Debug)]
pub(crate) enum PeerState {
    /// Known, but with no way to dial it (or no application to hand it to).
    Discovered,
    Dialing,
    Connected {
        /// Feeds the application stream's `PeerContext::topics`.
        topics: mpsc::UnboundedSender<Topic>,
        /// Topic keys already known to the application stream.
        delivered: HashSet<String>,
    },
    Reconnecting,
    Abandoned,
}

impl PeerState {
    /// Whether this state counts against `max_connections`.
    fn holds_slot(&self) -> bool {
        matches!(self, PeerState::Dialing | PeerState::Connected { .. } | PeerState::Reconnecting)
    }

    fn status(&self) -> PeerStatus {
        match self {
            PeerState::Discovered => PeerStatus::Discovered,
            PeerState::Dialing => PeerStatus::Dialing,
            PeerState::Connected { .. } => PeerStatus::Connected,
            PeerState::Reconnecting => PeerStatus::Reconnecting,
            PeerState::Abandoned => PeerStatus::Abandoned,
        }
    }
}

/// Externally visible peer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Discovered,
    Dialing,
    Connected,
    Reconnecting,
    Abandoned,
}

#[derive(Debug)]
pub(crate) struct PeerEntry {
    pub id: String,
    pub topic: Option<Topic>,
    pub transport_type: Option<String>,
    pub address: Option<Address>,
    pub dialer: Option<Dialer>,
    /// Backoff index of the next redial.
    pub retries: u32,
    /// Bumped on every registration; reports carrying an older one are stale.
    pub generation: u64,
    pub state: PeerState,
}

/// Why a candidate was not registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    SelfConnection,
    Duplicate,
    ConnectionLimit,
    TopicNotJoined,
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DiscardReason::SelfConnection => "own id",
            DiscardReason::Duplicate => "already registered",
            DiscardReason::ConnectionLimit => "connection limit reached",
            DiscardReason::TopicNotJoined => "topic not joined",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Admission {
    Discard(DiscardReason),
    /// Already connected; the candidate brings a new topic for that link.
    Multiplex(Topic),
    Register,
}

/// Connection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwarmStats {
    pub connected: usize,
    pub connecting: usize,
    /// Admission queue length; nothing is ever queued.
    pub queued: usize,
    /// Registered peers, whatever their state.
    pub peers: usize,
}

#[derive(Debug)]
pub(crate) struct PeerRegistry {
    local_id: String,
    max_connections: usize,
    joined: HashMap<String, Topic>,
    peers: HashMap<String, PeerEntry>,
    total_connections: usize,
    next_generation: u64,
}

impl PeerRegistry {
    pub fn new(local_id: impl Into<String>, max_connections: usize) -> Self {
        Self {
            local_id: local_id.into(),
            max_connections,
            joined: HashMap::new(),
            peers: HashMap::new(),
            total_connections: 0,
            next_generation: 0,
        }
    }

    // ── Topics ────────────────────────────────────────────────────────────────

    /// Returns `false` if the topic was already joined.
    pub fn join(&mut self, topic: &Topic) -> bool {
        self.joined.insert(topic.hex(), topic.clone()).is_none()
    }

    pub fn is_joined(&self, topic: &Topic) -> bool {
        self.joined.contains_key(&topic.hex())
    }

    #[cfg(test)]
    pub fn joined_topics(&self) -> Vec<Topic> {
        self.joined.values().cloned().collect()
    }

    /// Forget `topic` and remove every peer registered under it.
    pub fn leave(&mut self, topic: &Topic) -> Vec<PeerEntry> {
        self.joined.remove(&topic.hex());
        let ids: Vec<String> = self
            .peers
            .values()
            .filter(|e| e.topic.as_ref() == Some(topic))
            .map(|e| e.id.clone())
            .collect();
        ids.iter().filter_map(|id| self.remove(id)).collect()
    }

    // ── Admission ─────────────────────────────────────────────────────────────

    pub fn assess(&self, candidate: &PeerCandidate) -> Admission {
        if candidate.id == self.local_id {
            return Admission::Discard(DiscardReason::SelfConnection);
        }

        let mut released = 0;
        if let Some(existing) = self.peers.get(&candidate.id) {
            if let PeerState::Connected { delivered, .. } = &existing.state {
                return match &candidate.topic {
                    Some(t) if self.is_joined(t) && !delivered.contains(&t.hex()) => {
                        Admission::Multiplex(t.clone())
                    }
                    _ => Admission::Discard(DiscardReason::Duplicate),
                };
            }
            if candidate.retries != Some(0) {
                return Admission::Discard(DiscardReason::Duplicate);
            }
            if existing.state.holds_slot() {
                released = 1;
            }
        }

        if self.max_connections > 0 && self.total_connections - released >= self.max_connections {
            return Admission::Discard(DiscardReason::ConnectionLimit);
        }

        if let Some(t) = &candidate.topic {
            if !self.is_joined(t) {
                return Admission::Discard(DiscardReason::TopicNotJoined);
            }
        }

        Admission::Register
    }

    /// Insert (or replace) the entry for `candidate.id` in `Discovered` state.
    /// Returns the new generation.
    pub fn register(&mut self, candidate: PeerCandidate, default_retries: u32) -> u64 {
        self.remove(&candidate.id);
        self.next_generation += 1;
        let generation = self.next_generation;
        self.peers.insert(
            candidate.id.clone(),
            PeerEntry {
                id: candidate.id,
                topic: candidate.topic,
                transport_type: candidate.transport_type,
                address: candidate.address,
                dialer: candidate.dialer,
                retries: candidate.retries.unwrap_or(default_retries),
                generation,
                state: PeerState::Discovered,
            },
        );
        generation
    }

    /// Deliver a multiplexed topic to the connected peer's application stream.
    pub fn multiplex(&mut self, id: &str, topic: &Topic) -> bool {
        let Some(PeerEntry { state: PeerState::Connected { topics, delivered }, .. }) =
            self.peers.get_mut(id)
        else {
            return false;
        };
        delivered.insert(topic.hex());
        topics.send(topic.clone()).is_ok()
    }

    // ── Entries ───────────────────────────────────────────────────────────────

    #[cfg(test)]
    pub fn get(&self, id: &str) -> Option<&PeerEntry> {
        self.peers.get(id)
    }

    /// The entry for `id`, only if it is still the registration `generation`
    /// refers to.
    pub fn current(&mut self, id: &str, generation: u64) -> Option<&mut PeerEntry> {
        self.peers.get_mut(id).filter(|e| e.generation == generation)
    }

    pub fn status(&self, id: &str) -> Option<PeerStatus> {
        self.peers.get(id).map(|e| e.state.status())
    }

    /// Move `id` to `state`, keeping the connection counter in step.
    pub fn set_state(&mut self, id: &str, state: PeerState) -> Option<&mut PeerEntry> {
        let entry = self.peers.get_mut(id)?;
        match (entry.state.holds_slot(), state.holds_slot()) {
            (false, true) => self.total_connections += 1,
            (true, false) => self.total_connections -= 1,
            _ => {}
        }
        entry.state = state;
        Some(entry)
    }

    pub fn remove(&mut self, id: &str) -> Option<PeerEntry> {
        let entry = self.peers.remove(id)?;
        if entry.state.holds_slot() {
            self.total_connections -= 1;
        }
        Some(entry)
    }

    /// Forget every topic and peer.
    pub fn clear(&mut self) -> (Vec<Topic>, Vec<PeerEntry>) {
        let topics = self.joined.drain().map(|(_, t)| t).collect();
        let entries = self.peers.drain().map(|(_, e)| e).collect();
        self.total_connections = 0;
        (topics, entries)
    }

    // ── Counters ──────────────────────────────────────────────────────────────

    #[cfg(test)]
    pub fn total_connections(&self) -> usize {
        self.total_connections
    }

    pub fn stats(&self) -> SwarmStats {
        let connected = self
            .peers
            .values()
            .filter(|e| matches!(e.state, PeerState::Connected { .. }))
            .count();
        SwarmStats {
            connected,
            connecting: self.total_connections - connected,
            queued: 0,
            peers: self.peers.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(name: &str) -> Topic {
        Topic::from_name(name)
    }

    fn registry(max: usize) -> PeerRegistry {
        let mut r = PeerRegistry::new("me", max);
        r.join(&topic("a"));
        r
    }

    fn connected() -> (PeerState, mpsc::UnboundedReceiver<Topic>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut delivered = HashSet::new();
        delivered.insert(topic("a").hex());
        (PeerState::Connected { topics: tx, delivered }, rx)
    }

    #[test]
    fn join_is_idempotent() {
        let mut r = registry(0);
        assert!(!r.join(&topic("a")));
        assert!(r.join(&topic("b")));
        assert_eq!(r.joined_topics().len(), 2);
    }

    #[test]
    fn rejects_own_id() {
        let r = registry(0);
        let c = PeerCandidate::new("me").with_topic(topic("a"));
        assert_eq!(r.assess(&c), Admission::Discard(DiscardReason::SelfConnection));
    }

    #[test]
    fn rejects_unjoined_topic() {
        let r = registry(0);
        let c = PeerCandidate::new("x").with_topic(topic("zzz"));
        assert_eq!(r.assess(&c), Admission::Discard(DiscardReason::TopicNotJoined));
    }

    #[test]
    fn inbound_candidates_need_no_topic() {
        let r = registry(0);
        assert_eq!(r.assess(&PeerCandidate::new("x")), Admission::Register);
    }

    #[test]
    fn duplicate_is_discarded_unless_forced() {
        let mut r = registry(0);
        r.register(PeerCandidate::new("x").with_topic(topic("a")), 4);
        r.set_state("x", PeerState::Abandoned);

        let again = PeerCandidate::new("x").with_topic(topic("a"));
        assert_eq!(r.assess(&again), Admission::Discard(DiscardReason::Duplicate));
        assert_eq!(r.assess(&again.clone().with_retries(1)), Admission::Discard(DiscardReason::Duplicate));
        assert_eq!(r.assess(&again.with_retries(0)), Admission::Register);
    }

    #[test]
    fn forced_candidate_never_readmits_a_connected_peer() {
        let mut r = registry(0);
        r.register(PeerCandidate::new("x").with_topic(topic("a")), 4);
        let (state, _rx) = connected();
        r.set_state("x", state);
        let c = PeerCandidate::new("x").with_topic(topic("a")).with_retries(0);
        assert_eq!(r.assess(&c), Admission::Discard(DiscardReason::Duplicate));
    }

    #[test]
    fn registry_holds_one_entry_per_id() {
        let mut r = registry(0);
        let g1 = r.register(PeerCandidate::new("x"), 4);
        let g2 = r.register(PeerCandidate::new("x").with_retries(0), 4);
        assert!(g2 > g1);
        assert_eq!(r.stats().peers, 1);
        assert!(r.current("x", g1).is_none());
        assert_eq!(r.current("x", g2).unwrap().retries, 0);
    }

    #[test]
    fn counter_follows_slot_holding_states() {
        let mut r = registry(0);
        r.register(PeerCandidate::new("x"), 4);
        assert_eq!(r.total_connections(), 0);
        r.set_state("x", PeerState::Dialing);
        assert_eq!(r.total_connections(), 1);
        let (state, _rx) = connected();
        r.set_state("x", state);
        r.set_state("x", PeerState::Reconnecting);
        assert_eq!(r.total_connections(), 1);
        r.set_state("x", PeerState::Abandoned);
        assert_eq!(r.total_connections(), 0);
        r.set_state("x", PeerState::Dialing);
        r.remove("x");
        assert_eq!(r.total_connections(), 0);
    }

    #[test]
    fn limit_counts_pending_attempts() {
        let mut r = registry(1);
        r.register(PeerCandidate::new("x").with_topic(topic("a")), 4);
        r.set_state("x", PeerState::Dialing);
        let y = PeerCandidate::new("y").with_topic(topic("a"));
        assert_eq!(r.assess(&y), Admission::Discard(DiscardReason::ConnectionLimit));
        assert_eq!(r.stats(), SwarmStats { connected: 0, connecting: 1, queued: 0, peers: 1 });
    }

    #[test]
    fn replacing_an_attempt_frees_its_own_slot() {
        let mut r = registry(1);
        r.register(PeerCandidate::new("x").with_topic(topic("a")), 4);
        r.set_state("x", PeerState::Reconnecting);
        let forced = PeerCandidate::new("x").with_topic(topic("a")).with_retries(0);
        assert_eq!(r.assess(&forced), Admission::Register);
        r.register(forced, 4);
        assert_eq!(r.total_connections(), 0);
    }

    #[test]
    fn multiplexes_new_topic_once() {
        let mut r = registry(0);
        r.join(&topic("b"));
        r.register(PeerCandidate::new("x").with_topic(topic("a")), 4);
        let (state, mut rx) = connected();
        r.set_state("x", state);

        let on_b = PeerCandidate::new("x").with_topic(topic("b"));
        assert_eq!(r.assess(&on_b), Admission::Multiplex(topic("b")));
        assert!(r.multiplex("x", &topic("b")));
        assert_eq!(rx.try_recv().unwrap(), topic("b"));

        assert_eq!(r.assess(&on_b), Admission::Discard(DiscardReason::Duplicate));
        let on_a = PeerCandidate::new("x").with_topic(topic("a"));
        assert_eq!(r.assess(&on_a), Admission::Discard(DiscardReason::Duplicate));
        assert_eq!(r.total_connections(), 1);
    }

    #[test]
    fn no_multiplexing_onto_unjoined_topic() {
        let mut r = registry(0);
        r.register(PeerCandidate::new("x").with_topic(topic("a")), 4);
        let (state, _rx) = connected();
        r.set_state("x", state);
        let c = PeerCandidate::new("x").with_topic(topic("c"));
        assert_eq!(r.assess(&c), Admission::Discard(DiscardReason::Duplicate));
    }

    #[test]
    fn leave_removes_topic_peers_only() {
        let mut r = registry(0);
        r.join(&topic("b"));
        r.register(PeerCandidate::new("x").with_topic(topic("a")), 4);
        r.register(PeerCandidate::new("y").with_topic(topic("b")), 4);
        r.register(PeerCandidate::new("z"), 4);
        r.set_state("x", PeerState::Dialing);

        let removed = r.leave(&topic("a"));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, "x");
        assert!(!r.is_joined(&topic("a")));
        assert_eq!(r.total_connections(), 0);
        assert_eq!(r.stats().peers, 2);
    }

    #[test]
    fn default_retries_apply_only_when_unset() {
        let mut r = registry(0);
        r.register(PeerCandidate::new("x"), 4);
        r.register(PeerCandidate::new("y").with_retries(1), 4);
        assert_eq!(r.get("x").unwrap().retries, 4);
        assert_eq!(r.get("y").unwrap().retries, 1);
    }
}
