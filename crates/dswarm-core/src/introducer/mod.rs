//! Discovery-source abstraction.
//!
//! An `Introducer` is the single seam between the swarm and whatever finds
//! peers for a topic (a DHT, a directory service, a static list, ...). It
//! never touches swarm state: candidates are pushed into the [`PeerSink`]
//! carried by the [`JoinContext`], and may be re-emitted any number of times.

#[cfg(feature = "http")]
pub mod http;
pub mod memory;
pub mod static_list;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::{
    peer::{Address, PeerSink},
    topic::Topic,
};

/// Per-join options supplied by the caller of `Swarm::join`.
#[derive(Debug, Clone, Default)]
pub struct JoinOptions {
    /// Advertise this node's reachability for the topic, not just look up.
    pub announce: bool,
}

/// Everything an introducer needs to serve one `join`.
#[derive(Debug, Clone)]
pub struct JoinContext {
    pub local_id: String,
    pub options: JoinOptions,
    /// Bound address of every listening transport, keyed by transport type.
    pub addresses: BTreeMap<String, Address>,
    pub sink: PeerSink,
}

#[async_trait]
pub trait Introducer: Send + Sync + 'static {
    /// Begin discovery (and announcement, if requested) for `topic`.
    ///
    /// Must return promptly: long-running lookups belong in a spawned task.
    /// A second `join` for a topic already joined is a no-op. Backend
    /// failures stay inside the introducer; they only mean fewer candidates.
    async fn join(&self, topic: &Topic, ctx: JoinContext);

    /// Stop discovery and withdraw announcements for `topic`. Tolerates
    /// topics that were never joined.
    async fn leave(&self, topic: &Topic);
}
