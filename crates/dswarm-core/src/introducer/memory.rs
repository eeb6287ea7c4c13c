//! In-memory directory introducer with no networking, for tests, demos
//! and swarms that run in the same process.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tokio::{sync::broadcast, task::AbortHandle};
use tracing::debug;

use crate::{
    introducer::{Introducer, JoinContext},
    peer::{Address, PeerCandidate},
    topic::Topic,
};

const ANNOUNCE_CHANNEL_CAPACITY: usize = 64;

/// One node's advertised reachability under a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub id: String,
    pub transport_type: String,
    pub address: Address,
}

#[derive(Debug)]
struct TopicEntry {
    records: BTreeMap<String, Announcement>,
    tx: broadcast::Sender<Announcement>,
}

impl TopicEntry {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(ANNOUNCE_CHANNEL_CAPACITY);
        Self { records: BTreeMap::new(), tx }
    }
}

/// Thread-safe shared directory: topic hex → announced peers.
///
/// Clones share the same `Arc<Mutex<…>>` so that swarms constructed in the
/// same process see each other's announcements.
#[derive(Debug, Clone, Default)]
pub struct MemoryDirectory {
    topics: Arc<Mutex<HashMap<String, TopicEntry>>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn announce(&self, topic: &Topic, announcement: Announcement) {
        let mut g = self.topics.lock().unwrap();
        let entry = g.entry(topic.hex()).or_insert_with(TopicEntry::new);
        entry.records.insert(announcement.id.clone(), announcement.clone());
        let _ = entry.tx.send(announcement);
    }

    pub fn withdraw(&self, topic: &Topic, id: &str) {
        let mut g = self.topics.lock().unwrap();
        if let Some(entry) = g.get_mut(&topic.hex()) {
            entry.records.remove(id);
        }
    }

    pub fn peers(&self, topic: &Topic) -> Vec<Announcement> {
        let g = self.topics.lock().unwrap();
        g.get(&topic.hex())
            .map(|e| e.records.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot plus live feed, taken under one lock so nothing falls between.
    fn watch(&self, topic: &Topic) -> (Vec<Announcement>, broadcast::Receiver<Announcement>) {
        let mut g = self.topics.lock().unwrap();
        let entry = g.entry(topic.hex()).or_insert_with(TopicEntry::new);
        (entry.records.values().cloned().collect(), entry.tx.subscribe())
    }
}

#[derive(Debug)]
struct Joined {
    feed: AbortHandle,
    announced_as: Option<String>,
}

/// Introducer backed by a [`MemoryDirectory`]. Announces this node under the
/// address its `transport_type` transport is listening on.
pub struct MemoryIntroducer {
    directory: MemoryDirectory,
    transport_type: String,
    joined: Mutex<HashMap<String, Joined>>,
}

impl MemoryIntroducer {
    pub fn new(directory: MemoryDirectory, transport_type: impl Into<String>) -> Self {
        Self {
            directory,
            transport_type: transport_type.into(),
            joined: Mutex::new(HashMap::new()),
        }
    }
}

fn candidate(topic: &Topic, a: Announcement) -> PeerCandidate {
    PeerCandidate::new(a.id)
        .with_topic(topic.clone())
        .with_transport(a.transport_type, a.address)
}

#[async_trait]
impl Introducer for MemoryIntroducer {
    async fn join(&self, topic: &Topic, ctx: JoinContext) {
        let key = topic.hex();
        if self.joined.lock().unwrap().contains_key(&key) {
            return;
        }

        let mut announced_as = None;
        if ctx.options.announce {
            match ctx.addresses.get(&self.transport_type) {
                Some(address) => {
                    self.directory.announce(
                        topic,
                        Announcement {
                            id: ctx.local_id.clone(),
                            transport_type: self.transport_type.clone(),
                            address: address.clone(),
                        },
                    );
                    announced_as = Some(ctx.local_id.clone());
                }
                None => debug!(
                    topic = %key,
                    "not announcing: no {} transport is listening", self.transport_type
                ),
            }
        }

        let (snapshot, mut rx) = self.directory.watch(topic);
        let topic = topic.clone();
        let sink = ctx.sink;
        let feed = tokio::spawn(async move {
            for a in snapshot {
                if sink.emit(candidate(&topic, a)).is_err() {
                    return;
                }
            }
            loop {
                match rx.recv().await {
                    Ok(a) => {
                        if sink.emit(candidate(&topic, a)).is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(topic = %topic, "directory feed lagged by {n}");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        })
        .abort_handle();

        self.joined.lock().unwrap().insert(key, Joined { feed, announced_as });
    }

    async fn leave(&self, topic: &Topic) {
        let Some(joined) = self.joined.lock().unwrap().remove(&topic.hex()) else {
            return;
        };
        joined.feed.abort();
        if let Some(id) = joined.announced_as {
            self.directory.withdraw(topic, &id);
        }
    }
}
