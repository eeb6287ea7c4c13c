//! Peer directory reached over HTTP.
//!
//! Lookup: `GET {server}/{topic hex}` answers a JSON array of peer URIs
//! (`tcp://host:port`, `wrtc://host/id`). The lookup repeats every refresh
//! period while the topic stays joined, re-emitting the whole list.
//!
//! Announce: `POST {server}/{topic hex}` with `{"tcp": uri, "wrtc": uri}`
//! (`false` for a transport that is not listening). The server answers the
//! same shape with the addresses it recorded for us; those, and what we
//! posted, are never emitted back.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::{
    error::SwarmError,
    introducer::{static_list::parse_peer_uri, Introducer, JoinContext},
    peer::PeerSink,
    signaling::WEBRTC,
    topic::Topic,
    transport::tcp::TCP,
};

pub const DEFAULT_REFRESH: Duration = Duration::from_secs(60);

type OwnAddresses = Arc<Mutex<HashSet<String>>>;

pub struct HttpIntroducer {
    client: reqwest::Client,
    server: String,
    refresh: Duration,
    own: OwnAddresses,
    /// Lookup task per joined topic; `None` while the join is still announcing.
    joined: Mutex<HashMap<String, Option<AbortHandle>>>,
}

impl HttpIntroducer {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            server: server.into().trim_end_matches('/').to_string(),
            refresh: DEFAULT_REFRESH,
            own: OwnAddresses::default(),
            joined: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_refresh(mut self, refresh: Duration) -> Self {
        self.refresh = refresh;
        self
    }

    fn url(&self, topic: &Topic) -> String {
        format!("{}/{}", self.server, topic.hex())
    }

    async fn announce(&self, url: &str, ctx: &JoinContext) -> Result<(), SwarmError> {
        let body = announce_body(ctx);
        self.own.lock().unwrap().extend(body.values().filter_map(|v| v.as_str().map(String::from)));

        let recorded: HashMap<String, Value> = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| SwarmError::Discovery(e.to_string()))?
            .json()
            .await
            .map_err(|e| SwarmError::Discovery(e.to_string()))?;
        let mut own = self.own.lock().unwrap();
        own.extend(recorded.into_values().filter_map(|v| v.as_str().map(String::from)));
        Ok(())
    }
}

/// This node's URIs as announced: a transport that is not listening is `false`.
fn announce_body(ctx: &JoinContext) -> serde_json::Map<String, Value> {
    let tcp = ctx
        .addresses
        .get(TCP)
        .filter(|a| a.port.is_some())
        .map(|a| json!(format!("tcp://{a}")))
        .unwrap_or(json!(false));
    let wrtc = ctx
        .addresses
        .get(WEBRTC)
        .map(|a| json!(format!("wrtc://{}/{}", a.host, ctx.local_id)))
        .unwrap_or(json!(false));
    let mut body = serde_json::Map::new();
    body.insert("tcp".into(), tcp);
    body.insert("wrtc".into(), wrtc);
    body
}

async fn fetch_peers(client: &reqwest::Client, url: &str) -> Result<Vec<String>, SwarmError> {
    client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| SwarmError::Discovery(e.to_string()))?
        .json()
        .await
        .map_err(|e| SwarmError::Discovery(e.to_string()))
}

struct Lookup {
    client: reqwest::Client,
    url: String,
    refresh: Duration,
    own: OwnAddresses,
    topic: Topic,
    local_id: String,
    sink: PeerSink,
}

impl Lookup {
    async fn run(self) {
        let mut ticks = tokio::time::interval(self.refresh);
        loop {
            ticks.tick().await;
            let uris = match fetch_peers(&self.client, &self.url).await {
                Ok(uris) => uris,
                Err(e) => {
                    warn!(topic = %self.topic, "peer lookup failed: {e}");
                    continue;
                }
            };
            debug!(topic = %self.topic, "directory listed {} peer(s)", uris.len());
            for uri in uris {
                if self.own.lock().unwrap().contains(&uri) {
                    continue;
                }
                let candidate = match parse_peer_uri(&uri) {
                    Ok(c) => c,
                    Err(e) => {
                        debug!("skipping listed peer: {e}");
                        continue;
                    }
                };
                if candidate.id == self.local_id {
                    continue;
                }
                if self.sink.emit(candidate.with_topic(self.topic.clone())).is_err() {
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl Introducer for HttpIntroducer {
    async fn join(&self, topic: &Topic, ctx: JoinContext) {
        let key = topic.hex();
        {
            let mut joined = self.joined.lock().unwrap();
            if joined.contains_key(&key) {
                return;
            }
            joined.insert(key.clone(), None);
        }

        let url = self.url(topic);
        if ctx.options.announce {
            if let Err(e) = self.announce(&url, &ctx).await {
                warn!(topic = %topic, "announce to {} failed: {e}", self.server);
            }
        }

        let lookup = Lookup {
            client: self.client.clone(),
            url,
            refresh: self.refresh,
            own: self.own.clone(),
            topic: topic.clone(),
            local_id: ctx.local_id,
            sink: ctx.sink,
        };
        let task = tokio::spawn(lookup.run()).abort_handle();
        match self.joined.lock().unwrap().get_mut(&key) {
            Some(slot) => *slot = Some(task),
            // Left while announcing.
            None => task.abort(),
        }
    }

    async fn leave(&self, topic: &Topic) {
        if let Some(Some(task)) = self.joined.lock().unwrap().remove(&topic.hex()) {
            task.abort();
        }
    }
}

impl Drop for HttpIntroducer {
    fn drop(&mut self) {
        for task in self.joined.lock().unwrap().values().flatten() {
            task.abort();
        }
    }
}
