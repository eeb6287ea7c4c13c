//! Signalhub-compatible HTTP relay client.
//!
//! Broadcast: `POST {server}/v1/{app}/{channel}` with the JSON message as body.
//! Subscribe: `GET  {server}/v1/{app}/{channel}` as a server-sent-event stream,
//! one `data:` payload per message. Every configured server receives every
//! broadcast; subscriptions merge the streams of all servers.

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    error::SwarmError,
    signaling::hub::{SignalHub, Subscription},
};

const SUBSCRIPTION_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct HttpHub {
    client: reqwest::Client,
    servers: Vec<String>,
    app: String,
}

impl HttpHub {
    pub fn new(app: impl Into<String>, servers: Vec<String>) -> Self {
        let servers = servers.into_iter().map(|s| s.trim_end_matches('/').to_string()).collect();
        Self { client: reqwest::Client::new(), servers, app: app.into() }
    }

    pub fn servers(&self) -> &[String] {
        &self.servers
    }

    fn url(&self, server: &str, channel: &str) -> String {
        format!("{server}/v1/{}/{channel}", self.app)
    }
}

#[async_trait]
impl SignalHub for HttpHub {
    async fn subscribe(&self, channel: &str) -> Result<Subscription, SwarmError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let mut tasks = Vec::with_capacity(self.servers.len());
        for server in &self.servers {
            let url = self.url(server, channel);
            let response = self
                .client
                .get(&url)
                .header(reqwest::header::ACCEPT, "text/event-stream")
                .send()
                .await
                .and_then(|r| r.error_for_status());
            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    warn!("signalhub subscribe {url} failed: {e}");
                    continue;
                }
            };
            let tx = tx.clone();
            let task = tokio::spawn(async move {
                let mut body = response.bytes_stream();
                let mut decoder = SseDecoder::default();
                while let Some(chunk) = body.next().await {
                    let chunk = match chunk {
                        Ok(c) => c,
                        Err(e) => {
                            debug!("signalhub stream {url} ended: {e}");
                            return;
                        }
                    };
                    for payload in decoder.feed(&chunk) {
                        if tx.send(payload).await.is_err() {
                            return;
                        }
                    }
                }
            });
            tasks.push(task.abort_handle());
        }
        if tasks.is_empty() {
            return Err(SwarmError::Signaling(format!(
                "could not subscribe to {channel} on any signalhub"
            )));
        }
        Ok(Subscription::new(rx, tasks))
    }

    async fn broadcast(&self, channel: &str, payload: String) -> Result<(), SwarmError> {
        let mut last_err = None;
        let mut delivered = false;
        for server in &self.servers {
            let url = self.url(server, channel);
            let sent = self
                .client
                .post(&url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(payload.clone())
                .send()
                .await
                .and_then(|r| r.error_for_status());
            match sent {
                Ok(_) => delivered = true,
                Err(e) => {
                    debug!("signalhub broadcast {url} failed: {e}");
                    last_err = Some(e.to_string());
                }
            }
        }
        if delivered {
            Ok(())
        } else {
            Err(SwarmError::Signaling(
                last_err.unwrap_or_else(|| "no signalhub servers configured".into()),
            ))
        }
    }
}

/// Incremental `text/event-stream` decoder yielding each event's data.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buf: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub(crate) fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data.push(value.strip_prefix(' ').unwrap_or(value).to_string());
            }
            // Comments (`:`), `event:`, `id:` and `retry:` lines carry nothing we use.
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_events_split_across_chunks() {
        let mut d = SseDecoder::default();
        assert!(d.feed(b"data: {\"a\"").is_empty());
        assert!(d.feed(b":1}\n").is_empty());
        assert_eq!(d.feed(b"\n"), vec!["{\"a\":1}".to_string()]);
    }

    #[test]
    fn ignores_comments_and_other_fields() {
        let mut d = SseDecoder::default();
        let events = d.feed(b": keepalive\n\nevent: message\nid: 7\ndata: x\n\n");
        assert_eq!(events, vec!["x".to_string()]);
    }

    #[test]
    fn joins_multiline_data_and_handles_crlf() {
        let mut d = SseDecoder::default();
        let events = d.feed(b"data: one\r\ndata: two\r\n\r\n");
        assert_eq!(events, vec!["one\ntwo".to_string()]);
    }

    #[test]
    fn urls_follow_signalhub_layout() {
        let hub = HttpHub::new("dat-webrtc", vec!["https://hub.example.org/".into()]);
        assert_eq!(
            hub.url(&hub.servers()[0], "abcd"),
            "https://hub.example.org/v1/dat-webrtc/abcd"
        );
    }
}
