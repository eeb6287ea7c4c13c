//! Relayed publish/subscribe channel used for rendezvous.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tokio::{
    sync::{broadcast, mpsc},
    task::AbortHandle,
};
use tracing::debug;

use crate::error::SwarmError;

const HUB_CHANNEL_CAPACITY: usize = 256;

/// Backend-agnostic relay: every message broadcast on a channel reaches every
/// current subscriber of that channel, the sender included.
#[async_trait]
pub trait SignalHub: Send + Sync + 'static {
    async fn subscribe(&self, channel: &str) -> Result<Subscription, SwarmError>;
    async fn broadcast(&self, channel: &str, payload: String) -> Result<(), SwarmError>;
}

/// Live subscription to one channel. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<String>,
    tasks: Vec<AbortHandle>,
}

impl Subscription {
    /// `tasks` feed `rx` and are aborted when the subscription is dropped.
    pub fn new(rx: mpsc::Receiver<String>, tasks: Vec<AbortHandle>) -> Self {
        Self { rx, tasks }
    }

    /// Next raw message, or `None` once the channel has gone away.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// In-process hub; clones share channels.
#[derive(Debug, Clone, Default)]
pub struct MemoryHub {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .unwrap()
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl SignalHub for MemoryHub {
    async fn subscribe(&self, channel: &str) -> Result<Subscription, SwarmError> {
        let mut source = {
            let mut g = self.channels.lock().unwrap();
            g.entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(HUB_CHANNEL_CAPACITY).0)
                .subscribe()
        };
        let (tx, rx) = mpsc::channel(HUB_CHANNEL_CAPACITY);
        let channel = channel.to_string();
        let forward = tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(msg) => {
                        if tx.send(msg).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(channel = %channel, "hub subscriber lagged by {n}");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        Ok(Subscription::new(rx, vec![forward.abort_handle()]))
    }

    async fn broadcast(&self, channel: &str, payload: String) -> Result<(), SwarmError> {
        if let Some(tx) = self.channels.lock().unwrap().get(channel) {
            // No subscribers is not an error: the message simply reaches nobody.
            let _ = tx.send(payload);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber() {
        let hub = MemoryHub::new();
        let mut a = hub.subscribe("k").await.unwrap();
        let mut b = hub.subscribe("k").await.unwrap();
        hub.broadcast("k", "hello".into()).await.unwrap();
        assert_eq!(a.recv().await.as_deref(), Some("hello"));
        assert_eq!(b.recv().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let hub = MemoryHub::new();
        let mut a = hub.subscribe("k1").await.unwrap();
        hub.broadcast("k2", "other".into()).await.unwrap();
        hub.broadcast("k1", "mine".into()).await.unwrap();
        assert_eq!(a.recv().await.as_deref(), Some("mine"));
    }

    #[tokio::test]
    async fn dropping_subscription_unsubscribes() {
        let hub = MemoryHub::new();
        let sub = hub.subscribe("k").await.unwrap();
        assert_eq!(hub.subscriber_count("k"), 1);
        drop(sub);
        // The forwarding task releases its receiver once it observes the abort.
        tokio::time::timeout(Duration::from_secs(1), async {
            while hub.subscriber_count("k") != 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}
