//! One connection attempt and its supervision, run as its own task.
//!
//! The task dials, hands the transport stream's context to the application,
//! splices the two streams and reports back to the coordinator. It never
//! touches the registry; every outcome travels as a [`Report`].

use std::sync::Arc;

use tokio::{
    io::{split, AsyncWriteExt},
    sync::mpsc,
};

use crate::{
    error::SwarmError,
    peer::{Address, BoxStream, Dialer, PeerContext, StreamHandler},
    topic::Topic,
};

#[derive(Debug)]
pub(crate) enum Report {
    /// Transport and application streams are up and spliced.
    Opened { id: String, generation: u64, topics: mpsc::UnboundedSender<Topic> },
    /// The attempt failed or the splice finished.
    Ended { id: String, generation: u64, error: Option<SwarmError> },
    /// A backoff timer fired.
    RedialDue { id: String, generation: u64 },
}

pub(crate) struct ConnectionTask {
    pub id: String,
    pub generation: u64,
    pub topic: Option<Topic>,
    pub transport_type: Option<String>,
    pub address: Option<Address>,
    pub dialer: Dialer,
    pub handler: Arc<dyn StreamHandler>,
}

impl ConnectionTask {
    pub async fn run(self, reports: mpsc::UnboundedSender<Report>) {
        let error = self.open_and_splice(&reports).await.err();
        let _ = reports.send(Report::Ended { id: self.id, generation: self.generation, error });
    }

    async fn open_and_splice(&self, reports: &mpsc::UnboundedSender<Report>) -> Result<(), SwarmError> {
        let transport = self.dialer.dial().await?;
        let (topics_tx, topics_rx) = mpsc::unbounded_channel();
        let app = self.handler.open(PeerContext {
            id: self.id.clone(),
            topic: self.topic.clone(),
            transport_type: self.transport_type.clone(),
            address: self.address.clone(),
            topics: topics_rx,
        })?;
        let _ = reports.send(Report::Opened {
            id: self.id.clone(),
            generation: self.generation,
            topics: topics_tx,
        });
        splice(transport, app).await
    }
}

/// Pipe bytes both ways until either direction finishes, then drop both
/// streams.
pub(crate) async fn splice(transport: BoxStream, app: BoxStream) -> Result<(), SwarmError> {
    let (mut transport_rx, mut transport_tx) = split(transport);
    let (mut app_rx, mut app_tx) = split(app);
    let result = tokio::select! {
        r = tokio::io::copy(&mut transport_rx, &mut app_tx) => r,
        r = tokio::io::copy(&mut app_rx, &mut transport_tx) => r,
    };
    let _ = app_tx.shutdown().await;
    let _ = transport_tx.shutdown().await;
    result.map(|_| ()).map_err(SwarmError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn splice_pipes_both_directions() {
        let (transport, mut remote) = duplex(64);
        let (app, mut local) = duplex(64);
        let task = tokio::spawn(splice(Box::new(transport), Box::new(app)));

        remote.write_all(b"from-remote").await.unwrap();
        let mut buf = [0u8; 11];
        local.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"from-remote");

        local.write_all(b"from-app").await.unwrap();
        let mut buf = [0u8; 8];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"from-app");

        drop(remote);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn splice_ends_when_application_closes() {
        let (transport, mut remote) = duplex(64);
        let (app, local) = duplex(64);
        let task = tokio::spawn(splice(Box::new(transport), Box::new(app)));

        drop(local);
        task.await.unwrap().unwrap();
        let mut buf = Vec::new();
        remote.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn task_reports_dial_failure() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler: Arc<dyn StreamHandler> =
            Arc::new(|_ctx: PeerContext| -> Result<BoxStream, SwarmError> {
                Ok(Box::new(duplex(8).0))
            });
        let task = ConnectionTask {
            id: "x".into(),
            generation: 3,
            topic: None,
            transport_type: None,
            address: None,
            dialer: Dialer::new(|| async { Err::<BoxStream, _>(SwarmError::Dial("refused".into())) }),
            handler,
        };
        task.run(tx).await;
        match rx.recv().await.unwrap() {
            Report::Ended { id, generation, error } => {
                assert_eq!(id, "x");
                assert_eq!(generation, 3);
                assert_eq!(error, Some(SwarmError::Dial("refused".into())));
            }
            other => panic!("unexpected report {other:?}"),
        }
    }
}
