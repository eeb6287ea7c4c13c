use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SwarmError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("{transport} transport failed to listen: {reason}")]
    Listen { transport: String, reason: String },

    #[error("dial error: {0}")]
    Dial(String),

    #[error("connection timeout")]
    ConnectTimeout,

    #[error("signaling error: {0}")]
    Signaling(String),

    #[error("no transport registered for type {0:?}")]
    UnknownTransport(String),

    #[error("stream for peer {0} was already consumed")]
    StreamConsumed(String),

    #[error("discovery error: {0}")]
    Discovery(String),

    #[error("invalid peer uri: {0}")]
    InvalidPeerUri(String),

    #[error("stream handler error: {0}")]
    Handler(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("swarm already shut down")]
    Shutdown,
}

impl From<std::io::Error> for SwarmError {
    fn from(e: std::io::Error) -> Self {
        SwarmError::Io(e.to_string())
    }
}
