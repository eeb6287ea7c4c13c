pub mod error;
pub mod introducer;
pub mod peer;
pub mod signaling;
pub mod swarm;
pub mod topic;
pub mod transport;

pub use error::SwarmError;
pub use introducer::{Introducer, JoinContext, JoinOptions};
pub use peer::{
    Address, BoxStream, Dialer, DuplexStream, PeerCandidate, PeerContext, PeerSink,
    StreamHandler, TopicReceiver,
};
pub use swarm::{
    DiscardReason, ListenReport, PeerStatus, ReconnectPolicy, SwarmConfig, SwarmEvent,
    SwarmHandle, SwarmNode, SwarmStats,
};
pub use topic::Topic;
pub use transport::{ListenContext, Server, Transport, TransportMap};
