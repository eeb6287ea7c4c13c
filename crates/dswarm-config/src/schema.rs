// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level node configuration.
///
/// ```yaml
/// swarm:
///   max_connections: 32
///   listen_port: 3282
/// topics: [my-feed]
/// peers:
///   - tcp://10.0.0.7:3282
/// announce: true
/// discovery:
///   servers: [https://peers.example.org]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub swarm: SwarmSection,
    /// Topic names joined at startup. Valid hex is taken as the raw
    /// discovery key; anything else is hashed.
    #[serde(default)]
    pub topics: Vec<String>,
    /// Static peer URIs: `tcp://host:port` or `wrtc://host/id`.
    #[serde(default)]
    pub peers: Vec<String>,
    /// Advertise this node for every joined topic instead of only looking up.
    #[serde(default)]
    pub announce: bool,
    #[serde(default)]
    pub discovery: DiscoverySection,
}

fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_reconnect_schedule_ms() -> Vec<u64> {
    vec![1000, 1000, 5000, 15000]
}
fn default_retries() -> u32 {
    4
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmSection {
    /// Hex node id. A random 32-byte id is generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Upper bound on dialing plus connected peers; 0 means unbounded.
    #[serde(default)]
    pub max_connections: usize,
    /// Log peer lifecycle at info instead of trace.
    #[serde(default)]
    pub debug: bool,
    /// 0 lets the OS pick.
    #[serde(default)]
    pub listen_port: u16,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Delay before each successive redial of a dropped peer.
    #[serde(default = "default_reconnect_schedule_ms")]
    pub reconnect_schedule_ms: Vec<u64>,
    /// Backoff index a peer starts from. Equal to the schedule length, a
    /// dropped peer is abandoned straight away.
    #[serde(default = "default_retries")]
    pub default_retries: u32,
}

impl Default for SwarmSection {
    fn default() -> Self {
        Self {
            id: None,
            max_connections: 0,
            debug: false,
            listen_port: 0,
            connect_timeout_secs: default_connect_timeout_secs(),
            reconnect_schedule_ms: default_reconnect_schedule_ms(),
            default_retries: default_retries(),
        }
    }
}

impl SwarmSection {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn default_refresh_secs() -> u64 {
    60
}

/// HTTP peer directories consulted for every joined topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoverySection {
    #[serde(default)]
    pub servers: Vec<String>,
    /// Seconds between lookups while a topic stays joined.
    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self { servers: Vec::new(), refresh_secs: default_refresh_secs() }
    }
}

impl DiscoverySection {
    pub fn refresh(&self) -> Duration {
        Duration::from_secs(self.refresh_secs)
    }
}
