use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-peer line of an aggregate status report. Engine-side stats and
/// netmap-side metadata land in the same entry, keyed by node key.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerSummary {
    #[serde(default)]
    pub in_network_map: bool,
    #[serde(default)]
    pub in_engine: bool,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub tail_addr: String,
    #[serde(default)]
    pub host_name: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub keep_alive: bool,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub last_seen: i64,
    #[serde(default)]
    pub rx_bytes: u64,
    #[serde(default)]
    pub tx_bytes: u64,
    #[serde(default)]
    pub last_handshake: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Status {
    #[serde(default)]
    pub peers: BTreeMap<String, PeerSummary>,
}

/// Accumulates an aggregate status from multiple reporters.
#[derive(Default)]
pub struct StatusBuilder {
    status: Status,
}

impl StatusBuilder {
    pub fn add_peer(&mut self, node_key: &str, update: impl FnOnce(&mut PeerSummary)) {
        update(self.status.peers.entry(node_key.to_string()).or_default());
    }

    pub fn status(self) -> Status {
        self.status
    }
}
