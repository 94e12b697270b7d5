use crate::filter::Match;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineStatus {
    #[default]
    Unknown,
    Unauthorized,
    Authorized,
    Invalid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceProto {
    Tcp,
    Udp,
}

impl ServiceProto {
    pub fn from_portlist(proto: &str) -> Option<ServiceProto> {
        match proto {
            "tcp" => Some(ServiceProto::Tcp),
            "udp" => Some(ServiceProto::Udp),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub proto: ServiceProto,
    pub port: u16,
    #[serde(default)]
    pub description: String,
}

/// Connectivity findings reported by the engine's path discovery.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NetInfo {
    #[serde(default)]
    pub mapping_varies_by_dest_ip: Option<bool>,
    #[serde(default)]
    pub working_udp: Option<bool>,
    #[serde(default)]
    pub preferred_derp: u16,
    #[serde(default)]
    pub link_type: String,
}

/// Node description advertised to the control plane.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Hostinfo {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub os_version: String,
    #[serde(default)]
    pub device_model: String,
    #[serde(default)]
    pub backend_log_id: String,
    #[serde(default)]
    pub frontend_log_id: String,
    #[serde(default)]
    pub routable_ips: Vec<IpNet>,
    #[serde(default)]
    pub request_tags: Vec<String>,
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub net_info: Option<NetInfo>,
}

impl Hostinfo {
    pub fn new() -> Hostinfo {
        Hostinfo {
            os: std::env::consts::OS.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    pub name: String,
    pub node_key: String,
    #[serde(default)]
    pub addresses: Vec<IpNet>,
    #[serde(default)]
    pub allowed_ips: Vec<IpNet>,
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub hostinfo: Hostinfo,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub last_seen: Option<i64>,
    #[serde(default)]
    pub keep_alive: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DerpNode {
    pub name: String,
    pub host: String,
    #[serde(default)]
    pub stun_only: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DerpRegion {
    pub region_id: u16,
    #[serde(default)]
    pub region_code: String,
    #[serde(default)]
    pub nodes: Vec<DerpNode>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DerpMap {
    #[serde(default)]
    pub regions: Vec<DerpRegion>,
}

/// DNS block of a network map, as sent by the control plane.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NetDns {
    #[serde(default)]
    pub nameservers: Vec<std::net::IpAddr>,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub per_domain: bool,
    #[serde(default)]
    pub proxied: bool,
}

/// Server-signed snapshot of the mesh. Never mutated once stored; the agent
/// replaces the whole value when the control plane sends a new one.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NetMap {
    pub name: String,
    #[serde(default)]
    pub node_key: String,
    #[serde(default)]
    pub addresses: Vec<IpNet>,
    #[serde(default)]
    pub peers: Vec<Peer>,
    #[serde(default)]
    pub packet_filter: Vec<Match>,
    #[serde(default)]
    pub dns: NetDns,
    #[serde(default)]
    pub derp_map: Option<DerpMap>,
    #[serde(default)]
    pub machine_status: MachineStatus,
    /// Unix seconds; 0 means the map never expires.
    #[serde(default)]
    pub expiry: i64,
}

impl NetMap {
    /// One line per peer added or removed relative to `old`. Empty when the
    /// peer sets are key-equal.
    pub fn concise_diff_from(&self, old: &NetMap) -> String {
        let new_keys: HashSet<&str> = self.peers.iter().map(|p| p.node_key.as_str()).collect();
        let old_keys: HashSet<&str> = old.peers.iter().map(|p| p.node_key.as_str()).collect();
        let mut lines = Vec::new();
        for peer in &self.peers {
            if !old_keys.contains(peer.node_key.as_str()) {
                lines.push(format!("added peer {} ({})", peer.name, short_key(&peer.node_key)));
            }
        }
        for peer in &old.peers {
            if !new_keys.contains(peer.node_key.as_str()) {
                lines.push(format!("removed peer {} ({})", peer.name, short_key(&peer.node_key)));
            }
        }
        lines.join("\n")
    }
}

fn short_key(key: &str) -> &str {
    key.get(..8).unwrap_or(key)
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PingResult {
    pub ip: String,
    #[serde(default)]
    pub node_ip: String,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub err: String,
    #[serde(default)]
    pub latency_seconds: f64,
}

/// OAuth-style token handed over by a frontend that completed login itself.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthToken {
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub expiry: i64,
}
