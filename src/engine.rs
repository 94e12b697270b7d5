use crate::dns::DnsMap;
use crate::filter::Filter;
use crate::model::{DerpMap, NetInfo, NetMap, PingResult};
use crate::router::RouterConfig;
use crate::status::StatusBuilder;
use crate::wgcfg::WgConfig;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The requested configuration is already in effect.
    #[error("no changes to configuration")]
    NoChanges,
    #[error("engine: {0}")]
    Failed(String),
}

/// Live per-peer statistics as the engine sees them.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub node_key: String,
    #[serde(default)]
    pub rx_bytes: u64,
    #[serde(default)]
    pub tx_bytes: u64,
    /// Unix seconds of the last completed handshake; 0 if never.
    #[serde(default)]
    pub last_handshake: i64,
}

/// Raw status snapshot posted by the engine to its status callback.
#[derive(Clone, Debug, Default)]
pub struct Status {
    pub local_addrs: Vec<String>,
    pub peers: Vec<PeerStatus>,
    pub derps: usize,
}

pub type StatusCallback = Box<dyn Fn(Result<Status, EngineError>) + Send + Sync>;
pub type NetInfoCallback = Box<dyn Fn(NetInfo) + Send + Sync>;
pub type PingCallback = Box<dyn FnOnce(PingResult) + Send>;

/// The data-plane engine surface the agent drives. Implementations terminate
/// tunnels, program routes and the resolver, and report status; the agent
/// owns deciding *what* to program.
pub trait Engine: Send + Sync {
    /// Applies tunnel and router configuration together. Returns
    /// `EngineError::NoChanges` when both are already in effect.
    fn reconfig(&self, wg: &WgConfig, router: &RouterConfig) -> Result<(), EngineError>;

    fn set_filter(&self, filter: Filter);

    /// The currently installed filter, if any.
    fn get_filter(&self) -> Option<Filter>;

    fn set_status_callback(&self, cb: StatusCallback);

    fn set_net_info_callback(&self, cb: NetInfoCallback);

    /// Asks for a fresh status; the engine answers through the callback.
    fn request_status(&self);

    fn set_network_map(&self, nm: &NetMap);

    /// `None` disables relaying entirely.
    fn set_derp_map(&self, map: Option<&DerpMap>);

    fn set_dns_map(&self, map: DnsMap);

    fn ping(&self, ip: IpAddr, cb: PingCallback);

    fn disco_public_key(&self) -> String;

    /// Contributes engine-side facts to an aggregate status report.
    fn update_status(&self, sb: &mut StatusBuilder);

    fn close(&self);

    /// Blocks until the engine has fully stopped after `close`.
    fn wait(&self);
}
