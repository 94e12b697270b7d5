use crate::dns::DnsConfig;
use crate::prefs::{NetfilterMode, Prefs};
use crate::wgcfg::WgConfig;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Virtual address of the in-engine service endpoint (DNS proxy etc.);
/// always routed into the tunnel.
pub const SERVICE_IP: Ipv4Addr = Ipv4Addr::new(100, 100, 100, 100);

/// Routing and resolver configuration handed to the engine. The zero value
/// removes every route and restores the host resolver.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub local_addrs: Vec<IpNet>,
    #[serde(default)]
    pub routes: Vec<IpNet>,
    #[serde(default)]
    pub subnet_routes: Vec<IpNet>,
    #[serde(default)]
    pub snat_subnet_routes: bool,
    #[serde(default)]
    pub netfilter_mode: NetfilterMode,
    #[serde(default)]
    pub dns: DnsConfig,
}

/// Derives the router configuration from a tunnel configuration and prefs.
/// Routes are the union of all peers' allowed IPs plus the service address.
pub fn router_config(cfg: &WgConfig, prefs: &Prefs) -> RouterConfig {
    let mut rs = RouterConfig {
        local_addrs: cfg.addresses.iter().map(host_route).collect(),
        routes: Vec::new(),
        subnet_routes: prefs.advertise_routes.clone(),
        snat_subnet_routes: !prefs.no_snat,
        netfilter_mode: prefs.netfilter_mode,
        dns: DnsConfig::default(),
    };
    for peer in &cfg.peers {
        rs.routes.extend(peer.allowed_ips.iter().copied());
    }
    rs.routes.push(service_route());
    rs
}

// Interface addresses are installed as single-host prefixes regardless of
// the mask the control plane assigned them.
fn host_route(addr: &IpNet) -> IpNet {
    match addr {
        IpNet::V4(net) => {
            IpNet::V4(Ipv4Net::new(net.addr(), 32).expect("/32 is a valid prefix"))
        }
        IpNet::V6(net) => {
            IpNet::V6(Ipv6Net::new(net.addr(), 128).expect("/128 is a valid prefix"))
        }
    }
}

fn service_route() -> IpNet {
    IpNet::V4(Ipv4Net::new(SERVICE_IP, 32).expect("/32 is a valid prefix"))
}
