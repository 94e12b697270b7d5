use crate::model::NetMap;
use ipnet::{IpNet, Ipv4Net};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use tracing::debug;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WgPeer {
    pub public_key: String,
    #[serde(default)]
    pub allowed_ips: Vec<IpNet>,
    #[serde(default)]
    pub endpoints: Vec<String>,
}

/// Tunnel configuration handed to the engine. The zero value means "tear the
/// interface down".
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WgConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub addresses: Vec<IpNet>,
    #[serde(default)]
    pub peers: Vec<WgPeer>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct WgConfigFlags {
    pub allow_default_route: bool,
    pub allow_subnet_routes: bool,
    pub hack_default_route: bool,
    pub allow_single_hosts: bool,
}

/// Derives the tunnel configuration from a netmap. `flags` decides which of
/// each peer's allowed IPs survive: its own /32s, subnet routes, and the
/// default route are all individually gated.
pub fn wg_config(nm: &NetMap, flags: WgConfigFlags) -> WgConfig {
    let mut cfg = WgConfig {
        name: nm.name.clone(),
        addresses: nm.addresses.clone(),
        peers: Vec::with_capacity(nm.peers.len()),
    };
    for peer in &nm.peers {
        let mut allowed = Vec::new();
        for cidr in &peer.allowed_ips {
            if cidr.prefix_len() == 0 {
                if !flags.allow_default_route {
                    debug!("dropping default route from {}", peer.name);
                    continue;
                }
                if flags.hack_default_route {
                    // Stand-in route for platforms that cannot take the
                    // default route whole yet.
                    allowed.push(hacked_default_route());
                    continue;
                }
                allowed.push(*cidr);
            } else if is_single_host(cidr, &peer.addresses) {
                if !flags.allow_single_hosts {
                    continue;
                }
                allowed.push(*cidr);
            } else {
                if !flags.allow_subnet_routes {
                    debug!("dropping subnet route {} from {}", cidr, peer.name);
                    continue;
                }
                allowed.push(*cidr);
            }
        }
        cfg.peers.push(WgPeer {
            public_key: peer.node_key.clone(),
            allowed_ips: allowed,
            endpoints: peer.endpoints.clone(),
        });
    }
    cfg
}

// A single-host route is a full-length prefix covering one of the peer's own
// addresses; anything else full-length is treated as a subnet route.
fn is_single_host(cidr: &IpNet, addresses: &[IpNet]) -> bool {
    let full = cidr.prefix_len() == cidr.max_prefix_len();
    full && addresses.iter().any(|a| a.addr() == cidr.addr())
}

fn hacked_default_route() -> IpNet {
    IpNet::V4(Ipv4Net::new(Ipv4Addr::new(10, 0, 0, 0), 8).expect("10.0.0.0/8 is a valid prefix"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Peer;

    fn peer_with_allowed(allowed: &[&str]) -> Peer {
        Peer {
            name: "a.example.net".to_string(),
            node_key: "key-aaaaaaaa".to_string(),
            addresses: vec!["100.64.0.2/32".parse().unwrap()],
            allowed_ips: allowed.iter().map(|s| s.parse().unwrap()).collect(),
            endpoints: vec!["203.0.113.10:41641".to_string()],
            ..Default::default()
        }
    }

    fn netmap_with(peer: Peer) -> NetMap {
        NetMap {
            name: "self.example.net".to_string(),
            addresses: vec!["100.64.0.1/32".parse().unwrap()],
            peers: vec![peer],
            ..Default::default()
        }
    }

    #[test]
    fn single_hosts_gated_by_flag() {
        let nm = netmap_with(peer_with_allowed(&["100.64.0.2/32"]));
        let off = wg_config(&nm, WgConfigFlags::default());
        assert!(off.peers[0].allowed_ips.is_empty());
        let on = wg_config(
            &nm,
            WgConfigFlags {
                allow_single_hosts: true,
                ..Default::default()
            },
        );
        assert_eq!(on.peers[0].allowed_ips, nm.peers[0].allowed_ips);
    }

    #[test]
    fn subnet_routes_gated_by_flag() {
        let nm = netmap_with(peer_with_allowed(&["100.64.0.2/32", "192.168.5.0/24"]));
        let flags = WgConfigFlags {
            allow_single_hosts: true,
            ..Default::default()
        };
        assert_eq!(wg_config(&nm, flags).peers[0].allowed_ips.len(), 1);
        let flags = WgConfigFlags {
            allow_single_hosts: true,
            allow_subnet_routes: true,
            ..Default::default()
        };
        assert_eq!(wg_config(&nm, flags).peers[0].allowed_ips.len(), 2);
    }

    #[test]
    fn default_route_dropped_without_flag_and_rewritten_with_hack() {
        let nm = netmap_with(peer_with_allowed(&["0.0.0.0/0"]));
        assert!(wg_config(&nm, WgConfigFlags::default()).peers[0]
            .allowed_ips
            .is_empty());

        let flags = WgConfigFlags {
            allow_default_route: true,
            ..Default::default()
        };
        assert_eq!(
            wg_config(&nm, flags).peers[0].allowed_ips,
            vec!["0.0.0.0/0".parse::<IpNet>().unwrap()]
        );

        let flags = WgConfigFlags {
            allow_default_route: true,
            hack_default_route: true,
            ..Default::default()
        };
        assert_eq!(
            wg_config(&nm, flags).peers[0].allowed_ips,
            vec!["10.0.0.0/8".parse::<IpNet>().unwrap()]
        );
    }

    #[test]
    fn foreign_full_length_prefix_is_a_subnet_route() {
        // A /32 that is not one of the peer's own addresses rides the
        // subnet-routes flag, not the single-hosts flag.
        let nm = netmap_with(peer_with_allowed(&["10.9.9.9/32"]));
        let flags = WgConfigFlags {
            allow_single_hosts: true,
            ..Default::default()
        };
        assert!(wg_config(&nm, flags).peers[0].allowed_ips.is_empty());
        let flags = WgConfigFlags {
            allow_subnet_routes: true,
            ..Default::default()
        };
        assert_eq!(wg_config(&nm, flags).peers[0].allowed_ips.len(), 1);
    }

    #[test]
    fn config_carries_self_addresses_and_endpoints() {
        let nm = netmap_with(peer_with_allowed(&[]));
        let cfg = wg_config(&nm, WgConfigFlags::default());
        assert_eq!(cfg.name, "self.example.net");
        assert_eq!(cfg.addresses, nm.addresses);
        assert_eq!(cfg.peers[0].endpoints, nm.peers[0].endpoints);
        assert_eq!(cfg.peers[0].public_key, "key-aaaaaaaa");
    }
}
