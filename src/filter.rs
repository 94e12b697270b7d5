use ipnet::{IpNet, Ipv4Net};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub first: u16,
    pub last: u16,
}

impl PortRange {
    pub const ANY: PortRange = PortRange { first: 0, last: 65535 };
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetPortRange {
    pub net: Ipv4Net,
    pub ports: PortRange,
}

/// A single packet-filter rule: traffic from any of `srcs` may reach the
/// destination networks and port ranges in `dsts`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Match {
    #[serde(default)]
    pub srcs: Vec<Ipv4Net>,
    #[serde(default)]
    pub dsts: Vec<NetPortRange>,
}

/// Packet filter handed to the engine. The filter only sees IPv4; traffic
/// outside `local_nets` is not subject to filtering at all.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Filter {
    pub matches: Vec<Match>,
    pub local_nets: Vec<Ipv4Net>,
}

impl Filter {
    /// The deny-everything filter installed before the first netmap arrives.
    pub fn allow_none() -> Filter {
        Filter::default()
    }

    pub fn new(matches: Vec<Match>, local_nets: Vec<Ipv4Net>) -> Filter {
        Filter { matches, local_nets }
    }

    pub fn is_allow_none(&self) -> bool {
        self.matches.is_empty() && self.local_nets.is_empty()
    }
}

/// Flattens CIDR lists into the IPv4 networks the filter can express.
/// IPv6 prefixes are dropped here.
pub fn local_nets(cidr_lists: &[&[IpNet]]) -> Vec<Ipv4Net> {
    let mut out = Vec::new();
    for cidrs in cidr_lists {
        for cidr in cidrs.iter() {
            if let IpNet::V4(net) = cidr {
                out.push(*net);
            }
        }
    }
    out
}

#[derive(Serialize)]
struct HashInputs<'a> {
    have_netmap: bool,
    addresses: &'a [IpNet],
    packet_filter: &'a [Match],
    advertise_routes: &'a [IpNet],
    shields_up: bool,
}

/// Stable structural hash over everything the installed filter depends on.
/// The encoding is self-describing JSON with a fixed field order, so equal
/// inputs hash equally across runs; a collision merely reinstalls a filter.
pub fn inputs_hash(
    have_netmap: bool,
    addresses: &[IpNet],
    packet_filter: &[Match],
    advertise_routes: &[IpNet],
    shields_up: bool,
) -> String {
    let inputs = HashInputs {
        have_netmap,
        addresses,
        packet_filter,
        advertise_routes,
        shields_up,
    };
    let encoded = serde_json::to_vec(&inputs).expect("filter hash inputs must serialize");
    hex::encode(Sha256::digest(encoded))
}
