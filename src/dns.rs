use crate::model::NetMap;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;

/// Resolver configuration handed to the engine's router layer. The zero
/// value means "leave the host resolver alone".
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DnsConfig {
    #[serde(default)]
    pub nameservers: Vec<IpAddr>,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub per_domain: bool,
    #[serde(default)]
    pub proxied: bool,
}

/// Name-to-address bindings served by the in-engine resolver.
pub type DnsMap = HashMap<String, IpAddr>;

/// Binds every peer name, and the node's own name, to its first address.
pub fn dns_map(nm: &NetMap) -> DnsMap {
    let mut map = DnsMap::new();
    for peer in &nm.peers {
        bind(&mut map, &peer.name, &peer.addresses);
    }
    bind(&mut map, &nm.name, &nm.addresses);
    map
}

fn bind(map: &mut DnsMap, name: &str, addrs: &[IpNet]) {
    if name.is_empty() {
        return;
    }
    if let Some(first) = addrs.first() {
        map.insert(name.to_string(), first.addr());
    }
}

// Only the first address counts for DNS map purposes.
fn dns_cidrs_equal(new: &[IpNet], old: &[IpNet]) -> bool {
    if new.len() != old.len() {
        return false;
    }
    new.is_empty() || new[0] == old[0]
}

/// Whether two netmaps induce the same DNS map. Compares peers pairwise at
/// the same index, so a mere reordering reports "not equal"; the false
/// negative only costs a rebuild.
pub fn dns_maps_equal(new: Option<&NetMap>, old: Option<&NetMap>) -> bool {
    match (new, old) {
        (None, None) => true,
        (Some(_), None) | (None, Some(_)) => false,
        (Some(new), Some(old)) => {
            if new.peers.len() != old.peers.len() {
                return false;
            }
            if new.name != old.name {
                return false;
            }
            if !dns_cidrs_equal(&new.addresses, &old.addresses) {
                return false;
            }
            new.peers
                .iter()
                .zip(&old.peers)
                .all(|(n, o)| n.name == o.name && dns_cidrs_equal(&n.addresses, &o.addresses))
        }
    }
}

/// Search domains for proxied DNS: everything after the first dot of the
/// node's own name and of each peer name, deduplicated in insertion order.
pub fn domains_for_proxying(nm: &NetMap) -> Vec<String> {
    let mut domains = Vec::new();
    if let Some(idx) = nm.name.find('.') {
        domains.push(nm.name[idx + 1..].to_string());
    }
    for peer in &nm.peers {
        let Some(idx) = peer.name.find('.') else {
            continue;
        };
        let domain = &peer.name[idx + 1..];
        if !domains.iter().any(|d| d == domain) {
            domains.push(domain.to_string());
        }
    }
    domains
}
