use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use dashmap::DashMap;
use ipnet::IpNet;
use serde::Serialize;

use super::config::NetworkConfig;
use crate::error::NetworkResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BgpPrefix {
    pub prefix: IpNet,
    pub nexthop: IpAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BgpPeer {
    pub address: IpAddr,
    pub asn: u32,
    pub password: String,
    pub holdtime: u64,
}

/// Advertised routes and peers, grouped by owner (a network).
pub trait RouteAdvertiser: Send + Sync {
    fn set_prefixes(&self, owner: &str, prefixes: Vec<BgpPrefix>) -> NetworkResult<()>;
    fn clear_prefixes(&self, owner: &str) -> NetworkResult<()>;
    fn set_peers(&self, owner: &str, peers: Vec<BgpPeer>) -> NetworkResult<()>;
    fn clear_peers(&self, owner: &str) -> NetworkResult<()>;
    fn prefixes(&self, owner: &str) -> Vec<BgpPrefix>;
}

/// In-process advertisement table, read by whatever speaker exports it.
#[derive(Debug, Default)]
pub struct BgpTable {
    prefixes: DashMap<String, Vec<BgpPrefix>>,
    peers: DashMap<String, Vec<BgpPeer>>,
}

impl BgpTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peers(&self, owner: &str) -> Vec<BgpPeer> {
        self.peers.get(owner).map(|p| p.clone()).unwrap_or_default()
    }
}

impl RouteAdvertiser for BgpTable {
    fn set_prefixes(&self, owner: &str, prefixes: Vec<BgpPrefix>) -> NetworkResult<()> {
        self.prefixes.insert(owner.to_string(), prefixes);
        Ok(())
    }

    fn clear_prefixes(&self, owner: &str) -> NetworkResult<()> {
        self.prefixes.remove(owner);
        Ok(())
    }

    fn set_peers(&self, owner: &str, peers: Vec<BgpPeer>) -> NetworkResult<()> {
        self.peers.insert(owner.to_string(), peers);
        Ok(())
    }

    fn clear_peers(&self, owner: &str) -> NetworkResult<()> {
        self.peers.remove(owner);
        Ok(())
    }

    fn prefixes(&self, owner: &str) -> Vec<BgpPrefix> {
        self.prefixes.get(owner).map(|p| p.clone()).unwrap_or_default()
    }
}

fn owner(network: &str) -> String {
    format!("network_{}", network)
}

/// Peers from `bgp.peers.<name>.*` keys. Entries without a parseable address or ASN are skipped.
pub fn peers_from_config(config: &NetworkConfig) -> Vec<BgpPeer> {
    let mut names: BTreeSet<String> = BTreeSet::new();
    for key in config.keys() {
        if let Some(rest) = key.strip_prefix("bgp.peers.") {
            if let Some((name, _)) = rest.split_once('.') {
                names.insert(name.to_string());
            }
        }
    }

    names
        .iter()
        .filter_map(|name| {
            let get = |field: &str| config.get(&format!("bgp.peers.{}.{}", name, field)).to_string();
            let address = get("address").parse::<IpAddr>().ok()?;
            let asn = get("asn").parse::<u32>().ok()?;
            let holdtime = get("holdtime").parse::<u64>().unwrap_or(180);
            Some(BgpPeer {
                address,
                asn,
                password: get("password"),
                holdtime,
            })
        })
        .collect()
}

fn nexthop(config: &NetworkConfig, v4: bool) -> IpAddr {
    let key = if v4 { "bgp.ipv4.nexthop" } else { "bgp.ipv6.nexthop" };
    match config.get(key).parse::<IpAddr>() {
        Ok(addr) => addr,
        Err(_) if v4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        Err(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

/// Prefixes a bridge advertises: non-NATed subnets and every forward listen address.
pub fn prefixes_for(config: &NetworkConfig, listen_addresses: &[IpAddr]) -> Vec<BgpPrefix> {
    let mut out = Vec::new();

    for (family, v4) in [("ipv4", true), ("ipv6", false)] {
        if config.is_true(&format!("{}.nat", family)) {
            continue;
        }
        if let Ok(net) = config.get(&format!("{}.address", family)).parse::<IpNet>() {
            out.push(BgpPrefix {
                prefix: net.trunc(),
                nexthop: nexthop(config, v4),
            });
        }
    }

    for addr in listen_addresses {
        let prefix = IpNet::from(*addr);
        out.push(BgpPrefix {
            prefix,
            nexthop: nexthop(config, addr.is_ipv4()),
        });
    }
    out
}

/// Refresh peers (when changed) and prefixes for a network.
pub fn bgp_setup(
    advertiser: &dyn RouteAdvertiser,
    network: &str,
    config: &NetworkConfig,
    old_config: Option<&NetworkConfig>,
    listen_addresses: &[IpAddr],
) -> NetworkResult<()> {
    let new_peers = peers_from_config(config);
    let peers_changed = old_config
        .map(|old| peers_from_config(old) != new_peers)
        .unwrap_or(true);
    if peers_changed {
        advertiser.clear_peers(&owner(network))?;
        if !new_peers.is_empty() {
            advertiser.set_peers(&owner(network), new_peers)?;
        }
    }

    bgp_setup_prefixes(advertiser, network, config, listen_addresses)
}

pub fn bgp_setup_prefixes(
    advertiser: &dyn RouteAdvertiser,
    network: &str,
    config: &NetworkConfig,
    listen_addresses: &[IpAddr],
) -> NetworkResult<()> {
    let prefixes = prefixes_for(config, listen_addresses);
    if prefixes.is_empty() {
        return advertiser.clear_prefixes(&owner(network));
    }
    advertiser.set_prefixes(&owner(network), prefixes)
}

pub fn bgp_clear(advertiser: &dyn RouteAdvertiser, network: &str) -> NetworkResult<()> {
    advertiser.clear_peers(&owner(network))?;
    advertiser.clear_prefixes(&owner(network))
}

/// Prefixes currently advertised for a network.
pub fn advertised(advertiser: &dyn RouteAdvertiser, network: &str) -> Vec<BgpPrefix> {
    advertiser.prefixes(&owner(network))
}
