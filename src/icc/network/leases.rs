use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use super::config::NetworkConfig;
use super::dnsmasq::network_nics;
use super::subnet::{eui64, parse_mac};
use crate::sync::network::{InstanceDevice, NetworkRecord, NetworkStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseType {
    Static,
    Dynamic,
    Uplink,
}

/// An address handed out on a bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub hostname: String,
    pub address: String,
    #[serde(default)]
    pub hwaddr: String,
    #[serde(rename = "type")]
    pub lease_type: LeaseType,
    #[serde(default)]
    pub location: String,
}

/// Addresses of downstream networks that use `network` as their uplink.
pub fn uplink_leases(network: &str, networks: &[NetworkRecord]) -> Vec<Lease> {
    let mut leases = Vec::new();
    for record in networks {
        if record.status != NetworkStatus::Created {
            continue;
        }
        if record.config.get("network").map(String::as_str) != Some(network) {
            continue;
        }

        for key in ["volatile.network.ipv4.address", "volatile.network.ipv6.address"] {
            if let Some(address) = record.config.get(key).filter(|v| !v.is_empty()) {
                leases.push(Lease {
                    hostname: format!("{}-{}.uplink", record.project, record.name),
                    address: address.clone(),
                    hwaddr: String::new(),
                    lease_type: LeaseType::Uplink,
                    location: String::new(),
                });
            }
        }
    }
    leases
}

/// Static leases of the project's instance NICs on `network`, plus their SLAAC addresses
/// when the bridge runs stateless IPv6. Also returns the MACs seen, used to filter dynamic leases.
pub fn static_leases(
    network: &str,
    config: &NetworkConfig,
    project: &str,
    devices: &[InstanceDevice],
    location: &str,
) -> (Vec<Lease>, Vec<String>) {
    let mut leases = Vec::new();
    let mut macs = Vec::new();

    let slaac_prefix = match config.get("ipv6.address").parse::<IpNet>() {
        Ok(IpNet::V6(net)) if !config.is_true("ipv6.dhcp.stateful") => Some(net.trunc()),
        _ => None,
    };

    for device in network_nics(network, devices) {
        if device.project != project {
            continue;
        }

        let get = |key: &str| device.config.get(key).cloned().unwrap_or_default();
        let hwaddr = get("hwaddr");
        if !hwaddr.is_empty() {
            macs.push(hwaddr.clone());
        }

        let lease = |address: String, lease_type: LeaseType| Lease {
            hostname: device.instance.clone(),
            address,
            hwaddr: hwaddr.clone(),
            lease_type,
            location: location.to_string(),
        };

        for key in ["ipv4.address", "ipv6.address"] {
            let address = get(key);
            if !address.is_empty() {
                leases.push(lease(address, LeaseType::Static));
            }
        }

        if let (Some(prefix), Ok(mac)) = (slaac_prefix, parse_mac(&hwaddr)) {
            leases.push(lease(eui64(&prefix, &mac).to_string(), LeaseType::Dynamic));
        }
    }

    (leases, macs)
}

/// Split a lease file hardware address into lowercase octets. DHCPv6 entries carry a decimal
/// IAID instead, which is rendered as hex pairs.
fn mac_octets(hwaddr: &str) -> Vec<String> {
    if hwaddr.contains(':') {
        return hwaddr.to_lowercase().split(':').map(String::from).collect();
    }

    match hwaddr.parse::<u64>() {
        Ok(value) => {
            let hex = format!("{:x}", value);
            hex.as_bytes()
                .chunks_exact(2)
                .map(|pair| String::from_utf8_lossy(pair).to_string())
                .collect()
        }
        Err(_) => Vec::new(),
    }
}

/// Parse `dnsmasq.leases` into dynamic leases.
///
/// Entries already present in `known` are dropped. With `project_macs` set, only leases whose
/// MAC belongs to the project survive; IPv6 leases have no MAC and always pass.
pub fn parse_dynamic_leases(
    content: &str,
    known: &[Lease],
    project_macs: Option<&[String]>,
    location: &str,
) -> Vec<Lease> {
    let mut leases = Vec::new();

    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 {
            continue;
        }

        let mut mac = mac_octets(fields[1]).join(":");
        let client_id = fields[4];
        if mac.len() < 17 && client_id.len() >= 17 {
            let Some(tail) = client_id.get(client_id.len() - 17..) else {
                continue;
            };
            mac = tail.to_string();
        }

        let address = fields[2];
        if known.iter().any(|l| l.hwaddr == mac && l.address == address) {
            continue;
        }

        if address.parse::<IpAddr>().map(|ip| ip.is_ipv6()).unwrap_or(false) {
            mac.clear();
        }

        if let Some(macs) = project_macs {
            if !mac.is_empty() && !macs.contains(&mac) {
                continue;
            }
        }

        leases.push(Lease {
            hostname: fields[3].to_string(),
            address: address.to_string(),
            hwaddr: mac,
            lease_type: LeaseType::Dynamic,
            location: location.to_string(),
        });
    }

    leases
}

/// Leases reported by other members, kept only for MACs in the project.
pub fn filter_member_leases(member_leases: Vec<Lease>, project_macs: &[String]) -> Vec<Lease> {
    member_leases
        .into_iter()
        .filter(|l| !l.hwaddr.is_empty() && project_macs.contains(&l.hwaddr))
        .collect()
}
