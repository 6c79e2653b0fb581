use std::collections::HashSet;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use super::config::{split_list, NetworkConfig};
use super::dnsmasq::network_nics;
use super::firewall::AddressForward;
use super::subnet::{parse_ip_to_net, subnets_overlap};
use crate::error::{NetworkError, NetworkResult};
use crate::sync::network::{ForwardPort, InstanceDevice, NetworkRecord, NetworkStatus};

/// Request body of a forward create.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRequest {
    pub listen_address: String,
    #[serde(default)]
    pub description: String,
    /// Supports `target_address` for the default target
    #[serde(default)]
    pub config: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<ForwardPort>,
}

/// A validated port entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardPortMap {
    pub protocol: String,
    pub listen_ports: Vec<u64>,
    pub target_address: IpAddr,
    pub target_ports: Vec<u64>,
}

/// Expand `80,8000-8010` into individual ports.
pub fn parse_port_ranges(value: &str) -> NetworkResult<Vec<u64>> {
    let mut ports = Vec::new();
    for entry in split_list(value) {
        let invalid = || NetworkError::validation(format!("Invalid port range {:?}", entry));
        match entry.split_once('-') {
            Some((start, end)) => {
                let start: u64 = start.trim().parse().map_err(|_| invalid())?;
                let end: u64 = end.trim().parse().map_err(|_| invalid())?;
                if start == 0 || end > 65535 || start > end {
                    return Err(invalid());
                }
                ports.extend(start..=end);
            }
            None => {
                let port: u64 = entry.parse().map_err(|_| invalid())?;
                if port == 0 || port > 65535 {
                    return Err(invalid());
                }
                ports.push(port);
            }
        }
    }

    if ports.is_empty() {
        return Err(NetworkError::validation(format!("Invalid port range {:?}", value)));
    }
    Ok(ports)
}

fn bridge_subnet(config: &NetworkConfig, ipv4: bool) -> Option<IpNet> {
    let key = if ipv4 { "ipv4.address" } else { "ipv6.address" };
    config.get(key).parse::<IpNet>().ok()
}

fn check_target(config: &NetworkConfig, listen: IpAddr, target: IpAddr) -> NetworkResult<()> {
    if target.is_ipv4() != listen.is_ipv4() {
        return Err(NetworkError::validation(format!(
            "Target address {:?} is different family to listen address",
            target.to_string()
        )));
    }

    let in_subnet = bridge_subnet(config, target.is_ipv4())
        .map(|net| net.trunc().contains(&target))
        .unwrap_or(false);
    if !in_subnet {
        return Err(NetworkError::validation(format!(
            "Target address {:?} is not within the network subnet",
            target.to_string()
        )));
    }
    Ok(())
}

/// Validate a forward against the bridge config and return its port maps.
pub fn validate_forward(
    config: &NetworkConfig,
    listen: IpAddr,
    forward_config: &std::collections::BTreeMap<String, String>,
    ports: &[ForwardPort],
) -> NetworkResult<Vec<ForwardPortMap>> {
    let own = bridge_subnet(config, listen.is_ipv4()).ok_or_else(|| {
        NetworkError::validation(format!(
            "Network has no IPv{} address to forward to",
            if listen.is_ipv4() { 4 } else { 6 }
        ))
    })?;
    if own.addr() == listen {
        return Err(NetworkError::validation(
            "Forward listen address cannot be the network's own address",
        ));
    }

    for key in forward_config.keys() {
        if key != "target_address" && !key.starts_with("user.") {
            return Err(NetworkError::validation(format!("Invalid forward option {:?}", key)));
        }
    }

    if let Some(target) = forward_config.get("target_address").filter(|v| !v.is_empty()) {
        let target: IpAddr = target
            .parse()
            .map_err(|_| NetworkError::validation(format!("Invalid target address {:?}", target)))?;
        check_target(config, listen, target)?;
    }

    let mut used: HashSet<(String, u64)> = HashSet::new();
    let mut maps = Vec::with_capacity(ports.len());

    for (i, port) in ports.iter().enumerate() {
        if port.protocol != "tcp" && port.protocol != "udp" {
            return Err(NetworkError::validation(format!(
                "Invalid protocol {:?} for port specification {}",
                port.protocol, i
            )));
        }

        let target_address: IpAddr = port.target_address.parse().map_err(|_| {
            NetworkError::validation(format!(
                "Invalid target address {:?} for port specification {}",
                port.target_address, i
            ))
        })?;
        check_target(config, listen, target_address)?;

        let listen_ports = parse_port_ranges(&port.listen_port)?;
        for p in &listen_ports {
            if !used.insert((port.protocol.clone(), *p)) {
                return Err(NetworkError::validation(format!(
                    "Duplicate listen port {} for protocol {:?} in port specification {}",
                    p, port.protocol, i
                )));
            }
        }

        let target_ports = if port.target_port.is_empty() {
            Vec::new()
        } else {
            parse_port_ranges(&port.target_port)?
        };
        if !target_ports.is_empty() && target_ports.len() != 1 && target_ports.len() != listen_ports.len() {
            return Err(NetworkError::validation(format!(
                "Mismatch of listen port(s) and target port(s) count for port specification {}",
                i
            )));
        }

        maps.push(ForwardPortMap {
            protocol: port.protocol.clone(),
            listen_ports,
            target_address,
            target_ports,
        });
    }

    Ok(maps)
}

/// Firewall forwards: the default target first, then one per port map.
pub fn to_firewall_forwards(
    listen: IpAddr,
    default_target: Option<IpAddr>,
    maps: Vec<ForwardPortMap>,
) -> Vec<AddressForward> {
    let mut forwards = Vec::with_capacity(maps.len() + 1);
    if let Some(target) = default_target {
        forwards.push(AddressForward {
            listen_address: listen,
            target_address: target,
            protocol: String::new(),
            listen_ports: Vec::new(),
            target_ports: Vec::new(),
        });
    }

    for map in maps {
        forwards.push(AddressForward {
            listen_address: listen,
            target_address: map.target_address,
            protocol: map.protocol,
            listen_ports: map.listen_ports,
            target_ports: map.target_ports,
        });
    }
    forwards
}

/// A subnet routed to or through a managed bridge on this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalSubnetUsage {
    pub subnet: IpNet,
    pub network_project: String,
    pub network_name: String,
    pub network_snat: bool,
    pub instance_project: String,
    pub instance_name: String,
    pub instance_device: String,
}

impl ExternalSubnetUsage {
    fn network(subnet: IpNet, project: &str, name: &str) -> Self {
        Self {
            subnet,
            network_project: project.to_string(),
            network_name: name.to_string(),
            network_snat: false,
            instance_project: String::new(),
            instance_name: String::new(),
            instance_device: String::new(),
        }
    }
}

fn created_bridges(networks: &[NetworkRecord]) -> impl Iterator<Item = &NetworkRecord> {
    networks
        .iter()
        .filter(|n| n.network_type == "bridge" && n.status == NetworkStatus::Created)
}

/// Non-NATed subnets, SNAT addresses and routes of every created bridge.
pub fn bridge_external_subnets(networks: &[NetworkRecord]) -> NetworkResult<Vec<ExternalSubnetUsage>> {
    let mut usages = Vec::new();
    for record in created_bridges(networks) {
        let config = NetworkConfig::from(record.config.clone());
        for family in ["ipv4", "ipv6"] {
            if !config.is_true(&format!("{}.nat", family)) {
                if let Ok(net) = config.get(&format!("{}.address", family)).parse::<IpNet>() {
                    usages.push(ExternalSubnetUsage::network(net.trunc(), &record.project, &record.name));
                }
            }

            let nat_key = format!("{}.nat.address", family);
            let nat_address = config.get(&nat_key);
            if !nat_address.is_empty() {
                let ip: IpAddr = nat_address.parse().map_err(|_| {
                    NetworkError::validation(format!(
                        "Failed parsing {:?} of {:?} in project {:?}",
                        nat_key, record.name, record.project
                    ))
                })?;
                let mut usage = ExternalSubnetUsage::network(IpNet::from(ip), &record.project, &record.name);
                usage.network_snat = true;
                usages.push(usage);
            }

            for route in split_list(config.get(&format!("{}.routes", family))) {
                if let Ok(net) = route.parse::<IpNet>() {
                    usages.push(ExternalSubnetUsage::network(net.trunc(), &record.project, &record.name));
                }
            }
        }
    }
    Ok(usages)
}

/// Routes configured on bridged NICs of default-project instances attached to created bridges.
pub fn bridged_nic_external_routes(
    networks: &[NetworkRecord],
    devices: &[InstanceDevice],
) -> Vec<ExternalSubnetUsage> {
    let mut usages = Vec::new();
    for record in created_bridges(networks).filter(|n| n.project == "default") {
        for device in network_nics(&record.name, devices) {
            if device.project != "default" {
                continue;
            }
            for key in ["ipv4.routes", "ipv6.routes", "ipv4.routes.external", "ipv6.routes.external"] {
                let value = device.config.get(key).map(String::as_str).unwrap_or("");
                for route in split_list(value) {
                    if let Ok(net) = route.parse::<IpNet>() {
                        usages.push(ExternalSubnetUsage {
                            subnet: net.trunc(),
                            network_project: record.project.clone(),
                            network_name: record.name.clone(),
                            network_snat: false,
                            instance_project: device.project.clone(),
                            instance_name: device.instance.clone(),
                            instance_device: device.device.clone(),
                        });
                    }
                }
            }
        }
    }
    usages
}

/// Existing forward listen addresses as single-host subnets.
pub fn forward_listen_usages(listen: &[(String, String, String)]) -> NetworkResult<Vec<ExternalSubnetUsage>> {
    listen
        .iter()
        .map(|(project, network, address)| {
            let net = parse_ip_to_net(address).map_err(|_| {
                NetworkError::validation(format!("Invalid existing forward listen address {:?}", address))
            })?;
            Ok(ExternalSubnetUsage::network(net, project, network))
        })
        .collect()
}

/// Reject a listen address overlapping anything in use, except the bridge's own network
/// entries and its SNAT address. The message stays vague on purpose.
pub fn check_listen_overlap(
    project: &str,
    network: &str,
    listen: IpNet,
    usages: &[ExternalSubnetUsage],
) -> NetworkResult<()> {
    for usage in usages {
        let ours = usage.network_project == project && usage.network_name == network;
        if ours && (usage.network_snat || usage.instance_device.is_empty()) {
            continue;
        }

        if subnets_overlap(&usage.subnet, &listen) {
            return Err(NetworkError::Conflict(format!(
                "Forward listen address {:?} overlaps with another network or NIC",
                listen.to_string()
            )));
        }
    }
    Ok(())
}
