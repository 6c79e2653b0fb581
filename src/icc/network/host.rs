use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;

use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use super::fan::InterfaceAddress;
use super::netlink::NetlinkHandle;
use super::subnet::parse_mac;
use crate::error::{ErrorContext, NetworkError, NetworkResult};
use crate::utils::CommandExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }

    pub fn flag(&self) -> &'static str {
        match self {
            IpFamily::V4 => "-4",
            IpFamily::V6 => "-6",
        }
    }

    pub fn version(&self) -> u8 {
        match self {
            IpFamily::V4 => 4,
            IpFamily::V6 => 6,
        }
    }
}

/// A route on a single device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub family: IpFamily,
    pub device: String,
    pub destination: String,
    pub proto: Option<String>,
    pub src: Option<String>,
    pub table: Option<String>,
    pub via: Option<String>,
}

impl Route {
    pub fn new(family: IpFamily, device: &str, destination: &str) -> Self {
        Self {
            family,
            device: device.to_string(),
            destination: destination.to_string(),
            proto: None,
            src: None,
            table: None,
            via: None,
        }
    }

    pub fn proto(mut self, proto: &str) -> Self {
        self.proto = Some(proto.to_string());
        self
    }

    pub fn src(mut self, src: &str) -> Self {
        self.src = Some(src.to_string());
        self
    }

    pub fn table(mut self, table: &str) -> Self {
        self.table = Some(table.to_string());
        self
    }

    pub fn via(mut self, gateway: &str) -> Self {
        self.via = Some(gateway.to_string());
        self
    }

    fn args(&self) -> Vec<String> {
        let mut args = vec![
            self.destination.clone(),
            "dev".to_string(),
            self.device.clone(),
        ];
        if let Some(via) = &self.via {
            args.extend(["via".to_string(), via.clone()]);
        }
        if let Some(proto) = &self.proto {
            args.extend(["proto".to_string(), proto.clone()]);
        }
        if let Some(src) = &self.src {
            args.extend(["src".to_string(), src.clone()]);
        }
        if let Some(table) = &self.table {
            args.extend(["table".to_string(), table.clone()]);
        }
        args
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VxlanSpec {
    pub name: String,
    pub id: String,
    pub local: Option<String>,
    pub remote: Option<String>,
    pub group: Option<String>,
    pub device: Option<String>,
    pub dst_port: Option<String>,
    pub ttl: Option<String>,
    pub fan_map: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelSpec {
    Gretap {
        name: String,
        local: String,
        remote: String,
    },
    Vxlan(VxlanSpec),
}

impl TunnelSpec {
    pub fn name(&self) -> &str {
        match self {
            TunnelSpec::Gretap { name, .. } => name,
            TunnelSpec::Vxlan(spec) => &spec.name,
        }
    }

    fn ip_link_args(&self) -> Vec<String> {
        match self {
            TunnelSpec::Gretap {
                name,
                local,
                remote,
            } => ["link", "add", "name", name, "type", "gretap", "local", local, "remote", remote]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            TunnelSpec::Vxlan(spec) => {
                let mut args: Vec<String> = ["link", "add", "name", &spec.name, "type", "vxlan", "id", &spec.id]
                    .iter()
                    .map(|s| s.to_string())
                    .collect();
                let optional = [
                    ("local", &spec.local),
                    ("remote", &spec.remote),
                    ("group", &spec.group),
                    ("dev", &spec.device),
                    ("dstport", &spec.dst_port),
                    ("ttl", &spec.ttl),
                    ("fan-map", &spec.fan_map),
                ];
                for (flag, value) in optional {
                    if let Some(value) = value {
                        args.push(flag.to_string());
                        args.push(value.clone());
                    }
                }
                args
            }
        }
    }
}

/// Kernel network operations the bridge engine and NIC devices drive.
#[async_trait]
pub trait HostNetwork: Send + Sync {
    async fn link_exists(&self, name: &str) -> bool;
    async fn list_links(&self) -> NetworkResult<Vec<String>>;

    async fn create_bridge(&self, name: &str) -> NetworkResult<()>;
    async fn create_dummy(&self, name: &str, mtu: u32) -> NetworkResult<()>;
    async fn create_veth(&self, host_name: &str, peer_name: &str) -> NetworkResult<()>;
    async fn create_vlan(&self, parent: &str, name: &str, vlan_id: u16) -> NetworkResult<()>;
    async fn create_tap(&self, name: &str) -> NetworkResult<()>;
    async fn create_tunnel(&self, tunnel: &TunnelSpec) -> NetworkResult<()>;
    /// Missing links are not an error.
    async fn delete_link(&self, name: &str) -> NetworkResult<()>;

    async fn set_up(&self, name: &str) -> NetworkResult<()>;
    async fn set_mtu(&self, name: &str, mtu: u32) -> NetworkResult<()>;
    async fn get_mtu(&self, name: &str) -> NetworkResult<u32>;
    async fn set_mac(&self, name: &str, mac: &str) -> NetworkResult<()>;
    async fn set_master(&self, name: &str, master: &str) -> NetworkResult<()>;
    async fn set_nomaster(&self, name: &str) -> NetworkResult<()>;
    async fn bridge_ports(&self, bridge: &str) -> NetworkResult<Vec<String>>;
    async fn is_native_bridge(&self, name: &str) -> bool;

    async fn addresses(&self, name: Option<&str>) -> NetworkResult<Vec<InterfaceAddress>>;
    async fn add_address(&self, name: &str, address: &IpNet) -> NetworkResult<()>;
    async fn flush_addresses(&self, name: &str, family: IpFamily) -> NetworkResult<()>;

    /// Routes on `device` with protocol `proto`, one `ip route show` line each.
    async fn show_routes(&self, device: &str, family: IpFamily, proto: &str) -> NetworkResult<Vec<String>>;
    async fn add_route(&self, route: &Route) -> NetworkResult<()>;
    async fn delete_route(&self, route: &Route) -> NetworkResult<()>;
    async fn replace_route(&self, device: &str, family: IpFamily, proto: &str, fields: &[String]) -> NetworkResult<()>;
    async fn flush_routes(&self, device: &str, family: IpFamily, proto: Option<&str>) -> NetworkResult<()>;
    /// Subnets already routed or addressed on the host.
    async fn used_subnets(&self) -> NetworkResult<Vec<IpNet>>;
    async fn default_gateway_v4(&self) -> NetworkResult<(Ipv4Net, String)>;

    async fn set_ipip_fan_map(&self, device: &str, fan_map: &str) -> NetworkResult<()>;
    async fn add_neigh_proxy(&self, device: &str, address: IpAddr) -> NetworkResult<()>;
    async fn delete_neigh_proxy(&self, device: &str, address: IpAddr) -> NetworkResult<()>;

    async fn set_vlan_filtering(&self, bridge: &str, enabled: bool) -> NetworkResult<()>;
    async fn set_default_pvid(&self, bridge: &str, pvid: u16) -> NetworkResult<()>;
    async fn set_hairpin(&self, port: &str, enabled: bool) -> NetworkResult<()>;

    fn ovs_installed(&self) -> bool;
    async fn ovs_add_bridge(&self, name: &str) -> NetworkResult<()>;
    async fn ovs_delete_bridge(&self, name: &str) -> NetworkResult<()>;
    async fn ovs_add_port(&self, bridge: &str, port: &str) -> NetworkResult<()>;
    async fn ovs_delete_port(&self, bridge: &str, port: &str) -> NetworkResult<()>;
}

/// Interface with a default route in `/proc/net/route` content.
pub fn default_route_interface(content: &str) -> Option<String> {
    content.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() > 7 && fields[1] == "00000000" && fields[7] == "00000000" {
            Some(fields[0].to_string())
        } else {
            None
        }
    })
}

/// The one IPv4 subnet configured on an interface.
pub fn single_v4_subnet(addresses: &[InterfaceAddress]) -> NetworkResult<Ipv4Net> {
    let mut subnet = None;
    for addr in addresses {
        let IpAddr::V4(v4) = addr.address else {
            continue;
        };
        if subnet.is_some() {
            return Err(NetworkError::environment(
                "More than one IPv4 subnet on default interface",
            ));
        }
        let net = Ipv4Net::new(v4, addr.prefix_len)
            .map_err(|e| NetworkError::environment(e.to_string()))?;
        subnet = Some(net.trunc());
    }
    subnet.ok_or_else(|| NetworkError::environment("No IPv4 subnet on default interface"))
}

/// Destinations of `/proc/net/route`. Addresses are little endian hex.
pub fn parse_proc_routes_v4(content: &str) -> Vec<IpNet> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 8 {
                return None;
            }
            let dest = u32::from_str_radix(fields[1], 16).ok()?.swap_bytes();
            let mask = u32::from_str_radix(fields[7], 16).ok()?.swap_bytes();
            if dest == 0 {
                return None;
            }
            Ipv4Net::new(Ipv4Addr::from(dest), mask.count_ones() as u8)
                .ok()
                .map(IpNet::V4)
        })
        .collect()
}

/// Destinations of `/proc/net/ipv6_route`.
pub fn parse_proc_routes_v6(content: &str) -> Vec<IpNet> {
    content
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 2 {
                return None;
            }
            let dest = u128::from_str_radix(fields[0], 16).ok()?;
            let prefix = u8::from_str_radix(fields[1], 16).ok()?;
            if dest == 0 || prefix == 0 {
                return None;
            }
            Ipv6Net::new(Ipv6Addr::from(dest), prefix).ok().map(IpNet::V6)
        })
        .collect()
}

/// Host implementation: netlink for links and addresses, iproute2 and ovs-vsctl for the rest.
pub struct SystemHost {
    netlink: NetlinkHandle,
    sysfs: PathBuf,
    procfs: PathBuf,
}

impl SystemHost {
    pub fn new() -> NetworkResult<Self> {
        Ok(Self {
            netlink: NetlinkHandle::new()?,
            sysfs: PathBuf::from("/sys"),
            procfs: PathBuf::from("/proc"),
        })
    }

    async fn ip(&self, args: &[String]) -> NetworkResult<String> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        CommandExecutor::run("ip", &args).await
    }

    async fn write_sysfs(&self, path: PathBuf, value: &str) -> NetworkResult<()> {
        tokio::fs::write(&path, value)
            .await
            .with_context(|| format!("Failed writing {}", path.display()))
    }
}

#[async_trait]
impl HostNetwork for SystemHost {
    async fn link_exists(&self, name: &str) -> bool {
        self.sysfs.join("class/net").join(name).exists() || self.netlink.link_exists(name).await
    }

    async fn list_links(&self) -> NetworkResult<Vec<String>> {
        let mut names: Vec<String> = self.netlink.link_names().await?.into_values().collect();
        names.sort();
        Ok(names)
    }

    async fn create_bridge(&self, name: &str) -> NetworkResult<()> {
        self.netlink.create_bridge(name).await
    }

    async fn create_dummy(&self, name: &str, mtu: u32) -> NetworkResult<()> {
        let mtu = mtu.to_string();
        CommandExecutor::run("ip", &["link", "add", "dev", name, "mtu", &mtu, "type", "dummy"]).await?;
        Ok(())
    }

    async fn create_veth(&self, host_name: &str, peer_name: &str) -> NetworkResult<()> {
        self.netlink.create_veth_pair(host_name, peer_name).await
    }

    async fn create_vlan(&self, parent: &str, name: &str, vlan_id: u16) -> NetworkResult<()> {
        self.netlink.create_vlan(parent, name, vlan_id).await
    }

    async fn create_tap(&self, name: &str) -> NetworkResult<()> {
        let args: Vec<String> = ["tuntap", "add", "name", name, "mode", "tap"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        self.ip(&args).await?;
        Ok(())
    }

    async fn create_tunnel(&self, tunnel: &TunnelSpec) -> NetworkResult<()> {
        self.ip(&tunnel.ip_link_args()).await?;
        Ok(())
    }

    async fn delete_link(&self, name: &str) -> NetworkResult<()> {
        self.netlink.delete_link(name).await
    }

    async fn set_up(&self, name: &str) -> NetworkResult<()> {
        self.netlink.set_link_up(name).await
    }

    async fn set_mtu(&self, name: &str, mtu: u32) -> NetworkResult<()> {
        self.netlink
            .set_link_mtu(name, mtu)
            .await
            .with_context(|| format!("Failed setting MTU {} on {}", mtu, name))
    }

    async fn get_mtu(&self, name: &str) -> NetworkResult<u32> {
        self.netlink.get_link_mtu(name).await
    }

    async fn set_mac(&self, name: &str, mac: &str) -> NetworkResult<()> {
        let mac = parse_mac(mac).map_err(NetworkError::Validation)?;
        self.netlink.set_link_address(name, mac).await
    }

    async fn set_master(&self, name: &str, master: &str) -> NetworkResult<()> {
        self.netlink.set_link_master(name, master).await
    }

    async fn set_nomaster(&self, name: &str) -> NetworkResult<()> {
        self.netlink.set_link_nomaster(name).await
    }

    async fn bridge_ports(&self, bridge: &str) -> NetworkResult<Vec<String>> {
        let dir = self.sysfs.join("class/net").join(bridge).join("brif");
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ports = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            ports.push(entry.file_name().to_string_lossy().to_string());
        }
        ports.sort();
        Ok(ports)
    }

    async fn is_native_bridge(&self, name: &str) -> bool {
        self.sysfs.join("class/net").join(name).join("bridge").exists()
    }

    async fn addresses(&self, name: Option<&str>) -> NetworkResult<Vec<InterfaceAddress>> {
        self.netlink.list_addresses(name).await
    }

    async fn add_address(&self, name: &str, address: &IpNet) -> NetworkResult<()> {
        self.netlink
            .add_address(name, address)
            .await
            .with_context(|| format!("Failed adding address {} to {}", address, name))
    }

    async fn flush_addresses(&self, name: &str, family: IpFamily) -> NetworkResult<()> {
        self.netlink
            .flush_global_addresses(name, family == IpFamily::V4)
            .await
    }

    async fn show_routes(&self, device: &str, family: IpFamily, proto: &str) -> NetworkResult<Vec<String>> {
        let out = CommandExecutor::run(
            "ip",
            &[family.flag(), "route", "show", "dev", device, "proto", proto],
        )
        .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn add_route(&self, route: &Route) -> NetworkResult<()> {
        let mut args = vec![route.family.flag().to_string(), "route".into(), "add".into()];
        args.extend(route.args());
        self.ip(&args).await?;
        Ok(())
    }

    async fn delete_route(&self, route: &Route) -> NetworkResult<()> {
        let mut args = vec![route.family.flag().to_string(), "route".into(), "delete".into()];
        args.extend(route.args());
        match self.ip(&args).await {
            Ok(_) => Ok(()),
            Err(NetworkError::Command { stderr, .. }) if stderr.contains("No such process") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn replace_route(&self, device: &str, family: IpFamily, proto: &str, fields: &[String]) -> NetworkResult<()> {
        let mut args = vec![family.flag().to_string(), "route".into(), "replace".into()];
        args.extend(fields.iter().cloned());
        args.extend(["dev".into(), device.to_string(), "proto".into(), proto.to_string()]);
        self.ip(&args).await?;
        Ok(())
    }

    async fn flush_routes(&self, device: &str, family: IpFamily, proto: Option<&str>) -> NetworkResult<()> {
        let mut args = vec![
            family.flag().to_string(),
            "route".into(),
            "flush".into(),
            "dev".into(),
            device.to_string(),
        ];
        if let Some(proto) = proto {
            args.extend(["proto".into(), proto.to_string()]);
        }
        self.ip(&args).await?;
        Ok(())
    }

    async fn used_subnets(&self) -> NetworkResult<Vec<IpNet>> {
        let mut used: Vec<IpNet> = self
            .addresses(None)
            .await?
            .into_iter()
            .filter_map(|a| IpNet::new(a.address, a.prefix_len).ok().map(|n| n.trunc()))
            .collect();

        if let Ok(content) = tokio::fs::read_to_string(self.procfs.join("net/route")).await {
            used.extend(parse_proc_routes_v4(&content));
        }
        if let Ok(content) = tokio::fs::read_to_string(self.procfs.join("net/ipv6_route")).await {
            used.extend(parse_proc_routes_v6(&content));
        }
        Ok(used)
    }

    async fn default_gateway_v4(&self) -> NetworkResult<(Ipv4Net, String)> {
        let content = tokio::fs::read_to_string(self.procfs.join("net/route")).await?;
        let iface = default_route_interface(&content)
            .ok_or_else(|| NetworkError::environment("No default gateway for IPv4"))?;
        let subnet = single_v4_subnet(&self.addresses(Some(&iface)).await?)?;
        Ok((subnet, iface))
    }

    async fn set_ipip_fan_map(&self, device: &str, fan_map: &str) -> NetworkResult<()> {
        CommandExecutor::run("ip", &["link", "change", "dev", device, "type", "ipip", "fan-map", fan_map]).await?;
        Ok(())
    }

    async fn add_neigh_proxy(&self, device: &str, address: IpAddr) -> NetworkResult<()> {
        let addr = address.to_string();
        let family = IpFamily::of(&address);
        CommandExecutor::run("ip", &[family.flag(), "neigh", "add", "proxy", &addr, "dev", device]).await?;
        Ok(())
    }

    async fn delete_neigh_proxy(&self, device: &str, address: IpAddr) -> NetworkResult<()> {
        let addr = address.to_string();
        let family = IpFamily::of(&address);
        CommandExecutor::run("ip", &[family.flag(), "neigh", "delete", "proxy", &addr, "dev", device]).await?;
        Ok(())
    }

    async fn set_vlan_filtering(&self, bridge: &str, enabled: bool) -> NetworkResult<()> {
        let path = self.sysfs.join("class/net").join(bridge).join("bridge/vlan_filtering");
        self.write_sysfs(path, if enabled { "1" } else { "0" }).await
    }

    async fn set_default_pvid(&self, bridge: &str, pvid: u16) -> NetworkResult<()> {
        let path = self.sysfs.join("class/net").join(bridge).join("bridge/default_pvid");
        self.write_sysfs(path, &pvid.to_string()).await
    }

    async fn set_hairpin(&self, port: &str, enabled: bool) -> NetworkResult<()> {
        let path = self.sysfs.join("class/net").join(port).join("brport/hairpin_mode");
        self.write_sysfs(path, if enabled { "1" } else { "0" }).await
    }

    fn ovs_installed(&self) -> bool {
        CommandExecutor::is_command_available("ovs-vsctl")
    }

    async fn ovs_add_bridge(&self, name: &str) -> NetworkResult<()> {
        CommandExecutor::run("ovs-vsctl", &["--may-exist", "add-br", name]).await?;
        Ok(())
    }

    async fn ovs_delete_bridge(&self, name: &str) -> NetworkResult<()> {
        CommandExecutor::run("ovs-vsctl", &["--if-exists", "del-br", name]).await?;
        Ok(())
    }

    async fn ovs_add_port(&self, bridge: &str, port: &str) -> NetworkResult<()> {
        CommandExecutor::run("ovs-vsctl", &["--may-exist", "add-port", bridge, port]).await?;
        Ok(())
    }

    async fn ovs_delete_port(&self, bridge: &str, port: &str) -> NetworkResult<()> {
        CommandExecutor::run("ovs-vsctl", &["--if-exists", "del-port", bridge, port]).await?;
        Ok(())
    }
}
