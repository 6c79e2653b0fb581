//! In-memory stand-ins for the host, helper processes, firewall and cluster.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net};
use parking_lot::Mutex;
use tempfile::TempDir;

use super::apparmor::AppArmor;
use super::bgp::BgpTable;
use super::cluster::{ClusterClient, NetworkStateView};
use super::config::NetworkConfig;
use super::fan::InterfaceAddress;
use super::firewall::{AclOpts, AddressForward, Firewall, FirewallOpts};
use super::host::{HostNetwork, IpFamily, Route, TunnelSpec};
use super::leases::Lease;
use super::locks::LockRegistry;
use super::state::{NetworkState, OsSettings};
use super::supervisor::{ProcessRunner, ProcessSpec, Subprocess, WaitOutcome};
use crate::daemon::events::NetworkEventBus;
use crate::error::{NetworkError, NetworkResult};
use crate::sync::{ConnectionManager, NetworkStore, SchemaManager};
use crate::utils::Sysctl;

fn injected(call: &str) -> NetworkError {
    NetworkError::Command {
        cmd: call.to_string(),
        stderr: "injected".to_string(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeLink {
    pub kind: String,
    pub master: Option<String>,
    pub mtu: u32,
    pub up: bool,
    pub mac: Option<String>,
    pub addresses: Vec<IpNet>,
    pub hairpin: bool,
    pub fan_map: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeRoute {
    pub family: IpFamily,
    pub device: String,
    pub destination: String,
    pub proto: Option<String>,
    pub src: Option<String>,
    pub via: Option<String>,
    pub table: Option<String>,
}

#[derive(Debug)]
struct HostInner {
    links: BTreeMap<String, FakeLink>,
    routes: Vec<FakeRoute>,
    neigh_proxies: Vec<(String, IpAddr)>,
    vlan_filtering: BTreeMap<String, bool>,
    pvid: BTreeMap<String, u16>,
    used_subnets: Vec<IpNet>,
    gateway: Option<(Ipv4Net, String)>,
    calls: Vec<String>,
    ovs_installed: bool,
    fail_on: Option<String>,
}

/// Kernel state kept in maps. Every mutating call is recorded as `"<method> <args>"`.
#[derive(Debug)]
pub struct FakeHost {
    inner: Mutex<HostInner>,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHost {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HostInner {
                links: BTreeMap::new(),
                routes: Vec::new(),
                neigh_proxies: Vec::new(),
                vlan_filtering: BTreeMap::new(),
                pvid: BTreeMap::new(),
                used_subnets: Vec::new(),
                gateway: None,
                calls: Vec::new(),
                ovs_installed: true,
                fail_on: None,
            }),
        }
    }

    fn record(&self, call: String) -> NetworkResult<()> {
        let mut inner = self.inner.lock();
        let fail = inner
            .fail_on
            .as_deref()
            .map(|prefix| call.starts_with(prefix))
            .unwrap_or(false);
        inner.calls.push(call.clone());
        if fail {
            return Err(injected(&call));
        }
        Ok(())
    }

    fn with_link<T>(&self, name: &str, f: impl FnOnce(&mut FakeLink) -> T) -> NetworkResult<T> {
        let mut inner = self.inner.lock();
        match inner.links.get_mut(name) {
            Some(link) => Ok(f(link)),
            None => Err(NetworkError::NotFound(format!("Link {} not found", name))),
        }
    }

    fn insert_link(&self, name: &str, link: FakeLink) -> NetworkResult<()> {
        let mut inner = self.inner.lock();
        if inner.links.contains_key(name) {
            return Err(NetworkError::Command {
                cmd: format!("ip link add {}", name),
                stderr: "RTNETLINK answers: File exists".to_string(),
            });
        }
        inner.links.insert(name.to_string(), link);
        Ok(())
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().calls.clone()
    }

    /// Make every call whose record starts with `prefix` fail.
    pub fn fail_on(&self, prefix: &str) {
        self.inner.lock().fail_on = Some(prefix.to_string());
    }

    pub fn master_of(&self, name: &str) -> Option<String> {
        self.inner.lock().links.get(name).and_then(|l| l.master.clone())
    }

    pub fn set_ovs_installed(&self, installed: bool) {
        self.inner.lock().ovs_installed = installed;
    }

    pub fn add_link(&self, name: &str, kind: &str) {
        self.inner.lock().links.insert(
            name.to_string(),
            FakeLink {
                kind: kind.to_string(),
                mtu: 1500,
                ..Default::default()
            },
        );
    }

    pub fn add_host_address(&self, name: &str, address: &str) {
        let net: IpNet = address.parse().expect("test address");
        let mut inner = self.inner.lock();
        inner
            .links
            .entry(name.to_string())
            .or_insert_with(|| FakeLink {
                kind: "ether".to_string(),
                mtu: 1500,
                ..Default::default()
            })
            .addresses
            .push(net);
    }

    pub fn add_boot_route(&self, device: &str, family: IpFamily, destination: &str) {
        self.inner.lock().routes.push(FakeRoute {
            family,
            device: device.to_string(),
            destination: destination.to_string(),
            proto: Some("boot".to_string()),
            src: None,
            via: None,
            table: None,
        });
    }

    pub fn set_gateway(&self, subnet: &str, device: &str) {
        let net: Ipv4Net = subnet.parse().expect("test subnet");
        self.inner.lock().gateway = Some((net, device.to_string()));
    }

    pub fn link(&self, name: &str) -> Option<FakeLink> {
        self.inner.lock().links.get(name).cloned()
    }

    pub fn routes(&self) -> Vec<FakeRoute> {
        self.inner.lock().routes.clone()
    }

    pub fn addresses_of(&self, name: &str) -> Vec<IpNet> {
        self.link(name).map(|l| l.addresses).unwrap_or_default()
    }

    pub fn neigh_proxies(&self) -> Vec<(String, IpAddr)> {
        self.inner.lock().neigh_proxies.clone()
    }

    pub fn vlan_filtering(&self, bridge: &str) -> Option<bool> {
        self.inner.lock().vlan_filtering.get(bridge).copied()
    }
}

#[async_trait]
impl HostNetwork for FakeHost {
    async fn link_exists(&self, name: &str) -> bool {
        self.inner.lock().links.contains_key(name)
    }

    async fn list_links(&self) -> NetworkResult<Vec<String>> {
        Ok(self.inner.lock().links.keys().cloned().collect())
    }

    async fn create_bridge(&self, name: &str) -> NetworkResult<()> {
        self.record(format!("create_bridge {}", name))?;
        self.insert_link(
            name,
            FakeLink {
                kind: "bridge".to_string(),
                mtu: 1500,
                ..Default::default()
            },
        )
    }

    async fn create_dummy(&self, name: &str, mtu: u32) -> NetworkResult<()> {
        self.record(format!("create_dummy {} {}", name, mtu))?;
        self.insert_link(
            name,
            FakeLink {
                kind: "dummy".to_string(),
                mtu,
                ..Default::default()
            },
        )
    }

    async fn create_veth(&self, host_name: &str, peer_name: &str) -> NetworkResult<()> {
        self.record(format!("create_veth {} {}", host_name, peer_name))?;
        for name in [host_name, peer_name] {
            self.insert_link(
                name,
                FakeLink {
                    kind: "veth".to_string(),
                    mtu: 1500,
                    ..Default::default()
                },
            )?;
        }
        Ok(())
    }

    async fn create_vlan(&self, parent: &str, name: &str, vlan_id: u16) -> NetworkResult<()> {
        self.record(format!("create_vlan {} {} {}", parent, name, vlan_id))?;
        self.insert_link(
            name,
            FakeLink {
                kind: "vlan".to_string(),
                mtu: 1500,
                ..Default::default()
            },
        )
    }

    async fn create_tap(&self, name: &str) -> NetworkResult<()> {
        self.record(format!("create_tap {}", name))?;
        self.insert_link(
            name,
            FakeLink {
                kind: "tun".to_string(),
                mtu: 1500,
                ..Default::default()
            },
        )
    }

    async fn create_tunnel(&self, tunnel: &TunnelSpec) -> NetworkResult<()> {
        self.record(format!("create_tunnel {}", tunnel.name()))?;
        let (kind, fan_map) = match tunnel {
            TunnelSpec::Gretap { .. } => ("gretap", None),
            TunnelSpec::Vxlan(spec) => ("vxlan", spec.fan_map.clone()),
        };
        self.insert_link(
            tunnel.name(),
            FakeLink {
                kind: kind.to_string(),
                mtu: 1500,
                fan_map,
                ..Default::default()
            },
        )
    }

    async fn delete_link(&self, name: &str) -> NetworkResult<()> {
        self.record(format!("delete_link {}", name))?;
        let mut inner = self.inner.lock();
        if inner.links.remove(name).is_none() {
            return Err(NetworkError::NotFound(format!("Link {} not found", name)));
        }
        inner.routes.retain(|r| r.device != name);
        for link in inner.links.values_mut() {
            if link.master.as_deref() == Some(name) {
                link.master = None;
            }
        }
        Ok(())
    }

    async fn set_up(&self, name: &str) -> NetworkResult<()> {
        self.record(format!("set_up {}", name))?;
        self.with_link(name, |l| l.up = true)
    }

    async fn set_mtu(&self, name: &str, mtu: u32) -> NetworkResult<()> {
        self.record(format!("set_mtu {} {}", name, mtu))?;
        self.with_link(name, |l| l.mtu = mtu)
    }

    async fn get_mtu(&self, name: &str) -> NetworkResult<u32> {
        self.with_link(name, |l| l.mtu)
    }

    async fn set_mac(&self, name: &str, mac: &str) -> NetworkResult<()> {
        self.record(format!("set_mac {} {}", name, mac))?;
        self.with_link(name, |l| l.mac = Some(mac.to_string()))
    }

    async fn set_master(&self, name: &str, master: &str) -> NetworkResult<()> {
        self.record(format!("set_master {} {}", name, master))?;
        self.with_link(name, |l| l.master = Some(master.to_string()))
    }

    async fn set_nomaster(&self, name: &str) -> NetworkResult<()> {
        self.record(format!("set_nomaster {}", name))?;
        self.with_link(name, |l| l.master = None)
    }

    async fn bridge_ports(&self, bridge: &str) -> NetworkResult<Vec<String>> {
        Ok(self
            .inner
            .lock()
            .links
            .iter()
            .filter(|(_, l)| l.master.as_deref() == Some(bridge))
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn is_native_bridge(&self, name: &str) -> bool {
        self.link(name).map(|l| l.kind == "bridge").unwrap_or(false)
    }

    async fn addresses(&self, name: Option<&str>) -> NetworkResult<Vec<InterfaceAddress>> {
        let inner = self.inner.lock();
        Ok(inner
            .links
            .iter()
            .filter(|(link, _)| name.map(|n| n == link.as_str()).unwrap_or(true))
            .flat_map(|(link, l)| {
                l.addresses.iter().map(move |net| InterfaceAddress {
                    interface: link.clone(),
                    address: net.addr(),
                    prefix_len: net.prefix_len(),
                })
            })
            .collect())
    }

    async fn add_address(&self, name: &str, address: &IpNet) -> NetworkResult<()> {
        self.record(format!("add_address {} {}", name, address))?;
        let exists = self.with_link(name, |l| l.addresses.contains(address))?;
        if exists {
            return Err(NetworkError::Command {
                cmd: format!("ip addr add {} dev {}", address, name),
                stderr: "RTNETLINK answers: File exists".to_string(),
            });
        }
        self.with_link(name, |l| l.addresses.push(*address))
    }

    async fn flush_addresses(&self, name: &str, family: IpFamily) -> NetworkResult<()> {
        self.record(format!("flush_addresses {} {}", name, family.version()))?;
        self.with_link(name, |l| {
            l.addresses.retain(|a| IpFamily::of(&a.addr()) != family)
        })?;

        // The kernel drops routes that depended on the removed addresses
        self.inner.lock().routes.retain(|r| {
            !(r.device == name && r.family == family && r.proto.as_deref() == Some("boot"))
        });
        Ok(())
    }

    async fn show_routes(&self, device: &str, family: IpFamily, proto: &str) -> NetworkResult<Vec<String>> {
        Ok(self
            .inner
            .lock()
            .routes
            .iter()
            .filter(|r| r.device == device && r.family == family && r.proto.as_deref() == Some(proto))
            .map(|r| r.destination.clone())
            .collect())
    }

    async fn add_route(&self, route: &Route) -> NetworkResult<()> {
        self.record(format!("add_route {} {}", route.device, route.destination))?;
        let mut inner = self.inner.lock();
        let duplicate = inner.routes.iter().any(|r| {
            r.family == route.family
                && r.device == route.device
                && r.destination == route.destination
                && r.table == route.table
        });
        if duplicate {
            return Err(NetworkError::Command {
                cmd: format!("ip route add {}", route.destination),
                stderr: "RTNETLINK answers: File exists".to_string(),
            });
        }
        inner.routes.push(FakeRoute {
            family: route.family,
            device: route.device.clone(),
            destination: route.destination.clone(),
            proto: route.proto.clone(),
            src: route.src.clone(),
            via: route.via.clone(),
            table: route.table.clone(),
        });
        Ok(())
    }

    async fn delete_route(&self, route: &Route) -> NetworkResult<()> {
        self.record(format!("delete_route {} {}", route.device, route.destination))?;
        let mut inner = self.inner.lock();
        let before = inner.routes.len();
        inner
            .routes
            .retain(|r| !(r.device == route.device && r.destination == route.destination && r.table == route.table));
        if inner.routes.len() == before {
            return Err(NetworkError::NotFound(format!("Route {} not found", route.destination)));
        }
        Ok(())
    }

    async fn replace_route(&self, device: &str, family: IpFamily, proto: &str, fields: &[String]) -> NetworkResult<()> {
        let destination = fields.join(" ");
        self.record(format!("replace_route {} {}", device, destination))?;
        let mut inner = self.inner.lock();
        inner
            .routes
            .retain(|r| !(r.device == device && r.family == family && r.destination == destination));
        inner.routes.push(FakeRoute {
            family,
            device: device.to_string(),
            destination,
            proto: Some(proto.to_string()),
            src: None,
            via: None,
            table: None,
        });
        Ok(())
    }

    async fn flush_routes(&self, device: &str, family: IpFamily, proto: Option<&str>) -> NetworkResult<()> {
        self.record(format!("flush_routes {} {} {}", device, family.version(), proto.unwrap_or("all")))?;
        self.inner.lock().routes.retain(|r| {
            !(r.device == device
                && r.family == family
                && proto.map(|p| r.proto.as_deref() == Some(p)).unwrap_or(true))
        });
        Ok(())
    }

    async fn used_subnets(&self) -> NetworkResult<Vec<IpNet>> {
        let inner = self.inner.lock();
        let mut subnets = inner.used_subnets.clone();
        for link in inner.links.values() {
            subnets.extend(link.addresses.iter().map(|a| a.trunc()));
        }
        Ok(subnets)
    }

    async fn default_gateway_v4(&self) -> NetworkResult<(Ipv4Net, String)> {
        self.inner
            .lock()
            .gateway
            .clone()
            .ok_or_else(|| NetworkError::environment("No default gateway"))
    }

    async fn set_ipip_fan_map(&self, device: &str, fan_map: &str) -> NetworkResult<()> {
        self.record(format!("set_ipip_fan_map {} {}", device, fan_map))?;
        let _ = self.with_link(device, |l| l.fan_map = Some(fan_map.to_string()));
        Ok(())
    }

    async fn add_neigh_proxy(&self, device: &str, address: IpAddr) -> NetworkResult<()> {
        self.record(format!("add_neigh_proxy {} {}", device, address))?;
        self.inner.lock().neigh_proxies.push((device.to_string(), address));
        Ok(())
    }

    async fn delete_neigh_proxy(&self, device: &str, address: IpAddr) -> NetworkResult<()> {
        self.record(format!("delete_neigh_proxy {} {}", device, address))?;
        self.inner
            .lock()
            .neigh_proxies
            .retain(|(d, a)| !(d == device && *a == address));
        Ok(())
    }

    async fn set_vlan_filtering(&self, bridge: &str, enabled: bool) -> NetworkResult<()> {
        self.record(format!("set_vlan_filtering {} {}", bridge, enabled))?;
        self.inner.lock().vlan_filtering.insert(bridge.to_string(), enabled);
        Ok(())
    }

    async fn set_default_pvid(&self, bridge: &str, pvid: u16) -> NetworkResult<()> {
        self.record(format!("set_default_pvid {} {}", bridge, pvid))?;
        self.inner.lock().pvid.insert(bridge.to_string(), pvid);
        Ok(())
    }

    async fn set_hairpin(&self, port: &str, enabled: bool) -> NetworkResult<()> {
        self.record(format!("set_hairpin {} {}", port, enabled))?;
        self.with_link(port, |l| l.hairpin = enabled)
    }

    fn ovs_installed(&self) -> bool {
        self.inner.lock().ovs_installed
    }

    async fn ovs_add_bridge(&self, name: &str) -> NetworkResult<()> {
        self.record(format!("ovs_add_bridge {}", name))?;
        self.insert_link(
            name,
            FakeLink {
                kind: "openvswitch".to_string(),
                mtu: 1500,
                ..Default::default()
            },
        )
    }

    async fn ovs_delete_bridge(&self, name: &str) -> NetworkResult<()> {
        self.record(format!("ovs_delete_bridge {}", name))?;
        self.inner.lock().links.remove(name);
        Ok(())
    }

    async fn ovs_add_port(&self, bridge: &str, port: &str) -> NetworkResult<()> {
        self.record(format!("ovs_add_port {} {}", bridge, port))?;
        self.with_link(port, |l| l.master = Some(bridge.to_string()))
    }

    async fn ovs_delete_port(&self, bridge: &str, port: &str) -> NetworkResult<()> {
        self.record(format!("ovs_delete_port {} {}", bridge, port))?;
        self.with_link(port, |l| l.master = None)
    }
}

/// Hands out increasing fake PIDs and remembers what it was asked to run.
pub struct FakeProcessRunner {
    spawned: Mutex<Vec<ProcessSpec>>,
    stopped: Mutex<Vec<i32>>,
    next_pid: Mutex<i32>,
    exit_early: Mutex<bool>,
    available: bool,
}

impl FakeProcessRunner {
    pub fn new() -> Self {
        Self {
            spawned: Mutex::new(Vec::new()),
            stopped: Mutex::new(Vec::new()),
            next_pid: Mutex::new(1000),
            exit_early: Mutex::new(false),
            available: true,
        }
    }

    pub fn without_dnsmasq() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    pub fn spawned(&self) -> Vec<ProcessSpec> {
        self.spawned.lock().clone()
    }

    pub fn spawned_program(&self, program: &str) -> Vec<ProcessSpec> {
        self.spawned().into_iter().filter(|s| s.program == program).collect()
    }

    pub fn stopped(&self) -> Vec<i32> {
        self.stopped.lock().clone()
    }

    pub fn set_exit_early(&self, exit: bool) {
        *self.exit_early.lock() = exit;
    }
}

#[async_trait]
impl ProcessRunner for FakeProcessRunner {
    async fn spawn(&self, spec: &ProcessSpec) -> NetworkResult<Subprocess> {
        self.spawned.lock().push(spec.clone());
        let mut next = self.next_pid.lock();
        *next += 1;
        Ok(Subprocess::new(*next, spec.program.clone(), spec.args.clone()))
    }

    async fn wait(&self, _process: &mut Subprocess, _deadline: Duration) -> WaitOutcome {
        if *self.exit_early.lock() {
            WaitOutcome::Exited(Some(1))
        } else {
            WaitOutcome::Running
        }
    }

    async fn stop(&self, process: &mut Subprocess) -> NetworkResult<bool> {
        self.stopped.lock().push(process.pid());
        Ok(true)
    }

    fn is_available(&self, _program: &str) -> bool {
        self.available
    }

    async fn version(&self, _program: &str) -> NetworkResult<String> {
        Ok("Dnsmasq version 2.85  Copyright (c) 2000-2021 Simon Kelley\n".to_string())
    }
}

/// Firewall that only records what it was asked to do.
#[derive(Default)]
pub struct RecordingFirewall {
    calls: Mutex<Vec<String>>,
    forwards: Mutex<HashMap<String, Vec<AddressForward>>>,
    setups: Mutex<Vec<(String, FirewallOpts)>>,
    fail_on: Mutex<Option<String>>,
}

impl RecordingFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, call: String) -> NetworkResult<()> {
        let fail = self
            .fail_on
            .lock()
            .as_deref()
            .map(|prefix| call.starts_with(prefix))
            .unwrap_or(false);
        self.calls.lock().push(call.clone());
        if fail {
            return Err(NetworkError::Firewall(format!("{} failed: injected", call)));
        }
        Ok(())
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn fail_on(&self, prefix: &str) {
        *self.fail_on.lock() = Some(prefix.to_string());
    }

    pub fn forwards(&self, network: &str) -> Vec<AddressForward> {
        self.forwards.lock().get(network).cloned().unwrap_or_default()
    }

    pub fn last_setup(&self) -> Option<(String, FirewallOpts)> {
        self.setups.lock().last().cloned()
    }
}

#[async_trait]
impl Firewall for RecordingFirewall {
    async fn network_setup(&self, network: &str, opts: &FirewallOpts) -> NetworkResult<()> {
        self.record(format!("network_setup {}", network))?;
        self.setups.lock().push((network.to_string(), opts.clone()));
        Ok(())
    }

    async fn network_clear(&self, network: &str, delete: bool, versions: &[u8]) -> NetworkResult<()> {
        self.record(format!("network_clear {} {} {:?}", network, delete, versions))
    }

    async fn network_apply_forwards(&self, network: &str, forwards: &[AddressForward]) -> NetworkResult<()> {
        self.record(format!("network_apply_forwards {} {}", network, forwards.len()))?;
        self.forwards.lock().insert(network.to_string(), forwards.to_vec());
        Ok(())
    }

    async fn network_apply_acls(&self, network: &str, opts: &AclOpts) -> NetworkResult<()> {
        self.record(format!("network_apply_acls {} {}", network, opts.acls.join(",")))
    }

    async fn instance_setup_rp_filter(&self, host_name: &str) -> NetworkResult<()> {
        self.record(format!("instance_setup_rp_filter {}", host_name))
    }

    async fn instance_clear_rp_filter(&self, host_name: &str) -> NetworkResult<()> {
        self.record(format!("instance_clear_rp_filter {}", host_name))
    }
}

/// Cluster whose members' network state is scripted by the test.
pub struct FakeCluster {
    local_address: Option<String>,
    states: Mutex<HashMap<String, NetworkResult<NetworkStateView>>>,
    notified: Mutex<Vec<(String, NetworkConfig)>>,
}

impl FakeCluster {
    pub fn new(local_address: Option<&str>) -> Self {
        Self {
            local_address: local_address.map(String::from),
            states: Mutex::new(HashMap::new()),
            notified: Mutex::new(Vec::new()),
        }
    }

    pub fn set_member_state(&self, address: &str, state: NetworkStateView) {
        self.states.lock().insert(address.to_string(), Ok(state));
    }

    pub fn set_member_unreachable(&self, address: &str) {
        self.states.lock().insert(
            address.to_string(),
            Err(NetworkError::environment(format!("Member {} unreachable", address))),
        );
    }

    pub fn notified(&self) -> Vec<(String, NetworkConfig)> {
        self.notified.lock().clone()
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    fn local_address(&self) -> Option<String> {
        self.local_address.clone()
    }

    fn member_id(&self) -> i64 {
        1
    }

    fn member_name(&self) -> String {
        "node1".to_string()
    }

    async fn network_state(&self, member_address: &str, _network: &str) -> NetworkResult<NetworkStateView> {
        match self.states.lock().get(member_address) {
            Some(Ok(state)) => Ok(state.clone()),
            Some(Err(e)) => Err(NetworkError::environment(e.to_string())),
            None => Err(NetworkError::NotFound(format!("No state for {}", member_address))),
        }
    }

    async fn member_leases(&self, _network: &str) -> NetworkResult<Vec<Lease>> {
        Ok(Vec::new())
    }

    async fn notify_update(&self, _project: &str, network: &str, config: &NetworkConfig) -> NetworkResult<()> {
        self.notified.lock().push((network.to_string(), config.clone()));
        Ok(())
    }
}

/// A sysctl tree with the entries the bridge engine reads and writes.
pub fn sysctl_tree(root: &Path, interfaces: &[&str]) {
    let write = |key: &str, value: &str| {
        let path = root.join(key);
        std::fs::create_dir_all(path.parent().expect("sysctl parent")).expect("sysctl dir");
        std::fs::write(path, value).expect("sysctl write");
    };

    write("net/ipv4/ip_forward", "0\n");
    write("net/bridge/bridge-nf-call-iptables", "1\n");
    write("net/bridge/bridge-nf-call-ip6tables", "0\n");
    for iface in ["all", "default"].iter().chain(interfaces) {
        write(&format!("net/ipv6/conf/{}/accept_ra", iface), "1\n");
        write(&format!("net/ipv6/conf/{}/forwarding", iface), "0\n");
        write(&format!("net/ipv6/conf/{}/disable_ipv6", iface), "0\n");
        write(&format!("net/ipv6/conf/{}/autoconf", iface), "1\n");
        write(&format!("net/ipv6/conf/{}/accept_dad", iface), "1\n");
    }
}

/// A complete `NetworkState` backed by fakes, a temp var dir and a temp database.
pub struct TestEnv {
    pub dir: TempDir,
    pub host: Arc<FakeHost>,
    pub runner: Arc<FakeProcessRunner>,
    pub firewall: Arc<RecordingFirewall>,
    pub cluster: Arc<FakeCluster>,
    pub bgp: Arc<BgpTable>,
    pub state: NetworkState,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_cluster(FakeCluster::new(None)).await
    }

    pub async fn with_cluster(cluster: FakeCluster) -> Self {
        Self::build(cluster, FakeProcessRunner::new()).await
    }

    pub async fn build(cluster: FakeCluster, runner: FakeProcessRunner) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let proc_root = dir.path().join("proc");
        sysctl_tree(&proc_root, &["eth0", "br0"]);

        let db_path = dir.path().join("netd.db");
        let connection = ConnectionManager::new(&db_path.to_string_lossy())
            .await
            .expect("open database");
        SchemaManager::new(connection.pool().clone())
            .initialize_schema()
            .await
            .expect("schema");

        let host = Arc::new(FakeHost::new());
        host.add_link("lo", "loopback");
        host.add_link("tunl0", "ipip");
        host.add_host_address("eth0", "198.51.100.10/24");
        host.set_gateway("198.51.100.0/24", "eth0");

        let runner = Arc::new(runner);
        let firewall = Arc::new(RecordingFirewall::new());
        let cluster = Arc::new(cluster);
        let bgp = Arc::new(BgpTable::new());

        let mut os = OsSettings::new(dir.path().join("var"), dir.path().join("log"));
        os.exec_path = dir.path().join("quilt-netd");
        os.server_fingerprint = "fingerprint".to_string();

        let state = NetworkState {
            os,
            host: host.clone(),
            runner: runner.clone(),
            firewall: firewall.clone(),
            store: Arc::new(NetworkStore::new(connection.pool().clone())),
            cluster: cluster.clone(),
            bgp: bgp.clone(),
            locks: Arc::new(LockRegistry::new()),
            events: Arc::new(NetworkEventBus::new()),
            sysctl: Sysctl::new(proc_root),
            apparmor: Arc::new(AppArmor::new(false, dir.path().join("apparmor"))),
        };

        Self {
            dir,
            host,
            runner,
            firewall,
            cluster,
            bgp,
            state,
        }
    }
}
