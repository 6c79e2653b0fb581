// Routed NIC: a veth (or tap) whose instance addresses are routed by the host
// and answered for on the parent through neighbour proxy entries.

use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;

use async_trait::async_trait;
use ipnet::IpNet;
use tracing::{debug, warn};

use super::{host_device, random_dev_name, Instance, InstanceType, NicDevice, RunConfig, RunConfigItem};
use crate::error::{ErrorContext, NetworkError, NetworkResult};
use crate::icc::network::config::{is_true, split_list};
use crate::icc::network::host::{IpFamily, Route};
use crate::icc::network::revert::{Reverter, UndoAction};
use crate::icc::network::validate::{self, each, optional, Validator};
use crate::icc::network::NetworkState;

const GATEWAY_V4: &str = "169.254.0.1";
const GATEWAY_V6: &str = "fe80::1";

const VOLATILE_HOST_NAME: &str = "host_name";
const VOLATILE_CREATED: &str = "last_state.created";

fn prefix(family: IpFamily) -> &'static str {
    match family {
        IpFamily::V4 => "ipv4",
        IpFamily::V6 => "ipv6",
    }
}

fn host_prefix_len(family: IpFamily) -> u8 {
    match family {
        IpFamily::V4 => 32,
        IpFamily::V6 => 128,
    }
}

fn rules() -> BTreeMap<&'static str, Validator> {
    let mut rules: BTreeMap<&'static str, Validator> = BTreeMap::new();
    rules.insert("type", optional(validate::is_any));
    rules.insert("nictype", optional(validate::is_any));
    rules.insert("name", optional(validate::is_interface_name));
    rules.insert("parent", optional(validate::is_interface_name));
    rules.insert("host_name", optional(validate::is_interface_name));
    rules.insert("mtu", optional(validate::is_network_mtu));
    rules.insert("hwaddr", optional(validate::is_network_mac));
    rules.insert("vlan", optional(is_vlan));
    rules.insert("gvrp", optional(validate::is_bool));
    rules.insert("limits.ingress", optional(validate::is_any));
    rules.insert("limits.egress", optional(validate::is_any));
    rules.insert("limits.max", optional(validate::is_any));
    rules.insert("ipv4.address", optional(each(validate::is_network_address_v4)));
    rules.insert("ipv6.address", optional(each(validate::is_network_address_v6)));
    rules.insert("ipv4.routes", optional(each(validate::is_network_v4)));
    rules.insert("ipv6.routes", optional(each(validate::is_network_v6)));
    rules.insert("ipv4.gateway", optional(validate::is_one_of(&["auto", "none"])));
    rules.insert("ipv6.gateway", optional(validate::is_one_of(&["auto", "none"])));
    rules.insert("ipv4.host_address", optional(validate::is_network_address_v4));
    rules.insert("ipv6.host_address", optional(validate::is_network_address_v6));
    rules.insert("ipv4.host_table", optional(validate::is_uint32));
    rules.insert("ipv6.host_table", optional(validate::is_uint32));
    rules
}

fn is_vlan(value: &str) -> Result<(), String> {
    match value.parse::<u16>() {
        Ok(id) if id <= 4094 => Ok(()),
        _ => Err(format!("Invalid VLAN ID {:?}", value)),
    }
}

fn auto_gateway(value: &str) -> bool {
    value.is_empty() || value == "auto"
}

pub struct RoutedNic {
    state: NetworkState,
    instance: Instance,
    name: String,
    config: BTreeMap<String, String>,
    volatile: BTreeMap<String, String>,
}

impl RoutedNic {
    pub fn new(state: NetworkState, instance: Instance, name: &str, config: BTreeMap<String, String>) -> Self {
        Self {
            state,
            instance,
            name: name.to_string(),
            config,
            volatile: BTreeMap::new(),
        }
    }

    /// Per-device runtime state kept across start and stop.
    pub fn volatile(&self) -> &BTreeMap<String, String> {
        &self.volatile
    }

    fn get(&self, key: &str) -> &str {
        self.config.get(key).map(String::as_str).unwrap_or("")
    }

    fn addresses(&self, family: IpFamily) -> Vec<String> {
        split_list(self.get(&format!("{}.address", prefix(family))))
    }

    fn host_address(&self, family: IpFamily) -> String {
        match self.get(&format!("{}.host_address", prefix(family))) {
            "" => match family {
                IpFamily::V4 => GATEWAY_V4.to_string(),
                IpFamily::V6 => GATEWAY_V6.to_string(),
            },
            addr => addr.to_string(),
        }
    }

    fn parent_name(&self) -> String {
        host_device(self.get("parent"), self.get("vlan"))
    }

    fn effective_host_name(&self) -> String {
        match self.get("host_name") {
            "" => self.volatile.get(VOLATILE_HOST_NAME).cloned().unwrap_or_default(),
            name => name.to_string(),
        }
    }

    async fn require_sysctl(&self, key: &str) -> NetworkResult<()> {
        let value = self
            .state
            .sysctl
            .get(key)
            .await
            .map_err(|e| NetworkError::environment(format!("Error reading net sysctl {}: {}", key, e)))?;
        if value != "1" {
            // Dots inside interface names turn into slashes in the dotted form
            let dotted: Vec<String> = key.split('/').map(|part| part.replace('.', "/")).collect();
            return Err(NetworkError::environment(format!(
                "Routed mode requires sysctl {}=1",
                dotted.join(".")
            )));
        }
        Ok(())
    }

    /// Only called for parents this device created; existing interfaces are left alone.
    async fn setup_parent_sysctls(&self, parent: &str) -> NetworkResult<()> {
        if !self.get("ipv4.address").is_empty() {
            self.state
                .sysctl
                .set(&format!("net/ipv4/conf/{}/forwarding", parent), "1")
                .await?;
        }
        if !self.get("ipv6.address").is_empty() {
            self.state
                .sysctl
                .set(&format!("net/ipv6/conf/{}/forwarding", parent), "1")
                .await?;
            self.state
                .sysctl
                .set(&format!("net/ipv6/conf/{}/proxy_ndp", parent), "1")
                .await?;
        }
        Ok(())
    }

    /// Creates the VLAN interface on the parent when it doesn't exist yet.
    /// Returns whether it was created here.
    async fn create_vlan_if_needed(&self, parent_name: &str) -> NetworkResult<bool> {
        let parent = self.get("parent");
        let vlan = self.get("vlan");
        if vlan.is_empty() || self.state.host.link_exists(parent_name).await {
            return Ok(false);
        }

        let vlan_id: u16 = vlan
            .parse()
            .map_err(|_| NetworkError::validation(format!("Invalid VLAN ID {:?}", vlan)))?;
        if is_true(self.get("gvrp")) {
            debug!(device = %self.name, "GVRP requested on VLAN parent");
        }

        self.state
            .host
            .create_vlan(parent, parent_name, vlan_id)
            .await
            .with_context(|| format!("Failed to create VLAN interface {}", parent_name))?;
        self.state.host.set_up(parent_name).await?;
        Ok(true)
    }

    /// Removes a VLAN parent unless another instance NIC still sits on it.
    async fn remove_vlan_if_unused(&self, parent_name: &str) -> NetworkResult<()> {
        let parent = self.get("parent");
        let vlan = self.get("vlan");

        let devices = self.state.store.list_nic_devices().await?;
        let in_use = devices.iter().any(|dev| {
            let this = dev.project == self.instance.project && dev.instance == self.instance.name && dev.device == self.name;
            !this
                && dev.config.get("parent").map(String::as_str) == Some(parent)
                && dev.config.get("vlan").map(String::as_str).unwrap_or("") == vlan
        });
        if in_use {
            debug!(device = %self.name, parent = %parent_name, "VLAN parent still in use");
            return Ok(());
        }

        if self.state.host.link_exists(parent_name).await {
            self.state.host.delete_link(parent_name).await?;
        }
        Ok(())
    }

    fn check_unique_auto_gateway(&self, instance: &Instance) -> NetworkResult<()> {
        for key in ["ipv4.gateway", "ipv6.gateway"] {
            if !auto_gateway(self.get(key)) {
                continue;
            }

            for (nic_name, nic) in &instance.devices {
                if nic_name == &self.name || nic.get("nictype").map(String::as_str) != Some("routed") {
                    continue;
                }
                if auto_gateway(nic.get(key).map(String::as_str).unwrap_or("")) {
                    return Err(NetworkError::validation(format!(
                        "Existing NIC {:?} already uses {:?} in auto mode",
                        nic_name, key
                    )));
                }
            }
        }
        Ok(())
    }

    async fn start_steps(&mut self, reverter: &mut Reverter) -> NetworkResult<RunConfig> {
        let host = self.state.host.clone();

        let mut parent_name = String::new();
        if !self.get("parent").is_empty() {
            parent_name = self.parent_name();
            let created = self.create_vlan_if_needed(&parent_name).await?;
            self.volatile.insert(VOLATILE_CREATED.to_string(), created.to_string());
            if created {
                reverter.add(UndoAction::DeleteLink(parent_name.clone()));
                self.setup_parent_sysctls(&parent_name).await?;
            }
        }

        let mut host_name = self.get("host_name").to_string();
        let peer_name = match self.instance.instance_type {
            InstanceType::Container => {
                if host_name.is_empty() {
                    host_name = random_dev_name("veth");
                }
                let peer = random_dev_name("veth");
                host.create_veth(&host_name, &peer)
                    .await
                    .with_context(|| format!("Failed to create veth pair {}", host_name))?;
                peer
            }
            InstanceType::VirtualMachine => {
                if host_name.is_empty() {
                    host_name = random_dev_name("tap");
                }
                host.create_tap(&host_name)
                    .await
                    .with_context(|| format!("Failed to create tap {}", host_name))?;
                host_name.clone()
            }
        };
        reverter.add(UndoAction::DeleteLink(host_name.clone()));
        self.volatile.insert(VOLATILE_HOST_NAME.to_string(), host_name.clone());

        if let Ok(mtu) = self.get("mtu").parse::<u32>() {
            host.set_mtu(&host_name, mtu).await?;
            if peer_name != host_name {
                host.set_mtu(&peer_name, mtu).await?;
            }
        }
        if !self.get("hwaddr").is_empty() && peer_name != host_name {
            host.set_mac(&peer_name, self.get("hwaddr")).await?;
        }

        // Both are best effort, the entries are missing when the protocol is disabled
        for (key, value) in [
            (format!("net/ipv6/conf/{}/accept_ra", host_name), "0"),
            (format!("net/ipv4/conf/{}/rp_filter", host_name), "1"),
        ] {
            if let Err(e) = self.state.sysctl.set(&key, value).await {
                if !e.is_not_found() {
                    return Err(e);
                }
            }
        }

        self.state
            .firewall
            .instance_setup_rp_filter(&host_name)
            .await
            .context("Error setting up reverse path filter")?;

        for family in [IpFamily::V4, IpFamily::V6] {
            let key = prefix(family);
            let addresses = self.addresses(family);
            let prefix_len = host_prefix_len(family);

            if !addresses.is_empty() {
                let gateway = format!("{}/{}", self.host_address(family), prefix_len);
                let net: IpNet = gateway
                    .parse()
                    .map_err(|_| NetworkError::validation(format!("Invalid host address {:?}", gateway)))?;
                host.add_address(&host_name, &net)
                    .await
                    .with_context(|| format!("Failed adding host gateway IP {:?}", gateway))?;

                self.state
                    .sysctl
                    .set(&format!("net/{}/conf/{}/forwarding", key, host_name), "1")
                    .await?;
            }

            for addr in &addresses {
                let destination = format!("{}/{}", addr, prefix_len);
                host.add_route(&Route::new(family, &host_name, &destination))
                    .await
                    .with_context(|| format!("Failed adding host route {:?}", destination))?;

                // The main table entry stays as well so reverse path filtering keeps passing
                let table = self.get(&format!("{}.host_table", key)).to_string();
                if !table.is_empty() {
                    host.add_route(&Route::new(family, &host_name, &destination).table(&table))
                        .await
                        .with_context(|| format!("Failed adding host route {:?} to table {:?}", destination, table))?;
                }

                if !parent_name.is_empty() {
                    let ip: IpAddr = addr
                        .parse()
                        .map_err(|_| NetworkError::validation(format!("Invalid address {:?}", addr)))?;
                    host.add_neigh_proxy(&parent_name, ip)
                        .await
                        .with_context(|| format!("Failed adding neighbour proxy {:?} to {:?}", addr, parent_name))?;
                    reverter.add(UndoAction::DeleteNeighProxy {
                        device: parent_name.clone(),
                        address: ip,
                    });
                }
            }

            let routes = split_list(self.get(&format!("{}.routes", key)));
            if !routes.is_empty() {
                let Some(via) = addresses.first() else {
                    return Err(NetworkError::validation(format!(
                        "{}.routes requires {}.address to be set",
                        key, key
                    )));
                };
                for route in routes {
                    host.add_route(&Route::new(family, &host_name, &route).via(via))
                        .await
                        .with_context(|| format!("Failed adding route {:?}", route))?;
                }
            }
        }

        let mut nic = Vec::new();
        match self.instance.instance_type {
            InstanceType::Container => {
                nic.push(RunConfigItem::new("type", "phys"));
                nic.push(RunConfigItem::new("link", peer_name));
                nic.push(RunConfigItem::new("name", self.get("name")));
                nic.push(RunConfigItem::new("flags", "up"));

                for family in [IpFamily::V4, IpFamily::V6] {
                    let key = prefix(family);
                    let addresses = self.addresses(family);

                    if !addresses.is_empty() && auto_gateway(self.get(&format!("{}.gateway", key))) {
                        nic.push(RunConfigItem::new(format!("{}.gateway", key), self.host_address(family)));
                    }

                    for addr in addresses {
                        let value = match family {
                            // No broadcast on a point to point link
                            IpFamily::V4 => format!("{}/32 0.0.0.0", addr),
                            IpFamily::V6 => format!("{}/128", addr),
                        };
                        nic.push(RunConfigItem::new(format!("{}.address", key), value));
                    }
                }
            }
            InstanceType::VirtualMachine => {
                nic.push(RunConfigItem::new("devName", self.name.clone()));
                nic.push(RunConfigItem::new("link", peer_name));
                nic.push(RunConfigItem::new("hwaddr", self.get("hwaddr")));
            }
        }

        Ok(RunConfig {
            network_interface: nic,
            run_post_stop: false,
        })
    }
}

#[async_trait]
impl NicDevice for RoutedNic {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate_config(&self, instance: &Instance) -> NetworkResult<()> {
        self.check_unique_auto_gateway(instance)?;

        let rules = rules();
        for (key, value) in &self.config {
            let validator = rules
                .get(key.as_str())
                .ok_or_else(|| NetworkError::validation(format!("Invalid device option {:?}", key)))?;
            validator(value).map_err(|e| {
                NetworkError::validation(format!("Invalid value for device option {:?}: {}", key, e))
            })?;
        }

        for key in ["ipv4.address", "ipv6.address"] {
            let mut seen = HashSet::new();
            for addr in split_list(self.get(key)) {
                if !seen.insert(addr.clone()) {
                    return Err(NetworkError::validation(format!(
                        "Duplicate address {:?} in {:?}",
                        addr, key
                    )));
                }
            }
        }

        for key in ["ipv4", "ipv6"] {
            if !self.get(&format!("{}.routes", key)).is_empty() && self.get(&format!("{}.address", key)).is_empty() {
                return Err(NetworkError::validation(format!(
                    "{}.routes requires {}.address to be set",
                    key, key
                )));
            }
        }

        Ok(())
    }

    async fn validate_environment(&self) -> NetworkResult<()> {
        if self.instance.instance_type == InstanceType::Container && self.get("name").is_empty() {
            return Err(NetworkError::environment("Requires name property to start"));
        }

        let parent = self.get("parent");
        if !parent.is_empty() && !self.state.host.link_exists(parent).await {
            return Err(NetworkError::environment(format!("Parent device {:?} doesn't exist", parent)));
        }

        if parent.is_empty() && !self.get("vlan").is_empty() {
            return Err(NetworkError::environment(
                "The vlan setting can only be used when combined with a parent interface",
            ));
        }

        if !parent.is_empty() && !self.get("ipv6.address").is_empty() {
            self.require_sysctl("net/ipv6/conf/all/forwarding").await?;
            self.require_sysctl("net/ipv6/conf/all/proxy_ndp").await?;
        }

        let effective = self.parent_name();

        // A VLAN parent that doesn't exist yet gets its sysctls set when created
        if !self.get("vlan").is_empty() && !self.state.host.link_exists(&effective).await {
            return Ok(());
        }

        if !effective.is_empty() && !self.get("ipv4.address").is_empty() {
            self.require_sysctl(&format!("net/ipv4/conf/{}/forwarding", effective))
                .await?;
        }

        if !effective.is_empty() && !self.get("ipv6.address").is_empty() {
            self.require_sysctl(&format!("net/ipv6/conf/{}/forwarding", effective))
                .await?;
            self.require_sysctl(&format!("net/ipv6/conf/{}/proxy_ndp", effective))
                .await?;
        }

        Ok(())
    }

    async fn start(&mut self) -> NetworkResult<RunConfig> {
        self.validate_environment().await?;

        // Serializes parent creation between instances starting in parallel
        let locks = self.state.locks.clone();
        let _guard = locks.shared_device().await;

        let mut reverter = Reverter::new();
        match self.start_steps(&mut reverter).await {
            Ok(run_config) => {
                reverter.success();
                debug!(instance = %self.instance.name, device = %self.name, "Started routed NIC");
                Ok(run_config)
            }
            Err(e) => {
                reverter.fail(self.state.host.as_ref()).await;
                self.volatile.remove(VOLATILE_HOST_NAME);
                self.volatile.remove(VOLATILE_CREATED);
                Err(e)
            }
        }
    }

    async fn stop(&mut self) -> NetworkResult<RunConfig> {
        Ok(RunConfig {
            network_interface: Vec::new(),
            run_post_stop: true,
        })
    }

    async fn post_stop(&mut self) -> NetworkResult<()> {
        let host = self.state.host.clone();
        let host_name = self.effective_host_name();
        let created = self.volatile.get(VOLATILE_CREATED).map(|v| is_true(v)).unwrap_or(false);
        let mut errors: Vec<NetworkError> = Vec::new();

        let parent_name = if self.get("parent").is_empty() {
            String::new()
        } else {
            self.parent_name()
        };

        // Removing the host end takes the peer with it
        if !host_name.is_empty() && host.link_exists(&host_name).await {
            if let Err(e) = host.delete_link(&host_name).await {
                errors.push(NetworkError::Context {
                    context: format!("Failed to remove interface {:?}", host_name),
                    source: Box::new(e),
                });
            }
        }

        if !parent_name.is_empty() {
            for family in [IpFamily::V4, IpFamily::V6] {
                for addr in self.addresses(family) {
                    if let Ok(ip) = addr.parse::<IpAddr>() {
                        let _ = host.delete_neigh_proxy(&parent_name, ip).await;
                    }
                }
            }
        }

        if created {
            if let Err(e) = self.remove_vlan_if_unused(&parent_name).await {
                errors.push(e);
            }
        }

        if !host_name.is_empty() {
            if let Err(e) = self.state.firewall.instance_clear_rp_filter(&host_name).await {
                errors.push(e);
            }
        }

        self.volatile.remove(VOLATILE_HOST_NAME);
        self.volatile.remove(VOLATILE_CREATED);

        let mut errors = errors.into_iter();
        match errors.next() {
            None => Ok(()),
            Some(first) => {
                for e in errors {
                    warn!(device = %self.name, err = %e, "Additional post-stop failure");
                }
                Err(first)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::icc::network::testing::TestEnv;
    use crate::sync::network::InstanceDevice;

    fn conf(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn container(devices: &[(&str, BTreeMap<String, String>)]) -> Instance {
        Instance {
            project: "default".to_string(),
            name: "c1".to_string(),
            instance_type: InstanceType::Container,
            devices: devices.iter().map(|(n, c)| (n.to_string(), c.clone())).collect(),
        }
    }

    /// Sysctl directories for interfaces the test creates.
    fn proc_dirs(env: &TestEnv, names: &[&str]) {
        for name in names {
            for family in ["ipv4", "ipv6"] {
                let dir = env.state.sysctl.path(&format!("net/{}/conf/{}", family, name));
                std::fs::create_dir_all(dir).unwrap();
            }
        }
    }

    fn set_sysctl(env: &TestEnv, key: &str, value: &str) {
        let path = env.state.sysctl.path(key);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, value).unwrap();
    }

    fn nic(env: &TestEnv, config: BTreeMap<String, String>) -> RoutedNic {
        RoutedNic::new(env.state.clone(), container(&[]), "eth0", config)
    }

    #[tokio::test]
    async fn test_validate_config() {
        let env = TestEnv::new().await;
        let instance = container(&[]);

        let ok = nic(
            &env,
            conf(&[
                ("type", "nic"),
                ("nictype", "routed"),
                ("ipv4.address", "192.0.2.10, 192.0.2.11"),
                ("ipv4.routes", "198.51.100.0/24"),
                ("vlan", "10"),
            ]),
        );
        ok.validate_config(&instance).unwrap();

        let dup = nic(&env, conf(&[("ipv4.address", "192.0.2.10,192.0.2.10")]));
        assert!(dup.validate_config(&instance).unwrap_err().to_string().contains("Duplicate address"));

        let routes_only = nic(&env, conf(&[("ipv6.routes", "2001:db8:1::/64")]));
        assert!(routes_only
            .validate_config(&instance)
            .unwrap_err()
            .to_string()
            .contains("ipv6.routes requires ipv6.address"));

        for bad in [
            conf(&[("ipv4.address", "2001:db8::1")]),
            conf(&[("ipv4.routes", "198.51.100.1/24")]),
            conf(&[("vlan", "5000")]),
            conf(&[("bogus", "1")]),
        ] {
            assert!(nic(&env, bad).validate_config(&instance).unwrap_err().is_validation());
        }
    }

    #[tokio::test]
    async fn test_single_auto_gateway_per_instance() {
        let env = TestEnv::new().await;
        let instance = container(&[
            ("eth0", conf(&[("nictype", "routed")])),
            ("eth1", conf(&[("nictype", "routed"), ("ipv4.gateway", "auto")])),
            ("eth2", conf(&[("nictype", "bridged")])),
        ]);

        let err = nic(&env, conf(&[])).validate_config(&instance).unwrap_err();
        assert!(err.to_string().contains("eth1"));

        let explicit = container(&[(
            "eth1",
            conf(&[("nictype", "routed"), ("ipv4.gateway", "none"), ("ipv6.gateway", "none")]),
        )]);
        nic(&env, conf(&[])).validate_config(&explicit).unwrap();
    }

    #[tokio::test]
    async fn test_validate_environment() {
        let env = TestEnv::new().await;

        let unnamed = nic(&env, conf(&[]));
        assert!(unnamed.validate_environment().await.unwrap_err().to_string().contains("name"));

        let missing_parent = nic(&env, conf(&[("name", "eth0"), ("parent", "bond0")]));
        assert!(missing_parent
            .validate_environment()
            .await
            .unwrap_err()
            .to_string()
            .contains("doesn't exist"));

        let vlan_only = nic(&env, conf(&[("name", "eth0"), ("vlan", "10")]));
        assert!(vlan_only.validate_environment().await.is_err());

        env.host.add_link("eth0", "ether");
        proc_dirs(&env, &["eth0"]);
        set_sysctl(&env, "net/ipv4/conf/eth0/forwarding", "0\n");
        let v4 = nic(&env, conf(&[("name", "eth0"), ("parent", "eth0"), ("ipv4.address", "192.0.2.10")]));
        let err = v4.validate_environment().await.unwrap_err();
        assert_eq!(err.to_string(), "Routed mode requires sysctl net.ipv4.conf.eth0.forwarding=1");

        set_sysctl(&env, "net/ipv4/conf/eth0/forwarding", "1\n");
        v4.validate_environment().await.unwrap();

        let v6 = nic(&env, conf(&[("name", "eth0"), ("parent", "eth0"), ("ipv6.address", "2001:db8::10")]));
        assert!(v6
            .validate_environment()
            .await
            .unwrap_err()
            .to_string()
            .contains("net.ipv6.conf.all.forwarding"));

        set_sysctl(&env, "net/ipv6/conf/all/forwarding", "1\n");
        set_sysctl(&env, "net/ipv6/conf/all/proxy_ndp", "1\n");
        set_sysctl(&env, "net/ipv6/conf/eth0/forwarding", "1\n");
        set_sysctl(&env, "net/ipv6/conf/eth0/proxy_ndp", "1\n");
        v6.validate_environment().await.unwrap();

        // A VLAN parent still to be created skips the per-interface checks
        let vlan = nic(
            &env,
            conf(&[("name", "eth0"), ("parent", "eth0"), ("vlan", "20"), ("ipv4.address", "192.0.2.10")]),
        );
        vlan.validate_environment().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_without_parent() {
        let env = TestEnv::new().await;
        proc_dirs(&env, &["vethr1"]);

        let mut dev = nic(
            &env,
            conf(&[
                ("name", "eth0"),
                ("host_name", "vethr1"),
                ("mtu", "1400"),
                ("ipv4.address", "192.0.2.10"),
                ("ipv4.routes", "198.51.100.0/24"),
                ("ipv4.host_table", "100"),
                ("ipv6.address", "2001:db8::10"),
            ]),
        );
        let run = dev.start().await.unwrap();

        let link = env.host.link("vethr1").unwrap();
        assert_eq!(link.mtu, 1400);
        let addrs: Vec<String> = link.addresses.iter().map(|a| a.to_string()).collect();
        assert_eq!(addrs, vec!["169.254.0.1/32", "fe80::1/128"]);

        let routes: Vec<(String, Option<String>, Option<String>)> = env
            .host
            .routes()
            .into_iter()
            .filter(|r| r.device == "vethr1")
            .map(|r| (r.destination, r.table, r.via))
            .collect();
        assert_eq!(
            routes,
            vec![
                ("192.0.2.10/32".to_string(), None, None),
                ("192.0.2.10/32".to_string(), Some("100".to_string()), None),
                ("198.51.100.0/24".to_string(), None, Some("192.0.2.10".to_string())),
                ("2001:db8::10/128".to_string(), None, None),
            ]
        );

        assert_eq!(env.state.sysctl.get("net/ipv4/conf/vethr1/forwarding").await.unwrap(), "1");
        assert_eq!(env.state.sysctl.get("net/ipv6/conf/vethr1/accept_ra").await.unwrap(), "0");
        assert_eq!(env.state.sysctl.get("net/ipv4/conf/vethr1/rp_filter").await.unwrap(), "1");
        assert!(env.firewall.calls().contains(&"instance_setup_rp_filter vethr1".to_string()));

        assert_eq!(run.get("type"), vec!["phys"]);
        assert_eq!(run.get("name"), vec!["eth0"]);
        assert_eq!(run.get("ipv4.gateway"), vec!["169.254.0.1"]);
        assert_eq!(run.get("ipv4.address"), vec!["192.0.2.10/32 0.0.0.0"]);
        assert_eq!(run.get("ipv6.address"), vec!["2001:db8::10/128"]);
        assert!(env.host.link(run.get("link")[0]).is_some());
        assert!(env.host.neigh_proxies().is_empty());
        assert_eq!(dev.volatile().get("host_name").map(String::as_str), Some("vethr1"));
    }

    #[tokio::test]
    async fn test_vlan_parent_lifecycle() {
        let env = TestEnv::new().await;
        env.host.add_link("eth0", "ether");
        proc_dirs(&env, &["eth0.10", "vethr2"]);

        let config = conf(&[
            ("nictype", "routed"),
            ("name", "eth0"),
            ("parent", "eth0"),
            ("vlan", "10"),
            ("host_name", "vethr2"),
            ("ipv4.address", "192.0.2.20,192.0.2.21"),
            ("ipv4.gateway", "none"),
        ]);
        let mut dev = nic(&env, config.clone());
        let run = dev.start().await.unwrap();

        assert_eq!(env.host.link("eth0.10").unwrap().kind, "vlan");
        assert_eq!(env.state.sysctl.get("net/ipv4/conf/eth0.10/forwarding").await.unwrap(), "1");
        assert_eq!(env.host.neigh_proxies().len(), 2);
        assert!(run.get("ipv4.gateway").is_empty());
        assert_eq!(dev.volatile().get("last_state.created").map(String::as_str), Some("true"));

        let stop = dev.stop().await.unwrap();
        assert!(stop.run_post_stop);
        dev.post_stop().await.unwrap();

        assert!(env.host.link("vethr2").is_none());
        assert!(env.host.link("eth0.10").is_none());
        assert!(env.host.neigh_proxies().is_empty());
        assert!(env.firewall.calls().contains(&"instance_clear_rp_filter vethr2".to_string()));
        assert!(dev.volatile().is_empty());

        // Another instance on the same VLAN keeps it alive
        env.state
            .store
            .upsert_instance_device(&InstanceDevice {
                project: "default".to_string(),
                instance: "c2".to_string(),
                device: "eth0".to_string(),
                device_type: "nic".to_string(),
                config,
            })
            .await
            .unwrap();

        dev.start().await.unwrap();
        assert_eq!(dev.volatile().get("last_state.created").map(String::as_str), Some("true"));
        dev.post_stop().await.unwrap();
        assert!(env.host.link("vethr2").is_none());
        assert!(env.host.link("eth0.10").is_some());
    }

    #[tokio::test]
    async fn test_start_failure_reverts() {
        let env = TestEnv::new().await;
        env.host.add_link("eth0", "ether");
        proc_dirs(&env, &["eth0.30", "vethr3"]);
        env.host.fail_on("add_route vethr3 203.0.113.0/24");

        let mut dev = nic(
            &env,
            conf(&[
                ("name", "eth0"),
                ("parent", "eth0"),
                ("vlan", "30"),
                ("host_name", "vethr3"),
                ("ipv4.address", "192.0.2.30"),
                ("ipv4.routes", "203.0.113.0/24"),
            ]),
        );
        let err = dev.start().await.unwrap_err();
        assert!(err.to_string().contains("Failed adding route"));

        assert!(env.host.link("vethr3").is_none());
        assert!(env.host.link("eth0.30").is_none());
        assert!(env.host.neigh_proxies().is_empty());
        assert!(dev.volatile().get("host_name").is_none());
    }

    #[tokio::test]
    async fn test_vm_uses_tap() {
        let env = TestEnv::new().await;
        let mut instance = container(&[]);
        instance.instance_type = InstanceType::VirtualMachine;

        let mut dev = RoutedNic::new(env.state.clone(), instance, "eth0", conf(&[("hwaddr", "00:16:3e:00:00:01")]));
        let run = dev.start().await.unwrap();

        let tap = run.get("link")[0].to_string();
        assert!(tap.starts_with("tap"));
        assert_eq!(env.host.link(&tap).unwrap().kind, "tun");
        assert_eq!(run.get("devName"), vec!["eth0"]);
        assert_eq!(run.get("hwaddr"), vec!["00:16:3e:00:00:01"]);
    }
}
