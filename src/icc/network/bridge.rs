//! Managed bridge lifecycle.
//!
//! A [`Bridge`] drives one network record through create, start, update, stop,
//! rename and delete. `setup` is the heart of it: it converges the kernel, the
//! firewall and the DNS/DHCP helpers onto the stored config and undoes every
//! interface it created if any step fails.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

use ipnet::{IpNet, Ipv4Net};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::apparmor::{dnsmasq_profile_name, forkdns_profile_name};
use super::bgp;
use super::cluster::Heartbeat;
use super::config::{split_list, NetworkConfig};
use super::dnsmasq::{self, DnsmasqCommand, DottedVersion};
use super::driver::{attach_interface, detach_interface, BridgeDriver};
use super::fan::{self, FanType, DEFAULT_OVERLAY};
use super::firewall::{AclOpts, AddressForward, FeatureOpts, FirewallOpts, SnatOpts};
use super::forkdns;
use super::forward::{self, ExternalSubnetUsage, ForwardRequest};
use super::host::{HostNetwork, IpFamily, Route, TunnelSpec, VxlanSpec};
use super::leases::{self, Lease};
use super::revert::{Reverter, UndoAction};
use super::state::{NetworkPaths, NetworkState};
use super::subnet::{get_ip, is_global_unicast, parse_ip_to_net, random_subnet_v4, random_subnet_v6, stable_mac};
use super::supervisor::{kill_from_pid_file, save_or_kill, ProcessSpec, WaitOutcome};
use super::validate::{check_cluster_wide_mac_safe, dhcp_expiry_arg, dhcpv4_subnet_from_config, dhcpv6_subnet, validate_config};
use crate::daemon::events::NetworkEvent;
use crate::error::{ErrorContext, NetworkError, NetworkResult};
use crate::sync::network::{NetworkForwardRecord, NetworkRecord};
use crate::sync::NetworkStatus;
use crate::utils::Timer;

pub const WARNING_STARTUP_FAILURE: &str = "NetworkStartupFailure";
pub const WARNING_LARGE_IPV6_PREFIX: &str = "LargerIPv6PrefixThanSupported";
pub const WARNING_APPARMOR_RAW_DNSMASQ: &str = "AppArmorDisabledDueToRawDnsmasq";
pub const WARNING_BRIDGE_NETFILTER: &str = "ProxyBridgeNetfilterNotEnabled";

/// How long a freshly spawned dnsmasq gets to prove it did not exit immediately.
const DNSMASQ_STARTUP_WAIT: Duration = Duration::from_millis(500);

/// Who is asking. Requests relayed from another cluster member must not be relayed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    Normal,
    Notifier,
}

/// Replacement description and config of a network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPut {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

/// Outcome of the fan part of setup that later steps depend on.
struct FanSetup {
    overlay: String,
    address: String,
}

/// One managed bridge network bound to its store record.
pub struct Bridge {
    state: NetworkState,
    id: i64,
    project: String,
    name: String,
    description: String,
    status: NetworkStatus,
    config: NetworkConfig,
}

impl Bridge {
    pub fn from_record(state: NetworkState, record: NetworkRecord) -> Self {
        Self {
            state,
            id: record.id,
            project: record.project,
            name: record.name,
            description: record.description,
            status: record.status,
            config: NetworkConfig::from(record.config),
        }
    }

    /// A bridge with no stored record yet, used to fill and validate a create request.
    pub fn new(state: NetworkState, project: &str, name: &str, description: &str) -> Self {
        Self {
            state,
            id: 0,
            project: project.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            status: NetworkStatus::Pending,
            config: NetworkConfig::new(),
        }
    }

    pub async fn load(state: &NetworkState, project: &str, name: &str) -> NetworkResult<Self> {
        let record = state.store.get_network(project, name).await?;
        Ok(Self::from_record(state.clone(), record))
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn status(&self) -> NetworkStatus {
        self.status
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn paths(&self) -> NetworkPaths {
        self.state.os.network_paths(&self.name)
    }

    fn host(&self) -> &dyn HostNetwork {
        self.state.host.as_ref()
    }

    pub async fn is_running(&self) -> bool {
        self.host().link_exists(&self.name).await
    }

    async fn upsert_warning(&self, type_code: &str, message: &str) {
        if let Err(e) = self
            .state
            .store
            .upsert_warning(&self.project, &self.name, type_code, message)
            .await
        {
            warn!(network = %self.name, err = %e, "Failed to create warning");
        }
    }

    async fn resolve_warning(&self, type_code: &str) {
        if let Err(e) = self
            .state
            .store
            .resolve_warning(&self.project, &self.name, type_code)
            .await
        {
            warn!(network = %self.name, err = %e, "Failed to resolve warning");
        }
    }

    /// IPv4 subnet dnsmasq hands leases out of. In fan mode it is read from the live bridge.
    pub async fn dhcpv4_subnet(&self) -> Option<IpNet> {
        self.dhcpv4_subnet_for(&self.config).await
    }

    async fn dhcpv4_subnet_for(&self, config: &NetworkConfig) -> Option<IpNet> {
        if !config.is_fan() {
            return dhcpv4_subnet_from_config(config);
        }
        if !config.has_dhcpv4() {
            return None;
        }

        let addresses = self.host().addresses(Some(&self.name)).await.ok()?;
        addresses
            .iter()
            .find(|a| a.address.is_ipv4())
            .and_then(|a| IpNet::new(a.address, a.prefix_len).ok())
            .map(|net| net.trunc())
    }

    /// Validate `config` for this network, checking ACLs against the store.
    pub async fn validate(&self, config: &NetworkConfig) -> NetworkResult<()> {
        let acls = self.state.store.list_acl_names(&self.project).await?;
        let fan_subnet = if config.is_fan() {
            self.dhcpv4_subnet_for(config).await
        } else {
            None
        };
        validate_config(&self.name, config, &acls, fan_subnet)
    }

    /// Defaults for a newly created network, followed by auto value expansion.
    pub async fn fill_config(&self, config: &mut NetworkConfig) -> NetworkResult<()> {
        if config.is_fan() {
            if config.get("fan.underlay_subnet").is_empty() {
                config.set("fan.underlay_subnet", "auto");
            }
            if config.get("ipv4.nat").is_empty() {
                config.set("ipv4.nat", "true");
            }
        } else {
            if config.get("ipv4.address").is_empty() {
                config.set("ipv4.address", "auto");
            }
            if config.get("ipv4.address") == "auto" && config.get("ipv4.nat").is_empty() {
                config.set("ipv4.nat", "true");
            }

            if config.get("ipv6.address").is_empty() && self.state.ipv6_available().await {
                config.set("ipv6.address", "auto");
            }
            if config.get("ipv6.address") == "auto" && config.get("ipv6.nat").is_empty() {
                config.set("ipv6.nat", "true");
            }
        }

        self.populate_auto_config(config).await
    }

    /// Replace `auto` values with concrete subnets, then re-validate if anything changed.
    pub async fn populate_auto_config(&self, config: &mut NetworkConfig) -> NetworkResult<()> {
        let mut changed = false;

        if config.get("ipv4.address") == "auto" {
            let used = self.host().used_subnets().await?;
            let subnet = random_subnet_v4(&mut rand::thread_rng(), &used)?;
            config.set("ipv4.address", subnet);
            changed = true;
        }

        if config.get("ipv6.address") == "auto" {
            let used = self.host().used_subnets().await?;
            let subnet = random_subnet_v6(&mut rand::thread_rng(), &used)?;
            config.set("ipv6.address", subnet);
            changed = true;
        }

        if config.get("fan.underlay_subnet") == "auto" {
            let (subnet, _) = self.host().default_gateway_v4().await?;
            config.set("fan.underlay_subnet", subnet.to_string());
            changed = true;
        }

        if changed {
            self.validate(config).await?;
        }
        Ok(())
    }

    /// Refuse to manage an interface that already exists on the host.
    pub async fn create(&self) -> NetworkResult<()> {
        debug!(network = %self.name, "Create");
        if self.is_running().await {
            return Err(NetworkError::Conflict(format!(
                "Network interface {:?} already exists",
                self.name
            )));
        }
        self.state.events.emit(NetworkEvent::created(&self.name)).await;
        Ok(())
    }

    pub async fn start(&self) -> NetworkResult<()> {
        info!(network = %self.name, "Starting network");
        let timer = Timer::with_network("Network start", &self.name);

        match self.setup(None).await {
            Ok(()) => {
                self.resolve_warning(WARNING_STARTUP_FAILURE).await;
                self.state
                    .events
                    .emit(NetworkEvent::started(&self.name, timer.elapsed_ms()))
                    .await;
                timer.log_completion();
                Ok(())
            }
            Err(e) => {
                self.upsert_warning(WARNING_STARTUP_FAILURE, &e.to_string()).await;
                self.state
                    .events
                    .emit(NetworkEvent::setup_failed(&self.name, &e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    /// Converge the host onto the current config. `old_config` is the config being replaced
    /// on update, used to clear firewall state and BGP peers that no longer apply.
    pub async fn setup(&self, old_config: Option<&NetworkConfig>) -> NetworkResult<()> {
        if self.state.os.mock_mode {
            return Ok(());
        }

        debug!(network = %self.name, "Setting up network");
        let timer = Timer::with_network("Network setup", &self.name);

        let mut revert = Reverter::new();
        match self.setup_steps(old_config, &mut revert).await {
            Ok(()) => {
                revert.success();
                timer.log_completion();
                Ok(())
            }
            Err(e) => {
                error!(network = %self.name, err = %e, "Network setup failed, reverting");
                revert.fail(self.host()).await;
                Err(e)
            }
        }
    }

    /// Bridge MTU before any fan adjustment: explicit, then tunnels, then fan, else unset.
    fn configured_mtu(&self, has_tunnels: bool) -> NetworkResult<Option<u32>> {
        let value = self.config.get("bridge.mtu");
        if !value.is_empty() {
            let mtu = value
                .parse()
                .map_err(|_| NetworkError::validation(format!("Invalid bridge.mtu {:?}", value)))?;
            return Ok(Some(mtu));
        }
        if has_tunnels {
            return Ok(Some(1400));
        }
        if self.config.is_fan() {
            return Ok(Some(FanType::from_config(self.config.get("fan.type")).max_mtu()));
        }
        Ok(None)
    }

    async fn boot_routes(&self, family: IpFamily) -> NetworkResult<Vec<String>> {
        self.host().show_routes(&self.name, family, "boot").await
    }

    /// Put back routes that instances added with proto boot before addresses were flushed.
    async fn apply_boot_routes(&self, family: IpFamily, routes: Vec<String>) {
        for route in routes {
            let fields: Vec<String> = route.split_whitespace().map(String::from).collect();
            if let Err(e) = self.host().replace_route(&self.name, family, "boot", &fields).await {
                error!(network = %self.name, route = %route, err = %e, "Failed to restore route");
            }
        }
    }

    async fn add_static_routes(&self, family: IpFamily, key: &str) -> NetworkResult<()> {
        for destination in split_list(self.config.get(key)) {
            let route = Route::new(family, &self.name, &destination).proto("static");
            self.host().add_route(&route).await?;
        }
        Ok(())
    }

    fn snat_opts(&self, family: &str, subnet: IpNet) -> NetworkResult<Option<SnatOpts>> {
        if !self.config.is_true(&format!("{}.nat", family)) {
            return Ok(None);
        }

        let key = format!("{}.nat.address", family);
        let snat_address = match self.config.get(&key) {
            "" => None,
            value => Some(
                value
                    .parse::<IpAddr>()
                    .map_err(|_| NetworkError::validation(format!("Invalid {} {:?}", key, value)))?,
            ),
        };

        Ok(Some(SnatOpts {
            snat_address,
            subnet,
            append: self.config.get(&format!("{}.nat.order", family)) == "after",
        }))
    }

    async fn setup_steps(
        &self,
        old_config: Option<&NetworkConfig>,
        revert: &mut Reverter,
    ) -> NetworkResult<()> {
        let host = self.host();
        let config = &self.config;
        let paths = self.paths();
        let driver = BridgeDriver::from_config(config);

        tokio::fs::create_dir_all(&paths.dir)
            .await
            .with_context(|| format!("Failed creating {}", paths.dir.display()))?;
        tokio::fs::create_dir_all(&self.state.os.log_dir)
            .await
            .with_context(|| format!("Failed creating {}", self.state.os.log_dir.display()))?;

        // Step 1: bridge interface
        if !self.is_running().await {
            revert.add(driver.add(host, &self.name).await?);
        }

        let tunnels = config.tunnels();

        if config.has_ipv6_address() {
            if !self.state.sysctl.exists("net/ipv6") {
                return Err(NetworkError::environment(
                    "Network has ipv6.address but kernel IPv6 support is missing",
                ));
            }
            self.state
                .sysctl
                .set(&format!("net/ipv6/conf/{}/autoconf", self.name), "0")
                .await?;
            self.state
                .sysctl
                .set(&format!("net/ipv6/conf/{}/accept_dad", self.name), "0")
                .await?;
        }

        // Step 2: leftover tunnels and MTU placeholder from a previous run
        let prefix = format!("{}-", self.name);
        for link in host.list_links().await? {
            if link.starts_with(&prefix) {
                host.delete_link(&link).await?;
            }
        }

        // Step 3: MTU, pinned by a dummy port so it survives ports coming and going
        let configured_mtu = self.configured_mtu(!tunnels.is_empty())?;
        let mtu_link = format!("{}-mtu", self.name);
        if let Some(mtu) = configured_mtu {
            if driver.supports_mtu_placeholder() && host.create_dummy(&mtu_link, mtu).await.is_ok() {
                revert.add(UndoAction::DeleteLink(mtu_link.clone()));
                if host.set_up(&mtu_link).await.is_ok() {
                    let _ = attach_interface(host, &self.name, &mtu_link).await;
                }
            }
        }
        let mut mtu = configured_mtu.unwrap_or(1500);
        driver.set_mtu(host, &self.name, mtu).await?;

        // Step 4: MAC address
        let mut hwaddr = config.get("bridge.hwaddr").to_string();
        if hwaddr.is_empty() {
            let seed_member = if check_cluster_wide_mac_safe(config).is_err() {
                self.state.cluster.member_id()
            } else {
                0
            };
            let seed = format!("{}.{}.{}", self.state.os.server_fingerprint, seed_member, self.id);
            hwaddr = stable_mac(&seed);
            debug!(network = %self.name, seed = %seed, hwaddr = %hwaddr, "Stable MAC generated");
        }
        driver.set_address(host, &self.name, &hwaddr).await?;

        if driver == BridgeDriver::Native {
            if let Err(e) = host.set_vlan_filtering(&self.name, true).await {
                warn!(network = %self.name, err = %e, "Failed enabling VLAN filtering");
            }
            if let Err(e) = host.set_default_pvid(&self.name, 1).await {
                warn!(network = %self.name, err = %e, "Failed setting default PVID");
            }
        }
        driver.set_up(host, &self.name).await?;

        // Step 5: external interfaces
        for iface in config.external_interfaces() {
            if !host.link_exists(&iface).await {
                warn!(network = %self.name, interface = %iface, "Skipping attaching missing external interface");
                continue;
            }

            let configured = host
                .addresses(Some(&iface))
                .await
                .map(|addrs| addrs.iter().any(|a| is_global_unicast(&a.address)))
                .unwrap_or(false);
            if configured {
                return Err(NetworkError::Conflict(
                    "Only unconfigured network interfaces can be bridged".to_string(),
                ));
            }
            attach_interface(host, &self.name, &iface).await?;
        }

        // Step 6: drop firewall state of both the new and the replaced config
        let mut versions = Vec::new();
        if config.uses_ipv4_firewall() || old_config.map(|c| c.uses_ipv4_firewall()).unwrap_or(false) {
            versions.push(4);
        }
        if config.uses_ipv6_firewall() || old_config.map(|c| c.uses_ipv6_firewall()).unwrap_or(false) {
            versions.push(6);
        }
        if !versions.is_empty() {
            self.state
                .firewall
                .network_clear(&self.name, false, &versions)
                .await
                .context("Failed clearing firewall")?;
        }

        let mut fw = FirewallOpts {
            features_v4: config.has_ipv4_firewall().then(FeatureOpts::default),
            features_v6: config.has_ipv6_firewall().then(FeatureOpts::default),
            acl: !config.get("security.acls").is_empty(),
            ..Default::default()
        };

        // Step 7: IPv4
        let boot_v4 = self.boot_routes(IpFamily::V4).await?;
        host.flush_addresses(&self.name, IpFamily::V4).await?;
        host.flush_routes(&self.name, IpFamily::V4, Some("static")).await?;

        if config.is_fan() || config.has_ipv4_address() {
            if let Some(features) = fw.features_v4.as_mut() {
                if config.has_dhcpv4() {
                    features.icmp_dhcp_dns_access = true;
                }
            }

            if config.is_fan() || config.is_true_or_empty("ipv4.routing") {
                self.state.sysctl.set("net/ipv4/ip_forward", "1").await?;
                if let Some(features) = fw.features_v4.as_mut() {
                    features.forwarding_allow = true;
                }
            }
        }

        let version_output = self.state.runner.version("dnsmasq").await;
        let version = match version_output {
            Ok(output) => DottedVersion::from_dnsmasq_output(&output)?,
            Err(e) if config.uses_dnsmasq() => return Err(e),
            // Without dnsmasq the command line is never used
            Err(_) => DottedVersion::parse("0")?,
        };
        let quiet = !tracing::enabled!(tracing::Level::DEBUG);
        let mut dnsmasq_cmd = DnsmasqCommand::new(&self.name, &version, quiet);

        if config.has_ipv4_address() {
            let net: IpNet = config
                .get("ipv4.address")
                .parse()
                .map_err(|_| NetworkError::validation("Failed parsing ipv4.address"))?;
            dnsmasq_cmd.arg(format!("--listen-address={}", net.addr()));

            if let Some(subnet) = dhcpv4_subnet_from_config(config) {
                dnsmasq_cmd.enable_dhcp(&paths.leases, &paths.hosts);

                if !config.get("ipv4.dhcp.gateway").is_empty() {
                    dnsmasq_cmd.arg(format!("--dhcp-option-force=3,{}", config.get("ipv4.dhcp.gateway")));
                }
                if mtu != 1500 {
                    dnsmasq_cmd.arg(format!("--dhcp-option-force=26,{}", mtu));
                }
                let search = config.get("dns.search").trim();
                if !search.is_empty() {
                    dnsmasq_cmd.arg(format!("--dhcp-option-force=119,{}", search));
                }

                let expiry = dhcp_expiry_arg(config.get("ipv4.dhcp.expiry"));
                let ranges = split_list(config.get("ipv4.dhcp.ranges"));
                if ranges.is_empty() {
                    dnsmasq_cmd.dhcp_range(format!(
                        "{},{},{}",
                        get_ip(&subnet, 2),
                        get_ip(&subnet, -2),
                        expiry
                    ));
                } else {
                    for range in ranges {
                        dnsmasq_cmd.dhcp_range(format!("{},{}", dnsmasq::range_arg(&range), expiry));
                    }
                }
            }

            host.add_address(&self.name, &net).await?;

            fw.snat_v4 = self.snat_opts("ipv4", net.trunc())?;
            self.add_static_routes(IpFamily::V4, "ipv4.routes").await?;
            self.apply_boot_routes(IpFamily::V4, boot_v4).await;
        }

        // Step 8: IPv6
        let boot_v6 = self.boot_routes(IpFamily::V6).await?;
        host.flush_addresses(&self.name, IpFamily::V6).await?;
        host.flush_routes(&self.name, IpFamily::V6, Some("static")).await?;

        if config.has_ipv6_address() {
            self.state
                .sysctl
                .set(&format!("net/ipv6/conf/{}/disable_ipv6", self.name), "0")
                .await?;

            let net: IpNet = config
                .get("ipv6.address")
                .parse()
                .map_err(|_| NetworkError::validation("Failed parsing ipv6.address"))?;
            let prefix_len = net.prefix_len();
            if prefix_len > 64 {
                let msg = "IPv6 networks with a prefix larger than 64 aren't properly supported by dnsmasq";
                warn!(network = %self.name, "{}", msg);
                self.upsert_warning(WARNING_LARGE_IPV6_PREFIX, msg).await;
            } else {
                self.resolve_warning(WARNING_LARGE_IPV6_PREFIX).await;
            }

            dnsmasq_cmd
                .arg(format!("--listen-address={}", net.addr()))
                .arg("--enable-ra");

            if let Some(subnet) = dhcpv6_subnet(config) {
                if let Some(features) = fw.features_v6.as_mut() {
                    features.icmp_dhcp_dns_access = true;
                }
                dnsmasq_cmd.enable_dhcp(&paths.leases, &paths.hosts);

                if config.is_true("ipv6.dhcp.stateful") {
                    let expiry = dhcp_expiry_arg(config.get("ipv6.dhcp.expiry"));
                    let ranges = split_list(config.get("ipv6.dhcp.ranges"));
                    if ranges.is_empty() {
                        dnsmasq_cmd.dhcp_range(format!(
                            "{},{},{},{}",
                            get_ip(&subnet, 2),
                            get_ip(&subnet, -1),
                            prefix_len,
                            expiry
                        ));
                    } else {
                        for range in ranges {
                            dnsmasq_cmd.dhcp_range(format!(
                                "{},{},{}",
                                dnsmasq::range_arg(&range),
                                prefix_len,
                                expiry
                            ));
                        }
                    }
                } else {
                    dnsmasq_cmd.dhcp_range(format!("::,constructor:{},ra-stateless,ra-names", self.name));
                }
            } else {
                dnsmasq_cmd.dhcp_range(format!("::,constructor:{},ra-only", self.name));
            }

            if config.is_true_or_empty("ipv6.routing") {
                self.enable_ipv6_forwarding().await?;
                if let Some(features) = fw.features_v6.as_mut() {
                    features.forwarding_allow = true;
                }
            }

            host.add_address(&self.name, &net).await?;

            fw.snat_v6 = self.snat_opts("ipv6", net.trunc())?;
            self.add_static_routes(IpFamily::V6, "ipv6.routes").await?;
            self.apply_boot_routes(IpFamily::V6, boot_v6).await;
        }

        // Step 9: fan overlay
        let mut fan_setup = None;
        if config.is_fan() {
            let fan_state = self.setup_fan(driver, &mut mtu, &mut dnsmasq_cmd, revert).await?;
            if config.is_true("ipv4.nat") {
                let overlay: Ipv4Net = fan_state
                    .overlay
                    .parse()
                    .map_err(|_| NetworkError::validation("Failed parsing fan.overlay_subnet"))?;
                fw.snat_v4 = Some(SnatOpts {
                    snat_address: None,
                    subnet: IpNet::V4(overlay),
                    append: config.get("ipv4.nat.order") == "after",
                });
            }
            fan_setup = Some(fan_state);
        }

        // A cluster address means this member is, or is about to be, clustered
        let dns_clustered = fan_setup.as_ref().filter(|_| self.state.cluster.local_address().is_some());

        // Step 10: user tunnels
        for tunnel in &tunnels {
            self.setup_tunnel(tunnel, mtu, revert).await?;
        }

        // Step 11: helpers
        self.state
            .apparmor
            .network_load(&self.name, &paths.dir, &self.state.os.log_dir, &self.state.os.exec_path)
            .await?;

        kill_from_pid_file(self.state.runner.as_ref(), &paths.dnsmasq_pid).await?;
        kill_from_pid_file(self.state.runner.as_ref(), &paths.forkdns_pid).await?;

        if config.uses_dnsmasq() {
            self.spawn_dnsmasq(dnsmasq_cmd, dns_clustered, &paths).await?;
        } else {
            for stale in [&paths.leases, &paths.dnsmasq_pid] {
                if stale.exists() {
                    tokio::fs::remove_file(stale)
                        .await
                        .with_context(|| format!("Failed to remove old dnsmasq file {:?}", stale.display().to_string()))?;
                }
            }
        }

        // Step 12: firewall, ACLs, forwards, BGP
        debug!(network = %self.name, "Setting up firewall");
        self.state
            .firewall
            .network_setup(&self.name, &fw)
            .await
            .context("Failed to setup firewall")?;

        if fw.acl {
            debug!(network = %self.name, "Applying firewall ACLs");
            self.state
                .firewall
                .network_apply_acls(&self.name, &self.acl_opts())
                .await?;
        }

        self.forward_setup_firewall().await?;

        let listen = self.forward_listen_addresses().await?;
        bgp::bgp_setup(self.state.bgp.as_ref(), &self.name, config, old_config, &listen)?;

        Ok(())
    }

    fn acl_opts(&self) -> AclOpts {
        let action = |key: &str| match self.config.get(key) {
            "" => "reject".to_string(),
            value => value.to_string(),
        };
        AclOpts {
            acls: split_list(self.config.get("security.acls")),
            default_ingress: action("security.acls.default.ingress.action"),
            default_egress: action("security.acls.default.egress.action"),
            log_ingress: self.config.is_true("security.acls.default.ingress.logged"),
            log_egress: self.config.is_true("security.acls.default.egress.logged"),
        }
    }

    /// Accept router advertisements while forwarding, then forward on every interface.
    async fn enable_ipv6_forwarding(&self) -> NetworkResult<()> {
        let sysctl = &self.state.sysctl;
        let entries = sysctl.list("net/ipv6/conf").await?;

        for entry in &entries {
            let key = format!("net/ipv6/conf/{}/accept_ra", entry);
            match sysctl.get_raw(&key).await {
                Ok(value) if value != "1\n" => continue,
                _ => {}
            }
            if let Err(e) = sysctl.set(&key, "2").await {
                if !e.is_not_found() {
                    return Err(e);
                }
            }
        }

        for entry in &entries {
            if let Err(e) = sysctl.set(&format!("net/ipv6/conf/{}/forwarding", entry), "1").await {
                if !e.is_not_found() {
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn setup_fan(
        &self,
        driver: BridgeDriver,
        mtu: &mut u32,
        dnsmasq_cmd: &mut DnsmasqCommand,
        revert: &mut Reverter,
    ) -> NetworkResult<FanSetup> {
        let host = self.host();
        let config = &self.config;
        let paths = self.paths();
        let fan_type = FanType::from_config(config.get("fan.type"));
        let tun_name = format!("{}-fan", self.name);

        let underlay = config.get("fan.underlay_subnet").to_string();
        let underlay_net: Ipv4Net = underlay
            .parse()
            .map_err(|_| NetworkError::validation("Failed parsing fan.underlay_subnet"))?;

        let overlay = match config.get("fan.overlay_subnet") {
            "" => DEFAULT_OVERLAY.to_string(),
            value => value.to_string(),
        };
        let overlay_net: Ipv4Net = overlay
            .parse()
            .map_err(|_| NetworkError::validation("Failed parsing fan.overlay_subnet"))?;

        let addresses = host.addresses(None).await?;
        let fan = fan::fan_address(&underlay_net, &overlay_net, &addresses)?;
        let address = fan.cidr.addr();
        let bridge_address = match fan_type {
            FanType::Ipip => Ipv4Net::new(address, 24),
            FanType::Vxlan => Ok(fan.cidr),
        }
        .map_err(|e| NetworkError::validation(e.to_string()))?;

        // The underlay device bounds the overlay MTU
        if let Ok(device_mtu) = host.get_mtu(&fan.device).await {
            let fan_mtu = device_mtu.saturating_sub(fan_type.overhead());
            if fan_mtu != *mtu {
                *mtu = fan_mtu;
                if driver.supports_mtu_placeholder() {
                    host.set_mtu(&format!("{}-mtu", self.name), fan_mtu).await?;
                }
                driver.set_mtu(host, &self.name, fan_mtu).await?;
            }
        }

        let host_subnet = Ipv4Net::new(address, 24)
            .map_err(|e| NetworkError::validation(e.to_string()))?
            .trunc();
        host.add_address(&self.name, &IpNet::V4(bridge_address)).await?;

        let expiry = dhcp_expiry_arg(config.get("ipv4.dhcp.expiry"));
        let host_subnet = IpNet::V4(host_subnet);
        dnsmasq_cmd.arg(format!("--listen-address={}", address));
        dnsmasq_cmd.enable_dhcp(&paths.leases, &paths.hosts);
        dnsmasq_cmd.dhcp_range(format!(
            "{},{},{}",
            get_ip(&host_subnet, 2),
            get_ip(&host_subnet, -2),
            expiry
        ));

        let fan_map = format!("{}:{}", overlay, underlay);
        match fan_type {
            FanType::Ipip => {
                host.flush_routes("tunl0", IpFamily::V4, None).await?;
                host.set_up("tunl0").await?;
                // Fails when the map is already set
                let _ = host.set_ipip_fan_map("tunl0", &fan_map).await;

                let route = Route::new(IpFamily::V4, "tunl0", &overlay)
                    .src(&address.to_string())
                    .proto("static");
                host.add_route(&route).await?;
            }
            FanType::Vxlan => {
                let tunnel = TunnelSpec::Vxlan(VxlanSpec {
                    name: tun_name.clone(),
                    id: fan::vxlan_id(&overlay_net).to_string(),
                    device: Some(fan.device.clone()),
                    dst_port: Some("0".to_string()),
                    local: Some(fan.underlay_address.to_string()),
                    fan_map: Some(fan_map),
                    ..Default::default()
                });
                host.create_tunnel(&tunnel).await?;
                revert.add(UndoAction::DeleteLink(tun_name.clone()));

                attach_interface(host, &self.name, &tun_name).await?;
                host.set_mtu(&tun_name, *mtu).await?;
                host.set_up(&tun_name).await?;
                host.set_up(&self.name).await?;
            }
        }

        Ok(FanSetup {
            overlay,
            address: address.to_string(),
        })
    }

    async fn setup_tunnel(&self, tunnel: &str, mtu: u32, revert: &mut Reverter) -> NetworkResult<()> {
        let host = self.host();
        let get = |key: &str| self.config.get(&format!("tunnel.{}.{}", tunnel, key)).to_string();
        let non_empty = |value: String| Some(value).filter(|v| !v.is_empty());

        let protocol = get("protocol");
        let local = get("local");
        let remote = get("remote");
        let name = format!("{}-{}", self.name, tunnel);

        let spec = match protocol.as_str() {
            "gre" => {
                if local.is_empty() || remote.is_empty() {
                    return Ok(());
                }
                TunnelSpec::Gretap {
                    name: name.clone(),
                    local,
                    remote,
                }
            }
            "vxlan" => {
                let mut spec = VxlanSpec {
                    name: name.clone(),
                    id: non_empty(get("id")).unwrap_or_else(|| "1".to_string()),
                    dst_port: Some(non_empty(get("port")).unwrap_or_else(|| "0".to_string())),
                    ttl: Some(non_empty(get("ttl")).unwrap_or_else(|| "1".to_string())),
                    ..Default::default()
                };

                if !local.is_empty() && !remote.is_empty() {
                    spec.local = Some(local);
                    spec.remote = Some(remote);
                } else {
                    let device = match non_empty(get("interface")) {
                        Some(device) => device,
                        None => host.default_gateway_v4().await?.1,
                    };
                    spec.group = Some(non_empty(get("group")).unwrap_or_else(|| "239.0.0.1".to_string()));
                    spec.device = Some(device);
                }
                TunnelSpec::Vxlan(spec)
            }
            _ => {
                debug!(network = %self.name, tunnel = %tunnel, "Skipping tunnel without a protocol");
                return Ok(());
            }
        };

        host.create_tunnel(&spec).await?;
        revert.add(UndoAction::DeleteLink(name.clone()));

        attach_interface(host, &self.name, &name).await?;
        host.set_mtu(&name, mtu).await?;
        host.set_up(&name).await?;
        host.set_up(&self.name).await
    }

    async fn spawn_dnsmasq(
        &self,
        mut cmd: DnsmasqCommand,
        clustered: Option<&FanSetup>,
        paths: &NetworkPaths,
    ) -> NetworkResult<()> {
        let config = &self.config;
        let os = &self.state.os;
        let domain = config.dns_domain().to_string();

        if config.get("dns.mode") != "none" {
            cmd.arg("-s").arg(domain.clone());
            cmd.arg("--interface-name")
                .arg(format!("_gateway.{},{}", domain, self.name));

            match clustered {
                Some(fan) => {
                    cmd.arg("-S")
                        .arg(format!("/{}/{}#{}", domain, fan.address, forkdns::FORKDNS_PORT));
                    cmd.arg(format!(
                        "--rev-server={},{}#{}",
                        fan.overlay,
                        fan.address,
                        forkdns::FORKDNS_PORT
                    ));
                }
                None => {
                    cmd.arg("-S").arg(format!("/{}/", domain));
                }
            }
        }

        // Also keeps dnsmasq away from /etc/dnsmasq.conf
        tokio::fs::write(&paths.dnsmasq_raw, format!("{}\n", config.get("raw.dnsmasq")))
            .await
            .with_context(|| format!("Failed writing {}", paths.dnsmasq_raw.display()))?;
        cmd.arg(format!("--conf-file={}", paths.dnsmasq_raw.display()));

        if let Some(user) = os.unpriv_user.as_deref().filter(|u| !u.is_empty()) {
            cmd.arg("-u").arg(user);
        }
        if let Some(group) = os.unpriv_group.as_deref().filter(|g| !g.is_empty()) {
            cmd.arg("-g").arg(group);
        }

        tokio::fs::create_dir_all(&paths.hosts)
            .await
            .with_context(|| format!("Failed creating {}", paths.hosts.display()))?;

        if !self.state.runner.is_available("dnsmasq") {
            return Err(NetworkError::environment("dnsmasq is required for managed bridges"));
        }

        let devices = self.state.store.list_nic_devices().await?;
        dnsmasq::update_static_hosts(&paths.hosts, &self.name, &devices).await?;

        let args = cmd.into_args();
        let mut spec = ProcessSpec::new("dnsmasq", args.clone());
        spec.stderr_log = Some(paths.dnsmasq_log.clone());

        if config.get("raw.dnsmasq").is_empty() {
            if self.state.apparmor.enabled() {
                spec.apparmor_profile = Some(dnsmasq_profile_name(&self.name));
            }
            self.resolve_warning(WARNING_APPARMOR_RAW_DNSMASQ).await;
        } else {
            warn!(network = %self.name, "Skipping AppArmor for dnsmasq due to raw.dnsmasq being set");
            self.upsert_warning(WARNING_APPARMOR_RAW_DNSMASQ, "").await;
        }

        let mut process = self.state.runner.spawn(&spec).await.map_err(|e| {
            NetworkError::Subprocess(format!("Failed to run: dnsmasq {}: {}", args.join(" "), e))
        })?;

        if let WaitOutcome::Exited(code) = self.state.runner.wait(&mut process, DNSMASQ_STARTUP_WAIT).await {
            let stderr = tokio::fs::read_to_string(&paths.dnsmasq_log)
                .await
                .unwrap_or_default();
            // Setup carries on so the firewall is not left half configured
            error!(
                network = %self.name,
                code = ?code,
                stderr = %stderr.trim(),
                "The dnsmasq process exited prematurely"
            );
        }

        save_or_kill(self.state.runner.as_ref(), &mut process, &paths.dnsmasq_pid).await?;

        if let Some(fan) = clustered {
            forkdns::ensure_servers_file(&paths.forkdns_servers)?;
            self.spawn_forkdns(&fan.address, &domain, paths).await?;
        }
        Ok(())
    }

    async fn spawn_forkdns(&self, listen_address: &str, domain: &str, paths: &NetworkPaths) -> NetworkResult<()> {
        let os = &self.state.os;
        let program = os.exec_path.display().to_string();
        let args = forkdns::forkdns_args(listen_address, domain, &paths.forkdns_servers);

        let mut spec = ProcessSpec::new(program.clone(), args);
        spec.stdout_log = Some(paths.forkdns_log.clone());
        spec.stderr_log = Some(paths.forkdns_log.clone());
        spec.uid = os.unpriv_uid;
        spec.gid = os.unpriv_gid;
        if self.state.apparmor.enabled() {
            spec.apparmor_profile = Some(forkdns_profile_name(&self.name));
        }

        let mut process = self
            .state
            .runner
            .spawn(&spec)
            .await
            .map_err(|e| NetworkError::Subprocess(format!("Failed to run: {} forkdns: {}", program, e)))?;

        save_or_kill(self.state.runner.as_ref(), &mut process, &paths.forkdns_pid).await
    }

    pub async fn stop(&self) -> NetworkResult<()> {
        debug!(network = %self.name, "Stop");
        if !self.is_running().await {
            return Ok(());
        }

        let host = self.host();
        let paths = self.paths();

        bgp::bgp_clear(self.state.bgp.as_ref(), &self.name)?;

        BridgeDriver::from_config(&self.config)
            .delete(host, &self.name)
            .await?;

        let mut versions = Vec::new();
        if self.config.uses_ipv4_firewall() {
            versions.push(4);
        }
        if self.config.uses_ipv6_firewall() {
            versions.push(6);
        }
        if !versions.is_empty() {
            self.state
                .firewall
                .network_clear(&self.name, true, &versions)
                .await
                .context("Failed clearing firewall")?;
        }

        kill_from_pid_file(self.state.runner.as_ref(), &paths.dnsmasq_pid).await?;
        kill_from_pid_file(self.state.runner.as_ref(), &paths.forkdns_pid).await?;

        let prefix = format!("{}-", self.name);
        for link in host.list_links().await? {
            if link.starts_with(&prefix) {
                host.delete_link(&link).await?;
            }
        }

        self.state.apparmor.network_unload(&self.name).await?;
        self.state.events.emit(NetworkEvent::stopped(&self.name)).await;
        Ok(())
    }

    async fn persist(&mut self, description: &str, config: &NetworkConfig, client: ClientType) -> NetworkResult<()> {
        self.state
            .store
            .update_network(&self.project, &self.name, description, config.as_map())
            .await?;
        self.description = description.to_string();
        self.config = config.clone();

        if client == ClientType::Normal {
            self.state
                .cluster
                .notify_update(&self.project, &self.name, config)
                .await?;
        }
        Ok(())
    }

    /// Apply a new description and config, reconfiguring the running bridge as needed.
    /// On failure the old config is written back and set up again.
    pub async fn update(&mut self, new: NetworkPut, client: ClientType) -> NetworkResult<()> {
        debug!(network = %self.name, client = ?client, "Update");

        let mut new_config = NetworkConfig::from(new.config);
        self.populate_auto_config(&mut new_config)
            .await
            .context("Failed generating auto config")?;
        self.validate(&new_config).await?;

        let changed = self.config.changed_keys(&new_config);
        if changed.is_empty() && new.description == self.description {
            return Ok(());
        }

        // Not set up on this host yet: only the record changes
        if self.status == NetworkStatus::Pending {
            return self.persist(&new.description, &new_config, client).await;
        }

        let old_config = self.config.clone();
        let old_description = self.description.clone();

        if let Err(e) = self
            .apply_update(&old_config, &new.description, &new_config, &changed, client)
            .await
        {
            warn!(network = %self.name, err = %e, "Reverting failed network update");
            if let Err(re) = self.persist(&old_description, &old_config, client).await {
                error!(network = %self.name, err = %re, "Failed restoring network config");
            }
            // Setup below must target the old config even if the store write failed
            self.description = old_description;
            self.config = old_config;
            if let Err(se) = self.setup(Some(&new_config)).await {
                error!(network = %self.name, err = %se, "Failed restoring network setup");
            }
            return Err(e);
        }

        self.state
            .events
            .emit(NetworkEvent::updated(&self.name, changed))
            .await;
        Ok(())
    }

    async fn apply_update(
        &mut self,
        old_config: &NetworkConfig,
        description: &str,
        new_config: &NetworkConfig,
        changed: &[String],
        client: ClientType,
    ) -> NetworkResult<()> {
        let has_changed = |key: &str| changed.iter().any(|k| k == key);

        if has_changed("bridge.driver") && self.is_running().await {
            self.stop().await?;
        }

        if has_changed("bridge.external_interfaces") && self.is_running().await {
            let keep = new_config.external_interfaces();
            for dev in old_config.external_interfaces() {
                if !keep.contains(&dev) && self.host().link_exists(&dev).await {
                    detach_interface(self.host(), &self.name, &dev).await?;
                }
            }
        }

        self.persist(description, new_config, client).await?;

        if !changed.is_empty() {
            self.setup(Some(old_config)).await?;
        }
        Ok(())
    }

    pub async fn delete(&self, client: ClientType) -> NetworkResult<()> {
        debug!(network = %self.name, "Delete");

        if let Err(e) = self.state.store.delete_warnings(&self.project, &self.name).await {
            warn!(network = %self.name, err = %e, "Failed to delete warnings");
        }

        if self.is_running().await {
            self.stop().await?;
        }

        self.state.apparmor.network_delete(&self.name).await?;

        if client == ClientType::Normal {
            self.state
                .store
                .delete_network(&self.project, &self.name)
                .await?;
        }

        let dir = self.paths().dir;
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir)
                .await
                .with_context(|| format!("Failed removing {}", dir.display()))?;
        }

        self.state.events.emit(NetworkEvent::deleted(&self.name)).await;
        Ok(())
    }

    pub async fn rename(&mut self, new_name: &str) -> NetworkResult<()> {
        debug!(network = %self.name, new_name = %new_name, "Rename");

        if self.host().link_exists(new_name).await {
            return Err(NetworkError::Conflict(format!(
                "Network interface {:?} already exists",
                new_name
            )));
        }

        if self.is_running().await {
            self.stop().await?;
        }

        let log_dir = &self.state.os.log_dir;
        let old_log = log_dir.join(format!("forkdns.{}.log", self.name));
        if old_log.exists() {
            let new_log = log_dir.join(format!("forkdns.{}.log", new_name));
            tokio::fs::rename(&old_log, &new_log)
                .await
                .with_context(|| format!("Failed renaming {}", old_log.display()))?;
        }

        self.state
            .store
            .rename_network(&self.project, &self.name, new_name)
            .await?;

        let old_dir = self.paths().dir;
        if old_dir.exists() {
            let new_dir = self.state.os.network_paths(new_name).dir;
            tokio::fs::rename(&old_dir, &new_dir)
                .await
                .with_context(|| format!("Failed renaming {}", old_dir.display()))?;
        }

        self.name = new_name.to_string();

        self.start().await
    }

    /// Refresh the forkdns peer list from the live state of every other online member.
    pub async fn handle_heartbeat(&self, heartbeat: &Heartbeat) -> NetworkResult<()> {
        let local = self.state.cluster.local_address();
        info!(network = %self.name, "Refreshing forkdns peers");

        let mut addresses = Vec::new();
        for member in &heartbeat.members {
            if local.as_deref() == Some(member.address.as_str()) {
                continue;
            }

            if !member.online {
                warn!(
                    network = %self.name,
                    address = %member.address,
                    id = member.id,
                    last_heartbeat = %member.last_heartbeat,
                    "Excluding offline member from DNS peers refresh"
                );
                continue;
            }

            let state = self
                .state
                .cluster
                .network_state(&member.address, &self.name)
                .await?;
            if let Some(address) = state.global_ipv4() {
                addresses.push(address.to_string());
            }
        }

        let path = self.paths().forkdns_servers;
        match forkdns::read_servers(&path) {
            Ok(current) if current == addresses => return Ok(()),
            Ok(_) => {}
            Err(e) => warn!(network = %self.name, err = %e, "Failed to load existing forkdns server list"),
        }

        {
            let _guard = self.state.locks.forkdns_servers();
            forkdns::write_servers(&path, &addresses)?;
        }

        info!(network = %self.name, nodes = ?addresses, "Updated forkdns server list");
        self.state
            .events
            .emit(NetworkEvent::peers_updated(&self.name, addresses))
            .await;
        Ok(())
    }

    pub async fn forwards(&self) -> NetworkResult<Vec<NetworkForwardRecord>> {
        Ok(self.state.store.list_forwards(self.id).await?)
    }

    async fn forward_listen_addresses(&self) -> NetworkResult<Vec<IpAddr>> {
        Ok(self
            .forwards()
            .await?
            .iter()
            .filter_map(|f| parse_ip_to_net(&f.listen_address).ok())
            .map(|net| net.addr())
            .collect())
    }

    async fn external_subnets_in_use(&self) -> NetworkResult<Vec<ExternalSubnetUsage>> {
        let store = &self.state.store;
        let networks = store.list_networks(None).await?;
        let devices = store.list_nic_devices().await?;
        let listen = store.list_all_forward_listen_addresses().await?;

        let mut usages = forward::bridge_external_subnets(&networks)?;
        usages.extend(forward::bridged_nic_external_routes(&networks, &devices));
        usages.extend(forward::forward_listen_usages(&listen)?);
        Ok(usages)
    }

    pub async fn forward_create(&self, request: ForwardRequest) -> NetworkResult<()> {
        let store = &self.state.store;

        if store.get_forward(self.id, &request.listen_address).await.is_ok() {
            return Err(NetworkError::Conflict(
                "A forward for that listen address already exists".to_string(),
            ));
        }

        let listen_net = parse_ip_to_net(&request.listen_address).map_err(|e| {
            NetworkError::validation(format!(
                "Failed parsing address forward listen address {:?}: {}",
                request.listen_address, e
            ))
        })?;
        forward::validate_forward(&self.config, listen_net.addr(), &request.config, &request.ports)?;

        let usages = self.external_subnets_in_use().await?;
        forward::check_listen_overlap(&self.project, &self.name, listen_net, &usages)?;

        let id = store
            .create_forward(
                self.id,
                &request.listen_address,
                &request.description,
                &request.config,
                &request.ports,
            )
            .await?;

        let applied = async {
            self.forward_setup_firewall().await?;
            self.forward_enable_hairpin().await?;
            self.forward_bgp_setup_prefixes().await
        };
        if let Err(e) = applied.await {
            if let Err(de) = store.delete_forward(id).await {
                error!(network = %self.name, err = %de, "Failed removing forward record");
            }
            self.forward_refresh_quietly().await;
            return Err(e);
        }
        Ok(())
    }

    pub async fn forward_update(&self, listen_address: &str, request: ForwardRequest) -> NetworkResult<()> {
        let store = &self.state.store;
        let current = store.get_forward(self.id, listen_address).await?;

        let listen_net = parse_ip_to_net(&current.listen_address).map_err(NetworkError::Validation)?;
        forward::validate_forward(&self.config, listen_net.addr(), &request.config, &request.ports)?;

        if current.description == request.description
            && current.config == request.config
            && current.ports == request.ports
        {
            return Ok(());
        }

        store
            .update_forward(current.id, &request.description, &request.config, &request.ports)
            .await?;

        if let Err(e) = self.forward_refresh().await {
            if let Err(ue) = store
                .update_forward(current.id, &current.description, &current.config, &current.ports)
                .await
            {
                error!(network = %self.name, err = %ue, "Failed restoring forward record");
            }
            self.forward_refresh_quietly().await;
            return Err(e);
        }
        Ok(())
    }

    pub async fn forward_delete(&self, listen_address: &str) -> NetworkResult<()> {
        let store = &self.state.store;
        let current = store.get_forward(self.id, listen_address).await?;
        store.delete_forward(current.id).await?;

        if let Err(e) = self.forward_refresh().await {
            if let Err(ce) = store
                .create_forward(
                    self.id,
                    &current.listen_address,
                    &current.description,
                    &current.config,
                    &current.ports,
                )
                .await
            {
                error!(network = %self.name, err = %ce, "Failed restoring forward record");
            }
            self.forward_refresh_quietly().await;
            return Err(e);
        }
        Ok(())
    }

    async fn forward_refresh(&self) -> NetworkResult<()> {
        self.forward_setup_firewall().await?;
        self.forward_bgp_setup_prefixes().await
    }

    async fn forward_refresh_quietly(&self) {
        if let Err(e) = self.forward_refresh().await {
            error!(network = %self.name, err = %e, "Failed restoring forward rules");
        }
    }

    async fn forward_bgp_setup_prefixes(&self) -> NetworkResult<()> {
        let listen = self.forward_listen_addresses().await?;
        bgp::bgp_setup_prefixes(self.state.bgp.as_ref(), &self.name, &self.config, &listen)
            .context("Failed applying BGP prefixes for address forwards")
    }

    /// With the first forward on a netfiltered bridge, instances must be able to reach
    /// a forward that targets themselves, which needs hairpin on their bridge ports.
    async fn forward_enable_hairpin(&self) -> NetworkResult<()> {
        if self.config.is_openvswitch() {
            return Ok(());
        }

        let netfilter = self.state.bridge_netfilter_enabled(IpFamily::V4).await
            || self.state.bridge_netfilter_enabled(IpFamily::V6).await;
        if !netfilter || self.forwards().await?.len() > 1 {
            return Ok(());
        }

        let devices = self.state.store.list_nic_devices().await?;
        for device in dnsmasq::network_nics(&self.name, &devices) {
            // Managed bridges only exist in the default project
            if device.project != "default" {
                continue;
            }

            let host_name = device
                .config
                .get("host_name")
                .or_else(|| device.config.get(&format!("volatile.{}.host_name", device.device)))
                .cloned()
                .unwrap_or_default();
            if host_name.is_empty() || !self.host().link_exists(&host_name).await {
                continue;
            }

            self.host()
                .set_hairpin(&host_name, true)
                .await
                .with_context(|| format!("Error enabling hairpin mode on bridge port {:?}", host_name))?;
            debug!(
                network = %self.name,
                instance = %device.instance,
                device = %device.device,
                port = %host_name,
                "Enabled hairpin mode on NIC bridge port"
            );
        }
        Ok(())
    }

    /// Regenerate the DNAT rules of every forward on this bridge.
    pub async fn forward_setup_firewall(&self) -> NetworkResult<()> {
        let forwards = self.forwards().await.context("Failed loading network forwards")?;

        let mut rules: Vec<AddressForward> = Vec::new();
        let mut families: Vec<IpFamily> = Vec::new();

        for record in &forwards {
            let listen_net = parse_ip_to_net(&record.listen_address).map_err(|e| {
                NetworkError::validation(format!(
                    "Failed parsing address forward listen address {:?}: {}",
                    record.listen_address, e
                ))
            })?;
            let listen = listen_net.addr();

            let family = IpFamily::of(&listen);
            if !families.contains(&family) {
                families.push(family);
            }

            let maps = forward::validate_forward(&self.config, listen, &record.config, &record.ports)
                .with_context(|| {
                    format!(
                        "Failed validating firewall address forward for listen address {:?}",
                        record.listen_address
                    )
                })?;
            let default_target = record
                .config
                .get("target_address")
                .and_then(|t| t.parse::<IpAddr>().ok());
            rules.extend(forward::to_firewall_forwards(listen, default_target, maps));
        }

        if !forwards.is_empty() {
            let mut netfilter_missing = false;
            for family in families {
                if !self.state.bridge_netfilter_enabled(family).await {
                    netfilter_missing = true;
                    let msg = format!(
                        "IPv{} bridge netfilter not enabled. Instances using the bridge will not be able to connect to the forward listen IPs",
                        family.version()
                    );
                    warn!(network = %self.name, "{}", msg);
                    self.upsert_warning(WARNING_BRIDGE_NETFILTER, &msg).await;
                }
            }

            if !netfilter_missing {
                self.resolve_warning(WARNING_BRIDGE_NETFILTER).await;
            }
        }

        self.state
            .firewall
            .network_apply_forwards(&self.name, &rules)
            .await
            .context("Failed applying firewall address forwards")
    }

    /// Leases visible to `project`. Relayed requests only return this member's dynamic leases.
    pub async fn leases(&self, project: &str, client: ClientType) -> NetworkResult<Vec<Lease>> {
        let store = &self.state.store;
        let member = self.state.cluster.member_name();

        let mut all = Vec::new();
        let mut project_macs = Vec::new();

        if client == ClientType::Normal {
            if self.project == "default" {
                let networks = store.list_networks(None).await?;
                all.extend(leases::uplink_leases(&self.name, &networks));
            }

            let devices = store.list_nic_devices().await?;
            let (static_leases, macs) =
                leases::static_leases(&self.name, &self.config, project, &devices, &member);
            all.extend(static_leases);
            project_macs = macs;
        }

        let path = self.paths().leases;
        if path.exists() {
            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed reading {}", path.display()))?;
            let filter = (client == ClientType::Normal).then_some(project_macs.as_slice());
            let dynamic = leases::parse_dynamic_leases(&content, &all, filter, &member);
            all.extend(dynamic);
        }

        if client == ClientType::Normal {
            let remote = self.state.cluster.member_leases(&self.name).await?;
            all.extend(leases::filter_member_leases(remote, &project_macs));
        }

        Ok(all)
    }
}
