use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::apparmor::AppArmor;
use super::bgp::RouteAdvertiser;
use super::cluster::ClusterClient;
use super::firewall::Firewall;
use super::forkdns;
use super::host::{HostNetwork, IpFamily};
use super::locks::LockRegistry;
use super::supervisor::ProcessRunner;
use crate::daemon::events::NetworkEventBus;
use crate::sync::NetworkStore;
use crate::utils::Sysctl;

/// Host level settings shared by every network.
#[derive(Debug, Clone)]
pub struct OsSettings {
    pub var_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Binary re-exec'd as the forkdns helper
    pub exec_path: PathBuf,
    pub unpriv_user: Option<String>,
    pub unpriv_group: Option<String>,
    pub unpriv_uid: Option<u32>,
    pub unpriv_gid: Option<u32>,
    pub server_fingerprint: String,
    /// Skip every host mutation
    pub mock_mode: bool,
}

impl OsSettings {
    pub fn new(var_dir: impl Into<PathBuf>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            var_dir: var_dir.into(),
            log_dir: log_dir.into(),
            exec_path: std::env::current_exe().unwrap_or_else(|_| PathBuf::from("quilt-netd")),
            unpriv_user: None,
            unpriv_group: None,
            unpriv_uid: None,
            unpriv_gid: None,
            server_fingerprint: String::new(),
            mock_mode: false,
        }
    }

    pub fn network_paths(&self, network: &str) -> NetworkPaths {
        NetworkPaths::new(&self.var_dir, &self.log_dir, network)
    }
}

/// On-disk layout of one network's runtime state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPaths {
    pub dir: PathBuf,
    pub leases: PathBuf,
    pub hosts: PathBuf,
    pub dnsmasq_pid: PathBuf,
    pub dnsmasq_raw: PathBuf,
    pub forkdns_pid: PathBuf,
    pub forkdns_servers: PathBuf,
    pub dnsmasq_log: PathBuf,
    pub forkdns_log: PathBuf,
}

impl NetworkPaths {
    pub fn new(var_dir: &Path, log_dir: &Path, network: &str) -> Self {
        let dir = var_dir.join("networks").join(network);
        Self {
            leases: dir.join("dnsmasq.leases"),
            hosts: dir.join("dnsmasq.hosts"),
            dnsmasq_pid: dir.join("dnsmasq.pid"),
            dnsmasq_raw: dir.join("dnsmasq.raw"),
            forkdns_pid: dir.join("forkdns.pid"),
            forkdns_servers: forkdns::servers_path(&dir),
            dnsmasq_log: log_dir.join(format!("dnsmasq.{}.log", network)),
            forkdns_log: log_dir.join(format!("forkdns.{}.log", network)),
            dir,
        }
    }
}

/// Every collaborator the bridge engine drives, owned in one place and shared by reference.
#[derive(Clone)]
pub struct NetworkState {
    pub os: OsSettings,
    pub host: Arc<dyn HostNetwork>,
    pub runner: Arc<dyn ProcessRunner>,
    pub firewall: Arc<dyn Firewall>,
    pub store: Arc<NetworkStore>,
    pub cluster: Arc<dyn ClusterClient>,
    pub bgp: Arc<dyn RouteAdvertiser>,
    pub locks: Arc<LockRegistry>,
    pub events: Arc<NetworkEventBus>,
    pub sysctl: Sysctl,
    pub apparmor: Arc<AppArmor>,
}

impl NetworkState {
    /// Whether bridged traffic of `family` passes through netfilter.
    pub async fn bridge_netfilter_enabled(&self, family: IpFamily) -> bool {
        let key = match family {
            IpFamily::V4 => "net/bridge/bridge-nf-call-iptables",
            IpFamily::V6 => "net/bridge/bridge-nf-call-ip6tables",
        };
        matches!(self.sysctl.get(key).await.as_deref(), Ok("1"))
    }

    /// Host IPv6 is usable when the default interface template has it enabled.
    pub async fn ipv6_available(&self) -> bool {
        matches!(
            self.sysctl.get("net/ipv6/conf/default/disable_ipv6").await.as_deref(),
            Ok("0")
        )
    }
}
