use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::config::NetworkConfig;
use super::leases::Lease;
use crate::error::{NetworkError, NetworkResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatMember {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    pub address: String,
    pub online: bool,
    pub last_heartbeat: DateTime<Utc>,
}

/// Cluster membership snapshot delivered with each heartbeat. Member order is significant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub members: Vec<HeartbeatMember>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateAddress {
    /// `inet` or `inet6`
    pub family: String,
    pub address: String,
    pub netmask: String,
    /// `global`, `link` or `local`
    pub scope: String,
}

/// Live state of a network interface on one member.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStateView {
    pub addresses: Vec<StateAddress>,
    pub mtu: u32,
    pub state: String,
}

impl NetworkStateView {
    /// First global IPv4 address, as published to forkdns peers.
    pub fn global_ipv4(&self) -> Option<&str> {
        self.addresses
            .iter()
            .find(|a| a.family == "inet" && a.scope == "global")
            .map(|a| a.address.as_str())
    }
}

/// Access to the other cluster members.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Cluster address of this member, None when not clustered.
    fn local_address(&self) -> Option<String>;
    fn member_id(&self) -> i64;
    fn member_name(&self) -> String;

    async fn network_state(&self, member_address: &str, network: &str) -> NetworkResult<NetworkStateView>;

    /// Leases held by every other online member for `network`.
    async fn member_leases(&self, network: &str) -> NetworkResult<Vec<Lease>>;

    /// Tell every other online member that a network's config changed. Fails if any member fails.
    async fn notify_update(&self, project: &str, network: &str, config: &NetworkConfig) -> NetworkResult<()>;
}

/// Single host deployment: no peers to reach.
#[derive(Debug, Clone)]
pub struct StandaloneCluster {
    name: String,
    id: i64,
    address: Option<String>,
}

impl StandaloneCluster {
    pub fn new(name: impl Into<String>, id: i64, address: Option<String>) -> Self {
        Self {
            name: name.into(),
            id,
            address: address.filter(|a| !a.is_empty()),
        }
    }
}

impl Default for StandaloneCluster {
    fn default() -> Self {
        Self::new("none", 1, None)
    }
}

#[async_trait]
impl ClusterClient for StandaloneCluster {
    fn local_address(&self) -> Option<String> {
        self.address.clone()
    }

    fn member_id(&self) -> i64 {
        self.id
    }

    fn member_name(&self) -> String {
        self.name.clone()
    }

    async fn network_state(&self, member_address: &str, network: &str) -> NetworkResult<NetworkStateView> {
        Err(NetworkError::environment(format!(
            "Cannot query network {:?} on member {:?}: no cluster transport configured",
            network, member_address
        )))
    }

    async fn member_leases(&self, _network: &str) -> NetworkResult<Vec<Lease>> {
        Ok(Vec::new())
    }

    async fn notify_update(&self, _project: &str, _network: &str, _config: &NetworkConfig) -> NetworkResult<()> {
        Ok(())
    }
}
