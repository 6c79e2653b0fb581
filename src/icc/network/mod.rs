// Managed bridge networking
// Coordinates the bridge engine, its helpers and the per-network locks

pub mod apparmor;
pub mod bgp;
pub mod bridge;
pub mod cluster;
pub mod config;
pub mod dnsmasq;
pub mod driver;
pub mod fan;
pub mod firewall;
pub mod forkdns;
pub mod forward;
pub mod host;
pub mod leases;
pub mod locks;
pub mod netlink;
pub mod revert;
pub mod state;
pub mod subnet;
pub mod supervisor;
pub mod validate;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::{NetworkError, NetworkResult};
use crate::sync::network::{NetworkForwardRecord, NetworkRecord};
use crate::sync::NetworkStatus;

// Re-export commonly used types
pub use bridge::{Bridge, ClientType, NetworkPut};
pub use cluster::{ClusterClient, Heartbeat, StandaloneCluster};
pub use config::NetworkConfig;
pub use forward::ForwardRequest;
pub use leases::Lease;
pub use state::{NetworkState, OsSettings};

const BRIDGE_TYPE: &str = "bridge";

/// Stored record plus what the host currently shows for it.
#[derive(Debug, Clone, Serialize)]
pub struct NetworkInfo {
    #[serde(flatten)]
    pub record: NetworkRecord,
    pub running: bool,
    pub mtu: Option<u32>,
    pub addresses: Vec<String>,
}

/// Entry point for every network operation. Each call takes the network's lock so
/// lifecycle operations on one bridge never interleave, while different bridges proceed
/// concurrently.
pub struct NetworkManager {
    state: NetworkState,
}

impl NetworkManager {
    pub fn new(state: NetworkState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &NetworkState {
        &self.state
    }

    /// Create and start a network. The record is removed again if it cannot be brought up.
    pub async fn create(
        &self,
        project: &str,
        name: &str,
        description: &str,
        config: BTreeMap<String, String>,
    ) -> NetworkResult<NetworkRecord> {
        validate::validate_name(name)?;
        let _guard = self.state.locks.lock_network(project, name).await;

        if self.state.store.get_network(project, name).await.is_ok() {
            return Err(NetworkError::Conflict(format!(
                "Network {:?} already exists in project {:?}",
                name, project
            )));
        }

        let mut config = NetworkConfig::from(config);
        let draft = Bridge::new(self.state.clone(), project, name, description);
        draft.fill_config(&mut config).await?;
        draft.validate(&config).await?;

        let id = self
            .state
            .store
            .create_network(project, name, description, BRIDGE_TYPE, config.as_map())
            .await?;
        info!(project = %project, network = %name, id, "Created network record");

        if let Err(e) = self.bring_up(project, name).await {
            if let Err(de) = self.state.store.delete_network(project, name).await {
                error!(network = %name, err = %de, "Failed removing network record");
            }
            return Err(e);
        }

        Ok(self.state.store.get_network(project, name).await?)
    }

    async fn bring_up(&self, project: &str, name: &str) -> NetworkResult<()> {
        let bridge = Bridge::load(&self.state, project, name).await?;
        bridge.create().await?;
        bridge.start().await?;
        self.state
            .store
            .set_network_status(bridge.id(), NetworkStatus::Created)
            .await?;
        Ok(())
    }

    /// Start every stored bridge. A failing network is logged and skipped.
    pub async fn start_all(&self) -> NetworkResult<()> {
        let networks = self.state.store.list_networks(None).await?;
        info!(count = networks.len(), "Starting networks");

        for record in networks.into_iter().filter(|n| n.network_type == BRIDGE_TYPE) {
            let (project, name) = (record.project.clone(), record.name.clone());
            let _guard = self.state.locks.lock_network(&project, &name).await;

            let bridge = Bridge::from_record(self.state.clone(), record);
            if bridge.status() == NetworkStatus::Pending {
                debug!(network = %name, "Skipping pending network");
                continue;
            }

            if let Err(e) = bridge.start().await {
                error!(project = %project, network = %name, err = %e, "Failed starting network");
            }
        }
        Ok(())
    }

    /// Stop every running bridge, for daemon shutdown.
    pub async fn stop_all(&self) -> NetworkResult<()> {
        for record in self.state.store.list_networks(None).await? {
            if record.network_type != BRIDGE_TYPE {
                continue;
            }
            let _guard = self.state.locks.lock_network(&record.project, &record.name).await;
            let name = record.name.clone();
            if let Err(e) = Bridge::from_record(self.state.clone(), record).stop().await {
                warn!(network = %name, err = %e, "Failed stopping network");
            }
        }
        Ok(())
    }

    pub async fn start(&self, project: &str, name: &str) -> NetworkResult<()> {
        let _guard = self.state.locks.lock_network(project, name).await;
        let bridge = Bridge::load(&self.state, project, name).await?;
        bridge.start().await?;

        if bridge.status() != NetworkStatus::Created {
            self.state
                .store
                .set_network_status(bridge.id(), NetworkStatus::Created)
                .await?;
        }
        Ok(())
    }

    pub async fn stop(&self, project: &str, name: &str) -> NetworkResult<()> {
        let _guard = self.state.locks.lock_network(project, name).await;
        Bridge::load(&self.state, project, name).await?.stop().await
    }

    pub async fn update(
        &self,
        project: &str,
        name: &str,
        put: NetworkPut,
        client: ClientType,
    ) -> NetworkResult<()> {
        let _guard = self.state.locks.lock_network(project, name).await;
        let mut bridge = Bridge::load(&self.state, project, name).await?;
        bridge.update(put, client).await
    }

    pub async fn delete(&self, project: &str, name: &str, client: ClientType) -> NetworkResult<()> {
        let _guard = self.state.locks.lock_network(project, name).await;
        Bridge::load(&self.state, project, name)
            .await?
            .delete(client)
            .await
    }

    pub async fn rename(&self, project: &str, name: &str, new_name: &str) -> NetworkResult<()> {
        validate::validate_name(new_name)?;
        let _guard = self.state.locks.lock_network(project, name).await;
        let _new_guard = self.state.locks.lock_network(project, new_name).await;

        if self.state.store.get_network(project, new_name).await.is_ok() {
            return Err(NetworkError::Conflict(format!(
                "Network {:?} already exists in project {:?}",
                new_name, project
            )));
        }

        let mut bridge = Bridge::load(&self.state, project, name).await?;
        bridge.rename(new_name).await
    }

    pub async fn show(&self, project: &str, name: &str) -> NetworkResult<NetworkInfo> {
        let record = self.state.store.get_network(project, name).await?;
        let host = self.state.host.as_ref();

        let running = host.link_exists(name).await;
        let (mtu, addresses) = if running {
            let mtu = host.get_mtu(name).await.ok();
            let addresses = host
                .addresses(Some(name))
                .await?
                .into_iter()
                .map(|a| format!("{}/{}", a.address, a.prefix_len))
                .collect();
            (mtu, addresses)
        } else {
            (None, Vec::new())
        };

        Ok(NetworkInfo {
            record,
            running,
            mtu,
            addresses,
        })
    }

    pub async fn list(&self, project: Option<&str>) -> NetworkResult<Vec<NetworkRecord>> {
        Ok(self.state.store.list_networks(project).await?)
    }

    pub async fn leases(
        &self,
        network_project: &str,
        name: &str,
        project: &str,
        client: ClientType,
    ) -> NetworkResult<Vec<Lease>> {
        Bridge::load(&self.state, network_project, name)
            .await?
            .leases(project, client)
            .await
    }

    pub async fn forward_create(&self, project: &str, name: &str, request: ForwardRequest) -> NetworkResult<()> {
        let _guard = self.state.locks.lock_network(project, name).await;
        Bridge::load(&self.state, project, name)
            .await?
            .forward_create(request)
            .await
    }

    pub async fn forward_update(
        &self,
        project: &str,
        name: &str,
        listen_address: &str,
        request: ForwardRequest,
    ) -> NetworkResult<()> {
        let _guard = self.state.locks.lock_network(project, name).await;
        Bridge::load(&self.state, project, name)
            .await?
            .forward_update(listen_address, request)
            .await
    }

    pub async fn forward_delete(&self, project: &str, name: &str, listen_address: &str) -> NetworkResult<()> {
        let _guard = self.state.locks.lock_network(project, name).await;
        Bridge::load(&self.state, project, name)
            .await?
            .forward_delete(listen_address)
            .await
    }

    pub async fn forward_list(&self, project: &str, name: &str) -> NetworkResult<Vec<NetworkForwardRecord>> {
        Bridge::load(&self.state, project, name).await?.forwards().await
    }

    /// Refresh forkdns peers on every fan bridge that runs forkdns on this member.
    pub async fn handle_heartbeat(&self, heartbeat: &Heartbeat) -> NetworkResult<()> {
        if self.state.cluster.local_address().is_none() {
            return Ok(());
        }

        for record in self.state.store.list_networks(None).await? {
            if record.network_type != BRIDGE_TYPE || record.status != NetworkStatus::Created {
                continue;
            }

            let bridge = Bridge::from_record(self.state.clone(), record);
            if !bridge.config().is_fan() || !bridge.is_running().await {
                continue;
            }

            if let Err(e) = bridge.handle_heartbeat(heartbeat).await {
                error!(network = %bridge.name(), err = %e, "Failed refreshing forkdns peers");
            }
        }
        Ok(())
    }
}
