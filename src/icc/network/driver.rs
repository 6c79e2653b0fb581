use super::config::NetworkConfig;
use super::host::HostNetwork;
use super::revert::UndoAction;
use crate::error::{NetworkError, NetworkResult};

/// Bridge backend selected by `bridge.driver`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeDriver {
    Native,
    OpenVSwitch,
}

impl BridgeDriver {
    pub fn from_config(config: &NetworkConfig) -> Self {
        if config.is_openvswitch() {
            BridgeDriver::OpenVSwitch
        } else {
            BridgeDriver::Native
        }
    }

    /// Create the bridge and return the action that removes it again.
    pub async fn add(&self, host: &dyn HostNetwork, name: &str) -> NetworkResult<UndoAction> {
        match self {
            BridgeDriver::OpenVSwitch => {
                if !host.ovs_installed() {
                    return Err(NetworkError::environment(
                        "Open vSwitch isn't installed on this system",
                    ));
                }
                host.ovs_add_bridge(name).await?;
                Ok(UndoAction::DeleteOvsBridge(name.to_string()))
            }
            BridgeDriver::Native => {
                host.create_bridge(name).await?;
                Ok(UndoAction::DeleteLink(name.to_string()))
            }
        }
    }

    pub async fn delete(&self, host: &dyn HostNetwork, name: &str) -> NetworkResult<()> {
        match self {
            BridgeDriver::OpenVSwitch => host.ovs_delete_bridge(name).await,
            BridgeDriver::Native => host.delete_link(name).await,
        }
    }

    pub async fn set_mtu(&self, host: &dyn HostNetwork, name: &str, mtu: u32) -> NetworkResult<()> {
        host.set_mtu(name, mtu).await
    }

    pub async fn set_address(&self, host: &dyn HostNetwork, name: &str, mac: &str) -> NetworkResult<()> {
        host.set_mac(name, mac).await
    }

    pub async fn set_up(&self, host: &dyn HostNetwork, name: &str) -> NetworkResult<()> {
        host.set_up(name).await
    }

    /// Whether a placeholder device can pin the bridge MTU. OVS bridges take it directly.
    pub fn supports_mtu_placeholder(&self) -> bool {
        matches!(self, BridgeDriver::Native)
    }
}

/// Attach `port` to `bridge`, choosing the backend from the live bridge.
pub async fn attach_interface(host: &dyn HostNetwork, bridge: &str, port: &str) -> NetworkResult<()> {
    if host.is_native_bridge(bridge).await {
        host.set_master(port, bridge).await
    } else {
        host.ovs_add_port(bridge, port).await
    }
}

pub async fn detach_interface(host: &dyn HostNetwork, bridge: &str, port: &str) -> NetworkResult<()> {
    if host.is_native_bridge(bridge).await {
        host.set_nomaster(port).await
    } else {
        host.ovs_delete_port(bridge, port).await
    }
}
