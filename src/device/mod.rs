// Instance NIC devices attached to host networking

pub mod routed;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::NetworkResult;

pub use routed::RoutedNic;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceType {
    Container,
    VirtualMachine,
}

/// The instance a device belongs to, with its expanded device set.
#[derive(Debug, Clone)]
pub struct Instance {
    pub project: String,
    pub name: String,
    pub instance_type: InstanceType,
    pub devices: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfigItem {
    pub key: String,
    pub value: String,
}

impl RunConfigItem {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// What the instance runtime must do with a device after start or stop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunConfig {
    pub network_interface: Vec<RunConfigItem>,
    /// `post_stop` must be called once the instance has released the device
    pub run_post_stop: bool,
}

impl RunConfig {
    pub fn get(&self, key: &str) -> Vec<&str> {
        self.network_interface
            .iter()
            .filter(|item| item.key == key)
            .map(|item| item.value.as_str())
            .collect()
    }
}

#[async_trait]
pub trait NicDevice: Send + Sync {
    fn name(&self) -> &str;

    /// Static config checks, run before the device is stored.
    fn validate_config(&self, instance: &Instance) -> NetworkResult<()>;

    /// Host checks, run before every start.
    async fn validate_environment(&self) -> NetworkResult<()>;

    async fn start(&mut self) -> NetworkResult<RunConfig>;

    async fn stop(&mut self) -> NetworkResult<RunConfig>;

    async fn post_stop(&mut self) -> NetworkResult<()>;
}

/// Host side name of `parent` once the optional VLAN is applied.
pub fn host_device(parent: &str, vlan: &str) -> String {
    if parent.is_empty() || vlan.is_empty() {
        return parent.to_string();
    }
    format!("{}.{}", parent, vlan)
}

/// A random interface name with the given prefix, within the kernel limit.
pub fn random_dev_name(prefix: &str) -> String {
    use rand::Rng;

    let suffix: u32 = rand::thread_rng().gen();
    let mut name = format!("{}{:08x}", prefix, suffix);
    name.truncate(crate::icc::network::validate::MAX_INTERFACE_NAME);
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_device() {
        assert_eq!(host_device("eth0", ""), "eth0");
        assert_eq!(host_device("eth0", "10"), "eth0.10");
        assert_eq!(host_device("", "10"), "");
    }

    #[test]
    fn test_random_dev_name() {
        let name = random_dev_name("veth");
        assert_eq!(name.len(), 12);
        assert!(name.starts_with("veth"));
        assert_ne!(random_dev_name("veth"), random_dev_name("veth"));

        assert!(random_dev_name("averylongprefix").len() <= 15);
    }
}
