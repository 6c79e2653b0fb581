use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Truthy values accepted for boolean keys.
pub fn is_true(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

pub fn is_false(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "false" | "0" | "no" | "off")
}

/// Unset counts as enabled.
pub fn is_true_or_empty(value: &str) -> bool {
    value.is_empty() || is_true(value)
}

/// Split a comma list, trimming entries and dropping empty ones.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn unset(value: &str) -> bool {
    value.is_empty() || value == "none"
}

/// Network configuration: flat string keys such as `ipv4.address` or `tunnel.<name>.protocol`.
///
/// Missing keys read as the empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkConfig(BTreeMap<String, String>);

impl From<BTreeMap<String, String>> for NetworkConfig {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for NetworkConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl NetworkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> &str {
        self.0.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    pub fn into_map(self) -> BTreeMap<String, String> {
        self.0
    }

    pub fn is_true(&self, key: &str) -> bool {
        is_true(self.get(key))
    }

    pub fn is_true_or_empty(&self, key: &str) -> bool {
        is_true_or_empty(self.get(key))
    }

    pub fn is_fan(&self) -> bool {
        self.get("bridge.mode") == "fan"
    }

    pub fn is_openvswitch(&self) -> bool {
        self.get("bridge.driver") == "openvswitch"
    }

    /// A concrete IPv4 address is configured (not empty, not `none`).
    pub fn has_ipv4_address(&self) -> bool {
        !unset(self.get("ipv4.address"))
    }

    pub fn has_ipv6_address(&self) -> bool {
        !unset(self.get("ipv6.address"))
    }

    /// Fan mode may run without an explicit address so it counts as IPv4-enabled.
    pub fn has_ipv4_firewall(&self) -> bool {
        (self.is_fan() || self.has_ipv4_address()) && self.is_true_or_empty("ipv4.firewall")
    }

    pub fn has_ipv6_firewall(&self) -> bool {
        self.has_ipv6_address() && self.is_true_or_empty("ipv6.firewall")
    }

    /// Whether the firewall may hold IPv4 rules for this config, used when clearing old state.
    pub fn uses_ipv4_firewall(&self) -> bool {
        self.is_true_or_empty("ipv4.firewall") || self.is_true("ipv4.nat")
    }

    pub fn uses_ipv6_firewall(&self) -> bool {
        self.is_true_or_empty("ipv6.firewall") || self.is_true("ipv6.nat")
    }

    pub fn has_dhcpv4(&self) -> bool {
        self.is_true_or_empty("ipv4.dhcp")
    }

    pub fn has_dhcpv6(&self) -> bool {
        self.is_true_or_empty("ipv6.dhcp")
    }

    /// dnsmasq is needed in fan mode or whenever an address family is configured.
    pub fn uses_dnsmasq(&self) -> bool {
        self.is_fan() || self.has_ipv4_address() || self.has_ipv6_address()
    }

    pub fn dns_domain(&self) -> &str {
        match self.get("dns.domain") {
            "" => "lxd",
            domain => domain,
        }
    }

    pub fn external_interfaces(&self) -> Vec<String> {
        split_list(self.get("bridge.external_interfaces"))
    }

    /// Tunnel names in key order, each once.
    pub fn tunnels(&self) -> Vec<String> {
        let mut tunnels: Vec<String> = Vec::new();
        for key in self.0.keys() {
            let Some(rest) = key.strip_prefix("tunnel.") else {
                continue;
            };
            let name = rest.split('.').next().unwrap_or_default().to_string();
            if !tunnels.contains(&name) {
                tunnels.push(name);
            }
        }
        tunnels
    }

    /// Keys whose value differs between `self` and `other`, including keys present on one side only.
    pub fn changed_keys(&self, other: &NetworkConfig) -> Vec<String> {
        let keys: BTreeSet<&String> = self.0.keys().chain(other.0.keys()).collect();
        keys.into_iter()
            .filter(|k| self.get(k) != other.get(k))
            .cloned()
            .collect()
    }
}
