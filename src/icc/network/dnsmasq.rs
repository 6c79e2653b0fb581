use std::cmp::Ordering;
use std::fmt;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{ErrorContext, NetworkError, NetworkResult};
use crate::sync::network::InstanceDevice;

static VERSION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)dnsmasq version (\d+(?:\.\d+)*)").expect("dnsmasq version pattern")
});

/// A dotted numeric version such as `2.80`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DottedVersion(Vec<u32>);

impl DottedVersion {
    pub fn parse(value: &str) -> NetworkResult<Self> {
        let parts = value
            .trim()
            .split('.')
            .map(|p| p.parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| NetworkError::Subprocess(format!("Invalid version {:?}", value)))?;
        if parts.is_empty() {
            return Err(NetworkError::Subprocess(format!("Invalid version {:?}", value)));
        }
        Ok(Self(parts))
    }

    /// Version reported by `dnsmasq --version`.
    pub fn from_dnsmasq_output(output: &str) -> NetworkResult<Self> {
        let caps = VERSION_RE
            .captures(output)
            .ok_or_else(|| NetworkError::Subprocess("Unable to find dnsmasq version".to_string()))?;
        Self::parse(&caps[1])
    }
}

impl Ord for DottedVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        for i in 0..len {
            let a = self.0.get(i).copied().unwrap_or(0);
            let b = other.0.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for DottedVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for DottedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|p| p.to_string()).collect();
        write!(f, "{}", parts.join("."))
    }
}

/// Argument list for a network's dnsmasq.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsmasqCommand {
    args: Vec<String>,
}

impl DnsmasqCommand {
    /// Base flags. Rapid commit needs a version above 2.79 and the quiet flags one above 2.67.
    pub fn new(interface: &str, version: &DottedVersion, quiet: bool) -> Self {
        let mut args: Vec<String> = vec![
            "--keep-in-foreground".into(),
            "--strict-order".into(),
            "--bind-interfaces".into(),
            "--except-interface=lo".into(),
            // Our own PID file is written by the supervisor
            "--pid-file=".into(),
            // Pinging delays lease file updates
            "--no-ping".into(),
            format!("--interface={}", interface),
        ];

        if *version > DottedVersion(vec![2, 79]) {
            args.push("--dhcp-rapid-commit".into());
        }

        if quiet && *version > DottedVersion(vec![2, 67]) {
            args.extend(["--quiet-dhcp".into(), "--quiet-dhcp6".into(), "--quiet-ra".into()]);
        }

        Self { args }
    }

    pub fn arg(&mut self, arg: impl Into<String>) -> &mut Self {
        self.args.push(arg.into());
        self
    }

    pub fn contains(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }

    /// Authoritative DHCP with lease and host files. Added once however many families use it.
    pub fn enable_dhcp(&mut self, leases: &Path, hosts: &Path) -> &mut Self {
        if !self.contains("--dhcp-no-override") {
            self.arg("--dhcp-no-override")
                .arg("--dhcp-authoritative")
                .arg(format!("--dhcp-leasefile={}", leases.display()))
                .arg(format!("--dhcp-hostsfile={}", hosts.display()));
        }
        self
    }

    pub fn dhcp_range(&mut self, range: impl Into<String>) -> &mut Self {
        self.arg("--dhcp-range").arg(range)
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn into_args(self) -> Vec<String> {
        self.args
    }
}

/// Turn a `start-end` range into dnsmasq's `start,end`.
pub fn range_arg(range: &str) -> String {
    range.trim().replace('-', ",")
}

/// NIC devices attached to `network`, with `network` standing in for `parent`.
pub fn network_nics<'a>(network: &str, devices: &'a [InstanceDevice]) -> Vec<&'a InstanceDevice> {
    devices
        .iter()
        .filter(|d| d.device_type == "nic")
        .filter(|d| {
            let parent = d
                .config
                .get("network")
                .filter(|n| !n.is_empty())
                .or_else(|| d.config.get("parent"));
            parent.map(String::as_str) == Some(network)
        })
        .collect()
}

/// Hostname dnsmasq hands out: plain in the default project, project-prefixed elsewhere.
pub fn instance_hostname(project: &str, instance: &str) -> String {
    if project == "default" {
        instance.to_string()
    } else {
        format!("{}_{}", project, instance)
    }
}

/// One `dhcp-host` line, or None when the NIC has nothing to pin.
pub fn static_host_entry(device: &InstanceDevice) -> Option<String> {
    let get = |key: &str| device.config.get(key).map(String::as_str).unwrap_or("");
    let mac = get("hwaddr");
    let ipv4 = get("ipv4.address");
    let ipv6 = get("ipv6.address");

    if mac.is_empty() || (ipv4.is_empty() && ipv6.is_empty()) {
        return None;
    }

    let mut parts = vec![mac.to_string()];
    if !ipv4.is_empty() {
        parts.push(ipv4.to_string());
    }
    if !ipv6.is_empty() {
        parts.push(format!("[{}]", ipv6));
    }
    parts.push(instance_hostname(&device.project, &device.instance));
    Some(parts.join(","))
}

/// Regenerate `dnsmasq.hosts/` from the instance NICs on this network.
pub async fn update_static_hosts(
    hosts_dir: &Path,
    network: &str,
    devices: &[InstanceDevice],
) -> NetworkResult<()> {
    tokio::fs::create_dir_all(hosts_dir)
        .await
        .with_context(|| format!("Failed creating {}", hosts_dir.display()))?;

    let mut wanted = Vec::new();
    for device in network_nics(network, devices) {
        let file_name = format!("{}_{}.{}", device.project, device.instance, device.device);
        if let Some(entry) = static_host_entry(device) {
            tokio::fs::write(hosts_dir.join(&file_name), format!("{}\n", entry)).await?;
            wanted.push(file_name);
        }
    }

    let mut entries = tokio::fs::read_dir(hosts_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if !wanted.contains(&name) {
            tokio::fs::remove_file(entry.path()).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn nic(instance: &str, config: &[(&str, &str)]) -> InstanceDevice {
        InstanceDevice {
            project: "default".to_string(),
            instance: instance.to_string(),
            device: "eth0".to_string(),
            device_type: "nic".to_string(),
            config: config
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn test_version_parse() {
        let out = "Dnsmasq version 2.80  Copyright (c) 2000-2018 Simon Kelley\nCompile time options: IPv6";
        let version = DottedVersion::from_dnsmasq_output(out).unwrap();
        assert_eq!(version.to_string(), "2.80");
        assert!(version > DottedVersion::parse("2.79").unwrap());
        assert!(DottedVersion::parse("2.79").unwrap() > DottedVersion::parse("2.8").unwrap());
        assert_eq!(DottedVersion::parse("2.0").unwrap(), DottedVersion::parse("2.0").unwrap());
        assert!(DottedVersion::from_dnsmasq_output("nothing here").is_err());
    }

    #[test]
    fn test_version_gated_flags() {
        let old = DnsmasqCommand::new("br0", &DottedVersion::parse("2.66").unwrap(), true);
        assert!(!old.contains("--dhcp-rapid-commit"));
        assert!(!old.contains("--quiet-dhcp"));

        let new = DnsmasqCommand::new("br0", &DottedVersion::parse("2.85").unwrap(), true);
        assert!(new.contains("--dhcp-rapid-commit"));
        assert!(new.contains("--quiet-ra"));
        assert!(new.contains("--interface=br0"));

        let loud = DnsmasqCommand::new("br0", &DottedVersion::parse("2.85").unwrap(), false);
        assert!(!loud.contains("--quiet-dhcp6"));
    }

    #[test]
    fn test_enable_dhcp_once() {
        let mut cmd = DnsmasqCommand::new("br0", &DottedVersion::parse("2.80").unwrap(), false);
        cmd.enable_dhcp(Path::new("/s/dnsmasq.leases"), Path::new("/s/dnsmasq.hosts"));
        cmd.enable_dhcp(Path::new("/s/dnsmasq.leases"), Path::new("/s/dnsmasq.hosts"));
        let count = cmd.args().iter().filter(|a| *a == "--dhcp-authoritative").count();
        assert_eq!(count, 1);
        assert_eq!(range_arg(" 10.0.0.10-10.0.0.20 "), "10.0.0.10,10.0.0.20");
    }

    #[tokio::test]
    async fn test_update_static_hosts() {
        let dir = tempdir().unwrap();
        let hosts = dir.path().join("dnsmasq.hosts");
        std::fs::create_dir_all(&hosts).unwrap();
        std::fs::write(hosts.join("stale"), "x").unwrap();

        let mut other_project = nic("c3", &[("network", "br0"), ("hwaddr", "00:16:3e:00:00:03"), ("ipv6.address", "fd42::3")]);
        other_project.project = "p1".to_string();

        let devices = vec![
            nic("c1", &[("network", "br0"), ("hwaddr", "00:16:3e:00:00:01"), ("ipv4.address", "10.0.0.5")]),
            nic("c2", &[("parent", "br1"), ("hwaddr", "00:16:3e:00:00:02"), ("ipv4.address", "10.1.0.5")]),
            other_project,
        ];

        update_static_hosts(&hosts, "br0", &devices).await.unwrap();

        let c1 = std::fs::read_to_string(hosts.join("default_c1.eth0")).unwrap();
        assert_eq!(c1, "00:16:3e:00:00:01,10.0.0.5,c1\n");
        let c3 = std::fs::read_to_string(hosts.join("p1_c3.eth0")).unwrap();
        assert_eq!(c3, "00:16:3e:00:00:03,[fd42::3],p1_c3\n");
        assert!(!hosts.join("default_c2.eth0").exists());
        assert!(!hosts.join("stale").exists());
    }
}
