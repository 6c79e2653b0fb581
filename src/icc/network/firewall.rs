use std::net::IpAddr;

use async_trait::async_trait;
use ipnet::IpNet;
use tracing::debug;

use crate::error::{NetworkError, NetworkResult};
use crate::utils::CommandExecutor;

/// Source NAT for traffic leaving a network's subnet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnatOpts {
    /// Fixed source address, or MASQUERADE when unset
    pub snat_address: Option<IpAddr>,
    pub subnet: IpNet,
    /// Add after existing rules instead of before
    pub append: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureOpts {
    pub icmp_dhcp_dns_access: bool,
    pub forwarding_allow: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirewallOpts {
    pub features_v4: Option<FeatureOpts>,
    pub features_v6: Option<FeatureOpts>,
    pub snat_v4: Option<SnatOpts>,
    pub snat_v6: Option<SnatOpts>,
    pub acl: bool,
}

/// A DNAT port mapping, expanded from a network forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressForward {
    pub listen_address: IpAddr,
    pub target_address: IpAddr,
    /// Empty for a default (all traffic) forward
    pub protocol: String,
    pub listen_ports: Vec<u64>,
    pub target_ports: Vec<u64>,
}

/// Default actions applied to a network's traffic once ACLs are attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclOpts {
    pub acls: Vec<String>,
    pub default_ingress: String,
    pub default_egress: String,
    pub log_ingress: bool,
    pub log_egress: bool,
}

#[async_trait]
pub trait Firewall: Send + Sync {
    async fn network_setup(&self, network: &str, opts: &FirewallOpts) -> NetworkResult<()>;
    /// Remove a network's rules for the given IP versions.
    async fn network_clear(&self, network: &str, delete: bool, versions: &[u8]) -> NetworkResult<()>;
    async fn network_apply_forwards(&self, network: &str, forwards: &[AddressForward]) -> NetworkResult<()>;
    async fn network_apply_acls(&self, network: &str, opts: &AclOpts) -> NetworkResult<()>;
    async fn instance_setup_rp_filter(&self, host_name: &str) -> NetworkResult<()>;
    async fn instance_clear_rp_filter(&self, host_name: &str) -> NetworkResult<()>;
}

fn family_table(version: u8) -> &'static str {
    if version == 4 {
        "ip"
    } else {
        "ip6"
    }
}

fn addr_match(version: u8) -> &'static str {
    family_table(version)
}

pub fn network_table(network: &str) -> String {
    format!("quilt_{}", network)
}

pub fn forward_table(network: &str) -> String {
    format!("quilt_fwd_{}", network)
}

fn acl_table(network: &str) -> String {
    format!("quilt_acl_{}", network)
}

fn rpf_table(host_name: &str) -> String {
    format!("quilt_rpf_{}", host_name)
}

/// `add` then `delete` so a missing table is not an error.
fn drop_table(lines: &mut Vec<String>, family: &str, table: &str) {
    lines.push(format!("add table {} {}", family, table));
    lines.push(format!("delete table {} {}", family, table));
}

/// Newline terminated ruleset text for `nft -f -`.
fn ruleset(lines: Vec<String>) -> String {
    if lines.is_empty() {
        return String::new();
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn render_family(
    lines: &mut Vec<String>,
    network: &str,
    version: u8,
    features: Option<&FeatureOpts>,
    snat: Option<&SnatOpts>,
) {
    let family = family_table(version);
    let table = network_table(network);
    if features.is_none() && snat.is_none() {
        return;
    }

    lines.push(format!("table {} {} {{", family, table));

    if let Some(snat) = snat {
        let priority = if snat.append { 110 } else { 90 };
        let m = addr_match(version);
        let action = match snat.snat_address {
            Some(addr) => format!("snat to {}", addr),
            None => "masquerade".to_string(),
        };
        lines.extend([
            format!("  chain pstrt.{} {{", network),
            format!("    type nat hook postrouting priority {}; policy accept;", priority),
            format!("    {m} saddr {net} {m} daddr != {net} {action}", m = m, net = snat.subnet, action = action),
            "  }".to_string(),
        ]);
    }

    if let Some(features) = features {
        if features.icmp_dhcp_dns_access {
            let (dhcp, icmp) = if version == 4 {
                ("udp dport 67 accept", "icmp type { echo-request, destination-unreachable, time-exceeded } accept")
            } else {
                ("udp dport 547 accept", "icmpv6 type { echo-request, nd-router-solicit, nd-neighbor-solicit, nd-neighbor-advert, mld-listener-report } accept")
            };
            lines.extend([
                format!("  chain in.{} {{", network),
                "    type filter hook input priority 0; policy accept;".to_string(),
                format!("    iifname \"{}\" tcp dport 53 accept", network),
                format!("    iifname \"{}\" udp dport 53 accept", network),
                format!("    iifname \"{}\" {}", network, dhcp),
                format!("    iifname \"{}\" {}", network, icmp),
                "  }".to_string(),
            ]);
        }

        let verdict = if features.forwarding_allow { "accept" } else { "reject" };
        lines.extend([
            format!("  chain fwd.{} {{", network),
            "    type filter hook forward priority 0; policy accept;".to_string(),
            format!("    iifname \"{}\" {}", network, verdict),
            format!("    oifname \"{}\" {}", network, verdict),
            "  }".to_string(),
        ]);
    }

    lines.push("}".to_string());
}

/// Ruleset replacing a network's tables.
pub fn render_network(network: &str, opts: &FirewallOpts) -> String {
    let mut lines = Vec::new();
    for version in [4u8, 6] {
        drop_table(&mut lines, family_table(version), &network_table(network));
    }
    render_family(&mut lines, network, 4, opts.features_v4.as_ref(), opts.snat_v4.as_ref());
    render_family(&mut lines, network, 6, opts.features_v6.as_ref(), opts.snat_v6.as_ref());
    ruleset(lines)
}

fn port_list(ports: &[u64]) -> String {
    if ports.len() == 1 {
        ports[0].to_string()
    } else {
        let items: Vec<String> = ports.iter().map(|p| p.to_string()).collect();
        format!("{{ {} }}", items.join(", "))
    }
}

fn dnat_rules(forward: &AddressForward) -> Vec<String> {
    let version = if forward.listen_address.is_ipv4() { 4 } else { 6 };
    let m = addr_match(version);
    let target = |port: Option<u64>| match (forward.target_address, port) {
        (IpAddr::V6(addr), Some(port)) => format!("[{}]:{}", addr, port),
        (addr, Some(port)) => format!("{}:{}", addr, port),
        (addr, None) => addr.to_string(),
    };

    if forward.listen_ports.is_empty() {
        return vec![format!(
            "{} daddr {} dnat to {}",
            m,
            forward.listen_address,
            target(None)
        )];
    }

    if forward.target_ports.len() == forward.listen_ports.len() && forward.target_ports.len() > 1 {
        return forward
            .listen_ports
            .iter()
            .zip(&forward.target_ports)
            .map(|(lp, tp)| {
                format!(
                    "{} daddr {} {} dport {} dnat to {}",
                    m,
                    forward.listen_address,
                    forward.protocol,
                    lp,
                    target(Some(*tp))
                )
            })
            .collect();
    }

    match forward.target_ports.first() {
        Some(tp) => vec![format!(
            "{} daddr {} {} dport {} dnat to {}",
            m,
            forward.listen_address,
            forward.protocol,
            port_list(&forward.listen_ports),
            target(Some(*tp))
        )],
        None => vec![format!(
            "{} daddr {} {} dport {} dnat to {}",
            m,
            forward.listen_address,
            forward.protocol,
            port_list(&forward.listen_ports),
            target(None)
        )],
    }
}

/// Ruleset replacing a network's forward tables.
pub fn render_forwards(network: &str, forwards: &[AddressForward]) -> String {
    let mut lines = Vec::new();
    let table = forward_table(network);

    for version in [4u8, 6] {
        let family = family_table(version);
        drop_table(&mut lines, family, &table);

        let rules: Vec<String> = forwards
            .iter()
            .filter(|f| f.listen_address.is_ipv4() == (version == 4))
            .flat_map(dnat_rules)
            .collect();
        if rules.is_empty() {
            continue;
        }

        lines.push(format!("table {} {} {{", family, table));
        for (chain, hook) in [("prerouting", "prerouting"), ("output", "output")] {
            lines.push(format!("  chain {} {{", chain));
            lines.push(format!("    type nat hook {} priority -100; policy accept;", hook));
            lines.extend(rules.iter().map(|rule| format!("    {}", rule)));
            lines.push("  }".to_string());
        }

        // Hairpin: instances reaching their own forward through the listen address
        lines.push("  chain postrouting {".to_string());
        lines.push("    type nat hook postrouting priority 100; policy accept;".to_string());
        let m = addr_match(version);
        let mut targets: Vec<IpAddr> = forwards
            .iter()
            .filter(|f| f.listen_address.is_ipv4() == (version == 4))
            .map(|f| f.target_address)
            .collect();
        targets.dedup();
        lines.extend(
            targets
                .into_iter()
                .map(|t| format!("    {m} saddr {t} {m} daddr {t} masquerade", m = m, t = t)),
        );
        lines.push("  }".to_string());
        lines.push("}".to_string());
    }
    ruleset(lines)
}

pub fn render_acls(network: &str, opts: &AclOpts) -> String {
    let mut lines = Vec::new();
    let table = acl_table(network);
    drop_table(&mut lines, "inet", &table);
    if opts.acls.is_empty() {
        return ruleset(lines);
    }

    let verdict = |action: &str, log: bool, prefix: &str| {
        let action = if action.is_empty() { "reject" } else { action };
        let action = if action == "allow" { "accept" } else { action };
        if log {
            format!("log prefix \"{}\" {}", prefix, action)
        } else {
            action.to_string()
        }
    };

    lines.push(format!("table inet {} {{", table));
    lines.push(format!("  chain acl.{} {{", network));
    lines.push("    type filter hook forward priority 10; policy accept;".to_string());
    lines.extend(opts.acls.iter().map(|acl| format!("    # acl {}", acl)));
    lines.push(format!(
        "    oifname \"{}\" {}",
        network,
        verdict(&opts.default_ingress, opts.log_ingress, &format!("quilt {} ingress ", network))
    ));
    lines.push(format!(
        "    iifname \"{}\" {}",
        network,
        verdict(&opts.default_egress, opts.log_egress, &format!("quilt {} egress ", network))
    ));
    lines.push("  }".to_string());
    lines.push("}".to_string());
    ruleset(lines)
}

/// Per-instance reverse path filter.
fn render_rp_filter(host_name: &str) -> String {
    let table = rpf_table(host_name);
    let mut lines = Vec::new();
    drop_table(&mut lines, "inet", &table);
    lines.extend([
        format!("table inet {} {{", table),
        "  chain prerouting {".to_string(),
        "    type filter hook prerouting priority -300; policy accept;".to_string(),
        format!("    iifname \"{}\" fib saddr . iif oif missing drop", host_name),
        "  }".to_string(),
        "}".to_string(),
    ]);
    ruleset(lines)
}

/// nftables backend: each network gets its own tables, loaded with `nft -f -`.
#[derive(Debug, Default)]
pub struct NftablesFirewall;

impl NftablesFirewall {
    async fn apply(&self, ruleset: &str) -> NetworkResult<()> {
        CommandExecutor::run_with_stdin("nft", &["-f", "-"], ruleset)
            .await
            .map_err(|e| NetworkError::Firewall(e.to_string()))
    }
}

#[async_trait]
impl Firewall for NftablesFirewall {
    async fn network_setup(&self, network: &str, opts: &FirewallOpts) -> NetworkResult<()> {
        debug!(network = %network, "Applying network firewall");
        self.apply(&render_network(network, opts)).await
    }

    async fn network_clear(&self, network: &str, delete: bool, versions: &[u8]) -> NetworkResult<()> {
        let mut lines = Vec::new();
        for version in versions {
            drop_table(&mut lines, family_table(*version), &network_table(network));
            if delete {
                drop_table(&mut lines, family_table(*version), &forward_table(network));
            }
        }
        if delete {
            drop_table(&mut lines, "inet", &acl_table(network));
        }
        if lines.is_empty() {
            return Ok(());
        }
        self.apply(&ruleset(lines)).await
    }

    async fn network_apply_forwards(&self, network: &str, forwards: &[AddressForward]) -> NetworkResult<()> {
        self.apply(&render_forwards(network, forwards)).await
    }

    async fn network_apply_acls(&self, network: &str, opts: &AclOpts) -> NetworkResult<()> {
        self.apply(&render_acls(network, opts)).await
    }

    async fn instance_setup_rp_filter(&self, host_name: &str) -> NetworkResult<()> {
        self.apply(&render_rp_filter(host_name)).await
    }

    async fn instance_clear_rp_filter(&self, host_name: &str) -> NetworkResult<()> {
        let mut lines = Vec::new();
        drop_table(&mut lines, "inet", &rpf_table(host_name));
        self.apply(&ruleset(lines)).await
    }
}
