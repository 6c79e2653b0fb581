use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use ipnet::IpNet;

use super::config::{is_false, is_true, split_list, NetworkConfig};
use super::fan::FanType;
use super::subnet::{parse_ip_ranges, parse_ip_to_net, parse_mac, IpRange};
use crate::error::{NetworkError, NetworkResult};

pub type Validator = Box<dyn Fn(&str) -> Result<(), String> + Send + Sync>;

/// Kernel limit on interface names, excluding the trailing NUL.
pub const MAX_INTERFACE_NAME: usize = 15;

pub const ACL_ACTIONS: &[&str] = &["allow", "reject", "drop"];

fn rule<F>(f: F) -> Validator
where
    F: Fn(&str) -> Result<(), String> + Send + Sync + 'static,
{
    Box::new(f)
}

/// Empty values pass, everything else goes through `f`.
pub fn optional<F>(f: F) -> Validator
where
    F: Fn(&str) -> Result<(), String> + Send + Sync + 'static,
{
    Box::new(move |value| if value.is_empty() { Ok(()) } else { f(value) })
}

pub fn is_any(_value: &str) -> Result<(), String> {
    Ok(())
}

pub fn is_one_of(allowed: &'static [&'static str]) -> impl Fn(&str) -> Result<(), String> + Send + Sync {
    move |value| {
        if allowed.contains(&value) {
            Ok(())
        } else {
            Err(format!("Invalid value {:?} (not one of {:?})", value, allowed))
        }
    }
}

pub fn is_bool(value: &str) -> Result<(), String> {
    if is_true(value) || is_false(value) {
        Ok(())
    } else {
        Err(format!("Invalid value for a boolean {:?}", value))
    }
}

pub fn is_int64(value: &str) -> Result<(), String> {
    value
        .parse::<i64>()
        .map(|_| ())
        .map_err(|_| format!("Invalid value for an integer {:?}", value))
}

pub fn is_uint8(value: &str) -> Result<(), String> {
    value
        .parse::<u8>()
        .map(|_| ())
        .map_err(|_| format!("Invalid value for an 8-bit unsigned integer {:?}", value))
}

pub fn is_uint32(value: &str) -> Result<(), String> {
    value
        .parse::<u32>()
        .map(|_| ())
        .map_err(|_| format!("Invalid value for a 32-bit unsigned integer {:?}", value))
}

pub fn is_port(value: &str) -> Result<(), String> {
    let port: i64 = value
        .parse()
        .map_err(|_| format!("Invalid value for an integer: {}", value))?;
    if !(1..=65535).contains(&port) {
        return Err(format!("Invalid port number: {}", value));
    }
    Ok(())
}

pub fn is_network_mac(value: &str) -> Result<(), String> {
    parse_mac(value).map(|_| ())
}

pub fn is_network_mtu(value: &str) -> Result<(), String> {
    let mtu: u32 = value.parse().map_err(|_| format!("Invalid MTU {:?}", value))?;
    if !(68..=16384).contains(&mtu) {
        return Err(format!("Out of MTU range (68-16384) {:?}", value));
    }
    Ok(())
}

pub fn is_network_address(value: &str) -> Result<(), String> {
    value
        .parse::<IpAddr>()
        .map(|_| ())
        .map_err(|_| format!("Not an IP address {:?}", value))
}

pub fn is_network_address_v4(value: &str) -> Result<(), String> {
    match value.parse::<IpAddr>() {
        Ok(IpAddr::V4(_)) => Ok(()),
        _ => Err(format!("Not an IPv4 address {:?}", value)),
    }
}

pub fn is_network_address_v6(value: &str) -> Result<(), String> {
    match value.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => Ok(()),
        _ => Err(format!("Not an IPv6 address {:?}", value)),
    }
}

pub fn is_network_address_cidr_v4(value: &str) -> Result<(), String> {
    match value.parse::<IpNet>() {
        Ok(IpNet::V4(_)) => Ok(()),
        _ => Err(format!("Not an IPv4 CIDR address {:?}", value)),
    }
}

pub fn is_network_address_cidr_v6(value: &str) -> Result<(), String> {
    match value.parse::<IpNet>() {
        Ok(IpNet::V6(_)) => Ok(()),
        _ => Err(format!("Not an IPv6 CIDR address {:?}", value)),
    }
}

/// A network in CIDR form whose host bits are zero.
pub fn is_network_v4(value: &str) -> Result<(), String> {
    match value.parse::<IpNet>() {
        Ok(net @ IpNet::V4(_)) if net.addr() == net.network() => Ok(()),
        Ok(IpNet::V4(_)) => Err(format!("Not an IPv4 network address {:?}", value)),
        _ => Err(format!("Not an IPv4 network {:?}", value)),
    }
}

pub fn is_network_v6(value: &str) -> Result<(), String> {
    match value.parse::<IpNet>() {
        Ok(net @ IpNet::V6(_)) if net.addr() == net.network() => Ok(()),
        Ok(IpNet::V6(_)) => Err(format!("Not an IPv6 network address {:?}", value)),
        _ => Err(format!("Not an IPv6 network {:?}", value)),
    }
}

pub fn each<F>(f: F) -> impl Fn(&str) -> Result<(), String> + Send + Sync
where
    F: Fn(&str) -> Result<(), String> + Send + Sync,
{
    move |value| split_list(value).iter().try_for_each(|entry| f(entry.as_str()))
}

fn is_range_list(v4: bool) -> impl Fn(&str) -> Result<(), String> + Send + Sync {
    move |value| {
        let ranges: Vec<IpRange> = parse_ip_ranges(value, &[])?;
        for range in ranges {
            if range.start.is_ipv4() != v4 {
                return Err(format!(
                    "Range {} is not an IPv{} range",
                    range,
                    if v4 { 4 } else { 6 }
                ));
            }
        }
        Ok(())
    }
}

pub fn is_interface_name(value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err("Interface name cannot be empty".to_string());
    }
    if value.len() > MAX_INTERFACE_NAME {
        return Err(format!(
            "Interface name {:?} is longer than {} characters",
            value, MAX_INTERFACE_NAME
        ));
    }
    if value == "." || value == ".." {
        return Err(format!("Interface name cannot be {:?}", value));
    }
    if value.chars().any(|c| c == '/' || c == ':' || c.is_whitespace()) {
        return Err(format!("Interface name {:?} contains an invalid character", value));
    }
    Ok(())
}

/// `infinite` or a duration such as `1h` or `30m`.
pub fn is_dhcp_expiry(value: &str) -> Result<(), String> {
    if value == "infinite" {
        return Ok(());
    }
    humantime::parse_duration(value)
        .map(|_| ())
        .map_err(|e| format!("Invalid DHCP expiry {:?}: {}", value, e))
}

/// dnsmasq lease time argument for an expiry value.
pub fn dhcp_expiry_arg(value: &str) -> String {
    match value {
        "" => "1h".to_string(),
        "infinite" => "infinite".to_string(),
        other => match humantime::parse_duration(other) {
            Ok(d) if d >= Duration::from_secs(120) => format!("{}s", d.as_secs()),
            Ok(_) => "2m".to_string(),
            Err(_) => other.to_string(),
        },
    }
}

pub fn is_dns_name(value: &str) -> Result<(), String> {
    let name = value.trim_end_matches('.');
    if name.is_empty() || name.len() > 253 {
        return Err(format!("Invalid DNS name {:?}", value));
    }
    for label in name.split('.') {
        let valid = !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(format!("Invalid DNS name {:?}", value));
        }
    }
    Ok(())
}

/// Network names double as kernel interface names.
pub fn validate_name(name: &str) -> NetworkResult<()> {
    is_interface_name(name).map_err(NetworkError::Validation)
}

fn static_rules() -> HashMap<String, Validator> {
    let mut rules: HashMap<String, Validator> = HashMap::new();
    let mut add = |key: &str, v: Validator| {
        rules.insert(key.to_string(), v);
    };

    add("bgp.ipv4.nexthop", optional(is_network_address_v4));
    add("bgp.ipv6.nexthop", optional(is_network_address_v6));

    add("bridge.driver", optional(is_one_of(&["native", "openvswitch"])));
    add(
        "bridge.external_interfaces",
        optional(|value| {
            for entry in value.split(',') {
                let entry = entry.trim();
                is_interface_name(entry)
                    .map_err(|e| format!("Invalid interface name {:?}: {}", entry, e))?;
            }
            Ok(())
        }),
    );
    add("bridge.hwaddr", optional(is_network_mac));
    add("bridge.mtu", optional(is_network_mtu));
    add("bridge.mode", optional(is_one_of(&["standard", "fan"])));

    add("fan.overlay_subnet", optional(is_network_v4));
    add(
        "fan.underlay_subnet",
        optional(|value| if value == "auto" { Ok(()) } else { is_network_v4(value) }),
    );
    add("fan.type", optional(is_one_of(&["vxlan", "ipip"])));

    add(
        "ipv4.address",
        optional(|value| match value {
            "none" | "auto" => Ok(()),
            _ => is_network_address_cidr_v4(value),
        }),
    );
    add("ipv4.firewall", optional(is_bool));
    add("ipv4.nat", optional(is_bool));
    add("ipv4.nat.order", optional(is_one_of(&["before", "after"])));
    add("ipv4.nat.address", optional(is_network_address_v4));
    add("ipv4.dhcp", optional(is_bool));
    add("ipv4.dhcp.gateway", optional(is_network_address_v4));
    add("ipv4.dhcp.expiry", optional(is_dhcp_expiry));
    add("ipv4.dhcp.ranges", optional(is_range_list(true)));
    add("ipv4.routes", optional(each(is_network_v4)));
    add("ipv4.routing", optional(is_bool));
    add("ipv4.ovn.ranges", optional(is_range_list(true)));

    add(
        "ipv6.address",
        optional(|value| match value {
            "none" | "auto" => Ok(()),
            _ => is_network_address_cidr_v6(value),
        }),
    );
    add("ipv6.firewall", optional(is_bool));
    add("ipv6.nat", optional(is_bool));
    add("ipv6.nat.order", optional(is_one_of(&["before", "after"])));
    add("ipv6.nat.address", optional(is_network_address_v6));
    add("ipv6.dhcp", optional(is_bool));
    add("ipv6.dhcp.expiry", optional(is_dhcp_expiry));
    add("ipv6.dhcp.stateful", optional(is_bool));
    add("ipv6.dhcp.ranges", optional(is_range_list(false)));
    add("ipv6.routes", optional(each(is_network_v6)));
    add("ipv6.routing", optional(is_bool));
    add("ipv6.ovn.ranges", optional(is_range_list(false)));

    add("dns.domain", rule(is_any));
    add("dns.mode", optional(is_one_of(&["dynamic", "managed", "none"])));
    add("dns.search", rule(is_any));
    add("dns.zone.forward", optional(is_dns_name));
    add("dns.zone.reverse.ipv4", optional(is_dns_name));
    add("dns.zone.reverse.ipv6", optional(is_dns_name));
    add("raw.dnsmasq", rule(is_any));
    add("maas.subnet.ipv4", rule(is_any));
    add("maas.subnet.ipv6", rule(is_any));
    add("security.acls", rule(is_any));
    add("security.acls.default.ingress.action", optional(is_one_of(ACL_ACTIONS)));
    add("security.acls.default.egress.action", optional(is_one_of(ACL_ACTIONS)));
    add("security.acls.default.ingress.logged", optional(is_bool));
    add("security.acls.default.egress.logged", optional(is_bool));

    rules
}

/// Full rule table for `config`: the static table plus rules for every
/// `tunnel.<name>.<field>` and `bgp.peers.<name>.<field>` key present.
pub fn bridge_rules(name: &str, config: &NetworkConfig) -> NetworkResult<HashMap<String, Validator>> {
    let mut rules = static_rules();

    for key in config.keys() {
        if key.starts_with("tunnel.") {
            let fields: Vec<&str> = key.split('.').collect();
            if fields.len() != 3 {
                return Err(NetworkError::validation(format!(
                    "Invalid network configuration key: {}",
                    key
                )));
            }

            if name.len() + fields[1].len() > 14 {
                return Err(NetworkError::validation(format!(
                    "Network name too long for tunnel interface: {}-{}",
                    name, fields[1]
                )));
            }

            let validator = match fields[2] {
                "protocol" => optional(is_one_of(&["gre", "vxlan"])),
                "local" | "remote" | "group" => optional(is_network_address),
                "port" => optional(is_port),
                "id" => optional(is_int64),
                "interface" => optional(is_interface_name),
                "ttl" => optional(is_uint8),
                _ => continue,
            };
            rules.insert(key.clone(), validator);
        } else if key.starts_with("bgp.peers.") {
            let fields: Vec<&str> = key.split('.').collect();
            if fields.len() != 4 {
                return Err(NetworkError::validation(format!(
                    "Invalid network configuration key: {}",
                    key
                )));
            }

            let validator = match fields[3] {
                "address" => optional(is_network_address),
                "asn" => optional(is_uint32),
                "password" => rule(is_any),
                "holdtime" => optional(is_uint32),
                _ => continue,
            };
            rules.insert(key.clone(), validator);
        }
    }

    Ok(rules)
}

/// Check every key against its rule. Unknown keys fail unless they are `user.*`.
fn validate_keys(
    name: &str,
    config: &NetworkConfig,
    rules: &HashMap<String, Validator>,
) -> NetworkResult<()> {
    for (key, validator) in rules {
        validator(config.get(key)).map_err(|e| {
            NetworkError::validation(format!(
                "Invalid value for network {:?} option {:?}: {}",
                name, key, e
            ))
        })?;
    }

    for key in config.keys() {
        if key.starts_with("user.") || rules.contains_key(key) {
            continue;
        }
        return Err(NetworkError::validation(format!(
            "Invalid network configuration key: {}",
            key
        )));
    }

    Ok(())
}

fn check_mtu(config: &NetworkConfig, value: &str) -> NetworkResult<()> {
    let mtu: i64 = value
        .parse()
        .map_err(|_| NetworkError::validation(format!("Invalid value for an integer: {}", value)))?;

    if config.has_ipv6_address() && mtu < 1280 {
        return Err(NetworkError::validation("The minimum MTU for an IPv6 network is 1280"));
    }

    if config.has_ipv4_address() && mtu < 68 {
        return Err(NetworkError::validation("The minimum MTU for an IPv4 network is 68"));
    }

    if config.is_fan() {
        match FanType::from_config(config.get("fan.type")) {
            FanType::Ipip if mtu > 1480 => {
                return Err(NetworkError::validation("Maximum MTU for an IPIP FAN bridge is 1480"))
            }
            FanType::Vxlan if mtu > 1450 => {
                return Err(NetworkError::validation("Maximum MTU for a VXLAN FAN bridge is 1450"))
            }
            _ => {}
        }
    }

    Ok(())
}

/// Using the same MAC on every cluster member is only safe when members cannot share a segment.
pub fn check_cluster_wide_mac_safe(config: &NetworkConfig) -> NetworkResult<()> {
    if config.is_fan() {
        return Err(NetworkError::validation(
            r#"Cannot use static "bridge.hwaddr" MAC address in fan mode"#,
        ));
    }

    if !config.get("bridge.external_interfaces").is_empty()
        && config.get("ipv4.address") == "none"
        && config.get("ipv6.address") == "none"
    {
        return Err(NetworkError::validation(
            r#"Cannot use static "bridge.hwaddr" MAC address when bridge has no IP addresses and has external interfaces set"#,
        ));
    }

    Ok(())
}

fn check_ovn_ranges(config: &NetworkConfig, dhcp_subnet_v4: Option<IpNet>) -> NetworkResult<()> {
    if !config.get("ipv4.ovn.ranges").is_empty() {
        let mut allowed = Vec::new();
        if let Some(subnet) = dhcp_subnet_v4 {
            if config.get("ipv4.dhcp.ranges").is_empty() {
                return Err(NetworkError::validation(
                    r#""ipv4.ovn.ranges" must be used in conjunction with non-overlapping "ipv4.dhcp.ranges" when DHCPv4 is enabled"#,
                ));
            }
            allowed.push(subnet);
        }

        let ovn = parse_ip_ranges(config.get("ipv4.ovn.ranges"), &allowed)
            .map_err(|e| NetworkError::validation(format!("Failed parsing ipv4.ovn.ranges: {}", e)))?;
        let dhcp = parse_ip_ranges(config.get("ipv4.dhcp.ranges"), &allowed)
            .map_err(|e| NetworkError::validation(format!("Failed parsing ipv4.dhcp.ranges: {}", e)))?;

        for o in &ovn {
            if dhcp.iter().any(|d| o.overlaps(d)) {
                return Err(NetworkError::validation(format!(
                    r#"The range specified in "ipv4.ovn.ranges" ("{}") cannot overlap with "ipv4.dhcp.ranges""#,
                    o
                )));
            }
        }
    }

    if !config.get("ipv6.ovn.ranges").is_empty() {
        let dhcp_subnet = dhcpv6_subnet(config);
        let stateful = config.is_true("ipv6.dhcp.stateful");
        let mut allowed = Vec::new();
        if let Some(subnet) = dhcp_subnet {
            if config.get("ipv6.dhcp.ranges").is_empty() && stateful {
                return Err(NetworkError::validation(
                    r#""ipv6.ovn.ranges" must be used in conjunction with non-overlapping "ipv6.dhcp.ranges" when stateful DHCPv6 is enabled"#,
                ));
            }
            allowed.push(subnet);
        }

        let ovn = parse_ip_ranges(config.get("ipv6.ovn.ranges"), &allowed)
            .map_err(|e| NetworkError::validation(format!("Failed parsing ipv6.ovn.ranges: {}", e)))?;

        // Without stateful DHCPv6 clients use SLAAC and the ranges are unused.
        if dhcp_subnet.is_some() && stateful {
            let dhcp = parse_ip_ranges(config.get("ipv6.dhcp.ranges"), &allowed)
                .map_err(|e| NetworkError::validation(format!("Failed parsing ipv6.dhcp.ranges: {}", e)))?;
            for o in &ovn {
                if dhcp.iter().any(|d| o.overlaps(d)) {
                    return Err(NetworkError::validation(format!(
                        r#"The range specified in "ipv6.ovn.ranges" ("{}") cannot overlap with "ipv6.dhcp.ranges""#,
                        o
                    )));
                }
            }
        }
    }

    Ok(())
}

/// Configured IPv4 DHCP subnet outside fan mode. Fan mode reads it from the live bridge instead.
pub fn dhcpv4_subnet_from_config(config: &NetworkConfig) -> Option<IpNet> {
    if !config.has_dhcpv4() || config.is_fan() {
        return None;
    }
    config.get("ipv4.address").parse::<IpNet>().ok().map(|n| n.trunc())
}

pub fn dhcpv6_subnet(config: &NetworkConfig) -> Option<IpNet> {
    if !config.has_dhcpv6() {
        return None;
    }
    config.get("ipv6.address").parse::<IpNet>().ok().map(|n| n.trunc())
}

/// Validate a whole bridge config. Pure: `existing_acls` and the fan DHCP subnet come from the caller.
pub fn validate_config(
    name: &str,
    config: &NetworkConfig,
    existing_acls: &[String],
    fan_dhcp_subnet: Option<IpNet>,
) -> NetworkResult<()> {
    let rules = bridge_rules(name, config)?;
    validate_keys(name, config, &rules)?;

    if config.is_fan() && name.len() > 11 {
        return Err(NetworkError::validation(
            "Network name too long to use with the FAN (must be 11 characters or less)",
        ));
    }

    for (key, value) in config.iter() {
        if value.is_empty() {
            continue;
        }

        if config.is_fan()
            && key.starts_with("ipv4.")
            && !["ipv4.dhcp.expiry", "ipv4.firewall", "ipv4.nat", "ipv4.nat.order"].contains(&key.as_str())
        {
            return Err(NetworkError::validation(
                "IPv4 configuration may not be set when in 'fan' mode",
            ));
        }

        if config.is_fan() && key.starts_with("ipv6.") {
            return Err(NetworkError::validation(
                "IPv6 configuration may not be set when in 'fan' mode",
            ));
        }

        if !config.is_fan() && key.starts_with("fan.") {
            return Err(NetworkError::validation(
                "FAN configuration may only be set when in 'fan' mode",
            ));
        }

        if key == "bridge.mtu" {
            check_mtu(config, value)?;
        }
    }

    if !config.get("bridge.hwaddr").is_empty() {
        check_cluster_wide_mac_safe(config)?;
    }

    let dhcp_subnet_v4 = if config.is_fan() {
        fan_dhcp_subnet.filter(|_| config.has_dhcpv4())
    } else {
        dhcpv4_subnet_from_config(config)
    };
    check_ovn_ranges(config, dhcp_subnet_v4)?;

    for acl in split_list(config.get("security.acls")) {
        if !existing_acls.contains(&acl) {
            return Err(NetworkError::NotFound(format!(
                "Network ACL {:?} not found",
                acl
            )));
        }
    }

    Ok(())
}

/// Listen address of a forward: a single host IP.
pub fn parse_listen_address(value: &str) -> NetworkResult<IpAddr> {
    let net = parse_ip_to_net(value).map_err(NetworkError::Validation)?;
    if net.prefix_len() != net.max_prefix_len() {
        return Err(NetworkError::validation(format!(
            "Only single IP listen addresses are allowed, got {:?}",
            value
        )));
    }
    Ok(net.addr())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(pairs: &[(&str, &str)]) -> NetworkConfig {
        pairs.iter().copied().collect()
    }

    fn check(pairs: &[(&str, &str)]) -> NetworkResult<()> {
        validate_config("lxdbr0", &cfg(pairs), &[], None)
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = check(&[("ipv4.bogus", "1")]).unwrap_err();
        assert!(err.to_string().contains("Invalid network configuration key: ipv4.bogus"));
        assert!(check(&[("user.anything", "goes")]).is_ok());
    }

    #[test]
    fn test_per_key_rules() {
        assert!(check(&[("ipv4.address", "auto")]).is_ok());
        assert!(check(&[("ipv4.address", "10.0.0.1/24")]).is_ok());
        assert!(check(&[("ipv4.address", "fd42::1/64")]).is_err());
        assert!(check(&[("ipv4.nat", "maybe")]).is_err());
        assert!(check(&[("bridge.driver", "ovs")]).is_err());
        assert!(check(&[("ipv4.routes", "10.1.0.0/16,10.2.0.0/16")]).is_ok());
        assert!(check(&[("ipv4.routes", "10.1.0.1/16")]).is_err());
        assert!(check(&[("ipv4.dhcp.expiry", "2h")]).is_ok());
        assert!(check(&[("ipv4.dhcp.expiry", "infinite")]).is_ok());
        assert!(check(&[("ipv4.dhcp.expiry", "soon")]).is_err());
    }

    #[test]
    fn test_tunnel_keys() {
        assert!(check(&[("tunnel.t1.protocol", "gre"), ("tunnel.t1.local", "192.0.2.1")]).is_ok());
        assert!(check(&[("tunnel.t1.protocol", "ipip")]).is_err());
        assert!(check(&[("tunnel.t1.ttl", "300")]).is_err());
        assert!(check(&[("tunnel.t1.interface", "eth0")]).is_ok());
        assert!(check(&[("tunnel.t1.bogus", "x")]).is_err());
        assert!(check(&[("tunnel.t1", "x")]).is_err());

        let err = validate_config("longbridge", &cfg(&[("tunnel.abcde.id", "1")]), &[], None).unwrap_err();
        assert!(err.to_string().contains("Network name too long for tunnel interface"));
    }

    #[test]
    fn test_fan_mode_key_groups() {
        let fan = [("bridge.mode", "fan")];
        assert!(check(&fan).is_ok());
        for allowed in ["ipv4.dhcp.expiry", "ipv4.firewall", "ipv4.nat", "ipv4.nat.order"] {
            let value = match allowed {
                "ipv4.dhcp.expiry" => "1h",
                "ipv4.nat.order" => "before",
                _ => "true",
            };
            assert!(check(&[fan[0], (allowed, value)]).is_ok(), "{allowed}");
        }
        assert!(check(&[fan[0], ("ipv4.address", "10.0.0.1/24")]).is_err());
        assert!(check(&[fan[0], ("ipv4.dhcp", "true")]).is_err());
        assert!(check(&[fan[0], ("ipv6.address", "fd42::1/64")]).is_err());
        // Empty values do not count as set
        assert!(check(&[fan[0], ("ipv6.address", "")]).is_ok());
        assert!(check(&[("fan.type", "ipip")]).is_err());

        let err = validate_config("verylongname", &cfg(&fan), &[], None).unwrap_err();
        assert!(err.to_string().contains("must be 11 characters or less"));
    }

    #[test]
    fn test_mtu_bounds() {
        assert_eq!(
            check(&[("bridge.mtu", "1200"), ("ipv6.address", "fd42::1/64")])
                .unwrap_err()
                .to_string(),
            "The minimum MTU for an IPv6 network is 1280"
        );
        assert!(check(&[("bridge.mtu", "1200"), ("ipv4.address", "10.0.0.1/24"), ("ipv6.address", "none")]).is_ok());
        assert!(check(&[("bridge.mode", "fan"), ("bridge.mtu", "1460")]).is_err());
        assert!(check(&[("bridge.mode", "fan"), ("fan.type", "ipip"), ("bridge.mtu", "1460")]).is_ok());
        assert!(check(&[("bridge.mode", "fan"), ("fan.type", "ipip"), ("bridge.mtu", "1490")]).is_err());
    }

    #[test]
    fn test_static_mac_safety() {
        let err = check(&[
            ("bridge.external_interfaces", "eth1"),
            ("ipv4.address", "none"),
            ("ipv6.address", "none"),
            ("bridge.hwaddr", "00:16:3e:00:00:01"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("no IP addresses and has external interfaces"));

        assert!(check(&[("bridge.mode", "fan"), ("bridge.hwaddr", "00:16:3e:00:00:01")]).is_err());
        assert!(check(&[("ipv4.address", "10.0.0.1/24"), ("bridge.hwaddr", "00:16:3e:00:00:01")]).is_ok());
    }

    #[test]
    fn test_ovn_ranges() {
        let base = [("ipv4.address", "10.0.0.1/24")];
        let err = check(&[base[0], ("ipv4.ovn.ranges", "10.0.0.100-10.0.0.110")]).unwrap_err();
        assert!(err.to_string().contains("must be used in conjunction"));

        assert!(check(&[
            base[0],
            ("ipv4.ovn.ranges", "10.0.0.100-10.0.0.110"),
            ("ipv4.dhcp.ranges", "10.0.0.10-10.0.0.50"),
        ])
        .is_ok());

        assert!(check(&[
            base[0],
            ("ipv4.ovn.ranges", "10.0.0.40-10.0.0.110"),
            ("ipv4.dhcp.ranges", "10.0.0.10-10.0.0.50"),
        ])
        .is_err());

        // Stateless DHCPv6 does not need ranges
        assert!(check(&[
            ("ipv6.address", "fd42::1/64"),
            ("ipv6.ovn.ranges", "fd42::100-fd42::200"),
        ])
        .is_ok());
    }

    #[test]
    fn test_acl_existence() {
        let config = cfg(&[("security.acls", "web, db")]);
        assert!(validate_config("br0", &config, &["web".to_string()], None)
            .unwrap_err()
            .is_not_found());
        assert!(validate_config("br0", &config, &["db".to_string(), "web".to_string()], None).is_ok());
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("lxdbr0").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a-very-long-name-0").is_err());
        assert!(validate_name("br/0").is_err());
        assert!(validate_name("..").is_err());
    }

    #[test]
    fn test_dhcp_expiry_arg() {
        assert_eq!(dhcp_expiry_arg(""), "1h");
        assert_eq!(dhcp_expiry_arg("infinite"), "infinite");
        assert_eq!(dhcp_expiry_arg("2h"), "7200s");
    }

    #[test]
    fn test_parse_listen_address() {
        assert_eq!(parse_listen_address("192.0.2.1").unwrap().to_string(), "192.0.2.1");
        assert!(parse_listen_address("192.0.2.1/32").is_ok());
        assert!(parse_listen_address("192.0.2.0/24").is_err());
    }
}
