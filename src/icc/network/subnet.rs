use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::{NetworkError, NetworkResult};

const RANDOM_SUBNET_ATTEMPTS: usize = 100;

/// Inclusive address range written as `start-end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpRange {
    pub start: IpAddr,
    pub end: IpAddr,
}

impl IpRange {
    pub fn contains(&self, ip: IpAddr) -> bool {
        ip_to_u128(self.start) <= ip_to_u128(ip)
            && ip_to_u128(ip) <= ip_to_u128(self.end)
            && self.start.is_ipv4() == ip.is_ipv4()
    }

    pub fn overlaps(&self, other: &IpRange) -> bool {
        if self.start.is_ipv4() != other.start.is_ipv4() {
            return false;
        }
        self.contains(other.start)
            || self.contains(other.end)
            || other.contains(self.start)
            || other.contains(self.end)
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

fn ip_to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u32::from(v4) as u128,
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// Parse one `start-end` range. When `allowed` is non-empty both ends must sit in one of those subnets.
pub fn parse_ip_range(value: &str, allowed: &[IpNet]) -> Result<IpRange, String> {
    let (start, end) = value
        .split_once('-')
        .ok_or_else(|| format!("IP range {:?} must contain start and end IP addresses", value))?;

    let start: IpAddr = start
        .trim()
        .parse()
        .map_err(|_| format!("Start IP {:?} is invalid", start.trim()))?;
    let end: IpAddr = end
        .trim()
        .parse()
        .map_err(|_| format!("End IP {:?} is invalid", end.trim()))?;

    if start.is_ipv4() != end.is_ipv4() {
        return Err(format!("IP range {:?} mixes address families", value));
    }
    if ip_to_u128(start) > ip_to_u128(end) {
        return Err(format!("Start IP {} must be before end IP {}", start, end));
    }

    if !allowed.is_empty() {
        let within = allowed
            .iter()
            .any(|net| net.contains(&start) && net.contains(&end));
        if !within {
            let nets: Vec<String> = allowed.iter().map(|n| n.to_string()).collect();
            return Err(format!(
                "IP range {:?} does not fall within any of the allowed networks [{}]",
                value,
                nets.join(" ")
            ));
        }
    }

    Ok(IpRange { start, end })
}

pub fn parse_ip_ranges(value: &str, allowed: &[IpNet]) -> Result<Vec<IpRange>, String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| parse_ip_range(entry, allowed))
        .collect()
}

/// Two subnets overlap when either contains the other's network address.
pub fn subnets_overlap(a: &IpNet, b: &IpNet) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

/// The n-th address of a subnet; negative values count back from the end of the subnet
/// so that -1 is the broadcast address and -2 the last usable host.
pub fn get_ip(subnet: &IpNet, host: i64) -> IpAddr {
    let host_bits = u32::from(subnet.max_prefix_len() - subnet.prefix_len());
    let base = ip_to_u128(subnet.network());
    let offset = if host < 0 {
        let size = if host_bits >= 128 { u128::MAX } else { 1u128 << host_bits };
        size.wrapping_sub(host.unsigned_abs() as u128)
    } else {
        host as u128
    };
    let value = base.wrapping_add(offset);

    match subnet {
        IpNet::V4(_) => IpAddr::V4(Ipv4Addr::from(value as u32)),
        IpNet::V6(_) => IpAddr::V6(Ipv6Addr::from(value)),
    }
}

/// Parse `ADDR/PREFIX` keeping the host part, e.g. `10.0.0.1/24`.
pub fn parse_cidr(value: &str) -> NetworkResult<(IpAddr, IpNet)> {
    let net: IpNet = value
        .parse()
        .map_err(|_| NetworkError::validation(format!("Invalid CIDR address {:?}", value)))?;
    Ok((net.addr(), net.trunc()))
}

/// Accept a bare IP (single host network) or a CIDR.
pub fn parse_ip_to_net(value: &str) -> Result<IpNet, String> {
    if let Ok(ip) = value.parse::<IpAddr>() {
        return Ok(IpNet::from(ip));
    }
    value
        .parse::<IpNet>()
        .map_err(|_| format!("Invalid IP address or subnet {:?}", value))
}

/// Random `10.x.y.1/24` whose subnet does not collide with `in_use`.
pub fn random_subnet_v4<R: Rng>(rng: &mut R, in_use: &[IpNet]) -> NetworkResult<String> {
    for _ in 0..RANDOM_SUBNET_ATTEMPTS {
        let cidr = format!("10.{}.{}.1/24", rng.gen_range(0..255), rng.gen_range(0..255));
        let Ok(net) = cidr.parse::<Ipv4Net>() else {
            continue;
        };
        let subnet = IpNet::V4(net.trunc());
        if in_use.iter().any(|used| subnets_overlap(used, &subnet)) {
            continue;
        }
        return Ok(cidr);
    }

    Err(NetworkError::environment(
        "Failed to automatically find an unused IPv4 subnet, manual configuration required",
    ))
}

/// Random ULA `fd42:xxxx:xxxx:xxxx::1/64` whose subnet does not collide with `in_use`.
pub fn random_subnet_v6<R: Rng>(rng: &mut R, in_use: &[IpNet]) -> NetworkResult<String> {
    for _ in 0..RANDOM_SUBNET_ATTEMPTS {
        let cidr = format!(
            "fd42:{:x}:{:x}:{:x}::1/64",
            rng.gen_range(0..65535u32),
            rng.gen_range(0..65535u32),
            rng.gen_range(0..65535u32)
        );
        let Ok(net) = cidr.parse::<Ipv6Net>() else {
            continue;
        };
        let subnet = IpNet::V6(net.trunc());
        if in_use.iter().any(|used| subnets_overlap(used, &subnet)) {
            continue;
        }
        return Ok(cidr);
    }

    Err(NetworkError::environment(
        "Failed to automatically find an unused IPv6 subnet, manual configuration required",
    ))
}

pub fn parse_mac(value: &str) -> Result<[u8; 6], String> {
    let parts: Vec<&str> = value.split(|c| c == ':' || c == '-').collect();
    if parts.len() != 6 {
        return Err(format!("Invalid MAC address {:?}", value));
    }

    let mut mac = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        if part.len() != 2 {
            return Err(format!("Invalid MAC address {:?}", value));
        }
        mac[i] = u8::from_str_radix(part, 16).map_err(|_| format!("Invalid MAC address {:?}", value))?;
    }
    Ok(mac)
}

pub fn format_mac(mac: &[u8]) -> String {
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Stable MAC in the `00:16:3e` range derived from a seed string.
pub fn stable_mac(seed: &str) -> String {
    let digest = Sha256::digest(seed.as_bytes());
    format_mac(&[0x00, 0x16, 0x3e, digest[0], digest[1], digest[2]])
}

/// SLAAC address for `mac` inside a /64 `prefix`.
pub fn eui64(prefix: &Ipv6Net, mac: &[u8; 6]) -> Ipv6Addr {
    let mut octets = prefix.network().octets();
    octets[8] = mac[0] ^ 0x02;
    octets[9] = mac[1];
    octets[10] = mac[2];
    octets[11] = 0xff;
    octets[12] = 0xfe;
    octets[13] = mac[3];
    octets[14] = mac[4];
    octets[15] = mac[5];
    Ipv6Addr::from(octets)
}

/// Global unicast test used when refusing to bridge configured interfaces.
pub fn is_global_unicast(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_loopback()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_broadcast()
                || v4.is_unspecified())
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            !(v6.is_loopback()
                || v6.is_multicast()
                || v6.is_unspecified()
                || (first & 0xffc0) == 0xfe80)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[test]
    fn test_get_ip_positive_and_negative() {
        let subnet = net("192.0.2.0/24");
        assert_eq!(get_ip(&subnet, 2).to_string(), "192.0.2.2");
        assert_eq!(get_ip(&subnet, -2).to_string(), "192.0.2.254");
        assert_eq!(get_ip(&subnet, -1).to_string(), "192.0.2.255");

        let subnet6 = net("fd42::/64");
        assert_eq!(get_ip(&subnet6, -1).to_string(), "fd42::ffff:ffff:ffff:ffff");
    }

    #[test]
    fn test_subnet_overlap_is_symmetric() {
        let cases = [
            ("10.0.0.0/8", "10.1.0.0/16", true),
            ("10.0.0.0/24", "10.0.1.0/24", false),
            ("192.168.0.0/16", "192.168.255.0/24", true),
            ("fd42::/64", "fd42::/48", true),
            ("fd42::/64", "10.0.0.0/8", false),
        ];
        for (a, b, expected) in cases {
            let (a, b) = (net(a), net(b));
            assert_eq!(subnets_overlap(&a, &b), expected, "{a} {b}");
            assert_eq!(subnets_overlap(&b, &a), expected, "{b} {a}");
            assert!(subnets_overlap(&a, &a));
        }
    }

    #[test]
    fn test_parse_ranges() {
        let allowed = [net("10.0.0.0/24")];
        let ranges = parse_ip_ranges("10.0.0.10-10.0.0.20, 10.0.0.30-10.0.0.40", &allowed).unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].to_string(), "10.0.0.10-10.0.0.20");
        assert!(!ranges[0].overlaps(&ranges[1]));

        assert!(parse_ip_range("10.0.1.10-10.0.1.20", &allowed).is_err());
        assert!(parse_ip_range("10.0.0.20-10.0.0.10", &[]).is_err());
        assert!(parse_ip_range("10.0.0.1", &[]).is_err());

        let a = parse_ip_range("10.0.0.1-10.0.0.100", &[]).unwrap();
        let b = parse_ip_range("10.0.0.50-10.0.0.60", &[]).unwrap();
        assert!(a.overlaps(&b) && b.overlaps(&a));
    }

    #[test]
    fn test_random_subnets_avoid_used() {
        let mut rng = StdRng::seed_from_u64(7);
        let cidr = random_subnet_v4(&mut rng, &[net("10.255.0.0/16")]).unwrap();
        assert!(cidr.starts_with("10.") && cidr.ends_with(".1/24"));

        let mut rng = StdRng::seed_from_u64(7);
        assert!(random_subnet_v4(&mut rng, &[net("10.0.0.0/8")]).is_err());

        let mut rng = StdRng::seed_from_u64(7);
        let cidr = random_subnet_v6(&mut rng, &[]).unwrap();
        assert!(cidr.starts_with("fd42:") && cidr.ends_with("::1/64"));
    }

    #[test]
    fn test_mac_helpers() {
        let mac = parse_mac("00:16:3E:AA:bb:01").unwrap();
        assert_eq!(format_mac(&mac), "00:16:3e:aa:bb:01");
        assert!(parse_mac("00:16:3e:aa:bb").is_err());

        let a = stable_mac("fingerprint.0.3");
        assert_eq!(a, stable_mac("fingerprint.0.3"));
        assert_ne!(a, stable_mac("fingerprint.2.3"));
        assert!(a.starts_with("00:16:3e:"));
    }

    #[test]
    fn test_eui64() {
        let prefix: Ipv6Net = "fd42:1:2:3::/64".parse().unwrap();
        let mac = parse_mac("00:16:3e:12:34:56").unwrap();
        assert_eq!(eui64(&prefix, &mac).to_string(), "fd42:1:2:3:216:3eff:fe12:3456");
    }

    #[test]
    fn test_global_unicast() {
        assert!(is_global_unicast(&"192.0.2.1".parse().unwrap()));
        assert!(!is_global_unicast(&"127.0.0.1".parse().unwrap()));
        assert!(!is_global_unicast(&"fe80::1".parse().unwrap()));
        assert!(is_global_unicast(&"fd42::1".parse().unwrap()));
    }
}
