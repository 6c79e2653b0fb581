use std::net::{IpAddr, Ipv4Addr};

use ipnet::Ipv4Net;

use crate::error::{NetworkError, NetworkResult};

pub const DEFAULT_OVERLAY: &str = "240.0.0.0/8";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanType {
    Vxlan,
    Ipip,
}

impl FanType {
    pub fn from_config(value: &str) -> Self {
        match value {
            "ipip" => FanType::Ipip,
            _ => FanType::Vxlan,
        }
    }

    /// Largest bridge MTU the encapsulation leaves room for.
    pub fn max_mtu(&self) -> u32 {
        match self {
            FanType::Ipip => 1480,
            FanType::Vxlan => 1450,
        }
    }

    /// Encapsulation overhead subtracted from the underlay device MTU.
    pub fn overhead(&self) -> u32 {
        match self {
            FanType::Ipip => 20,
            FanType::Vxlan => 50,
        }
    }
}

/// An address found on a host interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddress {
    pub interface: String,
    pub address: IpAddr,
    pub prefix_len: u8,
}

/// Result of a fan address computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanAddress {
    /// This host's overlay bridge address in CIDR form
    pub cidr: Ipv4Net,
    /// Interface carrying the underlay address
    pub device: String,
    pub underlay_address: Ipv4Addr,
}

/// First non-loopback interface address inside `subnet`.
pub fn address_for_subnet(
    subnet: &Ipv4Net,
    addresses: &[InterfaceAddress],
) -> NetworkResult<(Ipv4Addr, String)> {
    addresses
        .iter()
        .filter(|a| a.interface != "lo")
        .find_map(|a| match a.address {
            IpAddr::V4(v4) if subnet.contains(&v4) => Some((v4, a.interface.clone())),
            _ => None,
        })
        .ok_or_else(|| NetworkError::environment("No address found in subnet"))
}

/// Overlay address for this host: overlay network bits, then the underlay host bits, then `.1`.
pub fn fan_address(
    underlay: &Ipv4Net,
    overlay: &Ipv4Net,
    addresses: &[InterfaceAddress],
) -> NetworkResult<FanAddress> {
    let underlay_size = underlay.prefix_len();
    if underlay_size != 16 && underlay_size != 24 {
        return Err(NetworkError::validation(
            "Only /16 or /24 underlays are supported at this time",
        ));
    }

    let overlay_size = overlay.prefix_len();
    if overlay_size != 8 && overlay_size != 16 {
        return Err(NetworkError::validation(
            "Only /8 or /16 overlays are supported at this time",
        ));
    }

    if u32::from(overlay_size) + (32 - u32::from(underlay_size)) + 8 > 32 {
        return Err(NetworkError::validation(
            "Underlay or overlay networks too large to accommodate the FAN",
        ));
    }

    let (ip, device) = address_for_subnet(underlay, addresses)?;
    let host = ip.octets();
    let net = overlay.network().octets();

    let mut out = [net[0], 0, 0, 1];
    if overlay_size == 16 {
        out[1] = net[1];
        out[2] = host[3];
    } else if underlay_size == 24 {
        out[1] = host[3];
        out[2] = 0;
    } else {
        out[1] = host[2];
        out[2] = host[3];
    }

    let cidr = Ipv4Net::new(Ipv4Addr::from(out), overlay_size)
        .map_err(|e| NetworkError::validation(e.to_string()))?;

    Ok(FanAddress {
        cidr,
        device,
        underlay_address: ip,
    })
}

/// VXLAN id of a fan device, taken from the overlay network address.
pub fn vxlan_id(overlay: &Ipv4Net) -> u32 {
    u32::from(overlay.network()) >> 8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs() -> Vec<InterfaceAddress> {
        vec![
            InterfaceAddress {
                interface: "lo".to_string(),
                address: "10.1.2.3".parse().unwrap(),
                prefix_len: 32,
            },
            InterfaceAddress {
                interface: "eth0".to_string(),
                address: "10.1.2.4".parse().unwrap(),
                prefix_len: 16,
            },
        ]
    }

    #[test]
    fn test_fan_address_skips_loopback() {
        let underlay: Ipv4Net = "10.1.0.0/16".parse().unwrap();
        let overlay: Ipv4Net = DEFAULT_OVERLAY.parse().unwrap();

        let fan = fan_address(&underlay, &overlay, &addrs()).unwrap();
        assert_eq!(fan.cidr.to_string(), "240.2.4.1/8");
        assert_eq!(fan.device, "eth0");
        assert_eq!(fan.underlay_address.to_string(), "10.1.2.4");

        // Same inputs, same result
        assert_eq!(fan, fan_address(&underlay, &overlay, &addrs()).unwrap());
    }

    #[test]
    fn test_fan_address_layouts() {
        let underlay: Ipv4Net = "10.1.2.0/24".parse().unwrap();
        let overlay: Ipv4Net = "250.0.0.0/8".parse().unwrap();
        let fan = fan_address(&underlay, &overlay, &addrs()).unwrap();
        assert_eq!(fan.cidr.to_string(), "250.4.0.1/8");

        let overlay: Ipv4Net = "250.7.0.0/16".parse().unwrap();
        let fan = fan_address(&underlay, &overlay, &addrs()).unwrap();
        assert_eq!(fan.cidr.to_string(), "250.7.4.1/16");
    }

    #[test]
    fn test_fan_address_rejects_sizes() {
        let overlay: Ipv4Net = DEFAULT_OVERLAY.parse().unwrap();
        let bad_underlay: Ipv4Net = "10.0.0.0/8".parse().unwrap();
        assert!(fan_address(&bad_underlay, &overlay, &addrs()).unwrap_err().is_validation());

        let underlay: Ipv4Net = "10.1.0.0/16".parse().unwrap();
        let bad_overlay: Ipv4Net = "250.0.0.0/12".parse().unwrap();
        assert!(fan_address(&underlay, &bad_overlay, &addrs()).is_err());

        let big_overlay: Ipv4Net = "250.1.0.0/16".parse().unwrap();
        assert!(fan_address(&underlay, &big_overlay, &addrs()).is_err());

        let other: Ipv4Net = "192.168.0.0/16".parse().unwrap();
        assert!(fan_address(&other, &overlay, &addrs()).is_err());
    }

    #[test]
    fn test_vxlan_id_and_mtu() {
        let overlay: Ipv4Net = DEFAULT_OVERLAY.parse().unwrap();
        assert_eq!(vxlan_id(&overlay), 0xf00000);
        assert_eq!(FanType::from_config("ipip").max_mtu(), 1480);
        assert_eq!(FanType::from_config("").max_mtu(), 1450);
    }
}
