use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use futures::TryStreamExt;
use ipnet::IpNet;
use netlink_packet_route::address::nlas::Nla as AddressNla;
use netlink_packet_route::link::nlas::Nla as LinkNla;

use super::fan::InterfaceAddress;
use crate::error::{NetworkError, NetworkResult};

const RT_SCOPE_UNIVERSE: u8 = 0;

/// Persistent netlink handle for link and address operations on the host namespace.
pub struct NetlinkHandle {
    handle: rtnetlink::Handle,
    // Keep the connection task alive
    _conn_task: tokio::task::JoinHandle<()>,
}

fn not_found(e: &rtnetlink::Error) -> bool {
    let msg = e.to_string();
    msg.contains("No such device") || msg.contains("No such process")
}

fn bytes_to_ip(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let b: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(b)))
        }
        16 => {
            let b: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(b)))
        }
        _ => None,
    }
}

impl NetlinkHandle {
    pub fn new() -> NetworkResult<Self> {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        let conn_task = tokio::spawn(conn);
        Ok(Self {
            handle,
            _conn_task: conn_task,
        })
    }

    /// Create a bridge interface. Returns Ok if it already exists.
    pub async fn create_bridge(&self, name: &str) -> NetworkResult<()> {
        if self.link_exists(name).await {
            return Ok(());
        }

        match self.handle.link().add().bridge(name.to_string()).execute().await {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("File exists") => Ok(()),
            Err(e) => Err(NetworkError::Netlink(e)),
        }
    }

    pub async fn create_veth_pair(&self, host_name: &str, peer_name: &str) -> NetworkResult<()> {
        self.handle
            .link()
            .add()
            .veth(host_name.to_string(), peer_name.to_string())
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    pub async fn create_vlan(&self, parent: &str, name: &str, vlan_id: u16) -> NetworkResult<()> {
        let parent_index = self.get_link_index(parent).await?;
        self.handle
            .link()
            .add()
            .vlan(name.to_string(), parent_index, vlan_id)
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    /// Get a link's ifindex by name. Returns NotFound if the link doesn't exist.
    pub async fn get_link_index(&self, name: &str) -> NetworkResult<u32> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(msg)) => Ok(msg.header.index),
            Ok(None) => Err(NetworkError::NotFound(format!("link {}", name))),
            Err(e) if not_found(&e) => Err(NetworkError::NotFound(format!("link {}", name))),
            Err(e) => Err(NetworkError::Netlink(e)),
        }
    }

    pub async fn link_exists(&self, name: &str) -> bool {
        self.get_link_index(name).await.is_ok()
    }

    /// Delete a link by name. Returns Ok if the link doesn't exist.
    pub async fn delete_link(&self, name: &str) -> NetworkResult<()> {
        let index = match self.get_link_index(name).await {
            Ok(idx) => idx,
            Err(NetworkError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        match self.handle.link().del(index).execute().await {
            Ok(()) => Ok(()),
            Err(e) if not_found(&e) => Ok(()),
            Err(e) => Err(NetworkError::Netlink(e)),
        }
    }

    pub async fn set_link_up(&self, name: &str) -> NetworkResult<()> {
        let index = self.get_link_index(name).await?;
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    pub async fn set_link_master(&self, name: &str, master: &str) -> NetworkResult<()> {
        let index = self.get_link_index(name).await?;
        let master_index = self.get_link_index(master).await?;
        self.handle
            .link()
            .set(index)
            .master(master_index)
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    pub async fn set_link_nomaster(&self, name: &str) -> NetworkResult<()> {
        let index = self.get_link_index(name).await?;
        self.handle
            .link()
            .set(index)
            .nomaster()
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    pub async fn set_link_mtu(&self, name: &str, mtu: u32) -> NetworkResult<()> {
        let index = self.get_link_index(name).await?;
        self.handle
            .link()
            .set(index)
            .mtu(mtu)
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    pub async fn set_link_address(&self, name: &str, mac: [u8; 6]) -> NetworkResult<()> {
        let index = self.get_link_index(name).await?;
        self.handle
            .link()
            .set(index)
            .address(mac.to_vec())
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    pub async fn get_link_mtu(&self, name: &str) -> NetworkResult<u32> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        let msg = match links.try_next().await {
            Ok(Some(msg)) => msg,
            Ok(None) => return Err(NetworkError::NotFound(format!("link {}", name))),
            Err(e) if not_found(&e) => return Err(NetworkError::NotFound(format!("link {}", name))),
            Err(e) => return Err(NetworkError::Netlink(e)),
        };

        msg.nlas
            .iter()
            .find_map(|nla| match nla {
                LinkNla::Mtu(mtu) => Some(*mtu),
                _ => None,
            })
            .ok_or_else(|| NetworkError::NotFound(format!("mtu of link {}", name)))
    }

    /// Map of ifindex to link name for every link on the host.
    pub async fn link_names(&self) -> NetworkResult<HashMap<u32, String>> {
        let mut links = self.handle.link().get().execute();
        let mut names = HashMap::new();

        while let Some(msg) = links.try_next().await.map_err(NetworkError::Netlink)? {
            for nla in &msg.nlas {
                if let LinkNla::IfName(name) = nla {
                    names.insert(msg.header.index, name.clone());
                }
            }
        }

        Ok(names)
    }

    /// Addresses on every link, or on one link when `name` is given.
    pub async fn list_addresses(&self, name: Option<&str>) -> NetworkResult<Vec<InterfaceAddress>> {
        let names = self.link_names().await?;
        let mut request = self.handle.address().get();
        if let Some(name) = name {
            request = request.set_link_index_filter(self.get_link_index(name).await?);
        }

        let mut stream = request.execute();
        let mut out = Vec::new();
        while let Some(msg) = stream.try_next().await.map_err(NetworkError::Netlink)? {
            let interface = names.get(&msg.header.index).cloned().unwrap_or_default();
            let address = msg.nlas.iter().find_map(|nla| match nla {
                AddressNla::Local(bytes) => bytes_to_ip(bytes),
                _ => None,
            });
            let address = address.or_else(|| {
                msg.nlas.iter().find_map(|nla| match nla {
                    AddressNla::Address(bytes) => bytes_to_ip(bytes),
                    _ => None,
                })
            });

            if let Some(address) = address {
                out.push(InterfaceAddress {
                    interface,
                    address,
                    prefix_len: msg.header.prefix_len,
                });
            }
        }

        Ok(out)
    }

    pub async fn add_address(&self, name: &str, net: &IpNet) -> NetworkResult<()> {
        let index = self.get_link_index(name).await?;
        match self
            .handle
            .address()
            .add(index, net.addr(), net.prefix_len())
            .execute()
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("File exists") => Ok(()),
            Err(e) => Err(NetworkError::Netlink(e)),
        }
    }

    /// Remove every global scope address of one family from a link.
    pub async fn flush_global_addresses(&self, name: &str, ipv4: bool) -> NetworkResult<()> {
        let index = self.get_link_index(name).await?;
        let family = if ipv4 { libc_af_inet() } else { libc_af_inet6() };

        let mut stream = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();

        let mut doomed = Vec::new();
        while let Some(msg) = stream.try_next().await.map_err(NetworkError::Netlink)? {
            if msg.header.family == family && msg.header.scope == RT_SCOPE_UNIVERSE {
                doomed.push(msg);
            }
        }

        for msg in doomed {
            match self.handle.address().del(msg).execute().await {
                Ok(()) => {}
                Err(e) if e.to_string().contains("Cannot assign requested address") => {}
                Err(e) => return Err(NetworkError::Netlink(e)),
            }
        }
        Ok(())
    }
}

fn libc_af_inet() -> u8 {
    nix::sys::socket::AddressFamily::Inet as i32 as u8
}

fn libc_af_inet6() -> u8 {
    nix::sys::socket::AddressFamily::Inet6 as i32 as u8
}
