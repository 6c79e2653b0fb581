// Authoritative zone transfers and the cluster DNS forwarder

pub mod forkdns;
pub mod handler;
pub mod server;
pub mod zone;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::NetworkResult;

pub use handler::{AxfrHandler, TsigStatus};
pub use server::DnsServer;
pub use zone::{parse_zone, StoreZoneRetriever};

/// Name and config of a served zone. Access rules live in `peers.<name>.{address,key}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZoneInfo {
    pub name: String,
    pub config: BTreeMap<String, String>,
}

/// A zone ready to be transferred: its info and its master file text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zone {
    pub info: ZoneInfo,
    pub content: String,
}

/// Looks zones up by name (without the trailing dot).
#[async_trait]
pub trait ZoneRetriever: Send + Sync {
    async fn zone(&self, name: &str) -> NetworkResult<Zone>;
}

/// A peer allowed to transfer a zone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZonePeer {
    pub name: String,
    pub address: String,
    /// Base64 TSIG secret, empty when no key is required
    pub key: String,
}

impl ZoneInfo {
    /// Peers declared in the zone config, in name order.
    pub fn peers(&self) -> Vec<ZonePeer> {
        let mut peers: BTreeMap<String, ZonePeer> = BTreeMap::new();
        for (key, value) in &self.config {
            let Some(rest) = key.strip_prefix("peers.") else {
                continue;
            };
            let Some((peer, field)) = rest.split_once('.') else {
                continue;
            };

            let entry = peers.entry(peer.to_string()).or_insert_with(|| ZonePeer {
                name: peer.to_string(),
                ..Default::default()
            });
            match field {
                "address" => entry.address = value.clone(),
                "key" => entry.key = value.clone(),
                _ => {}
            }
        }
        peers.into_values().collect()
    }

    /// TSIG key name a peer signs with.
    pub fn peer_key_name(&self, peer: &str) -> String {
        format!("{}_{}.", self.name, peer)
    }
}
