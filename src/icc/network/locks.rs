use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type NetworkLocks = DashMap<String, Arc<Mutex<()>>>;

/// Lock objects shared by the network engine and NIC devices.
///
/// Lifecycle operations on one network are serialized by a per-network lock.
/// Writes to forkdns peer lists and creation of shared VLAN parents each use a
/// single process-wide lock.
#[derive(Default)]
pub struct LockRegistry {
    networks: Arc<NetworkLocks>,
    forkdns_servers: parking_lot::Mutex<()>,
    shared_device: Mutex<()>,
}

fn network_key(project: &str, name: &str) -> String {
    format!("{}/{}", project, name)
}

/// Exclusive access to one network. The registry entry is pruned once the
/// last holder or waiter is gone.
pub struct NetworkGuard {
    guard: Option<OwnedMutexGuard<()>>,
    key: String,
    networks: Arc<NetworkLocks>,
}

impl Drop for NetworkGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters keep their own clone, so a count of one means only the map holds it
        self.networks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to one network.
    pub async fn lock_network(&self, project: &str, name: &str) -> NetworkGuard {
        let key = network_key(project, name);
        let lock = self
            .networks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        NetworkGuard {
            guard: Some(lock.lock_owned().await),
            key,
            networks: self.networks.clone(),
        }
    }

    /// Number of networks with a held or awaited lock.
    pub fn tracked_networks(&self) -> usize {
        self.networks.len()
    }

    pub fn forkdns_servers(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.forkdns_servers.lock()
    }

    pub async fn shared_device(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.shared_device.lock().await
    }
}
