// Network lifecycle event bus

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use serde::Serialize;
use tokio::sync::{mpsc, RwLock};

const EVENT_LOG_LIMIT: usize = 1000;

/// Lifecycle events published by the bridge engine
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum NetworkEvent {
    NetworkCreated {
        network: String,
        timestamp: SystemTime,
    },

    NetworkStarted {
        network: String,
        duration_ms: u64,
        timestamp: SystemTime,
    },

    NetworkStopped {
        network: String,
        timestamp: SystemTime,
    },

    NetworkUpdated {
        network: String,
        changed_keys: Vec<String>,
        timestamp: SystemTime,
    },

    NetworkDeleted {
        network: String,
        timestamp: SystemTime,
    },

    /// Setup failed and was reverted
    NetworkSetupFailed {
        network: String,
        error: String,
        timestamp: SystemTime,
    },

    ForkdnsPeersUpdated {
        network: String,
        peers: Vec<String>,
        timestamp: SystemTime,
    },
}

impl NetworkEvent {
    pub fn created(network: &str) -> Self {
        NetworkEvent::NetworkCreated {
            network: network.to_string(),
            timestamp: SystemTime::now(),
        }
    }

    pub fn started(network: &str, duration_ms: u64) -> Self {
        NetworkEvent::NetworkStarted {
            network: network.to_string(),
            duration_ms,
            timestamp: SystemTime::now(),
        }
    }

    pub fn stopped(network: &str) -> Self {
        NetworkEvent::NetworkStopped {
            network: network.to_string(),
            timestamp: SystemTime::now(),
        }
    }

    pub fn updated(network: &str, changed_keys: Vec<String>) -> Self {
        NetworkEvent::NetworkUpdated {
            network: network.to_string(),
            changed_keys,
            timestamp: SystemTime::now(),
        }
    }

    pub fn deleted(network: &str) -> Self {
        NetworkEvent::NetworkDeleted {
            network: network.to_string(),
            timestamp: SystemTime::now(),
        }
    }

    pub fn setup_failed(network: &str, error: &str) -> Self {
        NetworkEvent::NetworkSetupFailed {
            network: network.to_string(),
            error: error.to_string(),
            timestamp: SystemTime::now(),
        }
    }

    pub fn peers_updated(network: &str, peers: Vec<String>) -> Self {
        NetworkEvent::ForkdnsPeersUpdated {
            network: network.to_string(),
            peers,
            timestamp: SystemTime::now(),
        }
    }

    pub fn network(&self) -> &str {
        match self {
            NetworkEvent::NetworkCreated { network, .. }
            | NetworkEvent::NetworkStarted { network, .. }
            | NetworkEvent::NetworkStopped { network, .. }
            | NetworkEvent::NetworkUpdated { network, .. }
            | NetworkEvent::NetworkDeleted { network, .. }
            | NetworkEvent::NetworkSetupFailed { network, .. }
            | NetworkEvent::ForkdnsPeersUpdated { network, .. } => network,
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            NetworkEvent::NetworkCreated { .. } => "NetworkCreated",
            NetworkEvent::NetworkStarted { .. } => "NetworkStarted",
            NetworkEvent::NetworkStopped { .. } => "NetworkStopped",
            NetworkEvent::NetworkUpdated { .. } => "NetworkUpdated",
            NetworkEvent::NetworkDeleted { .. } => "NetworkDeleted",
            NetworkEvent::NetworkSetupFailed { .. } => "NetworkSetupFailed",
            NetworkEvent::ForkdnsPeersUpdated { .. } => "ForkdnsPeersUpdated",
        }
    }
}

pub type EventReceiver = mpsc::UnboundedReceiver<NetworkEvent>;
pub type EventSender = mpsc::UnboundedSender<NetworkEvent>;

/// Fans events out to per-network subscribers and keeps a bounded history.
#[derive(Default)]
pub struct NetworkEventBus {
    /// Subscribers indexed by network name
    subscribers: Arc<RwLock<HashMap<String, Vec<EventSender>>>>,
    event_log: Arc<RwLock<Vec<NetworkEvent>>>,
}

impl NetworkEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn emit(&self, event: NetworkEvent) {
        {
            let mut log = self.event_log.write().await;
            log.push(event.clone());
            if log.len() > EVENT_LOG_LIMIT {
                log.drain(0..EVENT_LOG_LIMIT / 2);
            }
        }

        tracing::debug!(network = %event.network(), event = event.event_name(), "Network event");

        let mut subscribers = self.subscribers.write().await;
        if let Some(senders) = subscribers.get_mut(event.network()) {
            // Drop subscribers whose receiver is gone
            senders.retain(|sender| sender.send(event.clone()).is_ok());
        }
    }

    pub async fn subscribe(&self, network: &str) -> EventReceiver {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .await
            .entry(network.to_string())
            .or_default()
            .push(sender);
        receiver
    }

    /// Wait for the next event on `network` matching `predicate`.
    pub async fn wait_for_event<F>(&self, network: &str, predicate: F) -> Result<NetworkEvent, String>
    where
        F: Fn(&NetworkEvent) -> bool,
    {
        let mut receiver = self.subscribe(network).await;
        while let Some(event) = receiver.recv().await {
            if predicate(&event) {
                return Ok(event);
            }
        }
        Err(format!("Event stream closed for network {}", network))
    }

    pub async fn history(&self, network: Option<&str>) -> Vec<NetworkEvent> {
        let log = self.event_log.read().await;
        match network {
            Some(name) => log.iter().filter(|e| e.network() == name).cloned().collect(),
            None => log.clone(),
        }
    }

    pub async fn forget(&self, network: &str) {
        self.subscribers.write().await.remove(network);
    }
}
