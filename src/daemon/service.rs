// Long running network daemon: brings up stored networks, serves zone
// transfers and feeds cluster heartbeats to the bridge engine.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, error, info, warn};

use super::events::NetworkEventBus;
use crate::error::{ErrorContext, NetworkError, NetworkResult};
use crate::icc::dns::{DnsServer, StoreZoneRetriever};
use crate::icc::network::apparmor::AppArmor;
use crate::icc::network::bgp::BgpTable;
use crate::icc::network::firewall::NftablesFirewall;
use crate::icc::network::host::SystemHost;
use crate::icc::network::locks::LockRegistry;
use crate::icc::network::supervisor::SystemProcessRunner;
use crate::icc::network::{Heartbeat, NetworkManager, NetworkState, OsSettings, StandaloneCluster};
use crate::sync::{ConnectionManager, NetworkStore, SchemaManager, ZoneStore};
use crate::utils::{Sysctl, Timer};

const HEARTBEAT_POLL: Duration = Duration::from_secs(5);

/// Everything the daemon needs before it can build its network state.
#[derive(Debug, Clone)]
pub struct DaemonSettings {
    pub var_dir: PathBuf,
    pub log_dir: PathBuf,
    pub db_path: PathBuf,
    pub dns_listen: SocketAddr,
    pub unpriv_user: Option<String>,
    pub unpriv_group: Option<String>,
    pub server_fingerprint: String,
    pub cluster_address: Option<String>,
    pub member_name: String,
    pub member_id: i64,
    pub apparmor: bool,
    /// JSON heartbeat snapshot, rewritten by the cluster agent
    pub heartbeat_file: Option<PathBuf>,
    pub mock_mode: bool,
}

impl DaemonSettings {
    pub fn new(var_dir: impl Into<PathBuf>, log_dir: impl Into<PathBuf>) -> Self {
        let var_dir = var_dir.into();
        Self {
            db_path: var_dir.join("networks.db"),
            var_dir,
            log_dir: log_dir.into(),
            dns_listen: SocketAddr::from(([0, 0, 0, 0], 8853)),
            unpriv_user: None,
            unpriv_group: None,
            server_fingerprint: String::new(),
            cluster_address: None,
            member_name: "none".to_string(),
            member_id: 1,
            apparmor: false,
            heartbeat_file: None,
            mock_mode: false,
        }
    }

    /// Host settings, with the unprivileged user and group resolved to ids.
    pub fn os_settings(&self) -> NetworkResult<OsSettings> {
        let mut os = OsSettings::new(&self.var_dir, &self.log_dir);
        os.server_fingerprint = self.server_fingerprint.clone();
        os.mock_mode = self.mock_mode;

        if let Some(user) = self.unpriv_user.as_deref().filter(|u| !u.is_empty()) {
            let found = nix::unistd::User::from_name(user)
                .map_err(|e| NetworkError::environment(format!("Failed looking up user {:?}: {}", user, e)))?
                .ok_or_else(|| NetworkError::environment(format!("Unknown user {:?}", user)))?;
            os.unpriv_user = Some(user.to_string());
            os.unpriv_uid = Some(found.uid.as_raw());
        }

        if let Some(group) = self.unpriv_group.as_deref().filter(|g| !g.is_empty()) {
            let found = nix::unistd::Group::from_name(group)
                .map_err(|e| NetworkError::environment(format!("Failed looking up group {:?}: {}", group, e)))?
                .ok_or_else(|| NetworkError::environment(format!("Unknown group {:?}", group)))?;
            os.unpriv_group = Some(group.to_string());
            os.unpriv_gid = Some(found.gid.as_raw());
        }

        Ok(os)
    }
}

/// Opened database plus the stores built on it.
pub struct Stores {
    pub connection: ConnectionManager,
    pub networks: Arc<NetworkStore>,
    pub zones: Arc<ZoneStore>,
}

pub async fn open_stores(db_path: &Path) -> NetworkResult<Stores> {
    if let Some(dir) = db_path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed creating {}", dir.display()))?;
    }

    let connection = ConnectionManager::new(&db_path.to_string_lossy())
        .await
        .with_context(|| format!("Failed opening database {}", db_path.display()))?;
    SchemaManager::new(connection.pool().clone())
        .initialize_schema()
        .await
        .context("Failed initializing database schema")?;

    let pool = connection.pool().clone();
    Ok(Stores {
        networks: Arc::new(NetworkStore::new(pool.clone())),
        zones: Arc::new(ZoneStore::new(pool.clone(), pool)),
        connection,
    })
}

/// Network state wired to the real host, firewall and process runner.
pub fn system_state(settings: &DaemonSettings, store: Arc<NetworkStore>) -> NetworkResult<NetworkState> {
    let os = settings.os_settings()?;
    let apparmor_dir = os.var_dir.join("security").join("apparmor");

    Ok(NetworkState {
        os,
        host: Arc::new(SystemHost::new()?),
        runner: Arc::new(SystemProcessRunner),
        firewall: Arc::new(NftablesFirewall::default()),
        store,
        cluster: Arc::new(StandaloneCluster::new(
            settings.member_name.clone(),
            settings.member_id,
            settings.cluster_address.clone(),
        )),
        bgp: Arc::new(BgpTable::new()),
        locks: Arc::new(LockRegistry::new()),
        events: Arc::new(NetworkEventBus::new()),
        sysctl: Sysctl::default(),
        apparmor: Arc::new(AppArmor::new(settings.apparmor, apparmor_dir)),
    })
}

/// Picks up a heartbeat file whenever its modification time moves.
#[derive(Debug)]
pub struct HeartbeatWatcher {
    path: PathBuf,
    last_modified: Option<SystemTime>,
}

impl HeartbeatWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_modified: None,
        }
    }

    /// The new heartbeat, or None when the file is missing or unchanged.
    pub fn poll(&mut self) -> NetworkResult<Option<Heartbeat>> {
        let modified = match std::fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if self.last_modified == Some(modified) {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed reading heartbeat {}", self.path.display()))?;
        let heartbeat: Heartbeat = serde_json::from_str(&content)
            .map_err(|e| NetworkError::validation(format!("Invalid heartbeat {}: {}", self.path.display(), e)))?;

        self.last_modified = Some(modified);
        Ok(Some(heartbeat))
    }
}

pub struct Daemon {
    settings: DaemonSettings,
    manager: Arc<NetworkManager>,
    zones: Arc<ZoneStore>,
}

impl Daemon {
    pub fn new(settings: DaemonSettings, manager: Arc<NetworkManager>, zones: Arc<ZoneStore>) -> Self {
        Self {
            settings,
            manager,
            zones,
        }
    }

    pub fn manager(&self) -> &Arc<NetworkManager> {
        &self.manager
    }

    /// Runs until `shutdown` resolves, then stops every network.
    pub async fn run<F>(self, shutdown: F) -> NetworkResult<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let timer = Timer::new("networks_start");
        self.manager.start_all().await?;
        timer.log_completion();

        let retriever = Arc::new(StoreZoneRetriever::new(self.zones.clone()));
        let server = Arc::new(DnsServer::new(Some(retriever)))
            .start(self.settings.dns_listen)
            .await
            .context("Failed starting DNS server")?;
        info!(udp = %server.udp_addr, tcp = %server.tcp_addr, "Zone transfer server listening");

        let heartbeats = self.settings.heartbeat_file.clone().map(|path| {
            let manager = self.manager.clone();
            tokio::spawn(watch_heartbeats(manager, HeartbeatWatcher::new(path), HEARTBEAT_POLL))
        });

        shutdown.await;
        info!("Shutting down");

        if let Some(task) = heartbeats {
            task.abort();
        }
        server.stop();

        if let Err(e) = self.manager.stop_all().await {
            error!(err = %e, "Failed stopping networks");
        }
        Ok(())
    }
}

async fn watch_heartbeats(manager: Arc<NetworkManager>, mut watcher: HeartbeatWatcher, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        match watcher.poll() {
            Ok(Some(heartbeat)) => {
                debug!(members = heartbeat.members.len(), "Processing heartbeat");
                if let Err(e) = manager.handle_heartbeat(&heartbeat).await {
                    warn!(err = %e, "Failed handling heartbeat");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(err = %e, "Failed reading heartbeat"),
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!(err = %e, "Failed installing SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
