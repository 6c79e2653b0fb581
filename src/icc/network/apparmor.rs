use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{ErrorContext, NetworkResult};
use crate::utils::CommandExecutor;

pub fn dnsmasq_profile_name(network: &str) -> String {
    format!("quilt_dnsmasq-{}", network)
}

pub fn forkdns_profile_name(network: &str) -> String {
    format!("quilt_forkdns-{}", network)
}

fn dnsmasq_profile(network: &str, state_dir: &Path, log_dir: &Path) -> String {
    format!(
        r#"#include <tunables/global>
profile "{name}" flags=(attach_disconnected,mediate_deleted) {{
  #include <abstractions/base>
  #include <abstractions/dbus>
  #include <abstractions/nameservice>

  capability chown,
  capability net_bind_service,
  capability setgid,
  capability setuid,
  capability dac_override,
  capability dac_read_search,
  capability net_admin,
  capability net_raw,

  network inet raw,
  network inet6 raw,

  /{{,usr/}}sbin/dnsmasq mr,
  @{{PROC}}/@{{pid}}/fd/ r,
  @{{PROC}}/@{{pid}}/fd/** r,
  @{{PROC}}/sys/net/ipv6/conf/*/mtu r,

  "{state}/dnsmasq.hosts/" r,
  "{state}/dnsmasq.hosts/*" r,
  "{state}/dnsmasq.leases" rw,
  "{state}/dnsmasq.raw" r,
  "{log}/dnsmasq.{network}.log" w,
}}
"#,
        name = dnsmasq_profile_name(network),
        state = state_dir.display(),
        log = log_dir.display(),
        network = network,
    )
}

fn forkdns_profile(network: &str, state_dir: &Path, exec_path: &Path) -> String {
    format!(
        r#"#include <tunables/global>
profile "{name}" flags=(attach_disconnected,mediate_deleted) {{
  #include <abstractions/base>

  network inet dgram,
  network inet6 dgram,

  @{{PROC}}/sys/kernel/random/boot_id r,
  "{state}/forkdns.servers/servers.conf" r,
  "{state}/forkdns.servers/" r,
  "{exec}" mr,
}}
"#,
        name = forkdns_profile_name(network),
        state = state_dir.display(),
        exec = exec_path.display(),
    )
}

/// Per-network AppArmor profiles for dnsmasq and forkdns.
#[derive(Debug, Clone)]
pub struct AppArmor {
    enabled: bool,
    profiles_dir: PathBuf,
}

impl AppArmor {
    pub fn new(enabled: bool, profiles_dir: impl Into<PathBuf>) -> Self {
        Self {
            enabled,
            profiles_dir: profiles_dir.into(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    fn profile_path(&self, name: &str) -> PathBuf {
        self.profiles_dir.join(name)
    }

    /// Write both profiles to disk. Returns their paths.
    pub async fn write_profiles(
        &self,
        network: &str,
        state_dir: &Path,
        log_dir: &Path,
        exec_path: &Path,
    ) -> NetworkResult<Vec<PathBuf>> {
        tokio::fs::create_dir_all(&self.profiles_dir)
            .await
            .with_context(|| format!("Failed creating {}", self.profiles_dir.display()))?;

        let dnsmasq = self.profile_path(&dnsmasq_profile_name(network));
        tokio::fs::write(&dnsmasq, dnsmasq_profile(network, state_dir, log_dir)).await?;

        let forkdns = self.profile_path(&forkdns_profile_name(network));
        tokio::fs::write(&forkdns, forkdns_profile(network, state_dir, exec_path)).await?;

        Ok(vec![dnsmasq, forkdns])
    }

    /// Generate and (re)load the network's profiles.
    pub async fn network_load(
        &self,
        network: &str,
        state_dir: &Path,
        log_dir: &Path,
        exec_path: &Path,
    ) -> NetworkResult<()> {
        if !self.enabled {
            return Ok(());
        }

        for path in self.write_profiles(network, state_dir, log_dir, exec_path).await? {
            let path = path.to_string_lossy().to_string();
            CommandExecutor::run("apparmor_parser", &["-rW", &path]).await?;
        }
        debug!(network = %network, "Loaded AppArmor profiles");
        Ok(())
    }

    pub async fn network_unload(&self, network: &str) -> NetworkResult<()> {
        if !self.enabled {
            return Ok(());
        }

        for name in [dnsmasq_profile_name(network), forkdns_profile_name(network)] {
            let path = self.profile_path(&name);
            if !path.exists() {
                continue;
            }
            let path = path.to_string_lossy().to_string();
            let result = CommandExecutor::execute("apparmor_parser", &["-R", &path]).await?;
            if !result.success && !result.stderr.contains("does not exist") {
                debug!(profile = %name, stderr = %result.stderr.trim(), "Failed unloading profile");
            }
        }
        Ok(())
    }

    /// Unload and remove the profile files.
    pub async fn network_delete(&self, network: &str) -> NetworkResult<()> {
        self.network_unload(network).await?;
        for name in [dnsmasq_profile_name(network), forkdns_profile_name(network)] {
            match tokio::fs::remove_file(self.profile_path(&name)).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        Ok(())
    }
}
