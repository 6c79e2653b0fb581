use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{ErrorContext, NetworkResult};

pub const SERVERS_DIR: &str = "forkdns.servers";
pub const SERVERS_FILE: &str = "servers.conf";
pub const FORKDNS_PORT: u16 = 1053;

pub fn servers_path(state_dir: &Path) -> PathBuf {
    state_dir.join(SERVERS_DIR).join(SERVERS_FILE)
}

/// Peer addresses currently published, one per line.
pub fn read_servers(path: &Path) -> NetworkResult<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed reading {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

/// Create the servers directory and an empty list if none exists yet.
pub fn ensure_servers_file(path: &Path) -> NetworkResult<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed creating {}", dir.display()))?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed creating {}", path.display()))?;
    Ok(())
}

/// Replace the peer list with `addresses`. Readers see either the old or the new file.
///
/// Callers hold the process-wide forkdns servers lock.
pub fn write_servers(path: &Path, addresses: &[String]) -> NetworkResult<()> {
    write_servers_with(path, addresses, || Ok(()))
}

fn write_servers_with<F>(path: &Path, addresses: &[String], before_rename: F) -> NetworkResult<()>
where
    F: FnOnce() -> NetworkResult<()>,
{
    let tmp = path.with_extension("conf.tmp");
    let guard = scopeguard::guard(tmp.clone(), |tmp| {
        let _ = std::fs::remove_file(tmp);
    });

    {
        let mut file = std::fs::File::create(&tmp)
            .with_context(|| format!("Failed creating {}", tmp.display()))?;
        for address in addresses {
            writeln!(file, "{}", address)?;
        }
        file.sync_all()?;
    }

    before_rename()?;
    std::fs::rename(&tmp, path).with_context(|| format!("Failed publishing {}", path.display()))?;

    // Renamed away, nothing left to clean up
    scopeguard::ScopeGuard::into_inner(guard);
    Ok(())
}

/// Arguments of the forkdns helper: listen address, domain and servers file.
pub fn forkdns_args(listen_address: &str, domain: &str, servers: &Path) -> Vec<String> {
    vec![
        "forkdns".to_string(),
        format!("{}:{}", listen_address, FORKDNS_PORT),
        domain.to_string(),
        servers.display().to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetworkError;
    use tempfile::tempdir;

    #[test]
    fn test_write_and_read() {
        let dir = tempdir().unwrap();
        let path = servers_path(dir.path());
        ensure_servers_file(&path).unwrap();
        assert!(read_servers(&path).unwrap().is_empty());

        let peers = vec!["10.0.0.2".to_string(), "10.0.0.1".to_string()];
        write_servers(&path, &peers).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "10.0.0.2\n10.0.0.1\n");
        assert_eq!(read_servers(&path).unwrap(), peers);
        assert!(!path.with_extension("conf.tmp").exists());
    }

    #[test]
    fn test_fault_before_rename_keeps_original() {
        let dir = tempdir().unwrap();
        let path = servers_path(dir.path());
        ensure_servers_file(&path).unwrap();
        write_servers(&path, &["10.0.0.1".to_string()]).unwrap();

        let err = write_servers_with(&path, &["10.0.0.9".to_string()], || {
            Err(NetworkError::environment("injected"))
        })
        .unwrap_err();
        assert!(err.to_string().contains("injected"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "10.0.0.1\n");
        assert!(!path.with_extension("conf.tmp").exists());
    }

    #[test]
    fn test_forkdns_args() {
        let args = forkdns_args("240.1.2.1", "lxd", Path::new("/s/forkdns.servers/servers.conf"));
        assert_eq!(args, vec!["forkdns", "240.1.2.1:1053", "lxd", "/s/forkdns.servers/servers.conf"]);
    }
}
