use std::path::{Path, PathBuf};

use crate::error::{ErrorContext, NetworkResult};

/// Reads and writes kernel sysctls under a procfs root.
///
/// Keys use the path form relative to `/proc/sys`, e.g. `net/ipv4/ip_forward`.
/// Tests point the root at a temporary directory.
#[derive(Debug, Clone)]
pub struct Sysctl {
    root: PathBuf,
}

impl Default for Sysctl {
    fn default() -> Self {
        Self::new("/proc/sys")
    }
}

impl Sysctl {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    pub fn exists(&self, key: &str) -> bool {
        self.path(key).exists()
    }

    /// Raw file content, trailing newline included.
    pub async fn get_raw(&self, key: &str) -> NetworkResult<String> {
        Ok(tokio::fs::read_to_string(self.path(key)).await?)
    }

    pub async fn get(&self, key: &str) -> NetworkResult<String> {
        Ok(self.get_raw(key).await?.trim().to_string())
    }

    pub async fn set(&self, key: &str, value: &str) -> NetworkResult<()> {
        tokio::fs::write(self.path(key), value)
            .await
            .with_context(|| format!("Failed setting sysctl {}={}", key.replace('/', "."), value))
    }

    /// Entries of a sysctl directory such as `net/ipv6/conf`.
    pub async fn list(&self, dir: &str) -> NetworkResult<Vec<String>> {
        let mut entries = tokio::fs::read_dir(self.path(dir)).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_set_list() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("net/ipv6/conf/eth0")).unwrap();
        std::fs::create_dir_all(dir.path().join("net/ipv6/conf/all")).unwrap();
        std::fs::write(dir.path().join("net/ipv6/conf/eth0/accept_ra"), "1\n").unwrap();

        let sysctl = Sysctl::new(dir.path());
        assert_eq!(sysctl.get_raw("net/ipv6/conf/eth0/accept_ra").await.unwrap(), "1\n");
        sysctl.set("net/ipv6/conf/eth0/accept_ra", "2").await.unwrap();
        assert_eq!(sysctl.get("net/ipv6/conf/eth0/accept_ra").await.unwrap(), "2");

        assert_eq!(sysctl.list("net/ipv6/conf").await.unwrap(), vec!["all", "eth0"]);
        assert!(sysctl.get("net/ipv4/ip_forward").await.unwrap_err().is_not_found());
    }
}
