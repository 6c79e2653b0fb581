use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use crate::sync::error::{SyncError, SyncResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkStatus {
    /// Record exists but the network has never been set up on this host
    Pending,
    Created,
    Errored,
}

impl NetworkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkStatus::Pending => "pending",
            NetworkStatus::Created => "created",
            NetworkStatus::Errored => "errored",
        }
    }

    pub fn from_string(s: &str) -> SyncResult<Self> {
        match s {
            "pending" => Ok(NetworkStatus::Pending),
            "created" => Ok(NetworkStatus::Created),
            "errored" => Ok(NetworkStatus::Errored),
            _ => Err(SyncError::ValidationFailed {
                message: format!("Invalid network status: {}", s),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkRecord {
    pub id: i64,
    pub project: String,
    pub name: String,
    pub description: String,
    pub network_type: String,
    pub status: NetworkStatus,
    pub config: BTreeMap<String, String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One protocol/port mapping of an address forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardPort {
    #[serde(default)]
    pub description: String,
    pub protocol: String,
    pub listen_port: String,
    #[serde(default)]
    pub target_port: String,
    pub target_address: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkForwardRecord {
    pub id: i64,
    pub network_id: i64,
    pub listen_address: String,
    pub description: String,
    pub config: BTreeMap<String, String>,
    pub ports: Vec<ForwardPort>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WarningStatus {
    New,
    Resolved,
}

#[derive(Debug, Clone, Serialize)]
pub struct WarningRecord {
    pub project: String,
    pub entity: String,
    pub type_code: String,
    pub message: String,
    pub status: WarningStatus,
    pub count: i64,
    pub first_seen_at: i64,
    pub last_seen_at: i64,
}

/// A device attached to an instance. NIC devices reference networks through `config["network"]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceDevice {
    pub project: String,
    pub instance: String,
    pub device: String,
    pub device_type: String,
    pub config: BTreeMap<String, String>,
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

pub struct NetworkStore {
    pool: SqlitePool,
}

impl NetworkStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn create_network(
        &self,
        project: &str,
        name: &str,
        description: &str,
        network_type: &str,
        config: &BTreeMap<String, String>,
    ) -> SyncResult<i64> {
        let ts = now();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "INSERT INTO networks (project, name, description, type, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, 'pending', ?, ?)",
        )
        .bind(project)
        .bind(name)
        .bind(description)
        .bind(network_type)
        .bind(ts)
        .bind(ts)
        .execute(&mut *tx)
        .await
        .map_err(|e| SyncError::from_insert(e, "Network", name))?;

        let id = result.last_insert_rowid();
        Self::insert_config(&mut tx, id, config).await?;
        tx.commit().await?;

        tracing::debug!(network = %name, project = %project, id, "Created network record");
        Ok(id)
    }

    async fn insert_config(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        network_id: i64,
        config: &BTreeMap<String, String>,
    ) -> SyncResult<()> {
        for (key, value) in config {
            if value.is_empty() {
                continue;
            }
            sqlx::query("INSERT INTO network_config (network_id, key, value) VALUES (?, ?, ?)")
                .bind(network_id)
                .bind(key)
                .bind(value)
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }

    async fn load_config(&self, network_id: i64) -> SyncResult<BTreeMap<String, String>> {
        let rows = sqlx::query("SELECT key, value FROM network_config WHERE network_id = ?")
            .bind(network_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get::<String, _>("key"), row.get::<String, _>("value")))
            .collect())
    }

    async fn record_from_row(&self, row: sqlx::sqlite::SqliteRow) -> SyncResult<NetworkRecord> {
        let id: i64 = row.get("id");
        let status: String = row.get("status");
        Ok(NetworkRecord {
            id,
            project: row.get("project"),
            name: row.get("name"),
            description: row.get("description"),
            network_type: row.get("type"),
            status: NetworkStatus::from_string(&status)?,
            config: self.load_config(id).await?,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    pub async fn get_network(&self, project: &str, name: &str) -> SyncResult<NetworkRecord> {
        let row = sqlx::query("SELECT * FROM networks WHERE project = ? AND name = ?")
            .bind(project)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| SyncError::not_found("Network", name))?;

        self.record_from_row(row).await
    }

    /// All networks, optionally limited to one project, ordered by id.
    pub async fn list_networks(&self, project: Option<&str>) -> SyncResult<Vec<NetworkRecord>> {
        let rows = match project {
            Some(project) => {
                sqlx::query("SELECT * FROM networks WHERE project = ? ORDER BY id")
                    .bind(project)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM networks ORDER BY id")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut networks = Vec::with_capacity(rows.len());
        for row in rows {
            networks.push(self.record_from_row(row).await?);
        }
        Ok(networks)
    }

    /// Replace description and the whole config map in one transaction.
    pub async fn update_network(
        &self,
        project: &str,
        name: &str,
        description: &str,
        config: &BTreeMap<String, String>,
    ) -> SyncResult<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT id FROM networks WHERE project = ? AND name = ?")
            .bind(project)
            .bind(name)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| SyncError::not_found("Network", name))?;
        let id: i64 = row.get("id");

        sqlx::query("UPDATE networks SET description = ?, updated_at = ? WHERE id = ?")
            .bind(description)
            .bind(now())
            .bind(id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM network_config WHERE network_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        Self::insert_config(&mut tx, id, config).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn set_network_status(&self, id: i64, status: NetworkStatus) -> SyncResult<()> {
        sqlx::query("UPDATE networks SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn rename_network(&self, project: &str, name: &str, new_name: &str) -> SyncResult<()> {
        let result = sqlx::query(
            "UPDATE networks SET name = ?, updated_at = ? WHERE project = ? AND name = ?",
        )
        .bind(new_name)
        .bind(now())
        .bind(project)
        .bind(name)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::from_insert(e, "Network", new_name))?;

        if result.rows_affected() == 0 {
            return Err(SyncError::not_found("Network", name));
        }
        Ok(())
    }

    pub async fn delete_network(&self, project: &str, name: &str) -> SyncResult<()> {
        let result = sqlx::query("DELETE FROM networks WHERE project = ? AND name = ?")
            .bind(project)
            .bind(name)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(SyncError::not_found("Network", name));
        }
        Ok(())
    }

    pub async fn create_forward(
        &self,
        network_id: i64,
        listen_address: &str,
        description: &str,
        config: &BTreeMap<String, String>,
        ports: &[ForwardPort],
    ) -> SyncResult<i64> {
        let result = sqlx::query(
            "INSERT INTO network_forwards (network_id, listen_address, description, config, ports)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(network_id)
        .bind(listen_address)
        .bind(description)
        .bind(serde_json::to_string(config)?)
        .bind(serde_json::to_string(ports)?)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::from_insert(e, "Network forward", listen_address))?;

        Ok(result.last_insert_rowid())
    }

    fn forward_from_row(row: &sqlx::sqlite::SqliteRow) -> SyncResult<NetworkForwardRecord> {
        let config: String = row.get("config");
        let ports: String = row.get("ports");
        Ok(NetworkForwardRecord {
            id: row.get("id"),
            network_id: row.get("network_id"),
            listen_address: row.get("listen_address"),
            description: row.get("description"),
            config: serde_json::from_str(&config)?,
            ports: serde_json::from_str(&ports)?,
        })
    }

    pub async fn get_forward(
        &self,
        network_id: i64,
        listen_address: &str,
    ) -> SyncResult<NetworkForwardRecord> {
        let row = sqlx::query(
            "SELECT * FROM network_forwards WHERE network_id = ? AND listen_address = ?",
        )
        .bind(network_id)
        .bind(listen_address)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| SyncError::not_found("Network forward", listen_address))?;

        Self::forward_from_row(&row)
    }

    pub async fn list_forwards(&self, network_id: i64) -> SyncResult<Vec<NetworkForwardRecord>> {
        let rows = sqlx::query("SELECT * FROM network_forwards WHERE network_id = ? ORDER BY id")
            .bind(network_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::forward_from_row).collect()
    }

    /// Listen addresses of every forward on every network, as (project, network, address).
    pub async fn list_all_forward_listen_addresses(
        &self,
    ) -> SyncResult<Vec<(String, String, String)>> {
        let rows = sqlx::query(
            "SELECT n.project AS project, n.name AS name, f.listen_address AS listen_address
             FROM network_forwards f JOIN networks n ON n.id = f.network_id
             ORDER BY f.id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get("project"), row.get("name"), row.get("listen_address")))
            .collect())
    }

    pub async fn update_forward(
        &self,
        id: i64,
        description: &str,
        config: &BTreeMap<String, String>,
        ports: &[ForwardPort],
    ) -> SyncResult<()> {
        sqlx::query("UPDATE network_forwards SET description = ?, config = ?, ports = ? WHERE id = ?")
            .bind(description)
            .bind(serde_json::to_string(config)?)
            .bind(serde_json::to_string(ports)?)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_forward(&self, id: i64) -> SyncResult<()> {
        sqlx::query("DELETE FROM network_forwards WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn create_acl(&self, project: &str, name: &str, description: &str) -> SyncResult<()> {
        sqlx::query("INSERT INTO network_acls (project, name, description) VALUES (?, ?, ?)")
            .bind(project)
            .bind(name)
            .bind(description)
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::from_insert(e, "Network ACL", name))?;
        Ok(())
    }

    pub async fn list_acl_names(&self, project: &str) -> SyncResult<Vec<String>> {
        let rows = sqlx::query("SELECT name FROM network_acls WHERE project = ? ORDER BY name")
            .bind(project)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|row| row.get("name")).collect())
    }

    /// Insert or bump a warning. A resolved warning of the same type is reopened.
    pub async fn upsert_warning(
        &self,
        project: &str,
        entity: &str,
        type_code: &str,
        message: &str,
    ) -> SyncResult<()> {
        let ts = now();
        sqlx::query(
            "INSERT INTO warnings (project, entity, type_code, message, status, count, first_seen_at, last_seen_at)
             VALUES (?, ?, ?, ?, 'new', 1, ?, ?)
             ON CONFLICT(project, entity, type_code) DO UPDATE SET
                message = excluded.message,
                status = 'new',
                count = warnings.count + 1,
                last_seen_at = excluded.last_seen_at",
        )
        .bind(project)
        .bind(entity)
        .bind(type_code)
        .bind(message)
        .bind(ts)
        .bind(ts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn resolve_warning(&self, project: &str, entity: &str, type_code: &str) -> SyncResult<()> {
        sqlx::query(
            "UPDATE warnings SET status = 'resolved', last_seen_at = ?
             WHERE project = ? AND entity = ? AND type_code = ?",
        )
        .bind(now())
        .bind(project)
        .bind(entity)
        .bind(type_code)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_warnings(&self, project: &str, entity: &str) -> SyncResult<()> {
        sqlx::query("DELETE FROM warnings WHERE project = ? AND entity = ?")
            .bind(project)
            .bind(entity)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_warnings(&self, project: &str, entity: &str) -> SyncResult<Vec<WarningRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM warnings WHERE project = ? AND entity = ? ORDER BY id",
        )
        .bind(project)
        .bind(entity)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let status: String = row.get("status");
                WarningRecord {
                    project: row.get("project"),
                    entity: row.get("entity"),
                    type_code: row.get("type_code"),
                    message: row.get("message"),
                    status: if status == "resolved" {
                        WarningStatus::Resolved
                    } else {
                        WarningStatus::New
                    },
                    count: row.get("count"),
                    first_seen_at: row.get("first_seen_at"),
                    last_seen_at: row.get("last_seen_at"),
                }
            })
            .collect())
    }

    pub async fn upsert_instance_device(&self, device: &InstanceDevice) -> SyncResult<()> {
        sqlx::query(
            "INSERT INTO instance_devices (project, instance, device, type, config)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(project, instance, device) DO UPDATE SET
                type = excluded.type, config = excluded.config",
        )
        .bind(&device.project)
        .bind(&device.instance)
        .bind(&device.device)
        .bind(&device.device_type)
        .bind(serde_json::to_string(&device.config)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_instance_device(&self, project: &str, instance: &str, device: &str) -> SyncResult<()> {
        sqlx::query("DELETE FROM instance_devices WHERE project = ? AND instance = ? AND device = ?")
            .bind(project)
            .bind(instance)
            .bind(device)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// NIC devices of every instance, across all projects.
    pub async fn list_nic_devices(&self) -> SyncResult<Vec<InstanceDevice>> {
        let rows = sqlx::query(
            "SELECT * FROM instance_devices WHERE type = 'nic' ORDER BY project, instance, device",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let config: String = row.get("config");
                Ok(InstanceDevice {
                    project: row.get("project"),
                    instance: row.get("instance"),
                    device: row.get("device"),
                    device_type: row.get("type"),
                    config: serde_json::from_str(&config)?,
                })
            })
            .collect()
    }
}
