use std::collections::BTreeMap;

use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::sync::error::{SyncError, SyncResult};

#[derive(Debug, Clone, Serialize)]
pub struct ZoneRecord {
    pub id: i64,
    pub project: String,
    pub name: String,
    pub description: String,
    pub config: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DnsRecord {
    pub name: String,
    pub record_type: String,
    pub value: String,
    pub ttl: i64,
}

/// Zones served over AXFR and their records.
pub struct ZoneStore {
    read_pool: SqlitePool,
    write_pool: SqlitePool,
}

impl ZoneStore {
    pub fn new(read_pool: SqlitePool, write_pool: SqlitePool) -> Self {
        Self {
            read_pool,
            write_pool,
        }
    }

    pub async fn create_zone(
        &self,
        project: &str,
        name: &str,
        description: &str,
        config: &BTreeMap<String, String>,
    ) -> SyncResult<i64> {
        let mut tx = self.write_pool.begin().await?;

        let result = sqlx::query(
            "INSERT INTO network_zones (project, name, description, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(project)
        .bind(name)
        .bind(description)
        .bind(chrono::Utc::now().timestamp())
        .execute(&mut *tx)
        .await
        .map_err(|e| SyncError::from_insert(e, "Network zone", name))?;
        let id = result.last_insert_rowid();

        for (key, value) in config {
            sqlx::query("INSERT INTO network_zone_config (zone_id, key, value) VALUES (?, ?, ?)")
                .bind(id)
                .bind(key)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(id)
    }

    pub async fn get_zone(&self, name: &str) -> SyncResult<ZoneRecord> {
        let row = sqlx::query("SELECT * FROM network_zones WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.read_pool)
            .await?
            .ok_or_else(|| SyncError::not_found("Network zone", name))?;

        let id: i64 = row.get("id");
        let config_rows = sqlx::query("SELECT key, value FROM network_zone_config WHERE zone_id = ?")
            .bind(id)
            .fetch_all(&self.read_pool)
            .await?;

        Ok(ZoneRecord {
            id,
            project: row.get("project"),
            name: row.get("name"),
            description: row.get("description"),
            config: config_rows
                .into_iter()
                .map(|r| (r.get::<String, _>("key"), r.get::<String, _>("value")))
                .collect(),
        })
    }

    pub async fn delete_zone(&self, name: &str) -> SyncResult<()> {
        sqlx::query("DELETE FROM network_zones WHERE name = ?")
            .bind(name)
            .execute(&self.write_pool)
            .await?;
        Ok(())
    }

    pub async fn add_record(&self, zone_id: i64, record: &DnsRecord) -> SyncResult<()> {
        sqlx::query("INSERT INTO dns_records (zone_id, name, type, value, ttl) VALUES (?, ?, ?, ?, ?)")
            .bind(zone_id)
            .bind(&record.name)
            .bind(&record.record_type)
            .bind(&record.value)
            .bind(record.ttl)
            .execute(&self.write_pool)
            .await?;
        Ok(())
    }

    pub async fn list_records(&self, zone_id: i64) -> SyncResult<Vec<DnsRecord>> {
        let rows = sqlx::query("SELECT name, type, value, ttl FROM dns_records WHERE zone_id = ? ORDER BY id")
            .bind(zone_id)
            .fetch_all(&self.read_pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| DnsRecord {
                name: row.get("name"),
                record_type: row.get("type"),
                value: row.get("value"),
                ttl: row.get("ttl"),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::connection::ConnectionManager;
    use crate::sync::schema::SchemaManager;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_zone_with_records() {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap();

        let conn_manager = ConnectionManager::new(db_path).await.unwrap();
        SchemaManager::new(conn_manager.pool().clone())
            .initialize_schema()
            .await
            .unwrap();
        let store = ZoneStore::new(conn_manager.pool().clone(), conn_manager.pool().clone());

        let mut config = BTreeMap::new();
        config.insert("peers.a.address".to_string(), "10.0.0.5".to_string());
        let id = store.create_zone("default", "example.com", "", &config).await.unwrap();

        store
            .add_record(
                id,
                &DnsRecord {
                    name: "www".to_string(),
                    record_type: "A".to_string(),
                    value: "192.0.2.1".to_string(),
                    ttl: 300,
                },
            )
            .await
            .unwrap();

        let zone = store.get_zone("example.com").await.unwrap();
        assert_eq!(zone.config.get("peers.a.address").map(String::as_str), Some("10.0.0.5"));
        assert_eq!(store.list_records(id).await.unwrap().len(), 1);

        assert!(matches!(
            store.create_zone("default", "example.com", "", &BTreeMap::new()).await,
            Err(SyncError::AlreadyExists { .. })
        ));

        store.delete_zone("example.com").await.unwrap();
        assert!(matches!(store.get_zone("example.com").await, Err(SyncError::NotFound { .. })));
    }
}
