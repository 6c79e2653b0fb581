use crate::sync::error::SyncResult;
use sqlx::SqlitePool;

pub struct SchemaManager {
    write_pool: SqlitePool,
}

impl SchemaManager {
    pub fn new(write_pool: SqlitePool) -> Self {
        Self { write_pool }
    }

    pub async fn initialize_schema(&self) -> SyncResult<()> {
        // Network records
        self.create_networks_table().await?;
        self.create_network_config_table().await?;
        self.create_network_forwards_table().await?;
        self.create_network_acls_table().await?;

        // Instance NIC devices referencing networks
        self.create_instance_devices_table().await?;

        // Persistent warnings
        self.create_warnings_table().await?;

        // DNS zones served over AXFR
        self.create_network_zones_table().await?;
        self.create_network_zone_config_table().await?;
        self.create_dns_records_table().await?;

        self.create_indexes().await?;

        tracing::debug!("Network schema initialized");
        Ok(())
    }

    async fn create_networks_table(&self) -> SyncResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS networks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project TEXT NOT NULL DEFAULT 'default',
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                type TEXT NOT NULL DEFAULT 'bridge',
                status TEXT CHECK(status IN ('pending', 'created', 'errored')) NOT NULL DEFAULT 'pending',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(project, name)
            )
        "#,
        )
        .execute(&self.write_pool)
        .await?;

        Ok(())
    }

    async fn create_network_config_table(&self) -> SyncResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS network_config (
                network_id INTEGER NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY(network_id, key),
                FOREIGN KEY(network_id) REFERENCES networks(id) ON DELETE CASCADE
            )
        "#,
        )
        .execute(&self.write_pool)
        .await?;

        Ok(())
    }

    async fn create_network_forwards_table(&self) -> SyncResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS network_forwards (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                network_id INTEGER NOT NULL,
                listen_address TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                config TEXT NOT NULL DEFAULT '{}',
                ports TEXT NOT NULL DEFAULT '[]',
                UNIQUE(network_id, listen_address),
                FOREIGN KEY(network_id) REFERENCES networks(id) ON DELETE CASCADE
            )
        "#,
        )
        .execute(&self.write_pool)
        .await?;

        Ok(())
    }

    async fn create_network_acls_table(&self) -> SyncResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS network_acls (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project TEXT NOT NULL DEFAULT 'default',
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                UNIQUE(project, name)
            )
        "#,
        )
        .execute(&self.write_pool)
        .await?;

        Ok(())
    }

    async fn create_instance_devices_table(&self) -> SyncResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instance_devices (
                project TEXT NOT NULL DEFAULT 'default',
                instance TEXT NOT NULL,
                device TEXT NOT NULL,
                type TEXT NOT NULL DEFAULT 'nic',
                config TEXT NOT NULL DEFAULT '{}',
                PRIMARY KEY(project, instance, device)
            )
        "#,
        )
        .execute(&self.write_pool)
        .await?;

        Ok(())
    }

    async fn create_warnings_table(&self) -> SyncResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS warnings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project TEXT NOT NULL DEFAULT 'default',
                entity TEXT NOT NULL,
                type_code TEXT NOT NULL,
                message TEXT NOT NULL,
                status TEXT CHECK(status IN ('new', 'resolved')) NOT NULL DEFAULT 'new',
                count INTEGER NOT NULL DEFAULT 1,
                first_seen_at INTEGER NOT NULL,
                last_seen_at INTEGER NOT NULL,
                UNIQUE(project, entity, type_code)
            )
        "#,
        )
        .execute(&self.write_pool)
        .await?;

        Ok(())
    }

    async fn create_network_zones_table(&self) -> SyncResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS network_zones (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project TEXT NOT NULL DEFAULT 'default',
                name TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&self.write_pool)
        .await?;

        Ok(())
    }

    async fn create_network_zone_config_table(&self) -> SyncResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS network_zone_config (
                zone_id INTEGER NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY(zone_id, key),
                FOREIGN KEY(zone_id) REFERENCES network_zones(id) ON DELETE CASCADE
            )
        "#,
        )
        .execute(&self.write_pool)
        .await?;

        Ok(())
    }

    async fn create_dns_records_table(&self) -> SyncResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dns_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                zone_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                type TEXT NOT NULL,
                value TEXT NOT NULL,
                ttl INTEGER NOT NULL DEFAULT 300,
                FOREIGN KEY(zone_id) REFERENCES network_zones(id) ON DELETE CASCADE
            )
        "#,
        )
        .execute(&self.write_pool)
        .await?;

        Ok(())
    }

    async fn create_indexes(&self) -> SyncResult<()> {
        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_network_forwards_network ON network_forwards(network_id)",
            "CREATE INDEX IF NOT EXISTS idx_warnings_entity ON warnings(project, entity)",
            "CREATE INDEX IF NOT EXISTS idx_dns_records_zone ON dns_records(zone_id)",
        ];

        for statement in indexes {
            sqlx::query(statement).execute(&self.write_pool).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::connection::ConnectionManager;
    use sqlx::Row;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_initialize_schema_is_idempotent() {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap();

        let conn_manager = ConnectionManager::new(db_path).await.unwrap();
        let schema_manager = SchemaManager::new(conn_manager.pool().clone());
        schema_manager.initialize_schema().await.unwrap();
        schema_manager.initialize_schema().await.unwrap();

        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM sqlite_master WHERE type = 'table' AND name IN \
             ('networks', 'network_config', 'network_forwards', 'warnings', 'dns_records')",
        )
        .fetch_one(conn_manager.pool())
        .await
        .unwrap();
        let n: i64 = row.get("n");
        assert_eq!(n, 5);
    }
}
