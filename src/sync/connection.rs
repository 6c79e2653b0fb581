use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::sync::error::SyncResult;

/// Owns the SQLite pool shared by every store.
pub struct ConnectionManager {
    pool: SqlitePool,
}

impl ConnectionManager {
    pub async fn new(database_path: &str) -> SyncResult<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", database_path))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        tracing::debug!(path = %database_path, "Opened network database");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
