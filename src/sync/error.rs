#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{entity} not found: {name}")]
    NotFound { entity: String, name: String },

    #[error("{entity} already exists: {name}")]
    AlreadyExists { entity: String, name: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Resource validation failed: {message}")]
    ValidationFailed { message: String },
}

impl SyncError {
    pub(crate) fn not_found(entity: &str, name: impl Into<String>) -> Self {
        SyncError::NotFound {
            entity: entity.to_string(),
            name: name.into(),
        }
    }

    /// Maps a UNIQUE constraint violation to `AlreadyExists`, anything else to `Database`.
    pub(crate) fn from_insert(e: sqlx::Error, entity: &str, name: impl Into<String>) -> Self {
        if let sqlx::Error::Database(db) = &e {
            if db.is_unique_violation() {
                return SyncError::AlreadyExists {
                    entity: entity.to_string(),
                    name: name.into(),
                };
            }
        }
        SyncError::Database(e)
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
