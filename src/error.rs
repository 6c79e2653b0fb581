use crate::sync::error::SyncError;

/// Error type for every network lifecycle, validation and DNS operation.
///
/// The first four variants are user-facing classifications that are always
/// raised before any host mutation. The remaining variants describe failures
/// of a subsystem the engine drives.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// Bad config key, value or cross-key constraint
    #[error("{0}")]
    Validation(String),

    /// Missing kernel feature, tool or required sysctl
    #[error("{0}")]
    Environment(String),

    /// Interface, forward or subnet already in use
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    #[error("netlink error: {0}")]
    Netlink(#[from] rtnetlink::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("command '{cmd}' failed: {stderr}")]
    Command { cmd: String, stderr: String },

    #[error("{0}")]
    Subprocess(String),

    #[error("{0}")]
    Firewall(String),

    #[error("{0}")]
    Database(#[from] SyncError),

    #[error("dns error: {0}")]
    Dns(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<NetworkError>,
    },
}

impl NetworkError {
    pub fn validation(msg: impl Into<String>) -> Self {
        NetworkError::Validation(msg.into())
    }

    pub fn environment(msg: impl Into<String>) -> Self {
        NetworkError::Environment(msg.into())
    }

    /// Walks through context wrappers to the underlying error.
    pub fn root(&self) -> &NetworkError {
        match self {
            NetworkError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self.root() {
            NetworkError::NotFound(_) => true,
            NetworkError::Database(SyncError::NotFound { .. }) => true,
            NetworkError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self.root(), NetworkError::Validation(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(
            self.root(),
            NetworkError::Conflict(_) | NetworkError::Database(SyncError::AlreadyExists { .. })
        )
    }
}

/// Attach a human readable prefix to an error while keeping its classification.
pub trait ErrorContext<T> {
    fn context(self, context: impl Into<String>) -> NetworkResult<T>;

    fn with_context<F, S>(self, f: F) -> NetworkResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E: Into<NetworkError>> ErrorContext<T> for Result<T, E> {
    fn context(self, context: impl Into<String>) -> NetworkResult<T> {
        self.map_err(|e| NetworkError::Context {
            context: context.into(),
            source: Box::new(e.into()),
        })
    }

    fn with_context<F, S>(self, f: F) -> NetworkResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| NetworkError::Context {
            context: f().into(),
            source: Box::new(e.into()),
        })
    }
}

impl From<sqlx::Error> for NetworkError {
    fn from(e: sqlx::Error) -> Self {
        NetworkError::Database(SyncError::Database(e))
    }
}

impl From<trust_dns_proto::error::ProtoError> for NetworkError {
    fn from(e: trust_dns_proto::error::ProtoError) -> Self {
        NetworkError::Dns(e.to_string())
    }
}

pub type NetworkResult<T> = Result<T, NetworkError>;
