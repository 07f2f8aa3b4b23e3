use std::fmt;

/// Error kinds surfaced by the replication engine.
///
/// Local misuse (`InvalidPath`, `InvalidValue`, `ShuttingDown`, `Storage`,
/// `Config`, `UnknownStrategy`) surfaces to the host API caller. Network and
/// sync failures are handled internally: they are logged, retried, and show
/// up only in node statistics.
#[derive(Debug)]
pub enum MeshError {
    InvalidPath(String),
    InvalidValue(String),
    ShuttingDown,
    Storage(String),
    PeerTransport(String),
    SyncTimeout(String),
    Config(String),
    UnknownStrategy(String),
    Resolver(String),
    Serialization(String),
    Internal(String),
}

impl fmt::Display for MeshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeshError::InvalidPath(msg) => write!(f, "Invalid path: {}", msg),
            MeshError::InvalidValue(msg) => write!(f, "Invalid value: {}", msg),
            MeshError::ShuttingDown => write!(f, "Node is shutting down"),
            MeshError::Storage(msg) => write!(f, "Storage error: {}", msg),
            MeshError::PeerTransport(msg) => write!(f, "Peer transport error: {}", msg),
            MeshError::SyncTimeout(msg) => write!(f, "Sync timeout: {}", msg),
            MeshError::Config(msg) => write!(f, "Configuration error: {}", msg),
            MeshError::UnknownStrategy(msg) => write!(f, "Unknown conflict strategy: {}", msg),
            MeshError::Resolver(msg) => write!(f, "Resolver error: {}", msg),
            MeshError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            MeshError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for MeshError {}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for MeshError {
    fn from(err: std::io::Error) -> Self {
        MeshError::Storage(err.to_string())
    }
}

pub type MeshResult<T> = Result<T, MeshError>;
