//! Error types for the lifecycle engine.

use memtier_store::StorageError;

/// Errors produced by memtier engine operations.
#[derive(Debug, thiserror::Error)]
pub enum MemtierError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("failed to render configuration: {0}")]
    ConfigRender(#[from] toml::ser::Error),

    #[error("unknown scope: {0} (expected thread, topic, user or global)")]
    UnknownScope(String),

    #[error("top_k must be positive, got {0}")]
    InvalidTopK(usize),

    #[error("unknown tier: {0}")]
    UnknownTier(String),

    #[error("scope {scope} requires an owner")]
    MissingOwner { scope: String },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for memtier engine operations.
pub type MemtierResult<T> = std::result::Result<T, MemtierError>;
