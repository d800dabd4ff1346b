use thiserror::Error;

/// Errors surfaced by the cache engine.
///
/// `Clone` so that one single-flight fetch result can be handed to every
/// caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Failed to load {key}: {message}")]
    Load { key: String, message: String },

    #[error("Response for {resource} does not match its schema: {message}")]
    Shape { resource: String, message: String },

    #[error("Cached value for {key} is unreadable: {message}")]
    Serialization { key: String, message: String },

    #[error("Remote mutation of {key} failed: {message}")]
    Mutation { key: String, message: String },

    #[error("Cache for {0} was cleared while loading")]
    Cleared(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Unknown resource: {0}")]
    UnknownResource(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CacheError {
    /// Wrap a loader failure, keeping the whole context chain in the message.
    pub fn load(key: impl ToString, err: &anyhow::Error) -> Self {
        CacheError::Load {
            key: key.to_string(),
            message: format!("{:#}", err),
        }
    }

    /// True for failures of the authoritative loader (including schema mismatch).
    pub fn is_load_error(&self) -> bool {
        matches!(self, CacheError::Load { .. } | CacheError::Shape { .. })
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
