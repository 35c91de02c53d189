use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("key not found")]
    NotFound,

    #[error("key expired")]
    Expired,

    #[error("memory budget exceeded: needed {needed} bytes, {available} available")]
    BudgetExceeded { needed: u64, available: u64 },

    #[error("cuckoo filter full")]
    FilterFull,

    #[error("unknown store: {0}")]
    UnknownStore(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("canceled: {0}")]
    Canceled(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("not primary for key, owner is {owner}")]
    NotPrimary { owner: String },

    #[error("replication failed: {0}")]
    ReplicationFailed(String),

    #[error("persistence corrupt: {0}")]
    PersistenceCorrupt(String),

    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CacheError {
    /// True for errors that mean "the key is not there" rather than a fault.
    pub fn is_miss(&self) -> bool {
        matches!(self, CacheError::NotFound | CacheError::Expired)
    }

    /// True for errors worth retrying against another owner.
    pub fn is_transport(&self) -> bool {
        matches!(self, CacheError::Transport(_) | CacheError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

// Error conversions for common error types

impl From<bincode::error::EncodeError> for CacheError {
    fn from(e: bincode::error::EncodeError) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for CacheError {
    fn from(e: bincode::error::DecodeError) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for CacheError {
    fn from(e: serde_yaml::Error) -> Self {
        CacheError::ConfigInvalid(e.to_string())
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            CacheError::Timeout(e.to_string())
        } else {
            CacheError::Transport(e.to_string())
        }
    }
}
