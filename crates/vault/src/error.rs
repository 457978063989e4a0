use thiserror::Error;

pub type Result<T> = std::result::Result<T, VaultError>;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Failures of the storage substrate. Never a statement about a token.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Upload stream failed: {0}")]
    Source(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Store fault: {0}")]
    Store(#[from] StoreError),

    #[error("Corrupt record for token {token}: {reason}")]
    CorruptRecord { token: String, reason: String },

    #[error("Asset upload is empty")]
    EmptyAsset,
}

impl VaultError {
    /// Whether retrying the same call later can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            VaultError::Store(StoreError::Source(_)) => false,
            VaultError::Store(_) => true,
            VaultError::CorruptRecord { .. } | VaultError::EmptyAsset => false,
        }
    }
}
