/// Error types for the chat core
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    /// Backing store could not be reached. Transient: retry with backoff.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Transport refused or lost a message. Transient: retried by the sync engine.
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// Caller asked for a range the log cannot serve.
    #[error("Out of range: {0}")]
    OutOfRange(String),

    /// Same message id seen twice with different content. First-seen wins.
    #[error("Conflict on message {message_id}: {reason}")]
    Conflict { message_id: String, reason: String },

    /// Stored bytes failed schema validation.
    #[error("Corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ChatError {
    /// Whether the caller should retry the operation later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChatError::StorageUnavailable(_) | ChatError::TransportFailure(_)
        )
    }
}

impl From<sled::Error> for ChatError {
    fn from(e: sled::Error) -> Self {
        match e {
            sled::Error::Io(io) => ChatError::StorageUnavailable(io.to_string()),
            corruption @ sled::Error::Corruption { .. } => ChatError::Corrupt {
                key: "sled".to_string(),
                reason: corruption.to_string(),
            },
            other => ChatError::StorageUnavailable(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
