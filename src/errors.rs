use thiserror::Error;

use crate::agent::{AgentError, KvError};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("Backup agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] KvError),

    /// The snapshot never persisted its end version; waiting will not make it appear.
    #[error("Recovery marker not found: {0}")]
    RecoveryMarkerNotFound(String),

    #[error("Recovery marker could not be decoded: {0}")]
    MarkerDecode(String),

    #[error("Restore operation failed: {0}")]
    Restore(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

impl AppError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::Cancelled(_))
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
