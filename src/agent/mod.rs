//! Interfaces to the collaborators this tool drives but does not implement:
//! the backup agent, backup containers and the transactional key-value store.

// incrementalbackup/src/agent/mod.rs
pub mod sim;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::types::{BackupDescription, BackupTag, RestoreRequest, SubmitRequest, Version};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("a backup is already running under tag '{0}'")]
    DuplicateBackup(BackupTag),

    #[error("no backup found under tag '{0}'")]
    BackupNotFound(BackupTag),

    #[error("backup container error: {0}")]
    Container(String),

    #[error("restore failed: {0}")]
    RestoreFailed(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KvError {
    #[error("transaction not committed due to conflict with another transaction")]
    NotCommitted,

    #[error("transaction is too old to perform reads")]
    TransactionTooOld,

    #[error("request for future version")]
    FutureVersion,

    #[error("operation timed out")]
    TimedOut,

    #[error("database is locked")]
    DatabaseLocked,

    #[error("key outside legal range")]
    KeyOutsideLegalRange,
}

impl KvError {
    /// Errors the retry gate absorbs by backing off and resetting the transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KvError::NotCommitted
                | KvError::TransactionTooOld
                | KvError::FutureVersion
                | KvError::TimedOut
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionOption {
    /// Allow reads of keys under the `\xff` system prefix.
    AccessSystemKeys,
    /// Proceed even while the database is locked.
    LockAware,
}

#[async_trait]
pub trait Transaction: Send {
    /// Options apply to the current attempt and are cleared by `on_error`.
    fn set_option(&mut self, option: TransactionOption);

    async fn get_read_version(&mut self) -> Result<Version, KvError>;

    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError>;

    /// Retry gate. Backs off and resets the transaction when `err` is
    /// retryable, otherwise hands the error back.
    async fn on_error(&mut self, err: KvError) -> Result<(), KvError>;
}

pub trait Database: Send + Sync {
    fn create_transaction(&self) -> Box<dyn Transaction>;
}

#[async_trait]
pub trait BackupContainer: Send + Sync {
    fn url(&self) -> &Url;

    async fn exists(&self) -> Result<bool, AgentError>;

    /// `force_fresh` bypasses any cached description and recomputes log contiguity.
    async fn describe_backup(&self, force_fresh: bool) -> Result<BackupDescription, AgentError>;
}

/// A backup's container together with the unique id of the running job.
#[derive(Clone)]
pub struct BackupHandle {
    pub container: Arc<dyn BackupContainer>,
    pub uid: Uuid,
}

#[async_trait]
pub trait BackupAgent: Send + Sync {
    async fn submit_backup(&self, request: &SubmitRequest) -> Result<(), AgentError>;

    /// Suspends until a container for `tag` can be resolved.
    async fn wait_backup(&self, tag: &BackupTag) -> Result<BackupHandle, AgentError>;

    async fn discontinue_backup(&self, tag: &BackupTag) -> Result<(), AgentError>;

    /// Restores into the agent's own database and returns the version restored to.
    async fn restore(&self, request: &RestoreRequest) -> Result<Version, AgentError>;
}
