// incrementalbackup/src/restore/logic.rs
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::markers::RecoveryMarkerReader;
use crate::agent::{BackupAgent, Database};
use crate::errors::{AppError, Result};
use crate::types::{BackupTag, KeyRange, RestoreRequest, Version};
use crate::utils::{cancellable, resolve_backup};

/// Restores a tagged backup into the database the agent serves, optionally
/// starting from the version recorded by the last completed snapshot.
pub struct RestoreCoordinator<'a> {
    agent: &'a dyn BackupAgent,
    database: &'a dyn Database,
}

impl<'a> RestoreCoordinator<'a> {
    pub fn new(agent: &'a dyn BackupAgent, database: &'a dyn Database) -> Self {
        RestoreCoordinator { agent, database }
    }

    /// Returns the version the database was restored to.
    ///
    /// With `check_begin_version` the begin version comes from the recovery
    /// markers; a missing marker fails the restore before anything is replayed.
    /// Without it the restore starts from the backup's own beginning.
    pub async fn restore(
        &self,
        tag: &BackupTag,
        check_begin_version: bool,
        cancel: &CancellationToken,
    ) -> Result<Version> {
        let handle = resolve_backup(self.agent, tag, cancel).await?;

        let begin_version = if check_begin_version {
            RecoveryMarkerReader::new(self.database)
                .read_begin_version(cancel)
                .await?
        } else {
            Version::INVALID
        };

        let request = RestoreRequest {
            tag: tag.clone(),
            container_url: handle.container.url().clone(),
            ranges: vec![KeyRange::normal_keys()],
            begin_version,
            target_version: Version::INVALID,
            wait_for_complete: true,
            lock_database: true,
            incremental_only: true,
            add_prefix: Vec::new(),
            remove_prefix: Vec::new(),
        };
        info!(
            tag = %tag,
            url = %request.container_url,
            begin_version = %begin_version,
            "starting restore"
        );

        let restored_to = cancellable(cancel, "restore", self.agent.restore(&request))
            .await?
            .map_err(|e| {
                error!(tag = %tag, error = %e, "restore failed");
                AppError::Restore(e.to_string())
            })?;
        info!(tag = %tag, restored_to = %restored_to, "restore completed");
        Ok(restored_to)
    }
}
