// incrementalbackup/src/backup/submit.rs
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use url::Url;

use crate::agent::{AgentError, BackupAgent};
use crate::errors::Result;
use crate::types::{BackupTag, KeyRange, SubmitRequest};
use crate::utils::cancellable;

/// Snapshot interval large enough that no second snapshot is ever scheduled.
pub const INCREMENTAL_SNAPSHOT_INTERVAL_SECS: u64 = 100_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Submitted,
    /// A backup was already running under the tag. Same end state as `Submitted`.
    AlreadyExists,
}

/// Starts an incremental backup of the user keyspace under `tag`.
/// Any failure other than a duplicate tag is returned as an error.
pub async fn submit_backup(
    agent: &dyn BackupAgent,
    backup_dir: &Url,
    tag: &BackupTag,
    cancel: &CancellationToken,
) -> Result<SubmitOutcome> {
    let request = SubmitRequest {
        container_url: backup_dir.clone(),
        tag: tag.clone(),
        ranges: vec![KeyRange::normal_keys()],
        snapshot_interval_secs: INCREMENTAL_SNAPSHOT_INTERVAL_SECS,
        stop_when_done: false,
        partitioned_log: false,
        incremental_only: true,
    };
    info!(tag = %tag, backup_dir = %backup_dir, "submitting backup");

    match cancellable(cancel, "submitting backup", agent.submit_backup(&request)).await? {
        Ok(()) => {
            info!(tag = %tag, "backup submitted");
            Ok(SubmitOutcome::Submitted)
        }
        Err(AgentError::DuplicateBackup(existing)) => {
            warn!(tag = %existing, "backup already running under this tag");
            Ok(SubmitOutcome::AlreadyExists)
        }
        Err(e) => {
            error!(tag = %tag, error = %e, "backup submission failed");
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::sim::SimBackupAgent;
    use crate::agent::BackupHandle;
    use crate::config::SimulationConfig;
    use crate::errors::AppError;
    use crate::types::{RestoreRequest, Version};
    use async_trait::async_trait;

    fn backup_dir() -> Url {
        Url::parse("file://simfdb/backups/").unwrap()
    }

    #[tokio::test]
    async fn test_second_submit_is_already_exists() -> anyhow::Result<()> {
        let agent = SimBackupAgent::new(SimulationConfig::default());
        let tag = BackupTag::default();
        let cancel = CancellationToken::new();

        let first = submit_backup(&agent, &backup_dir(), &tag, &cancel).await?;
        let second = submit_backup(&agent, &backup_dir(), &tag, &cancel).await?;

        assert_eq!(first, SubmitOutcome::Submitted);
        assert_eq!(second, SubmitOutcome::AlreadyExists);
        assert_eq!(agent.running_backups(), 1);
        assert_eq!(agent.submits().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_submit_requests_incremental_backup_of_user_keys() -> anyhow::Result<()> {
        let agent = SimBackupAgent::new(SimulationConfig::default());
        submit_backup(&agent, &backup_dir(), &BackupTag::new("t1"), &CancellationToken::new()).await?;

        let request = &agent.submits()[0];
        assert_eq!(request.ranges, vec![KeyRange::normal_keys()]);
        assert_eq!(request.snapshot_interval_secs, INCREMENTAL_SNAPSHOT_INTERVAL_SECS);
        assert!(request.incremental_only);
        assert!(!request.stop_when_done);
        assert!(!request.partitioned_log);
        Ok(())
    }

    struct BrokenAgent;

    #[async_trait]
    impl BackupAgent for BrokenAgent {
        async fn submit_backup(&self, _request: &SubmitRequest) -> std::result::Result<(), AgentError> {
            Err(AgentError::Container("destination is not writable".into()))
        }

        async fn wait_backup(&self, tag: &BackupTag) -> std::result::Result<BackupHandle, AgentError> {
            Err(AgentError::BackupNotFound(tag.clone()))
        }

        async fn discontinue_backup(&self, tag: &BackupTag) -> std::result::Result<(), AgentError> {
            Err(AgentError::BackupNotFound(tag.clone()))
        }

        async fn restore(&self, _request: &RestoreRequest) -> std::result::Result<Version, AgentError> {
            Err(AgentError::RestoreFailed("unsupported".into()))
        }
    }

    #[tokio::test]
    async fn test_other_submit_errors_propagate() {
        let result = submit_backup(
            &BrokenAgent,
            &backup_dir(),
            &BackupTag::default(),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(
            result,
            Err(AppError::Agent(AgentError::Container(_)))
        ));
    }
}
