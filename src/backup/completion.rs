// incrementalbackup/src/backup/completion.rs
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::agent::{BackupAgent, BackupContainer};
use crate::errors::Result;
use crate::types::{BackupJobState, BackupTag, Version};
use crate::utils::{backoff, cancellable, resolve_backup};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Fixed delay between two polls of the same kind.
    pub interval: Duration,
    /// Discontinue the backup once coverage is observed.
    pub discontinue: bool,
}

impl Default for PollSettings {
    fn default() -> Self {
        PollSettings {
            interval: DEFAULT_POLL_INTERVAL,
            discontinue: false,
        }
    }
}

enum Phase {
    WaitingForContainer,
    WaitingForCoverage(Arc<dyn BackupContainer>),
    Covered(Version),
}

impl Phase {
    fn job_state(&self) -> BackupJobState {
        match self {
            Phase::WaitingForContainer => BackupJobState::Submitted,
            Phase::WaitingForCoverage(_) => BackupJobState::Running,
            Phase::Covered(end) => BackupJobState::ContiguousThrough(*end),
        }
    }
}

/// Waits until a backup's contiguous log chain reaches a target version.
///
/// There is no internal deadline: a container that never appears or a log
/// that never closes its gaps keeps the coordinator polling until `cancel`
/// fires. Every await is raced against the token.
pub struct BackupCompletionCoordinator<'a> {
    agent: &'a dyn BackupAgent,
    settings: PollSettings,
}

impl<'a> BackupCompletionCoordinator<'a> {
    pub fn new(agent: &'a dyn BackupAgent, settings: PollSettings) -> Self {
        BackupCompletionCoordinator { agent, settings }
    }

    pub async fn await_coverage(
        &self,
        tag: &BackupTag,
        target: Version,
        cancel: &CancellationToken,
    ) -> Result<BackupJobState> {
        info!(tag = %tag, target_version = %target, "waiting for backup to cover target version");

        let mut phase = Phase::WaitingForContainer;
        let covered = loop {
            phase = match phase {
                Phase::WaitingForContainer => self.poll_container(tag, cancel).await?,
                Phase::WaitingForCoverage(container) => {
                    self.poll_coverage(container, target, cancel).await?
                }
                Phase::Covered(end) => break end,
            };
            debug!(tag = %tag, state = ?phase.job_state(), "backup poll finished");
        };
        info!(tag = %tag, contiguous_log_end = %covered, target_version = %target, "backup covers target version");

        if !self.settings.discontinue {
            return Ok(BackupJobState::ContiguousThrough(covered));
        }
        info!(tag = %tag, "discontinuing backup");
        cancellable(cancel, "discontinuing backup", self.agent.discontinue_backup(tag)).await??;
        Ok(BackupJobState::Discontinued(covered))
    }

    async fn poll_container(&self, tag: &BackupTag, cancel: &CancellationToken) -> Result<Phase> {
        let handle = resolve_backup(self.agent, tag, cancel).await?;
        let exists = cancellable(cancel, "checking container", handle.container.exists()).await??;
        if exists {
            info!(tag = %tag, url = %handle.container.url(), "backup container exists");
            return Ok(Phase::WaitingForCoverage(handle.container));
        }
        debug!(tag = %tag, "backup container not created yet");
        backoff(cancel, self.settings.interval).await?;
        Ok(Phase::WaitingForContainer)
    }

    async fn poll_coverage(
        &self,
        container: Arc<dyn BackupContainer>,
        target: Version,
        cancel: &CancellationToken,
    ) -> Result<Phase> {
        let description =
            cancellable(cancel, "describing backup", container.describe_backup(true)).await??;
        info!(
            max_log_end = %description.max_log_end.unwrap_or(Version::INVALID),
            contiguous_log_end = %description.contiguous_log_end.unwrap_or(Version::INVALID),
            target_version = %target,
            "backup version gate"
        );
        if let Some(end) = description.covered_through(target) {
            return Ok(Phase::Covered(end));
        }
        if description.contiguous_log_end.is_none() {
            debug!("contiguous log end not available yet");
        }
        backoff(cancel, self.settings.interval).await?;
        Ok(Phase::WaitingForCoverage(container))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::sim::{SimBackupAgent, SimContainer};
    use crate::config::SimulationConfig;
    use crate::errors::AppError;
    use tokio::time::Instant;
    use url::Url;

    fn container(script: Vec<(Option<i64>, Option<i64>)>) -> Arc<SimContainer> {
        let url = Url::parse("file://simfdb/backups/backup-1/").unwrap();
        let script = script
            .into_iter()
            .map(|(max, contiguous)| (max.map(Version), contiguous.map(Version)))
            .collect();
        Arc::new(SimContainer::scripted(url, script))
    }

    fn agent_with(tag: &BackupTag, container: Arc<SimContainer>) -> SimBackupAgent {
        let agent = SimBackupAgent::new(SimulationConfig::default());
        agent.attach(tag.clone(), container);
        agent
    }

    fn cancel_after(secs: u64) -> CancellationToken {
        let cancel = CancellationToken::new();
        let timer = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            timer.cancel();
        });
        cancel
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_needs_contiguous_end_at_target() -> anyhow::Result<()> {
        let tag = BackupTag::default();
        let container = container(vec![
            (None, None),
            (Some(100), None),
            (Some(150), Some(120)),
            (Some(200), Some(200)),
        ]);
        let agent = agent_with(&tag, container.clone());
        let started = Instant::now();

        let state = BackupCompletionCoordinator::new(&agent, PollSettings::default())
            .await_coverage(&tag, Version(150), &CancellationToken::new())
            .await?;

        assert_eq!(state, BackupJobState::ContiguousThrough(Version(200)));
        assert_eq!(container.fresh_describes(), 4);
        // Three fixed backoffs between the four observations.
        assert_eq!(started.elapsed(), Duration::from_secs(15));
        assert!(agent.discontinued().is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_log_end_alone_never_succeeds() {
        let tag = BackupTag::default();
        let container = container(vec![(Some(500), None), (Some(900), Some(100))]);
        let agent = agent_with(&tag, container.clone());

        let result = BackupCompletionCoordinator::new(&agent, PollSettings::default())
            .await_coverage(&tag, Version(150), &cancel_after(60))
            .await;

        assert!(matches!(result, Err(AppError::Cancelled(_))));
        assert!(container.fresh_describes() > 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_container_stays_pending_until_cancelled() {
        let tag = BackupTag::default();
        let url = Url::parse("file://simfdb/backups/backup-never/").unwrap();
        let container = Arc::new(
            SimContainer::scripted(url, vec![(Some(Version(200)), Some(Version(200)))])
                .with_polls_until_exists(None),
        );
        let agent = agent_with(&tag, container.clone());

        let result = BackupCompletionCoordinator::new(&agent, PollSettings::default())
            .await_coverage(&tag, Version(150), &cancel_after(60))
            .await;

        assert!(matches!(result, Err(AppError::Cancelled(_))));
        assert!(container.exists_polls() >= 12);
        assert_eq!(container.fresh_describes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_describes_start_only_after_container_exists() -> anyhow::Result<()> {
        let tag = BackupTag::default();
        let url = Url::parse("file://simfdb/backups/backup-2/")?;
        let container = Arc::new(
            SimContainer::scripted(url, vec![(Some(Version(10)), Some(Version(10)))])
                .with_polls_until_exists(Some(2)),
        );
        let agent = agent_with(&tag, container.clone());

        let state = BackupCompletionCoordinator::new(&agent, PollSettings::default())
            .await_coverage(&tag, Version(10), &CancellationToken::new())
            .await?;

        assert_eq!(state, BackupJobState::ContiguousThrough(Version(10)));
        assert_eq!(container.exists_polls(), 3);
        assert_eq!(container.fresh_describes(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_backup_registration() -> anyhow::Result<()> {
        let tag = BackupTag::new("late");
        let agent = Arc::new(SimBackupAgent::new(SimulationConfig::default()));
        let late = container(vec![(Some(50), Some(50))]);
        {
            let agent = agent.clone();
            let tag = tag.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(20)).await;
                agent.attach(tag, late);
            });
        }

        let state = BackupCompletionCoordinator::new(&*agent, PollSettings::default())
            .await_coverage(&tag, Version(50), &CancellationToken::new())
            .await?;
        assert_eq!(state, BackupJobState::ContiguousThrough(Version(50)));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_discontinue_is_issued_after_coverage() -> anyhow::Result<()> {
        let tag = BackupTag::default();
        let agent = agent_with(&tag, container(vec![(Some(300), Some(300))]));
        let settings = PollSettings {
            interval: Duration::from_secs(1),
            discontinue: true,
        };

        let state = BackupCompletionCoordinator::new(&agent, settings)
            .await_coverage(&tag, Version(250), &CancellationToken::new())
            .await?;

        assert_eq!(state, BackupJobState::Discontinued(Version(300)));
        assert_eq!(agent.discontinued(), vec![tag]);
        assert_eq!(agent.running_backups(), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_discontinue_when_cancelled_before_coverage() {
        let tag = BackupTag::default();
        let agent = agent_with(&tag, container(vec![(Some(100), Some(100))]));
        let settings = PollSettings {
            interval: Duration::from_secs(5),
            discontinue: true,
        };

        let result = BackupCompletionCoordinator::new(&agent, settings)
            .await_coverage(&tag, Version(1_000), &cancel_after(30))
            .await;

        assert!(matches!(result, Err(AppError::Cancelled(_))));
        assert!(agent.discontinued().is_empty());
        assert_eq!(agent.running_backups(), 1);
    }
}
