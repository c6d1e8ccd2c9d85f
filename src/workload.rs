// incrementalbackup/src/workload.rs
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::agent::{BackupAgent, Database};
use crate::backup::{BackupCompletionCoordinator, PollSettings, SubmitOutcome, submit_backup};
use crate::config::WorkloadConfig;
use crate::errors::Result;
use crate::restore::RestoreCoordinator;
use crate::types::{BackupJobState, Version};
use crate::utils::current_read_version;

/// What a workload run did. Phases that were not requested stay `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub submit: Option<SubmitOutcome>,
    pub restored_to: Option<Version>,
    pub target_version: Option<Version>,
    pub backup_state: Option<BackupJobState>,
}

impl WorkloadReport {
    fn new() -> Self {
        WorkloadReport {
            started_at: Utc::now(),
            finished_at: None,
            submit: None,
            restored_to: None,
            target_version: None,
            backup_state: None,
        }
    }
}

/// Sequences submit, restore and the backup coverage check as configured.
pub struct WorkloadDriver<'a> {
    config: &'a WorkloadConfig,
    agent: &'a dyn BackupAgent,
    database: &'a dyn Database,
}

impl<'a> WorkloadDriver<'a> {
    pub const NAME: &'static str = "IncrementalBackup";

    pub fn new(
        config: &'a WorkloadConfig,
        agent: &'a dyn BackupAgent,
        database: &'a dyn Database,
    ) -> Self {
        WorkloadDriver {
            config,
            agent,
            database,
        }
    }

    /// Only the first client drives the backup; every other client passes trivially.
    fn is_leader(&self) -> bool {
        self.config.client_id == 0
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<WorkloadReport> {
        let mut report = WorkloadReport::new();
        if !self.is_leader() {
            info!(client_id = self.config.client_id, "not the leading client, nothing to do");
        } else {
            self.start(&mut report, cancel).await?;
            self.check(&mut report, cancel).await?;
        }
        report.finished_at = Some(Utc::now());
        Ok(report)
    }

    /// Submit and restore phases.
    pub async fn start(&self, report: &mut WorkloadReport, cancel: &CancellationToken) -> Result<()> {
        let config = self.config;
        if config.submit_only {
            let outcome = submit_backup(self.agent, &config.backup_dir, &config.tag, cancel).await?;
            report.submit = Some(outcome);
        }
        if config.restore_only {
            let restored_to = RestoreCoordinator::new(self.agent, self.database)
                .restore(&config.tag, config.check_begin_version, cancel)
                .await?;
            report.restored_to = Some(restored_to);
        }
        Ok(())
    }

    /// Waits until the backup covers everything visible when the phase begins.
    pub async fn check(&self, report: &mut WorkloadReport, cancel: &CancellationToken) -> Result<()> {
        let config = self.config;
        if !config.wait_for_backup {
            return Ok(());
        }
        let target = current_read_version(self.database, cancel).await?;
        report.target_version = Some(target);

        let settings = PollSettings {
            interval: config.poll_interval,
            discontinue: config.stop_backup,
        };
        let state = BackupCompletionCoordinator::new(self.agent, settings)
            .await_coverage(&config.tag, target, cancel)
            .await?;
        report.backup_state = Some(state);
        Ok(())
    }
}
