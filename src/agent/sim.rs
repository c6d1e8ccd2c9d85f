//! In-memory stand-ins for the backup agent, backup containers and the
//! key-value store. The binary runs against these by default (the
//! `file://simfdb/` backup directory) and the tests script them directly.

// incrementalbackup/src/agent/sim.rs
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use super::{
    AgentError, BackupAgent, BackupContainer, BackupHandle, Database, KvError, Transaction,
    TransactionOption,
};
use crate::config::SimulationConfig;
use crate::restore::markers::{SNAPSHOT_END_VERSION_KEY, WRITE_RECOVERY_KEY, encode_version};
use crate::types::{BackupDescription, BackupTag, KeyRange, RestoreRequest, SubmitRequest, Version};

const RETRY_BACKOFF: Duration = Duration::from_millis(10);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic while holding one of these short critical sections leaves the data consistent.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

#[derive(Default)]
struct DbState {
    version: i64,
    /// Every write is kept so reads observe the state as of their read version.
    history: BTreeMap<Vec<u8>, Vec<(i64, Vec<u8>)>>,
    locked: bool,
    pending_failures: VecDeque<KvError>,
    reads: u64,
    /// A write applied right after the read with this ordinal completes.
    write_after_read: Option<(u64, Vec<u8>, Vec<u8>)>,
}

impl DbState {
    fn read_at(&self, key: &[u8], read_version: i64) -> Option<Vec<u8>> {
        self.history
            .get(key)?
            .iter()
            .rev()
            .find(|(v, _)| *v <= read_version)
            .map(|(_, value)| value.clone())
    }

    fn write(&mut self, key: &[u8], value: &[u8]) -> i64 {
        self.version += 1;
        let version = self.version;
        self.history
            .entry(key.to_vec())
            .or_default()
            .push((version, value.to_vec()));
        version
    }

    fn finish_read(&mut self) {
        let reads = self.reads;
        if !self.write_after_read.as_ref().is_some_and(|(after, _, _)| *after == reads) {
            return;
        }
        if let Some((_, key, value)) = self.write_after_read.take() {
            self.write(&key, &value);
        }
    }
}

#[derive(Default)]
pub struct SimDatabase {
    state: Arc<Mutex<DbState>>,
}

impl SimDatabase {
    pub fn new(current_version: Version) -> Self {
        let db = SimDatabase::default();
        lock(&db.state).version = current_version.0.max(0);
        db
    }

    /// Writes `key` at a new version and returns that version.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Version {
        Version(lock(&self.state).write(key, value))
    }

    #[cfg(test)]
    pub fn set_locked(&self, locked: bool) {
        lock(&self.state).locked = locked;
    }

    /// Queues errors returned, in order, by the next reads of any transaction.
    pub fn inject_failures(&self, errors: impl IntoIterator<Item = KvError>) {
        lock(&self.state).pending_failures.extend(errors);
    }

    #[cfg(test)]
    /// Writes `key` once the `nth` read since creation has been answered, so a
    /// transaction already holding a read version cannot observe it.
    pub fn write_after_read(&self, nth: u64, key: &[u8], value: &[u8]) {
        lock(&self.state).write_after_read = Some((nth, key.to_vec(), value.to_vec()));
    }

    #[cfg(test)]
    /// Number of reads (read versions and gets) that reached the store.
    pub fn read_count(&self) -> u64 {
        lock(&self.state).reads
    }
}

impl Database for SimDatabase {
    fn create_transaction(&self) -> Box<dyn Transaction> {
        Box::new(SimTransaction {
            state: Arc::clone(&self.state),
            options: HashSet::new(),
            read_version: None,
        })
    }
}

struct SimTransaction {
    state: Arc<Mutex<DbState>>,
    options: HashSet<TransactionOption>,
    read_version: Option<i64>,
}

impl SimTransaction {
    fn begin_read(&mut self) -> Result<(MutexGuard<'_, DbState>, i64), KvError> {
        let mut state = lock(&self.state);
        state.reads += 1;
        if let Some(err) = state.pending_failures.pop_front() {
            return Err(err);
        }
        if state.locked && !self.options.contains(&TransactionOption::LockAware) {
            return Err(KvError::DatabaseLocked);
        }
        let read_version = *self.read_version.get_or_insert(state.version);
        Ok((state, read_version))
    }
}

#[async_trait]
impl Transaction for SimTransaction {
    fn set_option(&mut self, option: TransactionOption) {
        self.options.insert(option);
    }

    async fn get_read_version(&mut self) -> Result<Version, KvError> {
        let (mut state, read_version) = self.begin_read()?;
        state.finish_read();
        Ok(Version(read_version))
    }

    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        let system_key = !KeyRange::normal_keys().contains(key);
        if system_key && !self.options.contains(&TransactionOption::AccessSystemKeys) {
            return Err(KvError::KeyOutsideLegalRange);
        }
        let (mut state, read_version) = self.begin_read()?;
        let value = state.read_at(key, read_version);
        state.finish_read();
        Ok(value)
    }

    async fn on_error(&mut self, err: KvError) -> Result<(), KvError> {
        if !err.is_retryable() {
            return Err(err);
        }
        tokio::time::sleep(RETRY_BACKOFF).await;
        self.options.clear();
        self.read_version = None;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Container
// ---------------------------------------------------------------------------

enum Progress {
    #[cfg(test)]
    /// Hands out descriptions in order, repeating the last one.
    Scripted(VecDeque<(Option<Version>, Option<Version>)>),
    /// Log end grows by `step` per fresh describe; the contiguous end trails by `lag`.
    Advancing {
        start: i64,
        step: i64,
        lag: i64,
        max_log_end: Option<i64>,
    },
}

struct ContainerState {
    /// `None` means the container never comes into existence.
    polls_until_exists: Option<u32>,
    progress: Progress,
    cached: Option<BackupDescription>,
    exists_polls: u32,
    fresh_describes: u32,
}

pub struct SimContainer {
    url: Url,
    state: Mutex<ContainerState>,
}

impl SimContainer {
    fn with_progress(url: Url, polls_until_exists: Option<u32>, progress: Progress) -> Self {
        SimContainer {
            url,
            state: Mutex::new(ContainerState {
                polls_until_exists,
                progress,
                cached: None,
                exists_polls: 0,
                fresh_describes: 0,
            }),
        }
    }

    #[cfg(test)]
    /// A container that exists immediately and reports `script` as
    /// `(max_log_end, contiguous_log_end)` pairs, one per fresh describe.
    pub fn scripted(url: Url, script: Vec<(Option<Version>, Option<Version>)>) -> Self {
        SimContainer::with_progress(url, Some(0), Progress::Scripted(script.into()))
    }

    pub fn advancing(url: Url, start: Version, step: i64, lag: i64) -> Self {
        SimContainer::with_progress(
            url,
            Some(0),
            Progress::Advancing {
                start: start.0,
                step,
                lag,
                max_log_end: None,
            },
        )
    }

    pub fn with_polls_until_exists(self, polls: Option<u32>) -> Self {
        lock(&self.state).polls_until_exists = polls;
        self
    }

    #[cfg(test)]
    pub fn exists_polls(&self) -> u32 {
        lock(&self.state).exists_polls
    }

    #[cfg(test)]
    pub fn fresh_describes(&self) -> u32 {
        lock(&self.state).fresh_describes
    }

    fn latest_contiguous_end(&self) -> Option<Version> {
        lock(&self.state).cached.as_ref()?.contiguous_log_end
    }
}

#[async_trait]
impl BackupContainer for SimContainer {
    fn url(&self) -> &Url {
        &self.url
    }

    async fn exists(&self) -> Result<bool, AgentError> {
        let mut state = lock(&self.state);
        state.exists_polls += 1;
        Ok(match state.polls_until_exists {
            Some(0) => true,
            Some(remaining) => {
                state.polls_until_exists = Some(remaining - 1);
                false
            }
            None => false,
        })
    }

    async fn describe_backup(&self, force_fresh: bool) -> Result<BackupDescription, AgentError> {
        let mut state = lock(&self.state);
        if !force_fresh {
            if let Some(cached) = &state.cached {
                return Ok(cached.clone());
            }
        }
        state.fresh_describes += 1;
        let (max_log_end, contiguous_log_end) = match &mut state.progress {
            #[cfg(test)]
            Progress::Scripted(script) => {
                let next = if script.len() > 1 {
                    script.pop_front()
                } else {
                    script.front().copied()
                };
                next.unwrap_or((None, None))
            }
            Progress::Advancing {
                start,
                step,
                lag,
                max_log_end,
            } => {
                let end = max_log_end.map_or(*start, |end| end + *step);
                *max_log_end = Some(end);
                let contiguous = Some(end - *lag).filter(|c| *c >= *start);
                (Some(Version(end)), contiguous.map(Version))
            }
        };
        let description = BackupDescription {
            url: self.url.clone(),
            max_log_end,
            contiguous_log_end,
        };
        state.cached = Some(description.clone());
        Ok(description)
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

struct SimBackup {
    container: Arc<SimContainer>,
    uid: Uuid,
    running: bool,
}

#[derive(Default)]
struct AgentState {
    backups: HashMap<BackupTag, SimBackup>,
    submits: Vec<SubmitRequest>,
    discontinued: Vec<BackupTag>,
    restores: Vec<RestoreRequest>,
    restore_failure: Option<String>,
}

pub struct SimBackupAgent {
    settings: SimulationConfig,
    state: Mutex<AgentState>,
    registered: Notify,
}

impl SimBackupAgent {
    pub fn new(settings: SimulationConfig) -> Self {
        SimBackupAgent {
            settings,
            state: Mutex::new(AgentState::default()),
            registered: Notify::new(),
        }
    }

    /// Registers a prepared container as a running backup under `tag`.
    pub fn attach(&self, tag: BackupTag, container: Arc<SimContainer>) {
        lock(&self.state).backups.insert(
            tag,
            SimBackup {
                container,
                uid: Uuid::new_v4(),
                running: true,
            },
        );
        self.registered.notify_waiters();
    }

    #[cfg(test)]
    pub fn fail_restores(&self, reason: impl Into<String>) {
        lock(&self.state).restore_failure = Some(reason.into());
    }

    #[cfg(test)]
    pub fn submits(&self) -> Vec<SubmitRequest> {
        lock(&self.state).submits.clone()
    }

    #[cfg(test)]
    pub fn running_backups(&self) -> usize {
        lock(&self.state).backups.values().filter(|b| b.running).count()
    }

    #[cfg(test)]
    pub fn discontinued(&self) -> Vec<BackupTag> {
        lock(&self.state).discontinued.clone()
    }

    #[cfg(test)]
    pub fn restores(&self) -> Vec<RestoreRequest> {
        lock(&self.state).restores.clone()
    }

    fn lookup(&self, tag: &BackupTag) -> Option<BackupHandle> {
        let state = lock(&self.state);
        let backup = state.backups.get(tag)?;
        Some(BackupHandle {
            container: backup.container.clone(),
            uid: backup.uid,
        })
    }
}

#[async_trait]
impl BackupAgent for SimBackupAgent {
    async fn submit_backup(&self, request: &SubmitRequest) -> Result<(), AgentError> {
        {
            let mut state = lock(&self.state);
            state.submits.push(request.clone());
            if state.backups.get(&request.tag).is_some_and(|b| b.running) {
                return Err(AgentError::DuplicateBackup(request.tag.clone()));
            }
        }
        let folder = format!("backup-{}/", Utc::now().format("%Y-%m-%d-%H-%M-%S%.6f"));
        let url = request
            .container_url
            .join(&folder)
            .map_err(|e| AgentError::Container(e.to_string()))?;
        info!(tag = %request.tag, url = %url, "simulated backup started");
        let container = SimContainer::advancing(
            url,
            Version(self.settings.start_version),
            self.settings.log_step,
            self.settings.contiguous_lag,
        )
        .with_polls_until_exists(Some(self.settings.polls_until_exists));
        self.attach(request.tag.clone(), Arc::new(container));
        Ok(())
    }

    async fn wait_backup(&self, tag: &BackupTag) -> Result<BackupHandle, AgentError> {
        loop {
            let registered = self.registered.notified();
            if let Some(handle) = self.lookup(tag) {
                return Ok(handle);
            }
            debug!(tag = %tag, "waiting for backup to be registered");
            registered.await;
        }
    }

    async fn discontinue_backup(&self, tag: &BackupTag) -> Result<(), AgentError> {
        let mut state = lock(&self.state);
        let backup = state
            .backups
            .get_mut(tag)
            .filter(|b| b.running)
            .ok_or_else(|| AgentError::BackupNotFound(tag.clone()))?;
        backup.running = false;
        state.discontinued.push(tag.clone());
        Ok(())
    }

    async fn restore(&self, request: &RestoreRequest) -> Result<Version, AgentError> {
        let restored_to = {
            let mut state = lock(&self.state);
            state.restores.push(request.clone());
            if let Some(reason) = &state.restore_failure {
                return Err(AgentError::RestoreFailed(reason.clone()));
            }
            state
                .backups
                .get(&request.tag)
                .and_then(|b| b.container.latest_contiguous_end())
        };
        let restored_to = if request.target_version.is_valid() {
            request.target_version
        } else {
            restored_to.unwrap_or(request.begin_version)
        };
        info!(tag = %request.tag, restored_to = %restored_to, "simulated restore finished");
        Ok(restored_to)
    }
}

// ---------------------------------------------------------------------------
// Cluster
// ---------------------------------------------------------------------------

/// A simulated database plus the backup agent operating on it.
pub struct SimCluster {
    pub database: Arc<SimDatabase>,
    pub agent: Arc<SimBackupAgent>,
}

impl SimCluster {
    pub fn new(settings: &SimulationConfig) -> Self {
        let database = SimDatabase::new(Version(settings.current_version));
        if settings.write_recovery {
            database.set(WRITE_RECOVERY_KEY, b"1");
        }
        if let Some(end) = settings.snapshot_end_version {
            database.set(SNAPSHOT_END_VERSION_KEY, &encode_version(Version(end)));
        }
        database.inject_failures(
            std::iter::repeat_n(
                settings.transient_read_error.clone(),
                settings.transient_read_failures as usize,
            ),
        );
        SimCluster {
            database: Arc::new(database),
            agent: Arc::new(SimBackupAgent::new(settings.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container_url() -> Url {
        Url::parse("file://simfdb/backups/backup-test/").unwrap()
    }

    #[tokio::test]
    async fn test_system_keys_need_access_option() {
        let db = SimDatabase::new(Version(10));
        db.set(WRITE_RECOVERY_KEY, b"1");

        let mut tr = db.create_transaction();
        assert_eq!(tr.get(WRITE_RECOVERY_KEY).await, Err(KvError::KeyOutsideLegalRange));

        tr.set_option(TransactionOption::AccessSystemKeys);
        assert_eq!(tr.get(WRITE_RECOVERY_KEY).await, Ok(Some(b"1".to_vec())));
    }

    #[tokio::test]
    async fn test_locked_database_needs_lock_aware() {
        let db = SimDatabase::new(Version(10));
        db.set(b"k", b"v");
        db.set_locked(true);

        let mut tr = db.create_transaction();
        assert_eq!(tr.get(b"k").await, Err(KvError::DatabaseLocked));

        tr.set_option(TransactionOption::LockAware);
        assert_eq!(tr.get(b"k").await, Ok(Some(b"v".to_vec())));
    }

    #[tokio::test]
    async fn test_reads_are_pinned_to_read_version() {
        let db = SimDatabase::new(Version(10));
        db.set(b"k", b"old");

        let mut tr = db.create_transaction();
        assert_eq!(tr.get(b"k").await, Ok(Some(b"old".to_vec())));
        db.set(b"k", b"new");
        assert_eq!(tr.get(b"k").await, Ok(Some(b"old".to_vec())));

        let mut fresh = db.create_transaction();
        assert_eq!(fresh.get(b"k").await, Ok(Some(b"new".to_vec())));
    }

    #[tokio::test]
    async fn test_read_version_pins_later_gets() -> anyhow::Result<()> {
        let db = SimDatabase::new(Version(10));
        let mut tr = db.create_transaction();

        let read_version = tr.get_read_version().await?;
        db.set(b"k", b"late");

        assert_eq!(read_version, Version(10));
        assert_eq!(tr.get_read_version().await?, read_version);
        assert_eq!(tr.get(b"k").await?, None);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_error_resets_options_and_rejects_fatal_errors() {
        let db = SimDatabase::new(Version(10));
        let mut tr = db.create_transaction();
        tr.set_option(TransactionOption::AccessSystemKeys);

        assert_eq!(tr.on_error(KvError::NotCommitted).await, Ok(()));
        assert_eq!(tr.get(WRITE_RECOVERY_KEY).await, Err(KvError::KeyOutsideLegalRange));
        assert_eq!(
            tr.on_error(KvError::DatabaseLocked).await,
            Err(KvError::DatabaseLocked)
        );
    }

    #[tokio::test]
    async fn test_cached_describe_skips_recomputation() -> anyhow::Result<()> {
        let container = SimContainer::advancing(container_url(), Version(0), 100, 0);

        let first = container.describe_backup(true).await?;
        let cached = container.describe_backup(false).await?;
        let fresh = container.describe_backup(true).await?;

        assert_eq!(first, cached);
        assert_eq!(fresh.max_log_end, Some(Version(100)));
        assert_eq!(container.fresh_describes(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_advancing_container_keeps_contiguous_behind_max() -> anyhow::Result<()> {
        let container = SimContainer::advancing(container_url(), Version(0), 100, 150);

        let first = container.describe_backup(true).await?;
        assert_eq!(first.contiguous_log_end, None);

        container.describe_backup(true).await?;
        let third = container.describe_backup(true).await?;
        assert_eq!(third.max_log_end, Some(Version(200)));
        assert_eq!(third.contiguous_log_end, Some(Version(50)));
        Ok(())
    }

    #[tokio::test]
    async fn test_submit_twice_reports_duplicate() {
        let agent = SimBackupAgent::new(SimulationConfig::default());
        let request = SubmitRequest {
            container_url: Url::parse("file://simfdb/backups/").unwrap(),
            tag: BackupTag::default(),
            ranges: vec![KeyRange::normal_keys()],
            snapshot_interval_secs: 100_000_000,
            stop_when_done: false,
            partitioned_log: false,
            incremental_only: true,
        };

        assert_eq!(agent.submit_backup(&request).await, Ok(()));
        assert_eq!(
            agent.submit_backup(&request).await,
            Err(AgentError::DuplicateBackup(BackupTag::default()))
        );
        assert_eq!(agent.running_backups(), 1);
    }
}
