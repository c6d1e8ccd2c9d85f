// incrementalbackup/src/types.rs
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// A database version. Totally ordered; `Version::INVALID` means "unset".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(pub i64);

impl Version {
    pub const INVALID: Version = Version(-1);

    pub fn is_valid(self) -> bool {
        self != Version::INVALID
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Names one logical backup stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackupTag(String);

impl BackupTag {
    pub fn new(tag: impl Into<String>) -> Self {
        BackupTag(tag.into())
    }
}

impl Default for BackupTag {
    fn default() -> Self {
        BackupTag::new("default")
    }
}

impl fmt::Display for BackupTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Half-open key range `[begin, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyRange {
    pub begin: Vec<u8>,
    pub end: Vec<u8>,
}

impl KeyRange {
    /// The user keyspace: everything below the system prefix.
    pub fn normal_keys() -> Self {
        KeyRange {
            begin: Vec::new(),
            end: vec![0xff],
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.begin.as_slice() && key < self.end.as_slice()
    }
}

/// Progress snapshot of a backup as reported by its container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupDescription {
    pub url: Url,
    /// Highest version for which any log segment exists, gaps allowed.
    pub max_log_end: Option<Version>,
    /// Highest version reachable by an unbroken log chain from the backup start.
    pub contiguous_log_end: Option<Version>,
}

impl BackupDescription {
    /// The contiguous end if an unbroken log chain reaches `target`.
    /// `max_log_end` is never consulted.
    pub fn covered_through(&self, target: Version) -> Option<Version> {
        self.contiguous_log_end.filter(|end| *end >= target)
    }
}

/// Lifecycle of a backup job as observed by polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupJobState {
    Submitted,
    Running,
    ContiguousThrough(Version),
    Discontinued(Version),
}

/// Parameters for starting a new backup.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitRequest {
    pub container_url: Url,
    pub tag: BackupTag,
    pub ranges: Vec<KeyRange>,
    pub snapshot_interval_secs: u64,
    pub stop_when_done: bool,
    pub partitioned_log: bool,
    pub incremental_only: bool,
}

/// Parameters for one restore invocation. Built fresh per call.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoreRequest {
    pub tag: BackupTag,
    pub container_url: Url,
    pub ranges: Vec<KeyRange>,
    pub begin_version: Version,
    /// `Version::INVALID` restores to the latest restorable version.
    pub target_version: Version,
    pub wait_for_complete: bool,
    pub lock_database: bool,
    pub incremental_only: bool,
    pub add_prefix: Vec<u8>,
    pub remove_prefix: Vec<u8>,
}
