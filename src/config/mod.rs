// incrementalbackup/src/config/mod.rs
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::agent::KvError;
use crate::errors::{AppError, Result};
use crate::types::BackupTag;

pub const DEFAULT_BACKUP_DIR: &str = "file://simfdb/backups/";
pub const DEFAULT_POLL_INTERVAL_SECS: f64 = 5.0;
pub const DEFAULT_LOG_LEVEL: &str = "info";

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonSimulationConfig {
    pub current_version: Option<i64>,
    pub start_version: Option<i64>,
    pub log_step: Option<i64>,
    pub contiguous_lag: Option<i64>,
    pub polls_until_exists: Option<u32>,
    pub write_recovery: Option<bool>,
    pub snapshot_end_version: Option<i64>,
    pub transient_read_failures: Option<u32>,
    pub transient_read_error: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawJsonConfig {
    pub backup_dir: Option<String>,
    pub tag: Option<String>,
    pub submit_only: Option<bool>,
    pub restore_only: Option<bool>,
    pub wait_for_backup: Option<bool>,
    pub stop_backup: Option<bool>,
    pub check_begin_version: Option<bool>,
    pub client_id: Option<u32>,
    pub poll_interval_secs: Option<f64>,
    pub timeout_secs: Option<f64>,
    pub log_level: Option<String>,
    pub simulation: Option<JsonSimulationConfig>,
}

/// Knobs for the in-memory cluster the binary runs against.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationConfig {
    pub current_version: i64,
    pub start_version: i64,
    pub log_step: i64,
    pub contiguous_lag: i64,
    pub polls_until_exists: u32,
    pub write_recovery: bool,
    pub snapshot_end_version: Option<i64>,
    /// Reads that fail with a retryable conflict before the store answers.
    pub transient_read_failures: u32,
    /// The retryable error those reads fail with.
    pub transient_read_error: KvError,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            current_version: 1_000,
            start_version: 0,
            log_step: 250,
            contiguous_lag: 100,
            polls_until_exists: 1,
            write_recovery: false,
            snapshot_end_version: None,
            transient_read_failures: 0,
            transient_read_error: KvError::NotCommitted,
        }
    }
}

/// Workload settings. Built once at startup and shared by reference.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadConfig {
    pub backup_dir: Url,
    pub tag: BackupTag,
    pub submit_only: bool,
    pub restore_only: bool,
    pub wait_for_backup: bool,
    pub stop_backup: bool,
    pub check_begin_version: bool,
    pub client_id: u32,
    pub poll_interval: Duration,
    pub timeout: Option<Duration>,
    pub log_level: String,
    pub simulation: SimulationConfig,
}

impl WorkloadConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)?;
        let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)?;
        WorkloadConfig::from_raw(&raw_json_config)
    }

    pub fn from_raw(raw: &RawJsonConfig) -> Result<Self> {
        let backup_dir = Url::parse(raw.backup_dir.as_deref().unwrap_or(DEFAULT_BACKUP_DIR))?;

        let tag = match raw.tag.as_deref() {
            Some(tag) if tag.trim().is_empty() => {
                return Err(AppError::Config("tag cannot be empty in config.json.".into()));
            }
            Some(tag) => BackupTag::new(tag),
            None => BackupTag::default(),
        };

        let poll_interval = parse_seconds(
            "pollIntervalSecs",
            raw.poll_interval_secs.unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
        )?;
        let timeout = raw
            .timeout_secs
            .map(|secs| parse_seconds("timeoutSecs", secs))
            .transpose()?;

        Ok(WorkloadConfig {
            backup_dir,
            tag,
            submit_only: raw.submit_only.unwrap_or(false),
            restore_only: raw.restore_only.unwrap_or(false),
            wait_for_backup: raw.wait_for_backup.unwrap_or(false),
            stop_backup: raw.stop_backup.unwrap_or(false),
            check_begin_version: raw.check_begin_version.unwrap_or(false),
            client_id: raw.client_id.unwrap_or(0),
            poll_interval,
            timeout,
            log_level: raw
                .log_level
                .clone()
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            simulation: parse_simulation(raw.simulation.as_ref())?,
        })
    }
}

fn parse_seconds(field: &str, secs: f64) -> Result<Duration> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(AppError::Config(format!(
            "{field} must be a positive number of seconds, got {secs}"
        )));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| AppError::Config(format!("{field}: {e}")))
}

fn parse_transient_read_error(name: &str) -> Result<KvError> {
    match name {
        "notCommitted" => Ok(KvError::NotCommitted),
        "transactionTooOld" => Ok(KvError::TransactionTooOld),
        "futureVersion" => Ok(KvError::FutureVersion),
        "timedOut" => Ok(KvError::TimedOut),
        other => Err(AppError::Config(format!(
            "simulation.transientReadError must be one of notCommitted, transactionTooOld, \
             futureVersion or timedOut, got '{other}'"
        ))),
    }
}

fn parse_simulation(raw: Option<&JsonSimulationConfig>) -> Result<SimulationConfig> {
    let defaults = SimulationConfig::default();
    let Some(raw) = raw else {
        return Ok(defaults);
    };

    let log_step = raw.log_step.unwrap_or(defaults.log_step);
    if log_step <= 0 {
        return Err(AppError::Config("simulation.logStep must be positive".into()));
    }
    let contiguous_lag = raw.contiguous_lag.unwrap_or(defaults.contiguous_lag);
    if contiguous_lag < 0 {
        return Err(AppError::Config(
            "simulation.contiguousLag cannot be negative".into(),
        ));
    }

    let transient_read_error = match raw.transient_read_error.as_deref() {
        Some(name) => parse_transient_read_error(name)?,
        None => defaults.transient_read_error.clone(),
    };

    Ok(SimulationConfig {
        current_version: raw.current_version.unwrap_or(defaults.current_version),
        start_version: raw.start_version.unwrap_or(defaults.start_version),
        log_step,
        contiguous_lag,
        polls_until_exists: raw.polls_until_exists.unwrap_or(defaults.polls_until_exists),
        write_recovery: raw.write_recovery.unwrap_or(defaults.write_recovery),
        snapshot_end_version: raw.snapshot_end_version.or(defaults.snapshot_end_version),
        transient_read_failures: raw
            .transient_read_failures
            .unwrap_or(defaults.transient_read_failures),
        transient_read_error,
    })
}
