//! Incremental Backup Workload
//!
//! Submits an incremental backup, waits for its log to cover the current
//! version and optionally restores it from a recovered begin version.

// incrementalbackup/src/main.rs
mod agent;
mod backup;
mod config;
mod errors;
mod restore;
mod types;
mod utils;
mod workload;

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use agent::sim::SimCluster;
use config::WorkloadConfig;
use errors::AppError;
use utils::logging::init_logging;
use workload::WorkloadDriver;

const CONFIG_PATH_ENV: &str = "INCREMENTAL_BACKUP_CONFIG";

/// Main entry point for the workload
#[tokio::main]
async fn main() -> ExitCode {
    match run_app().await {
        Ok(_) => {
            println!("✅ {} workload passed.", WorkloadDriver::NAME);
            ExitCode::SUCCESS
        }
        Err(e) if e.downcast_ref::<AppError>().is_some_and(AppError::is_cancelled) => {
            eprintln!("⏱ Workload cancelled before completion: {:?}", e);
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    dotenv::dotenv().ok();

    // First CLI argument, then the environment, then ./config.json.
    let config_path = env::args()
        .nth(1)
        .or_else(|| env::var(CONFIG_PATH_ENV).ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.json"));
    let config = WorkloadConfig::load_from_json(&config_path).with_context(|| {
        format!(
            "Failed to load workload configuration from {}",
            config_path.display()
        )
    })?;
    init_logging(&config.log_level)?;
    info!(
        config = %config_path.display(),
        backup_dir = %config.backup_dir,
        tag = %config.tag,
        "starting {} workload against the simulated cluster",
        WorkloadDriver::NAME
    );

    let cluster = SimCluster::new(&config.simulation);
    let cancel = CancellationToken::new();
    spawn_cancellation(config.timeout, &cancel);

    let driver = WorkloadDriver::new(&config, &*cluster.agent, &*cluster.database);
    let result = driver.run(&cancel).await;
    // Stops the timeout and signal watcher.
    cancel.cancel();

    let report = result.context("Workload failed")?;
    info!(
        submit = ?report.submit,
        restored_to = ?report.restored_to,
        target_version = ?report.target_version,
        backup_state = ?report.backup_state,
        started_at = %report.started_at,
        "workload finished"
    );
    Ok(())
}

/// Cancels `cancel` on Ctrl-C or once `timeout` elapses.
fn spawn_cancellation(timeout: Option<Duration>, cancel: &CancellationToken) {
    let token = cancel.clone();
    tokio::spawn(async move {
        let deadline = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = token.cancelled() => return,
            _ = deadline => warn!("workload timed out"),
            _ = tokio::signal::ctrl_c() => warn!("interrupted"),
        }
        token.cancel();
    });
}
