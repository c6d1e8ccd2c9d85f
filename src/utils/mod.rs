pub mod logging;

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::{BackupAgent, BackupHandle, Database};
use crate::errors::{AppError, Result};
use crate::types::{BackupTag, Version};

/// Runs `fut` unless `cancel` fires first, in which case `fut` is dropped.
pub async fn cancellable<F: Future>(
    cancel: &CancellationToken,
    what: &str,
    fut: F,
) -> Result<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AppError::Cancelled(what.to_string())),
        output = fut => Ok(output),
    }
}

/// Fixed backoff between poll iterations.
pub async fn backoff(cancel: &CancellationToken, interval: Duration) -> Result<()> {
    cancellable(cancel, "backoff", tokio::time::sleep(interval)).await
}

/// Resolves the running backup registered under `tag`.
pub async fn resolve_backup(
    agent: &dyn BackupAgent,
    tag: &BackupTag,
    cancel: &CancellationToken,
) -> Result<BackupHandle> {
    let handle = cancellable(cancel, "resolving backup container", agent.wait_backup(tag)).await??;
    debug!(tag = %tag, uid = %handle.uid, url = %handle.container.url(), "resolved backup container");
    Ok(handle)
}

/// Read version of a fresh transaction, retried through the transaction's retry gate.
pub async fn current_read_version(
    database: &dyn Database,
    cancel: &CancellationToken,
) -> Result<Version> {
    let mut tr = database.create_transaction();
    loop {
        match cancellable(cancel, "reading read version", tr.get_read_version()).await? {
            Ok(version) => return Ok(version),
            Err(err) => {
                warn!(error = %err, "read version attempt failed");
                cancellable(cancel, "transaction retry", tr.on_error(err)).await??;
            }
        }
    }
}
