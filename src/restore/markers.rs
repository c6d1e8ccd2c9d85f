// incrementalbackup/src/restore/markers.rs
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::agent::{Database, KvError, TransactionOption};
use crate::errors::{AppError, Result};
use crate::types::Version;
use crate::utils::cancellable;

/// Set by the recovery subsystem while a snapshot's write recovery is in progress.
pub const WRITE_RECOVERY_KEY: &[u8] = b"\xff/writeRecovery";
/// Version at which the last snapshot became consistent.
pub const SNAPSHOT_END_VERSION_KEY: &[u8] = b"\xff/snapshotEndVersion";

/// Raw values of both recovery markers as seen by a single transaction attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryMarkers {
    pub write_recovery: Option<Vec<u8>>,
    pub snapshot_end_version: Option<Vec<u8>>,
}

/// Decodes a version stored in the fixed unversioned layout: 8 bytes, little-endian.
pub fn decode_version(raw: &[u8]) -> Result<Version> {
    let bytes: [u8; 8] = raw.try_into().map_err(|_| {
        AppError::MarkerDecode(format!(
            "expected 8 bytes for a version, found {} ({})",
            raw.len(),
            hex::encode(raw)
        ))
    })?;
    Ok(Version(i64::from_le_bytes(bytes)))
}

pub fn encode_version(version: Version) -> [u8; 8] {
    version.0.to_le_bytes()
}

fn display_marker(value: &Option<Vec<u8>>) -> String {
    value.as_deref().map_or_else(|| "N/A".to_string(), hex::encode)
}

/// Reads the recovery markers left behind by a snapshot to find the version a
/// restore may safely begin from.
pub struct RecoveryMarkerReader<'a> {
    database: &'a dyn Database,
}

impl<'a> RecoveryMarkerReader<'a> {
    pub fn new(database: &'a dyn Database) -> Self {
        RecoveryMarkerReader { database }
    }

    /// Fails with `RecoveryMarkerNotFound` if the snapshot never recorded its
    /// end version. Transient transaction errors are retried.
    pub async fn read_begin_version(&self, cancel: &CancellationToken) -> Result<Version> {
        info!("reading recovery markers from system keys");
        let mut tr = self.database.create_transaction();
        loop {
            // Options do not survive a reset, so every attempt sets them again.
            tr.set_option(TransactionOption::AccessSystemKeys);
            tr.set_option(TransactionOption::LockAware);

            let attempt = cancellable(cancel, "reading recovery markers", async {
                let write_recovery = tr.get(WRITE_RECOVERY_KEY).await?;
                let snapshot_end_version = tr.get(SNAPSHOT_END_VERSION_KEY).await?;
                Ok::<_, KvError>(RecoveryMarkers {
                    write_recovery,
                    snapshot_end_version,
                })
            })
            .await?;

            let err = match attempt {
                Ok(markers) => return Self::begin_version_from(markers),
                Err(err) => err,
            };
            warn!(error = %err, "recovery marker read failed");
            cancellable(cancel, "transaction retry", tr.on_error(err)).await??;
        }
    }

    fn begin_version_from(markers: RecoveryMarkers) -> Result<Version> {
        info!(
            write_recovery = %display_marker(&markers.write_recovery),
            snapshot_end_version = %display_marker(&markers.snapshot_end_version),
            "read recovery markers"
        );
        let Some(raw) = markers.snapshot_end_version else {
            error!("snapshot end version marker is missing; the snapshot did not complete");
            return Err(AppError::RecoveryMarkerNotFound(
                String::from_utf8_lossy(SNAPSHOT_END_VERSION_KEY).into_owned(),
            ));
        };
        let version = decode_version(&raw)?;
        info!(begin_version = %version, "derived restore begin version");
        Ok(version)
    }
}
