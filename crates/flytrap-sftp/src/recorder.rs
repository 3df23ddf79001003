//! Credential and activity recorder
//!
//! Requests never touch the disk. They append to two in-memory buffers and a
//! single background task persists both on a fixed cadence, so a flood of
//! requests cannot turn into a flood of disk writes.

use std::ffi::OsString;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::config::TelemetryConfig;
use crate::records::{ActivityRecord, IdentityRecord, IdentityTable};
use crate::{Error, Result};

/// What one flush persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    /// Activity lines appended to the log
    pub activity_written: usize,
    /// Identity records in the snapshot, `None` if the snapshot write failed
    pub identities: Option<usize>,
}

/// Buffers telemetry in memory and persists it on demand
pub struct Recorder {
    activity: Mutex<Vec<ActivityRecord>>,
    identities: Mutex<IdentityTable>,
    activity_log: PathBuf,
    identity_log: PathBuf,
}

impl Recorder {
    /// Create a recorder writing to the configured telemetry paths
    pub fn new(telemetry: &TelemetryConfig) -> Self {
        Self::with_paths(&telemetry.activity_log, &telemetry.identity_log)
    }

    pub fn with_paths(activity_log: impl Into<PathBuf>, identity_log: impl Into<PathBuf>) -> Self {
        Self {
            activity: Mutex::new(Vec::new()),
            identities: Mutex::new(IdentityTable::new()),
            activity_log: activity_log.into(),
            identity_log: identity_log.into(),
        }
    }

    /// Queue one activity record
    pub async fn record_activity(&self, ip: &str, user: &str, action: impl Into<String>) {
        let record = ActivityRecord::new(ip, user, action);
        record.log();
        self.activity.lock().await.push(record);
    }

    /// Fold one login attempt into the identity table
    pub async fn record_login(&self, ip: &str, user: &str, password: &str) {
        let first_seen = self.identities.lock().await.observe(ip, user, password);
        if first_seen {
            debug!(event = "identity_created", client_ip = ip, username = user, "New identity");
        }
    }

    /// Number of activity records waiting for the next flush
    pub async fn pending_activity(&self) -> usize {
        self.activity.lock().await.len()
    }

    /// Copy of one identity record
    pub async fn identity(&self, ip: &str, user: &str) -> Option<IdentityRecord> {
        self.identities.lock().await.get(ip, user).cloned()
    }

    /// Copy of the whole identity table
    pub async fn identities(&self) -> Vec<IdentityRecord> {
        self.identities.lock().await.records().to_vec()
    }

    /// Persist both buffers
    ///
    /// The activity buffer is appended to the log and cleared only once the
    /// write has succeeded. The identity snapshot is rewritten in full.
    ///
    /// # Errors
    ///
    /// `Error::Telemetry` when the activity log cannot be opened or written.
    /// Snapshot failures are logged and reported through
    /// [`FlushReport::identities`] instead.
    pub async fn flush(&self) -> Result<FlushReport> {
        let activity_written = self.flush_activity().await?;

        let identities = match self.write_identity_snapshot().await {
            Ok(count) => Some(count),
            Err(e) => {
                warn!(
                    event = "identity_snapshot_failed",
                    path = %self.identity_log.display(),
                    error = %e,
                    "Failed to write identity snapshot, retrying next flush"
                );
                None
            }
        };

        Ok(FlushReport {
            activity_written,
            identities,
        })
    }

    /// Flush on a fixed cadence until `shutdown` resolves, then flush once more
    ///
    /// Shutdown is only observed between flushes; a flush in progress always
    /// completes, so the final flush never races a periodic one.
    ///
    /// # Errors
    ///
    /// Returns as soon as an activity log write fails.
    pub async fn run(
        self: Arc<Self>,
        period: Duration,
        shutdown: impl Future<Output = ()> + Send,
    ) -> Result<FlushReport> {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = ticker.tick() => {}
            }

            let report = self.flush().await?;
            if report.activity_written > 0 {
                debug!(
                    event = "telemetry_flushed",
                    activity_written = report.activity_written,
                    identities = ?report.identities,
                    "Telemetry flushed"
                );
            }
        }

        self.flush().await
    }

    async fn flush_activity(&self) -> Result<usize> {
        let path = &self.activity_log;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| telemetry_error("open", path, &e))?;

        let mut activity = self.activity.lock().await;
        if activity.is_empty() {
            return Ok(0);
        }

        let mut batch = String::new();
        for record in activity.iter() {
            batch.push_str(&record.to_line());
            batch.push('\n');
        }

        file.write_all(batch.as_bytes())
            .await
            .map_err(|e| telemetry_error("append to", path, &e))?;
        file.flush()
            .await
            .map_err(|e| telemetry_error("flush", path, &e))?;
        file.sync_data()
            .await
            .map_err(|e| telemetry_error("sync", path, &e))?;

        let written = activity.len();
        activity.clear();
        Ok(written)
    }

    async fn write_identity_snapshot(&self) -> Result<usize> {
        let (json, count) = {
            let table = self.identities.lock().await;
            (table.to_json_pretty()?, table.len())
        };

        let tmp = temp_path(&self.identity_log);
        fs::write(&tmp, json.as_bytes()).await?;
        fs::rename(&tmp, &self.identity_log).await?;
        Ok(count)
    }
}

fn telemetry_error(action: &str, path: &Path, err: &std::io::Error) -> Error {
    Error::telemetry(format!("cannot {} {}: {}", action, path.display(), err))
}

fn temp_path(path: &Path) -> PathBuf {
    let mut tmp = OsString::from(path.as_os_str());
    tmp.push(".tmp");
    PathBuf::from(tmp)
}
