//! Fatal queue snapshot
//!
//! Written once when the mirror queue dies. Operators read it to replay or
//! discard the lost work; nothing in the process reads it back.

use super::command::MirrorCommand;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Failure context captured at queue death
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FatalInfo {
    /// The command that exhausted its attempts
    pub failed_command: MirrorCommand,
    /// Every command still waiting when the queue died, in queue order
    pub pending_queue: Vec<MirrorCommand>,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    /// Path the snapshot is written to
    pub log_file: PathBuf,
}

impl FatalInfo {
    /// Build a snapshot whose `log_file` is a timestamped path under `dir`
    pub fn new(
        failed_command: MirrorCommand,
        pending_queue: Vec<MirrorCommand>,
        reason: impl Into<String>,
        dir: &Path,
    ) -> Self {
        let timestamp = Utc::now();
        let file_name = format!(
            "mirror-fatal-{}.json",
            timestamp.format("%Y%m%dT%H%M%S%.3fZ")
        );
        Self {
            failed_command,
            pending_queue,
            reason: reason.into(),
            timestamp,
            log_file: dir.join(file_name),
        }
    }

    /// Write the snapshot as pretty JSON to `log_file`
    ///
    /// Any failure is returned as [`Error::PersistenceFailure`]; callers must not
    /// discard it.
    pub async fn persist(&self) -> Result<PathBuf> {
        let path = self.log_file.clone();
        let failure = |message: String| Error::PersistenceFailure {
            path: path.clone(),
            message,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| failure(format!("cannot create directory: {}", e)))?;
        }

        let body = serde_json::to_vec_pretty(self)
            .map_err(|e| failure(format!("cannot encode snapshot: {}", e)))?;

        tokio::fs::write(&path, body)
            .await
            .map_err(|e| failure(e.to_string()))?;

        info!("Fatal mirror snapshot written to {}", path.display());
        Ok(path)
    }
}
