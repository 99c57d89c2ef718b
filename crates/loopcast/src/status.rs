//! Durable running-time record used to resume the playlist after a restart.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{Error, Result};

/// File name of the status record inside the output directory.
pub const STATUS_FILE_NAME: &str = "status.json";

/// Cumulative streaming time, the only state that survives a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    pub running_time_ms: u64,
}

impl StatusRecord {
    pub fn new(running_time_ms: u64) -> Self {
        Self { running_time_ms }
    }
}

/// On-disk shape, accepting records written by older tooling that stored
/// whole seconds under `runningTime`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStatusRecord {
    running_time_ms: Option<u64>,
    running_time: Option<f64>,
}

impl From<RawStatusRecord> for StatusRecord {
    fn from(raw: RawStatusRecord) -> Self {
        let running_time_ms = match (raw.running_time_ms, raw.running_time) {
            (Some(ms), _) => ms,
            (None, Some(secs)) if secs.is_finite() && secs > 0.0 => (secs * 1000.0) as u64,
            _ => 0,
        };
        Self { running_time_ms }
    }
}

/// Reads and writes the status record of one output directory.
#[derive(Debug, Clone)]
pub struct StatusStore {
    path: PathBuf,
}

impl StatusStore {
    pub fn new(out_dir: impl AsRef<Path>) -> Self {
        Self {
            path: out_dir.as_ref().join(STATUS_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored record.
    ///
    /// Never fails: a missing, unreadable or corrupt file yields the zero
    /// record so a damaged checkpoint restarts the playlist instead of
    /// stopping the stream.
    pub fn read(&self) -> StatusRecord {
        let content = match std::fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No status record, starting from zero");
                return StatusRecord::default();
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Unreadable status record, starting from zero");
                return StatusRecord::default();
            }
        };

        match serde_json::from_slice::<RawStatusRecord>(&content) {
            Ok(raw) => raw.into(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Corrupt status record, starting from zero");
                StatusRecord::default()
            }
        }
    }

    /// Persist `record`, replacing the previous one atomically.
    pub async fn write(&self, record: &StatusRecord) -> Result<()> {
        self.write_inner(record).await.map_err(|source| Error::Persistence {
            path: self.path.clone(),
            source,
        })
    }

    async fn write_inner(&self, record: &StatusRecord) -> std::io::Result<()> {
        let json = serde_json::to_vec(record)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await
    }
}
