//! The output process: reads the shared FIFO and publishes it over RTMP.

use std::fs::OpenOptions;
use std::path::Path;
use std::process::Stdio;

use process_utils::ExitReport;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::process::spawn_exit_waiter;
use crate::{Error, Result};

/// Shared output channel the engine writes and the output process reads.
pub const STREAM_FIFO_NAME: &str = "stream.fifo";
/// Where the output process's diagnostics are appended.
pub const OUTPUT_LOG_NAME: &str = "ffmpeg.log";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Path to the ffmpeg binary used for publishing.
    pub binary_path: String,
    /// RTMP ingest URL including the stream key.
    pub rtmp_url: Option<String>,
    /// Extra arguments inserted before the output options.
    pub extra_args: Vec<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            binary_path: "ffmpeg".to_string(),
            rtmp_url: None,
            extra_args: Vec::new(),
        }
    }
}

impl OutputConfig {
    /// Arguments for a stream-copy relay from `input` to `rtmp_url`.
    pub fn build_args(&self, input: &Path, rtmp_url: &str) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-nostdin", "-re", "-i"]
            .map(String::from)
            .to_vec();
        args.push(input.to_string_lossy().into_owned());
        args.extend(["-c:v", "copy", "-c:a", "copy"].map(String::from));
        args.extend(self.extra_args.iter().cloned());
        args.extend(["-f".to_string(), "flv".to_string(), rtmp_url.to_string()]);
        args
    }
}

/// A running output process.
///
/// The process is supervised by a background task; [`OutputProcess::into_exit`]
/// resolves once it has ended for any reason.
#[derive(Debug)]
pub struct OutputProcess {
    pid: Option<u32>,
    exit: oneshot::Receiver<ExitReport>,
}

impl OutputProcess {
    /// Start publishing from `fifo_path`, appending stderr to `log_path`.
    ///
    /// Cancelling `cancel` kills the process.
    pub fn spawn(
        config: &OutputConfig,
        fifo_path: &Path,
        log_path: &Path,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let rtmp_url = config
            .rtmp_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| Error::config("no RTMP URL configured (set RTMP_URL)"))?;

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .map_err(|source| Error::Persistence {
                path: log_path.to_path_buf(),
                source,
            })?;

        let child = process_utils::tokio_command(&config.binary_path)
            .args(config.build_args(fifo_path, rtmp_url))
            .stdout(Stdio::null())
            .stderr(Stdio::from(log))
            .spawn()
            .map_err(|e| Error::spawn(config.binary_path.as_str(), e))?;

        let pid = child.id();
        info!(pid, fifo = %fifo_path.display(), log = %log_path.display(), "Output process started");

        Ok(Self {
            pid,
            exit: spawn_exit_waiter(child, "output", cancel),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Receiver that yields the process's exit report.
    pub fn into_exit(self) -> oneshot::Receiver<ExitReport> {
        self.exit
    }
}
