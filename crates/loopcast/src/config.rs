//! Engine configuration.
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration. Values are layered by the binary: file first, then
//! environment and command line.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::buffer::DEFAULT_FLUSH_THRESHOLD;
use crate::controller::{LoopConfig, RetryPolicy};
use crate::output::OutputConfig;
use crate::source::SourceConfig;
use crate::title_sync::TitleSyncConfig;
use crate::transcode::TranscodeConfig;
use crate::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub transcode: TranscodeConfig,
    pub output: OutputConfig,
    pub source: SourceConfig,
    pub engine: EngineSettings,
    pub title_sync: TitleSyncConfig,
}

/// Loop and channel tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Period of the running-time ticker.
    pub status_interval_secs: u64,
    /// Batch size of writes into the output channel.
    pub flush_threshold_bytes: usize,
    /// Bytes the output channel may hold back before reporting not-ready.
    pub channel_high_water_mark: usize,
    /// How long to wait for the output process to open the channel.
    pub channel_open_timeout_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            status_interval_secs: 10,
            flush_threshold_bytes: DEFAULT_FLUSH_THRESHOLD,
            channel_high_water_mark: 4 * DEFAULT_FLUSH_THRESHOLD,
            channel_open_timeout_secs: 30,
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineSettings {
    pub fn loop_config(&self, resume: bool) -> LoopConfig {
        LoopConfig {
            resume,
            status_interval: Duration::from_secs(self.status_interval_secs),
            retry: self.retry.clone(),
        }
    }

    pub fn channel_open_timeout(&self) -> Duration {
        Duration::from_secs(self.channel_open_timeout_secs)
    }
}

impl EngineConfig {
    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let engine = &self.engine;
        if engine.status_interval_secs == 0 {
            return Err(Error::config("engine.status_interval_secs must be positive"));
        }
        if engine.flush_threshold_bytes == 0 {
            return Err(Error::config("engine.flush_threshold_bytes must be positive"));
        }
        if engine.channel_high_water_mark < engine.flush_threshold_bytes {
            return Err(Error::config(
                "engine.channel_high_water_mark must be at least engine.flush_threshold_bytes",
            ));
        }
        if engine.retry.backoff_multiplier < 1.0 {
            return Err(Error::config("engine.retry.backoff_multiplier must be >= 1"));
        }
        if self.source.metadata_concurrency == 0 {
            return Err(Error::config("source.metadata_concurrency must be positive"));
        }
        if self.transcode.frame_rate == 0 || self.transcode.video_bitrate_kbps == 0 {
            return Err(Error::config("transcode frame rate and bitrate must be positive"));
        }
        Ok(())
    }
}
