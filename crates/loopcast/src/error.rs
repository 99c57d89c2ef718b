//! Engine-wide error types.

use std::path::PathBuf;

use process_utils::ExitReport;
use thiserror::Error;

/// Engine-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Engine-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid playlist: {0}")]
    InvalidPlaylist(String),

    #[error("Transcoder failed for {source_id} ({exit})")]
    TranscodeFailure { source_id: String, exit: ExitReport },

    #[error("Source fetch failed for {source_id}: {reason}")]
    SourceFetchFailure { source_id: String, reason: String },

    #[error("Failed to persist status to {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Output channel write failed: {0}")]
    ChannelWrite(#[source] std::io::Error),

    #[error("Output process exited ({0})")]
    OutputProcessExit(ExitReport),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Title update failed: {0}")]
    TitleUpdate(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn invalid_playlist(msg: impl Into<String>) -> Self {
        Self::InvalidPlaylist(msg.into())
    }

    pub fn source_fetch(source_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SourceFetchFailure {
            source_id: source_id.into(),
            reason: reason.into(),
        }
    }

    pub fn spawn(program: impl Into<String>, source: std::io::Error) -> Self {
        Self::Spawn {
            program: program.into(),
            source,
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Whether the error is confined to one playlist entry.
    ///
    /// The loop logs these and moves on; everything else ends the run.
    pub fn is_item_failure(&self) -> bool {
        !matches!(
            self,
            Self::InvalidPlaylist(_)
                | Self::ChannelWrite(_)
                | Self::OutputProcessExit(_)
                | Self::Configuration(_)
        )
    }
}
