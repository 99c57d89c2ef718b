//! # loopcast engine
//!
//! Streams a playlist of remote media items into one continuous output,
//! forever. Each entry is fetched as separate video and audio streams,
//! re-encoded to a uniform format and appended to a single long-lived named
//! pipe that an output process publishes.
//!
//! ## Component Overview
//!
//! - `playlist`: playlist model and elapsed-time to position mapping
//! - `status`: persisted running time used to resume after a restart
//! - `source`: metadata and byte streams per entry (yt-dlp)
//! - `pipeline`: per-entry transcode session
//! - `buffer`: batching and backpressure towards the output channel
//! - `channel`: named-pipe output channel
//! - `controller`: the endless playlist loop and running-time ticker
//! - `output`: the publishing process
//! - `title_sync`: broadcast title updates

pub mod buffer;
pub mod channel;
pub mod config;
pub mod controller;
mod error;
pub mod output;
pub mod pipeline;
pub mod playlist;
mod process;
pub mod source;
pub mod status;
pub mod title_sync;
pub mod transcode;

pub use buffer::{BackpressureBuffer, FlowGate, OutputChannel, SessionStats};
pub use channel::FifoChannel;
pub use config::EngineConfig;
pub use controller::{LoopConfig, LoopState, PlaylistLoop, RetryPolicy};
pub use error::{Error, Result};
pub use output::OutputProcess;
pub use pipeline::{ItemOutcome, ItemPipeline, ItemRunner};
pub use playlist::{Playlist, PlaylistEntry, PlaylistPosition};
pub use process_utils::ExitReport;
pub use source::{SourceProvider, YtDlpProvider, resolve_playlist};
pub use status::{StatusRecord, StatusStore};
pub use title_sync::{TitleSync, TitleUpdater};
