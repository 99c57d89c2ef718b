//! Per-item pipeline: two source streams in, one transcoded stream out.
//!
//! For every playlist entry the pipeline opens the entry's video and audio
//! streams, pumps each into its session FIFO, runs one transcoder reading both
//! FIFOs and forwards the transcoder's stdout into the shared
//! [`BackpressureBuffer`]. Both pumps observe the session's flow gate.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use process_utils::ExitReport;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::{BackpressureBuffer, FlowPermit, OutputChannel, SessionStats};
use crate::channel::open_fifo_writer;
use crate::playlist::PlaylistEntry;
use crate::process::log_stderr;
use crate::source::{ByteSource, SourceProvider, SourceStreams};
use crate::transcode::TranscodeConfig;
use crate::{Error, Result};

/// Session FIFO the video source is pumped into.
pub const VIDEO_FIFO_NAME: &str = "video.fifo";
/// Session FIFO the audio source is pumped into.
pub const AUDIO_FIFO_NAME: &str = "audio.fifo";

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// How long finished sessions wait for their pumps before aborting them.
const PUMP_SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of one successfully streamed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemOutcome {
    pub stats: SessionStats,
    pub elapsed: Duration,
}

/// Runs one playlist entry into the shared output.
///
/// This is the seam the loop controller drives; tests substitute their own.
#[async_trait]
pub trait ItemRunner<C>: Send
where
    C: OutputChannel + 'static,
{
    async fn run_item(
        &mut self,
        entry: &PlaylistEntry,
        start_offset_ms: u64,
        sink: &mut BackpressureBuffer<C>,
    ) -> Result<ItemOutcome>;
}

/// The production [`ItemRunner`]: source provider, session FIFOs and an
/// ffmpeg transcoder.
pub struct ItemPipeline<P> {
    provider: Arc<P>,
    transcode: TranscodeConfig,
    video_fifo: PathBuf,
    audio_fifo: PathBuf,
}

impl<P: SourceProvider + 'static> ItemPipeline<P> {
    /// Create the pipeline and its session FIFOs under `out_dir`.
    pub fn new(provider: Arc<P>, transcode: TranscodeConfig, out_dir: &Path) -> Result<Self> {
        let video_fifo = out_dir.join(VIDEO_FIFO_NAME);
        let audio_fifo = out_dir.join(AUDIO_FIFO_NAME);
        process_utils::ensure_fifo(&video_fifo)?;
        process_utils::ensure_fifo(&audio_fifo)?;

        Ok(Self {
            provider,
            transcode,
            video_fifo,
            audio_fifo,
        })
    }
}

#[async_trait]
impl<P, C> ItemRunner<C> for ItemPipeline<P>
where
    P: SourceProvider + 'static,
    C: OutputChannel + 'static,
{
    async fn run_item(
        &mut self,
        entry: &PlaylistEntry,
        start_offset_ms: u64,
        sink: &mut BackpressureBuffer<C>,
    ) -> Result<ItemOutcome> {
        let started = Instant::now();
        let source_id = entry.source_id.as_str();

        if start_offset_ms > 0 {
            info!(
                source_id,
                offset_ms = start_offset_ms,
                "Seeking into an entry is not supported, playing from the beginning"
            );
        }

        let SourceStreams { video, audio } = self.provider.open(source_id).await?;
        let gate = sink.start_session();

        let binary = &self.transcode.binary_path;
        let mut child = process_utils::tokio_command(binary)
            .args(self.transcode.build_args(&self.video_fifo, &self.audio_fifo))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::spawn(binary.as_str(), e))?;
        debug!(source_id, pid = child.id(), "Transcoder started");

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(stderr, "transcoder", source_id.to_string()));
        }
        let mut stdout = child.stdout.take().ok_or_else(|| {
            Error::spawn(binary.as_str(), io::Error::other("stdout was not captured"))
        })?;

        let stop = CancellationToken::new();
        // Pumps are detached tasks; release them even if this future is dropped.
        let _stop_on_drop = stop.clone().drop_guard();
        let video_pump = tokio::spawn(pump(
            video,
            self.video_fifo.clone(),
            gate.permit(),
            source_id.to_string(),
            stop.clone(),
        ));
        let audio_pump = tokio::spawn(pump(
            audio,
            self.audio_fifo.clone(),
            gate.permit(),
            source_id.to_string(),
            stop.clone(),
        ));

        let exit = match forward_output(&mut stdout, sink).await {
            Ok(()) => child
                .wait()
                .await
                .map(ExitReport::from_status)
                .map_err(Error::Io),
            Err(e) => {
                let _ = child.kill().await;
                Err(e)
            }
        };

        // Teardown: release pumps still waiting on the transcoder, then push
        // out whatever the buffer still holds.
        stop.cancel();
        let finished = sink.finish().await;
        let video_result = settle(video_pump, "video").await;
        let audio_result = settle(audio_pump, "audio").await;

        let exit = exit?;
        let stats = finished?;

        if exit.success() {
            for result in [video_result, audio_result].into_iter().flatten() {
                if let Err(e) = result {
                    warn!(source_id, error = %e, "Source ended early, transcoder finished anyway");
                }
            }
            let elapsed = started.elapsed();
            info!(
                source_id,
                bytes = stats.bytes_written,
                pauses = stats.pauses,
                elapsed_secs = elapsed.as_secs(),
                "Item finished"
            );
            return Ok(ItemOutcome { stats, elapsed });
        }

        // A broken source usually takes the transcoder down with it; report
        // the cause rather than the symptom.
        for result in [video_result, audio_result].into_iter().flatten() {
            if let Err(e @ Error::SourceFetchFailure { .. }) = result {
                return Err(e);
            }
        }
        Err(Error::TranscodeFailure {
            source_id: source_id.to_string(),
            exit,
        })
    }
}

/// Move transcoder output into the buffer until the transcoder closes stdout.
///
/// While the channel is not ready nothing more is read, which also stalls the
/// transcoder once its stdout pipe fills.
async fn forward_output<R, C>(stdout: &mut R, sink: &mut BackpressureBuffer<C>) -> Result<()>
where
    R: AsyncRead + Unpin,
    C: OutputChannel,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);
    loop {
        if !sink.is_channel_ready() {
            sink.wait_drained().await?;
        }

        buf.reserve(READ_CHUNK_SIZE);
        if stdout.read_buf(&mut buf).await? == 0 {
            return Ok(());
        }
        sink.accept(buf.split().freeze());
        sink.flush_if_ready().await?;
    }
}

enum PumpEnd {
    /// Source exhausted and the FIFO closed.
    Eof(u64),
    /// The transcoder stopped reading.
    ReaderGone(u64),
    /// The session ended before the source did.
    Stopped,
}

/// Copy one source into its session FIFO, honouring the flow gate.
async fn pump(
    mut source: ByteSource,
    fifo: PathBuf,
    mut permit: FlowPermit,
    source_id: String,
    stop: CancellationToken,
) -> Result<u64> {
    let label = source.label();
    let end = tokio::select! {
        _ = stop.cancelled() => Ok(PumpEnd::Stopped),
        end = copy_to_fifo(&mut source, &fifo, &mut permit) => end,
    };

    match end {
        Ok(PumpEnd::Eof(bytes)) => {
            let exit = source.finish().await?;
            if !exit.success() {
                return Err(Error::source_fetch(
                    source_id,
                    format!("{label} source exited with {exit}"),
                ));
            }
            debug!(source_id = %source_id, stream = label, bytes, "Source drained");
            Ok(bytes)
        }
        Ok(PumpEnd::ReaderGone(bytes)) => {
            source.stop().await;
            debug!(source_id = %source_id, stream = label, bytes, "Transcoder closed its input");
            Ok(bytes)
        }
        Ok(PumpEnd::Stopped) => {
            source.stop().await;
            Ok(0)
        }
        Err(PumpError::Source(e)) => {
            source.stop().await;
            Err(Error::source_fetch(
                source_id,
                format!("{label} stream read failed: {e}"),
            ))
        }
        Err(PumpError::Fifo(e)) => {
            source.stop().await;
            Err(Error::Io(e))
        }
    }
}

enum PumpError {
    Source(io::Error),
    Fifo(io::Error),
}

async fn copy_to_fifo(
    source: &mut ByteSource,
    fifo: &Path,
    permit: &mut FlowPermit,
) -> std::result::Result<PumpEnd, PumpError> {
    let mut writer = open_fifo_writer(fifo, None).await.map_err(PumpError::Fifo)?;
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        permit.acquire().await;

        let n = source.read(&mut buf).await.map_err(PumpError::Source)?;
        if n == 0 {
            return Ok(PumpEnd::Eof(total));
        }

        match writer.write_all(&buf[..n]).await {
            Ok(()) => total += n as u64,
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => return Ok(PumpEnd::ReaderGone(total)),
            Err(e) => return Err(PumpError::Fifo(e)),
        }
    }
}

async fn settle(mut handle: JoinHandle<Result<u64>>, stream: &'static str) -> Option<Result<u64>> {
    match tokio::time::timeout(PUMP_SETTLE_TIMEOUT, &mut handle).await {
        Ok(Ok(result)) => Some(result),
        Ok(Err(e)) => {
            warn!(stream, error = %e, "Source pump task failed");
            None
        }
        Err(_) => {
            warn!(stream, "Source pump did not stop, aborting it");
            handle.abort();
            None
        }
    }
}
