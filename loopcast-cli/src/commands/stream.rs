use std::sync::Arc;

use anyhow::{Context, Result, bail};
use loopcast_engine::output::{OUTPUT_LOG_NAME, STREAM_FIFO_NAME};
use loopcast_engine::{
    BackpressureBuffer, EngineConfig, FifoChannel, ItemPipeline, OutputProcess, PlaylistLoop,
    StatusStore, TitleSync, YtDlpProvider,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{ensure_out_dir, load_playlist};
use crate::cli::StreamArgs;

/// Start the output process and stream the playlist into it until stopped.
pub async fn run(args: StreamArgs, config: EngineConfig, cancel: CancellationToken) -> Result<()> {
    config.validate()?;
    let out_dir = args.playlist.out_dir.as_path();
    ensure_out_dir(out_dir).await?;

    let provider = Arc::new(YtDlpProvider::new(config.source.clone(), out_dir));
    let playlist = load_playlist(
        &provider,
        &args.playlist.playlist,
        config.source.metadata_concurrency,
        config.source.skip_unavailable,
    )
    .await?;

    // Everything started below is torn down with this token.
    let session = cancel.child_token();

    let fifo_path = out_dir.join(STREAM_FIFO_NAME);
    process_utils::ensure_fifo(&fifo_path)
        .with_context(|| format!("Failed to create {}", fifo_path.display()))?;
    let output = OutputProcess::spawn(
        &config.output,
        &fifo_path,
        &out_dir.join(OUTPUT_LOG_NAME),
        session.clone(),
    )?;
    let mut output_exit = output.into_exit();

    let channel = tokio::select! {
        channel = FifoChannel::open(
            &fifo_path,
            config.engine.channel_high_water_mark,
            config.engine.channel_open_timeout(),
        ) => channel.context("Output process never opened the stream pipe")?,
        exit = &mut output_exit => {
            bail!("Output process exited before reading the stream ({})", exit.unwrap_or_default());
        }
        _ = cancel.cancelled() => {
            session.cancel();
            return Ok(());
        }
    };

    let runner = ItemPipeline::new(provider, config.transcode.clone(), out_dir)?;
    let buffer = BackpressureBuffer::with_threshold(channel, config.engine.flush_threshold_bytes);
    let playlist_loop = PlaylistLoop::new(
        Arc::clone(&playlist),
        runner,
        buffer,
        StatusStore::new(out_dir),
        config.engine.loop_config(args.resume),
    )?;

    if config.title_sync.enabled {
        let updater = config.title_sync.build_updater()?;
        let sync = TitleSync::new(
            Arc::clone(&playlist),
            updater,
            config.title_sync.prefix.clone(),
            config.title_sync.interval(),
        );
        let seed_ms = playlist_loop.start_time_ms();
        let token = session.clone();
        tokio::spawn(async move { sync.run(seed_ms, token).await });
    } else {
        info!("Title sync disabled");
    }

    let result = playlist_loop.run(output_exit, session.clone()).await;
    session.cancel();

    match &result {
        Ok(()) => info!("Stream stopped"),
        Err(e) => warn!(error = %e, "Stream ended"),
    }
    Ok(result?)
}
