pub mod probe;
pub mod stream;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use loopcast_engine::playlist::read_source_ids;
use loopcast_engine::{Playlist, YtDlpProvider, resolve_playlist};
use tracing::info;

/// Read the playlist file and resolve every entry through `provider`.
async fn load_playlist(
    provider: &YtDlpProvider,
    playlist_path: &Path,
    concurrency: usize,
    skip_unavailable: bool,
) -> Result<Arc<Playlist>> {
    let source_ids = read_source_ids(playlist_path)
        .await
        .with_context(|| format!("Failed to read playlist {}", playlist_path.display()))?;
    info!(path = %playlist_path.display(), entries = source_ids.len(), "Playlist loaded");

    let playlist = resolve_playlist(provider, &source_ids, concurrency, skip_unavailable).await?;
    Ok(Arc::new(playlist))
}

async fn ensure_out_dir(out_dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(out_dir)
        .await
        .with_context(|| format!("Failed to create output directory {}", out_dir.display()))
}
