//! Source provider: metadata lookup and video/audio byte streams per entry.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use process_utils::ExitReport;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::process::Child;
use tracing::{debug, info, warn};

use crate::playlist::{Playlist, PlaylistEntry, cache_key};
use crate::process::log_stderr;
use crate::{Error, Result};

/// Metadata of one source, as cached between runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMetadata {
    pub source_id: String,
    pub title: String,
    pub author: Option<String>,
    pub duration_ms: u64,
}

impl SourceMetadata {
    pub fn into_entry(self) -> PlaylistEntry {
        PlaylistEntry {
            source_id: self.source_id,
            duration_ms: self.duration_ms,
            title: self.title,
            author: self.author,
        }
    }
}

/// One elementary byte stream, optionally backed by a child process.
pub struct ByteSource {
    label: &'static str,
    reader: Box<dyn AsyncRead + Send + Unpin>,
    process: Option<Child>,
}

impl ByteSource {
    pub fn from_reader(label: &'static str, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            label,
            reader: Box::new(reader),
            process: None,
        }
    }

    pub fn from_process(
        label: &'static str,
        stdout: impl AsyncRead + Send + Unpin + 'static,
        child: Child,
    ) -> Self {
        Self {
            label,
            reader: Box::new(stdout),
            process: Some(child),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Wait for the backing process after the stream hit EOF.
    ///
    /// Sources without a process always report success.
    pub async fn finish(&mut self) -> io::Result<ExitReport> {
        match self.process.as_mut() {
            Some(child) => Ok(ExitReport::from_status(child.wait().await?)),
            None => Ok(ExitReport::exited(0)),
        }
    }

    /// Stop the backing process, if any.
    pub async fn stop(&mut self) {
        if let Some(child) = self.process.as_mut() {
            let _ = child.kill().await;
        }
    }
}

impl AsyncRead for ByteSource {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

/// The two byte streams one playlist entry is made of.
pub struct SourceStreams {
    pub video: ByteSource,
    pub audio: ByteSource,
}

/// Resolves source identifiers into metadata and byte streams.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Title, author and duration of `source_id`.
    async fn metadata(&self, source_id: &str) -> Result<SourceMetadata>;

    /// Open the video-only and audio-only streams of `source_id`.
    async fn open(&self, source_id: &str) -> Result<SourceStreams>;
}

/// Resolve every identifier into a playlist entry, keeping playlist order.
///
/// An entry whose metadata cannot be fetched, or that has no duration, makes
/// the whole playlist invalid. Entry indices must be stable between runs for
/// a persisted running time to resume into the same item, so dropping entries
/// is only done when `skip_unavailable` is set.
pub async fn resolve_playlist<P>(
    provider: &P,
    source_ids: &[String],
    concurrency: usize,
    skip_unavailable: bool,
) -> Result<Playlist>
where
    P: SourceProvider + ?Sized,
{
    let mut results = stream::iter(source_ids)
        .map(|id| async move { (id, provider.metadata(id).await) })
        .buffered(concurrency.max(1));

    let mut entries = Vec::with_capacity(source_ids.len());
    while let Some((id, result)) = results.next().await {
        let reason = match result {
            Ok(meta) if meta.duration_ms > 0 => {
                entries.push(meta.into_entry());
                continue;
            }
            Ok(_) => "entry has no duration".to_string(),
            Err(e) => e.to_string(),
        };
        if !skip_unavailable {
            return Err(Error::invalid_playlist(format!("{id}: {reason}")));
        }
        warn!(source_id = %id, %reason, "Skipping unavailable entry");
    }

    if entries.is_empty() {
        return Err(Error::invalid_playlist("no playable entries"));
    }
    let playlist = Playlist::new(entries)?;
    info!(
        entries = playlist.len(),
        skipped = source_ids.len() - playlist.len(),
        total_secs = playlist.total_ms() / 1000,
        "Playlist resolved"
    );
    Ok(playlist)
}

/// Settings for the yt-dlp backed provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Path to the yt-dlp binary.
    pub binary_path: String,
    /// Format selector for the video-only stream.
    pub video_format: String,
    /// Format selector for the audio-only stream.
    pub audio_format: String,
    /// Range request size, so long downloads resume in chunks.
    pub http_chunk_size: String,
    /// How many metadata lookups run at once.
    pub metadata_concurrency: usize,
    /// Extra arguments passed to every invocation.
    pub extra_args: Vec<String>,
    /// Drop entries whose metadata is unavailable instead of refusing the
    /// playlist. Shifts the indices of later entries.
    pub skip_unavailable: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            binary_path: "yt-dlp".to_string(),
            video_format: "bestvideo[height<=1080]/bestvideo".to_string(),
            audio_format: "bestaudio".to_string(),
            http_chunk_size: "1M".to_string(),
            metadata_concurrency: 3,
            extra_args: Vec::new(),
            skip_unavailable: false,
        }
    }
}

/// Subset of `yt-dlp --dump-json` output the engine needs.
#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    title: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    duration: Option<f64>,
}

/// Source provider backed by the `yt-dlp` command line tool.
///
/// Metadata is memoised per run and on disk as `<cache_dir>/<key>_info.json`.
pub struct YtDlpProvider {
    config: SourceConfig,
    cache_dir: PathBuf,
    cache: Mutex<HashMap<String, SourceMetadata>>,
}

impl YtDlpProvider {
    pub fn new(config: SourceConfig, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            cache_dir: cache_dir.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cache_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{key}_info.json"))
    }

    async fn read_cached(path: &Path) -> Option<SourceMetadata> {
        let content = tokio::fs::read(path).await.ok()?;
        match serde_json::from_slice(&content) {
            Ok(meta) => Some(meta),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring corrupt metadata cache");
                None
            }
        }
    }

    async fn fetch_metadata(&self, source_id: &str) -> Result<SourceMetadata> {
        debug!(source_id, "Fetching metadata");
        let output = process_utils::tokio_command(&self.config.binary_path)
            .args(["--dump-json", "--no-download", "--no-warnings", "--no-playlist"])
            .args(&self.config.extra_args)
            .arg(source_id)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::source_fetch(source_id, format!("failed to run {}: {e}", self.config.binary_path)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("no diagnostic output")
                .trim()
                .to_string();
            return Err(Error::source_fetch(
                source_id,
                format!("{} ({reason})", ExitReport::from_status(output.status)),
            ));
        }

        let info: YtDlpInfo = serde_json::from_slice(&output.stdout)
            .map_err(|e| Error::source_fetch(source_id, format!("unparsable metadata: {e}")))?;

        let duration_ms = match info.duration {
            Some(secs) if secs.is_finite() && secs > 0.0 => (secs * 1000.0).round() as u64,
            _ => return Err(Error::source_fetch(source_id, "source has no duration")),
        };

        Ok(SourceMetadata {
            source_id: source_id.to_string(),
            title: info.title.unwrap_or_else(|| source_id.to_string()),
            author: info.uploader.or(info.channel),
            duration_ms,
        })
    }

    fn spawn_stream(&self, source_id: &str, format: &str, label: &'static str) -> Result<ByteSource> {
        let mut child = process_utils::tokio_command(&self.config.binary_path)
            .args(["--quiet", "--no-warnings", "--no-playlist", "--no-part"])
            .args(["-f", format])
            .args(["--http-chunk-size", &self.config.http_chunk_size])
            .args(["-o", "-"])
            .args(&self.config.extra_args)
            .arg(source_id)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::source_fetch(source_id, format!("failed to spawn {}: {e}", self.config.binary_path)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::source_fetch(source_id, "failed to capture stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(stderr, label, source_id.to_string()));
        }

        Ok(ByteSource::from_process(label, stdout, child))
    }
}

#[async_trait]
impl SourceProvider for YtDlpProvider {
    async fn metadata(&self, source_id: &str) -> Result<SourceMetadata> {
        let key = cache_key(source_id);
        if let Some(meta) = self.cache.lock().get(&key).cloned() {
            return Ok(meta);
        }

        let path = self.cache_path(&key);
        let meta = match Self::read_cached(&path).await {
            Some(meta) => meta,
            None => {
                let meta = self.fetch_metadata(source_id).await?;
                match serde_json::to_vec_pretty(&meta) {
                    Ok(json) => {
                        if let Err(e) = tokio::fs::write(&path, json).await {
                            warn!(path = %path.display(), error = %e, "Failed to write metadata cache");
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to encode metadata cache"),
                }
                meta
            }
        };

        self.cache.lock().insert(key, meta.clone());
        Ok(meta)
    }

    async fn open(&self, source_id: &str) -> Result<SourceStreams> {
        let video = self.spawn_stream(source_id, &self.config.video_format, "video")?;
        let audio = self.spawn_stream(source_id, &self.config.audio_format, "audio")?;
        Ok(SourceStreams { video, audio })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tokio::io::AsyncReadExt;

    /// Writes a stand-in for yt-dlp that logs its invocations.
    fn fake_ytdlp(dir: &Path) -> PathBuf {
        let script = dir.join("fake-yt-dlp");
        let log = dir.join("calls.log");
        let body = format!(
            r#"#!/bin/sh
echo "$@" >> "{log}"
for last; do :; done
case "$*" in
  *--dump-json*)
    case "$last" in
      *broken*) echo "ERROR: Video unavailable" >&2; exit 1 ;;
      *live*) echo '{{"title": "Live now", "duration": null}}' ;;
      *) echo '{{"title": "Title of '"$last"'", "uploader": "Someone", "duration": 212.5, "view_count": 10}}' ;;
    esac ;;
  *bestaudio*) printf 'AUDIO:%s' "$last" ;;
  *) printf 'VIDEO:%s' "$last" ;;
esac
"#,
            log = log.display()
        );
        std::fs::write(&script, body).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    fn provider(dir: &Path) -> YtDlpProvider {
        let config = SourceConfig {
            binary_path: fake_ytdlp(dir).to_string_lossy().into_owned(),
            ..Default::default()
        };
        YtDlpProvider::new(config, dir)
    }

    fn call_count(dir: &Path) -> usize {
        std::fs::read_to_string(dir.join("calls.log"))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn metadata_is_fetched_once_and_cached() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider(dir.path());

        let meta = provider.metadata("https://youtu.be/aaaaaaaaaaa").await.unwrap();
        assert_eq!(meta.title, "Title of https://youtu.be/aaaaaaaaaaa");
        assert_eq!(meta.author.as_deref(), Some("Someone"));
        assert_eq!(meta.duration_ms, 212_500);

        // Same video written differently hits the in-memory cache.
        provider.metadata("aaaaaaaaaaa").await.unwrap();
        assert_eq!(call_count(dir.path()), 1);
        assert!(dir.path().join("aaaaaaaaaaa_info.json").exists());

        // A fresh provider reads the disk cache.
        let second = self::provider(dir.path());
        let cached = second.metadata("https://youtu.be/aaaaaaaaaaa").await.unwrap();
        assert_eq!(cached, meta);
        assert_eq!(call_count(dir.path()), 1);
    }

    #[tokio::test]
    async fn failed_lookup_is_a_source_fetch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider(dir.path());

        let err = provider.metadata("broken-video").await.unwrap_err();
        match err {
            Error::SourceFetchFailure { source_id, reason } => {
                assert_eq!(source_id, "broken-video");
                assert!(reason.contains("Video unavailable"), "{reason}");
            }
            other => panic!("unexpected error: {other}"),
        }

        let err = provider.metadata("live-stream").await.unwrap_err();
        assert!(matches!(err, Error::SourceFetchFailure { .. }));
    }

    #[tokio::test]
    async fn missing_binary_is_a_source_fetch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = SourceConfig {
            binary_path: dir.path().join("nope").to_string_lossy().into_owned(),
            ..Default::default()
        };
        let provider = YtDlpProvider::new(config, dir.path());

        assert!(matches!(
            provider.metadata("x").await,
            Err(Error::SourceFetchFailure { .. })
        ));
        assert!(matches!(
            provider.open("x").await,
            Err(Error::SourceFetchFailure { .. })
        ));
    }

    #[tokio::test]
    async fn open_yields_separate_video_and_audio_streams() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider(dir.path());

        let mut streams = provider.open("clip").await.unwrap();
        let mut video = String::new();
        streams.video.read_to_string(&mut video).await.unwrap();
        let mut audio = String::new();
        streams.audio.read_to_string(&mut audio).await.unwrap();

        assert_eq!(video, "VIDEO:clip");
        assert_eq!(audio, "AUDIO:clip");
        assert!(streams.video.finish().await.unwrap().success());
        assert!(streams.audio.finish().await.unwrap().success());
    }

    /// Provider answering metadata from a fixed table.
    struct TableProvider(HashMap<&'static str, u64>);

    #[async_trait]
    impl SourceProvider for TableProvider {
        async fn metadata(&self, source_id: &str) -> Result<SourceMetadata> {
            let duration_ms = *self
                .0
                .get(source_id)
                .ok_or_else(|| Error::source_fetch(source_id, "Video unavailable"))?;
            Ok(SourceMetadata {
                source_id: source_id.to_string(),
                title: source_id.to_uppercase(),
                author: None,
                duration_ms,
            })
        }

        async fn open(&self, source_id: &str) -> Result<SourceStreams> {
            Err(Error::source_fetch(source_id, "not streamable"))
        }
    }

    fn table() -> TableProvider {
        TableProvider(HashMap::from([("a", 4_000), ("b", 6_000), ("zero", 0)]))
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn resolve_keeps_playlist_order() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider(dir.path());

        let playlist = resolve_playlist(&provider, &ids(&["first", "second", "third"]), 2, false)
            .await
            .unwrap();
        let resolved: Vec<_> = playlist.entries().iter().map(|e| e.source_id.as_str()).collect();
        assert_eq!(resolved, vec!["first", "second", "third"]);
        assert_eq!(playlist.total_ms(), 3 * 212_500);
    }

    #[tokio::test]
    async fn zero_duration_entry_rejects_the_playlist() {
        let err = resolve_playlist(&table(), &ids(&["a", "zero", "b"]), 2, false)
            .await
            .unwrap_err();
        match err {
            Error::InvalidPlaylist(msg) => assert!(msg.contains("zero"), "{msg}"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unavailable_entry_rejects_the_playlist() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider(dir.path());

        let err = resolve_playlist(&provider, &ids(&["first", "broken-one", "second"]), 1, false)
            .await
            .unwrap_err();
        match err {
            Error::InvalidPlaylist(msg) => {
                assert!(msg.contains("broken-one"), "{msg}");
                assert!(msg.contains("Video unavailable"), "{msg}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn skipping_is_opt_in() {
        let playlist = resolve_playlist(&table(), &ids(&["a", "zero", "missing", "b"]), 3, true)
            .await
            .unwrap();
        let resolved: Vec<_> = playlist.entries().iter().map(|e| e.source_id.as_str()).collect();
        assert_eq!(resolved, vec!["a", "b"]);
        assert_eq!(playlist.total_ms(), 10_000);

        assert!(matches!(
            resolve_playlist(&table(), &ids(&["zero", "missing"]), 1, true).await,
            Err(Error::InvalidPlaylist(_))
        ));
    }

    #[test]
    fn skipping_is_off_by_default() {
        assert!(!SourceConfig::default().skip_unavailable);
    }
}
