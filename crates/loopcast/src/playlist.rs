//! Playlist model and position accounting.
//!
//! The playlist repeats forever, so a position is always derived from the
//! total elapsed streaming time rather than stored.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// One resolved playlist item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistEntry {
    /// Identifier handed to the source provider (usually a video URL).
    pub source_id: String,
    /// Playback length in milliseconds.
    pub duration_ms: u64,
    /// Human readable title.
    pub title: String,
    /// Uploader or channel name, if the provider knows it.
    pub author: Option<String>,
}

impl PlaylistEntry {
    pub fn new(source_id: impl Into<String>, duration_ms: u64) -> Self {
        let source_id = source_id.into();
        Self {
            title: source_id.clone(),
            source_id,
            duration_ms,
            author: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }
}

/// Where the loop is inside the playlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaylistPosition {
    pub index: usize,
    pub offset_ms: u64,
}

impl PlaylistPosition {
    pub fn new(index: usize, offset_ms: u64) -> Self {
        Self { index, offset_ms }
    }
}

/// Map elapsed streaming time onto a playlist position.
///
/// Elapsed time wraps around whole passes of the playlist. A time exactly on
/// an item boundary belongs to the item that starts there.
pub fn locate(entries: &[PlaylistEntry], elapsed_ms: u64) -> Result<PlaylistPosition> {
    let total = total_duration(entries)?;
    Ok(locate_within(entries, elapsed_ms % total))
}

fn total_duration(entries: &[PlaylistEntry]) -> Result<u64> {
    if entries.is_empty() {
        return Err(Error::invalid_playlist("playlist has no entries"));
    }

    entries.iter().try_fold(0u64, |acc, entry| {
        if entry.duration_ms == 0 {
            return Err(Error::invalid_playlist(format!(
                "entry {} has no duration",
                entry.source_id
            )));
        }
        acc.checked_add(entry.duration_ms)
            .ok_or_else(|| Error::invalid_playlist("total playlist duration overflows"))
    })
}

// `t` must already be reduced modulo the total duration.
fn locate_within(entries: &[PlaylistEntry], t: u64) -> PlaylistPosition {
    let mut start = 0u64;
    for (index, entry) in entries.iter().enumerate() {
        let end = start + entry.duration_ms;
        if t < end {
            return PlaylistPosition::new(index, t - start);
        }
        start = end;
    }
    PlaylistPosition::default()
}

/// A validated, non-empty playlist.
#[derive(Debug, Clone)]
pub struct Playlist {
    entries: Vec<PlaylistEntry>,
    total_ms: u64,
}

impl Playlist {
    /// Validate `entries` and build a playlist.
    ///
    /// Fails with [`Error::InvalidPlaylist`] if the list is empty or any entry
    /// has a zero duration.
    pub fn new(entries: Vec<PlaylistEntry>) -> Result<Self> {
        let total_ms = total_duration(&entries)?;
        Ok(Self { entries, total_ms })
    }

    pub fn entries(&self) -> &[PlaylistEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_ms(&self) -> u64 {
        self.total_ms
    }

    pub fn get(&self, index: usize) -> Option<&PlaylistEntry> {
        self.entries.get(index)
    }

    /// Index of the entry after `index`, wrapping at the end.
    pub fn next_index(&self, index: usize) -> usize {
        (index + 1) % self.entries.len()
    }

    pub fn locate(&self, elapsed_ms: u64) -> PlaylistPosition {
        locate_within(&self.entries, elapsed_ms % self.total_ms)
    }

    /// The entry playing at `elapsed_ms`.
    pub fn current(&self, elapsed_ms: u64) -> &PlaylistEntry {
        &self.entries[self.locate(elapsed_ms).index]
    }
}

impl std::ops::Index<usize> for Playlist {
    type Output = PlaylistEntry;

    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

/// Read source identifiers from a newline-delimited playlist file.
///
/// Blank lines and `#` comments are skipped.
pub async fn read_source_ids(path: &Path) -> Result<Vec<String>> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(parse_source_ids(&content))
}

pub fn parse_source_ids(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

static YOUTUBE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)(?:https?://)?(?:www\.|m\.)?(?:youtube\.com/(?:[^/]+/.+/|(?:v|e(?:mbed)?|shorts)/|.*[?&]v=)|youtu\.be/)([^"&?/\s]{11})"#,
    )
    .expect("valid regex")
});

static BARE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").expect("valid regex"));

/// Stable, filesystem-safe key for a source identifier.
///
/// YouTube URLs and bare video ids map to the 11-character video id so the
/// same video shares one metadata cache file however it was written.
pub fn cache_key(source_id: &str) -> String {
    if let Some(id) = YOUTUBE_ID.captures(source_id).and_then(|c| c.get(1)) {
        return id.as_str().to_string();
    }
    if BARE_ID.is_match(source_id) {
        return source_id.to_string();
    }

    source_id
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn two_items() -> Vec<PlaylistEntry> {
        vec![PlaylistEntry::new("A", 5000), PlaylistEntry::new("B", 3000)]
    }

    #[test]
    fn zero_elapsed_is_start() {
        assert_eq!(
            locate(&two_items(), 0).unwrap(),
            PlaylistPosition::new(0, 0)
        );
    }

    #[test]
    fn mid_second_item() {
        assert_eq!(
            locate(&two_items(), 6000).unwrap(),
            PlaylistPosition::new(1, 1000)
        );
    }

    #[test]
    fn total_duration_wraps_to_start() {
        assert_eq!(
            locate(&two_items(), 8000).unwrap(),
            PlaylistPosition::new(0, 0)
        );
    }

    #[test]
    fn boundary_belongs_to_next_item() {
        assert_eq!(
            locate(&two_items(), 5000).unwrap(),
            PlaylistPosition::new(1, 0)
        );
        assert_eq!(
            locate(&two_items(), 4999).unwrap(),
            PlaylistPosition::new(0, 4999)
        );
    }

    #[test]
    fn huge_elapsed_time_wraps() {
        let elapsed = 8000 * 1_000_000 + 7999;
        assert_eq!(
            locate(&two_items(), elapsed).unwrap(),
            PlaylistPosition::new(1, 2999)
        );
    }

    #[test]
    fn empty_playlist_is_invalid() {
        assert!(matches!(locate(&[], 0), Err(Error::InvalidPlaylist(_))));
        assert!(matches!(Playlist::new(vec![]), Err(Error::InvalidPlaylist(_))));
    }

    #[test]
    fn zero_duration_is_invalid() {
        let entries = vec![PlaylistEntry::new("A", 5000), PlaylistEntry::new("B", 0)];
        assert!(matches!(locate(&entries, 0), Err(Error::InvalidPlaylist(_))));
    }

    #[test]
    fn playlist_helpers() {
        let playlist = Playlist::new(two_items()).unwrap();
        assert_eq!(playlist.total_ms(), 8000);
        assert_eq!(playlist.next_index(0), 1);
        assert_eq!(playlist.next_index(1), 0);
        assert_eq!(playlist.current(5500).source_id, "B");
        assert_eq!(playlist.locate(6000), PlaylistPosition::new(1, 1000));
    }

    #[test]
    fn parse_skips_blank_lines_and_comments() {
        let content = "\nhttps://youtu.be/aaaaaaaaaaa\n\n  # disabled\n  bbbbbbbbbbb  \r\n\n";
        assert_eq!(
            parse_source_ids(content),
            vec!["https://youtu.be/aaaaaaaaaaa", "bbbbbbbbbbb"]
        );
    }

    #[tokio::test]
    async fn read_source_ids_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("playlist.txt");
        tokio::fs::write(&path, "one\n\ntwo\n").await.unwrap();

        assert_eq!(read_source_ids(&path).await.unwrap(), vec!["one", "two"]);
    }

    #[test]
    fn cache_key_extracts_youtube_ids() {
        for url in [
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://youtube.com/watch?feature=share&v=dQw4w9WgXcQ",
            "https://youtu.be/dQw4w9WgXcQ",
            "youtube.com/shorts/dQw4w9WgXcQ",
            "https://www.youtube.com/embed/dQw4w9WgXcQ",
            "dQw4w9WgXcQ",
        ] {
            assert_eq!(cache_key(url), "dQw4w9WgXcQ", "{url}");
        }
    }

    #[test]
    fn cache_key_sanitizes_other_identifiers() {
        assert_eq!(
            cache_key("https://example.com/a b.mp4"),
            "https___example.com_a_b.mp4"
        );
    }

    fn arb_entries() -> impl Strategy<Value = Vec<PlaylistEntry>> {
        prop::collection::vec(1u64..100_000, 1..20).prop_map(|durations| {
            durations
                .into_iter()
                .enumerate()
                .map(|(i, d)| PlaylistEntry::new(format!("item-{i}"), d))
                .collect()
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn prop_zero_is_always_start(entries in arb_entries()) {
            prop_assert_eq!(locate(&entries, 0).unwrap(), PlaylistPosition::new(0, 0));
        }

        #[test]
        fn prop_offset_stays_inside_entry(entries in arb_entries(), elapsed in any::<u64>()) {
            let pos = locate(&entries, elapsed).unwrap();
            prop_assert!(pos.index < entries.len());
            prop_assert!(pos.offset_ms < entries[pos.index].duration_ms);
        }

        #[test]
        fn prop_periodic_over_total(
            entries in arb_entries(),
            elapsed in 0u64..10_000_000,
            passes in 0u64..1000,
        ) {
            let total: u64 = entries.iter().map(|e| e.duration_ms).sum();
            prop_assert_eq!(
                locate(&entries, elapsed).unwrap(),
                locate(&entries, elapsed + passes * total).unwrap()
            );
        }

        #[test]
        fn prop_position_reconstructs_elapsed(entries in arb_entries(), elapsed in any::<u64>()) {
            let total: u64 = entries.iter().map(|e| e.duration_ms).sum();
            let pos = locate(&entries, elapsed).unwrap();
            let before: u64 = entries[..pos.index].iter().map(|e| e.duration_ms).sum();
            prop_assert_eq!(before + pos.offset_ms, elapsed % total);
        }
    }
}
