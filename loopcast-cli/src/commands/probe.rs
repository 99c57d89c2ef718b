use anyhow::Result;
use loopcast_engine::{EngineConfig, Playlist, YtDlpProvider};

use super::{ensure_out_dir, load_playlist};
use crate::cli::ProbeArgs;

/// Resolve every entry (warming the metadata cache) and print the loop.
pub async fn run(args: ProbeArgs, config: EngineConfig) -> Result<()> {
    let out_dir = &args.playlist.out_dir;
    ensure_out_dir(out_dir).await?;

    let concurrency = args
        .concurrency
        .unwrap_or(config.source.metadata_concurrency)
        .max(1);
    let skip_unavailable = config.source.skip_unavailable;
    let provider = YtDlpProvider::new(config.source, out_dir);
    let playlist = load_playlist(
        &provider,
        &args.playlist.playlist,
        concurrency,
        skip_unavailable,
    )
    .await?;

    print!("{}", render(&playlist));
    Ok(())
}

fn render(playlist: &Playlist) -> String {
    let mut out = String::new();
    let mut start_ms = 0;
    for (index, entry) in playlist.entries().iter().enumerate() {
        let author = entry.author.as_deref().unwrap_or("-");
        out.push_str(&format!(
            "{:>3}  {:>9}  {:>9}  {} ({})  [{}]\n",
            index + 1,
            format_duration(start_ms),
            format_duration(entry.duration_ms),
            entry.title,
            author,
            entry.source_id,
        ));
        start_ms += entry.duration_ms;
    }
    out.push_str(&format!(
        "{} entries, loop length {}\n",
        playlist.len(),
        format_duration(playlist.total_ms())
    ));
    out
}

/// `H:MM:SS`, or `M:SS` below one hour.
fn format_duration(ms: u64) -> String {
    let secs = ms / 1000;
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopcast_engine::PlaylistEntry;

    #[test]
    fn durations() {
        assert_eq!(format_duration(0), "0:00");
        assert_eq!(format_duration(61_999), "1:01");
        assert_eq!(format_duration(3_600_000), "1:00:00");
        assert_eq!(format_duration(86_399_000), "23:59:59");
    }

    #[test]
    fn render_lists_start_times_and_total() {
        let playlist = Playlist::new(vec![
            PlaylistEntry::new("aaaaaaaaaaa", 212_000)
                .with_title("First")
                .with_author("Someone"),
            PlaylistEntry::new("bbbbbbbbbbb", 3_700_000).with_title("Second"),
        ])
        .unwrap();

        let text = render(&playlist);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("0:00") && lines[0].contains("First (Someone)"));
        assert!(lines[1].contains("3:32") && lines[1].contains("1:01:40"));
        assert!(lines[1].contains("Second (-)  [bbbbbbbbbbb]"));
        assert_eq!(lines[2], "2 entries, loop length 1:05:12");
    }
}
