//! Configuration loading: TOML file first, then environment and flags.

use std::path::Path;

use anyhow::{Context, Result};
use loopcast_engine::EngineConfig;

use crate::cli::StreamArgs;

/// Load the engine configuration from `path`, or defaults when no file is
/// given.
pub fn load(path: Option<&Path>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    parse(&content).with_context(|| format!("Invalid config file {}", path.display()))
}

pub fn parse(content: &str) -> Result<EngineConfig> {
    let config: EngineConfig = toml::from_str(content)?;
    Ok(config)
}

/// Apply `stream` flags and their environment variables on top of the file.
pub fn apply_stream_overrides(config: &mut EngineConfig, args: &StreamArgs) {
    if let Some(url) = &args.rtmp_url {
        config.output.rtmp_url = Some(url.clone());
    }
    if let Some(encoder) = &args.encoder {
        config.transcode.video_encoder = encoder.clone();
    }
    if let Some(client_id) = &args.client_id {
        config.title_sync.client_id = Some(client_id.clone());
    }
    if let Some(client_secret) = &args.client_secret {
        config.title_sync.client_secret = Some(client_secret.clone());
    }
    if let Some(channel_id) = &args.channel_id {
        config.title_sync.channel_id = Some(channel_id.clone());
    }
    if args.no_title_sync {
        config.title_sync.enabled = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::PlaylistArgs;
    use std::path::PathBuf;

    fn stream_args() -> StreamArgs {
        StreamArgs {
            playlist: PlaylistArgs {
                playlist: PathBuf::from("playlist.txt"),
                out_dir: PathBuf::from("./data/"),
            },
            resume: false,
            no_title_sync: false,
            rtmp_url: None,
            encoder: None,
            client_id: None,
            client_secret: None,
            channel_id: None,
        }
    }

    #[test]
    fn empty_file_is_all_defaults() {
        assert_eq!(parse("").unwrap(), EngineConfig::default());
    }

    #[test]
    fn sections_override_defaults() {
        let config = parse(
            r#"
[transcode]
video_encoder = "h264_vaapi"
frame_rate = 60

[output]
rtmp_url = "rtmp://live.example.com/app/key"

[engine]
status_interval_secs = 5

[engine.retry]
max_delay_ms = 10000

[title_sync]
prefix = "[LOOP] "
"#,
        )
        .unwrap();

        assert_eq!(config.transcode.video_encoder, "h264_vaapi");
        assert_eq!(config.transcode.frame_rate, 60);
        assert_eq!(config.transcode.width, 1920);
        assert_eq!(config.output.rtmp_url.as_deref(), Some("rtmp://live.example.com/app/key"));
        assert_eq!(config.engine.status_interval_secs, 5);
        assert_eq!(config.engine.retry.max_delay_ms, 10_000);
        assert_eq!(config.engine.retry.initial_delay_ms, 1000);
        assert_eq!(config.title_sync.prefix, "[LOOP] ");
        assert!(config.title_sync.enabled);
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(parse("[transcode\nwidth = ").is_err());
        assert!(parse("[transcode]\nwidth = \"wide\"").is_err());
    }

    #[test]
    fn flags_win_over_file() {
        let mut config = parse("[output]\nrtmp_url = \"rtmp://file/key\"\n").unwrap();
        let args = StreamArgs {
            rtmp_url: Some("rtmp://flag/key".into()),
            encoder: Some("h264_nvenc".into()),
            channel_id: Some("42".into()),
            no_title_sync: true,
            ..stream_args()
        };

        apply_stream_overrides(&mut config, &args);

        assert_eq!(config.output.rtmp_url.as_deref(), Some("rtmp://flag/key"));
        assert_eq!(config.transcode.video_encoder, "h264_nvenc");
        assert_eq!(config.title_sync.channel_id.as_deref(), Some("42"));
        assert!(!config.title_sync.enabled);
    }

    #[test]
    fn absent_flags_keep_file_values() {
        let mut config = parse("[output]\nrtmp_url = \"rtmp://file/key\"\n").unwrap();
        apply_stream_overrides(&mut config, &stream_args());
        assert_eq!(config.output.rtmp_url.as_deref(), Some("rtmp://file/key"));
    }

    #[test]
    fn load_without_path_uses_defaults() {
        assert_eq!(load(None).unwrap(), EngineConfig::default());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loopcast.toml");
        std::fs::write(&path, "[source]\nmetadata_concurrency = 6\n").unwrap();
        assert_eq!(load(Some(&path)).unwrap().source.metadata_concurrency, 6);
    }
}
