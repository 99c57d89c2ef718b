//! Transcoding stage configuration and ffmpeg output parsing.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Settings for the per-item transcoding process.
///
/// The output must be uniform across items: every item is re-encoded to the
/// same resolution, frame rate and bitrate so the output process can copy the
/// stream without ever renegotiating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeConfig {
    /// Path to the ffmpeg binary.
    pub binary_path: String,
    /// H.264 encoder name (`libx264`, `h264_nvenc`, `h264_vaapi`, ...).
    pub video_encoder: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
    pub audio_sample_rate: u32,
    /// Keyframe interval in frames.
    pub gop_size: u32,
    pub b_frames: u32,
    /// Extra arguments inserted before the output options.
    pub extra_args: Vec<String>,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            binary_path: "ffmpeg".to_string(),
            video_encoder: "libx264".to_string(),
            width: 1920,
            height: 1080,
            frame_rate: 30,
            video_bitrate_kbps: 6000,
            audio_bitrate_kbps: 160,
            audio_sample_rate: 44100,
            gop_size: 60,
            b_frames: 2,
            extra_args: Vec::new(),
        }
    }
}

impl TranscodeConfig {
    /// Build ffmpeg arguments reading the two elementary inputs and writing
    /// one MPEG-TS stream to stdout.
    pub fn build_args(&self, video_input: &Path, audio_input: &Path) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();

        args.extend(["-hide_banner", "-nostdin", "-y"].map(String::from));

        // Keep going on damaged input instead of aborting the item.
        args.extend(["-fflags", "+genpts+discardcorrupt", "-err_detect", "ignore_err"].map(String::from));

        args.extend(["-i".to_string(), video_input.to_string_lossy().into_owned()]);
        args.extend(["-i".to_string(), audio_input.to_string_lossy().into_owned()]);
        args.extend(["-map", "0:v:0", "-map", "1:a:0"].map(String::from));

        args.extend(["-c:v".to_string(), self.video_encoder.clone()]);
        if self.video_encoder == "libx264" {
            args.extend(["-preset", "veryfast"].map(String::from));
        }

        let bitrate = format!("{}k", self.video_bitrate_kbps);
        args.extend([
            "-vf".to_string(),
            format!("scale={}:{}", self.width, self.height),
            "-r".to_string(),
            self.frame_rate.to_string(),
            "-fps_mode".to_string(),
            "cfr".to_string(),
            "-b:v".to_string(),
            bitrate.clone(),
            "-maxrate".to_string(),
            bitrate.clone(),
            "-minrate".to_string(),
            bitrate,
            "-bufsize".to_string(),
            format!("{}k", self.video_bitrate_kbps.saturating_mul(2)),
            "-g".to_string(),
            self.gop_size.to_string(),
            "-bf".to_string(),
            self.b_frames.to_string(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
        ]);

        args.extend([
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            format!("{}k", self.audio_bitrate_kbps),
            "-ar".to_string(),
            self.audio_sample_rate.to_string(),
        ]);

        args.extend(self.extra_args.iter().cloned());

        args.extend(["-f", "mpegts", "pipe:1"].map(String::from));
        args
    }
}

/// One ffmpeg progress report.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Progress {
    /// Media time encoded so far.
    pub time_secs: f64,
    /// Encoding speed relative to real time.
    pub speed: f64,
}

/// Media time from an ffmpeg clock value (`HH:MM:SS.ss`).
///
/// `N/A` and negative clocks, which ffmpeg prints before the first
/// timestamp, yield `None`.
pub fn parse_clock(value: &str) -> Option<f64> {
    let mut parts = value.splitn(3, ':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if minutes >= 60 || !(0.0..60.0).contains(&seconds) {
        return None;
    }
    Some((hours * 3600 + minutes * 60) as f64 + seconds)
}

/// `key=value` pairs of an ffmpeg status line.
///
/// ffmpeg pads values after the `=` (`frame=  100`), so a value is the next
/// run of non-blank characters.
fn status_fields(line: &str) -> impl Iterator<Item = (&str, &str)> {
    let mut rest = line;
    std::iter::from_fn(move || {
        let eq = rest.find('=')?;
        let key = rest[..eq].rsplit(char::is_whitespace).next().unwrap_or("");
        let after = rest[eq + 1..].trim_start();
        let end = after.find(char::is_whitespace).unwrap_or(after.len());
        rest = &after[end..];
        Some((key, &after[..end]))
    })
}

/// Parse an ffmpeg status line
/// (`frame=.. fps=.. size=.. time=HH:MM:SS.ss bitrate=.. speed=..x`).
pub fn parse_progress(line: &str) -> Option<Progress> {
    let mut time = None;
    let mut speed = None;
    let mut is_status = false;
    for (key, value) in status_fields(line) {
        match key {
            "frame" | "size" => is_status = true,
            "time" => time = Some(parse_clock(value)),
            "speed" => speed = value.strip_suffix('x').and_then(|v| v.parse().ok()),
            _ => {}
        }
    }

    // Status lines always carry a time field, even if it is `N/A`.
    let time = time.filter(|_| is_status)?;
    Some(Progress {
        time_secs: time.unwrap_or(0.0),
        speed: speed.unwrap_or(0.0),
    })
}
