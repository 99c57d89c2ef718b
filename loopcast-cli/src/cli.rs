use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "loopcast",
    author,
    version,
    about = "Stream a playlist to an RTMP endpoint around the clock",
    long_about = None
)]
pub struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Stream the playlist forever
    Stream(StreamArgs),

    /// Resolve every playlist entry and print the loop
    Probe(ProbeArgs),
}

/// Options shared by every command that reads a playlist.
#[derive(ClapArgs, Debug, Clone)]
pub struct PlaylistArgs {
    /// Playlist file, one URL or video id per line
    #[arg(short = 'l', long, default_value = "playlist.txt", value_name = "FILE")]
    pub playlist: PathBuf,

    /// Directory for pipes, caches, status and logs
    #[arg(short, long = "out", default_value = "./data/", value_name = "DIR")]
    pub out_dir: PathBuf,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct StreamArgs {
    #[command(flatten)]
    pub playlist: PlaylistArgs,

    /// Continue from the persisted running time
    #[arg(long)]
    pub resume: bool,

    /// Do not update the broadcast title
    #[arg(long)]
    pub no_title_sync: bool,

    /// RTMP ingest URL including the stream key
    #[arg(long, env = "RTMP_URL", hide_env_values = true)]
    pub rtmp_url: Option<String>,

    /// H.264 encoder used for transcoding
    #[arg(long, env = "H264ENCODER")]
    pub encoder: Option<String>,

    /// Twitch application client id
    #[arg(long, env = "CLIENTID", hide_env_values = true)]
    pub client_id: Option<String>,

    /// Twitch application client secret
    #[arg(long, env = "CLIENTSECRET", hide_env_values = true)]
    pub client_secret: Option<String>,

    /// Twitch broadcaster id whose title follows the playlist
    #[arg(long, env = "CHANNELID")]
    pub channel_id: Option<String>,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct ProbeArgs {
    #[command(flatten)]
    pub playlist: PlaylistArgs,

    /// Concurrent metadata lookups
    #[arg(short = 'j', long, value_name = "N")]
    pub concurrency: Option<usize>,
}
