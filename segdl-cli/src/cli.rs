use clap::Parser;
use std::path::PathBuf;

/// Download an HLS (VOD) playlist and remux it into a single file.
#[derive(Parser, Debug)]
#[command(name = "segdl", author, version, about, long_about = None)]
pub struct Args {
    /// Playlist URL (`.m3u8`, master or media)
    pub url: String,

    /// Output directory (defaults to the configured download path, then the system
    /// download directory)
    #[arg(short = 'o', long = "output-dir")]
    pub output_dir: Option<PathBuf>,

    /// Output file name; `.mp4` is appended when it has no extension
    #[arg(short = 'n', long = "name", default_value = "")]
    pub name: String,

    /// Task id, also used as the working directory name
    #[arg(long)]
    pub id: Option<String>,

    /// Concurrent segment downloads
    #[arg(short = 'c', long)]
    pub concurrency: Option<usize>,

    /// Retries per segment after the first failed attempt
    #[arg(short = 'r', long)]
    pub retries: Option<u32>,

    /// Settings file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Extra request header, e.g. -H "Referer: https://example.com/"
    #[arg(short = 'H', long = "header", value_name = "NAME: VALUE")]
    pub headers: Vec<String>,

    /// ffmpeg binary used for the final remux
    #[arg(long, env = "FFMPEG_PATH")]
    pub ffmpeg: Option<String>,

    /// Root directory for temporary segment storage
    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log errors and hide the progress bar
    #[arg(short, long)]
    pub quiet: bool,
}
