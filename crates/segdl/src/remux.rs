//! Segment concatenation through an external ffmpeg process.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{DownloadError, Result};

/// Name of the concat demuxer list written next to the segments.
pub const CONCAT_LIST_NAME: &str = "concat.txt";

/// Progress callback receiving a merge percentage in `0..=100`.
pub type RemuxProgress<'a> = &'a (dyn Fn(u8) + Send + Sync);

/// Joins a directory of ordered segment files into one output container.
#[async_trait]
pub trait Remuxer: Send + Sync {
    /// Concatenates every segment file in `segments_dir` into `output`.
    ///
    /// `expected_duration` (seconds) lets implementations report meaningful progress.
    async fn remux(
        &self,
        segments_dir: &Path,
        output: &Path,
        expected_duration: Option<f64>,
        progress: Option<RemuxProgress<'_>>,
    ) -> Result<()>;
}

/// Parses the ordinal out of a `segment_NNNNNN.ts` file name.
fn segment_ordinal(name: &str) -> Option<usize> {
    name.strip_prefix("segment_")?
        .strip_suffix(".ts")?
        .parse()
        .ok()
}

/// Lists the segment files of `dir` sorted by ordinal.
pub async fn collect_segments(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await.map_err(|e| {
        DownloadError::merge(format!("segment directory {} unreadable: {e}", dir.display()))
    })?;

    let mut segments = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if let Some(ordinal) = name.to_str().and_then(segment_ordinal) {
            segments.push((ordinal, entry.path()));
        }
    }

    if segments.is_empty() {
        return Err(DownloadError::merge(format!(
            "no segment files in {}",
            dir.display()
        )));
    }

    segments.sort_by_key(|(ordinal, _)| *ordinal);
    Ok(segments.into_iter().map(|(_, path)| path).collect())
}

/// Renders the concat demuxer list for `segments`.
pub fn concat_list(segments: &[PathBuf]) -> String {
    segments
        .iter()
        .map(|path| {
            let escaped = path.to_string_lossy().replace('\'', r"'\''");
            format!("file '{escaped}'\n")
        })
        .collect()
}

/// Maps one `-progress` key=value line to a merge percentage.
pub fn parse_progress_line(line: &str, expected_duration: Option<f64>) -> Option<u8> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        "progress" if value == "end" => Some(100),
        // ffmpeg reports out_time_ms in microseconds as well.
        "out_time_us" | "out_time_ms" => {
            let total = expected_duration.filter(|d| *d > 0.0)?;
            let micros: f64 = value.parse().ok()?;
            let percent = (micros / 1_000_000.0 / total * 100.0).clamp(0.0, 100.0);
            Some(percent.floor() as u8)
        }
        _ => None,
    }
}

/// Lossless concatenation with the ffmpeg concat demuxer.
#[derive(Debug, Clone)]
pub struct FfmpegRemuxer {
    ffmpeg_path: String,
}

impl FfmpegRemuxer {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    pub fn ffmpeg_path(&self) -> &str {
        &self.ffmpeg_path
    }

    fn build_args(list: &Path, output: &Path) -> Vec<String> {
        let mut args: Vec<String> = ["-y", "-hide_banner", "-nostats", "-loglevel", "error"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.extend(["-progress".to_string(), "pipe:1".to_string()]);
        args.extend([
            "-f".to_string(),
            "concat".to_string(),
            "-safe".to_string(),
            "0".to_string(),
            "-i".to_string(),
            list.to_string_lossy().to_string(),
        ]);
        args.extend(["-c".to_string(), "copy".to_string()]);
        args.extend(["-movflags".to_string(), "+faststart".to_string()]);
        args.push(output.to_string_lossy().to_string());
        args
    }

    async fn run(
        &self,
        list: &Path,
        output: &Path,
        expected_duration: Option<f64>,
        progress: Option<RemuxProgress<'_>>,
    ) -> Result<()> {
        let args = Self::build_args(list, output);
        debug!(ffmpeg = %self.ffmpeg_path, ?args, "Spawning ffmpeg");

        let mut child = Command::new(&self.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DownloadError::merge(format!("failed to spawn {}: {e}", self.ffmpeg_path)))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let read_progress = async {
            let Some(stdout) = stdout else { return };
            let mut lines = BufReader::new(stdout).lines();
            let mut last = 0u8;
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(percent) = parse_progress_line(&line, expected_duration)
                    && percent > last
                {
                    last = percent;
                    if let Some(cb) = progress {
                        cb(percent);
                    }
                }
            }
        };

        let read_errors = async {
            let mut last_error = None;
            let Some(stderr) = stderr else {
                return last_error;
            };
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                warn!("ffmpeg: {}", line);
                last_error = Some(line);
            }
            last_error
        };

        let ((), last_error) = tokio::join!(read_progress, read_errors);
        let status = child.wait().await?;

        if status.success() {
            return Ok(());
        }
        Err(DownloadError::merge(last_error.unwrap_or_else(|| {
            format!("ffmpeg exited with {status}")
        })))
    }
}

impl Default for FfmpegRemuxer {
    fn default() -> Self {
        Self::new(crate::config::default_ffmpeg_path())
    }
}

#[async_trait]
impl Remuxer for FfmpegRemuxer {
    async fn remux(
        &self,
        segments_dir: &Path,
        output: &Path,
        expected_duration: Option<f64>,
        progress: Option<RemuxProgress<'_>>,
    ) -> Result<()> {
        let segments = collect_segments(segments_dir).await?;
        if let Some(parent) = output.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let list = segments_dir.join(CONCAT_LIST_NAME);
        tokio::fs::write(&list, concat_list(&segments)).await?;
        info!(
            segments = segments.len(),
            output = %output.display(),
            "Merging segments"
        );

        let result = self.run(&list, output, expected_duration, progress).await;

        if let Err(e) = tokio::fs::remove_file(&list).await {
            debug!(error = %e, "Could not remove concat list");
        }
        result
    }
}
