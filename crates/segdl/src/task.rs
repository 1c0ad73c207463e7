//! Task identity, request and observable state.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

const DEFAULT_EXTENSION: &str = "mp4";

/// Lifecycle status of a download task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Downloading,
    Paused,
    Merging,
    Completed,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Merging => "merging",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to download one playlist into one output file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    /// Caller-supplied id, unique among active tasks
    pub id: String,
    /// Playlist URL
    pub url: String,
    /// Output file name; `.mp4` is appended when it has no extension
    #[serde(default)]
    pub filename: String,
    /// Output directory
    pub path: PathBuf,
    /// Extra request headers, merged over the defaults
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

impl DownloadRequest {
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        path: impl Into<PathBuf>,
        filename: impl Into<String>,
    ) -> Self {
        let mut request = Self {
            id: id.into(),
            url: url.into(),
            filename: filename.into(),
            path: path.into(),
            headers: Vec::new(),
        };
        request.pin_filename();
        request
    }

    /// Replaces the requested name with the final output file name, so the fallback
    /// name is chosen exactly once.
    pub fn pin_filename(&mut self) {
        self.filename = self.output_filename();
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Final output file name.
    ///
    /// An empty name is derived from the last path element of the URL, falling back to
    /// `download_<timestamp>`, and a name without an extension gets `.mp4`. Requests
    /// built with [`DownloadRequest::new`] already carry the final name.
    pub fn output_filename(&self) -> String {
        let trimmed = self.filename.trim();
        let base = if trimmed.is_empty() {
            filename_from_url(&self.url)
                .unwrap_or_else(|| format!("download_{}", chrono::Utc::now().timestamp()))
        } else {
            trimmed.to_string()
        };

        if Path::new(&base).extension().is_some() {
            base
        } else {
            format!("{base}.{DEFAULT_EXTENSION}")
        }
    }

    pub fn output_path(&self) -> PathBuf {
        self.path.join(self.output_filename())
    }
}

fn filename_from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let last = parsed.path_segments()?.next_back()?;
    let stem = Path::new(last).file_stem()?.to_str()?;
    (!stem.is_empty()).then(|| stem.to_string())
}

/// Observable state of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub url: String,
    pub path: PathBuf,
    pub filename: String,
    pub status: TaskStatus,
    /// Percentage in `0..=100`
    pub progress: u8,
    /// Human-readable throughput, e.g. `1.25 MB/s`
    pub speed: String,
    pub total_segments: usize,
    pub downloaded_segments: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Task {
    pub fn from_request(request: &DownloadRequest) -> Self {
        Self {
            id: request.id.clone(),
            url: request.url.clone(),
            path: request.path.clone(),
            filename: request.output_filename(),
            status: TaskStatus::Pending,
            progress: 0,
            speed: String::new(),
            total_segments: 0,
            downloaded_segments: 0,
            error_message: None,
        }
    }
}
