use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("playlist error: {reason}")]
    Playlist { reason: String },

    #[error("no segments found in playlist {url}")]
    NoSegments { url: String },

    #[error("segment {index} failed after {attempts} attempts: {reason}")]
    SegmentFailed {
        index: usize,
        attempts: u32,
        reason: String,
    },

    #[error("working directory {path} no longer exists")]
    WorkDirRemoved { path: String },

    #[error("merge failed: {reason}")]
    Merge { reason: String },

    #[error("task `{id}` is already active")]
    DuplicateTask { id: String },

    #[error("task `{id}` is still shutting down")]
    TaskDraining { id: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl DownloadError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn http_status(
        status: StatusCode,
        url: impl Into<String>,
        operation: &'static str,
    ) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    pub fn playlist(reason: impl Into<String>) -> Self {
        Self::Playlist {
            reason: reason.into(),
        }
    }

    pub fn merge(reason: impl Into<String>) -> Self {
        Self::Merge {
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Whether a single fetch attempt that failed with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { source } => {
                source.is_connect()
                    || source.is_timeout()
                    || source.is_request()
                    || source.is_body()
                    || source.is_decode()
            }
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Io { .. } => true,
            Self::Cancelled
            | Self::InvalidUrl { .. }
            | Self::Playlist { .. }
            | Self::NoSegments { .. }
            | Self::SegmentFailed { .. }
            | Self::WorkDirRemoved { .. }
            | Self::Merge { .. }
            | Self::DuplicateTask { .. }
            | Self::TaskDraining { .. }
            | Self::Configuration { .. }
            | Self::Internal { .. } => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, DownloadError>;
