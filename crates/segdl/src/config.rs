use std::path::PathBuf;
use std::time::Duration;

use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::warn;

use crate::error::{DownloadError, Result};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

pub const DEFAULT_CONCURRENCY: usize = 5;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// HTTP options shared by playlist and segment requests
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Overall timeout for a single request
    pub timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Whether to follow redirects
    pub follow_redirects: bool,

    /// User agent string
    pub user_agent: String,

    /// Headers sent with every request
    pub headers: HeaderMap,

    /// Maximum idle connections to keep per host.
    /// Segment downloads hit the same CDN host repeatedly, so keep enough for the worker pool.
    pub pool_max_idle_per_host: usize,

    /// Duration to keep idle connections alive before closing
    pub pool_idle_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: HttpConfig::get_default_headers(),
            pool_max_idle_per_host: 10,
            pool_idle_timeout: Duration::from_secs(30),
        }
    }
}

impl HttpConfig {
    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );

        default_headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));

        default_headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.5,zh-CN;q=0.3,zh;q=0.2"),
        );
        default_headers
    }

    /// Returns a copy of the default headers with `overrides` merged on top.
    ///
    /// Overrides take precedence for the same header name; a `User-Agent` override
    /// replaces the configured user agent. Invalid names or values are skipped.
    pub fn merged_headers(&self, overrides: &[(String, String)]) -> HeaderMap {
        let mut headers = self.headers.clone();
        if let Ok(ua) = HeaderValue::from_str(&self.user_agent) {
            headers.insert(reqwest::header::USER_AGENT, ua);
        }

        for (name, value) in overrides {
            match (
                HeaderName::from_bytes(name.trim().as_bytes()),
                HeaderValue::from_str(value.trim()),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(header = %name, "Skipping invalid header override"),
            }
        }
        headers
    }
}

/// Builds the HTTP client used by a single task.
pub fn create_client(config: &HttpConfig, overrides: &[(String, String)]) -> Result<Client> {
    let redirect = if config.follow_redirects {
        reqwest::redirect::Policy::limited(10)
    } else {
        reqwest::redirect::Policy::none()
    };

    Client::builder()
        .timeout(config.timeout)
        .connect_timeout(config.connect_timeout)
        .default_headers(config.merged_headers(overrides))
        .redirect(redirect)
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .pool_idle_timeout(config.pool_idle_timeout)
        .build()
        .map_err(|e| DownloadError::configuration(format!("failed to build HTTP client: {e}")))
}

/// `FFMPEG_PATH` from the environment, or `ffmpeg` looked up on `PATH`.
pub fn default_ffmpeg_path() -> String {
    std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string())
}

/// Engine-wide options. Per-task concurrency and retry budget are resolved from a
/// [`SettingsSource`](crate::settings::SettingsSource) at task start and fall back to
/// the defaults stored here.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub http: HttpConfig,

    /// Segment fetches in flight per task
    pub concurrency: usize,

    /// Retries after the first failed attempt of a segment
    pub max_retries: u32,

    /// Delay before retry `n` (0-indexed) is `retry_base_delay * (n + 1)`
    pub retry_base_delay: Duration,

    /// Cap on a single retry delay
    pub retry_max_delay: Duration,

    /// Add random jitter of up to half the base delay to each retry
    pub retry_jitter: bool,

    /// Root under which per-task working directories are created
    pub work_root: PathBuf,

    /// ffmpeg binary used for the final remux
    pub ffmpeg_path: String,

    /// Maximum master→variant hops followed while resolving a playlist
    pub max_playlist_depth: usize,

    /// Capacity of the event channel; events beyond it are dropped
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            concurrency: DEFAULT_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay: Duration::from_millis(1000),
            retry_max_delay: Duration::from_secs(30),
            retry_jitter: false,
            work_root: std::env::temp_dir().join("segdl"),
            ffmpeg_path: default_ffmpeg_path(),
            max_playlist_depth: 3,
            event_buffer: crate::events::DEFAULT_EVENT_BUFFER,
        }
    }
}

impl EngineConfig {
    pub fn with_work_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.work_root = root.into();
        self
    }

    pub fn with_ffmpeg_path(mut self, path: impl Into<String>) -> Self {
        self.ffmpeg_path = path.into();
        self
    }

    pub fn with_retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base_delay = base;
        self.retry_max_delay = max;
        self
    }

    pub fn with_http(mut self, http: HttpConfig) -> Self {
        self.http = http;
        self
    }
}
