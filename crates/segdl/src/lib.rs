//! Segmented HLS (VOD) downloader engine.
//!
//! A [`DownloadManager`] resolves a playlist (following master playlists to their
//! highest-bandwidth variant), fetches every segment with bounded concurrency, retries
//! and pause/resume/cancel support, then concatenates the segments into one file with a
//! [`Remuxer`]. Progress and lifecycle changes are pushed as [`DownloadEvent`]s.

pub mod config;
pub mod error;
pub mod events;
pub mod hls;
pub mod manager;
pub mod registry;
pub mod remux;
pub mod settings;
pub mod task;

pub use config::{EngineConfig, HttpConfig, create_client};
pub use error::{DownloadError, Result};
pub use events::{DownloadEvent, EventSink};
pub use manager::DownloadManager;
pub use registry::{TaskControl, TaskRegistry};
pub use remux::{FfmpegRemuxer, Remuxer};
pub use settings::{
    EnvSettings, LayeredSettings, SettingsSource, StaticSettings, TaskSettings, TomlSettings,
};
pub use task::{DownloadRequest, Task, TaskStatus};
