// HLS VOD downloading: playlist resolution, per-segment fetching and scheduling.

pub mod fetcher;
pub mod playlist;
pub mod retry;
pub mod scheduler;

pub use fetcher::{SegmentDownloader, SegmentFetcher, SegmentJob, build_plan, segment_file_name};
pub use playlist::{Manifest, ManifestResolver, SegmentRef, Variant, resolve_uri};
pub use retry::{RetryAction, RetryFailure, RetryPolicy, retry_with_backoff};
pub use scheduler::{
    ProgressSnapshot, ProgressTracker, ScheduleOutcome, SegmentScheduler, download_percent,
    format_speed,
};
