// HLS Segment Fetcher: downloads one media segment to its file in the task's working
// directory, retrying transient failures.

use crate::error::DownloadError;
use crate::hls::retry::{RetryAction, RetryPolicy, retry_with_backoff};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};
use url::Url;

/// One entry of a task's fetch plan.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentJob {
    /// Ordinal position in the playlist; the authoritative merge order
    pub index: usize,
    pub uri: Url,
    /// Destination file inside the working directory
    pub path: PathBuf,
}

/// File name used for the segment at `index`. Zero padding keeps lexical order equal to
/// numeric order for up to a million segments.
pub fn segment_file_name(index: usize) -> String {
    format!("segment_{index:06}.ts")
}

/// Builds the fetch plan for `uris` inside `work_dir`.
pub fn build_plan(uris: impl IntoIterator<Item = Url>, work_dir: &Path) -> Vec<SegmentJob> {
    uris.into_iter()
        .enumerate()
        .map(|(index, uri)| SegmentJob {
            index,
            path: work_dir.join(segment_file_name(index)),
            uri,
        })
        .collect()
}

#[async_trait]
pub trait SegmentDownloader: Send + Sync {
    /// Downloads `job` and returns the size of the written file in bytes.
    async fn download(
        &self,
        job: &SegmentJob,
        token: &CancellationToken,
    ) -> Result<u64, DownloadError>;
}

pub struct SegmentFetcher {
    http_client: Client,
    work_dir: PathBuf,
    retry_policy: RetryPolicy,
}

impl SegmentFetcher {
    pub fn new(http_client: Client, work_dir: PathBuf, retry_policy: RetryPolicy) -> Self {
        Self {
            http_client,
            work_dir,
            retry_policy,
        }
    }

    /// Fails without retry when the working directory is gone or the task was cancelled.
    async fn ensure_alive(&self, token: &CancellationToken) -> Result<(), DownloadError> {
        if token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        match tokio::fs::try_exists(&self.work_dir).await {
            Ok(true) => Ok(()),
            _ => Err(DownloadError::WorkDirRemoved {
                path: self.work_dir.display().to_string(),
            }),
        }
    }

    /// Streams the body of `job` into its `.part` file and renames it into place.
    async fn fetch_to_file(&self, job: &SegmentJob) -> Result<u64, DownloadError> {
        let response = self.http_client.get(job.uri.clone()).send().await?;
        if !response.status().is_success() {
            return Err(DownloadError::http_status(
                response.status(),
                job.uri.as_str(),
                "segment fetch",
            ));
        }

        let tmp = part_path(&job.path);
        let result = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            let mut byte_stream = response.bytes_stream();
            let mut written = 0u64;
            while let Some(chunk) = byte_stream.next().await {
                let chunk = chunk?;
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.flush().await?;
            drop(file);
            tokio::fs::rename(&tmp, &job.path).await?;
            Ok(written)
        }
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp).await;
        }
        result
    }

    async fn attempt(&self, job: &SegmentJob, token: &CancellationToken) -> RetryAction<u64> {
        if let Err(e) = self.ensure_alive(token).await {
            return RetryAction::Fail(e);
        }

        let result = tokio::select! {
            _ = token.cancelled() => return RetryAction::Fail(DownloadError::Cancelled),
            result = self.fetch_to_file(job) => result,
        };
        match result {
            Ok(size) => RetryAction::Success(size),
            Err(e) => {
                // The directory vanishing mid-write is a cancellation race, not a disk fault.
                if let Err(alive) = self.ensure_alive(token).await {
                    RetryAction::Fail(alive)
                } else if e.is_retryable() {
                    RetryAction::Retry(e)
                } else {
                    RetryAction::Fail(e)
                }
            }
        }
    }
}

fn part_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".part");
    PathBuf::from(tmp)
}

#[async_trait]
impl SegmentDownloader for SegmentFetcher {
    #[instrument(skip(self, job, token), fields(index = job.index, uri = %job.uri))]
    async fn download(
        &self,
        job: &SegmentJob,
        token: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        match retry_with_backoff(&self.retry_policy, token, move |_| self.attempt(job, token)).await {
            Ok(size) => {
                trace!(size, "Segment written");
                Ok(size)
            }
            Err(failure) => match failure.error {
                e @ (DownloadError::Cancelled | DownloadError::WorkDirRemoved { .. }) => Err(e),
                e => {
                    debug!(attempts = failure.attempts, error = %e, "Segment failed");
                    Err(DownloadError::SegmentFailed {
                        index: job.index,
                        attempts: failure.attempts,
                        reason: e.to_string(),
                    })
                }
            },
        }
    }
}
