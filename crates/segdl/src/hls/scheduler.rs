// HLS Segment Scheduler: runs a task's fetch plan over a bounded pool of concurrent
// downloads, honouring pause and cancellation, and aggregates progress.

use crate::error::DownloadError;
use crate::hls::fetcher::{SegmentDownloader, SegmentJob};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

const KIB: f64 = 1024.0;
const MIB: f64 = 1024.0 * 1024.0;

/// Formats a throughput as `B/s`, `KB/s` or `MB/s`.
pub fn format_speed(bytes_per_sec: f64) -> String {
    if bytes_per_sec < KIB {
        format!("{bytes_per_sec:.0} B/s")
    } else if bytes_per_sec < MIB {
        format!("{:.2} KB/s", bytes_per_sec / KIB)
    } else {
        format!("{:.2} MB/s", bytes_per_sec / MIB)
    }
}

/// Percentage of finished segments. 100 is reserved for a completed task, so the
/// download phase tops out at 99.
pub fn download_percent(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    let percent = (completed as f64 / total as f64 * 100.0).round();
    percent.clamp(0.0, 99.0) as u8
}

/// Aggregate counters for one task's download phase.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub completed: usize,
    pub total: usize,
    pub bytes: u64,
    pub percent: u8,
    pub speed: String,
}

#[derive(Debug)]
pub struct ProgressTracker {
    total: usize,
    completed: usize,
    bytes: u64,
    started: Instant,
}

impl ProgressTracker {
    pub fn new(total: usize, started: Instant) -> Self {
        Self {
            total,
            completed: 0,
            bytes: 0,
            started,
        }
    }

    /// Records one finished segment of `size` bytes.
    pub fn record(&mut self, size: u64) -> ProgressSnapshot {
        self.completed += 1;
        self.bytes += size;
        self.snapshot()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let secs = self.started.elapsed().as_secs_f64().max(0.001);
        ProgressSnapshot {
            completed: self.completed,
            total: self.total,
            bytes: self.bytes,
            percent: download_percent(self.completed, self.total),
            speed: format_speed(self.bytes as f64 / secs),
        }
    }
}

/// How a scheduler run ended without error.
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleOutcome {
    /// Every segment of the plan is on disk.
    Completed(ProgressSnapshot),
    /// The task was cancelled; remaining work was dropped.
    Cancelled,
}

pub struct SegmentScheduler {
    downloader: Arc<dyn SegmentDownloader>,
    concurrency: usize,
    token: CancellationToken,
    pause_rx: watch::Receiver<bool>,
}

impl SegmentScheduler {
    pub fn new(
        downloader: Arc<dyn SegmentDownloader>,
        concurrency: usize,
        token: CancellationToken,
        pause_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            downloader,
            concurrency: concurrency.max(1),
            token,
            pause_rx,
        }
    }

    fn dispatch(
        &self,
        job: SegmentJob,
    ) -> impl Future<Output = (usize, Result<u64, DownloadError>)> + use<> {
        let downloader = Arc::clone(&self.downloader);
        let token = self.token.clone();
        async move {
            let result = downloader.download(&job, &token).await;
            (job.index, result)
        }
    }

    /// Downloads every job of `plan`.
    ///
    /// Jobs start in plan order with at most `concurrency` in flight; completions may
    /// arrive in any order. While the pause flag is set no new job starts, but jobs
    /// already in flight run to completion. The first fatal segment error aborts the run.
    pub async fn run<F>(
        &mut self,
        plan: Vec<SegmentJob>,
        started: Instant,
        mut on_progress: F,
    ) -> Result<ScheduleOutcome, DownloadError>
    where
        F: FnMut(&ProgressSnapshot),
    {
        let mut tracker = ProgressTracker::new(plan.len(), started);
        let mut pending = plan.into_iter().peekable();
        let mut in_flight = FuturesUnordered::new();

        info!(
            total = tracker.total,
            concurrency = self.concurrency,
            "SegmentScheduler started."
        );

        loop {
            if self.token.is_cancelled() {
                return Ok(ScheduleOutcome::Cancelled);
            }

            let paused = *self.pause_rx.borrow_and_update();
            if !paused && in_flight.len() < self.concurrency {
                if let Some(job) = pending.next() {
                    trace!(index = job.index, "Dispatching segment");
                    in_flight.push(self.dispatch(job));
                    continue;
                }
            }

            if in_flight.is_empty() && pending.peek().is_none() {
                break;
            }

            tokio::select! {
                biased;

                _ = self.token.cancelled() => {
                    debug!(in_flight = in_flight.len(), "Cancellation observed, dropping in-flight segments");
                    return Ok(ScheduleOutcome::Cancelled);
                }

                Some((index, result)) = in_flight.next(), if !in_flight.is_empty() => {
                    match result {
                        Ok(size) => {
                            let snapshot = tracker.record(size);
                            trace!(index, size, completed = snapshot.completed, "Segment completed");
                            on_progress(&snapshot);
                        }
                        Err(DownloadError::Cancelled) => return Ok(ScheduleOutcome::Cancelled),
                        Err(e @ DownloadError::WorkDirRemoved { .. }) => {
                            if self.token.is_cancelled() {
                                return Ok(ScheduleOutcome::Cancelled);
                            }
                            return Err(e);
                        }
                        Err(e) => return Err(e),
                    }
                }

                changed = self.pause_rx.changed(), if paused => {
                    if changed.is_err() {
                        // The control handle is gone; nobody can resume this task.
                        return Ok(ScheduleOutcome::Cancelled);
                    }
                    debug!(paused = *self.pause_rx.borrow(), "Pause flag changed");
                }
            }
        }

        let snapshot = tracker.snapshot();
        info!(
            segments = snapshot.completed,
            bytes = snapshot.bytes,
            "All segments downloaded"
        );
        Ok(ScheduleOutcome::Completed(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hls::fetcher::segment_file_name;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use url::Url;

    /// Completes each job after a per-index delay and records start order.
    struct FakeDownloader {
        delays_ms: Vec<u64>,
        fail_index: Option<usize>,
        started: Mutex<Vec<usize>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl FakeDownloader {
        fn new(delays_ms: Vec<u64>) -> Self {
            Self {
                delays_ms,
                fail_index: None,
                started: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SegmentDownloader for FakeDownloader {
        async fn download(
            &self,
            job: &SegmentJob,
            _token: &CancellationToken,
        ) -> Result<u64, DownloadError> {
            self.started.lock().push(job.index);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(self.delays_ms[job.index])).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.fail_index == Some(job.index) {
                return Err(DownloadError::SegmentFailed {
                    index: job.index,
                    attempts: 4,
                    reason: "HTTP 500".to_string(),
                });
            }
            Ok(100)
        }
    }

    fn plan(n: usize) -> Vec<SegmentJob> {
        (0..n)
            .map(|index| SegmentJob {
                index,
                uri: Url::parse(&format!("https://h.test/{index}.ts")).unwrap(),
                path: PathBuf::from("/work").join(segment_file_name(index)),
            })
            .collect()
    }

    #[test]
    fn speed_units() {
        assert_eq!(format_speed(512.0), "512 B/s");
        assert_eq!(format_speed(1536.0), "1.50 KB/s");
        assert_eq!(format_speed(3.0 * 1024.0 * 1024.0), "3.00 MB/s");
    }

    #[test]
    fn percent_is_rounded_and_capped_below_completion() {
        assert_eq!(download_percent(0, 3), 0);
        assert_eq!(download_percent(1, 3), 33);
        assert_eq!(download_percent(2, 3), 67);
        assert_eq!(download_percent(3, 3), 99);
        assert_eq!(download_percent(199, 200), 99);
        assert_eq!(download_percent(0, 0), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn respects_concurrency_and_start_order() {
        let downloader = Arc::new(FakeDownloader::new(vec![30, 10, 20, 5, 5, 5, 5]));
        let (_pause_tx, pause_rx) = watch::channel(false);
        let mut scheduler =
            SegmentScheduler::new(downloader.clone(), 2, CancellationToken::new(), pause_rx);

        let mut percents = Vec::new();
        let outcome = scheduler
            .run(plan(7), Instant::now(), |p| percents.push(p.percent))
            .await
            .unwrap();

        match outcome {
            ScheduleOutcome::Completed(snapshot) => {
                assert_eq!(snapshot.completed, 7);
                assert_eq!(snapshot.bytes, 700);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(*downloader.started.lock(), (0..7).collect::<Vec<_>>());
        assert_eq!(downloader.max_in_flight.load(Ordering::SeqCst), 2);
        assert_eq!(percents.len(), 7);
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn first_segment_failure_aborts() {
        let mut fake = FakeDownloader::new(vec![5; 6]);
        fake.fail_index = Some(1);
        let downloader = Arc::new(fake);
        let (_pause_tx, pause_rx) = watch::channel(false);
        let mut scheduler =
            SegmentScheduler::new(downloader.clone(), 2, CancellationToken::new(), pause_rx);

        let err = scheduler.run(plan(6), Instant::now(), |_| {}).await.unwrap_err();
        assert!(matches!(err, DownloadError::SegmentFailed { index: 1, .. }));
        assert!(downloader.started.lock().len() < 6);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_blocks_new_dispatch_until_resumed() {
        let downloader = Arc::new(FakeDownloader::new(vec![10; 4]));
        let (pause_tx, pause_rx) = watch::channel(true);
        let mut scheduler =
            SegmentScheduler::new(downloader.clone(), 2, CancellationToken::new(), pause_rx);

        let observer = downloader.clone();
        let resume = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(observer.started.lock().is_empty());
            pause_tx.send_replace(false);
            pause_tx
        });

        let outcome = scheduler.run(plan(4), Instant::now(), |_| {}).await.unwrap();
        assert!(matches!(outcome, ScheduleOutcome::Completed(_)));
        resume.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_without_error() {
        let downloader = Arc::new(FakeDownloader::new(vec![50; 10]));
        let (_pause_tx, pause_rx) = watch::channel(false);
        let token = CancellationToken::new();
        let mut scheduler = SegmentScheduler::new(downloader.clone(), 3, token.clone(), pause_rx);

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(75)).await;
            cancel.cancel();
        });

        let outcome = scheduler.run(plan(10), Instant::now(), |_| {}).await.unwrap();
        assert_eq!(outcome, ScheduleOutcome::Cancelled);
        assert!(downloader.started.lock().len() < 10);
    }
}
