//! Download Manager: drives each task from playlist resolution through segment download
//! to the final remux, and exposes the pause/resume/cancel controls.

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Instant;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::{EngineConfig, create_client};
use crate::error::{DownloadError, Result};
use crate::events::{DownloadEvent, EventSink};
use crate::hls::fetcher::{SegmentFetcher, build_plan};
use crate::hls::playlist::{Manifest, ManifestResolver};
use crate::hls::retry::RetryPolicy;
use crate::hls::scheduler::{ProgressSnapshot, ScheduleOutcome, SegmentScheduler};
use crate::registry::{Registration, TaskControl, TaskRegistry};
use crate::remux::{FfmpegRemuxer, Remuxer};
use crate::settings::{SettingsSource, TaskSettings};
use crate::task::{DownloadRequest, Task, TaskStatus};

/// Overall percentage while merging: the merge fills the share the download left.
/// Stays below 100 until the task is completed.
///
/// Merging starts only once every segment is present, so the download share is already
/// 99 and overall progress holds there for the whole merge. Raw merge progress is
/// logged instead.
pub fn merge_percent(downloaded: u8, merge: u8) -> u8 {
    let downloaded = u32::from(downloaded.min(100));
    let merge = u32::from(merge.min(100));
    let overall = downloaded + (100 - downloaded) * merge / 100;
    overall.min(99) as u8
}

struct ManagerInner {
    config: EngineConfig,
    settings: Arc<dyn SettingsSource>,
    registry: TaskRegistry,
    events: EventSink,
    remuxer: Arc<dyn Remuxer>,
}

/// The Download Manager service. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<ManagerInner>,
}

impl DownloadManager {
    /// Creates a manager that remuxes with ffmpeg, returning the event receiver.
    pub fn new(
        config: EngineConfig,
        settings: Arc<dyn SettingsSource>,
    ) -> (Self, mpsc::Receiver<DownloadEvent>) {
        let remuxer = Arc::new(FfmpegRemuxer::new(config.ffmpeg_path.clone()));
        Self::with_remuxer(config, settings, remuxer)
    }

    pub fn with_remuxer(
        config: EngineConfig,
        settings: Arc<dyn SettingsSource>,
        remuxer: Arc<dyn Remuxer>,
    ) -> (Self, mpsc::Receiver<DownloadEvent>) {
        let (events, rx) = EventSink::channel(config.event_buffer);
        (Self::with_sink(config, settings, remuxer, events), rx)
    }

    /// Creates a manager publishing to an existing sink.
    pub fn with_sink(
        config: EngineConfig,
        settings: Arc<dyn SettingsSource>,
        remuxer: Arc<dyn Remuxer>,
        events: EventSink,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                settings,
                registry: TaskRegistry::new(),
                events,
                remuxer,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Working directory of the task `id`.
    pub fn work_dir(&self, id: &str) -> PathBuf {
        self.inner.config.work_root.join(id)
    }

    /// Registers the task and spawns its pipeline.
    ///
    /// Returns once the task is registered; the pipeline reports through events. If a
    /// cancelled task with the same id is still unwinding, this waits for it first.
    pub async fn start_download(&self, mut request: DownloadRequest) -> Result<JoinHandle<()>> {
        validate_id(&request.id)?;
        request.pin_filename();
        let registry = &self.inner.registry;
        let Registration {
            generation,
            control,
        } = loop {
            if registry.contains(&request.id) {
                return Err(DownloadError::DuplicateTask { id: request.id });
            }
            registry.wait_drained(&request.id).await;
            match registry.register(&request) {
                // Another task took the id and was cancelled while we waited.
                Err(DownloadError::TaskDraining { .. }) => continue,
                other => break other?,
            }
        };

        let defaults = TaskSettings {
            concurrency: self.inner.config.concurrency,
            max_retries: self.inner.config.max_retries,
        };
        let settings = TaskSettings::resolve(self.inner.settings.as_ref(), defaults);

        info!(
            id = %request.id,
            url = %request.url,
            concurrency = settings.concurrency,
            max_retries = settings.max_retries,
            "Starting download"
        );
        self.inner
            .events
            .status(&request.id, TaskStatus::Pending, None);

        let span = info_span!("download", id = %request.id);
        let pipeline = TaskPipeline {
            work_dir: self.work_dir(&request.id),
            inner: Arc::clone(&self.inner),
            request,
            generation,
            control,
            settings,
            merge_started: AtomicBool::new(false),
        };
        Ok(tokio::spawn(pipeline.run().instrument(span)))
    }

    /// Blocks new segment fetches of a downloading task. Returns `false` when the task is
    /// unknown, not downloading, or already paused.
    pub fn pause_download(&self, id: &str) -> bool {
        let events = &self.inner.events;
        let paused = self
            .inner
            .registry
            .update_current(id, |control, task| {
                if task.status != TaskStatus::Downloading || !control.pause() {
                    return false;
                }
                task.status = TaskStatus::Paused;
                events.status(id, TaskStatus::Paused, Some(task.total_segments));
                true
            })
            .unwrap_or(false);
        if paused {
            info!(id, "Download paused");
        }
        paused
    }

    /// Lets a paused task dispatch fetches again. Returns `false` when the task is unknown
    /// or not paused.
    pub fn resume_download(&self, id: &str) -> bool {
        let events = &self.inner.events;
        let resumed = self
            .inner
            .registry
            .update_current(id, |control, task| {
                if task.status != TaskStatus::Paused || !control.resume() {
                    return false;
                }
                task.status = TaskStatus::Downloading;
                events.status(id, TaskStatus::Downloading, Some(task.total_segments));
                true
            })
            .unwrap_or(false);
        if resumed {
            info!(id, "Download resumed");
        }
        resumed
    }

    /// Cancels the task, releases its bookkeeping and removes its working directory.
    /// No event is emitted. Returns `false` when the task is unknown.
    ///
    /// The directory is removed on the calling thread before this returns, so no cleanup
    /// outlives the call. That blocks for as long as deleting the segment files takes.
    pub fn cancel_download(&self, id: &str) -> bool {
        let registry = &self.inner.registry;
        let Some(control) = registry.control(id) else {
            return false;
        };
        control.cancel();
        registry.remove_cancelled(id);

        let work_dir = self.work_dir(id);
        match std::fs::remove_dir_all(&work_dir) {
            Ok(()) => debug!(id, path = %work_dir.display(), "Removed working directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(id, error = %e, "Failed to remove working directory"),
        }
        info!(id, "Download cancelled");
        true
    }

    /// Snapshot of an active task.
    pub fn get_task(&self, id: &str) -> Option<Task> {
        self.inner.registry.get(id)
    }

    pub fn active_tasks(&self) -> Vec<Task> {
        self.inner
            .registry
            .active_ids()
            .iter()
            .filter_map(|id| self.inner.registry.get(id))
            .collect()
    }

    /// Cancels every active task and returns their ids.
    pub fn cancel_all(&self) -> Vec<String> {
        let ids = self.inner.registry.active_ids();
        ids.into_iter()
            .filter(|id| self.cancel_download(id))
            .collect()
    }
}

/// Task ids name working directories, so they must be a single plain path component.
fn validate_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains(['/', '\\'])
        && !id.chars().any(char::is_control);
    if valid {
        Ok(())
    } else {
        Err(DownloadError::configuration(format!("invalid task id `{id}`")))
    }
}

async fn remove_partial_output(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed partial output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove partial output"),
    }
}

async fn remove_work_dir(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed working directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove working directory"),
    }
}

/// One task's run, owned by its spawned tokio task.
struct TaskPipeline {
    inner: Arc<ManagerInner>,
    request: DownloadRequest,
    generation: u64,
    control: Arc<TaskControl>,
    settings: TaskSettings,
    work_dir: PathBuf,
    /// Set once the remuxer may have started writing the output file.
    merge_started: AtomicBool,
}

impl TaskPipeline {
    fn id(&self) -> &str {
        &self.request.id
    }

    fn events(&self) -> &EventSink {
        &self.inner.events
    }

    fn update<F: FnOnce(&mut Task)>(&self, f: F) {
        self.inner.registry.update(self.id(), self.generation, f);
    }

    async fn run(self) {
        let _finished = self.control.finished_guard();
        let started = Instant::now();

        let result = AssertUnwindSafe(self.execute(started))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(DownloadError::Internal {
                    reason: "download pipeline panicked".to_string(),
                })
            });

        match result {
            Ok(()) => {}
            Err(e) if e.is_cancelled() || self.control.is_cancelled() => {
                info!("Download stopped after cancel");
                remove_work_dir(&self.work_dir).await;
                if self.merge_started.load(Ordering::Acquire) {
                    remove_partial_output(&self.request.output_path()).await;
                }
            }
            Err(e) => {
                let message = e.to_string();
                error!(error = %message, "Download failed");
                self.update(|task| {
                    task.status = TaskStatus::Error;
                    task.error_message = Some(message.clone());
                });
                self.events().status(self.id(), TaskStatus::Error, None);
                self.events().error(self.id(), message);
            }
        }

        self.inner.registry.finish(self.id(), self.generation);
    }

    async fn execute(&self, started: Instant) -> Result<()> {
        let token = self.control.token();
        self.prepare_work_dir().await?;

        let client = create_client(&self.inner.config.http, &self.request.headers)?;
        let resolver = ManifestResolver::new(client.clone(), self.inner.config.max_playlist_depth);
        let manifest = match resolver.resolve(&self.request.url, token).await {
            Ok(manifest) => manifest,
            Err(e) => {
                remove_work_dir(&self.work_dir).await;
                return Err(e);
            }
        };

        let snapshot = self.download(&manifest, client, started).await?;
        self.merge(&manifest, &snapshot).await?;

        if token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        remove_work_dir(&self.work_dir).await;

        let total = manifest.segments.len();
        self.update(|task| {
            task.status = TaskStatus::Completed;
            task.progress = 100;
            task.downloaded_segments = total;
        });
        self.events()
            .progress(self.id(), 100, snapshot.speed.clone(), Some(total), Some(total));
        self.events()
            .status(self.id(), TaskStatus::Completed, Some(total));
        info!(
            output = %self.request.output_path().display(),
            segments = total,
            bytes = snapshot.bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Download completed"
        );
        Ok(())
    }

    /// Starts from an empty working directory so stale segments of an earlier failed run
    /// are never merged.
    async fn prepare_work_dir(&self) -> Result<()> {
        if self.control.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        if tokio::fs::try_exists(&self.work_dir).await? {
            debug!(path = %self.work_dir.display(), "Clearing stale working directory");
            tokio::fs::remove_dir_all(&self.work_dir).await?;
        }
        tokio::fs::create_dir_all(&self.work_dir).await?;
        Ok(())
    }

    async fn download(
        &self,
        manifest: &Manifest,
        client: reqwest::Client,
        started: Instant,
    ) -> Result<ProgressSnapshot> {
        let total = manifest.segments.len();
        self.update(|task| {
            task.status = TaskStatus::Downloading;
            task.total_segments = total;
        });
        self.events()
            .status(self.id(), TaskStatus::Downloading, Some(total));

        let config = &self.inner.config;
        let retry_policy = RetryPolicy {
            max_retries: self.settings.max_retries,
            base_delay: config.retry_base_delay,
            max_delay: config.retry_max_delay,
            jitter: config.retry_jitter,
        };
        let fetcher = Arc::new(SegmentFetcher::new(
            client,
            self.work_dir.clone(),
            retry_policy,
        ));
        let plan = build_plan(
            manifest.segments.iter().map(|s| s.uri.clone()),
            &self.work_dir,
        );

        let mut scheduler = SegmentScheduler::new(
            fetcher,
            self.settings.concurrency,
            self.control.token().clone(),
            self.control.pause_receiver(),
        );
        let outcome = scheduler
            .run(plan, started, |progress| {
                self.update(|task| {
                    task.progress = progress.percent;
                    task.speed = progress.speed.clone();
                    task.downloaded_segments = progress.completed;
                });
                self.events().progress(
                    self.id(),
                    progress.percent,
                    progress.speed.clone(),
                    Some(progress.completed),
                    Some(progress.total),
                );
            })
            .await?;

        match outcome {
            ScheduleOutcome::Completed(snapshot) => Ok(snapshot),
            ScheduleOutcome::Cancelled => Err(DownloadError::Cancelled),
        }
    }

    async fn merge(&self, manifest: &Manifest, downloaded: &ProgressSnapshot) -> Result<()> {
        let token = self.control.token();
        if token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let total = manifest.segments.len();
        self.update(|task| task.status = TaskStatus::Merging);
        self.events()
            .status(self.id(), TaskStatus::Merging, Some(total));

        let base = downloaded.percent;
        let last = AtomicU8::new(base);
        let last_merge = AtomicU8::new(0);
        let on_progress = |merge: u8| {
            if last_merge.fetch_max(merge, Ordering::Relaxed) >= merge {
                return;
            }
            debug!(merge, "Merge progress");
            let overall = merge_percent(base, merge);
            if last.fetch_max(overall, Ordering::Relaxed) >= overall {
                return;
            }
            self.update(|task| task.progress = overall);
            self.events().progress(
                self.id(),
                overall,
                downloaded.speed.clone(),
                Some(total),
                Some(total),
            );
        };

        let output = self.request.output_path();
        let duration = Some(manifest.total_duration()).filter(|d| *d > 0.0);
        self.merge_started.store(true, Ordering::Release);
        let remux = self
            .inner
            .remuxer
            .remux(&self.work_dir, &output, duration, Some(&on_progress));

        let result = tokio::select! {
            _ = token.cancelled() => return Err(DownloadError::Cancelled),
            result = remux => result,
        };
        result.map_err(|e| match e {
            DownloadError::Merge { .. } | DownloadError::Cancelled => e,
            other => DownloadError::merge(other.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::StaticSettings;

    #[test]
    fn merge_progress_fills_remaining_share() {
        assert_eq!(merge_percent(99, 0), 99);
        assert_eq!(merge_percent(99, 100), 99);
        assert_eq!(merge_percent(50, 50), 75);
        assert_eq!(merge_percent(0, 100), 99);
        assert_eq!(merge_percent(40, 10), 46);
    }

    #[test]
    fn merge_after_full_download_holds_at_99() {
        assert!((0..=100).all(|merge| merge_percent(99, merge) == 99));
    }

    #[test]
    fn ids_must_be_plain_path_components() {
        assert!(validate_id("task-1").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id("..").is_err());
        assert!(validate_id("a/b").is_err());
        assert!(validate_id("a\\b").is_err());
    }

    #[tokio::test]
    async fn controls_on_unknown_task_are_noops() {
        let (manager, _rx) =
            DownloadManager::new(EngineConfig::default(), Arc::new(StaticSettings::new()));

        assert!(!manager.pause_download("missing"));
        assert!(!manager.resume_download("missing"));
        assert!(!manager.cancel_download("missing"));
        assert!(manager.get_task("missing").is_none());
        assert!(manager.active_tasks().is_empty());
    }

    #[tokio::test]
    async fn invalid_id_is_rejected_before_registration() {
        let (manager, _rx) =
            DownloadManager::new(EngineConfig::default(), Arc::new(StaticSettings::new()));
        let err = manager
            .start_download(DownloadRequest::new("../x", "https://h.test/a.m3u8", "/tmp", "a"))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Configuration { .. }));
        assert!(manager.active_tasks().is_empty());
    }
}
