//! Terminal rendering of download events.

use std::path::PathBuf;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use segdl_engine::{DownloadEvent, TaskStatus};

const BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}";

/// How a task ended, as seen from its events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finished {
    Completed,
    Failed(String),
}

pub struct ProgressView {
    bar: ProgressBar,
    id: String,
    output: PathBuf,
}

impl ProgressView {
    pub fn new(id: impl Into<String>, output: PathBuf, hidden: bool) -> Self {
        let bar = if hidden {
            ProgressBar::hidden()
        } else {
            let bar = ProgressBar::new(100);
            bar.set_style(
                ProgressStyle::with_template(BAR_TEMPLATE)
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("=> "),
            );
            bar.enable_steady_tick(Duration::from_millis(120));
            bar
        };
        bar.set_message("resolving playlist");
        Self {
            bar,
            id: id.into(),
            output,
        }
    }

    /// Renders `event` and reports whether the task has finished.
    pub fn handle(&self, event: &DownloadEvent) -> Option<Finished> {
        if event.id() != self.id {
            return None;
        }
        match event {
            DownloadEvent::Status {
                status,
                total_segments,
                ..
            } => match status {
                TaskStatus::Pending => None,
                TaskStatus::Downloading => {
                    let total = total_segments.unwrap_or(0);
                    self.bar.set_message(format!("downloading {total} segments"));
                    None
                }
                TaskStatus::Paused => {
                    self.bar.set_message("paused");
                    None
                }
                TaskStatus::Merging => {
                    self.bar.set_message("merging segments");
                    None
                }
                TaskStatus::Completed => {
                    self.bar.set_position(100);
                    self.bar
                        .finish_with_message(format!("saved to {}", self.output.display()));
                    Some(Finished::Completed)
                }
                TaskStatus::Error => None,
            },
            DownloadEvent::Progress {
                progress,
                speed,
                downloaded_segments,
                total_segments,
                ..
            } => {
                self.bar.set_position(u64::from(*progress));
                self.bar.set_message(progress_message(
                    *downloaded_segments,
                    *total_segments,
                    speed,
                ));
                None
            }
            DownloadEvent::Error { error, .. } => {
                self.bar.abandon_with_message(format!("failed: {error}"));
                Some(Finished::Failed(error.clone()))
            }
        }
    }

    pub fn cancelled(&self) {
        self.bar.abandon_with_message("cancelled");
    }
}

pub fn progress_message(
    downloaded: Option<usize>,
    total: Option<usize>,
    speed: &str,
) -> String {
    match (downloaded, total) {
        (Some(done), Some(total)) => format!("{done}/{total} segments, {speed}"),
        _ => speed.to_string(),
    }
}
