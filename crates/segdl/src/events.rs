use serde::Serialize;
use tokio::sync::mpsc;
use tracing::trace;

use crate::task::TaskStatus;

/// Default capacity of the event channel.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Lifecycle and progress notifications pushed to the embedding application.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DownloadEvent {
    #[serde(rename_all = "camelCase")]
    Status {
        id: String,
        status: TaskStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        total_segments: Option<usize>,
    },
    #[serde(rename_all = "camelCase")]
    Progress {
        id: String,
        progress: u8,
        speed: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        downloaded_segments: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        total_segments: Option<usize>,
    },
    Error { id: String, error: String },
}

impl DownloadEvent {
    pub fn id(&self) -> &str {
        match self {
            Self::Status { id, .. } | Self::Progress { id, .. } | Self::Error { id, .. } => id,
        }
    }
}

/// Best-effort, non-blocking event delivery.
///
/// Sending never waits: when the listener is absent, gone, or behind by more than the
/// channel capacity, the event is dropped.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<DownloadEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<DownloadEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Creates a sink together with the receiving end of a bounded channel.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<DownloadEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    /// A sink that discards everything.
    pub fn noop() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: DownloadEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(e) = tx.try_send(event) {
            trace!(error = %e, "Dropping download event");
        }
    }

    pub fn status(&self, id: &str, status: TaskStatus, total_segments: Option<usize>) {
        self.emit(DownloadEvent::Status {
            id: id.to_string(),
            status,
            total_segments,
        });
    }

    pub fn progress(
        &self,
        id: &str,
        progress: u8,
        speed: impl Into<String>,
        downloaded_segments: Option<usize>,
        total_segments: Option<usize>,
    ) {
        self.emit(DownloadEvent::Progress {
            id: id.to_string(),
            progress,
            speed: speed.into(),
            downloaded_segments,
            total_segments,
        });
    }

    pub fn error(&self, id: &str, error: impl Into<String>) {
        self.emit(DownloadEvent::Error {
            id: id.to_string(),
            error: error.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag_and_camel_case() {
        let event = DownloadEvent::Progress {
            id: "t1".to_string(),
            progress: 42,
            speed: "1.00 KB/s".to_string(),
            downloaded_segments: Some(5),
            total_segments: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["downloadedSegments"], 5);
        assert!(json.get("totalSegments").is_none());

        let status = DownloadEvent::Status {
            id: "t1".to_string(),
            status: TaskStatus::Merging,
            total_segments: Some(3),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["status"], "merging");
        assert_eq!(json["totalSegments"], 3);
    }

    #[test]
    fn full_channel_drops_instead_of_blocking() {
        let (sink, mut rx) = EventSink::channel(1);
        sink.error("a", "first");
        sink.error("a", "second");

        assert_eq!(
            rx.try_recv().unwrap(),
            DownloadEvent::Error {
                id: "a".to_string(),
                error: "first".to_string()
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_or_absent_listener_is_a_noop() {
        let (sink, rx) = EventSink::channel(4);
        drop(rx);
        sink.status("a", TaskStatus::Pending, None);

        EventSink::noop().status("a", TaskStatus::Pending, None);
    }
}
