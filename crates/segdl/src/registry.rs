//! Bookkeeping for active download tasks.
//!
//! Every active task owns one entry: its control handle (cancellation token, pause cell
//! and a completion signal for its pipeline) and the observable [`Task`] snapshot. Entries
//! carry a generation number so that a pipeline which outlives its entry (after a cancel)
//! can never touch the entry of a later task that reuses the id.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

use crate::error::{DownloadError, Result};
use crate::task::{DownloadRequest, Task};

/// Cancellation and pause signals for one task.
#[derive(Debug)]
pub struct TaskControl {
    token: CancellationToken,
    pause_tx: watch::Sender<bool>,
    /// Fired once the pipeline has fully unwound.
    finished: CancellationToken,
}

impl TaskControl {
    pub fn new() -> Self {
        let (pause_tx, _) = watch::channel(false);
        Self {
            token: CancellationToken::new(),
            pause_tx,
            finished: CancellationToken::new(),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// A receiver observing the pause cell.
    pub fn pause_receiver(&self) -> watch::Receiver<bool> {
        self.pause_tx.subscribe()
    }

    pub fn is_paused(&self) -> bool {
        *self.pause_tx.borrow()
    }

    /// Sets the pause cell. Returns `false` if it was already set.
    pub fn pause(&self) -> bool {
        self.pause_tx.send_if_modified(|paused| !std::mem::replace(paused, true))
    }

    /// Clears the pause cell. Returns `false` if it was not set.
    pub fn resume(&self) -> bool {
        self.pause_tx.send_if_modified(|paused| std::mem::replace(paused, false))
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Signals pipeline completion when dropped, including on panic.
    pub fn finished_guard(&self) -> DropGuard {
        self.finished.clone().drop_guard()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }
}

impl Default for TaskControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned when a task is registered.
#[derive(Debug, Clone)]
pub struct Registration {
    pub generation: u64,
    pub control: Arc<TaskControl>,
}

struct TaskEntry {
    generation: u64,
    control: Arc<TaskControl>,
    snapshot: Task,
}

#[derive(Default)]
pub struct TaskRegistry {
    tasks: DashMap<String, TaskEntry>,
    /// Pipelines of cancelled tasks that may still be unwinding.
    draining: DashMap<String, (u64, Arc<TaskControl>)>,
    next_generation: AtomicU64,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new `pending` task. Fails if the id is already active, or if a
    /// cancelled pipeline with the same id has not finished unwinding.
    pub fn register(&self, request: &DownloadRequest) -> Result<Registration> {
        match self.tasks.entry(request.id.clone()) {
            MapEntry::Occupied(_) => Err(DownloadError::DuplicateTask {
                id: request.id.clone(),
            }),
            MapEntry::Vacant(_) if self.is_draining(&request.id) => {
                Err(DownloadError::TaskDraining {
                    id: request.id.clone(),
                })
            }
            MapEntry::Vacant(slot) => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
                let control = Arc::new(TaskControl::new());
                slot.insert(TaskEntry {
                    generation,
                    control: Arc::clone(&control),
                    snapshot: Task::from_request(request),
                });
                debug!(id = %request.id, generation, "Task registered");
                Ok(Registration {
                    generation,
                    control,
                })
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    /// Whether a cancelled pipeline for `id` is still unwinding.
    pub fn is_draining(&self, id: &str) -> bool {
        self.draining
            .get(id)
            .is_some_and(|entry| !entry.1.is_finished())
    }

    /// Waits until a cancelled pipeline for `id`, if any, has finished unwinding.
    ///
    /// The draining entry stays in place while waiting, so concurrent callers all wait
    /// on it; it is released by [`TaskRegistry::finish`] or, if the pipeline never got
    /// there, once its completion signal has fired.
    pub async fn wait_drained(&self, id: &str) {
        loop {
            let Some(control) = self.draining.get(id).map(|entry| Arc::clone(&entry.1)) else {
                return;
            };
            debug!(id, "Waiting for cancelled pipeline to unwind");
            control.finished.cancelled().await;
            self.draining
                .remove_if(id, |_, (_, draining)| draining.is_finished());
        }
    }

    pub fn control(&self, id: &str) -> Option<Arc<TaskControl>> {
        self.tasks.get(id).map(|entry| Arc::clone(&entry.control))
    }

    /// Cloned snapshot of an active task.
    pub fn get(&self, id: &str) -> Option<Task> {
        self.tasks.get(id).map(|entry| entry.snapshot.clone())
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.tasks.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Applies `f` to the snapshot of `id`, but only if the entry still belongs to
    /// `generation`. Returns whether the snapshot was updated.
    pub fn update<F>(&self, id: &str, generation: u64, f: F) -> bool
    where
        F: FnOnce(&mut Task),
    {
        match self.tasks.get_mut(id) {
            Some(mut entry) if entry.generation == generation => {
                f(&mut entry.snapshot);
                true
            }
            _ => false,
        }
    }

    /// Applies `f` to the snapshot of whichever task currently owns `id`.
    pub fn update_current<F, R>(&self, id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&TaskControl, &mut Task) -> R,
    {
        let mut entry = self.tasks.get_mut(id)?;
        let entry = &mut *entry;
        Some(f(&entry.control, &mut entry.snapshot))
    }

    /// Removes the task owning `id` after a cancel. Its control is kept until the
    /// pipeline finishes so a later task with the same id can wait for it.
    ///
    /// The draining entry is recorded before the active entry goes away, so `register`
    /// never sees the id as free while the pipeline is still running.
    pub fn remove_cancelled(&self, id: &str) -> Option<Task> {
        let (generation, control) = self
            .tasks
            .get(id)
            .map(|entry| (entry.generation, Arc::clone(&entry.control)))?;
        self.draining
            .insert(id.to_string(), (generation, control));
        let (_, entry) = self
            .tasks
            .remove_if(id, |_, entry| entry.generation == generation)?;
        Some(entry.snapshot)
    }

    /// Releases the bookkeeping of a pipeline that has finished its cleanup.
    pub fn finish(&self, id: &str, generation: u64) {
        self.tasks
            .remove_if(id, |_, entry| entry.generation == generation);
        self.draining
            .remove_if(id, |_, (draining, _)| *draining == generation);
    }
}
