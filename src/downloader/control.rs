//! Task lifecycle control: abort, bulk clear, resume, archive lifecycle, shutdown.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::admission::Admission;
use super::Downloader;
use crate::error::{Error, ErrorClass, FailureReport, Result};
use crate::types::{Event, TaskId, TaskState};

impl Downloader {
    /// Abort a task
    ///
    /// A queued task leaves the wait queue and becomes `Aborted` immediately.
    /// An in-flight task has its transfer cancelled and becomes `Aborted` once
    /// the transfer has unwound; partial bytes stay on disk.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids, `InvalidState` for completed or failed tasks.
    pub fn abort(&self, id: TaskId) -> Result<()> {
        let event = {
            let mut state = self.lock();
            let Some(current) = state.tasks.get(&id).map(|r| r.state) else {
                return Err(Error::NotFound(id));
            };

            match current {
                TaskState::Aborted => return Ok(()),
                TaskState::Completed | TaskState::Failed => {
                    return Err(Error::InvalidState {
                        id,
                        operation: "abort".to_string(),
                        current_state: current.to_string(),
                    });
                }
                TaskState::Queued => {
                    state.admission.remove_waiting(id);
                    if let Some(record) = state.tasks.get_mut(&id) {
                        record.state = TaskState::Aborted;
                    }
                    Some(Event::TaskStateChanged {
                        id,
                        state: TaskState::Aborted,
                        error: None,
                    })
                }
                TaskState::HeadCheck | TaskState::Transferring | TaskState::Writing => {
                    if let Some(record) = state.tasks.get(&id) {
                        record.cancel.cancel();
                    }
                    None
                }
            }
        };

        tracing::info!(task_id = %id, "Abort requested");
        if let Some(event) = event {
            self.emit_event(event);
        }
        Ok(())
    }

    /// Abort every in-flight task, and queued tasks too if `include_queued`
    ///
    /// Returns the number of tasks signalled.
    pub fn abort_all(&self, include_queued: bool) -> usize {
        let targets: Vec<TaskId> = {
            let state = self.lock();
            state
                .order
                .iter()
                .copied()
                .filter(|id| {
                    state.tasks.get(id).is_some_and(|r| {
                        r.state.is_in_flight() || (include_queued && r.state == TaskState::Queued)
                    })
                })
                .collect()
        };

        tracing::debug!(count = targets.len(), include_queued, "Aborting tasks");
        targets
            .into_iter()
            .filter(|id| self.abort(*id).is_ok())
            .count()
    }

    fn remove_where(&self, predicate: impl Fn(TaskState) -> bool) -> usize {
        let removed: Vec<TaskId> = {
            let mut state = self.lock();
            let removed: Vec<TaskId> = state
                .order
                .iter()
                .copied()
                .filter(|id| state.tasks.get(id).is_some_and(|r| predicate(r.state)))
                .collect();
            for id in &removed {
                state.tasks.remove(id);
            }
            state.order.retain(|id| !removed.contains(id));
            removed
        };

        for id in &removed {
            self.emit_event(Event::TaskRemoved { id: *id });
        }
        removed.len()
    }

    /// Remove every `Completed` task from the list
    pub fn clear_completed(&self) -> usize {
        self.remove_where(|state| state == TaskState::Completed)
    }

    /// Remove every `Failed` or `Aborted` task from the list
    pub fn clear_failed(&self) -> usize {
        self.remove_where(|state| matches!(state, TaskState::Failed | TaskState::Aborted))
    }

    /// Remove one task; an in-flight transfer is cancelled first
    pub fn remove(&self, id: TaskId) -> Result<()> {
        {
            let mut state = self.lock();
            let Some(record) = state.tasks.remove(&id) else {
                return Err(Error::NotFound(id));
            };
            record.cancel.cancel();
            if record.state == TaskState::Queued {
                state.admission.remove_waiting(id);
            }
            state.order.retain(|other| *other != id);
        }

        self.emit_event(Event::TaskRemoved { id });
        Ok(())
    }

    /// Re-admit an `Aborted` or `Failed` task under the same id
    ///
    /// The previous transfer handle is discarded and the next run continues
    /// from the partial file on disk.
    pub fn resume(&self, id: TaskId) -> Result<()> {
        if !self.accepting_new.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let (admitted, new_state) = {
            let mut state = self.lock();
            let Some(record) = state.tasks.get(&id) else {
                return Err(Error::NotFound(id));
            };
            if !matches!(record.state, TaskState::Aborted | TaskState::Failed) {
                return Err(Error::InvalidState {
                    id,
                    operation: "resume".to_string(),
                    current_state: record.state.to_string(),
                });
            }
            if let Some(container) = record.target.container() {
                self.archives.check_available(container)?;
            }
            let priority = record.request.priority;

            let admitted = state.admission.admit(id, priority) == Admission::Admitted;
            let Some(record) = state.tasks.get_mut(&id) else {
                return Err(Error::NotFound(id));
            };
            record.generation += 1;
            record.cancel = CancellationToken::new();
            record.force_resume = true;
            record.error = None;
            record.fail_reason = None;
            record.state = if admitted {
                record.starting_state()
            } else {
                TaskState::Queued
            };
            (admitted, record.state)
        };

        tracing::info!(task_id = %id, admitted, "Download resumed");
        self.emit_event(Event::TaskStateChanged {
            id,
            state: new_state,
            error: None,
        });
        if admitted {
            self.spawn_run(id);
        }
        Ok(())
    }

    /// Fail every unfinished task bound to `container` with `reason`
    pub(crate) fn fail_bound_tasks(&self, container: &Path, reason: &str) -> usize {
        let report = FailureReport {
            class: ErrorClass::Sink,
            detail: reason.to_string(),
        };

        let mut events = Vec::new();
        let count = {
            let mut state = self.lock();
            let bound: Vec<TaskId> = state
                .tasks
                .iter()
                .filter(|(_, r)| r.target.container() == Some(container) && !r.state.is_terminal())
                .map(|(id, _)| *id)
                .collect();

            for id in &bound {
                let queued = state.admission.remove_waiting(*id);
                if let Some(record) = state.tasks.get_mut(id) {
                    if queued {
                        record.state = TaskState::Failed;
                        record.error = Some(report.clone());
                        events.push(Event::TaskStateChanged {
                            id: *id,
                            state: TaskState::Failed,
                            error: Some(report.clone()),
                        });
                    } else {
                        record.fail_reason = Some(report.clone());
                        record.cancel.cancel();
                    }
                }
            }
            bound.len()
        };

        for event in events {
            self.emit_event(event);
        }
        count
    }

    /// Watch the archive registry and fail every task bound to a failed sink
    pub(crate) fn start_sink_monitor(&self) {
        let mut failures = self.archives.subscribe_failures();
        let downloader = self.clone();
        let shutdown = self.shutdown_token.clone();

        tokio::spawn(async move {
            loop {
                let failure = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    failure = failures.recv() => failure,
                };

                match failure {
                    Ok(failure) => {
                        let reason = format!("sink closed: {}", failure.reason);
                        let affected = downloader.fail_bound_tasks(&failure.container, &reason);
                        tracing::error!(
                            container = %failure.container.display(),
                            error = %failure.reason,
                            affected,
                            "Archive sink failed"
                        );
                        downloader.emit_event(Event::SinkFailed {
                            container: failure.container,
                            error: failure.reason,
                        });
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Sink failure monitor lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Finalize a ZIP container
    ///
    /// Tasks still bound to it fail with "sink closed". A later submit to the
    /// same container appends to the finalized archive.
    pub async fn close_archive(&self, container: impl AsRef<Path>) -> Result<bool> {
        let container = container.as_ref();
        let affected = self.fail_bound_tasks(container, "sink closed");
        if affected > 0 {
            tracing::warn!(
                container = %container.display(),
                affected,
                "Closing archive with unfinished tasks"
            );
        }
        self.archives.close(container).await
    }

    /// Re-enable a failed container so new submissions are accepted
    pub fn reopen_archive(&self, container: impl AsRef<Path>) -> bool {
        self.archives.reopen(container.as_ref())
    }

    /// Gracefully shut down the downloader
    ///
    /// 1. Stops accepting new downloads
    /// 2. Aborts queued and in-flight tasks
    /// 3. Waits for in-flight transfers to unwind (30 second limit)
    /// 4. Finalizes every open archive
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating graceful shutdown");

        self.accepting_new.store(false, Ordering::SeqCst);
        self.emit_event(Event::Shutdown);

        let signalled = self.abort_all(true);
        tracing::info!(signalled, "Signalled all downloads to stop");

        let wait_result =
            tokio::time::timeout(Duration::from_secs(30), self.wait_for_in_flight()).await;
        if wait_result.is_err() {
            tracing::warn!("Timeout waiting for downloads to stop, proceeding with shutdown");
        }

        let closed = self.archives.close_all().await;
        tracing::info!(archives = closed.len(), "Archives finalized");

        self.shutdown_token.cancel();
        tracing::info!("Graceful shutdown complete");
        Ok(())
    }

    async fn wait_for_in_flight(&self) {
        loop {
            let in_flight = self.in_flight_count();
            if in_flight == 0 {
                return;
            }
            tracing::debug!(in_flight, "Waiting for in-flight downloads to stop");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
