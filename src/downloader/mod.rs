//! Download orchestrator split into focused submodules.
//!
//! The [`Downloader`] struct and its methods are organized by concern:
//! - [`target`] - URL validation and destination resolution
//! - [`admission`] - Concurrency ceiling and priority wait queue
//! - [`collision`] - Existing-destination policy and the user prompt
//! - [`transfer`] - Resume probe, streaming transfer and writer hand-off
//! - [`control`] - Abort, bulk clear, resume, archive lifecycle, shutdown

mod admission;
pub mod collision;
mod control;
pub mod target;
mod transfer;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Error, FailureReport, Result};
use crate::transport::{RedirectPolicy, ReqwestTransport, Transport};
use crate::types::{CollisionPolicy, DownloadRequest, Event, TaskId, TaskInfo, TaskState};
use crate::writer::archive::ArchiveRegistry;
use admission::{Admission, AdmissionQueue};
use collision::{CollisionPrompt, FixedPrompt};
use target::Target;

/// Bookkeeping for one task; only touched under the state lock
#[derive(Debug)]
pub(crate) struct TaskRecord {
    pub(crate) request: DownloadRequest,
    pub(crate) target: Target,
    pub(crate) state: TaskState,
    pub(crate) byte_offset: u64,
    pub(crate) bytes_received: u64,
    pub(crate) bytes_total: Option<u64>,
    pub(crate) error: Option<FailureReport>,
    /// Handle of the current transfer
    pub(crate) cancel: CancellationToken,
    /// Bumped whenever the task is re-admitted; completions from older runs are ignored
    pub(crate) generation: u64,
    /// Set when something other than the user stopped the task
    pub(crate) fail_reason: Option<FailureReport>,
    /// `resume(id)` forces the resume policy on the next run
    pub(crate) force_resume: bool,
}

impl TaskRecord {
    fn info(&self, id: TaskId) -> TaskInfo {
        TaskInfo {
            id,
            url: self.request.url.clone(),
            destination: self.target.display_path(),
            state: self.state,
            byte_offset: self.byte_offset,
            bytes_received: self.bytes_received,
            bytes_total: self.bytes_total,
            priority: self.request.priority,
            error: self.error.clone(),
        }
    }

    /// State a freshly admitted run starts in
    fn starting_state(&self) -> TaskState {
        if self.force_resume || self.request.collision == Some(CollisionPolicy::Resume) {
            TaskState::HeadCheck
        } else {
            TaskState::Transferring
        }
    }
}

/// Task table and admission state behind one lock
#[derive(Debug)]
pub(crate) struct State {
    pub(crate) tasks: HashMap<TaskId, TaskRecord>,
    /// Submission order, for presentation
    pub(crate) order: Vec<TaskId>,
    pub(crate) admission: AdmissionQueue,
}

/// How a run ended
#[derive(Debug)]
pub(crate) enum Outcome {
    Completed,
    Aborted,
    Failed(Error),
}

/// Bounded-concurrency download orchestrator (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct Downloader {
    pub(crate) config: Arc<Config>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) prompt: Arc<dyn CollisionPrompt>,
    pub(crate) redirect_policy: RedirectPolicy,
    pub(crate) state: Arc<Mutex<State>>,
    pub(crate) archives: ArchiveRegistry,
    /// Event broadcast channel sender (multiple subscribers supported)
    pub(crate) event_tx: broadcast::Sender<Event>,
    pub(crate) next_id: Arc<AtomicU64>,
    /// Sticky "overwrite all" answer from the collision prompt
    pub(crate) overwrite_all: Arc<AtomicBool>,
    /// Flag to indicate whether new downloads are accepted (cleared during shutdown)
    pub(crate) accepting_new: Arc<AtomicBool>,
    /// Stops background monitors on shutdown
    pub(crate) shutdown_token: CancellationToken,
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("download_dir", &self.config.download.download_dir)
            .field(
                "max_concurrent_downloads",
                &self.config.download.max_concurrent_downloads,
            )
            .finish_non_exhaustive()
    }
}

impl Downloader {
    /// Create a downloader over `transport`
    ///
    /// Creates the download directory and starts the archive-sink failure
    /// monitor. Must be called inside a Tokio runtime.
    pub async fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        prompt: Arc<dyn CollisionPrompt>,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(&config.download.download_dir)
            .await
            .map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "Failed to create download directory '{}': {}",
                        config.download.download_dir.display(),
                        e
                    ),
                ))
            })?;

        // Create broadcast channel with buffer size of 1000 events
        let (event_tx, _rx) = broadcast::channel(1000);

        let redirect_policy =
            RedirectPolicy::new(config.redirect.allow_list.clone(), config.http.max_redirects);
        let admission = AdmissionQueue::new(config.download.concurrency_limit());

        let downloader = Self {
            config: Arc::new(config),
            transport,
            prompt,
            redirect_policy,
            state: Arc::new(Mutex::new(State {
                tasks: HashMap::new(),
                order: Vec::new(),
                admission,
            })),
            archives: ArchiveRegistry::new(),
            event_tx,
            next_id: Arc::new(AtomicU64::new(1)),
            overwrite_all: Arc::new(AtomicBool::new(false)),
            accepting_new: Arc::new(AtomicBool::new(true)),
            shutdown_token: CancellationToken::new(),
        };

        downloader.start_sink_monitor();
        Ok(downloader)
    }

    /// Create a downloader with the HTTP transport and a prompt that answers
    /// every collision with the configured default (or abort)
    pub async fn with_http(config: Config) -> Result<Self> {
        let transport = ReqwestTransport::new(&config.http, &config.redirect)?;
        let prompt = FixedPrompt(
            config
                .download
                .default_collision
                .unwrap_or(CollisionPolicy::Abort),
        );
        Self::new(config, Arc::new(transport), Arc::new(prompt)).await
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn emit_event(&self, event: Event) {
        // no subscribers is fine
        let _ = self.event_tx.send(event);
    }

    fn emit_all(&self, events: Vec<Event>) {
        for event in events {
            self.emit_event(event);
        }
    }

    /// Subscribe to task and sink events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Sender side of the event bus, for publishing job events alongside task events
    pub fn event_sender(&self) -> broadcast::Sender<Event> {
        self.event_tx.clone()
    }

    /// Events as a stream; lagged events are skipped
    pub fn event_stream(&self) -> impl futures::Stream<Item = Event> + Send + 'static {
        use futures::StreamExt;
        tokio_stream::wrappers::BroadcastStream::new(self.event_tx.subscribe())
            .filter_map(|event| async move { event.ok() })
    }

    /// Request a file fetch
    ///
    /// Validation happens here, before any network I/O: the URL must be
    /// absolute http(s) and the destination must yield a file name. The only
    /// filesystem access is the existing-directory check described on
    /// [`target::resolve_target`]. The task is
    /// admitted or queued before this returns; the transfer itself runs in the
    /// background.
    pub fn submit(&self, request: DownloadRequest) -> Result<TaskId> {
        if !self.accepting_new.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let url = target::validate_url(&request.url)?;
        let target = target::resolve_target(
            &url,
            request.destination.as_deref(),
            &self.config.download.download_dir,
        )?;
        if let Some(container) = target.container() {
            self.archives.check_available(container)?;
        }

        let id = TaskId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let destination = target.display_path();
        let priority = request.priority;
        let url = request.url.clone();

        let mut record = TaskRecord {
            request,
            target,
            state: TaskState::Queued,
            byte_offset: 0,
            bytes_received: 0,
            bytes_total: None,
            error: None,
            cancel: CancellationToken::new(),
            generation: 0,
            fail_reason: None,
            force_resume: false,
        };

        let (admitted, initial_state) = {
            let mut state = self.lock();
            let admitted = state.admission.admit(id, priority) == Admission::Admitted;
            if admitted {
                record.state = record.starting_state();
            }
            let initial_state = record.state;
            state.tasks.insert(id, record);
            state.order.push(id);
            (admitted, initial_state)
        };

        tracing::info!(
            task_id = %id,
            url = %url,
            destination = %destination.display(),
            admitted,
            "Download submitted"
        );

        self.emit_event(Event::TaskCreated {
            id,
            url,
            destination,
        });
        self.emit_event(Event::TaskStateChanged {
            id,
            state: initial_state,
            error: None,
        });

        if admitted {
            self.spawn_run(id);
        }
        Ok(id)
    }

    /// Start the transfer for an admitted task
    pub(crate) fn spawn_run(&self, id: TaskId) {
        let Some((token, generation)) = self
            .lock()
            .tasks
            .get(&id)
            .map(|r| (r.cancel.clone(), r.generation))
        else {
            return;
        };

        let downloader = self.clone();
        tokio::spawn(async move {
            let outcome = downloader.run_task(id, token, generation).await;
            downloader.complete(id, generation, outcome);
        });
    }

    /// Record the terminal state of a run and promote queued tasks
    pub(crate) fn complete(&self, id: TaskId, generation: u64, outcome: Outcome) {
        let mut events = Vec::new();
        let promoted = {
            let mut state = self.lock();

            let current = state.tasks.get(&id).map(|r| r.generation);
            if current.is_some_and(|g| g != generation) {
                tracing::debug!(task_id = %id, generation, "Ignoring stale completion");
                return;
            }

            if let Some(record) = state.tasks.get_mut(&id) {
                let (new_state, error) = match outcome {
                    Outcome::Completed => (TaskState::Completed, None),
                    Outcome::Aborted => match record.fail_reason.take() {
                        Some(reason) => (TaskState::Failed, Some(reason)),
                        None => (TaskState::Aborted, None),
                    },
                    Outcome::Failed(e) => {
                        let report = record
                            .fail_reason
                            .take()
                            .unwrap_or_else(|| FailureReport::from(&e));
                        (TaskState::Failed, Some(report))
                    }
                };

                match new_state {
                    TaskState::Completed => tracing::info!(
                        task_id = %id,
                        bytes = record.bytes_received,
                        "Download completed"
                    ),
                    TaskState::Failed => tracing::error!(
                        task_id = %id,
                        error = %error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
                        "Download failed"
                    ),
                    _ => tracing::info!(task_id = %id, "Download aborted"),
                }

                record.state = new_state;
                record.error = error.clone();
                events.push(Event::TaskStateChanged {
                    id,
                    state: new_state,
                    error,
                });
            }

            let promoted = state.admission.release(id);
            for next in &promoted {
                if let Some(record) = state.tasks.get_mut(next) {
                    record.state = record.starting_state();
                    events.push(Event::TaskStateChanged {
                        id: *next,
                        state: record.state,
                        error: None,
                    });
                }
            }
            promoted
        };

        self.emit_all(events);
        for next in promoted {
            tracing::debug!(task_id = %next, "Promoting queued download");
            self.spawn_run(next);
        }
    }

    /// Update a task's state if it is still on `generation`
    pub(crate) fn set_state(&self, id: TaskId, generation: u64, new_state: TaskState) {
        let changed = {
            let mut state = self.lock();
            match state.tasks.get_mut(&id) {
                Some(record) if record.generation == generation && record.state != new_state => {
                    record.state = new_state;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.emit_event(Event::TaskStateChanged {
                id,
                state: new_state,
                error: None,
            });
        }
    }

    /// Snapshot of every task in submission order
    pub fn tasks(&self) -> Vec<TaskInfo> {
        let state = self.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.tasks.get(id).map(|record| record.info(*id)))
            .collect()
    }

    /// Snapshot of one task
    pub fn task(&self, id: TaskId) -> Option<TaskInfo> {
        self.lock().tasks.get(&id).map(|record| record.info(id))
    }

    /// Number of tasks holding a transfer slot
    pub fn in_flight_count(&self) -> usize {
        self.lock().admission.in_flight_len()
    }

    /// Number of tasks waiting for a slot
    pub fn queued_count(&self) -> usize {
        self.lock().admission.waiting_len()
    }
}
