//! Extraction jobs: paged harvesting of remote listings.
//!
//! A [`JobScheduler`] turns a [`JobSpec`] into a running job. Each job walks
//! its listing page by page (see [`pagination`]), resolves covers for every
//! accepted item (see [`covers`]) and reports exactly one terminal outcome.
//!
//! - [`barrier`] - countdown join-barrier for fan-out sub-fetches
//! - [`gate`] - per-kind creation cooldown
//! - [`cache`] - processed cover cache
//! - [`context`] - per-job transport, settings and cancellation

pub mod barrier;
pub mod bookmarks;
pub mod cache;
pub mod context;
pub mod covers;
pub mod gallery;
pub mod gate;
pub mod pagination;
pub mod single_post;
pub mod tag_search;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::error::{ErrorClass, FailureReport, Result};
use crate::transport::Transport;
use crate::types::{Event, Item, JobId, JobKind, JobState};
use bookmarks::BookmarksSource;
use cache::CoverCache;
use context::JobContext;
use gallery::GallerySource;
use gate::CreationGate;
use pagination::{PagedJob, ResultFilter};
use single_post::SinglePostSource;
use tag_search::TagSearchSource;

/// A unit of extraction work
#[async_trait]
pub trait ExtractionJob: Send {
    /// Concrete kind
    fn kind(&self) -> JobKind;

    /// Worker description for diagnostics
    fn describe(&self) -> String;

    /// Harvest items; must call [`JobContext::checkpoint`] at every resume point
    async fn run(&mut self, ctx: &JobContext) -> Result<Vec<Item>>;
}

/// What to harvest
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobSpec {
    /// Every work of a profile
    Gallery {
        /// Profile id
        user_id: String,
        /// Result filter
        #[serde(default)]
        filter: ResultFilter,
    },
    /// Works matching a tag
    TagSearch {
        /// Tag or keyword
        tag: String,
        /// Result filter
        #[serde(default)]
        filter: ResultFilter,
    },
    /// A profile's bookmarks
    Bookmarks {
        /// Profile id
        user_id: String,
        /// Result filter
        #[serde(default)]
        filter: ResultFilter,
    },
    /// One post
    SinglePost {
        /// Post id
        post_id: String,
    },
}

impl JobSpec {
    /// Kind of job this spec creates
    pub fn kind(&self) -> JobKind {
        match self {
            JobSpec::Gallery { .. } => JobKind::Gallery,
            JobSpec::TagSearch { .. } => JobKind::TagSearch,
            JobSpec::Bookmarks { .. } => JobKind::Bookmarks,
            JobSpec::SinglePost { .. } => JobKind::SinglePost,
        }
    }

    /// Build the job
    pub fn into_job(self) -> Box<dyn ExtractionJob> {
        match self {
            JobSpec::Gallery { user_id, filter } => Box::new(PagedJob::new(
                JobKind::Gallery,
                GallerySource::new(user_id),
                filter,
            )),
            JobSpec::TagSearch { tag, filter } => {
                let source = TagSearchSource::new(tag, filter.rating, filter.tag_mode);
                Box::new(PagedJob::new(JobKind::TagSearch, source, filter))
            }
            JobSpec::Bookmarks { user_id, filter } => Box::new(PagedJob::new(
                JobKind::Bookmarks,
                BookmarksSource::new(user_id),
                filter,
            )),
            JobSpec::SinglePost { post_id } => Box::new(PagedJob::new(
                JobKind::SinglePost,
                SinglePostSource::new(post_id),
                ResultFilter::default(),
            )),
        }
    }
}

/// Terminal outcome of a job
#[derive(Clone, Debug, PartialEq)]
pub enum JobOutcome {
    /// Completed, or stopped cleanly by cancellation (with no items)
    Finished {
        /// Harvested items
        items: Vec<Item>,
        /// Whether the job was cancelled
        cancelled: bool,
    },
    /// Stopped by an unrecoverable error
    Failed(FailureReport),
}

/// Snapshot of a live job
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobInfo {
    /// Job ID
    pub id: JobId,
    /// Job kind
    pub kind: JobKind,
    /// Current state
    pub state: JobState,
    /// Worker description
    pub description: String,
}

/// Handle to a started job
#[derive(Debug)]
pub struct JobHandle {
    id: JobId,
    kind: JobKind,
    description: String,
    token: CancellationToken,
    outcome: oneshot::Receiver<JobOutcome>,
}

impl JobHandle {
    /// Job ID
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Job kind
    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// Worker description
    pub fn describe(&self) -> &str {
        &self.description
    }

    /// Request cooperative cancellation
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Wait for the terminal outcome
    pub async fn wait(self) -> JobOutcome {
        match self.outcome.await {
            Ok(outcome) => outcome,
            Err(_) => JobOutcome::Failed(FailureReport {
                class: ErrorClass::Internal,
                detail: "job task ended without an outcome".to_string(),
            }),
        }
    }
}

struct JobEntry {
    kind: JobKind,
    state: JobState,
    description: String,
    token: CancellationToken,
}

/// Creates and tracks extraction jobs (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct JobScheduler {
    config: Arc<Config>,
    transport: Arc<dyn Transport>,
    gate: Arc<CreationGate>,
    cache: Arc<CoverCache>,
    jobs: Arc<Mutex<HashMap<JobId, JobEntry>>>,
    next_id: Arc<AtomicU64>,
    event_tx: broadcast::Sender<Event>,
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("base_url", &self.config.site.base_url)
            .field("cooldown", &self.gate.cooldown())
            .finish_non_exhaustive()
    }
}

impl JobScheduler {
    /// Scheduler with injected creation gate and cover cache
    pub fn new(
        config: Arc<Config>,
        transport: Arc<dyn Transport>,
        gate: Arc<CreationGate>,
        cache: Arc<CoverCache>,
    ) -> Self {
        let (event_tx, _rx) = broadcast::channel(1000);
        Self {
            config,
            transport,
            gate,
            cache,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            event_tx,
        }
    }

    /// Scheduler whose gate and cache are sized from `config.jobs`
    pub fn from_config(config: Arc<Config>, transport: Arc<dyn Transport>) -> Self {
        let gate = Arc::new(CreationGate::new(config.jobs.creation_cooldown));
        let cache = Arc::new(CoverCache::new(config.jobs.cover_cache_capacity));
        Self::new(config, transport, gate, cache)
    }

    /// Publish job events on an existing channel (e.g. the downloader's)
    pub fn with_event_sender(mut self, event_tx: broadcast::Sender<Event>) -> Self {
        self.event_tx = event_tx;
        self
    }

    /// Subscribe to job events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, JobEntry>> {
        match self.jobs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit_event(&self, event: Event) {
        // no subscribers is fine
        let _ = self.event_tx.send(event);
    }

    /// Start a job
    ///
    /// Returns `None` without starting anything when a job of the same kind
    /// was created within the cooldown window.
    pub fn start(&self, spec: JobSpec) -> Option<JobHandle> {
        let kind = spec.kind();
        if !self.gate.try_acquire(kind) {
            debug!(kind = %kind, "Job request dropped by creation cooldown");
            return None;
        }

        let id = JobId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let token = CancellationToken::new();
        let job = spec.into_job();
        let description = job.describe();

        self.lock().insert(
            id,
            JobEntry {
                kind,
                state: JobState::Idle,
                description: description.clone(),
                token: token.clone(),
            },
        );

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let scheduler = self.clone();
        let run_token = token.clone();
        tokio::spawn(async move {
            let outcome = scheduler.run_job(id, job, run_token).await;
            // the handle may have been dropped
            let _ = outcome_tx.send(outcome);
        });

        Some(JobHandle {
            id,
            kind,
            description,
            token,
            outcome: outcome_rx,
        })
    }

    async fn run_job(
        &self,
        id: JobId,
        mut job: Box<dyn ExtractionJob>,
        token: CancellationToken,
    ) -> JobOutcome {
        let kind = job.kind();
        let description = job.describe();
        self.set_state(id, JobState::Running);
        info!(job_id = %id, kind = %kind, description = %description, "Job started");
        self.emit_event(Event::JobStarted {
            id,
            kind,
            description,
        });

        let result = match JobContext::new(
            id,
            self.transport.clone(),
            self.config.clone(),
            self.cache.clone(),
            token.clone(),
        ) {
            Ok(ctx) => job.run(&ctx).await,
            Err(e) => Err(e),
        };

        let outcome = match result {
            Ok(items) if !token.is_cancelled() => JobOutcome::Finished {
                items,
                cancelled: false,
            },
            Err(e) if !e.is_cancelled() && !token.is_cancelled() => {
                JobOutcome::Failed(FailureReport::from(&e))
            }
            _ => JobOutcome::Finished {
                items: Vec::new(),
                cancelled: true,
            },
        };

        let event = match &outcome {
            JobOutcome::Finished { items, cancelled } => {
                info!(job_id = %id, items = items.len(), cancelled, "Job finished");
                Event::JobFinished {
                    id,
                    kind,
                    items: items.clone(),
                    cancelled: *cancelled,
                }
            }
            JobOutcome::Failed(reason) => {
                error!(job_id = %id, class = %reason.class, error = %reason.detail, "Job failed");
                Event::JobFailed {
                    id,
                    kind,
                    reason: reason.clone(),
                }
            }
        };

        self.lock().remove(&id);
        self.emit_event(event);
        outcome
    }

    fn set_state(&self, id: JobId, state: JobState) {
        if let Some(entry) = self.lock().get_mut(&id) {
            entry.state = state;
        }
    }

    /// Request cancellation of a running job
    ///
    /// Returns `false` if the job is unknown or already finished.
    pub fn cancel(&self, id: JobId) -> bool {
        let mut jobs = self.lock();
        let Some(entry) = jobs.get_mut(&id) else {
            return false;
        };
        entry.state = JobState::Cancelling;
        entry.token.cancel();
        info!(job_id = %id, "Job cancellation requested");
        true
    }

    /// Cancel every live job; returns how many were signalled
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<JobId> = self.lock().keys().copied().collect();
        ids.into_iter().filter(|id| self.cancel(*id)).count()
    }

    /// State of a live job; `None` once its outcome was reported
    pub fn state(&self, id: JobId) -> Option<JobState> {
        self.lock().get(&id).map(Self::effective_state)
    }

    /// Snapshot of every live job
    pub fn active_jobs(&self) -> Vec<JobInfo> {
        let jobs = self.lock();
        let mut active: Vec<JobInfo> = jobs
            .iter()
            .map(|(id, entry)| JobInfo {
                id: *id,
                kind: entry.kind,
                state: Self::effective_state(entry),
                description: entry.description.clone(),
            })
            .collect();
        active.sort_by_key(|info| info.id);
        active
    }

    fn effective_state(entry: &JobEntry) -> JobState {
        if entry.token.is_cancelled() {
            JobState::Cancelling
        } else {
            entry.state
        }
    }
}
