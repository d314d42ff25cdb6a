//! Core types and events for harvest-dl

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::FailureReport;

/// Opaque unique identifier for a download task
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Get the inner value
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Identifier for an extraction job
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Download task state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for an admission slot
    Queued,
    /// Metadata probe before a resumed transfer
    HeadCheck,
    /// Bytes are being received
    Transferring,
    /// Transport finished, writer is flushing
    Writing,
    /// Finished successfully
    Completed,
    /// Stopped by the user
    Aborted,
    /// Stopped by an error
    Failed,
}

impl TaskState {
    /// Whether the task currently holds an admission slot
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            TaskState::HeadCheck | TaskState::Transferring | TaskState::Writing
        )
    }

    /// Whether the task reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Aborted | TaskState::Failed
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Download priority inside the wait queue
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Low priority
    Low = -1,
    /// Normal priority
    #[default]
    Normal = 0,
    /// High priority
    High = 1,
}

/// What to do when a download destination already exists on disk
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// Replace this file
    Overwrite,
    /// Replace this file and every later collision without asking again
    OverwriteAll,
    /// Continue from the size of the existing partial file
    Resume,
    /// Do not download
    Abort,
}

/// A request to fetch one remote file
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// Absolute source URL
    pub url: String,

    /// Destination path; a directory (trailing separator or existing dir) gets
    /// the file name from the URL. A path through a `.zip` component targets
    /// an entry inside that archive.
    pub destination: Option<PathBuf>,

    /// Extra request headers (Referer, auth, ...)
    #[serde(default)]
    pub headers: Vec<(String, String)>,

    /// Collision policy; `None` consults the configured default or the prompt
    #[serde(default)]
    pub collision: Option<CollisionPolicy>,

    /// Queue priority
    #[serde(default)]
    pub priority: Priority,
}

impl DownloadRequest {
    /// Request `url` into `destination`
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            destination: Some(destination.into()),
            ..Default::default()
        }
    }

    /// Add a request header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the collision policy
    pub fn with_collision(mut self, policy: CollisionPolicy) -> Self {
        self.collision = Some(policy);
        self
    }

    /// Set the queue priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Snapshot of a download task for the presentation list
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskInfo {
    /// Task identifier
    pub id: TaskId,
    /// Source URL
    pub url: String,
    /// Resolved destination (plain path or `container.zip/entry`)
    pub destination: PathBuf,
    /// Current state
    pub state: TaskState,
    /// Byte offset the current transfer started from
    pub byte_offset: u64,
    /// Bytes received in the current transfer (including the offset)
    pub bytes_received: u64,
    /// Total size if known
    pub bytes_total: Option<u64>,
    /// Queue priority
    pub priority: Priority,
    /// Failure detail for `Failed` tasks
    pub error: Option<FailureReport>,
}

/// Kind of extraction job
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// All works of one profile
    Gallery,
    /// Works matching a tag or keyword
    TagSearch,
    /// A profile's bookmarks
    Bookmarks,
    /// One post
    SinglePost,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobKind::Gallery => "gallery",
            JobKind::TagSearch => "tag-search",
            JobKind::Bookmarks => "bookmarks",
            JobKind::SinglePost => "single-post",
        };
        f.write_str(s)
    }
}

/// Extraction job state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Created, not started
    Idle,
    /// Fetching and paginating
    Running,
    /// Cancellation requested, waiting for the next continuation point
    Cancelling,
    /// Stopped cleanly (completed or cancelled)
    Finished,
    /// Stopped by an unrecoverable error
    Failed,
}

/// Content rating of an item
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rating {
    /// General audience
    #[default]
    Safe,
    /// Age-restricted
    Restricted,
}

/// Author of an item
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    /// Profile id
    #[serde(default)]
    pub id: String,
    /// Display name
    #[serde(default)]
    pub name: String,
}

/// One harvested record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Remote id
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    /// Title
    #[serde(default)]
    pub title: String,
    /// Author
    #[serde(default)]
    pub author: Author,
    /// Tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// Full-size media URL
    #[serde(default)]
    pub media_url: Option<String>,
    /// Cover thumbnail; replaced in place by an inline data URL after post-processing
    #[serde(default)]
    pub cover_url: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Content rating
    #[serde(default)]
    pub rating: Rating,
    /// Number of pages in the work
    #[serde(default)]
    pub page_count: u32,
    /// Bookmark counter
    #[serde(default)]
    pub bookmark_count: u64,
    /// View counter
    #[serde(default)]
    pub view_count: u64,
}

/// Accept ids as either JSON strings or numbers
fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(u64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(s) => s,
        RawId::Number(n) => n.to_string(),
    })
}

/// Event emitted to the presentation surface
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Task created by `submit`
    TaskCreated {
        /// Task ID
        id: TaskId,
        /// Source URL
        url: String,
        /// Resolved destination
        destination: PathBuf,
    },

    /// Bytes received for a task
    TaskProgress {
        /// Task ID
        id: TaskId,
        /// Bytes received so far, including any resume offset
        received: u64,
        /// Total size if known
        total: Option<u64>,
    },

    /// Task changed state
    TaskStateChanged {
        /// Task ID
        id: TaskId,
        /// New state
        state: TaskState,
        /// Failure detail when the new state is `Failed`
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<FailureReport>,
    },

    /// Task removed from the list
    TaskRemoved {
        /// Task ID
        id: TaskId,
    },

    /// Extraction job started running
    JobStarted {
        /// Job ID
        id: JobId,
        /// Job kind
        kind: JobKind,
        /// Worker description
        description: String,
    },

    /// Extraction job finished (completed or cancelled)
    JobFinished {
        /// Job ID
        id: JobId,
        /// Job kind
        kind: JobKind,
        /// Harvested items; empty when cancelled
        items: Vec<Item>,
        /// Whether the job stopped because it was cancelled
        cancelled: bool,
    },

    /// Extraction job failed
    JobFailed {
        /// Job ID
        id: JobId,
        /// Job kind
        kind: JobKind,
        /// Classification tag and detail
        reason: FailureReport,
    },

    /// Archive sink failed; every task bound to it is failed
    SinkFailed {
        /// Container path
        container: PathBuf,
        /// Failure reason
        error: String,
    },

    /// Graceful shutdown initiated
    Shutdown,
}
