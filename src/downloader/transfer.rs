//! Transfer execution: collision check, resume probe, streaming, writer hand-off.

use futures::StreamExt;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use super::collision::{self, Resolution};
use super::target::Target;
use super::{Downloader, Outcome};
use crate::error::{Error, Result};
use crate::transport::FetchRequest;
use crate::types::{CollisionPolicy, Event, TaskId, TaskState};
use crate::writer::{TaskWriter, WriteTarget};

/// Byte range decided by the resume probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RangePlan {
    /// Download from the beginning
    FromStart,
    /// Ask for `bytes=start-end` (or `bytes=start-` when the total is unknown)
    From { start: u64, total: Option<u64> },
    /// The partial file already holds every byte
    AlreadyComplete,
}

impl RangePlan {
    pub(crate) fn range_header(&self) -> Option<String> {
        match self {
            RangePlan::From {
                start,
                total: Some(total),
            } => Some(format!("bytes={}-{}", start, total)),
            RangePlan::From { start, total: None } => Some(format!("bytes={}-", start)),
            _ => None,
        }
    }
}

/// What a run works with, copied out of the task record
struct RunSpec {
    url: String,
    headers: Vec<(String, String)>,
    target: Target,
    requested: Option<CollisionPolicy>,
    force_resume: bool,
}

impl Downloader {
    fn run_spec(&self, id: TaskId) -> Option<RunSpec> {
        self.lock().tasks.get(&id).map(|record| RunSpec {
            url: record.request.url.clone(),
            headers: record.request.headers.clone(),
            target: record.target.clone(),
            requested: record.request.collision,
            force_resume: record.force_resume,
        })
    }

    fn update_progress(
        &self,
        id: TaskId,
        generation: u64,
        offset: Option<u64>,
        received: u64,
        total: Option<u64>,
    ) {
        let updated = {
            let mut state = self.lock();
            match state.tasks.get_mut(&id) {
                Some(record) if record.generation == generation => {
                    if let Some(offset) = offset {
                        record.byte_offset = offset;
                    }
                    record.bytes_received = received;
                    record.bytes_total = total;
                    true
                }
                _ => false,
            }
        };
        if updated {
            self.emit_event(Event::TaskProgress {
                id,
                received,
                total,
            });
        }
    }

    /// Decide how an existing file is treated
    async fn resolve_existing(&self, spec: &RunSpec, path: &Path) -> Resolution {
        let existing = match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => return Resolution::Replace,
        };

        if spec.force_resume {
            return Resolution::Resume;
        }

        collision::resolve(
            spec.requested,
            self.config.download.default_collision,
            &self.overwrite_all,
            self.prompt.as_ref(),
            path,
            existing,
        )
        .await
    }

    /// Probe the remote size and choose a byte range for continuing `existing` bytes
    ///
    /// A probe that answers without success or length leaves the total unknown.
    /// A probe that errors falls back to downloading from the start.
    pub(crate) async fn plan_resume(
        &self,
        url: &str,
        headers: &[(String, String)],
        existing: u64,
    ) -> RangePlan {
        if existing == 0 {
            return RangePlan::FromStart;
        }

        let mut probe = FetchRequest::new(url)
            .redirect(self.redirect_policy.mode_for(url))
            .timeout(self.config.http.request_timeout);
        probe.headers = headers.to_vec();

        let total = match self.transport.head(&probe).await {
            Ok(meta) if meta.is_success() => meta.content_length,
            Ok(meta) => {
                tracing::warn!(url, status = meta.status, "Size probe failed, total unknown");
                None
            }
            Err(e) => {
                tracing::warn!(url, error = %e, "Size probe errored, restarting from zero");
                return RangePlan::FromStart;
            }
        };

        match total {
            Some(total) if existing >= total => RangePlan::AlreadyComplete,
            total => RangePlan::From {
                start: existing,
                total,
            },
        }
    }

    /// Execute one run of task `id`
    pub(crate) async fn run_task(
        &self,
        id: TaskId,
        token: CancellationToken,
        generation: u64,
    ) -> Outcome {
        let Some(spec) = self.run_spec(id) else {
            return Outcome::Aborted;
        };
        if token.is_cancelled() {
            return Outcome::Aborted;
        }

        let mut plan = RangePlan::FromStart;
        if let Target::File(path) = &spec.target {
            let resolution = tokio::select! {
                _ = token.cancelled() => return Outcome::Aborted,
                resolution = self.resolve_existing(&spec, path) => resolution,
            };

            match resolution {
                Resolution::Abort => {
                    tracing::info!(
                        task_id = %id,
                        path = %path.display(),
                        "Destination exists, aborting"
                    );
                    return Outcome::Aborted;
                }
                Resolution::Replace => {}
                Resolution::Resume => {
                    self.set_state(id, generation, TaskState::HeadCheck);
                    let existing = tokio::fs::metadata(path)
                        .await
                        .map(|m| m.len())
                        .unwrap_or(0);
                    plan = tokio::select! {
                        _ = token.cancelled() => return Outcome::Aborted,
                        plan = self.plan_resume(&spec.url, &spec.headers, existing) => plan,
                    };
                }
            }
        }

        if plan == RangePlan::AlreadyComplete {
            tracing::info!(task_id = %id, "Partial file already complete");
            return Outcome::Completed;
        }

        self.set_state(id, generation, TaskState::Transferring);
        match self.transfer(id, &spec, &plan, &token, generation).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => Outcome::Aborted,
            Err(e) => Outcome::Failed(e),
        }
    }

    async fn transfer(
        &self,
        id: TaskId,
        spec: &RunSpec,
        plan: &RangePlan,
        token: &CancellationToken,
        generation: u64,
    ) -> Result<Outcome> {
        let mut request = FetchRequest::new(spec.url.clone())
            .redirect(self.redirect_policy.mode_for(&spec.url));
        request.headers = spec.headers.clone();
        if let Some(range) = plan.range_header() {
            request
                .headers
                .retain(|(name, _)| !name.eq_ignore_ascii_case("range"));
            request.headers.push(("Range".to_string(), range));
        }

        let response = tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled),
            response = self.transport.get(&request) => response?,
        };

        let requested_start = match plan {
            RangePlan::From { start, .. } => *start,
            _ => 0,
        };

        // 416 on a resume means there is nothing left past the partial file
        if response.meta.status == 416 && requested_start > 0 {
            tracing::info!(task_id = %id, "Server reports range satisfied");
            return Ok(Outcome::Completed);
        }
        response.meta.error_for_status()?;

        // a 200 answer to a range request restarts the file
        let offset = if response.meta.status == 206 {
            requested_start
        } else {
            0
        };
        let total = response.meta.content_length.map(|len| len + offset);

        let write_target = match &spec.target {
            Target::File(path) => WriteTarget::File {
                path: path.clone(),
                append: offset > 0,
            },
            Target::Archive { container, entry } => WriteTarget::Archive {
                sink: self.archives.acquire(container)?,
                entry: entry.clone(),
            },
        };

        self.update_progress(id, generation, Some(offset), offset, total);

        let mut body = response.body;
        let mut writer: Option<TaskWriter> = None;
        let mut received = offset;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    if let Some(writer) = writer.take() {
                        let _ = writer.abandon().await;
                    }
                    return Err(Error::Cancelled);
                }
                chunk = body.next() => chunk,
            };

            match chunk {
                Some(Ok(bytes)) => {
                    if bytes.is_empty() {
                        continue;
                    }
                    let len = bytes.len() as u64;
                    let active = writer.get_or_insert_with(|| {
                        TaskWriter::spawn(
                            write_target.clone(),
                            self.config.download.chunk_queue_depth,
                        )
                    });
                    // a full queue must not outlive an abort
                    let sent = tokio::select! {
                        biased;
                        _ = token.cancelled() => None,
                        sent = active.send(bytes) => Some(sent),
                    };
                    let Some(sent) = sent else {
                        if let Some(writer) = writer.take() {
                            let _ = writer.abandon().await;
                        }
                        return Err(Error::Cancelled);
                    };
                    sent?;
                    received += len;
                    tracing::trace!(task_id = %id, received, "Chunk queued");
                    self.update_progress(id, generation, None, received, total);
                }
                Some(Err(e)) => {
                    if let Some(writer) = writer.take() {
                        let _ = writer.abandon().await;
                    }
                    return Err(e.into());
                }
                None => break,
            }
        }

        self.set_state(id, generation, TaskState::Writing);
        let writer = writer.unwrap_or_else(|| {
            TaskWriter::spawn(write_target, self.config.download.chunk_queue_depth)
        });
        writer.finish().await?;

        if total.is_none() {
            self.update_progress(id, generation, None, received, Some(received));
        }
        Ok(Outcome::Completed)
    }
}
