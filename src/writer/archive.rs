//! Shared ZIP archive sink
//!
//! Every task whose destination lies inside the same `.zip` container writes
//! through one [`ArchiveSink`]. Entries are copied in whole, one at a time,
//! under the sink's lock, so concurrent tasks cannot interleave inside the
//! archive's directory structure. Sink failures are broadcast on a channel
//! separate from per-task errors because one failure affects every task bound
//! to the container.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use zip::ZipWriter;
use zip::write::FileOptions;

use crate::error::{Error, Result};

/// Lifecycle of an archive sink
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkStatus {
    /// Accepting entries
    Open,
    /// A write failed; rejected until reopened
    Failed(String),
    /// Finalized; the central directory has been written
    Closed,
}

/// Notification that a sink stopped accepting entries
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SinkFailure {
    /// The container that failed
    pub container: PathBuf,
    /// Failure reason
    pub reason: String,
}

struct SinkState {
    writer: Option<ZipWriter<File>>,
    status: SinkStatus,
    entries: HashSet<String>,
}

/// One ZIP container shared by many download tasks
pub struct ArchiveSink {
    container: PathBuf,
    state: Mutex<SinkState>,
    failures: broadcast::Sender<SinkFailure>,
}

impl std::fmt::Debug for ArchiveSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveSink")
            .field("container", &self.container)
            .field("status", &self.status())
            .finish()
    }
}

impl ArchiveSink {
    fn new(container: PathBuf, failures: broadcast::Sender<SinkFailure>) -> Self {
        Self {
            container,
            state: Mutex::new(SinkState {
                writer: None,
                status: SinkStatus::Open,
                entries: HashSet::new(),
            }),
            failures,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Container path
    pub fn container(&self) -> &Path {
        &self.container
    }

    /// Current status
    pub fn status(&self) -> SinkStatus {
        self.lock().status.clone()
    }

    /// Write one complete entry from memory
    ///
    /// A duplicate entry name is rejected for this task only. Any I/O failure
    /// marks the sink failed and is broadcast to every subscriber.
    pub async fn write_entry(self: &Arc<Self>, name: String, data: Vec<u8>) -> Result<()> {
        let len = data.len() as u64;
        self.write_entry_from(name, std::io::Cursor::new(data), len).await
    }

    /// Write one complete entry by copying `len` bytes out of `reader`
    pub async fn write_entry_from<R>(
        self: &Arc<Self>,
        name: String,
        mut reader: R,
        len: u64,
    ) -> Result<()>
    where
        R: Read + Send + 'static,
    {
        let sink = Arc::clone(self);
        tokio::task::spawn_blocking(move || sink.write_entry_blocking(&name, &mut reader, len))
            .await
            .map_err(|e| Error::sink(&self.container, format!("writer task panicked: {}", e)))?
    }

    fn write_entry_blocking(&self, name: &str, data: &mut dyn Read, len: u64) -> Result<()> {
        let mut state = self.lock();
        match &state.status {
            SinkStatus::Open => {}
            SinkStatus::Failed(reason) => {
                return Err(Error::sink(&self.container, format!("sink closed: {}", reason)));
            }
            SinkStatus::Closed => return Err(Error::sink(&self.container, "sink closed")),
        }

        if state.writer.is_none() {
            match open_container(&self.container) {
                Ok((writer, existing)) => {
                    state.entries.extend(existing);
                    state.writer = Some(writer);
                }
                Err(e) => return Err(self.fail_locked(&mut state, e.to_string())),
            }
        }

        if state.entries.contains(name) {
            return Err(Error::Validation(format!(
                "entry '{}' already exists in {}",
                name,
                self.container.display()
            )));
        }

        let written = match state.writer.as_mut() {
            Some(writer) => write_stored(writer, name, data, len),
            None => Err(std::io::Error::other("archive writer missing")),
        };

        match written {
            Ok(()) => {
                state.entries.insert(name.to_string());
                debug!(
                    container = %self.container.display(),
                    entry = name,
                    bytes = len,
                    "Wrote archive entry"
                );
                Ok(())
            }
            Err(e) => Err(self.fail_locked(&mut state, e.to_string())),
        }
    }

    fn fail_locked(&self, state: &mut SinkState, reason: String) -> Error {
        warn!(
            container = %self.container.display(),
            error = %reason,
            "Archive sink failed"
        );
        state.writer = None;
        state.status = SinkStatus::Failed(reason.clone());
        let _ = self.failures.send(SinkFailure {
            container: self.container.clone(),
            reason: reason.clone(),
        });
        Error::sink(&self.container, reason)
    }

    /// Mark the sink failed from outside (e.g. the container became unusable)
    pub fn fail(&self, reason: impl Into<String>) {
        let mut state = self.lock();
        if state.status == SinkStatus::Open {
            self.fail_locked(&mut state, reason.into());
        }
    }

    /// Finalize the archive, writing its central directory
    pub async fn close(self: &Arc<Self>) -> Result<()> {
        let sink = Arc::clone(self);
        tokio::task::spawn_blocking(move || sink.close_blocking())
            .await
            .map_err(|e| Error::sink(&self.container, format!("writer task panicked: {}", e)))?
    }

    fn close_blocking(&self) -> Result<()> {
        let mut state = self.lock();
        if state.status == SinkStatus::Closed {
            return Ok(());
        }
        let was_open = state.status == SinkStatus::Open;
        state.status = SinkStatus::Closed;

        if was_open && let Some(mut writer) = state.writer.take() {
            let finished = writer.finish().and_then(|mut file| {
                file.flush()?;
                Ok(())
            });
            if let Err(e) = finished {
                return Err(Error::sink(&self.container, e.to_string()));
            }
            info!(
                container = %self.container.display(),
                entries = state.entries.len(),
                "Archive finalized"
            );
        }
        Ok(())
    }
}

fn open_container(container: &Path) -> std::io::Result<(ZipWriter<File>, Vec<String>)> {
    if let Some(parent) = container.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let has_content = std::fs::metadata(container)
        .map(|m| m.len() > 0)
        .unwrap_or(false);

    if has_content {
        let file = OpenOptions::new().read(true).write(true).open(container)?;
        let existing = zip::ZipArchive::new(&file)
            .map(|archive| archive.file_names().map(str::to_string).collect())
            .map_err(|e| std::io::Error::other(format!("cannot read existing archive: {}", e)))?;
        let writer = ZipWriter::new_append(file)
            .map_err(|e| std::io::Error::other(format!("cannot append to archive: {}", e)))?;
        Ok((writer, existing))
    } else {
        let file = File::create(container)?;
        Ok((ZipWriter::new(file), Vec::new()))
    }
}

fn write_stored(
    writer: &mut ZipWriter<File>,
    name: &str,
    data: &mut dyn Read,
    len: u64,
) -> std::io::Result<()> {
    let options = FileOptions::default()
        .compression_method(zip::CompressionMethod::Stored)
        .large_file(len >= u32::MAX as u64);
    writer
        .start_file(name, options)
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    let copied = std::io::copy(data, writer)?;
    if copied != len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("entry '{}' ended after {} of {} bytes", name, copied, len),
        ));
    }
    writer.flush()
}

/// Registry of open sinks, keyed by container path
#[derive(Clone)]
pub struct ArchiveRegistry {
    sinks: Arc<Mutex<HashMap<PathBuf, Arc<ArchiveSink>>>>,
    failures: broadcast::Sender<SinkFailure>,
}

impl Default for ArchiveRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        let (failures, _rx) = broadcast::channel(64);
        Self {
            sinks: Arc::new(Mutex::new(HashMap::new())),
            failures,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, Arc<ArchiveSink>>> {
        match self.sinks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Subscribe to sink failures
    pub fn subscribe_failures(&self) -> broadcast::Receiver<SinkFailure> {
        self.failures.subscribe()
    }

    /// Reject containers whose sink has failed and was not reopened
    pub fn check_available(&self, container: &Path) -> Result<()> {
        match self.lock().get(container).map(|sink| sink.status()) {
            Some(SinkStatus::Failed(reason)) => Err(Error::sink(
                container,
                format!("sink closed: {} (reopen required)", reason),
            )),
            _ => Ok(()),
        }
    }

    /// The sink for `container`, created on first use
    pub fn acquire(&self, container: &Path) -> Result<Arc<ArchiveSink>> {
        let mut sinks = self.lock();
        match sinks.get(container) {
            Some(sink) => match sink.status() {
                SinkStatus::Open => Ok(Arc::clone(sink)),
                SinkStatus::Failed(reason) => {
                    Err(Error::sink(container, format!("sink closed: {}", reason)))
                }
                SinkStatus::Closed => {
                    let sink = Arc::new(ArchiveSink::new(
                        container.to_path_buf(),
                        self.failures.clone(),
                    ));
                    sinks.insert(container.to_path_buf(), Arc::clone(&sink));
                    Ok(sink)
                }
            },
            None => {
                let sink = Arc::new(ArchiveSink::new(
                    container.to_path_buf(),
                    self.failures.clone(),
                ));
                sinks.insert(container.to_path_buf(), Arc::clone(&sink));
                Ok(sink)
            }
        }
    }

    /// Finalize and forget the sink for `container`
    ///
    /// Returns `false` if no sink was registered.
    pub async fn close(&self, container: &Path) -> Result<bool> {
        let sink = self.lock().remove(container);
        match sink {
            Some(sink) => {
                sink.close().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drop a failed or closed sink so the container accepts entries again
    pub fn reopen(&self, container: &Path) -> bool {
        let mut sinks = self.lock();
        match sinks.get(container).map(|sink| sink.status()) {
            Some(SinkStatus::Open) => false,
            Some(_) => {
                sinks.remove(container);
                info!(container = %container.display(), "Archive sink reopened");
                true
            }
            None => false,
        }
    }

    /// Finalize every open sink
    pub async fn close_all(&self) -> Vec<PathBuf> {
        let sinks: Vec<_> = self.lock().drain().collect();
        let mut closed = Vec::with_capacity(sinks.len());
        for (container, sink) in sinks {
            match sink.close().await {
                Ok(()) => closed.push(container),
                Err(e) => warn!(
                    container = %container.display(),
                    error = %e,
                    "Failed to finalize archive during shutdown"
                ),
            }
        }
        closed
    }
}
