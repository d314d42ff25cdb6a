//! Background writers
//!
//! The transfer loop never touches the disk. Each task lazily gets exactly one
//! [`TaskWriter`], a spawned task fed through a bounded channel, so chunks are
//! written in arrival order without blocking the network read path.
//!
//! Archive entries are spooled to an anonymous temporary file and copied into
//! the container on commit, so memory per task stays bounded by the chunk
//! queue (`depth` chunks) regardless of entry size.

pub mod archive;

use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use archive::ArchiveSink;

/// Where a writer puts its bytes
#[derive(Clone, Debug)]
pub enum WriteTarget {
    /// Plain file; `append` continues a resumed transfer, otherwise truncates
    File {
        /// Destination path
        path: PathBuf,
        /// Append instead of truncate
        append: bool,
    },
    /// Entry inside a shared archive
    Archive {
        /// Sink for the container
        sink: Arc<ArchiveSink>,
        /// Entry name inside the container
        entry: String,
    },
}

enum WriterMsg {
    Chunk(Vec<u8>),
    Finish,
}

/// Handle to one task's background writer
#[derive(Debug)]
pub struct TaskWriter {
    tx: mpsc::Sender<WriterMsg>,
    handle: Option<JoinHandle<Result<u64>>>,
}

impl std::fmt::Debug for WriterMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriterMsg::Chunk(chunk) => write!(f, "Chunk({} bytes)", chunk.len()),
            WriterMsg::Finish => f.write_str("Finish"),
        }
    }
}

impl TaskWriter {
    /// Spawn a writer for `target` with a chunk queue of `depth`
    pub fn spawn(target: WriteTarget, depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(depth.max(1));
        let handle = match target {
            WriteTarget::File { path, append } => tokio::spawn(write_file(path, append, rx)),
            WriteTarget::Archive { sink, entry } => tokio::spawn(write_entry(sink, entry, rx)),
        };
        Self {
            tx,
            handle: Some(handle),
        }
    }

    /// Queue a chunk
    ///
    /// Waits only for queue capacity. If the writer already stopped, its
    /// error is returned.
    pub async fn send(&mut self, chunk: Vec<u8>) -> Result<()> {
        if self.tx.send(WriterMsg::Chunk(chunk)).await.is_ok() {
            return Ok(());
        }
        // the receiver is gone, so the writer task has returned
        match join(self.handle.take()).await {
            Err(e) => Err(e),
            Ok(_) => Err(Error::Io(std::io::Error::other("writer stopped early"))),
        }
    }

    /// Flush everything queued and commit; returns bytes written
    pub async fn finish(mut self) -> Result<u64> {
        let _ = self.tx.send(WriterMsg::Finish).await;
        drop(self.tx);
        join(self.handle.take()).await
    }

    /// Stop without committing
    ///
    /// Bytes already queued for a file are still written so the partial file
    /// stays resumable. An archive entry is discarded.
    pub async fn abandon(mut self) -> Result<u64> {
        drop(self.tx);
        join(self.handle.take()).await
    }
}

async fn join(handle: Option<JoinHandle<Result<u64>>>) -> Result<u64> {
    let Some(handle) = handle else {
        return Err(Error::Io(std::io::Error::other("writer already stopped")));
    };
    handle.await.map_err(|e| {
        Error::Io(std::io::Error::other(format!(
            "writer task panicked: {}",
            e
        )))
    })?
}

async fn write_file(
    path: PathBuf,
    append: bool,
    mut rx: mpsc::Receiver<WriterMsg>,
) -> Result<u64> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(&path)
        .await?;

    let mut written = 0u64;
    while let Some(msg) = rx.recv().await {
        match msg {
            WriterMsg::Chunk(chunk) => {
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            WriterMsg::Finish => break,
        }
    }
    file.flush().await?;

    tracing::debug!(path = %path.display(), bytes = written, "Writer finished");
    Ok(written)
}

async fn write_entry(
    sink: Arc<ArchiveSink>,
    entry: String,
    mut rx: mpsc::Receiver<WriterMsg>,
) -> Result<u64> {
    let mut spool: Option<tokio::fs::File> = None;
    let mut len = 0u64;
    let mut committed = false;

    while let Some(msg) = rx.recv().await {
        match msg {
            WriterMsg::Chunk(chunk) => {
                if spool.is_none() {
                    spool = Some(open_spool().await?);
                }
                if let Some(file) = spool.as_mut() {
                    file.write_all(&chunk).await?;
                    len += chunk.len() as u64;
                }
            }
            WriterMsg::Finish => {
                committed = true;
                break;
            }
        }
    }

    if !committed {
        tracing::debug!(entry = %entry, "Archive entry abandoned");
        return Ok(0);
    }

    match spool {
        Some(mut file) => {
            file.flush().await?;
            file.seek(std::io::SeekFrom::Start(0)).await?;
            let reader = file.into_std().await;
            sink.write_entry_from(entry, reader, len).await?;
        }
        None => sink.write_entry(entry, Vec::new()).await?,
    }
    Ok(len)
}

/// Anonymous temp file, removed by the OS once closed
async fn open_spool() -> Result<tokio::fs::File> {
    let file = tokio::task::spawn_blocking(tempfile::tempfile)
        .await
        .map_err(|e| Error::Io(std::io::Error::other(format!("spool task panicked: {}", e))))??;
    Ok(tokio::fs::File::from_std(file))
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use archive::ArchiveRegistry;

    #[tokio::test]
    async fn file_chunks_are_written_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.bin");

        let mut writer = TaskWriter::spawn(
            WriteTarget::File {
                path: path.clone(),
                append: false,
            },
            2,
        );
        for i in 0..10u8 {
            writer.send(vec![i; 3]).await.unwrap();
        }
        assert_eq!(writer.finish().await.unwrap(), 30);

        let data = std::fs::read(&path).unwrap();
        let expected: Vec<u8> = (0..10u8).flat_map(|i| [i; 3]).collect();
        assert_eq!(data, expected);
    }

    #[tokio::test]
    async fn append_keeps_existing_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.bin");
        std::fs::write(&path, b"head-").unwrap();

        let mut writer = TaskWriter::spawn(
            WriteTarget::File {
                path: path.clone(),
                append: true,
            },
            4,
        );
        writer.send(b"tail".to_vec()).await.unwrap();
        writer.finish().await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"head-tail");
    }

    #[tokio::test]
    async fn abandoned_file_keeps_partial_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aborted.bin");

        let mut writer = TaskWriter::spawn(
            WriteTarget::File {
                path: path.clone(),
                append: false,
            },
            4,
        );
        writer.send(b"partial".to_vec()).await.unwrap();
        writer.abandon().await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"partial");
    }

    #[tokio::test]
    async fn abandoned_archive_entry_is_not_committed() {
        let dir = tempfile::tempdir().unwrap();
        let container = dir.path().join("a.zip");
        let registry = ArchiveRegistry::new();

        let mut kept = TaskWriter::spawn(
            WriteTarget::Archive {
                sink: registry.acquire(&container).unwrap(),
                entry: "kept.txt".into(),
            },
            4,
        );
        let mut dropped = TaskWriter::spawn(
            WriteTarget::Archive {
                sink: registry.acquire(&container).unwrap(),
                entry: "dropped.txt".into(),
            },
            4,
        );
        kept.send(b"yes".to_vec()).await.unwrap();
        dropped.send(b"no".to_vec()).await.unwrap();
        kept.finish().await.unwrap();
        dropped.abandon().await.unwrap();
        registry.close(&container).await.unwrap();

        let archive = zip::ZipArchive::new(std::fs::File::open(&container).unwrap()).unwrap();
        let names: Vec<_> = archive.file_names().collect();
        assert_eq!(names, vec!["kept.txt"]);
    }

    #[tokio::test]
    async fn large_archive_entry_is_spooled_intact() {
        let dir = tempfile::tempdir().unwrap();
        let container = dir.path().join("big.zip");
        let registry = ArchiveRegistry::new();

        let mut writer = TaskWriter::spawn(
            WriteTarget::Archive {
                sink: registry.acquire(&container).unwrap(),
                entry: "scan.tif".into(),
            },
            2,
        );
        for i in 0..256u32 {
            writer.send(vec![(i % 251) as u8; 4096]).await.unwrap();
        }
        assert_eq!(writer.finish().await.unwrap(), 256 * 4096);

        let mut empty = TaskWriter::spawn(
            WriteTarget::Archive {
                sink: registry.acquire(&container).unwrap(),
                entry: "empty.txt".into(),
            },
            2,
        );
        empty.send(Vec::new()).await.unwrap();
        assert_eq!(empty.finish().await.unwrap(), 0);
        registry.close(&container).await.unwrap();

        let mut archive = zip::ZipArchive::new(std::fs::File::open(&container).unwrap()).unwrap();
        let mut data = Vec::new();
        std::io::Read::read_to_end(&mut archive.by_name("scan.tif").unwrap(), &mut data).unwrap();
        let expected: Vec<u8> = (0..256u32).flat_map(|i| vec![(i % 251) as u8; 4096]).collect();
        assert_eq!(data, expected);
        assert_eq!(archive.by_name("empty.txt").unwrap().size(), 0);
    }

    #[tokio::test]
    async fn write_error_surfaces_on_finish() {
        let dir = tempfile::tempdir().unwrap();
        // a directory cannot be opened as a file
        let path = dir.path().to_path_buf();

        let writer = TaskWriter::spawn(
            WriteTarget::File {
                path,
                append: false,
            },
            4,
        );

        assert!(writer.finish().await.is_err());
    }
}
