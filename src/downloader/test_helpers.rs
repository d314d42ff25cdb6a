//! Shared test helpers for creating Downloader instances in tests.

use crate::config::Config;
use crate::downloader::Downloader;
use crate::downloader::collision::{CollisionPrompt, FixedPrompt};
use crate::test_helpers::FakeTransport;
use crate::types::{CollisionPolicy, TaskId, TaskState};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

/// Helper to create a test Downloader over a scripted transport.
/// Returns the downloader, the transport and the tempdir (which must be kept alive).
pub(crate) async fn create_test_downloader(
    max_concurrent: i32,
) -> (Downloader, Arc<FakeTransport>, tempfile::TempDir) {
    create_test_downloader_with_prompt(
        max_concurrent,
        Arc::new(FixedPrompt(CollisionPolicy::Abort)),
    )
    .await
}

pub(crate) async fn create_test_downloader_with_prompt(
    max_concurrent: i32,
    prompt: Arc<dyn CollisionPrompt>,
) -> (Downloader, Arc<FakeTransport>, tempfile::TempDir) {
    let temp_dir = tempdir().unwrap();

    let mut config = Config::default();
    config.download.download_dir = temp_dir.path().join("downloads");
    config.download.max_concurrent_downloads = max_concurrent;

    let transport = FakeTransport::new();
    let downloader = Downloader::new(config, transport.clone(), prompt)
        .await
        .unwrap();

    (downloader, transport, temp_dir)
}

/// Poll until task `id` reaches `state` (2 second limit)
pub(crate) async fn wait_for_state(downloader: &Downloader, id: TaskId, state: TaskState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let current = downloader.task(id).map(|t| t.state);
        if current == Some(state) {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("task {} stuck in {:?}, expected {:?}", id, current, state);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll until every task is terminal (2 second limit)
pub(crate) async fn wait_until_idle(downloader: &Downloader) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while downloader.tasks().iter().any(|t| !t.state.is_terminal()) {
        if tokio::time::Instant::now() > deadline {
            panic!("tasks never settled: {:?}", downloader.tasks());
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
