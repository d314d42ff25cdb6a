//! Common test utilities for harvest-dl integration tests

#![allow(dead_code)]

use harvest_dl::{Config, Downloader, TaskId, TaskInfo};
use std::time::Duration;
use tempfile::TempDir;

/// Config rooted in a fresh temp directory
pub fn temp_config() -> (Config, TempDir) {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let mut config = Config::default();
    config.download.download_dir = temp_dir.path().join("downloads");
    config.download.max_concurrent_downloads = 3;
    (config, temp_dir)
}

/// Config whose site adapter points at a mock server
pub fn site_config(base_url: &str) -> Config {
    let mut config = Config::default();
    config.site.base_url = format!("{}/", base_url);
    config.jobs.creation_cooldown = Duration::ZERO;
    config
}

/// Poll until the task reaches a terminal state (5 second limit)
pub async fn wait_for_terminal(downloader: &Downloader, id: TaskId) -> TaskInfo {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let info = downloader.task(id).expect("task disappeared");
        if info.state.is_terminal() {
            return info;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {} stuck in {:?}",
            id,
            info.state
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// JSON for one listing item created on `2024-03-<day>`
pub fn item_json(id: u64, day: u32) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "title": format!("work {}", id),
        "author": {"id": "u1", "name": "artist"},
        "created_at": format!("2024-03-{:02}T12:00:00Z", day),
        "media_url": format!("/media/{}.png", id),
    })
}
