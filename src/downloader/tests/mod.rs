use super::test_helpers::{
    create_test_downloader, create_test_downloader_with_prompt, wait_for_state, wait_until_idle,
};
use super::*;
use crate::error::{ErrorClass, TransportError};
use crate::test_helpers::{FakeResponse, FakeTransport};
use crate::transport::ResponseMeta;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Notify;

mod archive;

const BASE: &str = "https://files.example.com";

fn url(name: &str) -> String {
    format!("{}/{}", BASE, name)
}

fn dest(downloader: &Downloader, name: &str) -> PathBuf {
    downloader.config.download.download_dir.join(name)
}

/// HEAD reply advertising `len` bytes
fn sized(len: u64) -> std::result::Result<ResponseMeta, TransportError> {
    Ok(ResponseMeta {
        status: 200,
        final_url: BASE.to_string(),
        content_length: Some(len),
        location: None,
    })
}

/// Poll until task `id` has received at least `bytes` (2 second limit)
async fn wait_for_received(downloader: &Downloader, id: TaskId, bytes: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let received = downloader.task(id).map(|t| t.bytes_received).unwrap_or(0);
        if received >= bytes {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("task {} stuck at {} bytes, expected {}", id, received, bytes);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Collect events until `done` returns true (2 second limit)
async fn collect_events(
    rx: &mut broadcast::Receiver<Event>,
    mut done: impl FnMut(&[Event]) -> bool,
) -> Vec<Event> {
    let mut events = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !done(&events) {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(event)) => events.push(event),
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => {
                panic!("events never settled: {:?}", events)
            }
        }
    }
    events
}

/// Task ids in the order they reached `state`
fn reached(events: &[Event], wanted: TaskState) -> Vec<TaskId> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::TaskStateChanged { id, state, .. } if *state == wanted => Some(*id),
            _ => None,
        })
        .collect()
}
