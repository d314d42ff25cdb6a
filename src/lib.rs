//! # harvest-dl
//!
//! Content harvesting and download orchestration library.
//!
//! ## Design Philosophy
//!
//! harvest-dl is designed to be:
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Event-driven** - Consumers subscribe to events, no polling required
//! - **Bounded** - Transfers run under a concurrency ceiling, jobs under a creation cooldown
//! - **Testable** - Network access goes through the [`transport::Transport`] trait
//!
//! ## Quick Start
//!
//! ```no_run
//! use harvest_dl::{Config, Downloader, DownloadRequest, JobScheduler, JobSpec, ResultFilter};
//! use harvest_dl::transport::ReqwestTransport;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let downloader = Downloader::with_http(config.clone()).await?;
//!
//!     // Subscribe to events
//!     let mut events = downloader.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     // Harvest a tag listing, then download every media file into one archive
//!     let transport = Arc::new(ReqwestTransport::new(&config.http, &config.redirect)?);
//!     let jobs = JobScheduler::from_config(Arc::new(config), transport)
//!         .with_event_sender(downloader.event_sender());
//!     let spec = JobSpec::TagSearch {
//!         tag: "landscape".to_string(),
//!         filter: ResultFilter { max_count: Some(20), ..Default::default() },
//!     };
//!     if let Some(job) = jobs.start(spec) {
//!         if let harvest_dl::JobOutcome::Finished { items, .. } = job.wait().await {
//!             for item in items {
//!                 if let Some(media) = item.media_url {
//!                     downloader.submit(DownloadRequest::new(media, "landscape.zip/"))?;
//!                 }
//!             }
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Download orchestrator (decomposed into focused submodules)
pub mod downloader;
/// Error types
pub mod error;
/// Extraction jobs and pagination
pub mod jobs;
/// Embedded JSON document extraction
pub mod json_extract;
/// Network transport abstraction
pub mod transport;
/// Core types and events
pub mod types;
/// Background writers and ZIP archive sinks
pub mod writer;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;

// Re-export commonly used types
pub use config::{Config, RedirectRule};
pub use downloader::Downloader;
pub use downloader::collision::{CollisionPrompt, FixedPrompt};
pub use error::{Error, ErrorClass, FailureReport, Result, TransportError};
pub use jobs::pagination::{RatingFilter, ResultFilter, TagMode};
pub use jobs::{JobHandle, JobOutcome, JobScheduler, JobSpec};
pub use types::{
    CollisionPolicy, DownloadRequest, Event, Item, JobId, JobKind, JobState, Priority, TaskId,
    TaskInfo, TaskState,
};

/// Run until a termination signal arrives, then stop jobs and downloads.
///
/// Extraction jobs are cancelled first so none of them hands new work to the
/// downloader, then [`Downloader::shutdown`] aborts transfers and finalizes
/// open archives. On unix both SIGTERM and SIGINT are honored; elsewhere only
/// Ctrl+C.
///
/// # Example
///
/// ```no_run
/// use harvest_dl::{Config, Downloader, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let downloader = Downloader::with_http(Config::default()).await?;
///     run_with_shutdown(downloader, None).await?;
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(downloader: Downloader, jobs: Option<JobScheduler>) -> Result<()> {
    shutdown_after(wait_for_signal(), &downloader, jobs.as_ref()).await
}

/// Wait for `signal`, cancel every live job, then shut the downloader down
pub(crate) async fn shutdown_after<F>(
    signal: F,
    downloader: &Downloader,
    jobs: Option<&JobScheduler>,
) -> Result<()>
where
    F: std::future::Future<Output = ()>,
{
    signal.await;

    if let Some(jobs) = jobs {
        let cancelled = jobs.cancel_all();
        tracing::info!(cancelled, "Cancelled extraction jobs for shutdown");
    }
    downloader.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // registration can fail in restricted environments; fall back to Ctrl+C alone
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::pin!(terminate);

    tokio::select! {
        _ = &mut terminate => tracing::info!("Received SIGTERM"),
        interrupted = tokio::signal::ctrl_c() => match interrupted {
            Ok(()) => tracing::info!("Received SIGINT"),
            Err(e) => {
                tracing::warn!(error = %e, "SIGINT handler unavailable, waiting for SIGTERM");
                terminate.await;
            }
        },
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("Received Ctrl+C");
}
