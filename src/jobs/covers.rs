//! Cover thumbnail post-processing.
//!
//! Every cover that is not already inline and not cached is fetched as a
//! sub-fetch counted against a [`JoinBarrier`]. Fetched images are downscaled
//! to the configured longest side, re-encoded as JPEG and stored as a
//! `data:` URL. Any failure substitutes a 1x1 placeholder; failures never
//! propagate to the job.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::barrier::JoinBarrier;
use super::context::JobContext;
use crate::types::Item;

/// Transparent 1x1 GIF used when a cover cannot be produced
pub const PLACEHOLDER_COVER: &str =
    "data:image/gif;base64,R0lGODlhAQABAIAAAP///wAAACH5BAEAAAAALAAAAAABAAEAAAICRAEAOw==";

/// Replace every remote `cover_url` in `items` with an inline thumbnail
///
/// Returns once every sub-fetch has arrived at the barrier.
pub async fn resolve_covers(ctx: &JobContext, items: &mut [Item]) {
    let mut pending = Vec::new();
    for (index, item) in items.iter_mut().enumerate() {
        let Some(url) = item.cover_url.as_deref() else {
            continue;
        };
        if url.starts_with("data:") {
            continue;
        }
        if let Some(cached) = ctx.cache().get(url) {
            item.cover_url = Some(cached);
            continue;
        }
        pending.push((index, url.to_string()));
        // overwritten on success; a sub-fetch that dies without reporting keeps this
        item.cover_url = Some(PLACEHOLDER_COVER.to_string());
    }

    if pending.is_empty() {
        return;
    }

    debug!(job_id = %ctx.id(), covers = pending.len(), "Fetching covers");
    let (barrier, guards) = JoinBarrier::with_guards(pending.len());
    let (tx, mut rx) = mpsc::unbounded_channel();

    for ((index, url), guard) in pending.into_iter().zip(guards) {
        let ctx = ctx.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let processed = process_cover(&ctx, &url).await;
            // result lands in the channel before the arrival is counted
            let _ = tx.send((index, url, processed));
            guard.complete();
        });
    }
    drop(tx);

    barrier.wait().await;

    while let Ok((index, url, processed)) = rx.try_recv() {
        let Some(data_url) = processed else {
            continue;
        };
        ctx.cache().insert(url, data_url.clone());
        if let Some(item) = items.get_mut(index) {
            item.cover_url = Some(data_url);
        }
    }
}

/// Fetch and re-encode one cover; `None` means use the placeholder
async fn process_cover(ctx: &JobContext, url: &str) -> Option<String> {
    if ctx.is_cancelled() {
        return None;
    }

    let bytes = match ctx.fetch_bytes(url).await {
        Ok(bytes) => bytes,
        Err(e) => {
            if !e.is_cancelled() {
                warn!(url, error = %e, "Cover fetch failed, using placeholder");
            }
            return None;
        }
    };

    let max_dimension = ctx.config().images.max_dimension;
    let quality = ctx.config().images.jpeg_quality;
    let encoded =
        tokio::task::spawn_blocking(move || encode_thumbnail(&bytes, max_dimension, quality)).await;

    match encoded {
        Ok(Ok(data_url)) => Some(data_url),
        Ok(Err(e)) => {
            warn!(url, error = %e, "Cover decode failed, using placeholder");
            None
        }
        Err(e) => {
            warn!(url, error = %e, "Cover encoder panicked, using placeholder");
            None
        }
    }
}

/// Decode `bytes`, fit the longer side into `max_dimension` and encode as a JPEG data URL
pub fn encode_thumbnail(
    bytes: &[u8],
    max_dimension: u32,
    quality: u8,
) -> Result<String, image::ImageError> {
    let decoded = image::load_from_memory(bytes)?;
    let resized = if decoded.width().max(decoded.height()) > max_dimension {
        decoded.resize(max_dimension, max_dimension, FilterType::Lanczos3)
    } else {
        decoded
    };

    let rgb = resized.to_rgb8();
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, quality).encode_image(&rgb)?;

    Ok(format!("data:image/jpeg;base64,{}", STANDARD.encode(&jpeg)))
}
