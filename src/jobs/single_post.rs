//! One post, read from the preload JSON embedded in its HTML page.

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;

use super::context::JobContext;
use super::pagination::{ListingOrder, Page, PageSource};
use crate::error::{Error, Result};
use crate::json_extract::extract_json;
use crate::types::Item;

#[derive(Debug, Deserialize)]
struct PreloadDocument {
    post: Item,
}

/// Single-page source for one post id
#[derive(Debug)]
pub struct SinglePostSource {
    post_id: String,
    fetched: bool,
}

impl SinglePostSource {
    /// Source for `post_id`
    pub fn new(post_id: impl Into<String>) -> Self {
        Self {
            post_id: post_id.into(),
            fetched: false,
        }
    }
}

#[async_trait]
impl PageSource for SinglePostSource {
    fn ordering(&self) -> ListingOrder {
        ListingOrder::Unordered
    }

    fn describe(&self) -> String {
        format!("post {}", self.post_id)
    }

    async fn next_page(&mut self, ctx: &JobContext) -> Result<Page> {
        if self.fetched {
            return Ok(Page::default());
        }
        self.fetched = true;

        let anchor = Regex::new(&ctx.config().site.preload_anchor).map_err(|e| Error::Config {
            message: format!("invalid preload anchor: {}", e),
            key: Some("site.preload_anchor".to_string()),
        })?;

        let path = format!("posts/{}", urlencoding::encode(&self.post_id));
        let html = ctx.fetch_text(&ctx.endpoint(&path)?).await?;

        // extraction is CPU-bound on multi-megabyte pages
        let document: PreloadDocument =
            tokio::task::spawn_blocking(move || extract_json(&html, &anchor).into_typed())
                .await
                .map_err(|e| Error::Parse(format!("preload extraction panicked: {}", e)))??;

        Ok(Page {
            items: vec![document.post],
            has_more: false,
        })
    }

    fn clear(&mut self) {
        self.fetched = true;
    }
}
