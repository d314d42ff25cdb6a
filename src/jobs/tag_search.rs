//! Works matching a tag or keyword, newest first.

use async_trait::async_trait;
use serde::Deserialize;

use super::context::JobContext;
use super::pagination::{ListingOrder, Page, PageSource, RatingFilter, TagMode};
use crate::error::Result;
use crate::types::Item;

#[derive(Debug, Deserialize)]
struct SearchPage {
    #[serde(default)]
    items: Vec<Item>,
    #[serde(default)]
    has_more: bool,
}

/// Tag search listing
#[derive(Debug)]
pub struct TagSearchSource {
    tag: String,
    rating: RatingFilter,
    mode: TagMode,
    next_page: Option<u32>,
}

impl TagSearchSource {
    /// Search for `tag`; rating and match mode are sent to the backend
    pub fn new(tag: impl Into<String>, rating: RatingFilter, mode: TagMode) -> Self {
        Self {
            tag: tag.into(),
            rating,
            mode,
            next_page: Some(1),
        }
    }
}

#[async_trait]
impl PageSource for TagSearchSource {
    fn ordering(&self) -> ListingOrder {
        ListingOrder::DateDescending
    }

    fn describe(&self) -> String {
        format!("tag search for '{}'", self.tag)
    }

    async fn next_page(&mut self, ctx: &JobContext) -> Result<Page> {
        let Some(page_number) = self.next_page else {
            return Ok(Page::default());
        };

        let path = format!("api/search/{}", urlencoding::encode(&self.tag));
        let mut url = ctx.endpoint(&path)?;
        url.query_pairs_mut()
            .append_pair("page", &page_number.to_string())
            .append_pair("rating", self.rating.as_query())
            .append_pair("match", self.mode.as_query());

        let page: SearchPage = ctx.fetch_json(&url).await?;
        self.next_page = page.has_more.then_some(page_number + 1);

        Ok(Page {
            items: page.items,
            has_more: page.has_more,
        })
    }

    fn clear(&mut self) {
        self.next_page = None;
    }
}
