//! A profile's bookmarks: offset paging over an unordered listing.

use async_trait::async_trait;
use serde::Deserialize;

use super::context::JobContext;
use super::pagination::{ListingOrder, Page, PageSource};
use crate::error::Result;
use crate::types::Item;

#[derive(Debug, Deserialize)]
struct BookmarkPage {
    #[serde(default)]
    items: Vec<Item>,
    #[serde(default)]
    total: usize,
}

/// Bookmark listing for one profile
#[derive(Debug)]
pub struct BookmarksSource {
    user_id: String,
    offset: usize,
    done: bool,
}

impl BookmarksSource {
    /// Listing for `user_id`
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            offset: 0,
            done: false,
        }
    }
}

#[async_trait]
impl PageSource for BookmarksSource {
    // bookmarks come back in the order they were added, not by creation date
    fn ordering(&self) -> ListingOrder {
        ListingOrder::Unordered
    }

    fn describe(&self) -> String {
        format!("bookmarks of user {}", self.user_id)
    }

    async fn next_page(&mut self, ctx: &JobContext) -> Result<Page> {
        if self.done {
            return Ok(Page::default());
        }

        let limit = ctx.config().site.page_size;
        let path = format!("api/users/{}/bookmarks", urlencoding::encode(&self.user_id));
        let mut url = ctx.endpoint(&path)?;
        url.query_pairs_mut()
            .append_pair("offset", &self.offset.to_string())
            .append_pair("limit", &limit.to_string());

        let page: BookmarkPage = ctx.fetch_json(&url).await?;
        self.offset += page.items.len();
        let has_more = self.offset < page.total;
        self.done = !has_more;

        Ok(Page {
            items: page.items,
            has_more,
        })
    }

    fn clear(&mut self) {
        self.done = true;
    }
}
