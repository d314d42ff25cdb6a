//! All works of one profile: id list first, then detail pages batched by query length.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::VecDeque;
use tracing::debug;

use super::context::JobContext;
use super::pagination::{ListingOrder, Page, PageSource};
use crate::error::{Error, Result};
use crate::types::Item;

#[derive(Debug, Deserialize)]
struct IdList {
    #[serde(default)]
    ids: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct DetailPage {
    #[serde(default)]
    items: Vec<Item>,
}

/// Gallery listing for one profile
#[derive(Debug)]
pub struct GallerySource {
    user_id: String,
    /// Ids not yet requested; `None` until the id list was fetched
    queue: Option<VecDeque<String>>,
}

impl GallerySource {
    /// Listing for `user_id`
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            queue: None,
        }
    }

    async fn load_ids(&self, ctx: &JobContext) -> Result<VecDeque<String>> {
        let path = format!("api/users/{}/works", urlencoding::encode(&self.user_id));
        let list: IdList = ctx.fetch_json(&ctx.endpoint(&path)?).await?;

        let mut ids: Vec<String> = list
            .ids
            .into_iter()
            .map(|id| match id {
                serde_json::Value::String(s) => Ok(s),
                serde_json::Value::Number(n) => Ok(n.to_string()),
                other => Err(Error::Parse(format!("unexpected work id {}", other))),
            })
            .collect::<Result<_>>()?;
        sort_newest_first(&mut ids);

        debug!(job_id = %ctx.id(), user_id = %self.user_id, works = ids.len(), "Work ids loaded");
        Ok(ids.into())
    }
}

/// Numeric ids sort by value; newer works have larger ids
fn sort_newest_first(ids: &mut [String]) {
    ids.sort_by(|a, b| {
        b.len()
            .cmp(&a.len())
            .then_with(|| b.cmp(a))
    });
}

/// Pop ids from the front of `queue` while the query stays within `budget` bytes
///
/// At least one id is always taken so an oversized id cannot stall pagination.
pub(crate) fn take_batch(queue: &mut VecDeque<String>, budget: usize) -> String {
    let mut query = String::new();
    while let Some(id) = queue.front() {
        let pair = format!("ids%5B%5D={}", urlencoding::encode(id));
        let added = if query.is_empty() {
            pair.len()
        } else {
            pair.len() + 1
        };
        if !query.is_empty() && query.len() + added > budget {
            break;
        }
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&pair);
        queue.pop_front();
    }
    query
}

#[async_trait]
impl PageSource for GallerySource {
    fn ordering(&self) -> ListingOrder {
        ListingOrder::DateDescending
    }

    fn describe(&self) -> String {
        format!("gallery of user {}", self.user_id)
    }

    async fn next_page(&mut self, ctx: &JobContext) -> Result<Page> {
        if self.queue.is_none() {
            self.queue = Some(self.load_ids(ctx).await?);
        }
        let budget = ctx.config().site.max_query_bytes;
        let Some(queue) = self.queue.as_mut() else {
            return Ok(Page::default());
        };
        if queue.is_empty() {
            return Ok(Page::default());
        }

        let query = take_batch(queue, budget);
        let has_more = !queue.is_empty();

        let path = format!("api/users/{}/works/details", urlencoding::encode(&self.user_id));
        let mut url = ctx.endpoint(&path)?;
        url.set_query(Some(&query));

        let page: DetailPage = ctx.fetch_json(&url).await?;
        Ok(Page {
            items: page.items,
            has_more,
        })
    }

    fn clear(&mut self) {
        if let Some(queue) = self.queue.as_mut() {
            queue.clear();
        }
    }
}
