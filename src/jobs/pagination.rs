//! Shared fetch -> decide -> continue-or-stop loop for paged listings.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::context::JobContext;
use super::covers;
use super::ExtractionJob;
use crate::error::Result;
use crate::types::{Item, JobKind, Rating};

/// How a backend orders a listing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListingOrder {
    /// Newest first; the first item older than the date range ends the scan
    DateDescending,
    /// No usable order; every page is scanned
    Unordered,
}

/// Which content ratings a job keeps
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RatingFilter {
    /// Keep everything
    #[default]
    All,
    /// General audience only
    Safe,
    /// Age-restricted only
    Restricted,
}

impl RatingFilter {
    /// Query value sent to search endpoints
    pub fn as_query(&self) -> &'static str {
        match self {
            RatingFilter::All => "all",
            RatingFilter::Safe => "safe",
            RatingFilter::Restricted => "restricted",
        }
    }

    fn accepts(&self, rating: Rating) -> bool {
        match self {
            RatingFilter::All => true,
            RatingFilter::Safe => rating == Rating::Safe,
            RatingFilter::Restricted => rating == Rating::Restricted,
        }
    }
}

/// How a tag query matches item tags
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagMode {
    /// Tag contains the query
    #[default]
    Partial,
    /// Tag equals the query
    Exact,
}

impl TagMode {
    /// Query value sent to search endpoints
    pub fn as_query(&self) -> &'static str {
        match self {
            TagMode::Partial => "partial",
            TagMode::Exact => "exact",
        }
    }
}

/// Result-set filter applied to every harvested item
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultFilter {
    /// Stop once this many items were accepted
    #[serde(default)]
    pub max_count: Option<usize>,
    /// Inclusive lower bound on creation time
    #[serde(default)]
    pub date_from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on creation time
    #[serde(default)]
    pub date_to: Option<DateTime<Utc>>,
    /// Rating restriction
    #[serde(default)]
    pub rating: RatingFilter,
    /// Tag matching mode for tag searches
    #[serde(default)]
    pub tag_mode: TagMode,
}

impl ResultFilter {
    /// Whether `item` passes the date range and rating restriction
    pub fn matches(&self, item: &Item) -> bool {
        if self.is_older_than_range(item) {
            debug!(item_id = %item.id, created_at = %item.created_at, "Item before date range");
            return false;
        }
        if let Some(to) = self.date_to
            && item.created_at > to
        {
            debug!(item_id = %item.id, created_at = %item.created_at, "Item after date range");
            return false;
        }
        if !self.rating.accepts(item.rating) {
            debug!(item_id = %item.id, rating = ?item.rating, "Item rejected by rating");
            return false;
        }
        true
    }

    /// Whether `item` is older than the lower date bound
    pub fn is_older_than_range(&self, item: &Item) -> bool {
        self.date_from.is_some_and(|from| item.created_at < from)
    }

    fn is_full(&self, accepted: usize) -> bool {
        self.max_count.is_some_and(|max| accepted >= max)
    }
}

/// One page of a listing
#[derive(Clone, Debug, Default)]
pub struct Page {
    /// Items in backend order
    pub items: Vec<Item>,
    /// Backend reports more results after this page
    pub has_more: bool,
}

/// A paged remote listing
#[async_trait]
pub trait PageSource: Send {
    /// Order the backend returns items in
    fn ordering(&self) -> ListingOrder;

    /// Human-readable description of the listing
    fn describe(&self) -> String;

    /// Fetch the next page
    async fn next_page(&mut self, ctx: &JobContext) -> Result<Page>;

    /// Drop any unconsumed continuation state
    fn clear(&mut self);
}

/// Drive `source` until the continuation rule says stop
///
/// Pages are requested strictly one after another. Each page's covers are
/// resolved before the next page is requested. Pagination continues while the
/// backend reports more results, the last page was non-empty and the
/// `max_count` cap has not been reached.
pub async fn paginate(
    source: &mut dyn PageSource,
    filter: &ResultFilter,
    ctx: &JobContext,
) -> Result<Vec<Item>> {
    let ordering = source.ordering();
    let mut items: Vec<Item> = Vec::new();
    let mut page_number = 0usize;

    loop {
        ctx.checkpoint()?;
        let page = source.next_page(ctx).await?;
        page_number += 1;

        let fetched = page.items.len();
        let mut past_range = false;
        let mut accepted = Vec::new();
        for item in page.items {
            if filter.is_full(items.len() + accepted.len()) {
                break;
            }
            if ordering == ListingOrder::DateDescending && filter.is_older_than_range(&item) {
                past_range = true;
                break;
            }
            if filter.matches(&item) {
                accepted.push(item);
            }
        }

        covers::resolve_covers(ctx, &mut accepted).await;
        ctx.checkpoint()?;

        items.extend(accepted);
        debug!(
            job_id = %ctx.id(),
            page = page_number,
            fetched,
            accumulated = items.len(),
            has_more = page.has_more,
            "Page processed"
        );

        if past_range || !page.has_more || fetched == 0 || filter.is_full(items.len()) {
            source.clear();
            break;
        }
    }

    Ok(items)
}

/// An extraction job backed by one [`PageSource`]
pub struct PagedJob<S> {
    kind: JobKind,
    source: S,
    filter: ResultFilter,
}

impl<S: PageSource> PagedJob<S> {
    /// Job of `kind` over `source`
    pub fn new(kind: JobKind, source: S, filter: ResultFilter) -> Self {
        Self {
            kind,
            source,
            filter,
        }
    }
}

#[async_trait]
impl<S: PageSource> ExtractionJob for PagedJob<S> {
    fn kind(&self) -> JobKind {
        self.kind
    }

    fn describe(&self) -> String {
        self.source.describe()
    }

    async fn run(&mut self, ctx: &JobContext) -> Result<Vec<Item>> {
        paginate(&mut self.source, &self.filter, ctx).await
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::jobs::cache::CoverCache;
    use crate::test_helpers::FakeTransport;
    use crate::types::{Author, JobId};
    use chrono::TimeZone;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn item(id: u32, day: u32) -> Item {
        Item {
            id: id.to_string(),
            title: format!("work {}", id),
            author: Author::default(),
            tags: Vec::new(),
            media_url: None,
            cover_url: None,
            created_at: Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).unwrap(),
            rating: Rating::Safe,
            page_count: 1,
            bookmark_count: 0,
            view_count: 0,
        }
    }

    /// Serves scripted pages and counts requests
    struct ScriptedSource {
        ordering: ListingOrder,
        pages: Vec<Page>,
        fetched: usize,
        cleared: bool,
        endless: Option<usize>,
    }

    impl ScriptedSource {
        fn new(ordering: ListingOrder, pages: Vec<Page>) -> Self {
            Self {
                ordering,
                pages,
                fetched: 0,
                cleared: false,
                endless: None,
            }
        }

        /// Every page has `per_page` items and claims more results exist
        fn endless(per_page: usize) -> Self {
            Self {
                endless: Some(per_page),
                ..Self::new(ListingOrder::DateDescending, Vec::new())
            }
        }
    }

    #[async_trait]
    impl PageSource for ScriptedSource {
        fn ordering(&self) -> ListingOrder {
            self.ordering
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }

        async fn next_page(&mut self, _ctx: &JobContext) -> Result<Page> {
            self.fetched += 1;
            if let Some(per_page) = self.endless {
                let base = (self.fetched as u32 - 1) * per_page as u32;
                let items = (0..per_page as u32).map(|i| item(base + i, 28)).collect();
                return Ok(Page {
                    items,
                    has_more: true,
                });
            }
            if self.pages.is_empty() {
                return Ok(Page::default());
            }
            Ok(self.pages.remove(0))
        }

        fn clear(&mut self) {
            self.cleared = true;
            self.pages.clear();
        }
    }

    fn context_with(token: CancellationToken) -> JobContext {
        JobContext::new(
            JobId(1),
            FakeTransport::new(),
            Arc::new(Config::default()),
            Arc::new(CoverCache::default()),
            token,
        )
        .unwrap()
    }

    fn context() -> JobContext {
        context_with(CancellationToken::new())
    }

    #[tokio::test]
    async fn max_count_caps_endless_listing() {
        let mut source = ScriptedSource::endless(4);
        let filter = ResultFilter {
            max_count: Some(10),
            ..Default::default()
        };

        let items = paginate(&mut source, &filter, &context()).await.unwrap();

        assert_eq!(source.fetched, 3);
        assert_eq!(items.len(), 10);
        assert!(source.cleared);
    }

    #[tokio::test]
    async fn stops_when_backend_reports_no_more() {
        let mut source = ScriptedSource::new(
            ListingOrder::DateDescending,
            vec![
                Page {
                    items: vec![item(1, 20), item(2, 19)],
                    has_more: true,
                },
                Page {
                    items: vec![item(3, 18)],
                    has_more: false,
                },
                Page {
                    items: vec![item(4, 17)],
                    has_more: true,
                },
            ],
        );

        let items = paginate(&mut source, &ResultFilter::default(), &context())
            .await
            .unwrap();

        assert_eq!(source.fetched, 2);
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn empty_page_stops_even_if_more_claimed() {
        let mut source = ScriptedSource::new(
            ListingOrder::Unordered,
            vec![
                Page {
                    items: vec![item(1, 20)],
                    has_more: true,
                },
                Page {
                    items: Vec::new(),
                    has_more: true,
                },
            ],
        );

        let items = paginate(&mut source, &ResultFilter::default(), &context())
            .await
            .unwrap();

        assert_eq!(source.fetched, 2);
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn date_ordered_listing_stops_at_lower_bound() {
        let mut source = ScriptedSource::new(
            ListingOrder::DateDescending,
            vec![
                Page {
                    items: vec![item(1, 20), item(2, 15), item(3, 9), item(4, 25)],
                    has_more: true,
                },
                Page {
                    items: vec![item(5, 8)],
                    has_more: true,
                },
            ],
        );
        let filter = ResultFilter {
            date_from: Some(Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap()),
            date_to: Some(Utc.with_ymd_and_hms(2024, 3, 18, 0, 0, 0).unwrap()),
            ..Default::default()
        };

        let items = paginate(&mut source, &filter, &context()).await.unwrap();

        assert_eq!(source.fetched, 1);
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["2"]);
    }

    #[tokio::test]
    async fn unordered_listing_filters_every_page() {
        let mut source = ScriptedSource::new(
            ListingOrder::Unordered,
            vec![
                Page {
                    items: vec![item(1, 5), item(2, 15)],
                    has_more: true,
                },
                Page {
                    items: vec![item(3, 2), item(4, 12)],
                    has_more: false,
                },
            ],
        );
        let filter = ResultFilter {
            date_from: Some(Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap()),
            ..Default::default()
        };

        let items = paginate(&mut source, &filter, &context()).await.unwrap();

        assert_eq!(source.fetched, 2);
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "4"]);
    }

    #[tokio::test]
    async fn rating_filter_drops_other_ratings() {
        let mut restricted = item(2, 10);
        restricted.rating = Rating::Restricted;
        let mut source = ScriptedSource::new(
            ListingOrder::Unordered,
            vec![Page {
                items: vec![item(1, 10), restricted],
                has_more: false,
            }],
        );
        let filter = ResultFilter {
            rating: RatingFilter::Restricted,
            ..Default::default()
        };

        let items = paginate(&mut source, &filter, &context()).await.unwrap();

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "2");
    }

    #[tokio::test]
    async fn cancelled_context_stops_before_fetching() {
        let token = CancellationToken::new();
        let ctx = context_with(token.clone());
        token.cancel();
        let mut source = ScriptedSource::endless(4);

        let err = paginate(&mut source, &ResultFilter::default(), &ctx)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(source.fetched, 0);
    }
}
