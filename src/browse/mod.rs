use std::str::FromStr;

use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;

use crate::config::SearchOptions;
use crate::quotes::{AccountId, Quote, QuoteBook, QuoteError, RecentQuery};

mod page;

pub use page::{
    decode_date_time, encode_date_time, PageFormatError, PageSpecifier, DEFAULT_PAGE_SIZE,
    MAX_PAGE_OFFSET, MAX_PAGE_SIZE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum BrowseMode {
    Recent,
    Draft,
    Search,
}

#[derive(Debug, Error)]
pub enum BrowseError {
    #[error("bad page cursor: {0}")]
    Format(#[from] PageFormatError),
    #[error("unsupported browse mode {0:?}")]
    UnsupportedMode(String),
    #[error("drafts can only be browsed by their owner")]
    AccountRequired,
    #[error("search needs a query")]
    QueryRequired,
    #[error(transparent)]
    Quote(#[from] QuoteError),
}

/// One browse call: the raw cursor plus the context it is resolved in.
#[derive(Debug, Clone, Default)]
pub struct BrowseRequest {
    pub page: Option<String>,
    pub viewer: Option<AccountId>,
    pub owner: Option<AccountId>,
    pub label: Option<String>,
    pub query: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BrowseResult {
    pub page: PageSpecifier,
    pub quotes: Vec<Quote>,
    pub next_page: Option<PageSpecifier>,
    pub prev_page: Option<PageSpecifier>,
}

struct Fetched {
    quotes: Vec<Quote>,
    next: Option<PageSpecifier>,
    prev: Option<PageSpecifier>,
}

pub struct Browser<'a> {
    book: &'a QuoteBook,
    search_max_results: usize,
}

impl<'a> Browser<'a> {
    pub fn new(book: &'a QuoteBook, search: &SearchOptions) -> Self {
        Self {
            book,
            search_max_results: search.max_results,
        }
    }

    /// Resolves the request's cursor and fetches that page.
    ///
    /// A missing or malformed cursor falls back to `default_page`; without
    /// one the format error is returned.
    pub fn browse(
        &self,
        request: &BrowseRequest,
        default_page: Option<&PageSpecifier>,
    ) -> Result<BrowseResult, BrowseError> {
        let decoded = match request.page.as_deref() {
            Some(raw) => PageSpecifier::decode(raw),
            None => Err(PageFormatError::Empty),
        };
        let page = match (decoded, default_page) {
            (Ok(page), _) => page,
            (Err(err), Some(fallback)) => {
                tracing::debug!(%err, fallback = %fallback, "using default page");
                fallback.clone()
            }
            (Err(err), None) => return Err(err.into()),
        };

        let mode = BrowseMode::from_str(page.mode())
            .map_err(|_| BrowseError::UnsupportedMode(page.mode().to_string()))?;
        tracing::info!(%mode, offset = page.offset(), size = page.size(), "browsing quotes");

        let fetched = match mode {
            BrowseMode::Recent => self.fetch_recent(&page, request)?,
            BrowseMode::Draft => self.fetch_draft(&page, request)?,
            BrowseMode::Search => self.fetch_search(&page, request)?,
        };

        let full = fetched.quotes.len() == page.size();
        Ok(BrowseResult {
            next_page: fetched.next.filter(|_| full),
            prev_page: fetched.prev,
            quotes: fetched.quotes,
            page,
        })
    }

    fn fetch_recent(
        &self,
        page: &PageSpecifier,
        request: &BrowseRequest,
    ) -> Result<Fetched, BrowseError> {
        let result = self.book.get_recent_quotes(&RecentQuery {
            reversed: page.reversed(),
            start: page.start_value(),
            offset: page.offset(),
            limit: page.size(),
            owner: request.owner,
            label: request.label.clone(),
        })?;
        let next = result.next.map(|boundary| {
            page.clone()
                .with_start_value(Some(boundary.start))
                .with_offset(boundary.offset)
        });
        // Flipping direction at the current start and skipping the row that
        // sits on it drifts when ties straddle the boundary.
        let prev = page.start_value().map(|_| {
            page.clone()
                .with_reversed(!page.reversed())
                .with_offset(1)
        });
        Ok(Fetched {
            quotes: result.quotes,
            next,
            prev,
        })
    }

    fn fetch_draft(
        &self,
        page: &PageSpecifier,
        request: &BrowseRequest,
    ) -> Result<Fetched, BrowseError> {
        let viewer = request.viewer.ok_or(BrowseError::AccountRequired)?;
        let quotes = self
            .book
            .get_draft_quotes(viewer, page.offset(), page.size())?;
        Ok(Fetched {
            quotes,
            next: next_offset(page).map(|offset| page.clone().with_offset(offset)),
            prev: offset_prev(page),
        })
    }

    fn fetch_search(
        &self,
        page: &PageSpecifier,
        request: &BrowseRequest,
    ) -> Result<Fetched, BrowseError> {
        let query = request
            .query
            .as_deref()
            .map(str::trim)
            .filter(|query| !query.is_empty())
            .ok_or(BrowseError::QueryRequired)?;
        let remaining = self.search_max_results.saturating_sub(page.offset());
        let limit = remaining.min(page.size());
        let quotes = if limit == 0 {
            Vec::new()
        } else {
            self.book.search(query, page.offset(), limit)?
        };
        Ok(Fetched {
            quotes,
            next: next_offset(page)
                .filter(|offset| *offset < self.search_max_results)
                .map(|offset| page.clone().with_offset(offset)),
            prev: offset_prev(page),
        })
    }
}

fn next_offset(page: &PageSpecifier) -> Option<usize> {
    page.offset()
        .checked_add(page.size())
        .filter(|offset| *offset <= MAX_PAGE_OFFSET)
}

fn offset_prev(page: &PageSpecifier) -> Option<PageSpecifier> {
    (page.offset() > 0).then(|| {
        page.clone()
            .with_offset(page.offset().saturating_sub(page.size()))
    })
}
