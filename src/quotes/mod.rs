use std::sync::Arc;

use rusqlite::Connection;
use thiserror::Error;
use time::OffsetDateTime;

use crate::dialog::FormatterRegistry;
use crate::events::{emit, EventSink, QuoteEvent, Verb};
use crate::signature::line_signatures;
use crate::storage::{
    self, rows, timestamp_now, StorageHandle, TimestampField, TimestampPage, TimestampQuery,
};

mod model;

pub use model::{
    Account, AccountId, DraftOptions, DuplicateCandidate, Quote, QuoteId, QuoteState, QuoteUpdate,
    NICK_LABEL_PREFIX,
};

#[derive(Debug, Error)]
pub enum QuoteError {
    #[error("quote {0} not found")]
    NotFound(QuoteId),
    #[error("cannot {operation} quote {id}: it is {state}")]
    InvalidState {
        id: QuoteId,
        state: QuoteState,
        operation: &'static str,
    },
    #[error("account {account} may not change quote {id}")]
    NoPermission { id: QuoteId, account: AccountId },
    #[error("account {0} not found")]
    UnknownAccount(AccountId),
    #[error("dialog cannot be empty")]
    EmptyDialog,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl QuoteError {
    /// Only lost races for the write lock are worth retrying; every other
    /// variant describes a caller or input problem.
    pub fn is_retryable(&self) -> bool {
        match self {
            QuoteError::Storage(err) => storage::is_contention(err),
            _ => false,
        }
    }
}

pub type QuoteResult<T> = std::result::Result<T, QuoteError>;

/// Paging arguments for the public "recent quotes" listing.
#[derive(Debug, Clone, Default)]
pub struct RecentQuery {
    pub reversed: bool,
    pub start: Option<OffsetDateTime>,
    pub offset: usize,
    pub limit: usize,
    pub owner: Option<AccountId>,
    pub label: Option<String>,
}

/// Entry point for everything that creates, changes or lists quotes.
pub struct QuoteBook {
    storage: StorageHandle,
    registry: Arc<FormatterRegistry>,
    events: Arc<dyn EventSink>,
}

impl QuoteBook {
    pub fn new(storage: StorageHandle, events: Arc<dyn EventSink>) -> Self {
        Self::with_registry(storage, Arc::new(FormatterRegistry::standard()), events)
    }

    pub fn with_registry(
        storage: StorageHandle,
        registry: Arc<FormatterRegistry>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            storage,
            registry,
            events,
        }
    }

    pub fn storage(&self) -> &StorageHandle {
        &self.storage
    }

    pub fn registry(&self) -> &FormatterRegistry {
        &self.registry
    }

    fn notify(&self, account_id: AccountId, verb: Verb, quote_id: QuoteId) {
        emit(
            self.events.as_ref(),
            QuoteEvent {
                account_id,
                verb,
                quote_id: Some(quote_id),
                timestamp: timestamp_now(),
            },
        );
    }

    pub fn create_account(&self, name: &str) -> QuoteResult<Account> {
        Ok(self.storage.create_account(name)?)
    }

    pub fn account(&self, account_id: AccountId) -> QuoteResult<Account> {
        self.storage
            .fetch_account(account_id)?
            .ok_or(QuoteError::UnknownAccount(account_id))
    }

    pub fn account_by_name(&self, name: &str) -> QuoteResult<Option<Account>> {
        Ok(self.storage.fetch_account_by_name(name)?)
    }

    pub fn create_draft(
        &self,
        account_id: AccountId,
        source: &str,
        options: DraftOptions,
    ) -> QuoteResult<Quote> {
        if source.trim().is_empty() {
            return Err(QuoteError::EmptyDialog);
        }
        tracing::info!(account_id, "creating draft");
        let now = timestamp_now();
        let mut quote = Quote::new_draft(account_id, source, options, now);
        quote.rebuild(&self.registry, now);
        self.storage.transaction(|tx| -> QuoteResult<_> {
            if rows::load_account(tx, account_id)?.is_none() {
                return Err(QuoteError::UnknownAccount(account_id));
            }
            quote.id = rows::insert_quote(tx, &quote)?;
            rows::adjust_account_counters(tx, account_id, 0, 1)?;
            Ok(())
        })?;
        tracing::info!(quote_id = quote.id, account_id, "draft created");
        Ok(quote)
    }

    /// Re-parses a quote's dialog with the current formatter chain.
    pub fn rebuild(&self, quote_id: QuoteId) -> QuoteResult<Quote> {
        self.storage.transaction(|tx| -> QuoteResult<_> {
            let mut quote = rows::load_quote(tx, quote_id)?.ok_or(QuoteError::NotFound(quote_id))?;
            if quote.deleted {
                return Err(invalid_state(&quote, "rebuild"));
            }
            quote.rebuild(&self.registry, timestamp_now());
            rows::write_content(tx, &quote)?;
            Ok(quote)
        })
    }

    pub fn update(
        &self,
        account_id: AccountId,
        quote_id: QuoteId,
        changes: QuoteUpdate,
    ) -> QuoteResult<Quote> {
        if changes
            .dialog
            .as_deref()
            .is_some_and(|dialog| dialog.trim().is_empty())
        {
            return Err(QuoteError::EmptyDialog);
        }
        let (quote, verb) = self.storage.transaction(|tx| -> QuoteResult<_> {
            let mut quote = require_draft(tx, account_id, quote_id, "update")?;
            if let Some(dialog) = &changes.dialog {
                quote.dialog_source = dialog.clone();
            }
            if let Some(preserve) = changes.preserve_formatting {
                quote.preserve_formatting = preserve;
            }
            if let Some(note) = &changes.note {
                quote.note = note.clone();
            }
            quote.rebuild(&self.registry, timestamp_now());
            rows::write_content(tx, &quote)?;
            if changes.publish {
                publish_in(tx, quote, changes.modified)
            } else {
                Ok((quote, Verb::Updated))
            }
        })?;
        self.notify(account_id, verb, quote.id);
        Ok(quote)
    }

    /// Publishes a draft. A draft that is the pending edit of a published
    /// quote is folded back into that quote instead.
    pub fn publish(
        &self,
        account_id: AccountId,
        quote_id: QuoteId,
        modified: Option<OffsetDateTime>,
    ) -> QuoteResult<Quote> {
        let (quote, verb) = self.storage.transaction(|tx| -> QuoteResult<_> {
            let quote = require_draft(tx, account_id, quote_id, "publish")?;
            publish_in(tx, quote, modified)
        })?;
        tracing::info!(quote_id = quote.id, account_id, %verb, "quote published");
        self.notify(account_id, verb, quote.id);
        Ok(quote)
    }

    /// Returns the pending edit draft for a published quote, creating it on
    /// first use.
    pub fn edit(&self, account_id: AccountId, quote_id: QuoteId) -> QuoteResult<Quote> {
        self.storage.transaction(|tx| -> QuoteResult<_> {
            let published = load_live(tx, quote_id)?;
            if published.draft {
                return Err(invalid_state(&published, "edit"));
            }
            if published.account_id != account_id {
                return Err(QuoteError::NoPermission {
                    id: quote_id,
                    account: account_id,
                });
            }
            if let Some(existing) = published.clone_of {
                if let Some(draft) = rows::load_quote(tx, existing)? {
                    tracing::debug!(quote_id, draft_id = draft.id, "reusing pending edit");
                    return Ok(draft);
                }
            }

            let now = timestamp_now();
            let mut draft = Quote::new_draft(
                published.account_id,
                &published.dialog_source,
                DraftOptions::default(),
                now,
            );
            draft.copy_content_from(&published);
            draft.id = rows::insert_quote(tx, &draft)?;
            rows::set_clone_of(tx, published.id, Some(draft.id))?;
            rows::adjust_account_counters(tx, account_id, 0, 1)?;
            tracing::info!(quote_id, draft_id = draft.id, "opened edit draft");
            Ok(draft)
        })
    }

    /// Folds a pending edit draft back into the quote it was cloned from.
    pub fn republish(
        &self,
        account_id: AccountId,
        draft_id: QuoteId,
        modified: Option<OffsetDateTime>,
    ) -> QuoteResult<Quote> {
        let quote = self.storage.transaction(|tx| -> QuoteResult<_> {
            let draft = require_draft(tx, account_id, draft_id, "republish")?;
            let parent_id =
                rows::find_clone_parent(tx, draft_id)?.ok_or_else(|| invalid_state(&draft, "republish"))?;
            republish_in(tx, draft, parent_id, modified)
        })?;
        self.notify(account_id, Verb::Updated, quote.id);
        Ok(quote)
    }

    /// Soft-deletes a published quote along with any pending edit.
    pub fn unpublish(&self, account_id: AccountId, quote_id: QuoteId) -> QuoteResult<Quote> {
        let quote = self.storage.transaction(|tx| -> QuoteResult<_> {
            let mut quote = load_live(tx, quote_id)?;
            if quote.account_id != account_id {
                return Err(QuoteError::NoPermission {
                    id: quote_id,
                    account: account_id,
                });
            }
            if quote.draft {
                return Err(invalid_state(&quote, "delete"));
            }
            rows::mark_deleted(tx, quote_id)?;
            let mut draft_delta = 0;
            if let Some(pending) = quote.clone_of.take() {
                rows::set_clone_of(tx, quote_id, None)?;
                rows::delete_quote(tx, pending)?;
                draft_delta = -1;
            }
            rows::adjust_account_counters(tx, quote.account_id, -1, draft_delta)?;
            quote.deleted = true;
            Ok(quote)
        })?;
        tracing::info!(quote_id, account_id, "quote deleted");
        self.notify(account_id, Verb::Deleted, quote_id);
        Ok(quote)
    }

    /// Throws a draft away for good. Discarding a pending edit leaves the
    /// published quote untouched.
    pub fn discard_draft(&self, account_id: AccountId, draft_id: QuoteId) -> QuoteResult<()> {
        self.storage.transaction(|tx| -> QuoteResult<_> {
            let draft = require_draft(tx, account_id, draft_id, "discard")?;
            if let Some(parent) = rows::find_clone_parent(tx, draft_id)? {
                rows::set_clone_of(tx, parent, None)?;
            }
            rows::delete_quote(tx, draft.id)?;
            rows::adjust_account_counters(tx, draft.account_id, 0, -1)?;
            Ok(())
        })?;
        tracing::info!(draft_id, account_id, "draft discarded");
        Ok(())
    }

    pub fn get_draft(&self, account_id: AccountId, quote_id: QuoteId) -> QuoteResult<Quote> {
        let conn = self.storage.connect()?;
        require_draft(&conn, account_id, quote_id, "open")
    }

    /// Any live quote the viewer may see: published ones, plus their own drafts.
    pub fn get_quote(&self, viewer: Option<AccountId>, quote_id: QuoteId) -> QuoteResult<Quote> {
        let quote = self
            .storage
            .fetch_quote(quote_id)?
            .filter(|quote| !quote.deleted)
            .ok_or(QuoteError::NotFound(quote_id))?;
        if quote.draft && viewer != Some(quote.account_id) {
            return Err(QuoteError::NoPermission {
                id: quote_id,
                account: viewer.unwrap_or_default(),
            });
        }
        Ok(quote)
    }

    pub fn get_published_quote(&self, quote_id: QuoteId) -> QuoteResult<Option<Quote>> {
        Ok(self
            .storage
            .fetch_quote(quote_id)?
            .filter(|quote| !quote.deleted && !quote.draft))
    }

    /// Published quotes by submission time, newest first unless reversed.
    pub fn get_recent_quotes(&self, query: &RecentQuery) -> QuoteResult<TimestampPage> {
        let mut ts_query = TimestampQuery::new(TimestampField::Submitted, query.limit);
        ts_query.start = query.start;
        ts_query.offset = query.offset;
        ts_query.descending = !query.reversed;
        ts_query.include_drafts = false;
        ts_query.owner = query.owner;
        ts_query.label = query.label.clone();
        Ok(self.storage.query_by_timestamp(&ts_query)?)
    }

    /// Quotes in build order, drafts included; oldest builds first unless
    /// `descending`.
    pub fn get_quotes_by_build_time(
        &self,
        start: Option<OffsetDateTime>,
        offset: usize,
        limit: usize,
        descending: bool,
    ) -> QuoteResult<TimestampPage> {
        let mut query = TimestampQuery::new(TimestampField::Built, limit);
        query.start = start;
        query.offset = offset;
        query.descending = descending;
        Ok(self.storage.query_by_timestamp(&query)?)
    }

    pub fn get_draft_quotes(
        &self,
        account_id: AccountId,
        offset: usize,
        limit: usize,
    ) -> QuoteResult<Vec<Quote>> {
        Ok(self.storage.fetch_draft_quotes(account_id, offset, limit)?)
    }

    pub fn search(&self, query: &str, offset: usize, limit: usize) -> QuoteResult<Vec<Quote>> {
        Ok(self.storage.search_quotes(query, offset, limit)?)
    }

    /// Other live quotes that share signatures with this one.
    pub fn find_duplicates(
        &self,
        quote_id: QuoteId,
        limit: usize,
    ) -> QuoteResult<Vec<DuplicateCandidate>> {
        let quote = self
            .storage
            .fetch_quote(quote_id)?
            .filter(|quote| !quote.deleted)
            .ok_or(QuoteError::NotFound(quote_id))?;
        let mut exclude = vec![quote.id];
        exclude.extend(quote.clone_of);
        let conn = self.storage.connect()?;
        exclude.extend(rows::find_clone_parent(&conn, quote.id)?);
        let signatures: Vec<String> = quote.signatures.iter().cloned().collect();
        self.lookup_duplicates(&signatures, &exclude, limit)
    }

    /// Duplicate lookup for text that has not been stored yet.
    pub fn find_duplicates_of(
        &self,
        source: &str,
        preserve_formatting: bool,
        limit: usize,
    ) -> QuoteResult<Vec<DuplicateCandidate>> {
        let lines = self.registry.parse(source, preserve_formatting);
        let signatures: Vec<String> = line_signatures(&lines).into_iter().collect();
        self.lookup_duplicates(&signatures, &[], limit)
    }

    fn lookup_duplicates(
        &self,
        signatures: &[String],
        exclude: &[QuoteId],
        limit: usize,
    ) -> QuoteResult<Vec<DuplicateCandidate>> {
        let matches = self.storage.find_by_signatures(signatures, exclude, limit)?;
        Ok(matches
            .into_iter()
            .map(|(quote, shared)| DuplicateCandidate { quote, shared })
            .collect())
    }
}

fn invalid_state(quote: &Quote, operation: &'static str) -> QuoteError {
    QuoteError::InvalidState {
        id: quote.id,
        state: quote.state(),
        operation,
    }
}

fn load_live(conn: &Connection, quote_id: QuoteId) -> QuoteResult<Quote> {
    rows::load_quote(conn, quote_id)?
        .filter(|quote| !quote.deleted)
        .ok_or(QuoteError::NotFound(quote_id))
}

fn require_draft(
    conn: &Connection,
    account_id: AccountId,
    quote_id: QuoteId,
    operation: &'static str,
) -> QuoteResult<Quote> {
    let quote = load_live(conn, quote_id)?;
    if quote.draft && quote.account_id != account_id {
        return Err(QuoteError::NoPermission {
            id: quote_id,
            account: account_id,
        });
    }
    if !quote.draft {
        return Err(invalid_state(&quote, operation));
    }
    Ok(quote)
}

fn publish_in(
    conn: &Connection,
    mut quote: Quote,
    modified: Option<OffsetDateTime>,
) -> QuoteResult<(Quote, Verb)> {
    if let Some(parent_id) = rows::find_clone_parent(conn, quote.id)? {
        let parent = republish_in(conn, quote, parent_id, modified)?;
        return Ok((parent, Verb::Updated));
    }
    let modified = modified.unwrap_or_else(timestamp_now);
    rows::set_published(conn, quote.id, modified)?;
    rows::adjust_account_counters(conn, quote.account_id, 1, -1)?;
    quote.draft = false;
    quote.modified = Some(modified);
    Ok((quote, Verb::Published))
}

fn republish_in(
    conn: &Connection,
    draft: Quote,
    parent_id: QuoteId,
    modified: Option<OffsetDateTime>,
) -> QuoteResult<Quote> {
    let mut parent = load_live(conn, parent_id)?;
    if parent.draft || parent.clone_of != Some(draft.id) {
        return Err(invalid_state(&parent, "republish"));
    }
    let modified = modified.unwrap_or_else(timestamp_now);
    parent.copy_content_from(&draft);
    rows::write_content(conn, &parent)?;
    rows::set_clone_of(conn, parent.id, None)?;
    rows::set_published(conn, parent.id, modified)?;
    rows::delete_quote(conn, draft.id)?;
    rows::adjust_account_counters(conn, parent.account_id, 0, -1)?;
    parent.clone_of = None;
    parent.modified = Some(modified);
    tracing::info!(quote_id = parent.id, draft_id = draft.id, "edit republished");
    Ok(parent)
}
