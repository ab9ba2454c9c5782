use std::collections::BTreeSet;

use strum::{AsRefStr, Display};
use time::OffsetDateTime;

use crate::dialog::{FormatterRegistry, Line, RenderedLine};
use crate::signature::line_signatures;

pub type QuoteId = i64;
pub type AccountId = i64;

pub const NICK_LABEL_PREFIX: &str = "nick:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    pub quote_count: i64,
    pub draft_count: i64,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum QuoteState {
    Draft,
    Published,
    PublishedWithPendingEdit,
    Deleted,
}

#[derive(Debug, Clone, Default)]
pub struct DraftOptions {
    pub preserve_formatting: bool,
    pub note: Option<String>,
    /// Defaults to the time the draft is stored.
    pub submitted: Option<OffsetDateTime>,
}

/// Changes applied to a draft by `QuoteBook::update`.
#[derive(Debug, Clone, Default)]
pub struct QuoteUpdate {
    pub dialog: Option<String>,
    pub preserve_formatting: Option<bool>,
    pub note: Option<Option<String>>,
    pub publish: bool,
    pub modified: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    pub id: QuoteId,
    pub account_id: AccountId,
    pub dialog_source: String,
    pub preserve_formatting: bool,
    pub note: Option<String>,
    pub lines: Vec<Line>,
    pub labels: Vec<String>,
    pub signatures: BTreeSet<String>,
    pub draft: bool,
    pub deleted: bool,
    pub clone_of: Option<QuoteId>,
    pub submitted: OffsetDateTime,
    pub modified: Option<OffsetDateTime>,
    pub built: OffsetDateTime,
}

impl Quote {
    /// An unsaved draft; `id` stays 0 until the row is inserted.
    pub fn new_draft(
        account_id: AccountId,
        source: &str,
        options: DraftOptions,
        submitted: OffsetDateTime,
    ) -> Self {
        Self {
            id: 0,
            account_id,
            dialog_source: source.to_string(),
            preserve_formatting: options.preserve_formatting,
            note: options.note,
            lines: Vec::new(),
            labels: Vec::new(),
            signatures: BTreeSet::new(),
            draft: true,
            deleted: false,
            clone_of: None,
            submitted: options.submitted.unwrap_or(submitted),
            modified: None,
            built: OffsetDateTime::UNIX_EPOCH,
        }
    }

    pub fn state(&self) -> QuoteState {
        if self.deleted {
            QuoteState::Deleted
        } else if self.draft {
            QuoteState::Draft
        } else if self.clone_of.is_some() {
            QuoteState::PublishedWithPendingEdit
        } else {
            QuoteState::Published
        }
    }

    /// Re-derives lines, labels and signatures from `dialog_source`.
    pub fn rebuild(&mut self, registry: &FormatterRegistry, now: OffsetDateTime) {
        self.lines = registry.parse(&self.dialog_source, self.preserve_formatting);

        let nicks: BTreeSet<String> = self
            .lines
            .iter()
            .filter_map(Line::normalized_nick)
            .filter(|nick| !nick.is_empty())
            .map(str::to_string)
            .collect();
        self.labels.retain(|label| !label.starts_with(NICK_LABEL_PREFIX));
        for nick in nicks {
            self.add_label(&format!("{NICK_LABEL_PREFIX}{nick}"));
        }

        self.signatures = line_signatures(&self.lines);
        self.built = now;
        tracing::debug!(
            quote_id = self.id,
            lines = self.lines.len(),
            labels = ?self.labels,
            "rebuilt quote"
        );
    }

    /// Takes every content field from `other`, leaving identity, state and
    /// timestamps other than `built` alone.
    pub fn copy_content_from(&mut self, other: &Quote) {
        self.dialog_source = other.dialog_source.clone();
        self.preserve_formatting = other.preserve_formatting;
        self.note = other.note.clone();
        self.lines = other.lines.clone();
        self.labels = other.labels.clone();
        self.signatures = other.signatures.clone();
        self.built = other.built;
    }

    pub fn dialog(&self) -> Vec<RenderedLine> {
        self.lines.iter().map(Line::render).collect()
    }

    pub fn labels_with_prefix(&self, prefix: &str) -> Vec<&str> {
        self.labels
            .iter()
            .map(String::as_str)
            .filter(|label| label.starts_with(prefix))
            .collect()
    }

    pub fn add_label(&mut self, label: &str) {
        let label = label.trim().to_lowercase();
        if label.is_empty() {
            return;
        }
        if let Err(position) = self.labels.binary_search(&label) {
            self.labels.insert(position, label);
        }
    }

    pub fn nicks(&self) -> Vec<&str> {
        self.labels_with_prefix(NICK_LABEL_PREFIX)
            .into_iter()
            .map(|label| &label[NICK_LABEL_PREFIX.len()..])
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateCandidate {
    pub quote: Quote,
    pub shared: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn draft(source: &str) -> Quote {
        Quote::new_draft(1, source, DraftOptions::default(), datetime!(2024-01-01 0:00 UTC))
    }

    #[test]
    fn rebuild_derives_nick_labels_and_signatures() {
        let registry = FormatterRegistry::standard();
        let mut quote = draft("<Bob> i think the server is on fire\n<amy_> it is always on fire");
        quote.rebuild(&registry, datetime!(2024-01-02 0:00 UTC));
        assert_eq!(quote.labels, vec!["nick:amy", "nick:bob"]);
        assert_eq!(quote.nicks(), vec!["amy", "bob"]);
        assert_eq!(quote.signatures.len(), 2);
        assert_eq!(quote.built, datetime!(2024-01-02 0:00 UTC));
        assert_eq!(quote.dialog()[1].text, "it is always on fire");
    }

    #[test]
    fn rebuild_is_idempotent() {
        let registry = FormatterRegistry::standard();
        let mut quote = draft("[12:00] <bob> lunch time everybody\n  seriously, lunch");
        quote.rebuild(&registry, datetime!(2024-01-02 0:00 UTC));
        let first = quote.clone();
        quote.rebuild(&registry, datetime!(2024-01-02 0:00 UTC));
        assert_eq!(quote, first);
    }

    #[test]
    fn rebuild_replaces_stale_nick_labels_but_keeps_others() {
        let registry = FormatterRegistry::standard();
        let mut quote = draft("<bob> hello there friends");
        quote.add_label("Channel:#rust");
        quote.rebuild(&registry, datetime!(2024-01-02 0:00 UTC));
        quote.dialog_source = "<amy> hello there friends".to_string();
        quote.rebuild(&registry, datetime!(2024-01-03 0:00 UTC));
        assert_eq!(quote.labels, vec!["channel:#rust", "nick:amy"]);
    }

    #[test]
    fn preserved_quotes_have_no_nick_labels() {
        let registry = FormatterRegistry::standard();
        let mut quote = draft("<bob> hello there friends");
        quote.preserve_formatting = true;
        quote.rebuild(&registry, datetime!(2024-01-02 0:00 UTC));
        assert!(quote.labels.is_empty());
        assert_eq!(quote.dialog()[0].text, "<bob> hello there friends");
    }

    #[test]
    fn state_follows_the_flags() {
        let mut quote = draft("x");
        assert_eq!(quote.state(), QuoteState::Draft);
        quote.draft = false;
        assert_eq!(quote.state(), QuoteState::Published);
        quote.clone_of = Some(9);
        assert_eq!(quote.state(), QuoteState::PublishedWithPendingEdit);
        quote.deleted = true;
        assert_eq!(quote.state(), QuoteState::Deleted);
        assert_eq!(QuoteState::PublishedWithPendingEdit.to_string(), "published_with_pending_edit");
    }
}
