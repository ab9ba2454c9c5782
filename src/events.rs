use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use strum::{AsRefStr, Display, EnumString};
use time::OffsetDateTime;

use crate::storage::StorageHandle;

pub const SITE_QUOTE_COUNTER: &str = "quotes";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Verb {
    Published,
    Updated,
    Deleted,
}

impl Verb {
    /// Change applied to the site-wide quote counter.
    pub fn quote_counter_delta(self) -> i64 {
        match self {
            Verb::Published => 1,
            Verb::Deleted => -1,
            Verb::Updated => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteEvent {
    pub account_id: i64,
    pub verb: Verb,
    pub quote_id: Option<i64>,
    pub timestamp: OffsetDateTime,
}

pub trait EventSink: Send + Sync {
    fn record(&self, event: &QuoteEvent) -> Result<()>;
}

/// Hands an event to the sink without letting a failure reach the caller.
pub fn emit(sink: &dyn EventSink, event: QuoteEvent) {
    if let Err(err) = sink.record(&event) {
        tracing::warn!(
            ?err,
            verb = %event.verb,
            account_id = event.account_id,
            quote_id = ?event.quote_id,
            "failed to record quote event"
        );
    }
}

/// Persists events next to the quotes and keeps the site counters current.
#[derive(Clone)]
pub struct SqliteEventLog {
    storage: StorageHandle,
}

impl SqliteEventLog {
    pub fn new(storage: StorageHandle) -> Self {
        Self { storage }
    }
}

impl EventSink for SqliteEventLog {
    fn record(&self, event: &QuoteEvent) -> Result<()> {
        self.storage.record_event(event)
    }
}

#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<QuoteEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<QuoteEvent> {
        self.events.lock().clone()
    }

    pub fn verbs(&self) -> Vec<Verb> {
        self.events.lock().iter().map(|event| event.verb).collect()
    }
}

impl EventSink for RecordingSink {
    fn record(&self, event: &QuoteEvent) -> Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}
