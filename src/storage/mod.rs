use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::config::DbConfig;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, Transaction, TransactionBehavior};
use strum::{AsRefStr, Display, EnumString};
use time::OffsetDateTime;

use crate::config::{ConfigPaths, StorageOptions};
use crate::events::{QuoteEvent, SITE_QUOTE_COUNTER};
use crate::quotes::{Account, AccountId, Quote, QuoteId};

pub(crate) mod rows;
mod schema;

pub(crate) const LIST_DELIMITER: &str = "|:|";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_ACCOUNT_NAME_LENGTH: usize = 20;

static ACCOUNT_NAME_INVALID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\w'\[\]{}\\| -]").expect("valid account name pattern"));

pub fn to_micros(value: OffsetDateTime) -> i64 {
    (value.unix_timestamp_nanos() / 1_000) as i64
}

pub fn from_micros(micros: i64) -> std::result::Result<OffsetDateTime, time::error::ComponentRange> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(micros) * 1_000)
}

/// Converts a row count or offset for binding as a SQLite integer.
fn sql_integer(value: usize, what: &str) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("{what} {value} does not fit a SQLite integer"))
}

/// Current UTC time at the microsecond precision the database keeps.
pub fn timestamp_now() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    from_micros(to_micros(now)).unwrap_or(now)
}

/// Timestamp columns a listing can be sorted and paged on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum TimestampField {
    Submitted,
    Modified,
    Built,
}

impl TimestampField {
    fn column(self) -> &'static str {
        match self {
            TimestampField::Submitted => "q.submitted",
            TimestampField::Modified => "q.modified",
            TimestampField::Built => "q.built",
        }
    }

    pub fn value_of(self, quote: &Quote) -> Option<OffsetDateTime> {
        match self {
            TimestampField::Submitted => Some(quote.submitted),
            TimestampField::Modified => quote.modified,
            TimestampField::Built => Some(quote.built),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimestampQuery {
    pub field: TimestampField,
    pub start: Option<OffsetDateTime>,
    pub offset: usize,
    pub limit: usize,
    pub descending: bool,
    pub include_drafts: bool,
    pub owner: Option<AccountId>,
    pub label: Option<String>,
}

impl TimestampQuery {
    pub fn new(field: TimestampField, limit: usize) -> Self {
        Self {
            field,
            start: None,
            offset: 0,
            limit,
            descending: false,
            include_drafts: true,
            owner: None,
            label: None,
        }
    }
}

/// Where the page after this one begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageBoundary {
    pub start: OffsetDateTime,
    pub offset: usize,
}

#[derive(Debug, Clone)]
pub struct TimestampPage {
    pub quotes: Vec<Quote>,
    pub next: Option<PageBoundary>,
}

/// Derives the continuation point from the sort values of a fetched page.
///
/// Only a full page can continue. The next page starts at the last value
/// and skips the rows already seen with that exact value; a timestamp alone
/// cannot tell same-valued rows apart.
pub fn next_boundary(
    values: &[Option<OffsetDateTime>],
    limit: usize,
    start: Option<OffsetDateTime>,
    offset: usize,
) -> Option<PageBoundary> {
    if limit == 0 || values.len() < limit {
        return None;
    }
    let last = (*values.last()?)?;
    let trailing = values
        .iter()
        .rev()
        .take_while(|value| **value == Some(last))
        .count();
    let offset = if trailing == values.len() && start == Some(last) {
        offset.saturating_add(trailing)
    } else {
        trailing
    };
    Some(PageBoundary {
        start: last,
        offset,
    })
}

#[derive(Clone)]
pub struct StorageHandle {
    db_path: Arc<PathBuf>,
    options: Arc<StorageOptions>,
}

impl StorageHandle {
    pub fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&*self.db_path)
            .with_context(|| format!("opening database {}", self.db_path.display()))?;
        prepare_connection(&conn, &self.options)?;
        Ok(conn)
    }

    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.connect()?;
        f(&conn)
    }

    /// Runs `f` as one all-or-nothing write group.
    ///
    /// The transaction takes the write lock up front and only commits when
    /// `f` returns `Ok`; any error drops it, rolling every write back.
    pub fn transaction<F, T, E>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Transaction<'_>) -> std::result::Result<T, E>,
        E: From<anyhow::Error>,
    {
        let mut conn = self.connect()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("starting write transaction")?;
        let value = f(&tx)?;
        tx.commit().context("committing write transaction")?;
        Ok(value)
    }

    pub fn database_path(&self) -> &Path {
        &self.db_path
    }

    pub fn create_account(&self, name: &str) -> Result<Account> {
        let name = name.trim();
        validate_account_name(name)?;
        self.with_connection(|conn| {
            if rows::load_account_by_name(conn, name)?.is_some() {
                bail!("account name {name:?} is already in use");
            }
            conn.execute(
                "INSERT INTO accounts (name, quote_count, draft_count, created_at)
                 VALUES (?1, 0, 0, ?2)",
                params![name, to_micros(timestamp_now())],
            )
            .context("inserting account")?;
            let id = conn.last_insert_rowid();
            rows::load_account(conn, id)?.context("reading back new account")
        })
    }

    pub fn fetch_account(&self, account_id: AccountId) -> Result<Option<Account>> {
        self.with_connection(|conn| rows::load_account(conn, account_id))
    }

    pub fn fetch_account_by_name(&self, name: &str) -> Result<Option<Account>> {
        self.with_connection(|conn| rows::load_account_by_name(conn, name))
    }

    pub fn fetch_quote(&self, quote_id: QuoteId) -> Result<Option<Quote>> {
        self.with_connection(|conn| rows::load_quote(conn, quote_id))
    }

    pub fn query_by_timestamp(&self, query: &TimestampQuery) -> Result<TimestampPage> {
        tracing::debug!(
            field = %query.field,
            start = ?query.start,
            offset = query.offset,
            limit = query.limit,
            descending = query.descending,
            include_drafts = query.include_drafts,
            owner = ?query.owner,
            "quotes by timestamp"
        );
        let column = query.field.column();
        let direction = if query.descending { "DESC" } else { "ASC" };
        let mut clauses = vec!["q.deleted = 0".to_string()];
        let mut values: Vec<Value> = Vec::new();
        if !query.include_drafts {
            clauses.push("q.draft = 0".to_string());
        }
        if let Some(owner) = query.owner {
            values.push(Value::Integer(owner));
            clauses.push(format!("q.account_id = ?{}", values.len()));
        }
        if let Some(label) = &query.label {
            values.push(Value::Text(label.trim().to_lowercase()));
            clauses.push(format!(
                "EXISTS (SELECT 1 FROM quote_labels l WHERE l.quote_id = q.id AND l.label = ?{})",
                values.len()
            ));
        }
        if let Some(start) = query.start {
            let op = if query.descending { "<=" } else { ">=" };
            values.push(Value::Integer(to_micros(start)));
            clauses.push(format!("{column} {op} ?{}", values.len()));
        }
        values.push(Value::Integer(sql_integer(query.limit, "limit")?));
        let limit_param = values.len();
        values.push(Value::Integer(sql_integer(query.offset, "offset")?));
        let offset_param = values.len();

        let sql = format!(
            "{select}
             WHERE {filters}
             ORDER BY {column} {direction}, q.id {direction}
             LIMIT ?{limit_param} OFFSET ?{offset_param}",
            select = rows::QUOTE_SELECT,
            filters = clauses.join(" AND "),
        );
        let quotes = self.with_connection(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let quotes = stmt
                .query_map(params_from_iter(values.iter()), rows::quote_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .context("querying quotes by timestamp")?;
            Ok(quotes)
        })?;
        tracing::debug!(count = quotes.len(), "fetched timestamp page");

        let sort_values: Vec<Option<OffsetDateTime>> = quotes
            .iter()
            .map(|quote| query.field.value_of(quote))
            .collect();
        let next = next_boundary(&sort_values, query.limit, query.start, query.offset);
        Ok(TimestampPage { quotes, next })
    }

    pub fn fetch_draft_quotes(
        &self,
        account_id: AccountId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Quote>> {
        let (limit, offset) = (sql_integer(limit, "limit")?, sql_integer(offset, "offset")?);
        self.with_connection(|conn| {
            let sql = format!(
                "{select}
                 WHERE q.account_id = ?1
                   AND q.draft = 1
                   AND q.deleted = 0
                 ORDER BY q.submitted DESC, q.id DESC
                 LIMIT ?2 OFFSET ?3",
                select = rows::QUOTE_SELECT
            );
            let mut stmt = conn.prepare(&sql)?;
            let quotes = stmt
                .query_map(
                    params![account_id, limit, offset],
                    rows::quote_from_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()
                .context("querying draft quotes")?;
            Ok(quotes)
        })
    }

    pub fn search_quotes(&self, query: &str, offset: usize, limit: usize) -> Result<Vec<Quote>> {
        let Some(match_expr) = build_match_expression(query) else {
            return Ok(Vec::new());
        };
        tracing::info!(%match_expr, offset, limit, "quote search");
        let (limit, offset) = (sql_integer(limit, "limit")?, sql_integer(offset, "offset")?);
        self.with_connection(|conn| {
            let sql = format!(
                "{select}
                 INNER JOIN fts_quotes ON fts_quotes.rowid = q.id
                 WHERE fts_quotes MATCH ?1
                   AND q.draft = 0
                   AND q.deleted = 0
                 ORDER BY bm25(fts_quotes), q.submitted DESC
                 LIMIT ?2 OFFSET ?3",
                select = rows::QUOTE_SELECT
            );
            let mut stmt = conn.prepare(&sql)?;
            let quotes = stmt
                .query_map(
                    params![match_expr, limit, offset],
                    rows::quote_from_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()
                .context("querying search results")?;
            Ok(quotes)
        })
    }

    /// Live quotes sharing at least one signature, most shared first.
    pub fn find_by_signatures(
        &self,
        signatures: &[String],
        exclude: &[QuoteId],
        limit: usize,
    ) -> Result<Vec<(Quote, usize)>> {
        if signatures.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let mut values: Vec<Value> = signatures
            .iter()
            .map(|signature| Value::Text(signature.clone()))
            .collect();
        let signature_slots = placeholders(1, signatures.len());
        let mut sql = format!(
            "SELECT s.quote_id, COUNT(*) AS shared
             FROM quote_signatures s
             INNER JOIN quotes q ON q.id = s.quote_id
             WHERE q.deleted = 0
               AND s.signature IN ({signature_slots})"
        );
        if !exclude.is_empty() {
            let slots = placeholders(values.len() + 1, exclude.len());
            values.extend(exclude.iter().map(|id| Value::Integer(*id)));
            sql.push_str(&format!(" AND q.id NOT IN ({slots})"));
        }
        values.push(Value::Integer(sql_integer(limit, "limit")?));
        sql.push_str(&format!(
            " GROUP BY s.quote_id
              ORDER BY shared DESC, s.quote_id DESC
              LIMIT ?{}",
            values.len()
        ));

        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let hits = stmt
                .query_map(params_from_iter(values.iter()), |row| {
                    Ok((row.get::<_, QuoteId>(0)?, row.get::<_, i64>(1)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()
                .context("querying shared signatures")?;
            let mut matches = Vec::with_capacity(hits.len());
            for (id, shared) in hits {
                if let Some(quote) = rows::load_quote(conn, id)? {
                    matches.push((quote, shared.max(0) as usize));
                }
            }
            Ok(matches)
        })
    }

    pub fn record_event(&self, event: &QuoteEvent) -> Result<()> {
        let delta = event.verb.quote_counter_delta();
        self.transaction(|tx| -> Result<()> {
            tx.execute(
                "INSERT INTO events (account_id, verb, quote_id, recorded_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    event.account_id,
                    event.verb.as_ref(),
                    event.quote_id,
                    to_micros(event.timestamp)
                ],
            )
            .context("inserting event")?;
            if delta != 0 {
                tx.execute(
                    "INSERT INTO site_counters (name, value) VALUES (?1, ?2)
                     ON CONFLICT(name) DO UPDATE SET value = value + excluded.value",
                    params![SITE_QUOTE_COUNTER, delta],
                )
                .context("updating site counter")?;
            }
            Ok(())
        })
    }

    pub fn site_counter(&self, name: &str) -> Result<i64> {
        self.with_connection(|conn| {
            let value = conn
                .query_row(
                    "SELECT COALESCE((SELECT value FROM site_counters WHERE name = ?1), 0)",
                    params![name],
                    |row| row.get(0),
                )
                .context("reading site counter")?;
            Ok(value)
        })
    }

    pub fn count_events(&self, verb: &str) -> Result<i64> {
        self.with_connection(|conn| {
            let count = conn
                .query_row(
                    "SELECT COUNT(*) FROM events WHERE verb = ?1",
                    params![verb],
                    |row| row.get(0),
                )
                .context("counting events")?;
            Ok(count)
        })
    }
}

/// True when the failure came from another writer holding the database.
pub fn is_contention(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(failure, _))
                if matches!(failure.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        )
    })
}

fn validate_account_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("account name cannot be empty");
    }
    if ACCOUNT_NAME_INVALID.is_match(name) {
        bail!(
            "an account name may only contain letters, numerals, apostrophes, spaces, \
             and other characters acceptable in IRC nicks"
        );
    }
    if !name.chars().any(char::is_alphabetic) {
        bail!("an account name must contain at least one letter");
    }
    if name.chars().count() > MAX_ACCOUNT_NAME_LENGTH {
        bail!("an account name may only be at most {MAX_ACCOUNT_NAME_LENGTH} characters in length");
    }
    Ok(())
}

fn placeholders(first: usize, count: usize) -> String {
    (first..first + count)
        .map(|index| format!("?{index}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn build_match_expression(query: &str) -> Option<String> {
    let parts: Vec<String> = query
        .split_whitespace()
        .filter_map(|raw| {
            let term: String = raw
                .chars()
                .filter(|ch| ch.is_alphanumeric() || matches!(ch, '-' | '_'))
                .collect();
            if term.is_empty() {
                None
            } else {
                Some(format!("\"{term}\"*"))
            }
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" AND "))
    }
}

pub fn init(paths: &ConfigPaths, storage: &StorageOptions) -> Result<StorageHandle> {
    let db_path = &paths.database_path;
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating data directory {}", parent.display()))?;
    }
    let conn = Connection::open(db_path)
        .with_context(|| format!("opening database {}", db_path.display()))?;
    prepare_connection(&conn, storage)?;
    schema::apply(&conn)?;
    tracing::debug!(path = %db_path.display(), "storage ready");
    Ok(StorageHandle {
        db_path: Arc::new(db_path.clone()),
        options: Arc::new(storage.clone()),
    })
}

fn prepare_connection(conn: &Connection, storage: &StorageOptions) -> Result<()> {
    conn.set_db_config(DbConfig::SQLITE_DBCONFIG_ENABLE_FKEY, true)
        .context("enabling foreign keys")?;
    conn.busy_timeout(BUSY_TIMEOUT)
        .context("setting busy timeout")?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .context("setting journal_mode=WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("setting synchronous=NORMAL")?;
    conn.pragma_update(
        None,
        "wal_autocheckpoint",
        storage.wal_autocheckpoint.to_string(),
    )
    .context("setting wal_autocheckpoint")?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{ConfigPaths, StorageOptions};
    use tempfile::TempDir;
    use time::macros::datetime;

    pub(crate) fn temp_paths(root: &TempDir) -> ConfigPaths {
        let base = root.path();
        let data_dir = base.join("data");
        ConfigPaths {
            config_file: base.join("config").join("config.toml"),
            database_path: data_dir.join("quotes.db"),
            data_dir,
        }
    }

    pub(crate) fn init_storage() -> anyhow::Result<(TempDir, StorageHandle)> {
        let temp = TempDir::new()?;
        let paths = temp_paths(&temp);
        paths.ensure_directories()?;
        let mut opts = StorageOptions::default();
        opts.database_path = paths.database_path.clone();
        let storage = init(&paths, &opts)?;
        Ok((temp, storage))
    }

    #[test]
    fn micros_round_trip() -> anyhow::Result<()> {
        let value = datetime!(2008-04-19 14:02:56.123456 UTC);
        assert_eq!(from_micros(to_micros(value))?, value);
        let now = timestamp_now();
        assert_eq!(from_micros(to_micros(now))?, now);
        Ok(())
    }

    #[test]
    fn full_page_of_ties_skips_all_of_them() {
        let t = Some(datetime!(2024-05-01 12:00 UTC));
        let boundary = next_boundary(&[t, t, t], 3, None, 0).expect("boundary");
        assert_eq!(boundary.start, t.unwrap());
        assert_eq!(boundary.offset, 3);
    }

    #[test]
    fn ties_continuing_from_the_cursor_accumulate() {
        let t = Some(datetime!(2024-05-01 12:00 UTC));
        let boundary = next_boundary(&[t, t, t], 3, t, 3).expect("boundary");
        assert_eq!(boundary.offset, 6);
    }

    #[test]
    fn accumulated_tie_offset_saturates() {
        let t = Some(datetime!(2024-05-01 12:00 UTC));
        let boundary = next_boundary(&[t, t], 2, t, usize::MAX - 1).expect("boundary");
        assert_eq!(boundary.offset, usize::MAX);
    }

    #[test]
    fn offsets_beyond_sqlite_integers_are_errors() -> anyhow::Result<()> {
        let (_temp, storage) = init_storage()?;
        assert!(storage.fetch_draft_quotes(1, usize::MAX, 10).is_err());
        assert!(storage.search_quotes("stapler", usize::MAX, 10).is_err());
        let query = TimestampQuery {
            offset: usize::MAX,
            ..TimestampQuery::new(TimestampField::Submitted, 10)
        };
        assert!(storage.query_by_timestamp(&query).is_err());
        assert_eq!(sql_integer(7, "offset")?, 7);
        Ok(())
    }

    #[test]
    fn only_trailing_ties_count() {
        let a = Some(datetime!(2024-05-01 12:00 UTC));
        let b = Some(datetime!(2024-05-01 11:00 UTC));
        let boundary = next_boundary(&[a, b, b], 3, a, 2).expect("boundary");
        assert_eq!(boundary.start, b.unwrap());
        assert_eq!(boundary.offset, 2);
        let boundary = next_boundary(&[a, a, b], 3, None, 0).expect("boundary");
        assert_eq!(boundary.offset, 1);
    }

    #[test]
    fn short_page_has_no_boundary() {
        let a = Some(datetime!(2024-05-01 12:00 UTC));
        assert_eq!(next_boundary(&[a, a], 3, None, 0), None);
        assert_eq!(next_boundary(&[], 0, None, 0), None);
        assert_eq!(next_boundary(&[None], 1, None, 0), None);
    }

    #[test]
    fn account_names_are_validated() -> anyhow::Result<()> {
        let (_temp, storage) = init_storage()?;
        let account = storage.create_account("  Logan ")?;
        assert_eq!(account.name, "Logan");
        assert_eq!(account.quote_count, 0);
        assert!(storage.create_account("logan").is_err());
        assert!(storage.create_account("12345").is_err());
        assert!(storage.create_account("bad$name").is_err());
        assert!(storage.create_account("").is_err());
        assert!(storage.create_account("a_very_long_name_indeed").is_err());
        assert!(storage.fetch_account_by_name("LOGAN")?.is_some());
        Ok(())
    }

    #[test]
    fn events_maintain_the_site_counter() -> anyhow::Result<()> {
        use crate::events::Verb;
        let (_temp, storage) = init_storage()?;
        let event = |verb| QuoteEvent {
            account_id: 1,
            verb,
            quote_id: Some(1),
            timestamp: timestamp_now(),
        };
        storage.record_event(&event(Verb::Published))?;
        storage.record_event(&event(Verb::Published))?;
        storage.record_event(&event(Verb::Updated))?;
        storage.record_event(&event(Verb::Deleted))?;
        assert_eq!(storage.site_counter(SITE_QUOTE_COUNTER)?, 1);
        assert_eq!(storage.count_events("published")?, 2);
        Ok(())
    }

    #[test]
    fn match_expression_quotes_terms() {
        assert_eq!(
            build_match_expression("server on-fire!"),
            Some("\"server\"* AND \"on-fire\"*".to_string())
        );
        assert_eq!(build_match_expression("  ?? "), None);
    }
}
