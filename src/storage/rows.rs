//! Row-level reads and writes shared by the lifecycle transactions.
//!
//! Everything here takes a plain `&Connection` so it can run either on a
//! fresh connection or inside a `Transaction` (which derefs to one).

use std::collections::BTreeSet;

use anyhow::{bail, Context, Result};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use time::OffsetDateTime;

use super::{from_micros, to_micros, LIST_DELIMITER};
use crate::dialog::Line;
use crate::quotes::{Account, AccountId, Quote, QuoteId};

pub(crate) const QUOTE_SELECT: &str = "SELECT q.id,
        q.account_id,
        q.dialog_source,
        q.formatting,
        q.preserve_formatting,
        q.note,
        q.draft,
        q.deleted,
        q.clone_of,
        q.submitted,
        q.modified,
        q.built,
        COALESCE((
            SELECT GROUP_CONCAT(l.label, '|:|')
            FROM quote_labels l
            WHERE l.quote_id = q.id
        ), '') AS labels,
        COALESCE((
            SELECT GROUP_CONCAT(s.signature, '|:|')
            FROM quote_signatures s
            WHERE s.quote_id = q.id
        ), '') AS signatures
 FROM quotes q";

fn conversion_error<E>(index: usize, kind: Type, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(index, kind, Box::new(err))
}

fn timestamp_column(row: &Row<'_>, index: usize) -> rusqlite::Result<OffsetDateTime> {
    let micros: i64 = row.get(index)?;
    from_micros(micros).map_err(|err| conversion_error(index, Type::Integer, err))
}

fn optional_timestamp_column(
    row: &Row<'_>,
    index: usize,
) -> rusqlite::Result<Option<OffsetDateTime>> {
    match row.get::<_, Option<i64>>(index)? {
        Some(micros) => from_micros(micros)
            .map(Some)
            .map_err(|err| conversion_error(index, Type::Integer, err)),
        None => Ok(None),
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = String> + '_ {
    raw.split(LIST_DELIMITER)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
}

pub(crate) fn quote_from_row(row: &Row<'_>) -> rusqlite::Result<Quote> {
    let formatting: String = row.get(3)?;
    let lines: Vec<Line> = serde_json::from_str(&formatting)
        .map_err(|err| conversion_error(3, Type::Text, err))?;
    let labels_raw: String = row.get(12)?;
    let mut labels: Vec<String> = split_list(&labels_raw).collect();
    labels.sort();
    let signatures_raw: String = row.get(13)?;
    let signatures: BTreeSet<String> = split_list(&signatures_raw).collect();
    Ok(Quote {
        id: row.get(0)?,
        account_id: row.get(1)?,
        dialog_source: row.get(2)?,
        lines,
        preserve_formatting: row.get::<_, i64>(4)? != 0,
        note: row.get(5)?,
        draft: row.get::<_, i64>(6)? != 0,
        deleted: row.get::<_, i64>(7)? != 0,
        clone_of: row.get(8)?,
        submitted: timestamp_column(row, 9)?,
        modified: optional_timestamp_column(row, 10)?,
        built: timestamp_column(row, 11)?,
        labels,
        signatures,
    })
}

pub(crate) fn load_quote(conn: &Connection, quote_id: QuoteId) -> Result<Option<Quote>> {
    let sql = format!("{QUOTE_SELECT} WHERE q.id = ?1");
    conn.query_row(&sql, params![quote_id], quote_from_row)
        .optional()
        .with_context(|| format!("loading quote {quote_id}"))
}

fn encode_lines(quote: &Quote) -> Result<String> {
    serde_json::to_string(&quote.lines)
        .with_context(|| format!("serialising parsed lines of quote {}", quote.id))
}

pub(crate) fn insert_quote(conn: &Connection, quote: &Quote) -> Result<QuoteId> {
    conn.execute(
        "INSERT INTO quotes (account_id, dialog_source, formatting, preserve_formatting, note,
                             draft, deleted, clone_of, submitted, modified, built)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            quote.account_id,
            quote.dialog_source,
            encode_lines(quote)?,
            quote.preserve_formatting,
            quote.note,
            quote.draft,
            quote.deleted,
            quote.clone_of,
            to_micros(quote.submitted),
            quote.modified.map(to_micros),
            to_micros(quote.built),
        ],
    )
    .context("inserting quote")?;
    let id = conn.last_insert_rowid();
    replace_labels(conn, id, &quote.labels)?;
    replace_signatures(conn, id, &quote.signatures)?;
    Ok(id)
}

/// Writes the derived and editable content of a quote, not its state bits.
pub(crate) fn write_content(conn: &Connection, quote: &Quote) -> Result<()> {
    let updated = conn
        .execute(
            "UPDATE quotes
             SET dialog_source = ?1,
                 formatting = ?2,
                 preserve_formatting = ?3,
                 note = ?4,
                 built = ?5
             WHERE id = ?6",
            params![
                quote.dialog_source,
                encode_lines(quote)?,
                quote.preserve_formatting,
                quote.note,
                to_micros(quote.built),
                quote.id,
            ],
        )
        .with_context(|| format!("writing content of quote {}", quote.id))?;
    if updated == 0 {
        bail!("quote {} not found", quote.id);
    }
    replace_labels(conn, quote.id, &quote.labels)?;
    replace_signatures(conn, quote.id, &quote.signatures)?;
    Ok(())
}

fn replace_labels(conn: &Connection, quote_id: QuoteId, labels: &[String]) -> Result<()> {
    conn.execute(
        "DELETE FROM quote_labels WHERE quote_id = ?1",
        params![quote_id],
    )
    .context("clearing quote labels")?;
    let mut stmt =
        conn.prepare("INSERT OR IGNORE INTO quote_labels (quote_id, label) VALUES (?1, ?2)")?;
    for label in labels {
        stmt.execute(params![quote_id, label])
            .context("inserting quote label")?;
    }
    Ok(())
}

fn replace_signatures(
    conn: &Connection,
    quote_id: QuoteId,
    signatures: &BTreeSet<String>,
) -> Result<()> {
    conn.execute(
        "DELETE FROM quote_signatures WHERE quote_id = ?1",
        params![quote_id],
    )
    .context("clearing quote signatures")?;
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO quote_signatures (quote_id, signature) VALUES (?1, ?2)",
    )?;
    for signature in signatures {
        stmt.execute(params![quote_id, signature])
            .context("inserting quote signature")?;
    }
    Ok(())
}

pub(crate) fn set_published(
    conn: &Connection,
    quote_id: QuoteId,
    modified: OffsetDateTime,
) -> Result<()> {
    let updated = conn
        .execute(
            "UPDATE quotes SET draft = 0, modified = ?1 WHERE id = ?2",
            params![to_micros(modified), quote_id],
        )
        .context("publishing quote")?;
    if updated == 0 {
        bail!("quote {quote_id} not found");
    }
    Ok(())
}

pub(crate) fn set_clone_of(
    conn: &Connection,
    quote_id: QuoteId,
    clone_of: Option<QuoteId>,
) -> Result<()> {
    conn.execute(
        "UPDATE quotes SET clone_of = ?1 WHERE id = ?2",
        params![clone_of, quote_id],
    )
    .context("linking edit draft")?;
    Ok(())
}

pub(crate) fn mark_deleted(conn: &Connection, quote_id: QuoteId) -> Result<()> {
    let updated = conn
        .execute(
            "UPDATE quotes SET deleted = 1 WHERE id = ?1 AND deleted = 0",
            params![quote_id],
        )
        .context("soft-deleting quote")?;
    if updated == 0 {
        bail!("quote {quote_id} not found");
    }
    Ok(())
}

pub(crate) fn delete_quote(conn: &Connection, quote_id: QuoteId) -> Result<()> {
    conn.execute("DELETE FROM quotes WHERE id = ?1", params![quote_id])
        .with_context(|| format!("deleting quote {quote_id}"))?;
    Ok(())
}

/// The published quote whose pending edit is `draft_id`, if any.
pub(crate) fn find_clone_parent(conn: &Connection, draft_id: QuoteId) -> Result<Option<QuoteId>> {
    conn.query_row(
        "SELECT id FROM quotes WHERE clone_of = ?1 AND deleted = 0 LIMIT 1",
        params![draft_id],
        |row| row.get(0),
    )
    .optional()
    .context("looking up edit parent")
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        name: row.get(1)?,
        quote_count: row.get(2)?,
        draft_count: row.get(3)?,
        created_at: timestamp_column(row, 4)?,
    })
}

pub(crate) fn load_account(conn: &Connection, account_id: AccountId) -> Result<Option<Account>> {
    conn.query_row(
        "SELECT id, name, quote_count, draft_count, created_at FROM accounts WHERE id = ?1",
        params![account_id],
        account_from_row,
    )
    .optional()
    .with_context(|| format!("loading account {account_id}"))
}

pub(crate) fn load_account_by_name(conn: &Connection, name: &str) -> Result<Option<Account>> {
    conn.query_row(
        "SELECT id, name, quote_count, draft_count, created_at FROM accounts WHERE name = ?1",
        params![name.trim()],
        account_from_row,
    )
    .optional()
    .with_context(|| format!("loading account {name:?}"))
}

pub(crate) fn adjust_account_counters(
    conn: &Connection,
    account_id: AccountId,
    quote_delta: i64,
    draft_delta: i64,
) -> Result<()> {
    let updated = conn
        .execute(
            "UPDATE accounts
             SET quote_count = quote_count + ?1,
                 draft_count = draft_count + ?2
             WHERE id = ?3",
            params![quote_delta, draft_delta, account_id],
        )
        .context("updating account counters")?;
    if updated == 0 {
        bail!("account {account_id} not found");
    }
    Ok(())
}
