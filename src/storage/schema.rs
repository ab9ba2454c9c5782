use anyhow::{Context, Result};
use rusqlite::Connection;

pub fn apply(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA foreign_keys = ON;
        CREATE TABLE IF NOT EXISTS accounts (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE COLLATE NOCASE,
            quote_count INTEGER NOT NULL DEFAULT 0,
            draft_count INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS quotes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id INTEGER NOT NULL,
            dialog_source TEXT NOT NULL,
            formatting TEXT NOT NULL DEFAULT '[]',
            preserve_formatting INTEGER NOT NULL DEFAULT 0,
            note TEXT,
            draft INTEGER NOT NULL DEFAULT 1,
            deleted INTEGER NOT NULL DEFAULT 0,
            clone_of INTEGER,
            submitted INTEGER NOT NULL,
            modified INTEGER,
            built INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (account_id) REFERENCES accounts(id),
            FOREIGN KEY (clone_of) REFERENCES quotes(id) ON DELETE SET NULL
        );

        CREATE INDEX IF NOT EXISTS quotes_by_submitted
            ON quotes (deleted, draft, submitted, id);
        CREATE INDEX IF NOT EXISTS quotes_by_account
            ON quotes (account_id, draft, submitted);
        CREATE INDEX IF NOT EXISTS quotes_by_built
            ON quotes (deleted, built, id);

        CREATE TABLE IF NOT EXISTS quote_labels (
            quote_id INTEGER NOT NULL,
            label TEXT NOT NULL,
            PRIMARY KEY (quote_id, label),
            FOREIGN KEY (quote_id) REFERENCES quotes(id) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS quote_labels_by_label ON quote_labels (label);

        CREATE TABLE IF NOT EXISTS quote_signatures (
            quote_id INTEGER NOT NULL,
            signature TEXT NOT NULL,
            PRIMARY KEY (quote_id, signature),
            FOREIGN KEY (quote_id) REFERENCES quotes(id) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS quote_signatures_by_signature
            ON quote_signatures (signature);

        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY,
            account_id INTEGER NOT NULL,
            verb TEXT NOT NULL,
            quote_id INTEGER,
            recorded_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS site_counters (
            name TEXT PRIMARY KEY,
            value INTEGER NOT NULL DEFAULT 0
        );

        CREATE VIRTUAL TABLE IF NOT EXISTS fts_quotes USING fts5(
            dialog_source,
            note,
            content='quotes',
            content_rowid='id',
            tokenize='unicode61'
        );

        CREATE TRIGGER IF NOT EXISTS quotes_ai AFTER INSERT ON quotes BEGIN
            INSERT INTO fts_quotes(rowid, dialog_source, note)
            VALUES (new.id, new.dialog_source, COALESCE(new.note, ''));
        END;

        CREATE TRIGGER IF NOT EXISTS quotes_ad AFTER DELETE ON quotes BEGIN
            INSERT INTO fts_quotes(fts_quotes, rowid, dialog_source, note)
            VALUES ('delete', old.id, old.dialog_source, COALESCE(old.note, ''));
        END;

        CREATE TRIGGER IF NOT EXISTS quotes_au AFTER UPDATE OF dialog_source, note ON quotes BEGIN
            INSERT INTO fts_quotes(fts_quotes, rowid, dialog_source, note)
            VALUES ('delete', old.id, old.dialog_source, COALESCE(old.note, ''));
            INSERT INTO fts_quotes(rowid, dialog_source, note)
            VALUES (new.id, new.dialog_source, COALESCE(new.note, ''));
        END;
        "#,
    )
    .context("applying schema migrations")?;
    Ok(())
}
