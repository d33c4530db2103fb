use rusqlite::Connection;

use crate::error::Result;

/// Initialise the dispatch schema in `conn`.
///
/// Creates `campaigns` and `mail_logs` (idempotent). The composite index on
/// `(processing, outcome, send_date)` keeps the per-tick due scan cheap.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS campaigns (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id       INTEGER NOT NULL,
            name          TEXT    NOT NULL,
            status        TEXT    NOT NULL DEFAULT 'created',
            launch_date   TEXT    NOT NULL,   -- RFC 3339
            send_by_date  TEXT,               -- RFC 3339 or NULL
            created_at    TEXT    NOT NULL
        );

        CREATE TABLE IF NOT EXISTS mail_logs (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            campaign_id   INTEGER NOT NULL REFERENCES campaigns(id),
            user_id       INTEGER NOT NULL,
            recipient     TEXT    NOT NULL,
            send_date     TEXT    NOT NULL,   -- RFC 3339, UTC
            send_attempt  INTEGER NOT NULL DEFAULT 0,
            processing    INTEGER NOT NULL DEFAULT 0,
            outcome       TEXT    NOT NULL DEFAULT 'pending',
            error         TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_mail_logs_due
            ON mail_logs (processing, outcome, send_date);
        CREATE INDEX IF NOT EXISTS idx_mail_logs_campaign
            ON mail_logs (campaign_id);
        ",
    )?;
    Ok(())
}
