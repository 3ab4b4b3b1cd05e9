use rusqlite::Connection;

use crate::error::Result;

pub const SCHEMA_VERSION: i64 = 1;

pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS labeled_days (
            id             TEXT PRIMARY KEY,
            user_id        TEXT NOT NULL,
            day            TEXT NOT NULL,
            width          INTEGER NOT NULL,
            features       TEXT NOT NULL,
            outcome        INTEGER NOT NULL,
            predicted_risk REAL,
            created_at     INTEGER NOT NULL,
            UNIQUE(user_id, day)
        );

        CREATE INDEX IF NOT EXISTS idx_days_user ON labeled_days(user_id, day);
        CREATE INDEX IF NOT EXISTS idx_days_created ON labeled_days(created_at);
        ",
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}
