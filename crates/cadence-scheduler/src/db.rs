use std::path::Path;
use std::time::Duration;

use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `jobs`, `locks` and `periodic_runs` tables (idempotent). The
/// claim index matches `claim_next`'s `ORDER BY priority DESC, id ASC`.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id          INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
            type        TEXT    NOT NULL,
            name        TEXT    NOT NULL,
            action      TEXT    NOT NULL,
            parameters  TEXT    NOT NULL DEFAULT '[]',  -- JSON array
            priority    INTEGER NOT NULL DEFAULT 0,
            status      TEXT    NOT NULL DEFAULT 'new',
            created_at  TEXT    NOT NULL,
            updated_at  TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs (status, priority DESC, id);

        -- One lease per lock name; a row past expires_at is free to take.
        CREATE TABLE IF NOT EXISTS locks (
            name        TEXT    NOT NULL PRIMARY KEY,
            token       TEXT    NOT NULL,
            expires_at  INTEGER NOT NULL    -- unix millis
        ) STRICT;

        -- A periodic task enqueued for a due minute; blocks re-enqueue.
        CREATE TABLE IF NOT EXISTS periodic_runs (
            task_key    TEXT    NOT NULL,
            slot        TEXT    NOT NULL,
            created_at  TEXT    NOT NULL,
            PRIMARY KEY (task_key, slot)
        ) STRICT;
        ",
    )?;
    Ok(())
}

/// Open a connection configured for several processes sharing one file.
pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    Ok(conn)
}

/// Cheap reachability probe.
pub fn ping(conn: &Connection) -> Result<()> {
    conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
    Ok(())
}
