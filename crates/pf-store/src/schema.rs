use rusqlite::Connection;

use crate::error::Result;

pub const SCHEMA_VERSION: i64 = 2;

pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    conn.pragma_update(None, "wal_autocheckpoint", 100)?;

    // In-memory and fresh databases legitimately fail this.
    if conn
        .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
        .is_ok()
    {
        tracing::debug!("startup WAL checkpoint complete");
    }

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS runs (
            id             TEXT PRIMARY KEY,
            task           TEXT NOT NULL,
            created_at     TEXT NOT NULL DEFAULT (datetime('now')),
            initial_energy REAL NOT NULL,
            final_energy   REAL NOT NULL,
            generations    INTEGER NOT NULL,
            termination    TEXT NOT NULL,
            core_count     INTEGER NOT NULL DEFAULT 4,
            export         TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS certificate_entries (
            run_id           TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
            generation_index INTEGER NOT NULL,
            previous_energy  REAL NOT NULL,
            selected_energy  REAL NOT NULL,
            rules_applied    TEXT NOT NULL,
            alternatives     TEXT NOT NULL DEFAULT '[]',
            PRIMARY KEY (run_id, generation_index)
        );

        CREATE INDEX IF NOT EXISTS idx_runs_created ON runs(created_at);
        ",
    )?;

    // v1 databases predate the core_count column
    if conn
        .prepare("SELECT core_count FROM runs LIMIT 0")
        .is_err()
    {
        conn.execute_batch("ALTER TABLE runs ADD COLUMN core_count INTEGER NOT NULL DEFAULT 4;")?;
    }

    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> Result<Option<i64>> {
    let mut stmt = conn.prepare("SELECT value FROM metadata WHERE key = 'schema_version'")?;
    let version = stmt
        .query_row([], |row| {
            let v: String = row.get(0)?;
            Ok(v.parse::<i64>().unwrap_or(0))
        })
        .ok();
    Ok(version)
}
