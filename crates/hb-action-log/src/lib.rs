//! hb-action-log: durable storage for the last-applied deployment action id.
//!
//! Replaces the embedded device's NVS-backed `ADDRESS_ID` record with a
//! single-row SQLite table. Durability settings mirror a device-local
//! event journal: WAL mode, `synchronous=FULL`, and an integrity check on
//! open, so a crash mid-write can never leave the stored action id
//! corrupted without detection.

use rusqlite::{params, Connection};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ActionLogError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("integrity check failed: {0}")]
    IntegrityCheckFailed(String),
}

/// The durable record of the most recently applied (or in-flight)
/// deployment action id.
pub struct ActionLog {
    conn: Connection,
}

impl ActionLog {
    /// Open (or create) the action log at `path`.
    ///
    /// Applies durability PRAGMAs, runs `PRAGMA integrity_check`, and
    /// creates the schema if it does not exist yet. Returns `Err` if the
    /// integrity check fails.
    pub fn open(path: &Path) -> Result<Self, ActionLogError> {
        let conn = Connection::open(path)?;
        apply_pragmas(&conn)?;
        run_integrity_check(&conn)?;
        apply_schema(&conn)?;
        Ok(ActionLog { conn })
    }

    /// Open an in-memory action log, primarily for tests.
    pub fn open_in_memory() -> Result<Self, ActionLogError> {
        let conn = Connection::open_in_memory()?;
        apply_pragmas(&conn)?;
        apply_schema(&conn)?;
        Ok(ActionLog { conn })
    }

    /// Return the stored action id, or `0` if none has ever been recorded.
    pub fn get(&self) -> Result<i64, ActionLogError> {
        let action_id: i64 = self.conn.query_row(
            "SELECT action_id FROM action_log WHERE id = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(action_id)
    }

    /// Durably record `action_id` as the current action id.
    pub fn put(&mut self, action_id: i64) -> Result<(), ActionLogError> {
        self.conn.execute(
            "UPDATE action_log SET action_id = ?1 WHERE id = 0",
            params![action_id],
        )?;
        Ok(())
    }
}

fn apply_pragmas(conn: &Connection) -> Result<(), ActionLogError> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=FULL;
         PRAGMA wal_autocheckpoint=1000;",
    )?;
    Ok(())
}

fn run_integrity_check(conn: &Connection) -> Result<(), ActionLogError> {
    let result: String = conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
    if result != "ok" {
        return Err(ActionLogError::IntegrityCheckFailed(result));
    }
    Ok(())
}

fn apply_schema(conn: &Connection) -> Result<(), ActionLogError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS action_log (
             id INTEGER PRIMARY KEY CHECK (id = 0),
             action_id INTEGER NOT NULL
         );
         INSERT OR IGNORE INTO action_log (id, action_id) VALUES (0, 0);",
    )?;
    Ok(())
}
