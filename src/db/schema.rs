//! Archive schema and migrations
//!
//! Existing archives are never migrated by the index; these migrations only
//! bootstrap new archives (and test fixtures) with the layout the message
//! store writes.

use rusqlite::Connection;

use crate::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Initialize the archive schema
///
/// # Errors
///
/// Returns error if migration fails
pub fn init(conn: &Connection) -> Result<()> {
    let version: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .unwrap_or(0);

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- Archive metadata (single row)
        CREATE TABLE IF NOT EXISTS meta (
            name TEXT,
            platform TEXT,
            chat_type TEXT,
            imported_at INTEGER
        );

        -- Member directory
        CREATE TABLE IF NOT EXISTS member (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            platform_id TEXT NOT NULL UNIQUE,
            account_name TEXT,
            group_nickname TEXT,
            aliases TEXT DEFAULT '[]',
            avatar TEXT
        );

        -- Messages
        CREATE TABLE IF NOT EXISTS message (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sender_id INTEGER NOT NULL REFERENCES member(id),
            ts INTEGER NOT NULL,
            type INTEGER NOT NULL DEFAULT 0,
            content TEXT,
            platform_message_id TEXT,
            reply_to_message_id TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_message_ts ON message(ts, id);
        CREATE INDEX IF NOT EXISTS idx_message_sender ON message(sender_id);
        CREATE INDEX IF NOT EXISTS idx_message_platform_id ON message(platform_message_id);

        PRAGMA user_version = 1;
        ",
    )?;

    tracing::info!("migrated to schema v1");
    Ok(())
}

fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- Session index
        CREATE TABLE IF NOT EXISTS chat_session (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            start_ts INTEGER NOT NULL,
            end_ts INTEGER NOT NULL,
            message_count INTEGER NOT NULL DEFAULT 0,
            is_manual INTEGER NOT NULL DEFAULT 0,
            summary TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_chat_session_time ON chat_session(start_ts, end_ts);

        -- Message to session assignment (topic_id reserved)
        CREATE TABLE IF NOT EXISTS message_context (
            message_id INTEGER PRIMARY KEY REFERENCES message(id),
            session_id INTEGER NOT NULL REFERENCES chat_session(id),
            topic_id INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_message_context_session ON message_context(session_id);

        -- Per-archive gap threshold (NULL = global default)
        ALTER TABLE meta ADD COLUMN session_gap_threshold INTEGER;

        PRAGMA user_version = 2;
        ",
    )?;

    tracing::info!("migrated to schema v2 (session index)");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        let count: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                [name],
                |row| row.get(0),
            )
            .unwrap();
        count == 1
    }

    #[test]
    fn test_schema_init() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();

        for table in ["meta", "member", "message", "chat_session", "message_context"] {
            assert!(table_exists(&conn, table), "missing table {table}");
        }

        let version: i32 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_schema_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();
        init(&conn).unwrap(); // Should not fail
    }

    #[test]
    fn test_gap_threshold_column_added() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();

        conn.execute("INSERT INTO meta (name) VALUES ('group')", [])
            .unwrap();
        let threshold: Option<i64> = conn
            .query_row("SELECT session_gap_threshold FROM meta", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert!(threshold.is_none());
    }
}
