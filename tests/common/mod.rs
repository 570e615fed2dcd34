//! Shared test utilities

#![allow(dead_code)]

use std::sync::Arc;

use chatlog_index::{Archive, Archives};
use rusqlite::params;
use tempfile::TempDir;

/// Set up a registry in a temporary data directory with one empty archive
#[must_use]
pub fn setup_archive(id: &str) -> (TempDir, Archives, Arc<Archive>) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let archives = Archives::new(dir.path());
    let archive = archives.create(id).expect("failed to create archive");
    (dir, archives, archive)
}

/// Create a member and return its id
pub fn create_member(archive: &Archive, platform_id: &str, nickname: Option<&str>) -> i64 {
    let conn = archive.writer().expect("failed to open writer");
    conn.execute(
        "INSERT INTO member (platform_id, account_name, group_nickname) VALUES (?1, ?2, ?3)",
        params![platform_id, platform_id.to_uppercase(), nickname],
    )
    .expect("failed to create member");
    conn.last_insert_rowid()
}

/// Create messages for one sender at the given timestamps, returning their ids
pub fn create_messages(archive: &Archive, sender_id: i64, messages: &[(i64, &str)]) -> Vec<i64> {
    let mut conn = archive.writer().expect("failed to open writer");
    let tx = conn.transaction().expect("failed to begin");
    let mut ids = Vec::with_capacity(messages.len());
    for (ts, content) in messages {
        tx.execute(
            "INSERT INTO message (sender_id, ts, type, content, platform_message_id)
             VALUES (?1, ?2, 0, ?3, ?4)",
            params![sender_id, ts, content, format!("pm-{ts}")],
        )
        .expect("failed to create message");
        ids.push(tx.last_insert_rowid());
    }
    tx.commit().expect("failed to commit");
    ids
}

/// Session `(start_ts, end_ts, message_count)` triples in start order
pub fn session_shape(archive: &Archive) -> Vec<(i64, i64, i64)> {
    let conn = archive.writer().expect("failed to open writer");
    let mut stmt = conn
        .prepare("SELECT start_ts, end_ts, message_count FROM chat_session ORDER BY start_ts, id")
        .expect("failed to prepare");
    stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
        .expect("failed to query")
        .collect::<Result<_, _>>()
        .expect("failed to read sessions")
}
