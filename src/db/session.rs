//! Session index store
//!
//! Holds the persisted output of segmentation (`chat_session` and
//! `message_context`) plus the per-archive gap threshold. Reads degrade to
//! empty values when the index tables do not exist yet; writes close the
//! cached reader first and propagate failures.

use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

use super::{Archive, read_or};
use crate::{Error, Result};

/// Default gap threshold in seconds (30 minutes)
pub const DEFAULT_GAP_THRESHOLD: u32 = 1800;

/// A persisted conversation session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatSession {
    pub id: i64,
    pub start_ts: i64,
    pub end_ts: i64,
    pub message_count: usize,
    /// Reserved for manually created sessions; automatic runs write `false`
    pub is_manual: bool,
    pub summary: Option<String>,
}

/// Session entry for timeline navigation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionListItem {
    pub id: i64,
    pub start_ts: i64,
    pub end_ts: i64,
    pub message_count: usize,
    /// Chronologically first message of the session
    pub first_message_id: Option<i64>,
    pub summary: Option<String>,
}

/// Index status for an archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub session_count: usize,
    pub has_index: bool,
    pub gap_threshold: u32,
}

/// Session index repository
#[derive(Debug, Clone)]
pub struct SessionIndex {
    archive: Arc<Archive>,
    default_gap: u32,
}

impl SessionIndex {
    /// Create a new session index repository
    #[must_use]
    pub const fn new(archive: Arc<Archive>) -> Self {
        Self::with_default_gap(archive, DEFAULT_GAP_THRESHOLD)
    }

    /// Create a repository whose archives fall back to `default_gap` seconds
    #[must_use]
    pub const fn with_default_gap(archive: Arc<Archive>, default_gap: u32) -> Self {
        Self {
            archive,
            default_gap,
        }
    }

    /// Delete every session and message assignment
    ///
    /// Safe to call on an empty index.
    ///
    /// # Errors
    ///
    /// Returns error if the archive cannot be opened for writing or the index
    /// tables are missing
    pub fn clear(&self) -> Result<()> {
        let conn = self.archive.writer()?;
        clear_rows(&conn)?;
        tracing::info!(archive = %self.archive.id(), "session index cleared");
        Ok(())
    }

    /// Number of indexed sessions (zero when not yet segmented)
    #[must_use]
    pub fn session_count(&self) -> usize {
        read_or(&self.archive, "session_count", 0, |conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM chat_session", [], |row| row.get(0))
                .map_err(Error::from_sqlite)?;
            Ok(usize::try_from(count).unwrap_or(0))
        })
    }

    /// Whether at least one session has been indexed
    #[must_use]
    pub fn has_index(&self) -> bool {
        self.session_count() > 0
    }

    /// Index status summary
    #[must_use]
    pub fn stats(&self) -> IndexStats {
        let session_count = self.session_count();
        IndexStats {
            session_count,
            has_index: session_count > 0,
            gap_threshold: self.gap_threshold(),
        }
    }

    /// Per-archive gap threshold, `None` when the global default applies
    #[must_use]
    pub fn stored_gap_threshold(&self) -> Option<u32> {
        read_or(&self.archive, "gap_threshold", None, |conn| {
            let value: Option<Option<i64>> = conn
                .query_row("SELECT session_gap_threshold FROM meta LIMIT 1", [], |row| {
                    row.get(0)
                })
                .optional()
                .map_err(Error::from_sqlite)?;

            // Zero is treated as unset, matching archives written by older importers
            Ok(value
                .flatten()
                .filter(|v| *v > 0)
                .and_then(|v| u32::try_from(v).ok()))
        })
    }

    /// Effective gap threshold in seconds
    #[must_use]
    pub fn gap_threshold(&self) -> u32 {
        self.stored_gap_threshold().unwrap_or(self.default_gap)
    }

    /// Set the per-archive gap threshold; `None` restores the global default
    ///
    /// # Errors
    ///
    /// Returns error if the archive cannot be opened for writing or the meta
    /// table is missing
    pub fn set_gap_threshold(&self, threshold: Option<u32>) -> Result<()> {
        let conn = self.archive.writer()?;

        let updated = conn
            .execute("UPDATE meta SET session_gap_threshold = ?1", [threshold])
            .map_err(Error::from_sqlite)?;
        if updated == 0 {
            conn.execute(
                "INSERT INTO meta (session_gap_threshold) VALUES (?1)",
                [threshold],
            )
            .map_err(Error::from_sqlite)?;
        }

        tracing::info!(archive = %self.archive.id(), ?threshold, "gap threshold updated");
        Ok(())
    }

    /// Attach a summary to a session
    ///
    /// Returns `false` when no session has that id.
    ///
    /// # Errors
    ///
    /// Returns error if the archive cannot be opened for writing or the index
    /// tables are missing
    pub fn attach_summary(&self, session_id: i64, summary: &str) -> Result<bool> {
        let conn = self.archive.writer()?;
        let updated = conn
            .execute(
                "UPDATE chat_session SET summary = ?1 WHERE id = ?2",
                params![summary, session_id],
            )
            .map_err(Error::from_sqlite)?;

        if updated == 0 {
            tracing::warn!(archive = %self.archive.id(), session_id, "summary target not found");
        }
        Ok(updated > 0)
    }

    /// Summary of a session, `None` if absent, empty or the session is unknown
    #[must_use]
    pub fn summary(&self, session_id: i64) -> Option<String> {
        read_or(&self.archive, "summary", None, |conn| {
            let summary: Option<Option<String>> = conn
                .query_row(
                    "SELECT summary FROM chat_session WHERE id = ?1",
                    [session_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(Error::from_sqlite)?;
            Ok(summary.flatten().filter(|s| !s.is_empty()))
        })
    }

    /// Point read of one session
    #[must_use]
    pub fn session(&self, session_id: i64) -> Option<ChatSession> {
        read_or(&self.archive, "session", None, |conn| {
            load_session(conn, session_id)
        })
    }

    /// All sessions ordered by start time
    #[must_use]
    pub fn list(&self) -> Vec<SessionListItem> {
        read_or(&self.archive, "list_sessions", Vec::new(), |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT
                        cs.id,
                        cs.start_ts,
                        cs.end_ts,
                        cs.message_count,
                        cs.summary,
                        (SELECT mc.message_id FROM message_context mc
                          JOIN message m ON m.id = mc.message_id
                          WHERE mc.session_id = cs.id
                          ORDER BY m.ts ASC, m.id ASC LIMIT 1)
                     FROM chat_session cs
                     ORDER BY cs.start_ts ASC, cs.id ASC",
                )
                .map_err(Error::from_sqlite)?;

            let items = stmt
                .query_map([], |row| {
                    Ok(SessionListItem {
                        id: row.get(0)?,
                        start_ts: row.get(1)?,
                        end_ts: row.get(2)?,
                        message_count: count_from(row.get(3)?),
                        summary: row.get(4)?,
                        first_message_id: row.get(5)?,
                    })
                })
                .map_err(Error::from_sqlite)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(items)
        })
    }
}

/// Delete all index rows on an open write connection
pub(crate) fn clear_rows(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "DELETE FROM message_context;
         DELETE FROM chat_session;",
    )
    .map_err(Error::from_sqlite)
}

/// Read one session row
pub(crate) fn load_session(conn: &Connection, session_id: i64) -> Result<Option<ChatSession>> {
    conn.query_row(
        "SELECT id, start_ts, end_ts, message_count, is_manual, summary
         FROM chat_session WHERE id = ?1",
        [session_id],
        |row| {
            Ok(ChatSession {
                id: row.get(0)?,
                start_ts: row.get(1)?,
                end_ts: row.get(2)?,
                message_count: count_from(row.get(3)?),
                is_manual: row.get::<_, i64>(4)? != 0,
                summary: row.get(5)?,
            })
        },
    )
    .optional()
    .map_err(Error::from_sqlite)
}

pub(crate) fn count_from(value: i64) -> usize {
    usize::try_from(value).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::archive;

    fn insert_session(archive: &Archive, start_ts: i64, end_ts: i64, count: i64) -> i64 {
        let conn = archive.writer().unwrap();
        conn.execute(
            "INSERT INTO chat_session (start_ts, end_ts, message_count) VALUES (?1, ?2, ?3)",
            params![start_ts, end_ts, count],
        )
        .unwrap();
        conn.last_insert_rowid()
    }

    #[test]
    fn test_empty_index() {
        let (_dir, archive) = archive();
        let index = SessionIndex::new(Arc::new(archive));

        assert!(!index.has_index());
        assert!(index.list().is_empty());
        assert_eq!(
            index.stats(),
            IndexStats {
                session_count: 0,
                has_index: false,
                gap_threshold: DEFAULT_GAP_THRESHOLD,
            }
        );
    }

    #[test]
    fn test_reads_degrade_without_tables() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bare.db");
        rusqlite::Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE unrelated (x INTEGER);")
            .unwrap();

        let index = SessionIndex::new(Arc::new(Archive::new("bare", &path)));
        assert!(!index.has_index());
        assert_eq!(index.gap_threshold(), DEFAULT_GAP_THRESHOLD);
        assert!(index.summary(1).is_none());
        assert!(index.list().is_empty());

        assert!(index.clear().unwrap_err().is_schema_missing());
    }

    #[test]
    fn test_reads_degrade_without_archive() {
        let dir = tempfile::TempDir::new().unwrap();
        let index = SessionIndex::new(Arc::new(Archive::new("gone", dir.path().join("gone.db"))));

        assert!(!index.has_index());
        assert!(index.session(1).is_none());
        assert!(matches!(
            index.set_gap_threshold(Some(60)),
            Err(Error::StorageUnavailable(_))
        ));
    }

    #[test]
    fn test_gap_threshold_roundtrip() {
        let (_dir, archive) = archive();
        let index = SessionIndex::new(Arc::new(archive));

        // No meta row yet: the setter inserts one
        index.set_gap_threshold(Some(600)).unwrap();
        assert_eq!(index.stored_gap_threshold(), Some(600));
        assert_eq!(index.gap_threshold(), 600);

        index.set_gap_threshold(None).unwrap();
        assert_eq!(index.stored_gap_threshold(), None);
        assert_eq!(index.gap_threshold(), DEFAULT_GAP_THRESHOLD);
    }

    #[test]
    fn test_configured_default_gap_reported() {
        let (_dir, archive) = archive();
        let index = SessionIndex::with_default_gap(Arc::new(archive), 900);

        assert_eq!(index.stats().gap_threshold, 900);

        index.set_gap_threshold(Some(60)).unwrap();
        assert_eq!(index.stats().gap_threshold, 60);
    }

    #[test]
    fn test_summary_attach_and_read() {
        let (_dir, archive) = archive();
        let id = insert_session(&archive, 10, 20, 3);
        let index = SessionIndex::new(Arc::new(archive));

        assert!(index.summary(id).is_none());
        assert!(index.attach_summary(id, "talked about lunch").unwrap());
        assert_eq!(index.summary(id).as_deref(), Some("talked about lunch"));

        assert!(!index.attach_summary(id + 100, "nobody").unwrap());
        assert!(index.summary(id + 100).is_none());
    }

    #[test]
    fn test_clear_removes_everything() {
        let (_dir, archive) = archive();
        insert_session(&archive, 10, 20, 3);
        insert_session(&archive, 30, 40, 1);
        let index = SessionIndex::new(Arc::new(archive));
        assert_eq!(index.session_count(), 2);

        index.clear().unwrap();
        assert!(!index.has_index());

        // Clearing again is a no-op
        index.clear().unwrap();
    }

    #[test]
    fn test_session_point_read() {
        let (_dir, archive) = archive();
        let id = insert_session(&archive, 10, 20, 3);
        let index = SessionIndex::new(Arc::new(archive));

        let session = index.session(id).unwrap();
        assert_eq!(session.start_ts, 10);
        assert_eq!(session.end_ts, 20);
        assert_eq!(session.message_count, 3);
        assert!(!session.is_manual);
        assert!(index.session(id + 1).is_none());
    }
}
