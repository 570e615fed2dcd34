//! Gap-based session segmentation
//!
//! A single forward scan over messages ordered by `(ts, id)`: a message opens a
//! new session when it is the first one or when it follows the previous
//! message by more than the gap threshold. The resulting partition replaces
//! the whole session index in one transaction.

use std::sync::Arc;

use rusqlite::params;

use crate::db::Archive;
use crate::db::message::scan_ordered;
use crate::db::session::clear_rows;
use crate::{Error, Result};

/// Progress is reported every this many written sessions
pub const PROGRESS_INTERVAL: usize = 100;

/// One session produced by the scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentedSession {
    pub start_ts: i64,
    pub end_ts: i64,
    /// Member message ids in scan order
    pub message_ids: Vec<i64>,
}

impl SegmentedSession {
    /// Number of messages in the session
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.message_ids.len()
    }
}

/// Streaming session boundary detector
///
/// Feed messages in `(ts, id)` order with [`push`](Self::push).
#[derive(Debug)]
pub struct SessionBoundaries {
    gap_threshold: i64,
    prev_ts: Option<i64>,
    sessions: Vec<SegmentedSession>,
}

impl SessionBoundaries {
    /// Create a detector for the given threshold in seconds
    #[must_use]
    pub fn new(gap_threshold: u32) -> Self {
        Self {
            gap_threshold: i64::from(gap_threshold),
            prev_ts: None,
            sessions: Vec::new(),
        }
    }

    /// Add the next message of the ordered stream
    pub fn push(&mut self, id: i64, ts: i64) {
        let starts_session = self
            .prev_ts
            .is_none_or(|prev| ts.saturating_sub(prev) > self.gap_threshold);
        self.prev_ts = Some(ts);

        match self.sessions.last_mut() {
            Some(current) if !starts_session => {
                current.end_ts = current.end_ts.max(ts);
                current.message_ids.push(id);
            }
            _ => self.sessions.push(SegmentedSession {
                start_ts: ts,
                end_ts: ts,
                message_ids: vec![id],
            }),
        }
    }

    /// Sessions accumulated so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no message has been pushed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Finish the scan and return the sessions in order
    #[must_use]
    pub fn finish(self) -> Vec<SegmentedSession> {
        self.sessions
    }
}

/// Segment an ordered `(id, ts)` stream
#[must_use]
pub fn segment(
    messages: impl IntoIterator<Item = (i64, i64)>,
    gap_threshold: u32,
) -> Vec<SegmentedSession> {
    let mut boundaries = SessionBoundaries::new(gap_threshold);
    for (id, ts) in messages {
        boundaries.push(id, ts);
    }
    boundaries.finish()
}

/// Rebuilds the session index of one archive
#[derive(Debug, Clone)]
pub struct Segmenter {
    archive: Arc<Archive>,
}

impl Segmenter {
    /// Create a segmenter for an archive
    #[must_use]
    pub const fn new(archive: Arc<Archive>) -> Self {
        Self { archive }
    }

    /// Rebuild the session index
    ///
    /// Returns the number of sessions written.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageUnavailable`] if the archive cannot be opened
    /// for writing and [`Error::SchemaMissing`] if the message or index tables
    /// are absent
    pub fn generate(&self, gap_threshold: u32) -> Result<usize> {
        self.generate_with_progress(gap_threshold, |_, _| {})
    }

    /// Rebuild the session index, reporting `(written, total)` progress
    ///
    /// The callback fires every [`PROGRESS_INTERVAL`] sessions and once more
    /// after the rebuild is committed.
    ///
    /// # Errors
    ///
    /// See [`generate`](Self::generate)
    pub fn generate_with_progress(
        &self,
        gap_threshold: u32,
        mut on_progress: impl FnMut(usize, usize),
    ) -> Result<usize> {
        let mut conn = self.archive.writer()?;
        let tx = conn.transaction().map_err(Error::from_sqlite)?;

        let mut boundaries = SessionBoundaries::new(gap_threshold);
        scan_ordered(&tx, |id, ts| boundaries.push(id, ts))?;
        let sessions = boundaries.finish();
        let total = sessions.len();

        clear_rows(&tx)?;

        {
            let mut insert_session = tx
                .prepare(
                    "INSERT INTO chat_session (start_ts, end_ts, message_count, is_manual, summary)
                     VALUES (?1, ?2, ?3, 0, NULL)",
                )
                .map_err(Error::from_sqlite)?;
            let mut insert_context = tx
                .prepare(
                    "INSERT INTO message_context (message_id, session_id, topic_id)
                     VALUES (?1, ?2, NULL)",
                )
                .map_err(Error::from_sqlite)?;

            for (index, session) in sessions.iter().enumerate() {
                let count = i64::try_from(session.message_count()).unwrap_or(i64::MAX);
                insert_session.execute(params![session.start_ts, session.end_ts, count])?;
                let session_id = tx.last_insert_rowid();

                for message_id in &session.message_ids {
                    insert_context.execute(params![message_id, session_id])?;
                }

                let written = index + 1;
                if written % PROGRESS_INTERVAL == 0 {
                    on_progress(written, total);
                }
            }
        }

        tx.commit()?;
        on_progress(total, total);

        tracing::info!(
            archive = %self.archive.id(),
            gap_threshold,
            sessions = total,
            "session index generated"
        );
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SessionIndex;
    use crate::db::testing::{add_member, add_message, archive};

    fn spans(sessions: &[SegmentedSession]) -> Vec<(i64, i64, usize)> {
        sessions
            .iter()
            .map(|s| (s.start_ts, s.end_ts, s.message_count()))
            .collect()
    }

    #[test]
    fn test_segment_empty() {
        assert!(segment(Vec::new(), 1800).is_empty());
    }

    #[test]
    fn test_gap_boundary_is_inclusive() {
        let joined = segment(vec![(1, 1000), (2, 1000 + 1800)], 1800);
        assert_eq!(joined.len(), 1);

        let split = segment(vec![(1, 1000), (2, 1000 + 1801)], 1800);
        assert_eq!(split.len(), 2);
        assert_eq!(split[1].message_ids, vec![2]);
    }

    #[test]
    fn test_equal_timestamps_join_even_with_zero_gap() {
        let sessions = segment(vec![(1, 50), (2, 50), (3, 51)], 0);
        assert_eq!(spans(&sessions), vec![(50, 50, 2), (51, 51, 1)]);
    }

    #[test]
    fn test_gap_measured_from_previous_message() {
        // Each step stays under the threshold even though the span exceeds it
        let sessions = segment(vec![(1, 0), (2, 50), (3, 100), (4, 150)], 60);
        assert_eq!(spans(&sessions), vec![(0, 150, 4)]);
    }

    #[test]
    fn test_generate_partitions_all_messages() {
        let (_dir, archive) = archive();
        let alice = add_member(&archive, "alice", None);
        let mut ids = Vec::new();
        for ts in [100, 200, 5000, 5100, 9000] {
            ids.push(add_message(&archive, alice, ts, "hi"));
        }

        let archive = Arc::new(archive);
        let count = Segmenter::new(Arc::clone(&archive)).generate(1800).unwrap();
        assert_eq!(count, 3);

        let conn = archive.reader().unwrap();
        let mut stmt = conn
            .prepare("SELECT message_id FROM message_context ORDER BY message_id")
            .unwrap();
        let assigned: Vec<i64> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .map(std::result::Result::unwrap)
            .collect();
        assert_eq!(assigned, ids);

        let index = SessionIndex::new(Arc::clone(&archive));
        let listed: Vec<(i64, i64, usize)> = index
            .list()
            .iter()
            .map(|s| (s.start_ts, s.end_ts, s.message_count))
            .collect();
        assert_eq!(listed, vec![(100, 200, 2), (5000, 5100, 2), (9000, 9000, 1)]);
    }

    #[test]
    fn test_generate_is_idempotent() {
        let (_dir, archive) = archive();
        let alice = add_member(&archive, "alice", None);
        for ts in [10, 20, 4000, 4010, 9000, 9001] {
            add_message(&archive, alice, ts, "msg");
        }

        let archive = Arc::new(archive);
        let segmenter = Segmenter::new(Arc::clone(&archive));
        let index = SessionIndex::new(Arc::clone(&archive));
        let snapshot = || -> Vec<(i64, i64, usize)> {
            index
                .list()
                .iter()
                .map(|s| (s.start_ts, s.end_ts, s.message_count))
                .collect()
        };

        segmenter.generate(600).unwrap();
        let first = snapshot();
        segmenter.generate(600).unwrap();
        assert_eq!(first, snapshot());
        assert_eq!(index.session_count(), 3);
    }

    #[test]
    fn test_generate_empty_archive() {
        let (_dir, archive) = archive();
        let archive = Arc::new(archive);

        let mut calls = Vec::new();
        let count = Segmenter::new(Arc::clone(&archive))
            .generate_with_progress(1800, |done, total| calls.push((done, total)))
            .unwrap();

        assert_eq!(count, 0);
        assert_eq!(calls, vec![(0, 0)]);
        assert!(!SessionIndex::new(archive).has_index());
    }

    #[test]
    fn test_progress_cadence() {
        let (_dir, archive) = archive();
        let alice = add_member(&archive, "alice", None);
        {
            let mut conn = archive.writer().unwrap();
            let tx = conn.transaction().unwrap();
            for i in 0..250_i64 {
                tx.execute(
                    "INSERT INTO message (sender_id, ts, type, content) VALUES (?1, ?2, 0, 'x')",
                    params![alice, i * 10_000],
                )
                .unwrap();
            }
            tx.commit().unwrap();
        }

        let mut calls = Vec::new();
        let count = Segmenter::new(Arc::new(archive))
            .generate_with_progress(60, |done, total| calls.push((done, total)))
            .unwrap();

        assert_eq!(count, 250);
        assert_eq!(calls, vec![(100, 250), (200, 250), (250, 250)]);
    }

    #[test]
    fn test_failed_rebuild_keeps_previous_index() {
        let (_dir, archive) = archive();
        let alice = add_member(&archive, "alice", None);
        add_message(&archive, alice, 100, "a");
        let doomed = add_message(&archive, alice, 9000, "b");

        let archive = Arc::new(archive);
        let segmenter = Segmenter::new(Arc::clone(&archive));
        segmenter.generate(1800).unwrap();

        {
            let conn = archive.writer().unwrap();
            conn.execute_batch(&format!(
                "CREATE TRIGGER reject_context BEFORE INSERT ON message_context
                 WHEN NEW.message_id = {doomed}
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END;"
            ))
            .unwrap();
        }

        assert!(segmenter.generate(100_000).is_err());
        assert_eq!(SessionIndex::new(archive).session_count(), 2);
    }

    #[test]
    fn test_generate_without_schema() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bare.db");
        rusqlite::Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE unrelated (x INTEGER);")
            .unwrap();

        let err = Segmenter::new(Arc::new(Archive::new("bare", path)))
            .generate(1800)
            .unwrap_err();
        assert!(err.is_schema_missing());
    }

    #[test]
    fn test_generate_without_archive() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = Segmenter::new(Arc::new(Archive::new("gone", dir.path().join("gone.db"))))
            .generate(1800)
            .unwrap_err();
        assert!(matches!(err, Error::StorageUnavailable(_)));
    }
}
