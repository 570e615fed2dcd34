//! Read-side queries over the session index
//!
//! Every query is total: failures are logged and an empty result is returned.

use std::sync::Arc;

use indexmap::IndexSet;
use rusqlite::types::Value;
use rusqlite::{Connection, params, params_from_iter};
use serde::Serialize;

use crate::db::message::{VIEW_COLUMNS, view_from_row};
use crate::db::session::{count_from, load_session};
use crate::db::{Archive, TimeRange, read_or};
use crate::filter::{ContextBlock, FilterResult};
use crate::{Error, Result};

/// Default number of sessions returned by a search
pub const DEFAULT_SEARCH_LIMIT: usize = 20;

/// Default number of preview messages per session
pub const DEFAULT_PREVIEW_COUNT: usize = 5;

/// Default number of messages returned for one session
pub const DEFAULT_SESSION_MESSAGES_LIMIT: usize = 500;

/// Parameters of a session search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSearch {
    /// Sessions must contain at least one of these (empty = no keyword filter)
    pub keywords: Vec<String>,
    /// Sessions must lie entirely inside this range
    pub time_range: Option<TimeRange>,
    pub limit: usize,
    pub preview_count: usize,
}

impl Default for SessionSearch {
    fn default() -> Self {
        Self {
            keywords: Vec::new(),
            time_range: None,
            limit: DEFAULT_SEARCH_LIMIT,
            preview_count: DEFAULT_PREVIEW_COUNT,
        }
    }
}

/// A compact message used in previews and session listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreviewMessage {
    pub id: i64,
    pub sender_name: String,
    pub content: Option<String>,
    pub timestamp: i64,
}

/// A session matched by a search
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSearchItem {
    pub id: i64,
    pub start_ts: i64,
    pub end_ts: i64,
    pub message_count: usize,
    /// The preview holds every message of the session
    pub is_complete: bool,
    pub preview_messages: Vec<PreviewMessage>,
}

/// Messages of one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionMessages {
    pub session_id: i64,
    pub start_ts: i64,
    pub end_ts: i64,
    pub message_count: usize,
    pub returned_count: usize,
    /// Distinct sender names in first-seen order
    pub participants: Vec<String>,
    pub messages: Vec<PreviewMessage>,
}

/// A session carrying a summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummaryItem {
    pub id: i64,
    pub start_ts: i64,
    pub end_ts: i64,
    pub message_count: usize,
    pub summary: String,
}

/// Whether a preview of `preview_count` messages shows the whole session
#[must_use]
pub const fn is_complete(message_count: usize, preview_count: usize) -> bool {
    message_count <= preview_count
}

/// Escape LIKE special characters for use with `ESCAPE '\'`
#[must_use]
pub fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

const PREVIEW_SQL: &str = "
    SELECT
        m.id,
        COALESCE(mb.group_nickname, mb.account_name, mb.platform_id, CAST(m.sender_id AS TEXT)),
        m.content,
        m.ts
    FROM message_context mc
    JOIN message m ON m.id = mc.message_id
    LEFT JOIN member mb ON mb.id = m.sender_id
    WHERE mc.session_id = ?1
    ORDER BY m.ts ASC, m.id ASC
    LIMIT ?2";

/// Session queries bound to one archive
#[derive(Debug, Clone)]
pub struct SessionQuery {
    archive: Arc<Archive>,
}

impl SessionQuery {
    /// Create a query layer for an archive
    #[must_use]
    pub const fn new(archive: Arc<Archive>) -> Self {
        Self { archive }
    }

    /// Search sessions by keyword and time range, newest first
    #[must_use]
    pub fn search_sessions(&self, search: &SessionSearch) -> Vec<SessionSearchItem> {
        read_or(&self.archive, "search_sessions", Vec::new(), |conn| {
            search_sessions(conn, search)
        })
    }

    /// Metadata and up to `limit` chronological messages of one session
    ///
    /// Returns `None` for an unknown session id.
    #[must_use]
    pub fn session_messages(&self, session_id: i64, limit: usize) -> Option<SessionMessages> {
        read_or(&self.archive, "session_messages", None, |conn| {
            session_messages(conn, session_id, limit)
        })
    }

    /// Every message of each requested session, one block per session
    ///
    /// Blocks are ordered by start time and carry no hits. Unknown ids are
    /// skipped.
    #[must_use]
    pub fn multiple_sessions_messages(&self, session_ids: &[i64]) -> FilterResult {
        if session_ids.is_empty() {
            return FilterResult::default();
        }
        read_or(
            &self.archive,
            "multiple_sessions_messages",
            FilterResult::default(),
            |conn| multiple_sessions_messages(conn, session_ids),
        )
    }

    /// Sessions with a summary, newest first
    #[must_use]
    pub fn session_summaries(
        &self,
        time_range: Option<TimeRange>,
        limit: usize,
    ) -> Vec<SessionSummaryItem> {
        read_or(&self.archive, "session_summaries", Vec::new(), |conn| {
            session_summaries(conn, time_range, limit)
        })
    }
}

fn search_sessions(conn: &Connection, search: &SessionSearch) -> Result<Vec<SessionSearchItem>> {
    let mut sql = String::from(
        "SELECT cs.id, cs.start_ts, cs.end_ts, cs.message_count
         FROM chat_session cs
         WHERE 1=1",
    );
    let mut values: Vec<Value> = Vec::new();

    if let Some(range) = search.time_range {
        sql.push_str(" AND cs.start_ts >= ? AND cs.end_ts <= ?");
        values.push(Value::Integer(range.start_ts));
        values.push(Value::Integer(range.end_ts));
    }

    let keywords: Vec<&str> = search
        .keywords
        .iter()
        .map(String::as_str)
        .filter(|k| !k.is_empty())
        .collect();
    if !keywords.is_empty() {
        let conditions = vec!["m.content LIKE ? ESCAPE '\\'"; keywords.len()].join(" OR ");
        sql.push_str(&format!(
            " AND cs.id IN (
                SELECT DISTINCT mc.session_id
                FROM message_context mc
                JOIN message m ON m.id = mc.message_id
                WHERE ({conditions})
            )"
        ));
        values.extend(
            keywords
                .iter()
                .map(|k| Value::Text(format!("%{}%", escape_like(k)))),
        );
    }

    sql.push_str(" ORDER BY cs.start_ts DESC, cs.id DESC LIMIT ?");
    values.push(Value::Integer(to_sql_limit(search.limit)));

    let mut stmt = conn.prepare(&sql).map_err(Error::from_sqlite)?;
    let sessions = stmt
        .query_map(params_from_iter(values), |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                count_from(row.get(3)?),
            ))
        })
        .map_err(Error::from_sqlite)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut preview = conn.prepare(PREVIEW_SQL).map_err(Error::from_sqlite)?;
    let mut items = Vec::with_capacity(sessions.len());
    for (id, start_ts, end_ts, message_count) in sessions {
        let preview_messages = preview
            .query_map(
                params![id, to_sql_limit(search.preview_count)],
                preview_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        items.push(SessionSearchItem {
            id,
            start_ts,
            end_ts,
            message_count,
            is_complete: is_complete(message_count, search.preview_count),
            preview_messages,
        });
    }

    Ok(items)
}

fn session_messages(
    conn: &Connection,
    session_id: i64,
    limit: usize,
) -> Result<Option<SessionMessages>> {
    let Some(session) = load_session(conn, session_id)? else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(PREVIEW_SQL).map_err(Error::from_sqlite)?;
    let messages = stmt
        .query_map(params![session_id, to_sql_limit(limit)], preview_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let participants: IndexSet<&str> = messages.iter().map(|m| m.sender_name.as_str()).collect();
    let participants: Vec<String> = participants.into_iter().map(String::from).collect();

    Ok(Some(SessionMessages {
        session_id: session.id,
        start_ts: session.start_ts,
        end_ts: session.end_ts,
        message_count: session.message_count,
        returned_count: messages.len(),
        participants,
        messages,
    }))
}

fn multiple_sessions_messages(conn: &Connection, session_ids: &[i64]) -> Result<FilterResult> {
    let ids: IndexSet<i64> = session_ids.iter().copied().collect();
    let placeholders = vec!["?"; ids.len()].join(",");

    let mut sessions_stmt = conn
        .prepare(&format!(
            "SELECT id, start_ts, end_ts FROM chat_session
             WHERE id IN ({placeholders})
             ORDER BY start_ts ASC, id ASC"
        ))
        .map_err(Error::from_sqlite)?;
    let sessions = sessions_stmt
        .query_map(params_from_iter(ids.iter()), |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })
        .map_err(Error::from_sqlite)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut messages_stmt = conn
        .prepare(&format!(
            "SELECT {VIEW_COLUMNS}
             FROM message_context mc
             JOIN message msg ON msg.id = mc.message_id
             LEFT JOIN member m ON m.id = msg.sender_id
             WHERE mc.session_id = ?1
             ORDER BY msg.ts ASC, msg.id ASC"
        ))
        .map_err(Error::from_sqlite)?;

    let mut blocks = Vec::with_capacity(sessions.len());
    for (id, start_ts, end_ts) in sessions {
        let messages = messages_stmt
            .query_map([id], view_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        blocks.push(ContextBlock {
            start_ts,
            end_ts,
            messages,
            hit_count: 0,
        });
    }

    Ok(FilterResult::from_blocks(blocks, 0))
}

fn session_summaries(
    conn: &Connection,
    time_range: Option<TimeRange>,
    limit: usize,
) -> Result<Vec<SessionSummaryItem>> {
    let mut sql = String::from(
        "SELECT id, start_ts, end_ts, message_count, summary
         FROM chat_session
         WHERE summary IS NOT NULL AND summary != ''",
    );
    let mut values: Vec<Value> = Vec::new();

    if let Some(range) = time_range {
        sql.push_str(" AND start_ts >= ? AND end_ts <= ?");
        values.push(Value::Integer(range.start_ts));
        values.push(Value::Integer(range.end_ts));
    }

    sql.push_str(" ORDER BY start_ts DESC, id DESC LIMIT ?");
    values.push(Value::Integer(to_sql_limit(limit)));

    let mut stmt = conn.prepare(&sql).map_err(Error::from_sqlite)?;
    let items = stmt
        .query_map(params_from_iter(values), |row| {
            Ok(SessionSummaryItem {
                id: row.get(0)?,
                start_ts: row.get(1)?,
                end_ts: row.get(2)?,
                message_count: count_from(row.get(3)?),
                summary: row.get(4)?,
            })
        })
        .map_err(Error::from_sqlite)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(items)
}

fn preview_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PreviewMessage> {
    Ok(PreviewMessage {
        id: row.get(0)?,
        sender_name: row.get(1)?,
        content: row.get(2)?,
        timestamp: row.get(3)?,
    })
}

fn to_sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::{add_member, add_message, archive};
    use crate::segment::Segmenter;

    /// Three sessions: [100..130] x4, [5000..5050] x6, [20000] x1
    fn indexed() -> (tempfile::TempDir, Arc<Archive>, i64, i64) {
        let (dir, archive) = archive();
        let alice = add_member(&archive, "alice", Some("Alice"));
        let bob = add_member(&archive, "bob", None);

        add_message(&archive, alice, 100, "Lunch plans?");
        add_message(&archive, bob, 110, "pizza");
        add_message(&archive, alice, 120, "ok");
        add_message(&archive, bob, 130, "see you");
        for i in 0..6 {
            let sender = if i % 2 == 0 { bob } else { alice };
            add_message(&archive, sender, 5000 + i * 10, "release 100% ready");
        }
        add_message(&archive, alice, 20_000, "night");

        let archive = Arc::new(archive);
        Segmenter::new(Arc::clone(&archive)).generate(1800).unwrap();
        (dir, archive, alice, bob)
    }

    #[test]
    fn test_search_newest_first_with_preview() {
        let (_dir, archive, _, _) = indexed();
        let query = SessionQuery::new(archive);

        let results = query.search_sessions(&SessionSearch::default());
        let starts: Vec<i64> = results.iter().map(|s| s.start_ts).collect();
        assert_eq!(starts, vec![20_000, 5000, 100]);

        let release = &results[1];
        assert_eq!(release.message_count, 6);
        assert_eq!(release.preview_messages.len(), 5);
        assert!(!release.is_complete);
        assert_eq!(release.preview_messages[0].timestamp, 5000);

        let lunch = &results[2];
        assert!(lunch.is_complete);
        assert_eq!(lunch.preview_messages[0].sender_name, "Alice");
    }

    #[test]
    fn test_search_by_keyword_and_time() {
        let (_dir, archive, _, _) = indexed();
        let query = SessionQuery::new(archive);

        let by_keyword = query.search_sessions(&SessionSearch {
            keywords: vec!["LUNCH".to_string(), "pizza".to_string()],
            ..SessionSearch::default()
        });
        assert_eq!(by_keyword.len(), 1);
        assert_eq!(by_keyword[0].start_ts, 100);

        // The literal percent sign must not act as a wildcard
        let literal = query.search_sessions(&SessionSearch {
            keywords: vec!["100%".to_string()],
            ..SessionSearch::default()
        });
        assert_eq!(literal.len(), 1);
        assert_eq!(literal[0].start_ts, 5000);

        let by_time = query.search_sessions(&SessionSearch {
            time_range: Some(TimeRange::new(0, 5100)),
            limit: 1,
            ..SessionSearch::default()
        });
        assert_eq!(by_time.len(), 1);
        assert_eq!(by_time[0].start_ts, 5000);
    }

    #[test]
    fn test_search_whitespace_keyword() {
        let (_dir, archive, _, _) = indexed();
        let query = SessionQuery::new(archive);

        let results = query.search_sessions(&SessionSearch {
            keywords: vec![" ".to_string()],
            ..SessionSearch::default()
        });
        let starts: Vec<i64> = results.iter().map(|s| s.start_ts).collect();
        assert_eq!(starts, vec![5000, 100]);
    }

    #[test]
    fn test_completeness_flag() {
        assert!(is_complete(5, 5));
        assert!(!is_complete(6, 5));
    }

    #[test]
    fn test_session_messages() {
        let (_dir, archive, _, _) = indexed();
        let query = SessionQuery::new(Arc::clone(&archive));
        let first = crate::db::SessionIndex::new(archive).list()[0].id;

        let session = query.session_messages(first, 500).unwrap();
        assert_eq!(session.message_count, 4);
        assert_eq!(session.returned_count, 4);
        assert_eq!(session.participants, vec!["Alice", "bob-account"]);

        let limited = query.session_messages(first, 2).unwrap();
        assert_eq!(limited.returned_count, 2);
        assert_eq!(limited.message_count, 4);

        assert!(query.session_messages(first + 1000, 500).is_none());
    }

    #[test]
    fn test_multiple_sessions_messages() {
        let (_dir, archive, _, _) = indexed();
        let index = crate::db::SessionIndex::new(Arc::clone(&archive));
        let ids: Vec<i64> = index.list().iter().map(|s| s.id).collect();
        let query = SessionQuery::new(archive);

        // Requested out of order, with a duplicate and an unknown id
        let result = query.multiple_sessions_messages(&[ids[2], ids[0], ids[0], 999]);
        assert_eq!(result.blocks.len(), 2);
        assert_eq!(result.blocks[0].start_ts, 100);
        assert_eq!(result.blocks[1].start_ts, 20_000);
        assert!(result.blocks.iter().all(|b| b.hit_count == 0));
        assert!(result.blocks.iter().flat_map(|b| &b.messages).all(|m| !m.is_hit));

        assert_eq!(result.stats.total_messages, 5);
        assert_eq!(result.stats.hit_messages, 0);
        let chars = "Lunch plans?".len() + "pizza".len() + "ok".len() + "see you".len() + "night".len();
        assert_eq!(result.stats.total_chars, chars);

        assert!(query.multiple_sessions_messages(&[]).is_empty());
    }

    #[test]
    fn test_session_summaries() {
        let (_dir, archive, _, _) = indexed();
        let index = crate::db::SessionIndex::new(Arc::clone(&archive));
        let ids: Vec<i64> = index.list().iter().map(|s| s.id).collect();
        index.attach_summary(ids[0], "lunch").unwrap();
        index.attach_summary(ids[1], "release").unwrap();

        let query = SessionQuery::new(archive);
        let all: Vec<String> = query
            .session_summaries(None, 20)
            .into_iter()
            .map(|s| s.summary)
            .collect();
        assert_eq!(all, vec!["release", "lunch"]);

        let early = query.session_summaries(Some(TimeRange::new(0, 1000)), 20);
        assert_eq!(early.len(), 1);
    }

    #[test]
    fn test_queries_before_indexing() {
        let (_dir, archive) = archive();
        let query = SessionQuery::new(Arc::new(archive));

        assert!(query.search_sessions(&SessionSearch::default()).is_empty());
        assert!(query.session_messages(1, 10).is_none());
        assert!(query.multiple_sessions_messages(&[1]).is_empty());
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
    }
}
