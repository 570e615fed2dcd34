//! Message store read cursor and member directory
//!
//! Messages are written by the importer; this module only reads them.

use std::sync::Arc;

use rusqlite::{Connection, Row, params};
use serde::{Deserialize, Serialize};

use super::Archive;
use crate::{Error, Result};

/// Inclusive timestamp range in epoch seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start_ts: i64,
    pub end_ts: i64,
}

impl TimeRange {
    /// Create a range, swapping the bounds if they are reversed
    #[must_use]
    pub const fn new(start_ts: i64, end_ts: i64) -> Self {
        if start_ts <= end_ts {
            Self { start_ts, end_ts }
        } else {
            Self {
                start_ts: end_ts,
                end_ts: start_ts,
            }
        }
    }

    /// Whether `ts` falls inside the range
    #[must_use]
    pub const fn contains(&self, ts: i64) -> bool {
        self.start_ts <= ts && ts <= self.end_ts
    }
}

/// A stored chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub id: i64,
    pub ts: i64,
    pub sender_id: i64,
    pub content: Option<String>,
    /// Message kind tag assigned by the importer
    #[serde(rename = "type")]
    pub kind: i64,
    /// Platform identifier of this message
    pub platform_message_id: Option<String>,
    /// Platform identifier of the message this one replies to
    pub reply_to_message_id: Option<String>,
}

/// A member of the conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Member {
    pub id: i64,
    pub platform_id: String,
    pub account_name: Option<String>,
    pub group_nickname: Option<String>,
    pub avatar: Option<String>,
    pub aliases: Vec<String>,
}

impl Member {
    /// Display name following the group nickname, account name, platform id chain
    #[must_use]
    pub fn display_name(&self) -> &str {
        display_name(
            self.group_nickname.as_deref(),
            self.account_name.as_deref(),
            &self.platform_id,
        )
    }
}

/// Resolve a display name from the precedence chain
#[must_use]
pub fn display_name<'a>(
    group_nickname: Option<&'a str>,
    account_name: Option<&'a str>,
    platform_id: &'a str,
) -> &'a str {
    group_nickname.or(account_name).unwrap_or(platform_id)
}

/// Parse a stored alias list
///
/// Missing or malformed values yield an empty list so one corrupt member row
/// cannot fail a whole query.
#[must_use]
pub fn parse_aliases(raw: Option<&str>) -> Vec<String> {
    let Some(raw) = raw.filter(|s| !s.trim().is_empty()) else {
        return Vec::new();
    };

    match serde_json::from_str(raw) {
        Ok(aliases) => aliases,
        Err(e) => {
            tracing::debug!(error = %e, "ignoring malformed alias list");
            Vec::new()
        }
    }
}

/// A message joined with its sender and reply target, as shown to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageView {
    pub id: i64,
    pub sender_id: i64,
    pub sender_name: String,
    pub sender_platform_id: String,
    pub sender_aliases: Vec<String>,
    pub sender_avatar: Option<String>,
    /// Message text (empty for content-less messages)
    pub content: String,
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub kind: i64,
    pub reply_to_message_id: Option<String>,
    pub reply_to_content: Option<String>,
    pub reply_to_sender_name: Option<String>,
    /// Whether the message matched the filter criteria
    pub is_hit: bool,
}

/// Columns selected for a [`MessageView`], aliasing the message table as `msg`
///
/// Reply targets are resolved by platform message id, never by internal id.
pub(crate) const VIEW_COLUMNS: &str = "
    msg.id,
    msg.sender_id,
    COALESCE(m.group_nickname, m.account_name, m.platform_id, CAST(msg.sender_id AS TEXT)),
    COALESCE(m.platform_id, ''),
    m.aliases,
    m.avatar,
    msg.content,
    msg.ts,
    msg.type,
    msg.reply_to_message_id,
    (SELECT r.content FROM message r
      WHERE r.platform_message_id = msg.reply_to_message_id
      ORDER BY r.id LIMIT 1),
    (SELECT COALESCE(rm.group_nickname, rm.account_name, rm.platform_id)
      FROM message r JOIN member rm ON rm.id = r.sender_id
      WHERE r.platform_message_id = msg.reply_to_message_id
      ORDER BY r.id LIMIT 1)";

/// Map a row selected with [`VIEW_COLUMNS`]
pub(crate) fn view_from_row(row: &Row<'_>) -> rusqlite::Result<MessageView> {
    let aliases: Option<String> = row.get(4)?;
    Ok(MessageView {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        sender_name: row.get(2)?,
        sender_platform_id: row.get(3)?,
        sender_aliases: parse_aliases(aliases.as_deref()),
        sender_avatar: row.get(5)?,
        content: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
        timestamp: row.get(7)?,
        kind: row.get(8)?,
        reply_to_message_id: row.get(9)?,
        reply_to_content: row.get(10)?,
        reply_to_sender_name: row.get(11)?,
        is_hit: false,
    })
}

/// Visit `(id, ts)` for every message in `(ts, id)` order
///
/// Used by the segmenter on its write connection.
pub(crate) fn scan_ordered(conn: &Connection, mut visit: impl FnMut(i64, i64)) -> Result<()> {
    let mut stmt = conn
        .prepare("SELECT id, ts FROM message ORDER BY ts ASC, id ASC")
        .map_err(Error::from_sqlite)?;
    let mut rows = stmt.query([]).map_err(Error::from_sqlite)?;

    while let Some(row) = rows.next().map_err(Error::from_sqlite)? {
        visit(row.get(0)?, row.get(1)?);
    }

    Ok(())
}

/// Read-side repository over the message store
#[derive(Debug, Clone)]
pub struct MessageRepo {
    archive: Arc<Archive>,
}

impl MessageRepo {
    /// Create a new message repository
    #[must_use]
    pub const fn new(archive: Arc<Archive>) -> Self {
        Self { archive }
    }

    /// Count stored messages
    ///
    /// # Errors
    ///
    /// Returns error if the archive cannot be read
    pub fn count(&self) -> Result<usize> {
        let conn = self.archive.reader()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM message", [], |row| row.get(0))
            .map_err(Error::from_sqlite)?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// All messages ordered by `(ts, id)`, optionally bounded by time
    ///
    /// # Errors
    ///
    /// Returns error if the archive cannot be read
    pub fn ordered(&self, range: Option<TimeRange>) -> Result<Vec<Message>> {
        let conn = self.archive.reader()?;
        let (from, to) = bounds(range);

        let mut stmt = conn
            .prepare(
                "SELECT id, ts, sender_id, content, type, platform_message_id, reply_to_message_id
                 FROM message
                 WHERE ts >= ?1 AND ts <= ?2
                 ORDER BY ts ASC, id ASC",
            )
            .map_err(Error::from_sqlite)?;

        let messages = stmt
            .query_map(params![from, to], |row| {
                Ok(Message {
                    id: row.get(0)?,
                    ts: row.get(1)?,
                    sender_id: row.get(2)?,
                    content: row.get(3)?,
                    kind: row.get(4)?,
                    platform_message_id: row.get(5)?,
                    reply_to_message_id: row.get(6)?,
                })
            })
            .map_err(Error::from_sqlite)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(messages)
    }

    /// Joined message views ordered by `(ts, id)`, optionally bounded by time
    ///
    /// # Errors
    ///
    /// Returns error if the archive cannot be read
    pub fn views(&self, range: Option<TimeRange>) -> Result<Vec<MessageView>> {
        let conn = self.archive.reader()?;
        let (from, to) = bounds(range);

        let sql = format!(
            "SELECT {VIEW_COLUMNS}
             FROM message msg
             LEFT JOIN member m ON m.id = msg.sender_id
             WHERE msg.ts >= ?1 AND msg.ts <= ?2
             ORDER BY msg.ts ASC, msg.id ASC"
        );
        let mut stmt = conn.prepare(&sql).map_err(Error::from_sqlite)?;

        let views = stmt
            .query_map(params![from, to], view_from_row)
            .map_err(Error::from_sqlite)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(views)
    }

    /// Look up a member by internal id
    ///
    /// # Errors
    ///
    /// Returns error if the archive cannot be read
    pub fn member(&self, id: i64) -> Result<Option<Member>> {
        let conn = self.archive.reader()?;

        let result = conn.query_row(
            "SELECT id, platform_id, account_name, group_nickname, avatar, aliases
             FROM member WHERE id = ?1",
            [id],
            |row| {
                let aliases: Option<String> = row.get(5)?;
                Ok(Member {
                    id: row.get(0)?,
                    platform_id: row.get(1)?,
                    account_name: row.get(2)?,
                    group_nickname: row.get(3)?,
                    avatar: row.get(4)?,
                    aliases: parse_aliases(aliases.as_deref()),
                })
            },
        );

        match result {
            Ok(member) => Ok(Some(member)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::from_sqlite(e)),
        }
    }
}

const fn bounds(range: Option<TimeRange>) -> (i64, i64) {
    match range {
        Some(range) => (range.start_ts, range.end_ts),
        None => (i64::MIN, i64::MAX),
    }
}
