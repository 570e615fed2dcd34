//! Session tools invoked by the assistant's tool-dispatch layer
//!
//! Each tool takes a deserializable parameter struct, applies the tool's
//! defaults and forwards to the index, query or filter layer.

use std::fmt;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::config::QueryDefaults;
use crate::db::{Archive, TimeRange};
use crate::filter::{ContextFilter, FilterCriteria, FilterResult};
use crate::query::{
    SessionMessages, SessionQuery, SessionSearch, SessionSearchItem, SessionSummaryItem,
};
use crate::{Error, Result};

/// Messages returned by `get_session_messages` unless limited
pub const TOOL_SESSION_MESSAGES_LIMIT: usize = 1000;

/// Context radius used by `get_message_context`
pub const TOOL_MESSAGE_CONTEXT_SIZE: usize = 20;

/// Calendar filter expressed as year, month and day
///
/// A month needs a year and a day needs a month; incomplete or impossible
/// dates produce no filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateFilter {
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub day: Option<u32>,
}

impl DateFilter {
    /// Inclusive UTC range covered by the filter
    #[must_use]
    pub fn to_range(&self) -> Option<TimeRange> {
        let year = self.year?;

        let (start, next) = match (self.month, self.day) {
            (None, _) => (
                NaiveDate::from_ymd_opt(year, 1, 1)?,
                NaiveDate::from_ymd_opt(year.checked_add(1)?, 1, 1)?,
            ),
            (Some(month), None) => {
                let start = NaiveDate::from_ymd_opt(year, month, 1)?;
                let next = if month == 12 {
                    NaiveDate::from_ymd_opt(year.checked_add(1)?, 1, 1)?
                } else {
                    NaiveDate::from_ymd_opt(year, month + 1, 1)?
                };
                (start, next)
            }
            (Some(month), Some(day)) => {
                let start = NaiveDate::from_ymd_opt(year, month, day)?;
                (start, start.succ_opt()?)
            }
        };

        let start_ts = start.and_hms_opt(0, 0, 0)?.and_utc().timestamp();
        let end_ts = next.and_hms_opt(0, 0, 0)?.and_utc().timestamp() - 1;
        Some(TimeRange::new(start_ts, end_ts))
    }
}

/// Parameters of `search_sessions`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchSessionsParams {
    /// Only sessions containing any of these keywords
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Session count limit (configured search limit, 20 by default)
    pub limit: Option<usize>,
    #[serde(flatten)]
    pub date: DateFilter,
}

/// Parameters of `get_session_messages`
#[derive(Debug, Clone, Deserialize)]
pub struct GetSessionMessagesParams {
    /// Session id from `search_sessions`
    pub session_id: i64,
    /// Message count limit (default 1000)
    pub limit: Option<usize>,
}

/// Parameters of `get_session_summaries`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GetSessionSummariesParams {
    /// Session count limit (configured search limit, 20 by default)
    pub limit: Option<usize>,
    #[serde(flatten)]
    pub date: DateFilter,
}

/// Parameters of `get_message_context`
#[derive(Debug, Clone, Deserialize)]
pub struct GetMessageContextParams {
    /// Messages to show context around
    pub message_ids: Vec<i64>,
    /// Messages before and after each one (default 20)
    pub context_size: Option<usize>,
}

/// Parameters of `filter_messages`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterMessagesParams {
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub sender_ids: Vec<i64>,
    #[serde(flatten)]
    pub date: DateFilter,
    /// Messages before and after each hit (configured context size, 10 by default)
    pub context_size: Option<usize>,
}

/// Session tools bound to one archive
#[derive(Clone)]
pub struct SessionTools {
    archive: Arc<Archive>,
    query: SessionQuery,
    filter: ContextFilter,
    defaults: QueryDefaults,
}

impl fmt::Debug for SessionTools {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTools")
            .field("archive", &self.archive.id())
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl SessionTools {
    /// Create a new `SessionTools` instance
    #[must_use]
    pub fn new(archive: Arc<Archive>) -> Self {
        Self::with_defaults(archive, QueryDefaults::default())
    }

    /// Create tools that fall back to configured defaults
    #[must_use]
    pub fn with_defaults(archive: Arc<Archive>, defaults: QueryDefaults) -> Self {
        Self {
            query: SessionQuery::new(Arc::clone(&archive)),
            filter: ContextFilter::new(Arc::clone(&archive)),
            archive,
            defaults,
        }
    }

    /// Search sessions with a short preview each
    #[must_use]
    pub fn search_sessions(&self, params: &SearchSessionsParams) -> Vec<SessionSearchItem> {
        self.query.search_sessions(&SessionSearch {
            keywords: params.keywords.clone(),
            time_range: params.date.to_range(),
            limit: params.limit.unwrap_or(self.defaults.search_limit),
            preview_count: self.defaults.preview_count,
        })
    }

    /// Get the messages of one session
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the session does not exist or the
    /// archive could not be read
    pub fn get_session_messages(&self, params: &GetSessionMessagesParams) -> Result<SessionMessages> {
        let limit = params.limit.unwrap_or(TOOL_SESSION_MESSAGES_LIMIT);
        self.query
            .session_messages(params.session_id, limit)
            .ok_or_else(|| Error::NotFound(format!("session {}", params.session_id)))
    }

    /// List summarized sessions, newest first
    #[must_use]
    pub fn get_session_summaries(&self, params: &GetSessionSummariesParams) -> Vec<SessionSummaryItem> {
        self.query.session_summaries(
            params.date.to_range(),
            params.limit.unwrap_or(self.defaults.search_limit),
        )
    }

    /// Surrounding context for specific messages
    #[must_use]
    pub fn get_message_context(&self, params: &GetMessageContextParams) -> FilterResult {
        self.filter.message_context(
            &params.message_ids,
            params.context_size.unwrap_or(TOOL_MESSAGE_CONTEXT_SIZE),
        )
    }

    /// Keyword and sender filter with context expansion
    #[must_use]
    pub fn filter_messages(&self, params: &FilterMessagesParams) -> FilterResult {
        let criteria = FilterCriteria::new()
            .with_keywords(params.keywords.iter().cloned())
            .with_sender_ids(params.sender_ids.iter().copied())
            .with_time_range(params.date.to_range());
        self.filter.filter(
            &criteria,
            params.context_size.unwrap_or(self.defaults.context_size),
        )
    }
}
