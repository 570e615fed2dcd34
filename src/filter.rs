//! Context-aware message filtering
//!
//! Hits are located positionally over the time-ordered message array, each hit
//! is widened by `context_size` messages on both sides, and overlapping or
//! adjacent windows are merged into contiguous blocks.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::db::{Archive, MessageRepo, MessageView, TimeRange};

/// Default number of context messages on each side of a hit
pub const DEFAULT_CONTEXT_SIZE: usize = 10;

/// Match criteria for a filter query
///
/// Every present criterion must pass. Empty lists count as absent, so the
/// default value matches every message in the time range.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterCriteria {
    /// Case-insensitive substrings, any of which must occur in the content
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Sender member ids
    #[serde(default)]
    pub sender_ids: Vec<i64>,
    /// Explicit message ids
    #[serde(default)]
    pub message_ids: Vec<i64>,
    /// Inclusive time range, applied when loading messages
    #[serde(default)]
    pub time_range: Option<TimeRange>,
}

impl FilterCriteria {
    /// Criteria matching every message
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_sender_ids(mut self, sender_ids: impl IntoIterator<Item = i64>) -> Self {
        self.sender_ids = sender_ids.into_iter().collect();
        self
    }

    #[must_use]
    pub fn with_message_ids(mut self, message_ids: impl IntoIterator<Item = i64>) -> Self {
        self.message_ids = message_ids.into_iter().collect();
        self
    }

    #[must_use]
    pub const fn with_time_range(mut self, range: Option<TimeRange>) -> Self {
        self.time_range = range;
        self
    }

    /// Compile the criteria for repeated matching
    #[must_use]
    pub fn matcher(&self) -> Matcher {
        Matcher {
            keywords: self
                .keywords
                .iter()
                .filter(|k| !k.is_empty())
                .map(|k| k.to_lowercase())
                .collect(),
            sender_ids: self.sender_ids.iter().copied().collect(),
            message_ids: self.message_ids.iter().copied().collect(),
        }
    }
}

/// Compiled form of [`FilterCriteria`]
#[derive(Debug, Clone, Default)]
pub struct Matcher {
    keywords: Vec<String>,
    sender_ids: HashSet<i64>,
    message_ids: HashSet<i64>,
}

impl Matcher {
    /// Whether a message passes every present criterion
    #[must_use]
    pub fn is_hit(&self, id: i64, sender_id: i64, content: &str) -> bool {
        if !self.keywords.is_empty() {
            let content = content.to_lowercase();
            if !self.keywords.iter().any(|k| content.contains(k.as_str())) {
                return false;
            }
        }

        if !self.sender_ids.is_empty() && !self.sender_ids.contains(&sender_id) {
            return false;
        }

        self.message_ids.is_empty() || self.message_ids.contains(&id)
    }
}

/// A merged range of positions and the hits that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HitRange {
    /// First position, inclusive
    pub start: usize,
    /// Last position, inclusive
    pub end: usize,
    /// Hit positions inside the range, ascending
    pub hits: Vec<usize>,
}

/// Positions of the messages that match
#[must_use]
pub fn find_hits(matcher: &Matcher, messages: &[MessageView]) -> Vec<usize> {
    messages
        .iter()
        .enumerate()
        .filter(|(_, m)| matcher.is_hit(m.id, m.sender_id, &m.content))
        .map(|(i, _)| i)
        .collect()
}

/// Expand ascending hit positions by `context_size` and merge the windows
///
/// A window joins the previous range when it overlaps or touches it
/// (`start <= previous.end + 1`). `len` is the number of messages.
#[must_use]
pub fn merge_windows(hits: &[usize], len: usize, context_size: usize) -> Vec<HitRange> {
    let Some(last_index) = len.checked_sub(1) else {
        return Vec::new();
    };

    let mut ranges: Vec<HitRange> = Vec::new();
    for &hit in hits.iter().filter(|&&hit| hit < len) {
        let start = hit.saturating_sub(context_size);
        let end = hit.saturating_add(context_size).min(last_index);

        if let Some(previous) = ranges.last_mut() {
            if start <= previous.end + 1 {
                previous.end = previous.end.max(end);
                previous.hits.push(hit);
                continue;
            }
        }

        ranges.push(HitRange {
            start,
            end,
            hits: vec![hit],
        });
    }

    ranges
}

/// A contiguous run of messages around one or more hits
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextBlock {
    pub start_ts: i64,
    pub end_ts: i64,
    pub messages: Vec<MessageView>,
    /// Distinct hits merged into this block
    pub hit_count: usize,
}

/// Aggregate statistics of a filter result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FilterStats {
    /// Messages across all blocks
    pub total_messages: usize,
    /// Distinct hits
    pub hit_messages: usize,
    /// Characters of content across all blocks
    pub total_chars: usize,
}

/// Blocks plus statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FilterResult {
    pub blocks: Vec<ContextBlock>,
    pub stats: FilterStats,
}

impl FilterResult {
    /// Build a result from blocks, deriving message and character totals
    #[must_use]
    pub fn from_blocks(blocks: Vec<ContextBlock>, hit_messages: usize) -> Self {
        let total_messages = blocks.iter().map(|b| b.messages.len()).sum();
        let total_chars = blocks
            .iter()
            .flat_map(|b| &b.messages)
            .map(|m| m.content.chars().count())
            .sum();

        Self {
            blocks,
            stats: FilterStats {
                total_messages,
                hit_messages,
                total_chars,
            },
        }
    }

    /// Whether no block was produced
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Run matching, expansion and merging over an ordered message array
#[must_use]
pub fn filter_messages(
    messages: &[MessageView],
    criteria: &FilterCriteria,
    context_size: usize,
) -> FilterResult {
    let matcher = criteria.matcher();
    let hits = find_hits(&matcher, messages);
    if hits.is_empty() {
        return FilterResult::default();
    }

    let blocks = merge_windows(&hits, messages.len(), context_size)
        .into_iter()
        .map(|range| {
            let hit_set: HashSet<usize> = range.hits.iter().copied().collect();
            let block_messages: Vec<MessageView> = (range.start..=range.end)
                .map(|i| MessageView {
                    is_hit: hit_set.contains(&i),
                    ..messages[i].clone()
                })
                .collect();

            ContextBlock {
                start_ts: messages[range.start].timestamp,
                end_ts: messages[range.end].timestamp,
                messages: block_messages,
                hit_count: range.hits.len(),
            }
        })
        .collect();

    FilterResult::from_blocks(blocks, hits.len())
}

/// Filter engine bound to one archive
#[derive(Debug, Clone)]
pub struct ContextFilter {
    archive: Arc<Archive>,
}

impl ContextFilter {
    /// Create a filter engine for an archive
    #[must_use]
    pub const fn new(archive: Arc<Archive>) -> Self {
        Self { archive }
    }

    /// Filter messages and expand each hit into context
    ///
    /// Failures are logged and produce an empty result.
    #[must_use]
    pub fn filter(&self, criteria: &FilterCriteria, context_size: usize) -> FilterResult {
        match self.try_filter(criteria, context_size) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(archive = %self.archive.id(), error = %e, "context filter failed");
                FilterResult::default()
            }
        }
    }

    /// Surrounding context for specific messages
    #[must_use]
    pub fn message_context(&self, message_ids: &[i64], context_size: usize) -> FilterResult {
        if message_ids.is_empty() {
            return FilterResult::default();
        }
        let criteria = FilterCriteria::new().with_message_ids(message_ids.iter().copied());
        self.filter(&criteria, context_size)
    }

    /// Fallible form of [`filter`](Self::filter)
    ///
    /// # Errors
    ///
    /// Returns error if the archive cannot be read
    pub fn try_filter(&self, criteria: &FilterCriteria, context_size: usize) -> Result<FilterResult> {
        let messages = MessageRepo::new(Arc::clone(&self.archive)).views(criteria.time_range)?;
        let result = filter_messages(&messages, criteria, context_size);

        tracing::debug!(
            archive = %self.archive.id(),
            scanned = messages.len(),
            blocks = result.blocks.len(),
            hits = result.stats.hit_messages,
            "context filter complete"
        );
        Ok(result)
    }
}
