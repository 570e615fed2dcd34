//! Chatlog Index - Session segmentation and context filtering for chat archives
//!
//! This library derives two capabilities from a chronologically ordered
//! archive of chat messages (one SQLite file per conversation):
//! - Session segmentation with a time-gap heuristic, persisted as an index
//! - Keyword and sender filtering with context windows merged into blocks
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                     Callers                          │
//! │        CLI  │  Tool dispatch  │  Library users       │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │   Segmenter  │  Session Index  │  Query  │  Filter   │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │        Archive (SQLite file, cached read pool)       │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod filter;
pub mod query;
pub mod segment;
pub mod tools;

pub use config::{Config, QueryDefaults};
pub use db::{Archive, Archives, DbPool, IndexStats, SessionIndex, TimeRange};
pub use error::{Error, Result};
pub use filter::{ContextFilter, FilterCriteria, FilterResult};
pub use query::{SessionQuery, SessionSearch};
pub use segment::Segmenter;
pub use tools::SessionTools;
