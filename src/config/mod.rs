//! Configuration management for chat archive indexing

pub mod file;

use std::path::PathBuf;

use crate::db::DEFAULT_GAP_THRESHOLD;
use crate::filter::DEFAULT_CONTEXT_SIZE;
use crate::query::{DEFAULT_PREVIEW_COUNT, DEFAULT_SEARCH_LIMIT, DEFAULT_SESSION_MESSAGES_LIMIT};
use crate::{Error, Result};

use file::ChatlogConfigFile;

/// Indexer configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Path to data directory holding one archive file per conversation
    pub data_dir: PathBuf,

    /// Caller-overridable defaults
    pub defaults: QueryDefaults,
}

/// Default parameters for segmentation and queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryDefaults {
    /// Gap threshold in seconds when an archive has none of its own
    pub gap_threshold: u32,

    /// Sessions returned by a search
    pub search_limit: usize,

    /// Preview messages per searched session
    pub preview_count: usize,

    /// Messages returned for one session
    pub session_messages_limit: usize,

    /// Context messages on each side of a filter hit
    pub context_size: usize,
}

impl Default for QueryDefaults {
    fn default() -> Self {
        Self {
            gap_threshold: DEFAULT_GAP_THRESHOLD,
            search_limit: DEFAULT_SEARCH_LIMIT,
            preview_count: DEFAULT_PREVIEW_COUNT,
            session_messages_limit: DEFAULT_SESSION_MESSAGES_LIMIT,
            context_size: DEFAULT_CONTEXT_SIZE,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            defaults: QueryDefaults::default(),
        }
    }
}

/// Default data directory: `~/.local/share/omni/chatlog` on Linux
fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".local/share/omni/chatlog"),
        |d| d.data_dir().join("omni").join("chatlog"),
    )
}

impl Config {
    /// Load configuration (env > toml > default)
    ///
    /// # Errors
    ///
    /// Returns error if an environment override cannot be parsed
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Build configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if an environment override cannot be parsed
    pub fn from_sources(
        fc: ChatlogConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let fallback = QueryDefaults::default();

        let data_dir = env("CHATLOG_DATA_DIR")
            .or(fc.data_dir)
            .map_or_else(default_data_dir, PathBuf::from);

        let defaults = QueryDefaults {
            gap_threshold: parse_env(&env, "CHATLOG_GAP_THRESHOLD")?
                .or(fc.sessions.gap_threshold)
                .unwrap_or(fallback.gap_threshold),
            search_limit: parse_env(&env, "CHATLOG_SEARCH_LIMIT")?
                .or(fc.query.search_limit)
                .unwrap_or(fallback.search_limit),
            preview_count: parse_env(&env, "CHATLOG_PREVIEW_COUNT")?
                .or(fc.query.preview_count)
                .unwrap_or(fallback.preview_count),
            session_messages_limit: parse_env(&env, "CHATLOG_SESSION_MESSAGES_LIMIT")?
                .or(fc.query.session_messages_limit)
                .unwrap_or(fallback.session_messages_limit),
            context_size: parse_env(&env, "CHATLOG_CONTEXT_SIZE")?
                .or(fc.query.context_size)
                .unwrap_or(fallback.context_size),
        };

        if defaults.search_limit == 0 {
            return Err(Error::Config("search limit must be at least 1".to_string()));
        }

        tracing::debug!(data_dir = %data_dir.display(), ?defaults, "configuration resolved");
        Ok(Self { data_dir, defaults })
    }
}

fn parse_env<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    env(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|_| Error::Config(format!("{key} has invalid value {raw:?}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_sources(ChatlogConfigFile::default(), env_from(&[])).unwrap();
        assert_eq!(config.defaults, QueryDefaults::default());
        assert_eq!(config.defaults.gap_threshold, 1800);
        assert_eq!(config.defaults.preview_count, 5);
    }

    #[test]
    fn test_env_overrides_file() {
        let fc = file::parse_config_file(
            r#"
            data_dir = "/from/file"
            [sessions]
            gap_threshold = 900
            [query]
            context_size = 4
            "#,
        )
        .unwrap();

        let config = Config::from_sources(
            fc,
            env_from(&[("CHATLOG_GAP_THRESHOLD", "60"), ("CHATLOG_DATA_DIR", "/from/env")]),
        )
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/from/env"));
        assert_eq!(config.defaults.gap_threshold, 60);
        assert_eq!(config.defaults.context_size, 4);
        assert_eq!(config.defaults.search_limit, DEFAULT_SEARCH_LIMIT);
    }

    #[test]
    fn test_invalid_env_value() {
        let err = Config::from_sources(
            ChatlogConfigFile::default(),
            env_from(&[("CHATLOG_GAP_THRESHOLD", "-5")]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
