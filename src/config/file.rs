//! TOML configuration file loading
//!
//! Supports `~/.config/omni/chatlog/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::PathBuf;

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct ChatlogConfigFile {
    /// Directory holding archive files
    #[serde(default)]
    pub data_dir: Option<String>,

    /// Segmentation defaults
    #[serde(default)]
    pub sessions: SessionsFileConfig,

    /// Query defaults
    #[serde(default)]
    pub query: QueryFileConfig,
}

/// Segmentation configuration
#[derive(Debug, Default, Deserialize)]
pub struct SessionsFileConfig {
    /// Global gap threshold in seconds, used when an archive has none
    pub gap_threshold: Option<u32>,
}

/// Query configuration
#[derive(Debug, Default, Deserialize)]
pub struct QueryFileConfig {
    /// Sessions returned by a search
    pub search_limit: Option<usize>,
    /// Preview messages per searched session
    pub preview_count: Option<usize>,
    /// Messages returned for one session
    pub session_messages_limit: Option<usize>,
    /// Context messages on each side of a filter hit
    pub context_size: Option<usize>,
}

/// Parse config file contents
///
/// # Errors
///
/// Returns error if the contents are not valid TOML for this schema
pub fn parse_config_file(content: &str) -> crate::Result<ChatlogConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Load the TOML config file from the standard path
///
/// Returns `ChatlogConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> ChatlogConfigFile {
    let Some(path) = config_file_path() else {
        return ChatlogConfigFile::default();
    };

    if !path.exists() {
        return ChatlogConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match parse_config_file(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                ChatlogConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            ChatlogConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/omni/chatlog/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("omni")
            .join("chatlog")
            .join("config.toml")
    })
}
