//! Error types for chat archive indexing

use thiserror::Error;

/// Result type alias for archive operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while indexing or querying an archive
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Archive file cannot be opened
    #[error("archive unavailable: {0}")]
    StorageUnavailable(String),

    /// Expected tables or columns are absent
    #[error("schema missing: {0}")]
    SchemaMissing(String),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller supplied a value the operation cannot use
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Classify a `SQLite` failure
    ///
    /// Missing tables and columns become [`Error::SchemaMissing`]; every other
    /// failure is kept as [`Error::Sqlite`].
    #[must_use]
    pub fn from_sqlite(err: rusqlite::Error) -> Self {
        if is_missing_schema(&err) {
            return Self::SchemaMissing(err.to_string());
        }
        Self::Sqlite(err)
    }

    /// Whether this error means the index has not been initialized yet
    #[must_use]
    pub const fn is_schema_missing(&self) -> bool {
        matches!(self, Self::SchemaMissing(_))
    }
}

// Prepare failures surface either as `SqliteFailure` or `SqlInputError`
// depending on the linked SQLite, so match on the rendered message.
fn is_missing_schema(err: &rusqlite::Error) -> bool {
    let msg = err.to_string();
    msg.contains("no such table") || msg.contains("no such column")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_table_is_schema_missing() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let err = conn
            .query_row("SELECT COUNT(*) FROM chat_session", [], |row| {
                row.get::<_, i64>(0)
            })
            .unwrap_err();

        assert!(Error::from_sqlite(err).is_schema_missing());
    }

    #[test]
    fn test_other_failures_stay_sqlite() {
        let err = rusqlite::Error::QueryReturnedNoRows;
        assert!(matches!(Error::from_sqlite(err), Error::Sqlite(_)));
    }
}
