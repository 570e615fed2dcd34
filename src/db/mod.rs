//! Archive storage: one `SQLite` file per conversation
//!
//! Reads go through a cached pool of `query_only` connections. Every write
//! path drops that pool before opening its own write connection, so a stale
//! reader can neither observe a pre-rebuild state nor contend with the writer.

pub mod message;
mod schema;
pub mod session;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};

use crate::{Error, Result};

pub use message::{
    Member, Message, MessageRepo, MessageView, TimeRange, display_name, parse_aliases,
};
pub use schema::SCHEMA_VERSION;
pub use session::{
    ChatSession, DEFAULT_GAP_THRESHOLD, IndexStats, SessionIndex, SessionListItem,
};

/// Read connection pool for one archive
pub type DbPool = Pool<SqliteConnectionManager>;

/// Pooled read connection
pub type DbConn = PooledConnection<SqliteConnectionManager>;

/// How long a connection waits on a locked archive
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Cached read connections per archive
const READ_POOL_SIZE: u32 = 2;

/// File extension used for archives inside the data directory
pub const ARCHIVE_EXTENSION: &str = "db";

/// Handle to a single chat archive
pub struct Archive {
    id: String,
    path: PathBuf,
    reader: Mutex<Option<DbPool>>,
}

impl fmt::Debug for Archive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Archive")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Archive {
    /// Create a handle for an existing archive file
    ///
    /// Nothing is opened until the first read or write.
    #[must_use]
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            reader: Mutex::new(None),
        }
    }

    /// Create a new archive file with an empty message store and index
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be created or initialized
    pub fn create(id: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self> {
        let archive = Self::new(id, path);

        if let Some(parent) = archive.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&archive.path)
            .map_err(|e| Error::StorageUnavailable(format!("{}: {e}", archive.path.display())))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        schema::init(&conn)?;

        tracing::info!(
            archive = %archive.id,
            path = %archive.path.display(),
            version = SCHEMA_VERSION,
            "archive created"
        );
        Ok(archive)
    }

    /// Archive identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Path of the archive file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get a read connection, building the cached pool on first use
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageUnavailable`] if the archive cannot be opened
    pub fn reader(&self) -> Result<DbConn> {
        let pool = {
            let mut cached = self.reader.lock();
            match cached.as_ref() {
                Some(pool) => pool.clone(),
                None => {
                    let pool = self.build_reader()?;
                    *cached = Some(pool.clone());
                    pool
                }
            }
        };

        pool.get()
            .map_err(|e| Error::StorageUnavailable(format!("{}: {e}", self.path.display())))
    }

    /// Drop the cached read pool
    ///
    /// Connections already checked out stay valid until they are returned.
    pub fn close_reader(&self) {
        if self.reader.lock().take().is_some() {
            tracing::debug!(archive = %self.id, "closed cached reader");
        }
    }

    /// Open an exclusive write connection
    ///
    /// The cached reader is always closed first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageUnavailable`] if the archive cannot be opened
    /// for writing
    pub fn writer(&self) -> Result<Connection> {
        self.close_reader();

        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| Error::StorageUnavailable(format!("{}: {e}", self.path.display())))?;

        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })
        .map_err(|e| Error::StorageUnavailable(format!("{}: {e}", self.path.display())))?;

        Ok(conn)
    }

    fn build_reader(&self) -> Result<DbPool> {
        // The pool retries failed connects until its timeout, so fail fast here
        if !self.path.is_file() {
            return Err(Error::StorageUnavailable(format!(
                "{}: no such archive",
                self.path.display()
            )));
        }

        let manager = SqliteConnectionManager::file(&self.path)
            .with_flags(
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .with_init(|conn| {
                conn.busy_timeout(BUSY_TIMEOUT)?;
                conn.pragma_update(None, "query_only", true)
            });

        let pool = Pool::builder()
            .max_size(READ_POOL_SIZE)
            .connection_timeout(BUSY_TIMEOUT)
            .build(manager)
            .map_err(|e| Error::StorageUnavailable(format!("{}: {e}", self.path.display())))?;

        tracing::debug!(archive = %self.id, "opened cached reader");
        Ok(pool)
    }
}

/// Registry of archives stored under a data directory
///
/// Keeps one [`Archive`] handle per id so every caller shares the same cached
/// reader, which write paths can then reliably invalidate.
pub struct Archives {
    data_dir: PathBuf,
    open: Mutex<HashMap<String, Arc<Archive>>>,
}

impl fmt::Debug for Archives {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Archives")
            .field("data_dir", &self.data_dir)
            .finish_non_exhaustive()
    }
}

impl Archives {
    /// Create a registry rooted at `data_dir`
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Data directory holding the archive files
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// File path for an archive id
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the id is empty or would escape
    /// the data directory
    pub fn path_for(&self, id: &str) -> Result<PathBuf> {
        validate_id(id)?;
        Ok(self.data_dir.join(format!("{id}.{ARCHIVE_EXTENSION}")))
    }

    /// Get the shared handle for an archive
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the id is not usable
    pub fn get(&self, id: &str) -> Result<Arc<Archive>> {
        let path = self.path_for(id)?;
        let mut open = self.open.lock();
        let archive = open
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Archive::new(id, path)));
        Ok(Arc::clone(archive))
    }

    /// Create a new archive file and register it
    ///
    /// # Errors
    ///
    /// Returns error if the id is not usable or the file cannot be created
    pub fn create(&self, id: &str) -> Result<Arc<Archive>> {
        let path = self.path_for(id)?;
        let archive = Arc::new(Archive::create(id, path)?);
        let previous = self.open.lock().insert(id.to_string(), Arc::clone(&archive));
        if let Some(previous) = previous {
            previous.close_reader();
        }
        Ok(archive)
    }

    /// Release the handle for an archive, closing its cached reader
    pub fn close(&self, id: &str) {
        if let Some(archive) = self.open.lock().remove(id) {
            archive.close_reader();
        }
    }

    /// List archive ids present in the data directory
    ///
    /// # Errors
    ///
    /// Returns error if the data directory cannot be read
    pub fn list(&self) -> Result<Vec<String>> {
        if !self.data_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut ids: Vec<String> = std::fs::read_dir(&self.data_dir)?
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .is_some_and(|ext| ext == ARCHIVE_EXTENSION)
            })
            .filter_map(|path| path.file_stem().and_then(|s| s.to_str()).map(String::from))
            .collect();
        ids.sort();
        Ok(ids)
    }
}

/// Run a read against the archive, degrading to `default` on failure
///
/// A missing schema is the normal "not yet indexed" state and is only logged
/// at debug level; anything else is a warning.
pub(crate) fn read_or<T>(
    archive: &Archive,
    what: &'static str,
    default: T,
    read: impl FnOnce(&Connection) -> Result<T>,
) -> T {
    match archive.reader().and_then(|conn| read(&conn)) {
        Ok(value) => value,
        Err(e) if e.is_schema_missing() => {
            tracing::debug!(archive = %archive.id, what, "index tables not present");
            default
        }
        Err(e) => {
            tracing::warn!(archive = %archive.id, what, error = %e, "archive read failed");
            default
        }
    }
}

fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\']) {
        return Err(Error::InvalidArgument(format!("invalid archive id: {id:?}")));
    }
    Ok(())
}
