//! Database options.
//!
//! [`DatabaseOptions`] is plain serde data and can be kept in a YAML file
//! next to the database. Every field has a default, so a partial file is
//! valid.
//!
//! # Example YAML
//!
//! ```yaml
//! read_only: false
//! journal_mode: wal
//! busy_timeout_ms: 5000
//! default_cache_limit: 100
//! max_bound_variables: 999
//! debug:
//!   queries: true
//!   query_parameters: false
//!   changes: true
//! ```

use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// SQLite journal mode applied when a file database is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalMode {
    Delete,
    Truncate,
    Persist,
    Memory,
    #[default]
    Wal,
    Off,
}

impl JournalMode {
    pub fn as_str(self) -> &'static str {
        match self {
            JournalMode::Delete => "DELETE",
            JournalMode::Truncate => "TRUNCATE",
            JournalMode::Persist => "PERSIST",
            JournalMode::Memory => "MEMORY",
            JournalMode::Wal => "WAL",
            JournalMode::Off => "OFF",
        }
    }
}

/// Runtime diagnostics toggles. Each flag gates one family of `tracing`
/// events; all are off by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugLogging {
    /// Log the text of every statement.
    pub queries: bool,
    /// Include bound argument values in query logs.
    pub query_parameters: bool,
    /// Log every change record delivered on commit.
    pub changes: bool,
}

/// Options controlling how a database is opened and operated.
///
/// # Examples
///
/// ```
/// # use roost_sqlite::DatabaseOptions;
/// let options: DatabaseOptions = serde_yaml::from_str("default_cache_limit: 10").unwrap();
/// assert_eq!(options.default_cache_limit, 10);
/// assert_eq!(options.max_bound_variables, 999);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseOptions {
    /// Open the file read-only. Schema reconciliation will fail for tables
    /// that need changes.
    pub read_only: bool,
    /// Journal mode for file databases. Ignored for in-memory databases.
    pub journal_mode: JournalMode,
    /// How long a statement waits on a locked file before failing.
    pub busy_timeout_ms: u64,
    /// Per-table cache entry limit used until [`set_cache_limit`] overrides
    /// it. Zero disables caching.
    ///
    /// [`set_cache_limit`]: crate::Database::set_cache_limit
    pub default_cache_limit: usize,
    /// Largest number of bound variables one statement may use. Batched key
    /// reads are chunked to stay under it.
    pub max_bound_variables: usize,
    /// Initial diagnostics toggles.
    pub debug: DebugLogging,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            journal_mode: JournalMode::Wal,
            busy_timeout_ms: 5000,
            default_cache_limit: 100,
            max_bound_variables: 999,
            debug: DebugLogging::default(),
        }
    }
}

impl DatabaseOptions {
    /// Loads options from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns [`Io`](crate::SqliteError::Io) if the file cannot be read, or
    /// [`Config`](crate::SqliteError::Config) if parsing fails.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let reader = BufReader::new(file);
        let options = serde_yaml::from_reader(reader)?;
        Ok(options)
    }

    /// Saves the options as YAML.
    ///
    /// # Errors
    ///
    /// Returns [`Io`](crate::SqliteError::Io) if the file cannot be written,
    /// or [`Config`](crate::SqliteError::Config) if serialization fails.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = std::fs::File::create(path)?;
        let writer = BufWriter::new(file);
        serde_yaml::to_writer(writer, self)?;
        Ok(())
    }
}
