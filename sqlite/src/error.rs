//! Error types for database operations.
//!
//! Engine failures are classified by their extended result code so callers
//! can branch on syntax errors, constraint failures and unique-key conflicts
//! without inspecting message text.

use std::path::PathBuf;

use roost_core::{DecodeError, DefinitionError};
use rusqlite::ffi;
use thiserror::Error;

/// Failures while reconciling a table with its declaration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    /// A non-null column without a default cannot be added to a table that
    /// already holds rows.
    #[error("table '{table}': non-null column '{column}' needs a default to be added")]
    ColumnRequiresDefault { table: String, column: String },

    /// A migration step failed; the whole plan was rolled back.
    #[error("table '{table}': migration failed: {message}")]
    Migration { table: String, message: String },

    /// The full-text index could not be created or synchronized.
    #[error("table '{table}': full-text index failed: {message}")]
    FullText { table: String, message: String },
}

impl SchemaError {
    /// The table the error refers to.
    pub fn table(&self) -> &str {
        match self {
            SchemaError::ColumnRequiresDefault { table, .. }
            | SchemaError::Migration { table, .. }
            | SchemaError::FullText { table, .. } => table,
        }
    }
}

/// Errors that can occur during database operations.
#[derive(Debug, Error)]
pub enum SqliteError {
    /// Malformed SQL or a reference to a missing table or column.
    #[error("SQL error: {0}")]
    Syntax(String),

    /// A check, not-null or foreign-key constraint failed.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// A unique or primary-key constraint failed.
    #[error("unique constraint failed: {0}")]
    UniqueConstraintFailed(String),

    /// Schema reconciliation failed.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// The database was closed.
    #[error("database connection is closed")]
    ConnectionClosed,

    /// Another database in this process already owns the file.
    #[error("database file is already open: {}", .0.display())]
    FileAlreadyOpen(PathBuf),

    /// Wrong number of arguments, or an unknown parameter name.
    #[error("argument binding error: {0}")]
    ArgumentBinding(String),

    /// A row could not be decoded into a model.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A table definition is structurally invalid.
    #[error("invalid table definition: {0}")]
    Definition(#[from] DefinitionError),

    /// Any other engine failure.
    #[error("database error: {0}")]
    Database(rusqlite::Error),

    /// Filesystem failure (options files, database paths).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Options file could not be parsed or written.
    #[error("configuration error: {0}")]
    Config(#[from] serde_yaml::Error),
}

impl From<rusqlite::Error> for SqliteError {
    fn from(err: rusqlite::Error) -> Self {
        let failure = match &err {
            rusqlite::Error::SqliteFailure(failure, message) => Some((failure, message.clone())),
            rusqlite::Error::SqlInputError { error, msg, .. } => Some((error, Some(msg.clone()))),
            _ => None,
        };
        if let Some((failure, message)) = failure {
            let detail = message.unwrap_or_else(|| failure.to_string());
            let extended = failure.extended_code;
            if extended == ffi::SQLITE_CONSTRAINT_UNIQUE
                || extended == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
            {
                return SqliteError::UniqueConstraintFailed(detail);
            }
            if failure.code == rusqlite::ErrorCode::ConstraintViolation {
                return SqliteError::ConstraintViolation(detail);
            }
            if extended & 0xff == ffi::SQLITE_ERROR {
                return SqliteError::Syntax(detail);
            }
        }
        if matches!(
            err,
            rusqlite::Error::InvalidParameterCount(..) | rusqlite::Error::InvalidParameterName(_)
        ) {
            return SqliteError::ArgumentBinding(err.to_string());
        }
        SqliteError::Database(err)
    }
}

/// Convenience alias for results with [`SqliteError`].
pub type Result<T> = std::result::Result<T, SqliteError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn failing(sql: &str) -> SqliteError {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE, n INTEGER CHECK (n > 0));
             INSERT INTO t VALUES (1, 'a', 1);",
        )
        .unwrap();
        conn.execute_batch(sql).unwrap_err().into()
    }

    #[test]
    fn test_syntax_errors() {
        assert!(matches!(failing("SELEC 1"), SqliteError::Syntax(_)));
        assert!(matches!(failing("SELECT * FROM missing"), SqliteError::Syntax(_)));
    }

    #[test]
    fn test_unique_and_primary_key_conflicts() {
        assert!(matches!(
            failing("INSERT INTO t VALUES (2, 'a', 1)"),
            SqliteError::UniqueConstraintFailed(_)
        ));
        assert!(matches!(
            failing("INSERT INTO t VALUES (1, 'b', 1)"),
            SqliteError::UniqueConstraintFailed(_)
        ));
    }

    #[test]
    fn test_other_constraints() {
        assert!(matches!(
            failing("INSERT INTO t VALUES (2, 'b', 0)"),
            SqliteError::ConstraintViolation(_)
        ));
        assert!(matches!(
            failing("INSERT INTO t VALUES (2, NULL, 1)"),
            SqliteError::ConstraintViolation(_)
        ));
    }

    #[test]
    fn test_schema_error_names_table() {
        let err = SchemaError::ColumnRequiresDefault {
            table: "posts".into(),
            column: "body".into(),
        };
        assert_eq!(err.table(), "posts");
        assert!(SqliteError::from(err).to_string().contains("'body'"));
    }
}
