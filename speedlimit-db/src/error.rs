//! Structured error type for speedlimit-db.
//!
//! Driver failures are carried through untouched so callers see the
//! database's own message. Everything else is a configuration or decoding
//! problem raised by this crate.

use thiserror::Error;

use crate::config::DISABLE_POOLING_VAR;

/// Main error type for connection management and queries
#[derive(Error, Debug)]
pub enum DbError {
    /// A shared pool was requested but pooling was not compiled in
    #[error(
        "connection pooling is not available in this build. \
         Enable the `pool` feature of speedlimit-db or set {}=1.",
        DISABLE_POOLING_VAR
    )]
    PoolingUnavailable,

    /// The connection URL from the environment could not be parsed
    #[error("invalid database URL in {var}: {source}")]
    InvalidUrl {
        var: &'static str,
        #[source]
        source: sqlx::Error,
    },

    /// The background runtime that owns the shared pool could not start
    #[error("failed to start the connection pool runtime: {source}")]
    Runtime {
        #[source]
        source: std::io::Error,
    },

    /// Connection, query, commit or rollback failure reported by the driver
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// A result column has a type this crate cannot turn into a JSON value
    #[error("column '{column}' has unsupported type {type_name}; cast it to text in the query")]
    UnsupportedColumn { column: String, type_name: String },

    /// Autocommit cannot change while a transaction is open
    #[error("cannot change autocommit while a transaction is in progress")]
    AutocommitInTransaction,

    /// A scalar could not be converted into the requested Rust type
    #[error("failed to decode scalar value: {source}")]
    Decode {
        #[from]
        source: serde_json::Error,
    },
}

/// Result type alias for speedlimit-db operations
pub type DbResult<T> = std::result::Result<T, DbError>;

impl DbError {
    /// Create an unsupported column error
    pub fn unsupported_column(column: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self::UnsupportedColumn {
            column: column.into(),
            type_name: type_name.into(),
        }
    }

    /// True when the error came from the driver rather than from this crate
    pub fn is_database(&self) -> bool {
        matches!(self, DbError::Database(_))
    }
}
