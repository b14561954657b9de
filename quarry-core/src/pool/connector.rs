use std::fmt;

use async_trait::async_trait;
use serde::Serialize;

/// Classification that decides what happens to the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbErrorKind {
    /// Opening a connection failed.
    Connect,
    /// The statement failed; the connection is still usable.
    Query,
    /// The connection is no longer trustworthy (reset, I/O, protocol).
    ConnectionBroken,
}

/// Backend failure reported by a [`Connector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbError {
    /// Failure class.
    pub kind: DbErrorKind,
    /// Backend message.
    pub message: String,
}

impl DbError {
    /// Connect failure.
    pub fn connect(message: impl Into<String>) -> Self {
        Self {
            kind: DbErrorKind::Connect,
            message: message.into(),
        }
    }

    /// Statement failure.
    pub fn query(message: impl Into<String>) -> Self {
        Self {
            kind: DbErrorKind::Query,
            message: message.into(),
        }
    }

    /// Broken connection.
    pub fn broken(message: impl Into<String>) -> Self {
        Self {
            kind: DbErrorKind::ConnectionBroken,
            message: message.into(),
        }
    }

    /// The handle must be discarded.
    pub fn is_connection_broken(&self) -> bool {
        self.kind == DbErrorKind::ConnectionBroken
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for DbError {}

/// Tabular result of one statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    /// Column names.
    pub columns: Vec<String>,
    /// Rows as JSON values, in column order.
    pub rows: Vec<Vec<serde_json::Value>>,
    /// Number of rows returned.
    pub row_count: usize,
    /// Rows beyond the configured cap were dropped.
    pub truncated: bool,
}

/// Opens and drives backend connections on behalf of the pool.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Backend connection handle.
    type Connection: Send + 'static;

    /// Open a new connection.
    async fn connect(&self) -> Result<Self::Connection, DbError>;

    /// Create the tenant's namespace if it does not exist yet.
    async fn ensure_namespace(
        &self,
        conn: &mut Self::Connection,
        namespace: &str,
    ) -> Result<(), DbError>;

    /// Run `sql` with `namespace` as the default schema, keeping at most
    /// `max_rows` rows.
    async fn execute(
        &self,
        conn: &mut Self::Connection,
        namespace: &str,
        sql: &str,
        max_rows: usize,
    ) -> Result<QueryResult, DbError>;
}
