//! PostgreSQL-wire backend.

use std::{fmt, str::FromStr};

use async_trait::async_trait;
use futures::TryStreamExt;
use serde_json::Value;
use sqlx::{
    Column, ConnectOptions, Executor, Row, TypeInfo,
    postgres::{PgConnectOptions, PgConnection, PgRow},
};

use super::connector::{Connector, DbError, QueryResult};

/// PostgreSQL backend over plain `sqlx` connections.
#[derive(Clone)]
pub struct PgConnector {
    options: PgConnectOptions,
}

impl fmt::Debug for PgConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgConnector")
            .field("host", &self.options.get_host())
            .field("port", &self.options.get_port())
            .field("database", &self.options.get_database())
            .finish_non_exhaustive()
    }
}

impl PgConnector {
    /// Connector for a `postgres://` URL.
    pub fn new(url: &str) -> Result<Self, DbError> {
        let options = PgConnectOptions::from_str(url)
            .map_err(|e| DbError::connect(format!("invalid database url: {e}")))?;
        Ok(Self { options })
    }

    /// Connector from prepared connect options.
    pub fn from_options(options: PgConnectOptions) -> Self {
        Self { options }
    }

    /// Connection settings taken from the libpq `PG*` environment variables.
    pub fn from_env() -> Self {
        Self::from_options(PgConnectOptions::new())
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Connection = PgConnection;

    async fn connect(&self) -> Result<PgConnection, DbError> {
        self.options
            .connect()
            .await
            .map_err(|e| DbError::connect(e.to_string()))
    }

    async fn ensure_namespace(
        &self,
        conn: &mut PgConnection,
        namespace: &str,
    ) -> Result<(), DbError> {
        let statement =
            format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(namespace));
        conn.execute(sqlx::raw_sql(&statement))
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn execute(
        &self,
        conn: &mut PgConnection,
        namespace: &str,
        sql: &str,
        max_rows: usize,
    ) -> Result<QueryResult, DbError> {
        let search_path = format!("SET search_path TO {}", quote_ident(namespace));
        conn.execute(sqlx::raw_sql(&search_path))
            .await
            .map_err(classify)?;

        let mut result = QueryResult::default();
        let mut rows = conn.fetch(sqlx::query(sql));

        while let Some(row) = rows.try_next().await.map_err(classify)? {
            if result.columns.is_empty() {
                result.columns = row
                    .columns()
                    .iter()
                    .map(|c| c.name().to_string())
                    .collect();
            }
            if result.rows.len() == max_rows {
                result.truncated = true;
                break;
            }
            result.rows.push(decode_row(&row));
        }

        result.row_count = result.rows.len();
        Ok(result)
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Statement-level failures keep the connection; anything else means the
/// session state can no longer be trusted.
fn classify(err: sqlx::Error) -> DbError {
    match err {
        sqlx::Error::Database(_)
        | sqlx::Error::RowNotFound
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_) => DbError::query(err.to_string()),
        other => DbError::broken(other.to_string()),
    }
}

fn decode_row(row: &PgRow) -> Vec<Value> {
    (0..row.len()).map(|idx| decode_value(row, idx)).collect()
}

fn decode_value(row: &PgRow, idx: usize) -> Value {
    let type_name = row.column(idx).type_info().name().to_ascii_uppercase();

    match type_name.as_str() {
        "INT2" => to_json(row.try_get::<Option<i16>, _>(idx)),
        "INT4" => to_json(row.try_get::<Option<i32>, _>(idx)),
        "INT8" => to_json(row.try_get::<Option<i64>, _>(idx)),
        "FLOAT4" => to_json(row.try_get::<Option<f32>, _>(idx)),
        "FLOAT8" => to_json(row.try_get::<Option<f64>, _>(idx)),
        "BOOL" => to_json(row.try_get::<Option<bool>, _>(idx)),
        "JSON" | "JSONB" => row
            .try_get::<Option<Value>, _>(idx)
            .ok()
            .flatten()
            .unwrap_or(Value::Null),
        "TIMESTAMPTZ" => to_json(
            row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx)
                .map(|v| v.map(|ts| ts.to_rfc3339())),
        ),
        "TIMESTAMP" => to_json(
            row.try_get::<Option<chrono::NaiveDateTime>, _>(idx)
                .map(|v| v.map(|ts| ts.to_string())),
        ),
        "DATE" => to_json(
            row.try_get::<Option<chrono::NaiveDate>, _>(idx)
                .map(|v| v.map(|d| d.to_string())),
        ),
        "UUID" => to_json(
            row.try_get::<Option<uuid::Uuid>, _>(idx)
                .map(|v| v.map(|u| u.to_string())),
        ),
        _ => to_json(row.try_get::<Option<String>, _>(idx)),
    }
}

fn to_json<T: Into<Value>>(decoded: Result<Option<T>, sqlx::Error>) -> Value {
    decoded
        .ok()
        .flatten()
        .map(Into::into)
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_identifiers() {
        assert_eq!(quote_ident("learner_1"), "\"learner_1\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn database_errors_keep_the_connection() {
        let broken = classify(sqlx::Error::PoolTimedOut);
        assert!(broken.is_connection_broken());

        let missing = classify(sqlx::Error::RowNotFound);
        assert!(!missing.is_connection_broken());
    }

    fn assert_connector<C: super::Connector>() {}

    #[test]
    fn postgres_backend_plugs_into_the_pool() {
        assert_connector::<PgConnector>();
        let connector = PgConnector::new("postgres://quarry@localhost/quarry").expect("url");
        let pool = crate::pool::ConnectionPool::new(connector, crate::PoolSettings::default());
        assert_eq!(pool.stats().live, 0);
    }

    #[test]
    fn rejects_malformed_urls() {
        assert!(PgConnector::new("not a url").is_err());
        assert!(PgConnector::new("postgres://user@localhost:5432/quarry").is_ok());
    }
}
