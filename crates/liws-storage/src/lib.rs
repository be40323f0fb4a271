//! Warehouse store abstraction over sqlx, plus HTTP fetch utilities for LIWS.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use liws_core::{FieldValue, NamedParam, Params, SqlType};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqlitePoolOptions, SqliteRow};
use sqlx::{PgPool, Postgres, Row as _, Sqlite, SqlitePool};
use thiserror::Error;
use tracing::debug;

pub mod http;

pub use http::{BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher, RetryDisposition};

pub const CRATE_NAME: &str = "liws-storage";

/// One result row, columns in select-list order.
pub type Row = Vec<FieldValue>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unsupported database url `{0}` (expected postgres:// or sqlite:)")]
    UnsupportedUrl(String),
    #[error("statement references unbound parameter :{0}")]
    MissingParam(String),
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error(transparent)]
    Sqlx(sqlx::Error),
}

impl StoreError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return StoreError::UniqueViolation(db_err.message().to_string());
            }
        }
        StoreError::Sqlx(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    pub fn from_url(url: &str) -> Option<Self> {
        let lower = url.to_ascii_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Dialect::Postgres)
        } else if lower.starts_with("sqlite:") {
            Some(Dialect::Sqlite)
        } else {
            None
        }
    }
}

/// SQL sink used by the reconciliation engine. Statements use `:name` placeholders.
///
/// One store is one logical session; callers issue statements strictly one at a time.
#[async_trait]
pub trait Store: Send + Sync {
    fn dialect(&self) -> Dialect;

    async fn query(&self, sql: &str, params: &Params) -> Result<Vec<Row>, StoreError>;

    /// Runs a statement and returns the number of affected rows.
    async fn execute(&self, sql: &str, params: &Params) -> Result<u64, StoreError>;

    /// Catalog lookup of table names matching a SQL `LIKE` pattern, case-insensitively.
    async fn table_names(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    async fn close(&self);
}

/// Opens the store named by `database_url` with a single pooled connection.
pub async fn connect_store(database_url: &str) -> Result<Box<dyn Store>, StoreError> {
    match Dialect::from_url(database_url) {
        Some(Dialect::Postgres) => Ok(Box::new(PgStore::connect(database_url).await?)),
        Some(Dialect::Sqlite) => Ok(Box::new(SqliteStore::connect(database_url).await?)),
        None => Err(StoreError::UnsupportedUrl(redact_url(database_url))),
    }
}

/// Hides the password component of a connection url.
pub fn redact_url(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            if url[..colon_pos].contains("://") && !url[..colon_pos].ends_with('/') {
                return format!("{}****{}", &url[..colon_pos + 1], &url[at_pos..]);
            }
        }
    }
    url.to_string()
}

/// Statement text rewritten to positional placeholders, with the parameter bound at each position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionalSql {
    pub sql: String,
    pub bind_order: Vec<String>,
}

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Rewrites `:name` placeholders for the given dialect.
///
/// Postgres gets `$n` with one slot per distinct name; SQLite gets a bare `?` per occurrence.
/// Quoted literals and `::` casts are left alone.
pub fn rewrite_named_params(sql: &str, dialect: Dialect) -> PositionalSql {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut bind_order: Vec<String> = Vec::new();
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut in_literal = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '\'' {
            in_literal = !in_literal;
            out.push(c);
            i += 1;
            continue;
        }
        if in_literal || c != ':' {
            out.push(c);
            i += 1;
            continue;
        }
        if chars.get(i + 1) == Some(&':') {
            out.push_str("::");
            i += 2;
            continue;
        }
        let prev_is_colon = i > 0 && chars[i - 1] == ':';
        match chars.get(i + 1) {
            Some(&next) if is_name_start(next) && !prev_is_colon => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && is_name_char(chars[end]) {
                    end += 1;
                }
                let name: String = chars[start..end].iter().collect();
                let key = name.to_ascii_lowercase();
                match dialect {
                    Dialect::Postgres => {
                        let slot = match slots.get(&key) {
                            Some(slot) => *slot,
                            None => {
                                bind_order.push(name);
                                slots.insert(key, bind_order.len());
                                bind_order.len()
                            }
                        };
                        out.push('$');
                        out.push_str(&slot.to_string());
                    }
                    Dialect::Sqlite => {
                        bind_order.push(name);
                        out.push('?');
                    }
                }
                i = end;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    PositionalSql {
        sql: out,
        bind_order,
    }
}

fn ordered_params<'a>(
    bind_order: &[String],
    params: &'a Params,
) -> Result<Vec<&'a NamedParam>, StoreError> {
    bind_order
        .iter()
        .map(|name| {
            params
                .get(name)
                .ok_or_else(|| StoreError::MissingParam(name.clone()))
        })
        .collect()
}

fn bind_pg<'q>(
    query: Query<'q, Postgres, PgArguments>,
    param: &NamedParam,
) -> Query<'q, Postgres, PgArguments> {
    match (&param.value, param.sql_type) {
        (FieldValue::Text(s), _) => query.bind(s.clone()),
        (FieldValue::Integer(n), _) => query.bind(*n),
        (FieldValue::Float(n), _) => query.bind(*n),
        (FieldValue::Timestamp(t), _) => query.bind(*t),
        (FieldValue::Null, SqlType::BigInt) => query.bind(None::<i64>),
        (FieldValue::Null, SqlType::Numeric) => query.bind(None::<f64>),
        (FieldValue::Null, SqlType::Text) => query.bind(None::<String>),
        (FieldValue::Null, SqlType::Timestamp) => query.bind(None::<NaiveDateTime>),
    }
}

fn bind_sqlite<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    param: &NamedParam,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match (&param.value, param.sql_type) {
        (FieldValue::Text(s), _) => query.bind(s.clone()),
        (FieldValue::Integer(n), _) => query.bind(*n),
        (FieldValue::Float(n), _) => query.bind(*n),
        (FieldValue::Timestamp(t), _) => query.bind(*t),
        (FieldValue::Null, SqlType::BigInt) => query.bind(None::<i64>),
        (FieldValue::Null, SqlType::Numeric) => query.bind(None::<f64>),
        (FieldValue::Null, SqlType::Text) => query.bind(None::<String>),
        (FieldValue::Null, SqlType::Timestamp) => query.bind(None::<NaiveDateTime>),
    }
}

fn pg_row_values(row: &PgRow) -> Row {
    (0..row.len())
        .map(|idx| {
            if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
                return v.into();
            }
            if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
                return v.map(FieldValue::Integer).unwrap_or(FieldValue::Null);
            }
            if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
                return v
                    .map(|n| FieldValue::Integer(i64::from(n)))
                    .unwrap_or(FieldValue::Null);
            }
            if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
                return v.map(FieldValue::Float).unwrap_or(FieldValue::Null);
            }
            if let Ok(v) = row.try_get::<Option<NaiveDateTime>, _>(idx) {
                return v.into();
            }
            FieldValue::Null
        })
        .collect()
}

fn sqlite_row_values(row: &SqliteRow) -> Row {
    (0..row.len())
        .map(|idx| {
            if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
                return v.map(FieldValue::Integer).unwrap_or(FieldValue::Null);
            }
            if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
                return v.map(FieldValue::Float).unwrap_or(FieldValue::Null);
            }
            if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
                return v.into();
            }
            FieldValue::Null
        })
        .collect()
}

/// Postgres warehouse over a one-connection sqlx pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl Store for PgStore {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn query(&self, sql: &str, params: &Params) -> Result<Vec<Row>, StoreError> {
        let positional = rewrite_named_params(sql, Dialect::Postgres);
        let ordered = ordered_params(&positional.bind_order, params)?;
        let mut query = sqlx::query(&positional.sql);
        for param in ordered {
            query = bind_pg(query, param);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(pg_row_values).collect())
    }

    async fn execute(&self, sql: &str, params: &Params) -> Result<u64, StoreError> {
        let positional = rewrite_named_params(sql, Dialect::Postgres);
        let ordered = ordered_params(&positional.bind_order, params)?;
        let mut query = sqlx::query(&positional.sql);
        for param in ordered {
            query = bind_pg(query, param);
        }
        let result = query.execute(&self.pool).await?;
        debug!(rows = result.rows_affected(), "postgres statement executed");
        Ok(result.rows_affected())
    }

    async fn table_names(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let names = sqlx::query_scalar::<_, String>(
            r#"
            SELECT tablename::text
            FROM pg_catalog.pg_tables
            WHERE schemaname = current_schema()
              AND tablename ILIKE $1
            "#,
        )
        .bind(pattern)
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// SQLite warehouse, used for local runs and the test suite.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        // An in-memory database lives only as long as its connection, so never recycle it.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:").await
    }
}

#[async_trait]
impl Store for SqliteStore {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn query(&self, sql: &str, params: &Params) -> Result<Vec<Row>, StoreError> {
        let positional = rewrite_named_params(sql, Dialect::Sqlite);
        let ordered = ordered_params(&positional.bind_order, params)?;
        let mut query = sqlx::query(&positional.sql);
        for param in ordered {
            query = bind_sqlite(query, param);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(sqlite_row_values).collect())
    }

    async fn execute(&self, sql: &str, params: &Params) -> Result<u64, StoreError> {
        let positional = rewrite_named_params(sql, Dialect::Sqlite);
        let ordered = ordered_params(&positional.bind_order, params)?;
        let mut query = sqlx::query(&positional.sql);
        for param in ordered {
            query = bind_sqlite(query, param);
        }
        let result = query.execute(&self.pool).await?;
        debug!(rows = result.rows_affected(), "sqlite statement executed");
        Ok(result.rows_affected())
    }

    async fn table_names(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let names = sqlx::query_scalar::<_, String>(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE ?",
        )
        .bind(pattern)
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
