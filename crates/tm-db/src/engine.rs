//! Connection Manager: pooled access to the analytical query engine.
//!
//! The store is reached through parameterized SQL text only. It offers no
//! multi-statement transactions, so [`QueryEngine::execute_statement`] is a
//! single, independently committed write and callers must never assume two
//! statements land together.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Row as _, TypeInfo};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// No connection became free within the acquire timeout. Retryable.
    #[error("connection pool exhausted after waiting {waited_ms} ms")]
    PoolExhausted { waited_ms: u64 },
    /// Transport-level failure reaching the engine. Retryable.
    #[error("query engine connection failed: {0}")]
    Connection(String),
    /// The engine rejected the statement.
    #[error("statement rejected by query engine: {0}")]
    Query(String),
    /// The engine rejected a write that would duplicate a unique key.
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
    /// A returned column did not have the expected type or was missing.
    #[error("column '{column}': {problem}")]
    Decode { column: String, problem: String },
}

impl DbError {
    /// Infrastructure errors are retryable; retry policy belongs to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DbError::PoolExhausted { .. } | DbError::Connection(_))
    }

    fn decode(column: &str, problem: impl Into<String>) -> Self {
        DbError::Decode {
            column: column.to_string(),
            problem: problem.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Values and rows
// ---------------------------------------------------------------------------

/// Column type, used to send correctly typed NULL parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Bool,
    Int,
    Text,
    Timestamp,
    Json,
    Uuid,
}

/// A bound parameter or a decoded column value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null(SqlType),
    Bool(bool),
    Int(i64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Json(Value),
    Uuid(Uuid),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null(_))
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        SqlValue::Timestamp(v)
    }
}

impl From<Value> for SqlValue {
    fn from(v: Value) -> Self {
        SqlValue::Json(v)
    }
}

impl From<Uuid> for SqlValue {
    fn from(v: Uuid) -> Self {
        SqlValue::Uuid(v)
    }
}

impl From<Option<String>> for SqlValue {
    fn from(v: Option<String>) -> Self {
        v.map(SqlValue::Text).unwrap_or(SqlValue::Null(SqlType::Text))
    }
}

impl From<Option<&str>> for SqlValue {
    fn from(v: Option<&str>) -> Self {
        v.map(SqlValue::from).unwrap_or(SqlValue::Null(SqlType::Text))
    }
}

impl From<Option<DateTime<Utc>>> for SqlValue {
    fn from(v: Option<DateTime<Utc>>) -> Self {
        v.map(SqlValue::Timestamp)
            .unwrap_or(SqlValue::Null(SqlType::Timestamp))
    }
}

/// One result row, keyed by column name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: BTreeMap<String, SqlValue>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form, mostly for tests and fakes.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.insert(column, value);
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<SqlValue>) {
        self.columns.insert(column.into(), value.into());
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns.get(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    fn required(&self, column: &str) -> Result<&SqlValue, DbError> {
        self.columns
            .get(column)
            .ok_or_else(|| DbError::decode(column, "missing from result"))
    }

    pub fn opt_text(&self, column: &str) -> Result<Option<String>, DbError> {
        match self.required(column)? {
            SqlValue::Null(_) => Ok(None),
            SqlValue::Text(s) => Ok(Some(s.clone())),
            SqlValue::Uuid(u) => Ok(Some(u.to_string())),
            other => Err(DbError::decode(column, format!("expected text, got {other:?}"))),
        }
    }

    pub fn text(&self, column: &str) -> Result<String, DbError> {
        self.opt_text(column)?
            .ok_or_else(|| DbError::decode(column, "unexpected NULL"))
    }

    pub fn int(&self, column: &str) -> Result<i64, DbError> {
        match self.required(column)? {
            SqlValue::Int(v) => Ok(*v),
            // Some engines hand back counts as text.
            SqlValue::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| DbError::decode(column, format!("'{s}' is not an integer"))),
            other => Err(DbError::decode(column, format!("expected integer, got {other:?}"))),
        }
    }

    pub fn bool(&self, column: &str) -> Result<bool, DbError> {
        match self.required(column)? {
            SqlValue::Bool(v) => Ok(*v),
            SqlValue::Int(v) => Ok(*v != 0),
            other => Err(DbError::decode(column, format!("expected boolean, got {other:?}"))),
        }
    }

    pub fn opt_timestamp(&self, column: &str) -> Result<Option<DateTime<Utc>>, DbError> {
        match self.required(column)? {
            SqlValue::Null(_) => Ok(None),
            SqlValue::Timestamp(t) => Ok(Some(*t)),
            other => Err(DbError::decode(column, format!("expected timestamp, got {other:?}"))),
        }
    }

    pub fn timestamp(&self, column: &str) -> Result<DateTime<Utc>, DbError> {
        self.opt_timestamp(column)?
            .ok_or_else(|| DbError::decode(column, "unexpected NULL"))
    }

    pub fn json(&self, column: &str) -> Result<Value, DbError> {
        match self.required(column)? {
            SqlValue::Json(v) => Ok(v.clone()),
            SqlValue::Text(s) => serde_json::from_str(s)
                .map_err(|e| DbError::decode(column, format!("invalid json: {e}"))),
            other => Err(DbError::decode(column, format!("expected json, got {other:?}"))),
        }
    }

    pub fn uuid(&self, column: &str) -> Result<Uuid, DbError> {
        match self.required(column)? {
            SqlValue::Uuid(u) => Ok(*u),
            SqlValue::Text(s) => Uuid::parse_str(s)
                .map_err(|e| DbError::decode(column, format!("invalid uuid: {e}"))),
            other => Err(DbError::decode(column, format!("expected uuid, got {other:?}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// QueryEngine
// ---------------------------------------------------------------------------

#[async_trait]
pub trait QueryEngine: Send + Sync {
    /// Read-only statement returning rows.
    async fn execute_query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, DbError>;

    /// One independently committed write. Returns the affected row count.
    async fn execute_statement(&self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError>;
}

/// Pool sizing. Mirrors `tm_config::DatabaseSettings` without depending on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub min_connections: u32,
    pub idle_ttl: Duration,
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 2,
            idle_ttl: Duration::from_secs(300),
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// [`QueryEngine`] over an sqlx Postgres-protocol pool.
#[derive(Debug, Clone)]
pub struct PgQueryEngine {
    pool: PgPool,
    acquire_timeout: Duration,
}

impl PgQueryEngine {
    pub async fn connect(url: &str, settings: &PoolSettings) -> Result<Self, DbError> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .idle_timeout(Some(settings.idle_ttl))
            .acquire_timeout(settings.acquire_timeout)
            .connect(url)
            .await
            .map_err(|e| classify(e, settings.acquire_timeout))?;

        tracing::info!(
            max = settings.max_connections,
            min = settings.min_connections,
            "query engine pool ready"
        );

        Ok(Self {
            pool,
            acquire_timeout: settings.acquire_timeout,
        })
    }

    /// Wrap an existing pool (tests, or callers that manage the pool).
    pub fn from_pool(pool: PgPool, acquire_timeout: Duration) -> Self {
        Self {
            pool,
            acquire_timeout,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl QueryEngine for PgQueryEngine {
    async fn execute_query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, DbError> {
        tracing::debug!(sql, params = params.len(), "execute_query");
        let rows = bind_all(sqlx::query(sql), params)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| classify(e, self.acquire_timeout))?;
        rows.iter().map(decode_row).collect()
    }

    async fn execute_statement(&self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError> {
        tracing::debug!(sql, params = params.len(), "execute_statement");
        let res = bind_all(sqlx::query(sql), params)
            .execute(&self.pool)
            .await
            .map_err(|e| classify(e, self.acquire_timeout))?;
        Ok(res.rows_affected())
    }
}

type PgQuery<'q> = sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>;

fn bind_all<'q>(mut q: PgQuery<'q>, params: &[SqlValue]) -> PgQuery<'q> {
    for p in params {
        q = match p.clone() {
            SqlValue::Null(SqlType::Bool) => q.bind(None::<bool>),
            SqlValue::Null(SqlType::Int) => q.bind(None::<i64>),
            SqlValue::Null(SqlType::Text) => q.bind(None::<String>),
            SqlValue::Null(SqlType::Timestamp) => q.bind(None::<DateTime<Utc>>),
            SqlValue::Null(SqlType::Json) => q.bind(None::<Value>),
            SqlValue::Null(SqlType::Uuid) => q.bind(None::<Uuid>),
            SqlValue::Bool(v) => q.bind(v),
            SqlValue::Int(v) => q.bind(v),
            SqlValue::Text(v) => q.bind(v),
            SqlValue::Timestamp(v) => q.bind(v),
            SqlValue::Json(v) => q.bind(v),
            SqlValue::Uuid(v) => q.bind(v),
        };
    }
    q
}

fn decode_row(row: &PgRow) -> Result<Row, DbError> {
    let mut out = Row::new();
    for col in row.columns() {
        let name = col.name();
        let idx = col.ordinal();
        let value = decode_column(row, idx, col.type_info().name())
            .map_err(|e| DbError::decode(name, e.to_string()))?;
        out.insert(name, value);
    }
    Ok(out)
}

fn decode_column(row: &PgRow, idx: usize, type_name: &str) -> Result<SqlValue, sqlx::Error> {
    let v = match type_name {
        "BOOL" => row
            .try_get::<Option<bool>, _>(idx)?
            .map(SqlValue::Bool)
            .unwrap_or(SqlValue::Null(SqlType::Bool)),
        "INT2" => row
            .try_get::<Option<i16>, _>(idx)?
            .map(|v| SqlValue::Int(v.into()))
            .unwrap_or(SqlValue::Null(SqlType::Int)),
        "INT4" => row
            .try_get::<Option<i32>, _>(idx)?
            .map(|v| SqlValue::Int(v.into()))
            .unwrap_or(SqlValue::Null(SqlType::Int)),
        "INT8" => row
            .try_get::<Option<i64>, _>(idx)?
            .map(SqlValue::Int)
            .unwrap_or(SqlValue::Null(SqlType::Int)),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(idx)?
            .map(SqlValue::Timestamp)
            .unwrap_or(SqlValue::Null(SqlType::Timestamp)),
        "TIMESTAMP" => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(idx)?
            .map(|t| SqlValue::Timestamp(t.and_utc()))
            .unwrap_or(SqlValue::Null(SqlType::Timestamp)),
        "JSON" | "JSONB" => row
            .try_get::<Option<Value>, _>(idx)?
            .map(SqlValue::Json)
            .unwrap_or(SqlValue::Null(SqlType::Json)),
        "UUID" => row
            .try_get::<Option<Uuid>, _>(idx)?
            .map(SqlValue::Uuid)
            .unwrap_or(SqlValue::Null(SqlType::Uuid)),
        _ => row
            .try_get::<Option<String>, _>(idx)?
            .map(SqlValue::Text)
            .unwrap_or(SqlValue::Null(SqlType::Text)),
    };
    Ok(v)
}

/// Map driver errors onto the connection-manager taxonomy. Backend text is
/// kept for operators; user-facing layers never show it.
fn classify(err: sqlx::Error, acquire_timeout: Duration) -> DbError {
    match err {
        sqlx::Error::PoolTimedOut => DbError::PoolExhausted {
            waited_ms: acquire_timeout.as_millis() as u64,
        },
        sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::WorkerCrashed => DbError::Connection(err.to_string()),
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            DbError::UniqueViolation(db.message().to_string())
        }
        sqlx::Error::Database(db) => DbError::Query(db.message().to_string()),
        other => DbError::Query(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_nulls_from_options() {
        assert_eq!(
            SqlValue::from(None::<String>),
            SqlValue::Null(SqlType::Text)
        );
        assert_eq!(
            SqlValue::from(None::<DateTime<Utc>>),
            SqlValue::Null(SqlType::Timestamp)
        );
        assert!(SqlValue::from(None::<&str>).is_null());
    }

    #[test]
    fn row_getters_decode_and_reject() {
        let now = Utc::now();
        let row = Row::new()
            .with("code", "PF001")
            .with("approved_by", None::<String>)
            .with("version", 3i64)
            .with("count", "42")
            .with("created_at", now)
            .with("changes", "[]");

        assert_eq!(row.text("code").unwrap(), "PF001");
        assert_eq!(row.opt_text("approved_by").unwrap(), None);
        assert_eq!(row.int("version").unwrap(), 3);
        assert_eq!(row.int("count").unwrap(), 42);
        assert_eq!(row.timestamp("created_at").unwrap(), now);
        assert_eq!(row.json("changes").unwrap(), serde_json::json!([]));

        assert!(matches!(row.text("approved_by"), Err(DbError::Decode { .. })));
        assert!(matches!(row.bool("code"), Err(DbError::Decode { .. })));
        assert!(matches!(row.text("missing"), Err(DbError::Decode { .. })));
    }

    #[test]
    fn retryable_errors() {
        assert!(DbError::PoolExhausted { waited_ms: 5000 }.is_retryable());
        assert!(DbError::Connection("reset".into()).is_retryable());
        assert!(!DbError::Query("syntax".into()).is_retryable());
        assert!(!DbError::UniqueViolation("portfolios_pkey".into()).is_retryable());
    }

    #[test]
    fn pool_timeout_classifies_as_exhausted() {
        let e = classify(sqlx::Error::PoolTimedOut, Duration::from_secs(5));
        assert!(matches!(e, DbError::PoolExhausted { waited_ms: 5000 }));
        let e = classify(sqlx::Error::PoolClosed, Duration::from_secs(5));
        assert!(matches!(e, DbError::Connection(_)));
    }
}
