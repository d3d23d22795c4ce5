//! Relational backend boundary
//!
//! Everything above this module talks to storage through [`SqlBackend`]:
//! one textual statement plus positional parameters in, a row set out.
//! [`crate::SqliteBackend`] is the production implementation and
//! [`crate::fakes::FaultyBackend`] wraps any backend for error-path tests.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BackendError;

/// Result type for backend operations
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// A single bound parameter or result cell.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(n) => Some(*n),
            SqlValue::Real(f) => Some(*f as i64),
            _ => None,
        }
    }
}

impl From<&str> for SqlValue {
    fn from(s: &str) -> Self {
        SqlValue::Text(s.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(s: String) -> Self {
        SqlValue::Text(s)
    }
}

impl From<i64> for SqlValue {
    fn from(n: i64) -> Self {
        SqlValue::Integer(n)
    }
}

impl From<bool> for SqlValue {
    fn from(b: bool) -> Self {
        SqlValue::Integer(i64::from(b))
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// One result row, addressable by ordinal and by column name.
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<SqlValue>,
}

impl Row {
    pub fn new(columns: Arc<[String]>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    pub fn get(&self, ordinal: usize) -> Option<&SqlValue> {
        self.values.get(ordinal)
    }

    pub fn by_name(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Result of one statement.
#[derive(Debug, Clone, Default)]
pub struct Rows {
    pub rows: Vec<Row>,
    pub rows_affected: usize,
}

impl Rows {
    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }
}

/// Textual query execution against a relational store.
#[async_trait]
pub trait SqlBackend: Send + Sync {
    /// Run one statement with positional `?` parameters.
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> BackendResult<Rows>;

    /// Whether the backend holds a native handle that [`SqlBackend::close`]
    /// releases.
    fn supports_close(&self) -> bool {
        false
    }

    /// Release the native handle. Later `execute` calls fail.
    async fn close(&self) -> BackendResult<()> {
        Ok(())
    }
}
