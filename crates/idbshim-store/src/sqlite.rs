//! SQLite backend (bundled SQLite via rusqlite)
//!
//! rusqlite is synchronous, so every statement runs on the blocking pool
//! while the connection sits behind a mutex. The handle is taken out of its
//! slot on close; SQLite may refuse to close, in which case it is put back.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};
use tracing::{debug, instrument};

use crate::backend::{BackendResult, Row, Rows, SqlBackend, SqlValue};
use crate::error::BackendError;

type Slot = Arc<Mutex<Option<rusqlite::Connection>>>;

/// [`SqlBackend`] over one native SQLite connection.
#[derive(Clone)]
pub struct SqliteBackend {
    conn: Slot,
}

impl SqliteBackend {
    /// Open (creating if needed) the database file at `path`.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> BackendResult<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = blocking(move || {
            let conn = rusqlite::Connection::open(&path)?;
            conn.busy_timeout(busy_timeout)?;
            Ok(conn)
        })
        .await?;
        debug!("SQLite connection opened");
        Ok(Self::from_connection(conn))
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> BackendResult<Self> {
        Ok(Self::from_connection(rusqlite::Connection::open_in_memory()?))
    }

    fn from_connection(conn: rusqlite::Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        }
    }
}

#[async_trait]
impl SqlBackend for SqliteBackend {
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> BackendResult<Rows> {
        let slot = self.conn.clone();
        let sql = sql.to_string();
        let params = params.to_vec();
        blocking(move || {
            let guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
            let conn = guard
                .as_ref()
                .ok_or_else(|| BackendError::new("database is closed"))?;
            run_statement(conn, &sql, &params).map_err(BackendError::from)
        })
        .await
    }

    fn supports_close(&self) -> bool {
        true
    }

    async fn close(&self) -> BackendResult<()> {
        let slot = self.conn.clone();
        blocking(move || {
            let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(conn) = guard.take() else {
                return Ok(());
            };
            match conn.close() {
                Ok(()) => Ok(()),
                Err((conn, err)) => {
                    *guard = Some(conn);
                    Err(BackendError::from(err))
                }
            }
        })
        .await
    }
}

fn run_statement(
    conn: &rusqlite::Connection,
    sql: &str,
    params: &[SqlValue],
) -> rusqlite::Result<Rows> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Arc<[String]> = stmt
        .column_names()
        .into_iter()
        .map(String::from)
        .collect();

    if columns.is_empty() {
        let affected = stmt.execute(rusqlite::params_from_iter(params.iter()))?;
        return Ok(Rows {
            rows: Vec::new(),
            rows_affected: affected,
        });
    }

    let mut cursor = stmt.query(rusqlite::params_from_iter(params.iter()))?;
    let mut rows = Vec::new();
    while let Some(row) = cursor.next()? {
        let values = (0..columns.len())
            .map(|i| row.get_ref(i).map(from_value_ref))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.push(Row::new(columns.clone(), values));
    }
    Ok(Rows {
        rows,
        rows_affected: 0,
    })
}

fn from_value_ref(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(n) => SqlValue::Integer(n),
        ValueRef::Real(f) => SqlValue::Real(f),
        ValueRef::Text(bytes) => SqlValue::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => SqlValue::Blob(bytes.to_vec()),
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            SqlValue::Integer(n) => ToSqlOutput::Borrowed(ValueRef::Integer(*n)),
            SqlValue::Real(f) => ToSqlOutput::Borrowed(ValueRef::Real(*f)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

async fn blocking<T, F>(work: F) -> BackendResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> BackendResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| BackendError::new(format!("SQLite worker failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_execute_returns_named_columns() {
        let db = SqliteBackend::open_in_memory().unwrap();
        db.execute("CREATE TABLE t (k TEXT, n INTEGER)", &[])
            .await
            .unwrap();
        let inserted = db
            .execute(
                "INSERT INTO t (k, n) VALUES (?, ?)",
                &[SqlValue::from("a"), SqlValue::from(7i64)],
            )
            .await
            .unwrap();
        assert_eq!(inserted.rows_affected, 1);

        let rows = db.execute("SELECT k, n FROM t", &[]).await.unwrap();
        let row = rows.first().unwrap();
        assert_eq!(row.by_name("k").and_then(SqlValue::as_str), Some("a"));
        assert_eq!(row.get(1).and_then(SqlValue::as_i64), Some(7));
    }

    #[tokio::test]
    async fn test_execute_after_close_fails() {
        let db = SqliteBackend::open_in_memory().unwrap();
        assert!(db.supports_close());
        db.close().await.unwrap();
        db.close().await.unwrap();

        let err = db.execute("SELECT 1", &[]).await.unwrap_err();
        assert_eq!(err.message, "database is closed");
    }

    #[tokio::test]
    async fn test_syntax_errors_carry_sqlite_message() {
        let db = SqliteBackend::open_in_memory().unwrap();
        let err = db.execute("SELEC 1", &[]).await.unwrap_err();
        assert!(err.message.contains("syntax error"));
    }

    #[tokio::test]
    async fn test_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("D_x.sqlite");
        {
            let db = SqliteBackend::open(&path, Duration::from_secs(1)).await.unwrap();
            db.execute("CREATE TABLE t (k TEXT)", &[]).await.unwrap();
            db.close().await.unwrap();
        }
        let db = SqliteBackend::open(&path, Duration::from_secs(1)).await.unwrap();
        let rows = db
            .execute("SELECT name FROM sqlite_master WHERE name = 't'", &[])
            .await
            .unwrap();
        assert_eq!(rows.rows.len(), 1);
    }
}
