//! System table initialization
//!
//! Every database file carries two bookkeeping tables next to the per-store
//! data tables. Both are created with `IF NOT EXISTS`, so initialization
//! runs on every open.

use tracing::{debug, info};

use crate::backend::SqlBackend;
use crate::error::ShimError;
use crate::ShimResult;

/// Store metadata table
pub const STORE_TABLE: &str = "__sys__";

/// Database version table
pub const VERSION_TABLE: &str = "__sysdb__";

/// Initialize the system tables of one database file
pub async fn init_schema(backend: &dyn SqlBackend) -> ShimResult<()> {
    info!("Initializing idbshim system tables");

    init_store_table(backend).await?;
    init_version_table(backend).await?;

    info!("idbshim system tables ready");
    Ok(())
}

/// Initialize `__sys__`
///
/// Schema:
/// ```text
/// TABLE __sys__ {
///   name:       TEXT (primary key; raw store name)
///   keyPath:    TEXT? (JSON: string or array of strings)
///   autoInc:    INTEGER (0 | 1)
///   indexList:  TEXT (JSON: index name -> {name, keyPath, unique, multiEntry, deleted})
///   currNum:    INTEGER (next auto-increment key)
/// }
/// ```
///
/// `indexList` keeps deleted indexes as tombstones: their `I_` columns are
/// still present on the data table and get reused by a later index of the
/// same name.
async fn init_store_table(backend: &dyn SqlBackend) -> ShimResult<()> {
    debug!("Initializing __sys__ table");

    let sql = r#"CREATE TABLE IF NOT EXISTS __sys__ (
        name TEXT PRIMARY KEY,
        keyPath TEXT,
        autoInc INTEGER,
        indexList TEXT,
        currNum INTEGER
    )"#;
    backend
        .execute(sql, &[])
        .await
        .map_err(|e| ShimError::backend("Could not create __sys__", e))?;

    info!("✓ __sys__ table initialized");
    Ok(())
}

/// Initialize `__sysdb__`
///
/// Schema:
/// ```text
/// TABLE __sysdb__ {
///   name:     TEXT (primary key; raw database name)
///   version:  INTEGER (absent row means version 0)
/// }
/// ```
async fn init_version_table(backend: &dyn SqlBackend) -> ShimResult<()> {
    debug!("Initializing __sysdb__ table");

    let sql = r#"CREATE TABLE IF NOT EXISTS __sysdb__ (
        name TEXT PRIMARY KEY,
        version INTEGER
    )"#;
    backend
        .execute(sql, &[])
        .await
        .map_err(|e| ShimError::backend("Could not create __sysdb__", e))?;

    info!("✓ __sysdb__ table initialized");
    Ok(())
}
