//! Database factory: open with version change, list databases
//!
//! Each database lives in `<base_dir>/<escaped name>.sqlite`. Opens of the
//! same name are serialized, so at most one version change per database is
//! in flight.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use idbshim_codec::{escape_database_name, unescape_database_name};
use tracing::{info, instrument, warn};

use crate::backend::{SqlBackend, SqlValue};
use crate::config::ConfigHandle;
use crate::connection::Connection;
use crate::error::ShimError;
use crate::migrations::{init_schema, VERSION_TABLE};
use crate::schema::load_schema;
use crate::sqlite::SqliteBackend;
use crate::transaction::{Transaction, TransactionMode, TransactionOutcome};
use crate::ShimResult;

const DATABASE_SUFFIX: &str = ".sqlite";

/// Handed to the upgrade callback of [`Factory::open`].
pub struct UpgradeContext {
    pub connection: Connection,
    /// The version-change transaction; schema changes are queued on it
    pub transaction: Transaction,
    pub old_version: u64,
    pub new_version: u64,
}

/// Opens databases under one directory.
pub struct Factory {
    base_dir: PathBuf,
    config: ConfigHandle,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Factory {
    pub fn new(base_dir: impl Into<PathBuf>, config: ConfigHandle) -> Self {
        Self {
            base_dir: base_dir.into(),
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    /// Open `name`, upgrading it to `version` first when that is newer than
    /// the stored version.
    ///
    /// `None` opens the current version (1 for a new database). `upgrade`
    /// only runs when a version change happens; returning `Err` aborts the
    /// change and the open fails with that error.
    #[instrument(skip(self, upgrade))]
    pub async fn open<F, Fut>(
        &self,
        name: &str,
        version: Option<u64>,
        upgrade: F,
    ) -> ShimResult<Connection>
    where
        F: FnOnce(UpgradeContext) -> Fut,
        Fut: Future<Output = ShimResult<()>>,
    {
        check_version(version)?;
        let config = self.config.snapshot();
        let escaped = escape_database_name(name, &config.codec)?;
        let lock = self.lock_for(&escaped);
        let _guard = lock.lock().await;

        let path = self.base_dir.join(format!("{escaped}{DATABASE_SUFFIX}"));
        let backend = SqliteBackend::open(&path, config.busy_timeout)
            .await
            .map_err(|e| ShimError::backend(format!("Could not open database \"{name}\""), e))?;
        self.open_locked(name, Arc::new(backend), version, upgrade)
            .await
    }

    /// Like [`Factory::open`] but over a caller-supplied backend.
    #[instrument(skip(self, backend, upgrade))]
    pub async fn open_with_backend<F, Fut>(
        &self,
        name: &str,
        backend: Arc<dyn SqlBackend>,
        version: Option<u64>,
        upgrade: F,
    ) -> ShimResult<Connection>
    where
        F: FnOnce(UpgradeContext) -> Fut,
        Fut: Future<Output = ShimResult<()>>,
    {
        check_version(version)?;
        let escaped = escape_database_name(name, &self.config.snapshot().codec)?;
        let lock = self.lock_for(&escaped);
        let _guard = lock.lock().await;
        self.open_locked(name, backend, version, upgrade).await
    }

    /// Names of the databases in the base directory, sorted.
    pub fn database_names(&self) -> ShimResult<Vec<String>> {
        let entries = match std::fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(ShimError::Backend {
                    context: "Could not list databases".to_string(),
                    message: e.to_string(),
                })
            }
        };

        let codec = self.config.snapshot().codec;
        let mut names = Vec::new();
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(stem) = file_name
                .to_str()
                .and_then(|f| f.strip_suffix(DATABASE_SUFFIX))
            else {
                continue;
            };
            match unescape_database_name(stem, &codec) {
                Ok(name) => names.push(name),
                Err(e) => warn!(file = stem, error = %e, "Skipping unrecognised database file"),
            }
        }
        names.sort();
        Ok(names)
    }

    fn lock_for(&self, escaped: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(escaped.to_string())
            .or_default()
            .clone()
    }

    async fn open_locked<F, Fut>(
        &self,
        name: &str,
        backend: Arc<dyn SqlBackend>,
        version: Option<u64>,
        upgrade: F,
    ) -> ShimResult<Connection>
    where
        F: FnOnce(UpgradeContext) -> Fut,
        Fut: Future<Output = ShimResult<()>>,
    {
        init_schema(backend.as_ref()).await?;
        let current = read_version(backend.as_ref(), name).await?;
        let requested = version.unwrap_or_else(|| current.max(1));
        if requested < current {
            return Err(ShimError::Version(format!(
                "The requested version ({requested}) is less than the existing version ({current})"
            )));
        }

        let schema = load_schema(backend.as_ref()).await?;
        let connection = Connection::new(
            name.to_string(),
            backend,
            self.config.clone(),
            current,
            schema,
        );

        if requested > current {
            run_upgrade(&connection, current, requested, upgrade).await?;
        }
        info!(database = name, version = requested, "Database opened");
        Ok(connection)
    }
}

fn check_version(version: Option<u64>) -> ShimResult<()> {
    if version == Some(0) {
        return Err(ShimError::Type(
            "The version must be a positive integer".to_string(),
        ));
    }
    Ok(())
}

async fn read_version(backend: &dyn SqlBackend, name: &str) -> ShimResult<u64> {
    let rows = backend
        .execute(
            &format!("SELECT version FROM {VERSION_TABLE} WHERE name = ?"),
            &[SqlValue::from(name)],
        )
        .await
        .map_err(|e| ShimError::backend("Could not read the database version", e))?;
    Ok(rows
        .first()
        .and_then(|row| row.get(0))
        .and_then(SqlValue::as_i64)
        .map_or(0, |v| v.max(0) as u64))
}

async fn run_upgrade<F, Fut>(
    connection: &Connection,
    old_version: u64,
    new_version: u64,
    upgrade: F,
) -> ShimResult<()>
where
    F: FnOnce(UpgradeContext) -> Fut,
    Fut: Future<Output = ShimResult<()>>,
{
    info!(
        database = connection.name(),
        old_version, new_version, "Upgrading database"
    );
    let transaction = connection.begin(Vec::new(), TransactionMode::VersionChange)?;
    connection.set_version_change(Some(transaction.clone()));
    connection.set_version(new_version);

    let name = connection.name().to_string();
    let _ = transaction.enqueue(move |ctx| {
        async move {
            ctx.execute(
                &format!("INSERT OR REPLACE INTO {VERSION_TABLE} (name, version) VALUES (?, ?)"),
                &[SqlValue::from(name), SqlValue::from(new_version as i64)],
            )
            .await
            .map_err(|e| ShimError::backend("Could not store the database version", e))?;
            Ok(())
        }
        .boxed()
    })?;

    let result = upgrade(UpgradeContext {
        connection: connection.clone(),
        transaction: transaction.clone(),
        old_version,
        new_version,
    })
    .await;
    connection.set_version_change(None);

    let outcome = match result {
        Ok(()) => {
            let _ = transaction.commit();
            transaction.finished().await
        }
        Err(err) => {
            let _ = transaction.abort();
            transaction.finished().await;
            TransactionOutcome::Aborted(err)
        }
    };

    match outcome {
        TransactionOutcome::Complete => Ok(()),
        TransactionOutcome::Aborted(err) => {
            warn!(database = connection.name(), error = %err, "Upgrade aborted");
            connection.set_version(old_version);
            connection.close();
            Err(err)
        }
    }
}
