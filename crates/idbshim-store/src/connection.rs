//! Database connection and its close lifecycle
//!
//! ```text
//! OPEN ──close()──▶ CLOSING ──all transactions done, close_pending clear──▶ CLOSED
//!   └──force_close(msg): FORCED, abort every open transaction ──┘
//! ```
//!
//! Closing waits for every transaction of the connection to finish. When
//! the backend has a native handle it is released once transactions are
//! done; `close_pending` stays set until that release returns, and the
//! close driver re-checks it every `close_poll_interval`. A failed native
//! close escalates to a forced close and is only logged.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::backend::{SqlBackend, SqlValue};
use crate::config::ConfigHandle;
use crate::error::ShimError;
use crate::keys::KeyPath;
use crate::migrations::STORE_TABLE;
use crate::schema::{StoreOptions, StoreRecord};
use crate::store::ObjectStore;
use crate::transaction::{Request, Transaction, TransactionMode, TxnShared};
use crate::ShimResult;

/// Position in the close lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

type CloseHandler = Box<dyn FnOnce() + Send>;

struct Lifecycle {
    state: ConnectionState,
    forced: bool,
    /// Native close requested and not yet returned
    close_pending: bool,
    native_done: bool,
    transactions: Vec<Arc<TxnShared>>,
    handlers: Vec<CloseHandler>,
}

struct ConnectionInner {
    name: String,
    backend: Arc<dyn SqlBackend>,
    config: ConfigHandle,
    version: AtomicU64,
    txn_lock: Arc<tokio::sync::RwLock<()>>,
    schema: Mutex<BTreeMap<String, StoreRecord>>,
    version_change: Mutex<Option<Transaction>>,
    lifecycle: Mutex<Lifecycle>,
    closed: watch::Sender<bool>,
}

/// Handle to an open database. Clones share one connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.inner.name)
            .field("version", &self.version())
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(
        name: String,
        backend: Arc<dyn SqlBackend>,
        config: ConfigHandle,
        version: u64,
        schema: BTreeMap<String, StoreRecord>,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(ConnectionInner {
                name,
                backend,
                config,
                version: AtomicU64::new(version),
                txn_lock: Arc::new(tokio::sync::RwLock::new(())),
                schema: Mutex::new(schema),
                version_change: Mutex::new(None),
                lifecycle: Mutex::new(Lifecycle {
                    state: ConnectionState::Open,
                    forced: false,
                    close_pending: false,
                    native_done: false,
                    transactions: Vec::new(),
                    handlers: Vec::new(),
                }),
                closed,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::SeqCst)
    }

    /// Sorted, duplicate-free store names.
    pub fn object_store_names(&self) -> Vec<String> {
        self.schema().keys().cloned().collect()
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle().state
    }

    /// Create a store. Only valid inside the upgrade callback.
    pub fn create_object_store(
        &self,
        name: &str,
        options: StoreOptions,
    ) -> ShimResult<Request<ObjectStore>> {
        let txn = self.active_version_change()?;
        if let Some(key_path) = &options.key_path {
            if !key_path.is_valid() {
                return Err(ShimError::Syntax(format!(
                    "The keyPath argument contains an invalid key path: {key_path:?}"
                )));
            }
        }
        if self.has_store(name) {
            return Err(ShimError::Constraint(format!(
                "Object store \"{name}\" already exists"
            )));
        }
        let empty_or_sequence = match &options.key_path {
            Some(kp) => kp.is_sequence() || *kp == KeyPath::Single(String::new()),
            None => false,
        };
        if options.auto_increment && empty_or_sequence {
            return Err(ShimError::InvalidAccess(
                "An auto-increment store cannot use an empty or array key path".to_string(),
            ));
        }

        let record = StoreRecord::new(name.to_string(), options);
        let codec = self.inner.config.snapshot().codec;
        let table = record.table(&codec)?;
        let key_path = record.key_path_json()?;
        let index_list = record.index_list_json()?;
        self.schema().insert(name.to_string(), record.clone());
        debug!(database = %self.inner.name, store = name, "Creating object store");

        let store = ObjectStore::new(txn.clone(), name.to_string());
        txn.enqueue(move |ctx| {
            async move {
                let context = format!("Could not create object store \"{}\"", record.name);
                ctx.execute(
                    &format!("CREATE TABLE {table} (key BLOB PRIMARY KEY, value BLOB)"),
                    &[],
                )
                .await
                .map_err(|e| ShimError::backend(&context, e))?;
                ctx.execute(
                    &format!(
                        "INSERT INTO {STORE_TABLE} (name, keyPath, autoInc, indexList, currNum) \
                         VALUES (?, ?, ?, ?, 1)"
                    ),
                    &[
                        SqlValue::from(record.name.as_str()),
                        key_path,
                        SqlValue::from(record.auto_increment),
                        SqlValue::from(index_list),
                    ],
                )
                .await
                .map_err(|e| ShimError::backend(&context, e))?;
                info!(store = %record.name, "✓ object store created");
                Ok(store)
            }
            .boxed()
        })
    }

    /// Drop a store and its data. Only valid inside the upgrade callback.
    pub fn delete_object_store(&self, name: &str) -> ShimResult<Request<()>> {
        let txn = self.active_version_change()?;
        let record = self.store_record(name).ok_or_else(|| {
            ShimError::NotFound(format!("No object store named \"{name}\""))
        })?;
        let table = record.table(&self.inner.config.snapshot().codec)?;
        self.schema().remove(name);
        debug!(database = %self.inner.name, store = name, "Deleting object store");

        txn.enqueue(move |ctx| {
            async move {
                let context = format!("Could not delete object store \"{}\"", record.name);
                ctx.execute(&format!("DROP TABLE {table}"), &[])
                    .await
                    .map_err(|e| ShimError::backend(&context, e))?;
                ctx.execute(
                    &format!("DELETE FROM {STORE_TABLE} WHERE name = ?"),
                    &[SqlValue::from(record.name.as_str())],
                )
                .await
                .map_err(|e| ShimError::backend(&context, e))?;
                Ok(())
            }
            .boxed()
        })
    }

    /// Start a read-only or read-write transaction over `store_names`.
    pub fn transaction<S: AsRef<str>>(
        &self,
        store_names: &[S],
        mode: TransactionMode,
    ) -> ShimResult<Transaction> {
        if self.state() != ConnectionState::Open {
            return Err(ShimError::InvalidState(
                "The connection is closing or closed".to_string(),
            ));
        }
        if mode == TransactionMode::VersionChange {
            return Err(ShimError::Type(
                "Version-change transactions are only created by open".to_string(),
            ));
        }
        let mut scope: Vec<String> = store_names
            .iter()
            .map(|s| s.as_ref().to_string())
            .collect();
        scope.sort();
        scope.dedup();
        if scope.is_empty() {
            return Err(ShimError::InvalidAccess(
                "A transaction needs at least one object store".to_string(),
            ));
        }
        if let Some(missing) = scope.iter().find(|s| !self.has_store(s)) {
            return Err(ShimError::NotFound(format!(
                "No object store named \"{missing}\""
            )));
        }
        self.begin(scope, mode)
    }

    /// Close once every transaction has finished. Repeated calls do nothing.
    #[instrument(skip(self), fields(database = %self.inner.name))]
    pub fn close(&self) {
        let native = {
            let mut lc = self.lifecycle();
            if lc.state != ConnectionState::Open {
                return;
            }
            lc.state = ConnectionState::Closing;
            let native = self.inner.backend.supports_close() && !lc.native_done;
            if native {
                lc.close_pending = true;
            }
            native
        };
        info!("Closing connection");

        if native {
            tokio::spawn(self.clone().close_native());
        }
        tokio::spawn(self.clone().drive_close());
    }

    /// Abort every open transaction with `message`, then close.
    #[instrument(skip(self, message), fields(database = %self.inner.name))]
    pub fn force_close(&self, message: impl Into<String>) {
        let message = message.into();
        let open = {
            let mut lc = self.lifecycle();
            if lc.state == ConnectionState::Closed || lc.forced {
                return;
            }
            lc.forced = true;
            if self.inner.backend.supports_close() && !lc.native_done {
                lc.close_pending = true;
            }
            lc.transactions.clone()
        };
        warn!(%message, "Force-closing connection");

        self.close();
        let err = ShimError::Abort(format!("The connection was force-closed: {message}"));
        for txn in open {
            txn.abort_with(err.clone());
        }
    }

    /// Register a handler run once the connection is closed. Runs at once
    /// when it already is.
    pub fn on_close(&self, handler: impl FnOnce() + Send + 'static) {
        let mut lc = self.lifecycle();
        if lc.state == ConnectionState::Closed {
            drop(lc);
            handler();
        } else {
            lc.handlers.push(Box::new(handler));
        }
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Whether a forced close is in progress.
    pub fn is_force_closing(&self) -> bool {
        self.lifecycle().forced
    }

    async fn close_native(self) {
        self.wait_for_transactions().await;
        match self.inner.backend.close().await {
            Ok(()) => {
                let mut lc = self.lifecycle();
                lc.close_pending = false;
                lc.native_done = true;
                debug!(database = %self.inner.name, "Native handle released");
            }
            Err(err) => {
                let forced = self.lifecycle().forced;
                if forced {
                    warn!(database = %self.inner.name, error = %err, "Native close failed during forced close");
                } else {
                    warn!(database = %self.inner.name, error = %err, "Native close failed; escalating to forced close");
                    self.force_close(format!("Native close failed: {err}"));
                }
                self.lifecycle().close_pending = false;
            }
        }
    }

    async fn drive_close(self) {
        self.wait_for_transactions().await;
        loop {
            if !self.lifecycle().close_pending {
                break;
            }
            let interval = self.inner.config.snapshot().close_poll_interval;
            tokio::time::sleep(interval).await;
        }

        let handlers = {
            let mut lc = self.lifecycle();
            lc.state = ConnectionState::Closed;
            lc.forced = false;
            lc.close_pending = false;
            lc.transactions.clear();
            std::mem::take(&mut lc.handlers)
        };
        self.inner.closed.send_replace(true);
        for handler in handlers {
            handler();
        }
        info!(database = %self.inner.name, "Connection closed");
    }

    async fn wait_for_transactions(&self) {
        let open = self.lifecycle().transactions.clone();
        for txn in open {
            txn.finished().await;
        }
    }

    /// Spawn and register a transaction while the connection is open.
    pub(crate) fn begin(
        &self,
        scope: Vec<String>,
        mode: TransactionMode,
    ) -> ShimResult<Transaction> {
        let mut lc = self.lifecycle();
        if lc.state != ConnectionState::Open {
            return Err(ShimError::InvalidState(
                "The connection is closing or closed".to_string(),
            ));
        }
        let (txn, shared) = Transaction::spawn(self, scope, mode);
        lc.transactions.retain(|t| !t.is_finished());
        lc.transactions.push(shared);
        Ok(txn)
    }

    fn active_version_change(&self) -> ShimResult<Transaction> {
        let txn = self
            .inner
            .version_change
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| {
                ShimError::InvalidState(
                    "Schema changes require a version-change transaction".to_string(),
                )
            })?;
        txn.ensure_active()?;
        Ok(txn)
    }

    pub(crate) fn set_version_change(&self, txn: Option<Transaction>) {
        *self
            .inner
            .version_change
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = txn;
    }

    pub(crate) fn set_version(&self, version: u64) {
        self.inner.version.store(version, Ordering::SeqCst);
    }

    pub(crate) fn backend(&self) -> Arc<dyn SqlBackend> {
        self.inner.backend.clone()
    }

    pub(crate) fn config(&self) -> &ConfigHandle {
        &self.inner.config
    }

    pub(crate) fn transaction_lock(&self) -> Arc<tokio::sync::RwLock<()>> {
        self.inner.txn_lock.clone()
    }

    pub(crate) fn has_store(&self, name: &str) -> bool {
        self.schema().contains_key(name)
    }

    pub(crate) fn store_record(&self, name: &str) -> Option<StoreRecord> {
        self.schema().get(name).cloned()
    }

    /// Apply `change` to the cached record of `name`.
    pub(crate) fn update_store<R>(
        &self,
        name: &str,
        change: impl FnOnce(&mut StoreRecord) -> R,
    ) -> Option<R> {
        self.schema().get_mut(name).map(change)
    }

    fn schema(&self) -> MutexGuard<'_, BTreeMap<String, StoreRecord>> {
        self.inner
            .schema
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.inner
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
