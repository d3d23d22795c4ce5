//! Serial per-transaction operation queue
//!
//! Each transaction owns an unbounded FIFO channel drained by one worker
//! task. The worker takes the connection's transaction lock when the first
//! request arrives and keeps it until the transaction ends. Writers take it
//! exclusively and run inside `BEGIN IMMEDIATE`; readers share it and run
//! their statements directly, since no writer can commit while they hold it:
//!
//! ```text
//! first op → lock → [BEGIN] → op, op, ... → [COMMIT]   (commit requested or every handle dropped)
//!                                └─ failure / abort → fail queued ops → [ROLLBACK]
//! ```
//!
//! A transaction that ends before its first request never takes the lock.
//! An operation failure aborts the transaction with that failure. The
//! outcome is published once through a watch channel.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, watch, Notify, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::{BackendResult, Rows, SqlBackend, SqlValue};
use crate::config::ConfigHandle;
use crate::connection::Connection;
use crate::error::ShimError;
use crate::store::ObjectStore;
use crate::ShimResult;

/// What a transaction may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
    /// Schema changes; only created by `Factory::open` during an upgrade
    VersionChange,
}

impl TransactionMode {
    pub fn is_write(self) -> bool {
        !matches!(self, TransactionMode::ReadOnly)
    }
}

/// How a transaction ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionOutcome {
    Complete,
    Aborted(ShimError),
}

/// Backend access handed to queued operations.
#[derive(Clone)]
pub(crate) struct OpContext {
    backend: Arc<dyn SqlBackend>,
    config: ConfigHandle,
    transaction: Uuid,
}

impl OpContext {
    /// Run one statement, logging its text when the debug toggle is on.
    pub(crate) async fn execute(&self, sql: &str, params: &[SqlValue]) -> BackendResult<Rows> {
        if self.config.snapshot().debug {
            debug!(transaction = %self.transaction, sql, "executing");
        }
        self.backend.execute(sql, params).await
    }
}

type Work<T> = Box<dyn FnOnce(OpContext) -> BoxFuture<'static, ShimResult<T>> + Send>;

trait PendingOp: Send {
    /// Run the work and deliver its result. A failure aborts `shared`
    /// before the caller sees it.
    fn run(self: Box<Self>, ctx: OpContext, shared: Arc<TxnShared>) -> BoxFuture<'static, ()>;

    /// Deliver `err` without running.
    fn fail(self: Box<Self>, err: ShimError);
}

struct Operation<T> {
    work: Work<T>,
    reply: oneshot::Sender<ShimResult<T>>,
}

impl<T: Send + 'static> PendingOp for Operation<T> {
    fn run(self: Box<Self>, ctx: OpContext, shared: Arc<TxnShared>) -> BoxFuture<'static, ()> {
        let Operation { work, reply } = *self;
        Box::pin(async move {
            let result = work(ctx).await;
            if let Err(err) = &result {
                shared.abort_with(err.clone());
            }
            let _ = reply.send(result);
        })
    }

    fn fail(self: Box<Self>, err: ShimError) {
        let _ = self.reply.send(Err(err));
    }
}

enum Job {
    Op(Box<dyn PendingOp>),
    Commit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Active,
    Committing,
    Finished,
}

struct TxnState {
    phase: Phase,
    abort: Option<ShimError>,
}

/// State shared between transaction handles, the worker and the owning
/// connection. Holds no sender, so it never keeps the queue open.
pub(crate) struct TxnShared {
    id: Uuid,
    mode: TransactionMode,
    state: Mutex<TxnState>,
    wake: Notify,
    outcome: watch::Sender<Option<TransactionOutcome>>,
}

impl TxnShared {
    fn new(mode: TransactionMode) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            id: Uuid::new_v4(),
            mode,
            state: Mutex::new(TxnState {
                phase: Phase::Active,
                abort: None,
            }),
            wake: Notify::new(),
            outcome,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, TxnState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Request an abort with `err`. Returns `false` when the transaction
    /// already finished or is already aborting.
    pub(crate) fn abort_with(&self, err: ShimError) -> bool {
        {
            let mut state = self.state();
            if state.phase == Phase::Finished || state.abort.is_some() {
                return false;
            }
            state.abort = Some(err);
        }
        self.wake.notify_one();
        true
    }

    fn abort_error(&self) -> Option<ShimError> {
        self.state().abort.clone()
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.state().phase == Phase::Finished
    }

    pub(crate) async fn finished(&self) -> TransactionOutcome {
        let mut rx = self.outcome.subscribe();
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|o| o.clone());
        outcome.unwrap_or_else(|| {
            TransactionOutcome::Aborted(ShimError::Abort(
                "The transaction worker stopped".to_string(),
            ))
        })
    }

    fn finish(&self, outcome: TransactionOutcome) {
        self.state().phase = Phase::Finished;
        self.outcome.send_replace(Some(outcome));
    }
}

/// Handle to one transaction. Clones share the same queue; once every
/// handle is gone the transaction commits.
#[derive(Clone)]
pub struct Transaction {
    shared: Arc<TxnShared>,
    sender: mpsc::UnboundedSender<Job>,
    scope: Arc<[String]>,
    connection: Connection,
}

impl Transaction {
    /// Start the worker. Registration with the connection is the caller's
    /// job.
    pub(crate) fn spawn(
        connection: &Connection,
        scope: Vec<String>,
        mode: TransactionMode,
    ) -> (Self, Arc<TxnShared>) {
        let shared = Arc::new(TxnShared::new(mode));
        let (sender, receiver) = mpsc::unbounded_channel();
        let ctx = OpContext {
            backend: connection.backend(),
            config: connection.config().clone(),
            transaction: shared.id,
        };
        tokio::spawn(run_worker(
            shared.clone(),
            receiver,
            ctx,
            connection.transaction_lock(),
        ));
        debug!(transaction = %shared.id, ?mode, ?scope, "Transaction created");

        let txn = Self {
            shared: shared.clone(),
            sender,
            scope: scope.into(),
            connection: connection.clone(),
        };
        (txn, shared)
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn mode(&self) -> TransactionMode {
        self.shared.mode
    }

    /// Store names in scope; empty for version-change transactions, which
    /// cover every store.
    pub fn scope(&self) -> &[String] {
        &self.scope
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Whether requests may still be placed.
    pub fn is_active(&self) -> bool {
        let state = self.shared.state();
        state.phase == Phase::Active && state.abort.is_none()
    }

    pub fn object_store(&self, name: &str) -> ShimResult<ObjectStore> {
        if self.shared.is_finished() {
            return Err(ShimError::InvalidState(
                "The transaction has finished".to_string(),
            ));
        }
        let in_scope = self.mode() == TransactionMode::VersionChange
            || self.scope.iter().any(|s| s == name);
        if !in_scope || !self.connection.has_store(name) {
            return Err(ShimError::NotFound(format!(
                "No object store named \"{name}\" in this transaction"
            )));
        }
        Ok(ObjectStore::new(self.clone(), name.to_string()))
    }

    /// Commit after every queued request has run.
    pub fn commit(&self) -> ShimResult<()> {
        {
            let mut state = self.shared.state();
            if state.phase != Phase::Active || state.abort.is_some() {
                return Err(ShimError::TransactionInactive(
                    "The transaction has already been committed or aborted".to_string(),
                ));
            }
            state.phase = Phase::Committing;
        }
        self.sender.send(Job::Commit).map_err(|_| inactive())
    }

    /// Abort; queued requests fail and nothing is written.
    pub fn abort(&self) -> ShimResult<()> {
        if self.shared.state().phase != Phase::Active {
            return Err(ShimError::InvalidState(
                "The transaction is already committing or finished".to_string(),
            ));
        }
        self.shared
            .abort_with(ShimError::Abort("The transaction was aborted".to_string()));
        Ok(())
    }

    /// Resolves when the transaction has committed or rolled back.
    pub async fn finished(&self) -> TransactionOutcome {
        self.shared.finished().await
    }

    pub(crate) fn ensure_active(&self) -> ShimResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(inactive())
        }
    }

    /// Queue `work` behind every earlier request of this transaction.
    pub(crate) fn enqueue<T, F>(&self, work: F) -> ShimResult<Request<T>>
    where
        T: Send + 'static,
        F: FnOnce(OpContext) -> BoxFuture<'static, ShimResult<T>> + Send + 'static,
    {
        self.ensure_active()?;
        let (reply, rx) = oneshot::channel();
        let op = Operation {
            work: Box::new(work),
            reply,
        };
        self.sender
            .send(Job::Op(Box::new(op)))
            .map_err(|_| inactive())?;
        Ok(Request { rx })
    }
}

fn inactive() -> ShimError {
    ShimError::TransactionInactive("The transaction is not active".to_string())
}

/// Failure delivered to requests that were still queued at abort time.
fn pending_failure(cause: &ShimError) -> ShimError {
    match cause {
        ShimError::Abort(_) => cause.clone(),
        other => ShimError::Abort(format!("The transaction was aborted: {other}")),
    }
}

async fn run_worker(
    shared: Arc<TxnShared>,
    mut receiver: mpsc::UnboundedReceiver<Job>,
    ctx: OpContext,
    lock: Arc<RwLock<()>>,
) {
    let first = loop {
        if let Some(err) = shared.abort_error() {
            wind_down(&shared, receiver, &ctx, err, false).await;
            return;
        }
        tokio::select! {
            biased;
            _ = shared.wake.notified() => continue,
            job = receiver.recv() => break job,
        }
    };
    let first = match first {
        Some(Job::Op(op)) => op,
        Some(Job::Commit) | None => {
            debug!(transaction = %shared.id, "Transaction finished without requests");
            shared.finish(TransactionOutcome::Complete);
            return;
        }
    };

    let writer = shared.mode.is_write();
    let (_read_turn, _write_turn) = if writer {
        (None, Some(lock.write_owned().await))
    } else {
        (Some(lock.read_owned().await), None)
    };

    let mut in_transaction = false;
    if writer && shared.abort_error().is_none() {
        match ctx.execute("BEGIN IMMEDIATE", &[]).await {
            Ok(_) => in_transaction = true,
            Err(e) => {
                shared.abort_with(ShimError::backend("Could not begin transaction", e));
            }
        }
    }

    let mut next = Some(first);
    let failure = loop {
        if let Some(err) = shared.abort_error() {
            if let Some(op) = next.take() {
                op.fail(pending_failure(&err));
            }
            break err;
        }
        let job = match next.take() {
            Some(op) => Some(Job::Op(op)),
            None => tokio::select! {
                biased;
                _ = shared.wake.notified() => continue,
                job = receiver.recv() => job,
            },
        };
        match job {
            Some(Job::Op(op)) => {
                if let Some(err) = shared.abort_error() {
                    op.fail(pending_failure(&err));
                    break err;
                }
                op.run(ctx.clone(), shared.clone()).await;
            }
            Some(Job::Commit) | None if !in_transaction => {
                debug!(transaction = %shared.id, "Transaction finished");
                shared.finish(TransactionOutcome::Complete);
                return;
            }
            Some(Job::Commit) | None => match ctx.execute("COMMIT", &[]).await {
                Ok(_) => {
                    debug!(transaction = %shared.id, "Transaction committed");
                    shared.finish(TransactionOutcome::Complete);
                    return;
                }
                Err(e) => {
                    shared.abort_with(ShimError::backend("Could not commit transaction", e));
                }
            },
        }
    };

    wind_down(&shared, receiver, &ctx, failure, in_transaction).await;
}

/// Fail what is still queued, roll back and publish the abort.
async fn wind_down(
    shared: &TxnShared,
    mut receiver: mpsc::UnboundedReceiver<Job>,
    ctx: &OpContext,
    failure: ShimError,
    in_transaction: bool,
) {
    receiver.close();
    let pending = pending_failure(&failure);
    while let Ok(job) = receiver.try_recv() {
        if let Job::Op(op) = job {
            op.fail(pending.clone());
        }
    }
    if in_transaction {
        if let Err(e) = ctx.execute("ROLLBACK", &[]).await {
            warn!(transaction = %shared.id, error = %e, "Rollback failed");
        }
    }
    debug!(transaction = %shared.id, error = %failure, "Transaction aborted");
    shared.finish(TransactionOutcome::Aborted(failure));
}

/// Pending result of one queued operation.
#[must_use = "requests do nothing unless awaited or the transaction runs"]
#[derive(Debug)]
pub struct Request<T> {
    rx: oneshot::Receiver<ShimResult<T>>,
}

impl<T> Future for Request<T> {
    type Output = ShimResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(ShimError::Abort(
                    "The transaction ended before the request ran".to_string(),
                ))
            })
        })
    }
}
