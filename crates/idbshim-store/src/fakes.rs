//! Fault-injecting backend wrapper (testing only)
//!
//! [`FaultyBackend`] forwards to any [`SqlBackend`] and fails statements
//! whose text contains a configured substring, fails or delays native
//! close, and records every statement it saw.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::{BackendResult, Rows, SqlBackend, SqlValue};
use crate::error::BackendError;

/// Backend wrapper with switchable failures.
pub struct FaultyBackend {
    inner: Arc<dyn SqlBackend>,
    fail_on: Mutex<Option<String>>,
    fail_close: AtomicBool,
    close_delay: Mutex<Option<Duration>>,
    close_attempts: AtomicUsize,
    executed: Mutex<Vec<String>>,
}

impl FaultyBackend {
    pub fn new(inner: Arc<dyn SqlBackend>) -> Self {
        Self {
            inner,
            fail_on: Mutex::new(None),
            fail_close: AtomicBool::new(false),
            close_delay: Mutex::new(None),
            close_attempts: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
        }
    }

    /// Fail every statement containing `needle`.
    pub fn fail_on(&self, needle: impl Into<String>) {
        *self.fail_on.lock().unwrap_or_else(PoisonError::into_inner) = Some(needle.into());
    }

    pub fn clear_failure(&self) {
        *self.fail_on.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Make native close fail.
    pub fn fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    /// Make native close take at least `delay`.
    pub fn delay_close(&self, delay: Duration) {
        *self
            .close_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(delay);
    }

    pub fn close_attempts(&self) -> usize {
        self.close_attempts.load(Ordering::SeqCst)
    }

    /// Statements seen so far, failed ones included.
    pub fn executed(&self) -> Vec<String> {
        self.executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl SqlBackend for FaultyBackend {
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> BackendResult<Rows> {
        self.executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sql.to_string());
        let failing = self
            .fail_on
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|needle| sql.contains(needle.as_str()));
        if failing {
            return Err(BackendError::new(format!("injected failure: {sql}")));
        }
        self.inner.execute(sql, params).await
    }

    fn supports_close(&self) -> bool {
        true
    }

    async fn close(&self) -> BackendResult<()> {
        self.close_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self
            .close_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(BackendError::new("injected close failure"));
        }
        self.inner.close().await
    }
}
