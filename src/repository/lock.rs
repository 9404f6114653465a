//! Named advisory locks.
//!
//! Locks are keyed by opaque strings chosen by commands. Guards release
//! on every exit path, panics included. The provider trait admits both
//! in-process and out-of-process implementations; the local one lives
//! here.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use thiserror::Error;

use crate::core::LockName;

/// Scoped lock ownership. Dropping the guard releases the lock.
pub struct LockGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockGuard {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LockGuard")
    }
}

/// Lock back-end failure (an out-of-process provider losing its
/// connection, for example). Timeouts are not an error: `try_acquire`
/// reports them as `None`.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock backend failure: {reason}")]
    Backend { reason: String },
}

/// Named advisory lock provider.
pub trait LockProvider: Send + Sync {
    /// Block until the lock is held.
    fn acquire(&self, name: &LockName) -> Result<LockGuard, LockError>;

    /// Block up to `timeout`; `None` when the lock stayed contended.
    fn try_acquire(
        &self,
        name: &LockName,
        timeout: Duration,
    ) -> Result<Option<LockGuard>, LockError>;
}

#[derive(Default)]
struct LockCell {
    held: Mutex<bool>,
    available: Condvar,
}

/// In-process lock provider.
///
/// Cells persist for the process lifetime; lock-name cardinality is
/// bounded by the application's command set.
pub struct LocalLockProvider {
    cells: Mutex<HashMap<LockName, Arc<LockCell>>>,
}

impl LocalLockProvider {
    pub fn new() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
        }
    }

    fn cell(&self, name: &LockName) -> Arc<LockCell> {
        let mut cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
        cells.entry(name.clone()).or_default().clone()
    }

    fn guard_for(cell: Arc<LockCell>) -> LockGuard {
        LockGuard::new(move || {
            let mut held = cell.held.lock().unwrap_or_else(|e| e.into_inner());
            *held = false;
            cell.available.notify_one();
        })
    }
}

impl Default for LocalLockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl LockProvider for LocalLockProvider {
    fn acquire(&self, name: &LockName) -> Result<LockGuard, LockError> {
        let cell = self.cell(name);
        {
            let mut held = cell.held.lock().unwrap_or_else(|e| e.into_inner());
            while *held {
                held = cell
                    .available
                    .wait(held)
                    .unwrap_or_else(|e| e.into_inner());
            }
            *held = true;
        }
        Ok(Self::guard_for(cell))
    }

    fn try_acquire(
        &self,
        name: &LockName,
        timeout: Duration,
    ) -> Result<Option<LockGuard>, LockError> {
        let cell = self.cell(name);
        {
            let held = cell.held.lock().unwrap_or_else(|e| e.into_inner());
            let (mut held, _) = cell
                .available
                .wait_timeout_while(held, timeout, |held| *held)
                .unwrap_or_else(|e| e.into_inner());
            if *held {
                return Ok(None);
            }
            *held = true;
        }
        Ok(Some(Self::guard_for(cell)))
    }
}
