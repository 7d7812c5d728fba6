//! One-shot exit status latch.
//!
//! The final exit status of a process has three independent observers: the
//! RPC `Wait` handler, the notification watcher that recorded the exit, and
//! the task's shutdown cascade. The latch is their single source of truth:
//! written once, readable forever, awaitable by any number of callers.

use chrono::{DateTime, Utc};
use tokio::sync::watch;

/// Final status of an exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub pid: u32,
    pub exit_code: u32,
    pub exited_at: DateTime<Utc>,
}

impl ExitStatus {
    /// Status for a process that exited with `exit_code` just now.
    pub fn now(pid: u32, exit_code: u32) -> Self {
        Self {
            pid,
            exit_code,
            exited_at: Utc::now(),
        }
    }
}

impl Default for ExitStatus {
    /// The "not exited yet" placeholder: zero pid, zero code, epoch time.
    fn default() -> Self {
        Self {
            pid: 0,
            exit_code: 0,
            exited_at: DateTime::UNIX_EPOCH,
        }
    }
}

/// Single-assignment exit latch.
///
/// `set` is first-writer-wins; later writes are silently ignored. `wait`
/// suspends until the first `set` and then resolves immediately forever
/// after. All waiters observe the same value. Cancellation is the caller's:
/// dropping the `wait` future releases only that waiter.
#[derive(Debug)]
pub struct ExitLatch {
    tx: watch::Sender<Option<ExitStatus>>,
}

impl ExitLatch {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Record the exit status. Returns true if this call was the one that
    /// set the value.
    pub fn set(&self, status: ExitStatus) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(status);
                true
            } else {
                false
            }
        })
    }

    /// The recorded status, if set.
    pub fn get(&self) -> Option<ExitStatus> {
        *self.tx.borrow()
    }

    pub fn is_set(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Wait for the status to be recorded.
    pub async fn wait(&self) -> ExitStatus {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(status) = *rx.borrow_and_update() {
                return status;
            }
            if rx.changed().await.is_err() {
                // The sender lives in `self`, so this is unreachable while
                // the latch exists; fall back to the placeholder anyway.
                return ExitStatus::default();
            }
        }
    }
}

impl Default for ExitLatch {
    fn default() -> Self {
        Self::new()
    }
}
