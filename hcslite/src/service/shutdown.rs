//! Shutdown coordination.
//!
//! Tracks the number of in-flight RPC handlers, gates new requests once
//! draining has begun, and signals process exit when teardown finishes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Request gate plus exit signal. One per service.
pub struct ShutdownCoordinator {
    draining: CancellationToken,
    done: CancellationToken,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl ShutdownCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            draining: CancellationToken::new(),
            done: CancellationToken::new(),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        })
    }

    /// Admit a request. Returns `None` once draining has begun; otherwise
    /// the guard keeps the request counted until dropped.
    pub fn guard(self: &Arc<Self>) -> Option<RequestGuard> {
        if self.draining.is_cancelled() {
            return None;
        }
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        // Re-check: begin() may have won the race after the first check.
        if self.draining.is_cancelled() {
            self.release();
            return None;
        }
        Some(RequestGuard {
            coordinator: Arc::clone(self),
        })
    }

    /// Start draining: no new requests are admitted.
    pub fn begin(&self) {
        self.draining.cancel();
    }

    pub fn is_draining(&self) -> bool {
        self.draining.is_cancelled()
    }

    /// Wait until every admitted request has finished.
    pub async fn drain(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Signal that teardown is complete and the process may exit.
    pub fn complete(&self) {
        self.done.cancel();
    }

    pub async fn done(&self) {
        self.done.cancelled().await;
    }

    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    fn release(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// RAII in-flight marker for one RPC handler invocation.
pub struct RequestGuard {
    coordinator: Arc<ShutdownCoordinator>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.coordinator.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn guards_are_admitted_until_draining() {
        let coordinator = ShutdownCoordinator::new();
        let guard = coordinator.guard();
        assert!(guard.is_some());

        coordinator.begin();
        assert!(coordinator.guard().is_none());

        // Previously admitted requests still count.
        drop(guard);
        coordinator.drain().await;
    }

    #[tokio::test]
    async fn drain_waits_for_open_guards() {
        let coordinator = ShutdownCoordinator::new();
        let guard = coordinator.guard().unwrap();
        coordinator.begin();

        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator.drain().await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("drain did not finish")
            .unwrap();
    }

    #[tokio::test]
    async fn done_signal_fires_once_completed() {
        let coordinator = ShutdownCoordinator::new();
        assert!(!coordinator.is_done());
        coordinator.complete();
        coordinator.done().await;
        assert!(coordinator.is_done());
    }

    #[tokio::test]
    async fn drain_with_no_guards_returns_immediately() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.begin();
        tokio::time::timeout(Duration::from_millis(100), coordinator.drain())
            .await
            .expect("drain should be immediate");
    }
}
