//! Notification dispatcher.
//!
//! The compute backend emits one process-wide stream of callbacks, each
//! tagged with a numeric context id. The dispatcher owns the routing table
//! `context -> per-kind channels` and hands out [`Watcher`]s that convert
//! raw callbacks into the five documented wait outcomes.
//!
//! Context ids are allocated from a monotonically increasing counter and
//! never reused for the life of the process, so a late callback for an
//! already-deregistered context can only ever miss the table (and is
//! dropped with a log line), never hit a recycled entry.

use crate::compute::{Notification, NotificationKind};
use hcslite_shared::{HcsliteError, HcsliteResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// `None` is a successful notification; `Some` carries the mapped failure.
type Verdict = Option<HcsliteError>;

struct ContextEntry {
    senders: HashMap<NotificationKind, mpsc::UnboundedSender<Verdict>>,
}

/// Process-wide notification router. One per service.
pub struct NotificationDispatcher {
    table: RwLock<HashMap<u64, ContextEntry>>,
    next_context: AtomicU64,
    disconnect: CancellationToken,
}

impl NotificationDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            table: RwLock::new(HashMap::new()),
            // Context 0 is reserved so a zeroed callback can never match.
            next_context: AtomicU64::new(1),
            disconnect: CancellationToken::new(),
        })
    }

    /// Register interest in `kinds` under a freshly allocated context id.
    /// The returned watcher deregisters itself on drop.
    pub fn register(self: &Arc<Self>, kinds: &[NotificationKind]) -> Watcher {
        let context = self.next_context.fetch_add(1, Ordering::Relaxed);

        let mut senders = HashMap::with_capacity(kinds.len());
        let mut receivers = HashMap::with_capacity(kinds.len());
        for kind in kinds {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.insert(*kind, tx);
            receivers.insert(*kind, rx);
        }

        self.table.write().insert(context, ContextEntry { senders });

        Watcher {
            context,
            channels: receivers,
            dispatcher: Arc::clone(self),
        }
    }

    /// Spawn the routing loop over the backend's notification stream.
    ///
    /// Per-context ordering is preserved because one loop routes
    /// sequentially; no ordering exists across contexts. When the stream
    /// ends the compute service is gone and every watcher is released via
    /// the disconnect signal.
    pub fn run(
        self: &Arc<Self>,
        mut stream: mpsc::UnboundedReceiver<Notification>,
    ) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(notification) = stream.recv().await {
                if notification.kind == NotificationKind::ServiceDisconnect {
                    warn!("compute service disconnected");
                    dispatcher.disconnect.cancel();
                    continue;
                }
                dispatcher.route(notification);
            }
            debug!("notification stream ended");
            dispatcher.disconnect.cancel();
        })
    }

    fn route(&self, notification: Notification) {
        let table = self.table.read();
        let Some(entry) = table.get(&notification.context) else {
            // Late completion for a context that already went away.
            debug!(
                context = notification.context,
                kind = %notification.kind,
                "dropping notification for unregistered context"
            );
            return;
        };

        let Some(sender) = entry.senders.get(&notification.kind) else {
            debug!(
                context = notification.context,
                kind = %notification.kind,
                "context not subscribed to notification kind"
            );
            return;
        };

        // A closed receiver just means the watcher stopped listening.
        let _ = sender.send(verdict(&notification));
    }

    fn deregister(&self, context: u64) {
        self.table.write().remove(&context);
    }

    #[cfg(test)]
    fn registered(&self, context: u64) -> bool {
        self.table.read().contains_key(&context)
    }
}

/// Map a callback's result code: negative values are platform failures.
fn verdict(notification: &Notification) -> Verdict {
    if notification.result_code < 0 {
        Some(HcsliteError::compute(
            notification.result_code,
            notification
                .detail
                .clone()
                .unwrap_or_else(|| notification.kind.to_string()),
        ))
    } else {
        None
    }
}

/// Receiving half of one context's registration.
pub struct Watcher {
    context: u64,
    channels: HashMap<NotificationKind, mpsc::UnboundedReceiver<Verdict>>,
    dispatcher: Arc<NotificationDispatcher>,
}

impl Watcher {
    /// The context id the backend must tag callbacks with.
    pub fn context(&self) -> u64 {
        self.context
    }

    /// Block until the expected notification arrives, with the documented
    /// outcomes:
    ///
    /// - expected channel fires: its verdict (`Ok` or the mapped error);
    /// - system-exited fires while expecting something else:
    ///   [`HcsliteError::UnexpectedContainerExit`];
    /// - the service disconnects: [`HcsliteError::UnexpectedProcessAbort`];
    /// - `timeout` elapses: [`HcsliteError::Timeout`];
    /// - a channel closes: [`HcsliteError::HandleClosed`].
    pub async fn wait_for(
        &mut self,
        expected: NotificationKind,
        timeout: Option<Duration>,
    ) -> HcsliteResult<()> {
        let mut expected_rx = self
            .channels
            .remove(&expected)
            .ok_or(HcsliteError::HandleClosed)?;

        let mut exit_rx = if expected != NotificationKind::SystemExited {
            self.channels.remove(&NotificationKind::SystemExited)
        } else {
            None
        };

        let result = self
            .select(expected, &mut expected_rx, exit_rx.as_mut(), timeout)
            .await;

        self.channels.insert(expected, expected_rx);
        if let Some(rx) = exit_rx {
            self.channels.insert(NotificationKind::SystemExited, rx);
        }

        result
    }

    async fn select(
        &self,
        expected: NotificationKind,
        expected_rx: &mut mpsc::UnboundedReceiver<Verdict>,
        exit_rx: Option<&mut mpsc::UnboundedReceiver<Verdict>>,
        timeout: Option<Duration>,
    ) -> HcsliteResult<()> {
        let system_exit = async {
            match exit_rx {
                Some(rx) => rx.recv().await,
                None => std::future::pending().await,
            }
        };
        let deadline = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;

            verdict = expected_rx.recv() => match verdict {
                Some(Some(err)) => Err(err),
                Some(None) => Ok(()),
                None => Err(HcsliteError::HandleClosed),
            },
            verdict = system_exit => match verdict {
                Some(_) => Err(HcsliteError::UnexpectedContainerExit),
                None => Err(HcsliteError::HandleClosed),
            },
            _ = self.dispatcher.disconnect.cancelled() => {
                Err(HcsliteError::UnexpectedProcessAbort)
            }
            _ = deadline => Err(HcsliteError::Timeout(expected.to_string())),
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.dispatcher.deregister(self.context);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(context: u64, kind: NotificationKind, code: i32) -> Notification {
        Notification {
            context,
            kind,
            result_code: code,
            detail: None,
        }
    }

    fn harness() -> (
        Arc<NotificationDispatcher>,
        mpsc::UnboundedSender<Notification>,
    ) {
        let dispatcher = NotificationDispatcher::new();
        let (tx, rx) = mpsc::unbounded_channel();
        dispatcher.run(rx);
        (dispatcher, tx)
    }

    #[tokio::test]
    async fn expected_notification_resolves_wait() {
        let (dispatcher, tx) = harness();
        let mut watcher = dispatcher.register(&[NotificationKind::ProcessExited]);

        tx.send(notification(
            watcher.context(),
            NotificationKind::ProcessExited,
            0,
        ))
        .unwrap();

        watcher
            .wait_for(NotificationKind::ProcessExited, Some(Duration::from_secs(1)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn negative_status_maps_to_compute_error() {
        let (dispatcher, tx) = harness();
        let mut watcher = dispatcher.register(&[NotificationKind::SystemStarted]);

        tx.send(notification(
            watcher.context(),
            NotificationKind::SystemStarted,
            -2147023436,
        ))
        .unwrap();

        let err = watcher
            .wait_for(NotificationKind::SystemStarted, Some(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, HcsliteError::Compute { .. }));
    }

    #[tokio::test]
    async fn system_exit_preempts_other_waits() {
        let (dispatcher, tx) = harness();
        let mut watcher = dispatcher.register(&[
            NotificationKind::ProcessExited,
            NotificationKind::SystemExited,
        ]);

        tx.send(notification(
            watcher.context(),
            NotificationKind::SystemExited,
            0,
        ))
        .unwrap();

        let err = watcher
            .wait_for(NotificationKind::ProcessExited, Some(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, HcsliteError::UnexpectedContainerExit));
    }

    #[tokio::test]
    async fn system_exit_resolves_its_own_wait() {
        let (dispatcher, tx) = harness();
        let mut watcher = dispatcher.register(&[NotificationKind::SystemExited]);

        tx.send(notification(
            watcher.context(),
            NotificationKind::SystemExited,
            0,
        ))
        .unwrap();

        watcher
            .wait_for(NotificationKind::SystemExited, Some(Duration::from_secs(1)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn disconnect_aborts_waits() {
        let (dispatcher, tx) = harness();
        let mut watcher = dispatcher.register(&[NotificationKind::ProcessExited]);

        tx.send(notification(7777, NotificationKind::ServiceDisconnect, 0))
            .unwrap();

        let err = watcher
            .wait_for(NotificationKind::ProcessExited, Some(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, HcsliteError::UnexpectedProcessAbort));
    }

    #[tokio::test]
    async fn stream_end_counts_as_disconnect() {
        let (dispatcher, tx) = harness();
        let mut watcher = dispatcher.register(&[NotificationKind::ProcessExited]);

        drop(tx);

        let err = watcher
            .wait_for(NotificationKind::ProcessExited, Some(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, HcsliteError::UnexpectedProcessAbort));
    }

    #[tokio::test]
    async fn timeout_elapses() {
        let (dispatcher, _tx) = harness();
        let mut watcher = dispatcher.register(&[NotificationKind::ProcessExited]);

        let err = watcher
            .wait_for(
                NotificationKind::ProcessExited,
                Some(Duration::from_millis(20)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HcsliteError::Timeout(_)));
    }

    #[tokio::test]
    async fn per_context_order_is_preserved() {
        let (dispatcher, tx) = harness();
        let mut watcher = dispatcher.register(&[NotificationKind::ProcessExited]);

        for code in [-1, 0] {
            tx.send(notification(
                watcher.context(),
                NotificationKind::ProcessExited,
                code,
            ))
            .unwrap();
        }

        // First the failure, then the success, in source order.
        let err = watcher
            .wait_for(NotificationKind::ProcessExited, Some(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, HcsliteError::Compute { .. }));
        watcher
            .wait_for(NotificationKind::ProcessExited, Some(Duration::from_secs(1)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_context_is_dropped() {
        let (dispatcher, tx) = harness();
        let mut watcher = dispatcher.register(&[NotificationKind::ProcessExited]);

        // Nothing registered under this context; the dispatcher must absorb it.
        tx.send(notification(999_999, NotificationKind::ProcessExited, 0))
            .unwrap();

        let err = watcher
            .wait_for(
                NotificationKind::ProcessExited,
                Some(Duration::from_millis(20)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HcsliteError::Timeout(_)));
    }

    #[tokio::test]
    async fn contexts_are_never_reused() {
        let (dispatcher, _tx) = harness();
        let first = dispatcher.register(&[NotificationKind::ProcessExited]);
        let first_context = first.context();
        drop(first);

        let second = dispatcher.register(&[NotificationKind::ProcessExited]);
        assert!(second.context() > first_context);
        assert!(!dispatcher.registered(first_context));
    }
}
