//! Compute-backend contract.
//!
//! The platform compute service (HCS) is an external collaborator: the shim
//! only ever talks to it through these traits. The real client lives in
//! [`hcs`] and is Windows-only; tests run against the in-process mock from
//! `hcslite-test-utils`.
//!
//! Callback discipline: the backend owns exactly one notification stream
//! per process (taken once via [`ComputeBackend::take_notifications`]).
//! Every system and process is created with a caller-allocated numeric
//! context; the backend tags each callback with that context. When a system
//! dies, the backend must deliver `SystemExited` to the system's own
//! context *and* to the context of every process it hosted, so that
//! process-level waits can observe the container going away.

pub mod types;

#[cfg(windows)]
pub mod hcs;

use async_trait::async_trait;
use hcslite_shared::HcsliteResult;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use types::{
    MemoryStats, MountSpec, Notification, NotificationKind, OsFlavor, ProcessConfig, ProcessIo,
    ProcessorStats, Resources, SystemConfig, SystemStats, TaskStats,
};

/// Entry point to the platform compute service.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Create (but do not start) a compute system. The caller applies its
    /// own deadline around this call.
    async fn create_system(&self, config: SystemConfig) -> HcsliteResult<Arc<dyn ComputeSystem>>;

    /// Open an already-running compute system by id (utility-VM sharing
    /// under a sandbox). The opened handle observes callbacks under
    /// `context`.
    async fn open_system(&self, id: &str, context: u64)
        -> HcsliteResult<Arc<dyn ComputeSystem>>;

    /// Take the process-wide notification stream. There is exactly one;
    /// a second take is a caller bug and fails with FailedPrecondition.
    fn take_notifications(&self) -> HcsliteResult<mpsc::UnboundedReceiver<Notification>>;
}

/// One compute system: a container or a utility VM.
#[async_trait]
pub trait ComputeSystem: Send + Sync {
    fn id(&self) -> &str;

    /// Notification context this system's callbacks are tagged with.
    fn context(&self) -> u64;

    /// Platform pid surrogate for the system (the VM worker process for a
    /// utility VM, 0 when the platform does not report one).
    fn pid(&self) -> u32;

    async fn start(&self) -> HcsliteResult<()>;

    /// Create a process in the system. Returns the process handle plus the
    /// host-side ends of its standard streams.
    async fn create_process(
        &self,
        config: ProcessConfig,
    ) -> HcsliteResult<(Arc<dyn ComputeProcess>, ProcessIo)>;

    /// Forceful teardown of the whole system.
    async fn terminate(&self) -> HcsliteResult<()>;

    /// Graceful shutdown request.
    async fn shutdown(&self) -> HcsliteResult<()>;

    async fn stats(&self) -> HcsliteResult<SystemStats>;

    async fn modify(&self, resources: Resources) -> HcsliteResult<()>;

    /// Release the handle. Idempotent.
    async fn close(&self) -> HcsliteResult<()>;
}

/// One process inside a compute system.
#[async_trait]
pub trait ComputeProcess: Send + Sync {
    fn pid(&self) -> u32;

    /// Notification context this process's callbacks are tagged with.
    fn context(&self) -> u64;

    /// Deliver a signal. Terminal signals become a platform terminate;
    /// everything else is forwarded as-is where the guest supports it.
    async fn signal(&self, signal: u32) -> HcsliteResult<()>;

    async fn resize_console(&self, width: u16, height: u16) -> HcsliteResult<()>;

    /// Exit code of the process. Only meaningful after the backend has
    /// delivered the process-exited notification.
    async fn exit_code(&self) -> HcsliteResult<u32>;

    /// Close the backend side of stdin, signalling EOF to the guest.
    async fn close_stdin(&self) -> HcsliteResult<()>;

    /// Release the process handle, force-closing any remaining stream
    /// handles so blocked readers unblock. Idempotent.
    async fn close(&self) -> HcsliteResult<()>;
}
