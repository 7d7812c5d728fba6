//! Utility-VM handle.
//!
//! A sandbox task owns the utility VM it started; container tasks joining
//! the sandbox open the same compute system by id and share it through
//! this handle. The VM is released when the last holder drops its handle
//! and the owner has closed it.

use crate::compute::{ComputeSystem, NotificationKind, ProcessConfig};
use crate::config::Config;
use crate::notify::{NotificationDispatcher, Watcher};
use hcslite_shared::{HcsliteError, HcsliteResult};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A command to run inside the utility VM itself, outside any container.
#[derive(Debug, Clone, Default)]
pub struct HostProcessRequest {
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: String,
    pub timeout: Option<Duration>,
}

/// Shared handle to a running utility VM.
pub struct UtilityVm {
    system: Arc<dyn ComputeSystem>,
    dispatcher: Arc<NotificationDispatcher>,
    config: Config,
    // Keeps the open-system registration alive for shared holders.
    open_watcher: Mutex<Option<Watcher>>,
}

impl UtilityVm {
    /// Wrap a VM system this task created (sandbox owner).
    pub fn new(
        system: Arc<dyn ComputeSystem>,
        dispatcher: Arc<NotificationDispatcher>,
        config: Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            system,
            dispatcher,
            config,
            open_watcher: Mutex::new(None),
        })
    }

    /// Wrap a VM system opened by id (container joining a sandbox). The
    /// watcher carries the context the opened handle was registered under.
    pub fn opened(
        system: Arc<dyn ComputeSystem>,
        dispatcher: Arc<NotificationDispatcher>,
        config: Config,
        watcher: Watcher,
    ) -> Arc<Self> {
        Arc::new(Self {
            system,
            dispatcher,
            config,
            open_watcher: Mutex::new(Some(watcher)),
        })
    }

    pub fn system(&self) -> &Arc<dyn ComputeSystem> {
        &self.system
    }

    /// Surrogate pid of the VM worker process.
    pub fn pid(&self) -> u32 {
        self.system.pid()
    }

    /// Run a command in the VM and return its exit code.
    pub async fn exec(&self, request: HostProcessRequest) -> HcsliteResult<u32> {
        let mut watcher = self.dispatcher.register(&[
            NotificationKind::ProcessExited,
            NotificationKind::SystemExited,
        ]);

        let process_config = ProcessConfig {
            args: request.args,
            env: request.env,
            working_dir: request.working_dir,
            user: None,
            emulate_console: false,
            create_stdin: false,
            create_stdout: false,
            create_stderr: false,
            host_process: true,
            context: watcher.context(),
        };

        let (process, _io) = tokio::time::timeout(
            self.config.process_create_timeout,
            self.system.create_process(process_config),
        )
        .await
        .map_err(|_| HcsliteError::Timeout("create host process".into()))??;

        watcher
            .wait_for(NotificationKind::ProcessExited, request.timeout)
            .await?;

        let exit_code = process.exit_code().await?;
        if let Err(err) = process.close().await {
            debug!(error = %err, "host process close failed");
        }
        Ok(exit_code)
    }

    /// Close this holder's handle to the VM.
    pub async fn release(&self) {
        if let Err(err) = self.system.close().await {
            debug!(vm = %self.system.id(), error = %err, "vm handle close failed");
        }
        *self.open_watcher.lock() = None;
    }
}
