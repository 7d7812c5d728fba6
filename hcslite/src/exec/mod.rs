//! Exec objects.
//!
//! An [`Exec`] is one OS-level process inside the task's compute system:
//! the init process (empty id) or an additional process added later. It
//! owns the process handle, the stdio relay, and the exit latch, and
//! enforces the lifecycle state machine in [`state`].

pub mod state;

use crate::compute::{ComputeProcess, ComputeSystem, NotificationKind, ProcessConfig};
use crate::config::Config;
use crate::latch::{ExitLatch, ExitStatus};
use crate::notify::{NotificationDispatcher, Watcher};
use crate::relay::{StdioRelay, StdioSet};
use hcslite_shared::constants::{exit, signals};
use hcslite_shared::{HcsliteError, HcsliteResult};
use oci_spec::runtime::Process;
use state::{ExecState, ExecStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Point-in-time view of an exec, for the `State` handler.
#[derive(Debug, Clone)]
pub struct ExecSnapshot {
    pub id: String,
    pub pid: u32,
    pub status: ExecStatus,
    pub terminal: bool,
    pub stdio: StdioSet,
    pub exit: Option<ExitStatus>,
}

struct Inner {
    state: ExecState,
    pid: u32,
    relay: Option<StdioRelay>,
    process: Option<Arc<dyn ComputeProcess>>,
}

/// One process inside the task.
pub struct Exec {
    id: String,
    task_id: String,
    spec: Process,
    stdio: StdioSet,
    latch: Arc<ExitLatch>,
    inner: Mutex<Inner>,
}

impl Exec {
    pub fn new(id: impl Into<String>, task_id: impl Into<String>, spec: Process, stdio: StdioSet) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            task_id: task_id.into(),
            spec,
            stdio,
            latch: Arc::new(ExitLatch::new()),
            inner: Mutex::new(Inner {
                state: ExecState::new(),
                pid: 0,
                relay: None,
                process: None,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The empty id is reserved for the task's init process.
    pub fn is_init(&self) -> bool {
        self.id.is_empty()
    }

    pub fn latch(&self) -> Arc<ExitLatch> {
        Arc::clone(&self.latch)
    }

    pub async fn pid(&self) -> u32 {
        self.inner.lock().await.pid
    }

    pub async fn status(&self) -> ExecStatus {
        self.inner.lock().await.state.status()
    }

    /// Start the backend process: dial stdio, create the process, spawn the
    /// relay pumps, and register the exit watcher. Requires `Created`.
    pub async fn start(
        self: &Arc<Self>,
        system: &Arc<dyn ComputeSystem>,
        dispatcher: &Arc<NotificationDispatcher>,
        config: &Config,
    ) -> HcsliteResult<u32> {
        let mut inner = self.inner.lock().await;
        if !inner.state.status().can_start() {
            return Err(HcsliteError::FailedPrecondition(format!(
                "exec {:?} is {}; cannot start",
                self.id,
                inner.state.status()
            )));
        }

        let mut relay = StdioRelay::connect(&self.stdio, config.io_dial_timeout).await?;

        // Register before creation so no exit callback can be missed.
        let watcher = dispatcher.register(&[
            NotificationKind::ProcessExited,
            NotificationKind::SystemExited,
        ]);

        let process_config = self.process_config(watcher.context());
        let (process, io) = tokio::time::timeout(
            config.process_create_timeout,
            system.create_process(process_config),
        )
        .await
        .map_err(|_| HcsliteError::Timeout(format!("create process {:?}", self.id)))??;

        relay.start(&self.label(), io);

        inner.state.transition_to(ExecStatus::Running)?;
        inner.pid = process.pid();
        inner.relay = Some(relay);
        inner.process = Some(Arc::clone(&process));
        let pid = inner.pid;
        drop(inner);

        self.spawn_exit_monitor(process, watcher, config.io_drain_grace);

        debug!(task_id = %self.task_id, exec_id = %self.id, pid, "exec started");
        Ok(pid)
    }

    /// Start a sandbox init exec: no backend process of its own, the
    /// utility VM is the workload. The caller supplies the VM's surrogate
    /// pid and the watcher registered when the system was created.
    pub async fn start_as_sandbox(
        self: &Arc<Self>,
        pid: u32,
        mut watcher: Watcher,
        grace: Duration,
    ) -> HcsliteResult<u32> {
        {
            let mut inner = self.inner.lock().await;
            if !inner.state.status().can_start() {
                return Err(HcsliteError::FailedPrecondition(format!(
                    "exec {:?} is {}; cannot start",
                    self.id,
                    inner.state.status()
                )));
            }
            inner.state.transition_to(ExecStatus::Running)?;
            inner.pid = pid;
        }

        let exec = Arc::clone(self);
        tokio::spawn(async move {
            let exit_code = match watcher.wait_for(NotificationKind::SystemExited, None).await {
                Ok(()) => 0,
                Err(err) => {
                    debug!(task_id = %exec.task_id, error = %err, "utility vm wait ended");
                    255
                }
            };
            exec.finish(exit_code, None, grace).await;
        });

        Ok(pid)
    }

    fn spawn_exit_monitor(
        self: &Arc<Self>,
        process: Arc<dyn ComputeProcess>,
        mut watcher: Watcher,
        grace: Duration,
    ) {
        let exec = Arc::clone(self);
        tokio::spawn(async move {
            let exit_code = match watcher.wait_for(NotificationKind::ProcessExited, None).await {
                Ok(()) => process.exit_code().await.unwrap_or_else(|err| {
                    warn!(
                        task_id = %exec.task_id,
                        exec_id = %exec.id,
                        error = %err,
                        "failed to read exit code"
                    );
                    255
                }),
                Err(HcsliteError::UnexpectedContainerExit) => {
                    debug!(
                        task_id = %exec.task_id,
                        exec_id = %exec.id,
                        "container exited before process"
                    );
                    255
                }
                Err(err) => {
                    warn!(
                        task_id = %exec.task_id,
                        exec_id = %exec.id,
                        error = %err,
                        "exit watch aborted"
                    );
                    255
                }
            };
            exec.finish(exit_code, Some(process), grace).await;
        });
    }

    /// Record the exit: set the latch, transition to Exited, and drain the
    /// relay within the grace window, force-closing the backend handles on
    /// overrun. Safe to call from multiple paths; only the first wins.
    async fn finish(&self, exit_code: u32, process: Option<Arc<dyn ComputeProcess>>, grace: Duration) {
        let (relay, handle) = {
            let mut inner = self.inner.lock().await;
            if inner.state.status().is_exited() {
                return;
            }
            if let Err(err) = inner.state.transition_to(ExecStatus::Exited) {
                warn!(exec_id = %self.id, error = %err, "exit transition rejected");
                return;
            }
            self.latch.set(ExitStatus::now(inner.pid, exit_code));
            (inner.relay.take(), process.or_else(|| inner.process.clone()))
        };

        if let Some(mut relay) = relay {
            if !relay.drain(grace).await {
                warn!(
                    task_id = %self.task_id,
                    exec_id = %self.id,
                    "stdio did not drain within grace window; force-closing handles"
                );
                if let Some(process) = handle {
                    let _ = process.close().await;
                }
            }
            relay.shutdown();
        }

        debug!(task_id = %self.task_id, exec_id = %self.id, exit_code, "exec exited");
    }

    /// Deliver `signal` to the process.
    ///
    /// In `Created`, only terminal signals are accepted and short-circuit
    /// the exec straight to `Exited` with the forced exit code. In
    /// `Exited`, terminal signals are ignored and anything else reports the
    /// exec as already stopped.
    pub async fn kill(&self, signal: u32, config: &Config) -> HcsliteResult<()> {
        let process = {
            let mut inner = self.inner.lock().await;
            match inner.state.status() {
                ExecStatus::Created => {
                    if !signals::is_terminal(signal) {
                        return Err(HcsliteError::FailedPrecondition(format!(
                            "exec {:?} not started; cannot deliver signal {signal}",
                            self.id
                        )));
                    }
                    inner.state.transition_to(ExecStatus::Exited)?;
                    self.latch.set(ExitStatus::now(inner.pid, exit::FORCED));
                    return Ok(());
                }
                ExecStatus::Running => inner.process.clone().ok_or_else(|| {
                    HcsliteError::Internal(format!("running exec {:?} has no process", self.id))
                })?,
                ExecStatus::Exited => {
                    if signals::is_terminal(signal) {
                        return Ok(());
                    }
                    return Err(HcsliteError::FailedPrecondition(format!(
                        "exec {:?} already stopped",
                        self.id
                    )));
                }
            }
        };

        tokio::time::timeout(config.signal_timeout, process.signal(signal))
            .await
            .map_err(|_| HcsliteError::Timeout(format!("signal {signal} to exec {:?}", self.id)))?
    }

    /// Force the exec down as part of the task cascade: best-effort kill of
    /// the backend process, then record the forced exit status.
    pub async fn force_exit(&self, exit_code: u32, config: &Config) {
        let process = {
            let inner = self.inner.lock().await;
            if inner.state.status().is_exited() {
                return;
            }
            inner.process.clone()
        };

        if let Some(process) = &process {
            if let Err(err) = process.signal(signals::SIGKILL).await {
                debug!(exec_id = %self.id, error = %err, "cascade kill signal failed");
            }
        }

        self.finish(exit_code, process, config.io_drain_grace).await;
    }

    /// Resize the console. Requires a terminal exec in `Running`.
    pub async fn resize_pty(&self, width: u16, height: u16) -> HcsliteResult<()> {
        if !self.stdio.terminal {
            return Err(HcsliteError::FailedPrecondition(format!(
                "exec {:?} has no terminal",
                self.id
            )));
        }
        let process = {
            let inner = self.inner.lock().await;
            if !inner.state.status().can_resize() {
                return Err(HcsliteError::FailedPrecondition(format!(
                    "exec {:?} is {}; cannot resize",
                    self.id,
                    inner.state.status()
                )));
            }
            inner.process.clone().ok_or_else(|| {
                HcsliteError::Internal(format!("running exec {:?} has no process", self.id))
            })?
        };
        process.resize_console(width, height).await
    }

    /// Close the stdin side of the relay and the backend's stdin handle.
    /// Valid in any state.
    pub async fn close_io(&self) -> HcsliteResult<()> {
        let process = {
            let mut inner = self.inner.lock().await;
            if let Some(relay) = inner.relay.as_mut() {
                relay.close_stdin();
            }
            inner.process.clone()
        };
        if let Some(process) = process {
            if let Err(err) = process.close_stdin().await {
                debug!(exec_id = %self.id, error = %err, "backend stdin close failed");
            }
        }
        Ok(())
    }

    /// Wait for the exit latch.
    pub async fn wait(&self) -> ExitStatus {
        self.latch.wait().await
    }

    pub async fn snapshot(&self) -> ExecSnapshot {
        let inner = self.inner.lock().await;
        ExecSnapshot {
            id: self.id.clone(),
            pid: inner.pid,
            status: inner.state.status(),
            terminal: self.stdio.terminal,
            stdio: self.stdio.clone(),
            exit: self.latch.get(),
        }
    }

    /// Release the exec. Requires `Exited`; closes the relay and the
    /// backend handle and returns the final exit status.
    pub async fn delete(&self) -> HcsliteResult<ExitStatus> {
        let process = {
            let mut inner = self.inner.lock().await;
            if !inner.state.status().can_delete() {
                return Err(HcsliteError::FailedPrecondition(format!(
                    "exec {:?} is {}; delete requires exited",
                    self.id,
                    inner.state.status()
                )));
            }
            if let Some(mut relay) = inner.relay.take() {
                relay.shutdown();
            }
            inner.process.take()
        };

        if let Some(process) = process {
            if let Err(err) = process.close().await {
                debug!(exec_id = %self.id, error = %err, "process handle close failed");
            }
        }

        Ok(self.latch.get().unwrap_or_default())
    }

    fn label(&self) -> String {
        if self.is_init() {
            self.task_id.clone()
        } else {
            format!("{}/{}", self.task_id, self.id)
        }
    }

    fn process_config(&self, context: u64) -> ProcessConfig {
        ProcessConfig {
            args: self.spec.args().clone().unwrap_or_default(),
            env: self.spec.env().clone().unwrap_or_default(),
            working_dir: self.spec.cwd().to_string_lossy().into_owned(),
            user: self.spec.user().username().clone(),
            emulate_console: self.stdio.terminal,
            create_stdin: self.stdio.has_stdin(),
            create_stdout: self.stdio.has_stdout(),
            create_stderr: self.stdio.has_stderr(),
            host_process: false,
            context,
        }
    }
}
