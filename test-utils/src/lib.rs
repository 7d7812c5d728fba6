//! In-process mock compute backend for hcslite tests.
//!
//! Implements the compute traits with no platform underneath: systems and
//! processes are bookkeeping entries, stdio is duplex pipes, and exits are
//! injected through [`MockController`] exactly the way the real service
//! would deliver them (as notifications tagged with context ids).

use async_trait::async_trait;
use hcslite::compute::{
    ComputeBackend, ComputeProcess, ComputeSystem, Notification, NotificationKind, ProcessConfig,
    ProcessIo, Resources, SystemConfig, SystemStats,
};
use hcslite_shared::constants::signals;
use hcslite_shared::{HcsliteError, HcsliteResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

const PID_BASE: u32 = 1000;

struct SystemEntry {
    context: u64,
    started: AtomicBool,
    terminated: AtomicBool,
    /// Contexts of opened handles (utility-VM sharing).
    extra_contexts: Mutex<Vec<u64>>,
    /// Contexts of processes hosted by this system.
    process_contexts: Mutex<Vec<u64>>,
    modifications: Mutex<Vec<Resources>>,
}

struct ProcessEntry {
    context: u64,
    system: String,
    exit_code: Mutex<Option<u32>>,
    signals: Mutex<Vec<u32>>,
    stdin_closed: AtomicBool,
    closed: AtomicBool,
    /// Far ends of the duplex stdio, takeable by tests.
    stdin_far: Mutex<Option<DuplexStream>>,
    stdout_far: Mutex<Option<DuplexStream>>,
    stderr_far: Mutex<Option<DuplexStream>>,
}

struct MockState {
    tx: mpsc::UnboundedSender<Notification>,
    next_pid: AtomicU32,
    systems: Mutex<HashMap<String, Arc<SystemEntry>>>,
    processes: Mutex<HashMap<u32, Arc<ProcessEntry>>>,
    fail_next_create: AtomicBool,
}

impl MockState {
    fn notify(&self, context: u64, kind: NotificationKind, result_code: i32) {
        let _ = self.tx.send(Notification {
            context,
            kind,
            result_code,
            detail: None,
        });
    }

    /// Deliver `SystemExited` to the system's own context, every opened
    /// handle's context, and every hosted process's context, matching the
    /// callback contract the dispatcher relies on.
    fn broadcast_system_exit(&self, system_id: &str, result_code: i32) {
        let entry = match self.systems.lock().get(system_id) {
            Some(entry) => Arc::clone(entry),
            None => return,
        };
        let mut contexts = vec![entry.context];
        contexts.extend(entry.extra_contexts.lock().iter().copied());
        contexts.extend(entry.process_contexts.lock().iter().copied());
        for context in contexts {
            self.notify(context, NotificationKind::SystemExited, result_code);
        }
    }
}

/// The mock backend handed to a service under test.
pub struct MockBackend {
    state: Arc<MockState>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Notification>>>,
}

impl MockBackend {
    pub fn new() -> (Arc<Self>, MockController) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(MockState {
            tx,
            next_pid: AtomicU32::new(PID_BASE),
            systems: Mutex::new(HashMap::new()),
            processes: Mutex::new(HashMap::new()),
            fail_next_create: AtomicBool::new(false),
        });
        let backend = Arc::new(Self {
            state: Arc::clone(&state),
            rx: Mutex::new(Some(rx)),
        });
        (backend, MockController { state })
    }
}

#[async_trait]
impl ComputeBackend for MockBackend {
    async fn create_system(&self, config: SystemConfig) -> HcsliteResult<Arc<dyn ComputeSystem>> {
        if self.state.fail_next_create.swap(false, Ordering::AcqRel) {
            return Err(HcsliteError::compute(-1, "injected create failure"));
        }

        let entry = Arc::new(SystemEntry {
            context: config.context,
            started: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            extra_contexts: Mutex::new(Vec::new()),
            process_contexts: Mutex::new(Vec::new()),
            modifications: Mutex::new(Vec::new()),
        });
        self.state
            .systems
            .lock()
            .insert(config.id.clone(), Arc::clone(&entry));
        self.state
            .notify(config.context, NotificationKind::SystemCreated, 0);

        Ok(Arc::new(MockSystem {
            id: config.id,
            context: config.context,
            entry,
            state: Arc::clone(&self.state),
        }))
    }

    async fn open_system(&self, id: &str, context: u64) -> HcsliteResult<Arc<dyn ComputeSystem>> {
        let entry = self
            .state
            .systems
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| HcsliteError::NotFound(format!("compute system {id}")))?;
        entry.extra_contexts.lock().push(context);

        Ok(Arc::new(MockSystem {
            id: id.to_string(),
            context,
            entry,
            state: Arc::clone(&self.state),
        }))
    }

    fn take_notifications(&self) -> HcsliteResult<mpsc::UnboundedReceiver<Notification>> {
        self.rx.lock().take().ok_or_else(|| {
            HcsliteError::FailedPrecondition("notification stream already taken".into())
        })
    }
}

struct MockSystem {
    id: String,
    context: u64,
    entry: Arc<SystemEntry>,
    state: Arc<MockState>,
}

#[async_trait]
impl ComputeSystem for MockSystem {
    fn id(&self) -> &str {
        &self.id
    }

    fn context(&self) -> u64 {
        self.context
    }

    fn pid(&self) -> u32 {
        // Surrogate worker pid, stable per system.
        PID_BASE - 1
    }

    async fn start(&self) -> HcsliteResult<()> {
        if self.entry.terminated.load(Ordering::Acquire) {
            return Err(HcsliteError::FailedPrecondition(format!(
                "system {} already terminated",
                self.id
            )));
        }
        self.entry.started.store(true, Ordering::Release);
        self.state
            .notify(self.entry.context, NotificationKind::SystemStarted, 0);
        Ok(())
    }

    async fn create_process(
        &self,
        config: ProcessConfig,
    ) -> HcsliteResult<(Arc<dyn ComputeProcess>, ProcessIo)> {
        if !self.entry.started.load(Ordering::Acquire) {
            return Err(HcsliteError::FailedPrecondition(format!(
                "system {} is not running",
                self.id
            )));
        }
        if config.args.is_empty() && !config.host_process {
            return Err(HcsliteError::InvalidArgument("process has no args".into()));
        }

        let pid = self.state.next_pid.fetch_add(1, Ordering::Relaxed);

        let mut io = ProcessIo {
            stdin: None,
            stdout: None,
            stderr: None,
        };
        let mut stdin_far = None;
        let mut stdout_far = None;
        let mut stderr_far = None;
        if config.create_stdin {
            let (near, far) = tokio::io::duplex(64 * 1024);
            io.stdin = Some(Box::new(near));
            stdin_far = Some(far);
        }
        if config.create_stdout {
            let (near, far) = tokio::io::duplex(64 * 1024);
            io.stdout = Some(Box::new(near));
            stdout_far = Some(far);
        }
        if config.create_stderr && !config.emulate_console {
            let (near, far) = tokio::io::duplex(64 * 1024);
            io.stderr = Some(Box::new(near));
            stderr_far = Some(far);
        }

        let entry = Arc::new(ProcessEntry {
            context: config.context,
            system: self.id.clone(),
            exit_code: Mutex::new(None),
            signals: Mutex::new(Vec::new()),
            stdin_closed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stdin_far: Mutex::new(stdin_far),
            stdout_far: Mutex::new(stdout_far),
            stderr_far: Mutex::new(stderr_far),
        });
        self.state.processes.lock().insert(pid, Arc::clone(&entry));
        self.entry.process_contexts.lock().push(config.context);

        let process = MockProcess {
            pid,
            entry,
            state: Arc::clone(&self.state),
        };
        Ok((Arc::new(process) as Arc<dyn ComputeProcess>, io))
    }

    async fn terminate(&self) -> HcsliteResult<()> {
        if !self.entry.terminated.swap(true, Ordering::AcqRel) {
            self.state.broadcast_system_exit(&self.id, 0);
        }
        Ok(())
    }

    async fn shutdown(&self) -> HcsliteResult<()> {
        self.terminate().await
    }

    async fn stats(&self) -> HcsliteResult<SystemStats> {
        let mut stats = SystemStats::default();
        stats.processor.total_runtime_ns = 1_000_000;
        stats.memory.working_set_bytes = 4096;
        Ok(stats)
    }

    async fn modify(&self, resources: Resources) -> HcsliteResult<()> {
        self.entry.modifications.lock().push(resources);
        Ok(())
    }

    async fn close(&self) -> HcsliteResult<()> {
        Ok(())
    }
}

struct MockProcess {
    pid: u32,
    entry: Arc<ProcessEntry>,
    state: Arc<MockState>,
}

#[async_trait]
impl ComputeProcess for MockProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn context(&self) -> u64 {
        self.entry.context
    }

    async fn signal(&self, signal: u32) -> HcsliteResult<()> {
        self.entry.signals.lock().push(signal);
        if signals::is_terminal(signal) {
            let mut exit_code = self.entry.exit_code.lock();
            if exit_code.is_none() {
                *exit_code = Some(128 + signal);
                drop(exit_code);
                self.state
                    .notify(self.entry.context, NotificationKind::ProcessExited, 0);
            }
        }
        Ok(())
    }

    async fn resize_console(&self, _width: u16, _height: u16) -> HcsliteResult<()> {
        Ok(())
    }

    async fn exit_code(&self) -> HcsliteResult<u32> {
        (*self.entry.exit_code.lock()).ok_or_else(|| {
            HcsliteError::FailedPrecondition(format!("process {} has not exited", self.pid))
        })
    }

    async fn close_stdin(&self) -> HcsliteResult<()> {
        self.entry.stdin_closed.store(true, Ordering::Release);
        *self.entry.stdin_far.lock() = None;
        Ok(())
    }

    async fn close(&self) -> HcsliteResult<()> {
        self.entry.closed.store(true, Ordering::Release);
        // Dropping the far ends EOFs any relay still pumping.
        *self.entry.stdin_far.lock() = None;
        *self.entry.stdout_far.lock() = None;
        *self.entry.stderr_far.lock() = None;
        Ok(())
    }
}

/// Test-side remote control over the mock platform.
#[derive(Clone)]
pub struct MockController {
    state: Arc<MockState>,
}

impl MockController {
    /// Make the process exit with `exit_code` and deliver the notification.
    pub fn exit_process(&self, pid: u32, exit_code: u32) {
        let entry = match self.state.processes.lock().get(&pid) {
            Some(entry) => Arc::clone(entry),
            None => return,
        };
        {
            let mut slot = entry.exit_code.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(exit_code);
        }
        // EOF the output streams, then report the exit.
        *entry.stdout_far.lock() = None;
        *entry.stderr_far.lock() = None;
        self.state
            .notify(entry.context, NotificationKind::ProcessExited, 0);
    }

    /// Deliver a failed process-exit notification (negative status).
    pub fn fail_process(&self, pid: u32, hresult: i32) {
        let entry = match self.state.processes.lock().get(&pid) {
            Some(entry) => Arc::clone(entry),
            None => return,
        };
        self.state
            .notify(entry.context, NotificationKind::ProcessExited, hresult);
    }

    /// Tear the whole system down: every registered context observes
    /// `SystemExited`.
    pub fn exit_system(&self, system_id: &str) {
        if let Some(entry) = self.state.systems.lock().get(system_id) {
            entry.terminated.store(true, Ordering::Release);
        }
        self.state.broadcast_system_exit(system_id, 0);
    }

    /// Report memory pressure for the system.
    pub fn report_oom(&self, system_id: &str) {
        if let Some(entry) = self.state.systems.lock().get(system_id) {
            self.state
                .notify(entry.context, NotificationKind::OutOfMemory, 0);
        }
    }

    /// Simulate the compute service dropping its callback connection.
    pub fn disconnect(&self) {
        self.state.notify(0, NotificationKind::ServiceDisconnect, 0);
    }

    /// Fail the next `create_system` call.
    pub fn fail_next_create(&self) {
        self.state.fail_next_create.store(true, Ordering::Release);
    }

    pub fn signals_of(&self, pid: u32) -> Vec<u32> {
        self.state
            .processes
            .lock()
            .get(&pid)
            .map(|entry| entry.signals.lock().clone())
            .unwrap_or_default()
    }

    pub fn process_closed(&self, pid: u32) -> bool {
        self.state
            .processes
            .lock()
            .get(&pid)
            .map(|entry| entry.closed.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn stdin_closed(&self, pid: u32) -> bool {
        self.state
            .processes
            .lock()
            .get(&pid)
            .map(|entry| entry.stdin_closed.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn modifications(&self, system_id: &str) -> usize {
        self.state
            .systems
            .lock()
            .get(system_id)
            .map(|entry| entry.modifications.lock().len())
            .unwrap_or(0)
    }

    pub fn system_terminated(&self, system_id: &str) -> bool {
        self.state
            .systems
            .lock()
            .get(system_id)
            .map(|entry| entry.terminated.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Take the far end of the process's stdout to write workload output.
    pub fn take_stdout(&self, pid: u32) -> Option<DuplexStream> {
        self.state
            .processes
            .lock()
            .get(&pid)
            .and_then(|entry| entry.stdout_far.lock().take())
    }

    /// Take the far end of the process's stdin to read what the workload
    /// would see.
    pub fn take_stdin(&self, pid: u32) -> Option<DuplexStream> {
        self.state
            .processes
            .lock()
            .get(&pid)
            .and_then(|entry| entry.stdin_far.lock().take())
    }
}

/// Minimal OCI bundle config for tests.
pub mod bundle {
    use std::path::Path;

    pub enum BundleOs {
        Windows,
        Linux,
    }

    /// Write a loadable `config.json` into `dir`.
    pub fn write_config(dir: &Path, os: BundleOs, annotations: &[(&str, &str)]) {
        let annotations: serde_json::Map<String, serde_json::Value> = annotations
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
            .collect();

        let (cwd, os_section, os_value) = match os {
            BundleOs::Windows => (
                "C:\\",
                "windows",
                serde_json::json!({ "layerFolders": ["C:\\layers\\base", "C:\\layers\\scratch"] }),
            ),
            BundleOs::Linux => ("/", "linux", serde_json::json!({})),
        };

        let mut config = serde_json::json!({
            "ociVersion": "1.1.0",
            "process": {
                "terminal": false,
                "user": { "uid": 0, "gid": 0 },
                "args": ["app", "serve"],
                "env": ["PATH=/usr/bin"],
                "cwd": cwd,
            },
            "root": { "path": "rootfs" },
            "annotations": annotations,
        });
        config[os_section] = os_value;

        std::fs::write(
            dir.join("config.json"),
            serde_json::to_vec_pretty(&config).unwrap(),
        )
        .unwrap();
    }
}
