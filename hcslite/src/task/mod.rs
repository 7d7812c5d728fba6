//! Task objects.
//!
//! A [`Task`] owns one container (or pod sandbox): its compute system, the
//! init exec, and the map of additional execs. The RPC layer calls the same
//! interface regardless of task kind; sandbox-specific behaviour lives
//! behind [`TaskKind`].

pub mod vm;

use crate::compute::{
    ComputeBackend, ComputeSystem, MountSpec, NotificationKind, OsFlavor, Resources, SystemConfig,
    TaskStats,
};
use crate::config::Config;
use crate::events::EventPublisher;
use crate::exec::{Exec, ExecSnapshot};
use crate::latch::ExitStatus;
use crate::notify::{NotificationDispatcher, Watcher};
use crate::relay::StdioSet;
use hcslite_shared::constants::{annotations, exit};
use hcslite_shared::{time, HcsliteError, HcsliteResult, ProcessInfo, TaskExit, TaskOom};
use oci_spec::runtime::Process;
use parking_lot::Mutex;
use prost::Message;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vm::{HostProcessRequest, UtilityVm};

/// What this task hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// A single container, standalone or inside a sandbox's VM.
    Container,
    /// A pod sandbox: the utility VM is the workload.
    Sandbox,
}

impl TaskKind {
    pub fn is_sandbox(&self) -> bool {
        matches!(self, TaskKind::Sandbox)
    }
}

/// One container lifecycle unit.
pub struct Task {
    id: String,
    kind: TaskKind,
    flavor: OsFlavor,
    bundle: PathBuf,
    sandbox_id: Option<String>,
    system: Arc<dyn ComputeSystem>,
    vm: Option<Arc<UtilityVm>>,
    init: Arc<Exec>,
    execs: Mutex<HashMap<String, Arc<Exec>>>,
    publisher: Arc<EventPublisher>,
    dispatcher: Arc<NotificationDispatcher>,
    config: Config,
    // Registered before system creation; consumed by a sandbox's init.
    system_watcher: Mutex<Option<Watcher>>,
    started: AtomicBool,
    // Cancelled once the post-exit cascade has finished.
    cascade: CancellationToken,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("flavor", &self.flavor)
            .field("bundle", &self.bundle)
            .field("sandbox_id", &self.sandbox_id)
            .field("started", &self.started.load(std::sync::atomic::Ordering::Relaxed))
            .finish()
    }
}

impl Task {
    /// Create the task: load the bundle config, create (or join) the
    /// compute system, and register the init exec in `Created`.
    ///
    /// A failed create leaves nothing behind; the caller only stores the
    /// task on success.
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        id: &str,
        bundle: &Path,
        stdio: StdioSet,
        rootfs: Vec<MountSpec>,
        backend: &Arc<dyn ComputeBackend>,
        dispatcher: &Arc<NotificationDispatcher>,
        publisher: &Arc<EventPublisher>,
        config: &Config,
    ) -> HcsliteResult<Arc<Self>> {
        let spec = oci_spec::runtime::Spec::load(bundle.join("config.json")).map_err(|err| {
            HcsliteError::InvalidArgument(format!("loading bundle config: {err}"))
        })?;

        let flavor = if spec.windows().is_some() {
            OsFlavor::Windows
        } else {
            OsFlavor::LinuxVm
        };

        let spec_annotations = spec.annotations().clone().unwrap_or_default();
        let kind = match spec_annotations
            .get(annotations::CONTAINER_TYPE)
            .map(String::as_str)
        {
            Some(annotations::CONTAINER_TYPE_SANDBOX) => TaskKind::Sandbox,
            _ => TaskKind::Container,
        };
        let sandbox_id = match kind {
            TaskKind::Container => spec_annotations.get(annotations::SANDBOX_ID).cloned(),
            TaskKind::Sandbox => None,
        };

        let process = match kind {
            TaskKind::Sandbox => Process::default(),
            TaskKind::Container => spec.process().clone().ok_or_else(|| {
                HcsliteError::InvalidArgument("bundle config has no process".into())
            })?,
        };

        let hypervisor_isolated = flavor == OsFlavor::LinuxVm
            || kind.is_sandbox()
            || spec
                .windows()
                .as_ref()
                .map(|w| w.hyperv().is_some())
                .unwrap_or(false);

        let system_watcher = dispatcher.register(&[
            NotificationKind::SystemCreated,
            NotificationKind::SystemStarted,
            NotificationKind::SystemExited,
            NotificationKind::OutOfMemory,
        ]);

        let system_config = SystemConfig {
            id: id.to_string(),
            owner: "hcslite-shim".to_string(),
            flavor,
            hypervisor_isolated,
            context: system_watcher.context(),
            memory_limit_bytes: None,
            processor_count: None,
            mounts: rootfs,
        };

        // Join the sandbox's VM before creating the container system, so a
        // missing sandbox fails fast.
        let vm = match &sandbox_id {
            Some(sandbox) => {
                let vm_watcher = dispatcher.register(&[NotificationKind::SystemExited]);
                let vm_system = backend.open_system(sandbox, vm_watcher.context()).await?;
                Some(UtilityVm::opened(
                    vm_system,
                    Arc::clone(dispatcher),
                    config.clone(),
                    vm_watcher,
                ))
            }
            None => None,
        };

        let system = tokio::time::timeout(
            config.system_create_timeout,
            backend.create_system(system_config),
        )
        .await
        .map_err(|_| HcsliteError::Timeout(format!("create compute system {id}")))??;

        let vm = match kind {
            TaskKind::Sandbox => Some(UtilityVm::new(
                Arc::clone(&system),
                Arc::clone(dispatcher),
                config.clone(),
            )),
            TaskKind::Container => vm,
        };

        let init = Exec::new("", id, process, stdio);

        info!(task_id = %id, kind = ?kind, flavor = ?flavor, "task created");
        Ok(Arc::new(Self {
            id: id.to_string(),
            kind,
            flavor,
            bundle: bundle.to_path_buf(),
            sandbox_id,
            system,
            vm,
            init,
            execs: Mutex::new(HashMap::new()),
            publisher: Arc::clone(publisher),
            dispatcher: Arc::clone(dispatcher),
            config: config.clone(),
            system_watcher: Mutex::new(Some(system_watcher)),
            started: AtomicBool::new(false),
            cascade: CancellationToken::new(),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn flavor(&self) -> OsFlavor {
        self.flavor
    }

    pub fn bundle(&self) -> &Path {
        &self.bundle
    }

    pub fn sandbox_id(&self) -> Option<&str> {
        self.sandbox_id.as_deref()
    }

    /// Resolve an exec id: the empty string addresses init, anything else
    /// is looked up in the map.
    pub fn get_exec(&self, exec_id: &str) -> HcsliteResult<Arc<Exec>> {
        if exec_id.is_empty() {
            return Ok(Arc::clone(&self.init));
        }
        self.execs.lock().get(exec_id).cloned().ok_or_else(|| {
            HcsliteError::NotFound(format!("exec {exec_id} in task {}", self.id))
        })
    }

    /// Register a new exec in `Created`.
    pub async fn create_exec(
        &self,
        exec_id: &str,
        spec: Process,
        stdio: StdioSet,
    ) -> HcsliteResult<()> {
        if self.kind.is_sandbox() {
            return Err(HcsliteError::FailedPrecondition(
                "sandbox tasks cannot host execs".into(),
            ));
        }
        if exec_id.is_empty() {
            return Err(HcsliteError::InvalidArgument("exec id is required".into()));
        }
        if !self.init.status().await.is_running() {
            return Err(HcsliteError::FailedPrecondition(format!(
                "task {} is not running; cannot add exec",
                self.id
            )));
        }

        let mut execs = self.execs.lock();
        if execs.contains_key(exec_id) {
            return Err(HcsliteError::AlreadyExists(format!(
                "exec {exec_id} in task {}",
                self.id
            )));
        }
        execs.insert(
            exec_id.to_string(),
            Exec::new(exec_id, &self.id, spec, stdio),
        );
        Ok(())
    }

    /// Start an exec. Starting init also starts the compute system and arms
    /// the exit cascade.
    pub async fn start(self: &Arc<Self>, exec_id: &str) -> HcsliteResult<u32> {
        let exec = self.get_exec(exec_id)?;

        if !exec.status().await.can_start() {
            return Err(HcsliteError::FailedPrecondition(format!(
                "exec {exec_id:?} in task {} cannot be started",
                self.id
            )));
        }

        let pid = if exec.is_init() {
            tokio::time::timeout(self.config.system_start_timeout, self.system.start())
                .await
                .map_err(|_| HcsliteError::Timeout(format!("start compute system {}", self.id)))??;

            let pid = match self.kind {
                TaskKind::Sandbox => {
                    let watcher = self.system_watcher.lock().take().ok_or_else(|| {
                        HcsliteError::FailedPrecondition(format!(
                            "task {} was already started",
                            self.id
                        ))
                    })?;
                    exec.start_as_sandbox(self.system.pid(), watcher, self.config.io_drain_grace)
                        .await?
                }
                TaskKind::Container => {
                    let pid = exec.start(&self.system, &self.dispatcher, &self.config).await?;
                    if let Some(watcher) = self.system_watcher.lock().take() {
                        self.spawn_oom_monitor(watcher);
                    }
                    pid
                }
            };

            self.started.store(true, Ordering::Release);
            self.spawn_init_waiter();
            pid
        } else {
            let pid = exec.start(&self.system, &self.dispatcher, &self.config).await?;
            self.spawn_exec_waiter(Arc::clone(&exec));
            pid
        };

        Ok(pid)
    }

    /// When init exits, every still-live exec is force-killed, relays are
    /// drained, and latches are set; only then is the cascade marked done.
    fn spawn_init_waiter(self: &Arc<Self>) {
        let task = Arc::clone(self);
        tokio::spawn(async move {
            let status = task.init.wait().await;

            let children: Vec<Arc<Exec>> = task.execs.lock().values().cloned().collect();
            for child in children {
                child.force_exit(exit::FORCED, &task.config).await;
            }

            task.publisher
                .publish(&TaskExit {
                    task_id: task.id.clone(),
                    exec_id: String::new(),
                    pid: status.pid,
                    exit_status: status.exit_code,
                    exited_at: Some(time::to_proto(status.exited_at)),
                })
                .await;

            // Releasing the gate is last: init's exit event always lands
            // before the task's delete event.
            task.cascade.cancel();
        });
    }

    /// Relay backend memory-pressure notifications to the manager. Ends
    /// when the container exits (the watcher observes system-exited).
    fn spawn_oom_monitor(self: &Arc<Self>, mut watcher: Watcher) {
        let task = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match watcher
                    .wait_for(NotificationKind::OutOfMemory, None)
                    .await
                {
                    Ok(()) => {
                        task.publisher
                            .publish(&TaskOom {
                                task_id: task.id.clone(),
                            })
                            .await;
                    }
                    Err(_) => break,
                }
            }
        });
    }

    fn spawn_exec_waiter(self: &Arc<Self>, exec: Arc<Exec>) {
        let task = Arc::clone(self);
        tokio::spawn(async move {
            let status = exec.wait().await;
            task.publisher
                .publish(&TaskExit {
                    task_id: task.id.clone(),
                    exec_id: exec.id().to_string(),
                    pid: status.pid,
                    exit_status: status.exit_code,
                    exited_at: Some(time::to_proto(status.exited_at)),
                })
                .await;
        });
    }

    /// Deliver a signal. With `all`, the init exec broadcasts to every
    /// still-live exec in the task.
    pub async fn kill_exec(&self, exec_id: &str, signal: u32, all: bool) -> HcsliteResult<()> {
        let exec = self.get_exec(exec_id)?;
        if all && !exec.is_init() {
            return Err(HcsliteError::InvalidArgument(
                "kill --all requires the init exec".into(),
            ));
        }

        exec.kill(signal, &self.config).await?;

        if all {
            let children: Vec<Arc<Exec>> = self.execs.lock().values().cloned().collect();
            for child in children {
                if child.status().await.is_live() {
                    if let Err(err) = child.kill(signal, &self.config).await {
                        debug!(
                            task_id = %self.id,
                            exec_id = %child.id(),
                            error = %err,
                            "broadcast kill failed"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Delete an exec. Deleting init requires the exec map to be empty
    /// (every child deleted first) and tears the compute system down; the
    /// caller removes the task from the service afterwards.
    pub async fn delete_exec(&self, exec_id: &str) -> HcsliteResult<ExitStatus> {
        let exec = self.get_exec(exec_id)?;

        if !exec.is_init() {
            let status = exec.delete().await?;
            self.execs.lock().remove(exec_id);
            return Ok(status);
        }

        // Children in Created/Running block the delete; the caller either
        // deletes them or cascades them down with kill --all (or by the
        // init exit itself). Exited children are swept with the task.
        let children: Vec<Arc<Exec>> = self.execs.lock().values().cloned().collect();
        let mut live = 0usize;
        for child in &children {
            if child.status().await.is_live() {
                live += 1;
            }
        }
        if live > 0 {
            return Err(HcsliteError::FailedPrecondition(format!(
                "task {} has {live} running children",
                self.id
            )));
        }

        // An exited init implies the cascade is running; let it finish so
        // exit latches and relays are settled before teardown.
        if self.started.load(Ordering::Acquire) && self.init.status().await.is_exited() {
            self.cascade.cancelled().await;
        }

        let status = exec.delete().await?;

        for child in children {
            if let Err(err) = child.delete().await {
                debug!(exec_id = %child.id(), error = %err, "sweeping exited child");
            }
        }
        self.execs.lock().clear();

        if let Err(err) = self.system.terminate().await {
            debug!(task_id = %self.id, error = %err, "system terminate on delete");
        }
        if let Err(err) = self.system.close().await {
            debug!(task_id = %self.id, error = %err, "system close on delete");
        }
        if let Some(vm) = &self.vm {
            vm.release().await;
        }

        info!(task_id = %self.id, "task deleted");
        Ok(status)
    }

    /// Pid of init plus every registered exec.
    pub async fn pids(&self) -> Vec<ProcessInfo> {
        let mut processes = vec![ProcessInfo {
            pid: self.init.pid().await,
            exec_id: String::new(),
        }];

        let children: Vec<(String, Arc<Exec>)> = self
            .execs
            .lock()
            .iter()
            .map(|(id, exec)| (id.clone(), Arc::clone(exec)))
            .collect();
        for (exec_id, exec) in children {
            processes.push(ProcessInfo {
                pid: exec.pid().await,
                exec_id,
            });
        }
        processes
    }

    /// Wait for init to exit.
    pub async fn wait(&self) -> ExitStatus {
        self.init.wait().await
    }

    pub async fn snapshot(&self, exec_id: &str) -> HcsliteResult<ExecSnapshot> {
        Ok(self.get_exec(exec_id)?.snapshot().await)
    }

    /// Container statistics plus, under hypervisor isolation, the VM's.
    pub async fn stats(&self) -> HcsliteResult<TaskStats> {
        let container = tokio::time::timeout(self.config.signal_timeout, self.system.stats())
            .await
            .map_err(|_| HcsliteError::Timeout(format!("stats for task {}", self.id)))??;

        let vm = match &self.vm {
            Some(vm) if !self.kind.is_sandbox() => Some(
                tokio::time::timeout(self.config.signal_timeout, vm.system().stats())
                    .await
                    .map_err(|_| HcsliteError::Timeout(format!("vm stats for task {}", self.id)))??,
            ),
            _ => None,
        };

        Ok(TaskStats {
            flavor: self.flavor,
            container,
            vm,
        })
    }

    /// Apply a resource update. Only the documented payload kinds are
    /// accepted; anything else is rejected before touching the backend.
    pub async fn update(&self, resources: &prost_types::Any) -> HcsliteResult<()> {
        let payload = decode_resources(resources)?;
        self.system.modify(payload).await
    }

    /// Run a command inside the utility VM (sandbox tasks only).
    pub async fn exec_in_host(&self, request: HostProcessRequest) -> HcsliteResult<u32> {
        match &self.vm {
            Some(vm) if self.kind.is_sandbox() => vm.exec(request).await,
            _ => Err(HcsliteError::Unimplemented(
                "exec in host is only available on sandbox tasks".into(),
            )),
        }
    }

    /// Immediate teardown for `Shutdown(now = true)`: force every exec
    /// down and terminate the system without waiting for deletes.
    pub async fn force_teardown(&self) {
        warn!(task_id = %self.id, "forced teardown");

        self.init.force_exit(exit::FORCED, &self.config).await;
        let children: Vec<Arc<Exec>> = self.execs.lock().values().cloned().collect();
        for child in children {
            child.force_exit(exit::FORCED, &self.config).await;
        }

        if let Err(err) = self.system.terminate().await {
            debug!(task_id = %self.id, error = %err, "system terminate on teardown");
        }
        if let Err(err) = self.system.close().await {
            debug!(task_id = %self.id, error = %err, "system close on teardown");
        }
        if let Some(vm) = &self.vm {
            vm.release().await;
        }
    }
}

/// Decode an `Update` payload. The accepted kinds are Windows resource
/// limits, Linux resource limits, and explicit container mounts.
fn decode_resources(any: &prost_types::Any) -> HcsliteResult<Resources> {
    let url = any.type_url.as_str();
    if url.ends_with("WindowsResources") {
        let resources = hcslite_shared::WindowsResources::decode(any.value.as_slice())
            .map_err(|err| HcsliteError::InvalidArgument(format!("decoding resources: {err}")))?;
        Ok(Resources::Windows(resources))
    } else if url.ends_with("LinuxResources") {
        let resources = hcslite_shared::LinuxResources::decode(any.value.as_slice())
            .map_err(|err| HcsliteError::InvalidArgument(format!("decoding resources: {err}")))?;
        Ok(Resources::Linux(resources))
    } else if url.ends_with("MountRequest") {
        let mount = hcslite_shared::MountRequest::decode(any.value.as_slice())
            .map_err(|err| HcsliteError::InvalidArgument(format!("decoding mount: {err}")))?;
        Ok(Resources::Mount(MountSpec {
            host_path: mount.host_path,
            container_path: mount.container_path,
            read_only: mount.read_only,
        }))
    } else {
        Err(HcsliteError::InvalidArgument(format!(
            "resource update of type {url:?} is not supported"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_resource_payloads_are_rejected() {
        let any = prost_types::Any {
            type_url: "types.hcslite.io/hcslite.v1.ProcessInfo".into(),
            value: Vec::new(),
        };
        let err = decode_resources(&any).unwrap_err();
        assert!(matches!(err, HcsliteError::InvalidArgument(_)));
        assert!(err.to_string().contains("not supported"));
    }

    #[test]
    fn windows_resources_decode() {
        let payload = hcslite_shared::WindowsResources {
            memory_limit_bytes: 100,
            cpu_count: 2,
            cpu_shares: 0,
            cpu_maximum: 0,
        };
        let any = prost_types::Any {
            type_url: "types.hcslite.io/hcslite.v1.WindowsResources".into(),
            value: payload.encode_to_vec(),
        };
        match decode_resources(&any).unwrap() {
            Resources::Windows(r) => assert_eq!(r.memory_limit_bytes, 100),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn mount_request_decodes_to_mount_spec() {
        let payload = hcslite_shared::MountRequest {
            host_path: r"C:\data".into(),
            container_path: r"C:\mnt".into(),
            read_only: true,
        };
        let any = prost_types::Any {
            type_url: "types.hcslite.io/hcslite.v1.MountRequest".into(),
            value: payload.encode_to_vec(),
        };
        match decode_resources(&any).unwrap() {
            Resources::Mount(m) => {
                assert_eq!(m.container_path, r"C:\mnt");
                assert!(m.read_only);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }
}
