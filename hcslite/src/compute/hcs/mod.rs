//! Windows Host Compute Service client.
//!
//! Implements the compute traits over vmcompute.dll. One process-wide
//! callback trampoline feeds the notification stream; systems and
//! processes register their caller-allocated context ids with the service
//! so callbacks route without handing object pointers across the ABI.

mod ffi;

use super::{
    ComputeBackend, ComputeProcess, ComputeSystem, Notification, NotificationKind, OsFlavor,
    ProcessConfig, ProcessIo, Resources, SystemConfig, SystemStats,
};
use async_trait::async_trait;
use hcslite_shared::{HcsliteError, HcsliteResult};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Destination of the process-wide callback trampoline.
static CALLBACK_SINK: OnceLock<mpsc::UnboundedSender<Notification>> = OnceLock::new();

unsafe extern "system" fn notification_trampoline(
    notification_type: u32,
    context: *mut std::ffi::c_void,
    status: i32,
    data: ffi::Pcwstr,
) {
    let kind = match notification_type {
        ffi::HCS_NOTIFICATION_SYSTEM_EXITED => NotificationKind::SystemExited,
        ffi::HCS_NOTIFICATION_SYSTEM_CREATE_COMPLETED => NotificationKind::SystemCreated,
        ffi::HCS_NOTIFICATION_SYSTEM_START_COMPLETED => NotificationKind::SystemStarted,
        ffi::HCS_NOTIFICATION_PROCESS_EXITED => NotificationKind::ProcessExited,
        ffi::HCS_NOTIFICATION_SERVICE_DISCONNECT => NotificationKind::ServiceDisconnect,
        _ => NotificationKind::Unknown,
    };

    let detail = if data.is_null() {
        None
    } else {
        // The service owns the buffer; copy, never free.
        let mut len = 0usize;
        while *data.add(len) != 0 {
            len += 1;
        }
        Some(String::from_utf16_lossy(std::slice::from_raw_parts(
            data, len,
        )))
    };

    if let Some(sink) = CALLBACK_SINK.get() {
        let _ = sink.send(Notification {
            context: context as usize as u64,
            kind,
            result_code: status,
            detail,
        });
    }
}

/// Client for the platform compute service. One per shim process.
pub struct HcsBackend {
    outward: Mutex<Option<mpsc::UnboundedReceiver<Notification>>>,
    /// system context -> contexts of its processes, for the system-exit
    /// fan-out the dispatcher contract requires.
    children: Arc<Mutex<HashMap<u64, Vec<u64>>>>,
}

impl HcsBackend {
    pub fn new() -> HcsliteResult<Arc<Self>> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel();
        CALLBACK_SINK.set(raw_tx).map_err(|_| {
            HcsliteError::FailedPrecondition("compute backend already initialised".into())
        })?;

        let (outward_tx, outward_rx) = mpsc::unbounded_channel::<Notification>();
        let children: Arc<Mutex<HashMap<u64, Vec<u64>>>> = Arc::new(Mutex::new(HashMap::new()));

        let fan_out_children = Arc::clone(&children);
        tokio::spawn(async move {
            while let Some(notification) = raw_rx.recv().await {
                // A dying system unblocks its processes' waits too.
                if notification.kind == NotificationKind::SystemExited {
                    let dependents = fan_out_children
                        .lock()
                        .get(&notification.context)
                        .cloned()
                        .unwrap_or_default();
                    for context in dependents {
                        let _ = outward_tx.send(Notification {
                            context,
                            ..notification.clone()
                        });
                    }
                }
                if outward_tx.send(notification).is_err() {
                    break;
                }
            }
        });

        Ok(Arc::new(Self {
            outward: Mutex::new(Some(outward_rx)),
            children,
        }))
    }

    fn wrap_system(&self, id: String, handle: usize, context: u64) -> HcsliteResult<Arc<HcsSystem>> {
        let callback = ffi::register_compute_system_callback(
            handle as ffi::HcsSystemHandle,
            notification_trampoline,
            context,
        )? as usize;
        self.children.lock().entry(context).or_default();

        Ok(Arc::new(HcsSystem {
            id,
            handle,
            context,
            callback,
            children: Arc::clone(&self.children),
            closed: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl ComputeBackend for HcsBackend {
    async fn create_system(&self, config: SystemConfig) -> HcsliteResult<Arc<dyn ComputeSystem>> {
        let document = system_document(&config)?;
        let id = config.id.clone();
        let handle = tokio::task::spawn_blocking(move || {
            ffi::create_compute_system(&id, &document).map(|h| h as usize)
        })
        .await
        .map_err(|err| HcsliteError::Internal(format!("create join error: {err}")))??;

        debug!(system = %config.id, context = config.context, "compute system created");
        Ok(self.wrap_system(config.id, handle, config.context)? as Arc<dyn ComputeSystem>)
    }

    async fn open_system(&self, id: &str, context: u64) -> HcsliteResult<Arc<dyn ComputeSystem>> {
        let id_owned = id.to_string();
        let handle = tokio::task::spawn_blocking(move || {
            ffi::open_compute_system(&id_owned).map(|h| h as usize)
        })
        .await
        .map_err(|err| HcsliteError::Internal(format!("open join error: {err}")))??;

        Ok(self.wrap_system(id.to_string(), handle, context)? as Arc<dyn ComputeSystem>)
    }

    fn take_notifications(&self) -> HcsliteResult<mpsc::UnboundedReceiver<Notification>> {
        self.outward.lock().take().ok_or_else(|| {
            HcsliteError::FailedPrecondition("notification stream already taken".into())
        })
    }
}

struct HcsSystem {
    id: String,
    handle: usize,
    context: u64,
    callback: usize,
    children: Arc<Mutex<HashMap<u64, Vec<u64>>>>,
    closed: AtomicBool,
}

impl HcsSystem {
    fn raw(&self) -> ffi::HcsSystemHandle {
        self.handle as ffi::HcsSystemHandle
    }
}

#[async_trait]
impl ComputeSystem for HcsSystem {
    fn id(&self) -> &str {
        &self.id
    }

    fn context(&self) -> u64 {
        self.context
    }

    fn pid(&self) -> u32 {
        // The platform does not expose a worker pid through this API; the
        // shim's own pid stands in for sandbox bookkeeping.
        std::process::id()
    }

    async fn start(&self) -> HcsliteResult<()> {
        let handle = self.handle;
        tokio::task::spawn_blocking(move || {
            ffi::start_compute_system(handle as ffi::HcsSystemHandle)
        })
        .await
        .map_err(|err| HcsliteError::Internal(format!("start join error: {err}")))?
    }

    async fn create_process(
        &self,
        config: ProcessConfig,
    ) -> HcsliteResult<(Arc<dyn ComputeProcess>, ProcessIo)> {
        let document = process_document(&config)?;
        let handle = self.handle;
        let (process_handle, info) = tokio::task::spawn_blocking(move || {
            ffi::create_process(handle as ffi::HcsSystemHandle, &document)
                .map(|(p, info)| (p as usize, info))
        })
        .await
        .map_err(|err| HcsliteError::Internal(format!("create process join error: {err}")))??;

        let callback = ffi::register_process_callback(
            process_handle as ffi::HcsProcessHandle,
            notification_trampoline,
            config.context,
        )? as usize;

        self.children
            .lock()
            .entry(self.context)
            .or_default()
            .push(config.context);

        let io = ProcessIo {
            stdin: wrap_write_handle(info.std_input),
            stdout: wrap_read_handle(info.std_output),
            stderr: wrap_read_handle(info.std_error),
        };

        let process = Arc::new(HcsProcess {
            pid: info.process_id,
            handle: process_handle,
            context: config.context,
            callback,
            closed: AtomicBool::new(false),
        });

        Ok((process as Arc<dyn ComputeProcess>, io))
    }

    async fn terminate(&self) -> HcsliteResult<()> {
        let handle = self.handle;
        tokio::task::spawn_blocking(move || {
            ffi::terminate_compute_system(handle as ffi::HcsSystemHandle)
        })
        .await
        .map_err(|err| HcsliteError::Internal(format!("terminate join error: {err}")))?
    }

    async fn shutdown(&self) -> HcsliteResult<()> {
        let handle = self.handle;
        tokio::task::spawn_blocking(move || {
            ffi::shutdown_compute_system(handle as ffi::HcsSystemHandle)
        })
        .await
        .map_err(|err| HcsliteError::Internal(format!("shutdown join error: {err}")))?
    }

    async fn stats(&self) -> HcsliteResult<SystemStats> {
        let handle = self.handle;
        let query = json!({ "PropertyTypes": ["Statistics"] }).to_string();
        let raw = tokio::task::spawn_blocking(move || {
            ffi::get_compute_system_properties(handle as ffi::HcsSystemHandle, &query)
        })
        .await
        .map_err(|err| HcsliteError::Internal(format!("stats join error: {err}")))??;

        Ok(parse_statistics(&raw))
    }

    async fn modify(&self, resources: Resources) -> HcsliteResult<()> {
        let document = modify_document(&resources).to_string();
        let handle = self.handle;
        tokio::task::spawn_blocking(move || {
            ffi::modify_compute_system(handle as ffi::HcsSystemHandle, &document)
        })
        .await
        .map_err(|err| HcsliteError::Internal(format!("modify join error: {err}")))?
    }

    async fn close(&self) -> HcsliteResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        ffi::unregister_compute_system_callback(self.callback as ffi::HcsCallbackHandle);
        ffi::close_compute_system(self.raw());
        self.children.lock().remove(&self.context);
        Ok(())
    }
}

struct HcsProcess {
    pid: u32,
    handle: usize,
    context: u64,
    callback: usize,
    closed: AtomicBool,
}

#[async_trait]
impl ComputeProcess for HcsProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn context(&self) -> u64 {
        self.context
    }

    async fn signal(&self, signal: u32) -> HcsliteResult<()> {
        let handle = self.handle;
        if hcslite_shared::constants::signals::is_terminal(signal) {
            tokio::task::spawn_blocking(move || {
                ffi::terminate_process(handle as ffi::HcsProcessHandle)
            })
            .await
            .map_err(|err| HcsliteError::Internal(format!("terminate join error: {err}")))?
        } else {
            let options = json!({ "Signal": signal }).to_string();
            tokio::task::spawn_blocking(move || {
                ffi::signal_process(handle as ffi::HcsProcessHandle, &options)
            })
            .await
            .map_err(|err| HcsliteError::Internal(format!("signal join error: {err}")))?
        }
    }

    async fn resize_console(&self, width: u16, height: u16) -> HcsliteResult<()> {
        let settings = json!({
            "Operation": "ConsoleSize",
            "ConsoleSize": { "Height": height, "Width": width },
        })
        .to_string();
        let handle = self.handle;
        tokio::task::spawn_blocking(move || {
            ffi::modify_process(handle as ffi::HcsProcessHandle, &settings)
        })
        .await
        .map_err(|err| HcsliteError::Internal(format!("resize join error: {err}")))?
    }

    async fn exit_code(&self) -> HcsliteResult<u32> {
        let handle = self.handle;
        let raw = tokio::task::spawn_blocking(move || {
            ffi::get_process_properties(handle as ffi::HcsProcessHandle)
        })
        .await
        .map_err(|err| HcsliteError::Internal(format!("properties join error: {err}")))??;

        let value: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|err| HcsliteError::Internal(format!("parsing process properties: {err}")))?;
        Ok(value
            .get("ExitCode")
            .and_then(|c| c.as_u64())
            .unwrap_or(255) as u32)
    }

    async fn close_stdin(&self) -> HcsliteResult<()> {
        let settings = json!({
            "Operation": "CloseHandle",
            "Handles": { "Handle": "StdIn" },
        })
        .to_string();
        let handle = self.handle;
        tokio::task::spawn_blocking(move || {
            ffi::modify_process(handle as ffi::HcsProcessHandle, &settings)
        })
        .await
        .map_err(|err| HcsliteError::Internal(format!("close stdin join error: {err}")))?
    }

    async fn close(&self) -> HcsliteResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        ffi::unregister_process_callback(self.callback as ffi::HcsCallbackHandle);
        ffi::close_process(self.handle as ffi::HcsProcessHandle);
        Ok(())
    }
}

fn wrap_read_handle(
    handle: *mut std::ffi::c_void,
) -> Option<Box<dyn tokio::io::AsyncRead + Send + Unpin>> {
    use std::os::windows::io::FromRawHandle;

    if handle.is_null() {
        return None;
    }
    let file = unsafe { std::fs::File::from_raw_handle(handle as std::os::windows::io::RawHandle) };
    Some(Box::new(tokio::fs::File::from_std(file)))
}

fn wrap_write_handle(
    handle: *mut std::ffi::c_void,
) -> Option<Box<dyn tokio::io::AsyncWrite + Send + Unpin>> {
    use std::os::windows::io::FromRawHandle;

    if handle.is_null() {
        return None;
    }
    let file = unsafe { std::fs::File::from_raw_handle(handle as std::os::windows::io::RawHandle) };
    Some(Box::new(tokio::fs::File::from_std(file)))
}

/// Abridged schema-v2 compute-system document.
fn system_document(config: &SystemConfig) -> HcsliteResult<String> {
    let mut doc = json!({
        "SchemaVersion": { "Major": 2, "Minor": 1 },
        "Owner": config.owner,
        "ShouldTerminateOnLastHandleClosed": true,
    });

    let mounts: Vec<serde_json::Value> = config
        .mounts
        .iter()
        .map(|m| {
            json!({
                "HostPath": m.host_path,
                "ContainerPath": m.container_path,
                "ReadOnly": m.read_only,
            })
        })
        .collect();

    let section = match (config.flavor, config.hypervisor_isolated) {
        (OsFlavor::Windows, false) => ("Container", json!({ "MappedDirectories": mounts })),
        (OsFlavor::Windows, true) | (OsFlavor::LinuxVm, _) => (
            "VirtualMachine",
            json!({
                "GuestOs": if config.flavor.is_windows() { "Windows" } else { "Linux" },
                "MemorySizeInMB": config.memory_limit_bytes.map(|b| b / (1024 * 1024)),
                "ProcessorCount": config.processor_count,
                "MappedDirectories": mounts,
            }),
        ),
    };
    doc[section.0] = section.1;

    serde_json::to_string(&doc)
        .map_err(|err| HcsliteError::Internal(format!("encoding system document: {err}")))
}

fn process_document(config: &ProcessConfig) -> HcsliteResult<String> {
    let environment: HashMap<&str, &str> = config
        .env
        .iter()
        .filter_map(|pair| pair.split_once('='))
        .collect();

    let doc = json!({
        "CommandArgs": config.args,
        "Environment": environment,
        "WorkingDirectory": config.working_dir,
        "User": config.user,
        "EmulateConsole": config.emulate_console,
        "CreateStdInPipe": config.create_stdin,
        "CreateStdOutPipe": config.create_stdout,
        "CreateStdErrPipe": config.create_stderr,
        "IsHostProcess": config.host_process,
    });

    serde_json::to_string(&doc)
        .map_err(|err| HcsliteError::Internal(format!("encoding process document: {err}")))
}

fn modify_document(resources: &Resources) -> serde_json::Value {
    match resources {
        Resources::Windows(r) => json!({
            "ResourcePath": "VirtualMachine/ComputeTopology/Memory",
            "RequestType": "Update",
            "Settings": {
                "MemoryLimitBytes": r.memory_limit_bytes,
                "CpuCount": r.cpu_count,
                "CpuShares": r.cpu_shares,
                "CpuMaximum": r.cpu_maximum,
            },
        }),
        Resources::Linux(r) => json!({
            "ResourcePath": "VirtualMachine/ComputeTopology/Memory",
            "RequestType": "Update",
            "Settings": {
                "MemoryLimitBytes": r.memory_limit_bytes,
                "CpuShares": r.cpu_shares,
                "CpuQuota": r.cpu_quota,
                "CpuPeriod": r.cpu_period,
            },
        }),
        Resources::Mount(m) => json!({
            "ResourcePath": "Container/MappedDirectories",
            "RequestType": "Add",
            "Settings": {
                "HostPath": m.host_path,
                "ContainerPath": m.container_path,
                "ReadOnly": m.read_only,
            },
        }),
    }
}

/// Pull the counters the shim reports out of a statistics response,
/// tolerating missing sections.
fn parse_statistics(raw: &str) -> SystemStats {
    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(err) => {
            warn!(error = %err, "unparseable statistics response");
            return SystemStats::default();
        }
    };
    let statistics = value.get("Statistics").unwrap_or(&serde_json::Value::Null);
    let get = |path: &[&str]| -> u64 {
        let mut cursor = statistics;
        for key in path {
            cursor = match cursor.get(key) {
                Some(next) => next,
                None => return 0,
            };
        }
        cursor.as_u64().unwrap_or(0)
    };

    SystemStats {
        read_at: Some(chrono::Utc::now()),
        processor: super::ProcessorStats {
            total_runtime_ns: get(&["Processor", "TotalRuntime100ns"]) * 100,
            runtime_user_ns: get(&["Processor", "RuntimeUser100ns"]) * 100,
            runtime_kernel_ns: get(&["Processor", "RuntimeKernel100ns"]) * 100,
        },
        memory: super::MemoryStats {
            working_set_bytes: get(&["Memory", "MemoryUsageCommitBytes"]),
            commit_bytes: get(&["Memory", "MemoryUsageCommitPeakBytes"]),
        },
    }
}
