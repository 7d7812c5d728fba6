//! Wire types crossing the compute-backend boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

/// OS flavor of the workload a compute system hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFlavor {
    /// Process- or hypervisor-isolated Windows container.
    Windows,
    /// Linux workload inside a utility VM.
    LinuxVm,
}

impl OsFlavor {
    pub fn is_windows(&self) -> bool {
        matches!(self, OsFlavor::Windows)
    }
}

/// Configuration for creating a compute system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// System id, visible to the platform.
    pub id: String,

    /// Owner string recorded on the system for diagnostics.
    pub owner: String,

    pub flavor: OsFlavor,

    /// True for utility-VM isolation (always true for `LinuxVm`).
    pub hypervisor_isolated: bool,

    /// Notification context the backend must tag this system's callbacks
    /// with. Allocated by the dispatcher before creation, never reused.
    pub context: u64,

    pub memory_limit_bytes: Option<u64>,
    pub processor_count: Option<u32>,

    /// Initial filesystem mounts.
    pub mounts: Vec<MountSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountSpec {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

/// Configuration for creating a process inside a compute system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    pub args: Vec<String>,

    /// `KEY=VALUE` pairs, OCI style.
    pub env: Vec<String>,

    pub working_dir: String,

    /// Windows user or uid:gid string, backend-interpreted.
    pub user: Option<String>,

    /// Allocate a console and merge stderr into stdout.
    pub emulate_console: bool,

    pub create_stdin: bool,
    pub create_stdout: bool,
    pub create_stderr: bool,

    /// Run in the utility VM itself rather than in a hosted container.
    pub host_process: bool,

    /// Notification context for this process's callbacks.
    pub context: u64,
}

/// Host-side ends of a created process's standard streams. Streams the
/// config did not request are `None`; with a console, stderr is always
/// `None`.
pub struct ProcessIo {
    pub stdin: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    pub stdout: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
}

impl std::fmt::Debug for ProcessIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessIo")
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

/// Resource update payloads a running system accepts.
#[derive(Debug, Clone)]
pub enum Resources {
    Windows(hcslite_shared::WindowsResources),
    Linux(hcslite_shared::LinuxResources),
    Mount(MountSpec),
}

/// Point-in-time statistics for one compute system.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemStats {
    pub read_at: Option<DateTime<Utc>>,
    pub processor: ProcessorStats,
    pub memory: MemoryStats,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessorStats {
    pub total_runtime_ns: u64,
    pub runtime_user_ns: u64,
    pub runtime_kernel_ns: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    pub working_set_bytes: u64,
    pub commit_bytes: u64,
}

/// Statistics reported for a task: the container itself plus, under
/// hypervisor isolation, the utility VM hosting it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStats {
    pub flavor: OsFlavor,
    pub container: SystemStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm: Option<SystemStats>,
}

/// Kinds of callback the backend emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    SystemCreated,
    SystemStarted,
    SystemExited,
    ProcessExited,
    OutOfMemory,
    /// The compute service dropped its callback connection.
    ServiceDisconnect,
    Unknown,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::SystemCreated => "system-created",
            NotificationKind::SystemStarted => "system-started",
            NotificationKind::SystemExited => "system-exited",
            NotificationKind::ProcessExited => "process-exited",
            NotificationKind::OutOfMemory => "out-of-memory",
            NotificationKind::ServiceDisconnect => "service-disconnect",
            NotificationKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One callback from the compute backend.
///
/// `result_code` follows the platform convention: negative values are
/// failures (HRESULTs), zero is success.
#[derive(Debug, Clone)]
pub struct Notification {
    pub context: u64,
    pub kind: NotificationKind,
    pub result_code: i32,
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_stats_omit_vm_when_absent() {
        let stats = TaskStats {
            flavor: OsFlavor::Windows,
            container: SystemStats::default(),
            vm: None,
        };
        let json = serde_json::to_string(&stats).unwrap();
        assert!(!json.contains("\"vm\""));
    }

    #[test]
    fn flavor_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&OsFlavor::LinuxVm).unwrap(),
            "\"linuxvm\""
        );
    }
}
