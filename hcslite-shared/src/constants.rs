//! Shared constants between the shim, its bootstrap client, and tests.

/// RPC endpoint naming.
pub mod endpoint {
    /// Prefix every shim pipe lives under on Windows. The ProtectedPrefix
    /// namespace restricts the endpoint to administrators.
    pub const PIPE_PREFIX: &str = r"\\.\pipe\ProtectedPrefix\Administrators\";

    /// Component inserted between the prefix and the namespace/task pair.
    pub const PIPE_STEM: &str = "hcslite-shim";

    /// Suffix of the RPC endpoint.
    pub const PIPE_SUFFIX: &str = "-pipe";

    /// Suffix of the sibling endpoint carrying structured log output.
    pub const LOG_SUFFIX: &str = "-log";

    /// Socket file name used for the Unix fallback, relative to the bundle.
    pub const SOCKET_FILE: &str = "shim.sock";
}

/// Environment variables consumed by the shim process.
pub mod env {
    /// Log-level override, interpreted by the tracing EnvFilter.
    pub const LOG_LEVEL: &str = "RUST_LOG";

    /// OTLP trace exporter endpoint. Recorded at startup; exporter wiring is
    /// the embedder's concern.
    pub const TRACE_ENDPOINT: &str = "HCSLITE_TRACE_ENDPOINT";

    /// Override for the named event that triggers a diagnostic stack dump.
    pub const STACKDUMP_EVENT: &str = "HCSLITE_STACKDUMP_EVENT";
}

/// Default timeouts, all overridable per call site through `Config`.
pub mod timeouts {
    use std::time::Duration;

    /// Creating a compute system can pull a utility VM up.
    pub const SYSTEM_CREATE: Duration = Duration::from_secs(240);

    /// Starting a created compute system.
    pub const SYSTEM_START: Duration = Duration::from_secs(240);

    /// Creating a process inside a running system.
    pub const PROCESS_CREATE: Duration = Duration::from_secs(60);

    /// Signal and kill delivery.
    pub const SIGNAL: Duration = Duration::from_secs(30);

    /// Dialling a caller-supplied stdio endpoint.
    pub const IO_DIAL: Duration = Duration::from_secs(10);

    /// Grace window for stdio pumps to drain after process exit.
    pub const IO_DRAIN_GRACE: Duration = Duration::from_secs(5);

    /// Waiting for a racing `start` invocation's server to come up.
    pub const SERVE_READY: Duration = Duration::from_secs(15);
}

/// Process exit codes.
pub mod exit {
    /// Exit code reported for processes torn down by a terminal signal
    /// before or during execution (128 + SIGKILL).
    pub const FORCED: u32 = 137;
}

/// Signal numbers the shim interprets itself. Windows containers have no
/// POSIX signal plane, so the manager's numeric signals are classified as
/// terminal or not and forwarded as backend signal operations.
pub mod signals {
    pub const SIGKILL: u32 = 9;
    pub const SIGTERM: u32 = 15;

    /// True for the signals that request process termination.
    pub fn is_terminal(signal: u32) -> bool {
        signal == SIGKILL || signal == SIGTERM
    }
}

/// Bundle annotations understood at Create time.
pub mod annotations {
    /// Marks a task as a pod sandbox or a container within one.
    pub const CONTAINER_TYPE: &str = "io.kubernetes.cri.container-type";

    /// Value of [`CONTAINER_TYPE`] for the sandbox task itself.
    pub const CONTAINER_TYPE_SANDBOX: &str = "podsandbox";

    /// Value of [`CONTAINER_TYPE`] for a container belonging to a sandbox.
    pub const CONTAINER_TYPE_CONTAINER: &str = "container";

    /// Sandbox the container should join.
    pub const SANDBOX_ID: &str = "io.kubernetes.cri.sandbox-id";
}

/// Marker file names persisted in the bundle directory.
pub mod bundle {
    /// Written when a task has been deleted, making `delete` idempotent
    /// across shim crashes.
    pub const DELETED_MARKER: &str = "hcslite-deleted";
}
