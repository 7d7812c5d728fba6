//! Process bootstrap: the `start`, `serve`, and `delete` invocations.
//!
//! `start` converges any number of racing invocations for one task id onto
//! a single serving process and prints its endpoint. `serve` is the actual
//! RPC server. `delete` cleans residual state for a task whose shim is no
//! longer running.

pub mod debug;
pub mod dial;

use crate::compute::ComputeBackend;
use crate::config::Config;
use crate::events::EventPublisher;
use crate::latch::ExitStatus;
use crate::service::TaskService;
use chrono::{DateTime, Utc};
use hcslite_shared::constants::{bundle as bundle_consts, endpoint, timeouts};
use hcslite_shared::{HcsliteError, HcsliteResult, TaskServer, Transport};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tonic::transport::Server;
use tracing::{info, warn};

/// Common identity arguments shared by the subcommands.
#[derive(Debug, Clone)]
pub struct ShimIdentity {
    pub namespace: String,
    pub task_id: String,
    pub bundle: PathBuf,
}

/// RPC endpoint for a task: the protected named pipe on Windows, a socket
/// in the bundle directory elsewhere.
pub fn rpc_endpoint(identity: &ShimIdentity) -> Transport {
    #[cfg(windows)]
    {
        Transport::pipe(format!(
            "{}{}-{}-{}{}",
            endpoint::PIPE_PREFIX,
            endpoint::PIPE_STEM,
            identity.namespace,
            identity.task_id,
            endpoint::PIPE_SUFFIX
        ))
    }
    #[cfg(not(windows))]
    {
        Transport::unix(identity.bundle.join(endpoint::SOCKET_FILE))
    }
}

/// Sibling endpoint carrying structured log output (Windows contract).
pub fn log_endpoint(identity: &ShimIdentity) -> String {
    format!(
        "{}{}-{}-{}{}",
        endpoint::PIPE_PREFIX,
        endpoint::PIPE_STEM,
        identity.namespace,
        identity.task_id,
        endpoint::LOG_SUFFIX
    )
}

/// Close stdout; `serve` uses this as its readiness signal.
pub fn close_stdout() {
    #[cfg(unix)]
    unsafe {
        libc::close(1);
    }
    #[cfg(windows)]
    unsafe {
        use windows_sys::Win32::Foundation::CloseHandle;
        use windows_sys::Win32::System::Console::{GetStdHandle, STD_OUTPUT_HANDLE};
        CloseHandle(GetStdHandle(STD_OUTPUT_HANDLE));
    }
}

/// Close stderr; `start` uses this as its readiness signal.
pub fn close_stderr() {
    #[cfg(unix)]
    unsafe {
        libc::close(2);
    }
    #[cfg(windows)]
    unsafe {
        use windows_sys::Win32::Foundation::CloseHandle;
        use windows_sys::Win32::System::Console::{GetStdHandle, STD_ERROR_HANDLE};
        CloseHandle(GetStdHandle(STD_ERROR_HANDLE));
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct DeletedMarker {
    pid: u32,
    exit_code: u32,
    exited_at: DateTime<Utc>,
}

/// Persist the task's final status in the bundle so `delete` stays
/// idempotent across shim crashes.
pub fn write_deleted_marker(bundle: &Path, status: &ExitStatus) -> HcsliteResult<()> {
    let marker = DeletedMarker {
        pid: status.pid,
        exit_code: status.exit_code,
        exited_at: status.exited_at,
    };
    let json = serde_json::to_vec(&marker)
        .map_err(|err| HcsliteError::Internal(format!("encoding deleted marker: {err}")))?;
    std::fs::write(bundle.join(bundle_consts::DELETED_MARKER), json)?;
    Ok(())
}

/// Read the persisted status back, if any.
pub fn read_deleted_marker(bundle: &Path) -> Option<ExitStatus> {
    let bytes = std::fs::read(bundle.join(bundle_consts::DELETED_MARKER)).ok()?;
    let marker: DeletedMarker = serde_json::from_slice(&bytes).ok()?;
    Some(ExitStatus {
        pid: marker.pid,
        exit_code: marker.exit_code,
        exited_at: marker.exited_at,
    })
}

/// Arguments for the `serve` subcommand.
pub struct ServeOptions {
    pub identity: ShimIdentity,
    /// Endpoint override; defaults to [`rpc_endpoint`].
    pub socket: Option<String>,
    pub manager_address: String,
    pub publish_binary: PathBuf,
    pub config: Config,
}

/// Run the RPC server until shutdown completes.
///
/// Readiness is signalled by closing stdout once the listener is bound.
pub async fn serve(options: ServeOptions, backend: Arc<dyn ComputeBackend>) -> HcsliteResult<()> {
    let transport = match &options.socket {
        Some(uri) => Transport::from_uri(uri).map_err(HcsliteError::InvalidArgument)?,
        None => rpc_endpoint(&options.identity),
    };

    debug::register_stackdump_trigger();

    let publisher = Arc::new(EventPublisher::with_binary(
        &options.identity.namespace,
        &options.publish_binary,
        &options.manager_address,
    ));

    let service = TaskService::new(
        options.identity.task_id.clone(),
        options.identity.namespace.clone(),
        backend,
        publisher,
        options.config,
    )?;
    let shutdown = service.shutdown_coordinator();

    let router = Server::builder().add_service(TaskServer::from_arc(service));

    info!(endpoint = %transport, task_id = %options.identity.task_id, "serving task rpc");

    match transport {
        #[cfg(unix)]
        Transport::Unix { socket_path } => {
            use tokio_stream::wrappers::UnixListenerStream;

            if socket_path.exists() {
                std::fs::remove_file(&socket_path)?;
            }
            if let Some(parent) = socket_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let listener = tokio::net::UnixListener::bind(&socket_path)?;
            close_stdout();

            router
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                    shutdown.done().await;
                })
                .await
                .map_err(|err| HcsliteError::Internal(format!("server error: {err}")))?;
        }

        #[cfg(not(unix))]
        Transport::Unix { socket_path } => {
            return Err(HcsliteError::Unimplemented(format!(
                "unix endpoint {} on this platform",
                socket_path.display()
            )));
        }

        Transport::Tcp { port } => {
            use tokio_stream::wrappers::TcpListenerStream;

            let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{port}")).await?;
            close_stdout();

            router
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                    shutdown.done().await;
                })
                .await
                .map_err(|err| HcsliteError::Internal(format!("server error: {err}")))?;
        }

        #[cfg(windows)]
        Transport::Pipe { name } => {
            let incoming = pipe::incoming(name)?;
            close_stdout();

            router
                .serve_with_incoming_shutdown(incoming, async move {
                    shutdown.done().await;
                })
                .await
                .map_err(|err| HcsliteError::Internal(format!("server error: {err}")))?;
        }

        #[cfg(not(windows))]
        Transport::Pipe { name } => {
            return Err(HcsliteError::Unimplemented(format!(
                "named pipe endpoint {name} on this platform"
            )));
        }
    }

    info!("server stopped");
    Ok(())
}

/// Arguments for the `start` subcommand.
pub struct StartOptions {
    pub identity: ShimIdentity,
    pub manager_address: String,
    pub publish_binary: PathBuf,
}

/// Idempotently obtain the serving endpoint for this task.
///
/// If a server is already listening, its address is returned. Otherwise a
/// `serve` child is spawned; it signals readiness by closing its stdout.
/// Two invocations racing for the same task id converge because only one
/// can bind the endpoint; the loser finds the winner by dialling.
pub async fn start(options: StartOptions) -> HcsliteResult<String> {
    let transport = rpc_endpoint(&options.identity);
    let uri = transport.to_uri();

    if dial::try_connect(&transport, std::time::Duration::from_millis(500))
        .await
        .is_ok()
    {
        info!(endpoint = %uri, "shim already serving");
        return Ok(uri);
    }

    let exe = std::env::current_exe()?;
    let mut child = tokio::process::Command::new(exe)
        .current_dir(&options.identity.bundle)
        .arg("serve")
        .arg("--socket")
        .arg(&uri)
        .arg("--namespace")
        .arg(&options.identity.namespace)
        .arg("--id")
        .arg(&options.identity.task_id)
        .arg("--bundle")
        .arg(&options.identity.bundle)
        .arg("--address")
        .arg(&options.manager_address)
        .arg("--publish-binary")
        .arg(&options.publish_binary)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .spawn()?;

    let mut stdout = child.stdout.take().ok_or_else(|| {
        HcsliteError::Internal("serve child has no stdout".into())
    })?;

    // Readiness: the child closes stdout once its listener is bound.
    let mut scratch = Vec::new();
    match tokio::time::timeout(timeouts::SERVE_READY, stdout.read_to_end(&mut scratch)).await {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => warn!(error = %err, "reading serve readiness"),
        Err(_) => {
            return Err(HcsliteError::Timeout("waiting for serve readiness".into()));
        }
    }

    // Either our child is serving, or we lost the race and the winner is.
    dial::try_connect(&transport, timeouts::SERVE_READY)
        .await
        .map_err(|err| {
            HcsliteError::Internal(format!("shim did not come up at {uri}: {err}"))
        })?;

    Ok(uri)
}

/// Arguments for the `delete` subcommand.
pub struct DeleteOptions {
    pub identity: ShimIdentity,
}

/// Clean residual state for a task whose shim is gone. Returns the task's
/// final exit status when the deleted marker recorded one, else the
/// synthetic default.
pub async fn delete(options: DeleteOptions) -> HcsliteResult<ExitStatus> {
    let bundle = &options.identity.bundle;
    let status = read_deleted_marker(bundle).unwrap_or_default();

    // Re-write the marker so repeated deletes stay idempotent even when
    // the first run crashed between cleanup steps.
    if let Err(err) = write_deleted_marker(bundle, &status) {
        warn!(error = %err, "writing deleted marker");
    }

    #[cfg(not(windows))]
    {
        let socket = bundle.join(endpoint::SOCKET_FILE);
        if socket.exists() {
            if let Err(err) = std::fs::remove_file(&socket) {
                warn!(error = %err, "removing stale endpoint");
            }
        }
    }

    info!(task_id = %options.identity.task_id, "deleted residual task state");
    Ok(status)
}

#[cfg(windows)]
mod pipe {
    //! Accept loop over a named-pipe endpoint, shaped for tonic's
    //! `serve_with_incoming`.

    use futures::Stream;
    use hcslite_shared::{HcsliteError, HcsliteResult};
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
    use tokio::net::windows::named_pipe::{NamedPipeServer, ServerOptions};
    use tonic::transport::server::Connected;

    pub struct PipeStream(NamedPipeServer);

    impl Connected for PipeStream {
        type ConnectInfo = ();

        fn connect_info(&self) -> Self::ConnectInfo {}
    }

    impl AsyncRead for PipeStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.0).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for PipeStream {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Pin::new(&mut self.0).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.0).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.0).poll_shutdown(cx)
        }
    }

    /// Bind the first pipe instance now (so racing servers fail fast) and
    /// hand out connected instances forever after.
    pub fn incoming(
        name: String,
    ) -> HcsliteResult<impl Stream<Item = std::io::Result<PipeStream>>> {
        let first = ServerOptions::new()
            .first_pipe_instance(true)
            .create(&name)
            .map_err(|err| {
                HcsliteError::Internal(format!("binding pipe endpoint {name}: {err}"))
            })?;

        Ok(async_stream::try_stream! {
            let mut server = first;
            loop {
                server.connect().await?;
                let connected = server;
                server = ServerOptions::new().create(&name)?;
                yield PipeStream(connected);
            }
        })
    }
}
