//! Stdio relay.
//!
//! The manager hands the shim up to three endpoint paths per process. The
//! shim dials them (it never listens) and pumps bytes between the external
//! endpoints and the backend process's stream handles, one task per
//! direction. Endpoints are named pipes on Windows and Unix-domain sockets
//! elsewhere.

use crate::compute::ProcessIo;
use hcslite_shared::{HcsliteError, HcsliteResult};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, warn};

type ExternalReader = Box<dyn AsyncRead + Send + Unpin>;
type ExternalWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The endpoint triple a process was created with. Empty strings mean "no
/// endpoint for this stream".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StdioSet {
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
    pub terminal: bool,
}

impl StdioSet {
    /// Validate and build an endpoint set. With a terminal the backend
    /// merges stderr into stdout, so a stderr endpoint is invalid.
    pub fn new(
        stdin: impl Into<String>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
        terminal: bool,
    ) -> HcsliteResult<Self> {
        let set = Self {
            stdin: stdin.into(),
            stdout: stdout.into(),
            stderr: stderr.into(),
            terminal,
        };
        if set.terminal && !set.stderr.is_empty() {
            return Err(HcsliteError::InvalidArgument(
                "terminal processes cannot have a stderr endpoint".into(),
            ));
        }
        Ok(set)
    }

    /// No endpoints at all (sandbox init).
    pub fn none() -> Self {
        Self::default()
    }

    pub fn has_stdin(&self) -> bool {
        !self.stdin.is_empty()
    }

    pub fn has_stdout(&self) -> bool {
        !self.stdout.is_empty()
    }

    pub fn has_stderr(&self) -> bool {
        !self.stderr.is_empty()
    }
}

/// Byte pumps between external endpoints and a backend process.
///
/// Built in two phases: [`connect`](StdioRelay::connect) dials the external
/// endpoints (this can fail and is done before the process exists), then
/// [`start`](StdioRelay::start) wires the backend handles in and spawns the
/// pump tasks.
pub struct StdioRelay {
    stdin_reader: Option<ExternalReader>,
    stdout_writer: Option<ExternalWriter>,
    stderr_writer: Option<ExternalWriter>,
    pumps: Vec<JoinHandle<()>>,
    aborts: Vec<AbortHandle>,
    stdin_close: Option<oneshot::Sender<()>>,
}

impl std::fmt::Debug for StdioRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioRelay")
            .field("stdin_reader", &self.stdin_reader.is_some())
            .field("stdout_writer", &self.stdout_writer.is_some())
            .field("stderr_writer", &self.stderr_writer.is_some())
            .field("pumps", &self.pumps.len())
            .field("aborts", &self.aborts.len())
            .field("stdin_close", &self.stdin_close.is_some())
            .finish()
    }
}

impl StdioRelay {
    /// Dial every non-empty endpoint in `set`, honouring `dial_timeout` per
    /// endpoint.
    pub async fn connect(set: &StdioSet, dial_timeout: Duration) -> HcsliteResult<Self> {
        let mut relay = Self {
            stdin_reader: None,
            stdout_writer: None,
            stderr_writer: None,
            pumps: Vec::new(),
            aborts: Vec::new(),
            stdin_close: None,
        };

        if set.has_stdin() {
            relay.stdin_reader = Some(Box::new(dial(&set.stdin, dial_timeout).await?));
        }
        if set.has_stdout() {
            relay.stdout_writer = Some(Box::new(dial(&set.stdout, dial_timeout).await?));
        }
        if set.has_stderr() {
            relay.stderr_writer = Some(Box::new(dial(&set.stderr, dial_timeout).await?));
        }

        Ok(relay)
    }

    /// Spawn the pump tasks for every stream present on both sides.
    ///
    /// Stdin errors are recorded but never fail the exec; stdout/stderr
    /// errors surface as warnings.
    pub fn start(&mut self, label: &str, io: ProcessIo) {
        if let (Some(mut external), Some(mut upstream)) = (self.stdin_reader.take(), io.stdin) {
            let (close_tx, close_rx) = oneshot::channel::<()>();
            self.stdin_close = Some(close_tx);
            let label = label.to_string();
            self.track(tokio::spawn(async move {
                tokio::select! {
                    result = tokio::io::copy(&mut external, &mut upstream) => {
                        if let Err(err) = result {
                            debug!(exec = %label, error = %err, "stdin relay ended with error");
                        }
                    }
                    _ = close_rx => {}
                }
                // Half-close: EOF (or an explicit CloseIO) shuts the
                // backend's stdin down while output pumps keep running.
                let _ = upstream.shutdown().await;
            }));
        }

        if let (Some(mut external), Some(mut upstream)) = (self.stdout_writer.take(), io.stdout) {
            let label = label.to_string();
            self.track(tokio::spawn(async move {
                if let Err(err) = tokio::io::copy(&mut upstream, &mut external).await {
                    warn!(exec = %label, error = %err, "stdout relay ended with error");
                }
                let _ = external.shutdown().await;
            }));
        }

        if let (Some(mut external), Some(mut upstream)) = (self.stderr_writer.take(), io.stderr) {
            let label = label.to_string();
            self.track(tokio::spawn(async move {
                if let Err(err) = tokio::io::copy(&mut upstream, &mut external).await {
                    warn!(exec = %label, error = %err, "stderr relay ended with error");
                }
                let _ = external.shutdown().await;
            }));
        }
    }

    fn track(&mut self, handle: JoinHandle<()>) {
        self.aborts.push(handle.abort_handle());
        self.pumps.push(handle);
    }

    /// Close only the stdin side; output pumps keep running. Idempotent.
    pub fn close_stdin(&mut self) {
        if let Some(close) = self.stdin_close.take() {
            let _ = close.send(());
        }
        self.stdin_reader = None;
    }

    /// Wait for the pumps to finish. Returns false when `grace` elapsed
    /// first; the caller is expected to force-close the backend handles and
    /// then [`shutdown`](StdioRelay::shutdown) the relay.
    pub async fn drain(&mut self, grace: Duration) -> bool {
        if self.pumps.is_empty() {
            return true;
        }
        let pumps = std::mem::take(&mut self.pumps);
        tokio::time::timeout(grace, futures::future::join_all(pumps))
            .await
            .is_ok()
    }

    /// Close every open end and terminate the pumps. Idempotent.
    pub fn shutdown(&mut self) {
        self.close_stdin();
        for abort in self.aborts.drain(..) {
            abort.abort();
        }
        self.pumps.clear();
        self.stdout_writer = None;
        self.stderr_writer = None;
    }
}

impl Drop for StdioRelay {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(unix)]
async fn dial(path: &str, timeout: Duration) -> HcsliteResult<tokio::net::UnixStream> {
    use tokio::net::UnixStream;

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match UnixStream::connect(path).await {
            Ok(stream) => return Ok(stream),
            // The manager may still be setting the endpoint up.
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
                ) => {}
            Err(err) => {
                return Err(HcsliteError::Internal(format!(
                    "dialling stdio endpoint {path}: {err}"
                )))
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(HcsliteError::Timeout(format!("dial {path}")));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[cfg(windows)]
async fn dial(
    path: &str,
    timeout: Duration,
) -> HcsliteResult<tokio::net::windows::named_pipe::NamedPipeClient> {
    use tokio::net::windows::named_pipe::ClientOptions;
    use windows_sys::Win32::Foundation::ERROR_PIPE_BUSY;

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match ClientOptions::new().open(path) {
            Ok(client) => return Ok(client),
            // Busy: all instances in use; NotFound: server not up yet.
            Err(err)
                if err.raw_os_error() == Some(ERROR_PIPE_BUSY as i32)
                    || err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(HcsliteError::Internal(format!(
                    "dialling stdio endpoint {path}: {err}"
                )))
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(HcsliteError::Timeout(format!("dial {path}")));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_with_stderr_is_rejected() {
        let err = StdioSet::new("", "out", "err", true).unwrap_err();
        assert!(matches!(err, HcsliteError::InvalidArgument(_)));
    }

    #[test]
    fn terminal_without_stderr_is_accepted() {
        let set = StdioSet::new("in", "out", "", true).unwrap();
        assert!(set.has_stdin());
        assert!(set.has_stdout());
        assert!(!set.has_stderr());
    }
}

#[cfg(all(test, unix))]
mod unix_tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    struct Endpoint {
        _dir: tempfile::TempDir,
        listener: UnixListener,
        path: String,
    }

    fn endpoint(name: &str) -> Endpoint {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name).to_string_lossy().into_owned();
        let listener = UnixListener::bind(&path).unwrap();
        Endpoint {
            _dir: dir,
            listener,
            path,
        }
    }

    #[tokio::test]
    async fn pumps_move_bytes_both_ways() {
        let stdin_ep = endpoint("in.sock");
        let stdout_ep = endpoint("out.sock");

        let set = StdioSet::new(&stdin_ep.path, &stdout_ep.path, "", false).unwrap();
        let relay_fut = StdioRelay::connect(&set, Duration::from_secs(5));

        let (accepted, relay) = tokio::join!(
            async {
                let (stdin_conn, _) = stdin_ep.listener.accept().await.unwrap();
                let (stdout_conn, _) = stdout_ep.listener.accept().await.unwrap();
                (stdin_conn, stdout_conn)
            },
            relay_fut,
        );
        let (mut manager_stdin, mut manager_stdout) = accepted;
        let mut relay = relay.unwrap();

        // Backend side: a pair of duplex streams standing in for the
        // process handles.
        let (proc_stdin_far, proc_stdin_near) = tokio::io::duplex(1024);
        let (proc_stdout_near, proc_stdout_far) = tokio::io::duplex(1024);
        relay.start(
            "test",
            ProcessIo {
                stdin: Some(Box::new(proc_stdin_near)),
                stdout: Some(Box::new(proc_stdout_near)),
                stderr: None,
            },
        );

        // Manager writes stdin; the backend sees it.
        manager_stdin.write_all(b"hello in").await.unwrap();
        manager_stdin.shutdown().await.unwrap();
        let mut proc_stdin_far = proc_stdin_far;
        let mut seen = Vec::new();
        proc_stdin_far.read_to_end(&mut seen).await.unwrap();
        assert_eq!(seen, b"hello in");

        // Backend writes stdout; the manager sees it.
        let mut proc_stdout_far = proc_stdout_far;
        proc_stdout_far.write_all(b"hello out").await.unwrap();
        drop(proc_stdout_far);
        let mut out = Vec::new();
        manager_stdout.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello out");

        assert!(relay.drain(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn close_stdin_leaves_output_running() {
        let stdin_ep = endpoint("in.sock");
        let stdout_ep = endpoint("out.sock");

        let set = StdioSet::new(&stdin_ep.path, &stdout_ep.path, "", false).unwrap();
        let relay_fut = StdioRelay::connect(&set, Duration::from_secs(5));
        let (accepted, relay) = tokio::join!(
            async {
                let (a, _) = stdin_ep.listener.accept().await.unwrap();
                let (b, _) = stdout_ep.listener.accept().await.unwrap();
                (a, b)
            },
            relay_fut,
        );
        let (_manager_stdin, mut manager_stdout) = accepted;
        let mut relay = relay.unwrap();

        let (mut proc_stdin_far, proc_stdin_near) = tokio::io::duplex(64);
        let (proc_stdout_near, mut proc_stdout_far) = tokio::io::duplex(64);
        relay.start(
            "test",
            ProcessIo {
                stdin: Some(Box::new(proc_stdin_near)),
                stdout: Some(Box::new(proc_stdout_near)),
                stderr: None,
            },
        );

        relay.close_stdin();
        relay.close_stdin(); // idempotent

        // The backend observes stdin EOF.
        let mut rest = Vec::new();
        proc_stdin_far.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        // Output still flows after the stdin half-close.
        proc_stdout_far.write_all(b"still here").await.unwrap();
        drop(proc_stdout_far);
        let mut out = Vec::new();
        manager_stdout.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"still here");

        assert!(relay.drain(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn drain_times_out_and_shutdown_stops_pumps() {
        let stdout_ep = endpoint("out.sock");
        let set = StdioSet::new("", &stdout_ep.path, "", false).unwrap();
        let relay_fut = StdioRelay::connect(&set, Duration::from_secs(5));
        let (accepted, relay) = tokio::join!(
            async { stdout_ep.listener.accept().await.unwrap().0 },
            relay_fut,
        );
        let _manager_stdout = accepted;
        let mut relay = relay.unwrap();

        // Backend stdout writer held open: the pump never sees EOF.
        let (proc_stdout_near, proc_stdout_far) = tokio::io::duplex(64);
        relay.start(
            "test",
            ProcessIo {
                stdin: None,
                stdout: Some(Box::new(proc_stdout_near)),
                stderr: None,
            },
        );

        assert!(!relay.drain(Duration::from_millis(50)).await);
        relay.shutdown();
        relay.shutdown(); // idempotent
        drop(proc_stdout_far);
    }

    #[tokio::test]
    async fn dial_times_out_when_nobody_listens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.sock").to_string_lossy().into_owned();
        let set = StdioSet::new("", &path, "", false).unwrap();
        let err = StdioRelay::connect(&set, Duration::from_millis(80))
            .await
            .unwrap_err();
        assert!(matches!(err, HcsliteError::Timeout(_)));
    }
}
