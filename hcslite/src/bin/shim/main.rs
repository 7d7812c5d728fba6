//! hcslite shim entry point.
//!
//! Three invocations, all driven by the manager:
//! `start` prints the RPC endpoint for a task (spawning the server if
//! needed), `serve` is the server process itself, and `delete` cleans up
//! after a shim that is no longer running.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use hcslite::bootstrap::{self, DeleteOptions, ServeOptions, ShimIdentity, StartOptions};
use hcslite::compute::ComputeBackend;
use hcslite::Config;
use hcslite_shared::constants::env as env_vars;
use hcslite_shared::{time, DeleteResponse};
use prost::Message;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "hcslite-shim",
    version,
    about = "Task service shim for HCS backed containers"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct IdentityArgs {
    /// Manager namespace the task lives in
    #[arg(long)]
    namespace: String,

    /// Task id this shim serves
    #[arg(long)]
    id: String,

    /// Bundle directory (defaults to the working directory)
    #[arg(long, default_value = ".")]
    bundle: PathBuf,
}

impl IdentityArgs {
    fn into_identity(self) -> ShimIdentity {
        ShimIdentity {
            namespace: self.namespace,
            task_id: self.id,
            bundle: self.bundle,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ensure a shim is serving this task and print its RPC endpoint
    Start {
        #[command(flatten)]
        identity: IdentityArgs,

        /// Manager RPC address events are published to
        #[arg(long)]
        address: String,

        /// Binary the shim spawns to publish events
        #[arg(long = "publish-binary")]
        publish_binary: PathBuf,
    },

    /// Run the task RPC server (internal invocation)
    Serve {
        #[command(flatten)]
        identity: IdentityArgs,

        /// Endpoint URI override
        #[arg(long)]
        socket: Option<String>,

        #[arg(long)]
        address: String,

        #[arg(long = "publish-binary")]
        publish_binary: PathBuf,
    },

    /// Clean up a task whose shim is no longer running
    Delete {
        #[command(flatten)]
        identity: IdentityArgs,

        /// Manager RPC address (accepted for CLI parity; unused)
        #[arg(long)]
        address: Option<String>,
    },
}

/// File logging for the server process. The guard must live until exit so
/// the background writer flushes.
fn init_serve_logging(bundle: &Path) -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::daily(bundle, "shim.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_ansi(false)
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .try_init();

    if let Ok(endpoint) = std::env::var(env_vars::TRACE_ENDPOINT) {
        tracing::info!(%endpoint, "trace exporter endpoint configured");
    }

    guard
}

/// Stderr logging for the short-lived invocations.
fn init_cli_logging() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(env_filter)
        .try_init();
}

#[cfg(windows)]
fn platform_backend() -> Result<Arc<dyn ComputeBackend>> {
    Ok(hcslite::compute::hcs::HcsBackend::new()?)
}

#[cfg(not(windows))]
fn platform_backend() -> Result<Arc<dyn ComputeBackend>> {
    anyhow::bail!("no compute backend is available on this platform")
}

#[tokio::main]
async fn main() -> Result<()> {
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("[PANIC] shim panicked: {panic_info}");
        std::process::exit(1);
    }));

    match Cli::parse().command {
        Command::Start {
            identity,
            address,
            publish_binary,
        } => {
            init_cli_logging();
            let endpoint = bootstrap::start(StartOptions {
                identity: identity.into_identity(),
                manager_address: address,
                publish_binary,
            })
            .await?;

            let mut stdout = std::io::stdout();
            writeln!(stdout, "{endpoint}")?;
            stdout.flush()?;
            bootstrap::close_stderr();
        }

        Command::Serve {
            identity,
            socket,
            address,
            publish_binary,
        } => {
            let identity = identity.into_identity();
            let _log_guard = init_serve_logging(&identity.bundle);
            tracing::info!(
                task_id = %identity.task_id,
                namespace = %identity.namespace,
                "shim server starting"
            );

            let backend = platform_backend()?;
            bootstrap::serve(
                ServeOptions {
                    identity,
                    socket,
                    manager_address: address,
                    publish_binary,
                    config: Config::default(),
                },
                backend,
            )
            .await?;
        }

        Command::Delete { identity, .. } => {
            init_cli_logging();
            let status = bootstrap::delete(DeleteOptions {
                identity: identity.into_identity(),
            })
            .await?;

            let response = DeleteResponse {
                pid: status.pid,
                exit_status: status.exit_code,
                exited_at: Some(time::to_proto(status.exited_at)),
            };
            std::io::stdout().write_all(&response.encode_to_vec())?;
        }
    }

    Ok(())
}
