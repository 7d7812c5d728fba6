//! Client-side dialling of a shim endpoint.
//!
//! Converts a [`Transport`] into a tonic channel with lazy connector
//! plumbing; used by `start` to detect an already-running server.

use hcslite_shared::{HcsliteError, HcsliteResult, Transport};
use hyper_util::rt::TokioIo;
use std::time::Duration;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

/// Connect to a shim endpoint.
pub async fn connect(transport: &Transport) -> HcsliteResult<Channel> {
    match transport {
        Transport::Unix { socket_path } => {
            let socket_path = socket_path.clone();
            let channel = Endpoint::try_from("http://[::]:50051")
                .map_err(|err| HcsliteError::Internal(err.to_string()))?
                .connect_with_connector(service_fn(move |_: Uri| {
                    let socket_path = socket_path.clone();
                    async move {
                        let stream = tokio::net::UnixStream::connect(socket_path).await?;
                        Ok::<_, std::io::Error>(TokioIo::new(stream))
                    }
                }))
                .await
                .map_err(|err| HcsliteError::Internal(format!("dialling shim: {err}")))?;
            Ok(channel)
        }

        Transport::Tcp { port } => {
            let addr = format!("http://127.0.0.1:{}", port);
            let channel = Endpoint::try_from(addr)
                .map_err(|err| HcsliteError::Internal(err.to_string()))?
                .connect()
                .await
                .map_err(|err| HcsliteError::Internal(format!("dialling shim: {err}")))?;
            Ok(channel)
        }

        #[cfg(windows)]
        Transport::Pipe { name } => {
            let name = name.clone();
            let channel = Endpoint::try_from("http://[::]:50051")
                .map_err(|err| HcsliteError::Internal(err.to_string()))?
                .connect_with_connector(service_fn(move |_: Uri| {
                    let name = name.clone();
                    async move {
                        let client =
                            tokio::net::windows::named_pipe::ClientOptions::new().open(&name)?;
                        Ok::<_, std::io::Error>(TokioIo::new(client))
                    }
                }))
                .await
                .map_err(|err| HcsliteError::Internal(format!("dialling shim: {err}")))?;
            Ok(channel)
        }

        #[cfg(not(windows))]
        Transport::Pipe { name } => Err(HcsliteError::Unimplemented(format!(
            "named pipe endpoint {name} on this platform"
        ))),
    }
}

/// Connect with an overall deadline.
pub async fn try_connect(transport: &Transport, timeout: Duration) -> HcsliteResult<Channel> {
    tokio::time::timeout(timeout, connect(transport))
        .await
        .map_err(|_| HcsliteError::Timeout(format!("dial {transport}")))?
}
