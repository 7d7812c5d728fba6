//! Stdio relay end-to-end through the service: manager-side endpoints are
//! real sockets the shim dials; the workload side is the mock backend's
//! stream pair.

#![cfg(unix)]

mod common;

use common::{fixture, within};
use hcslite_shared::Task as TaskRpc;
use hcslite_shared::{CreateTaskRequest, DeleteRequest, StartRequest, WaitRequest};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;
use tonic::Request;

#[tokio::test]
async fn workload_output_reaches_the_manager_endpoint() {
    let fx = fixture("t1");

    let stdin_path = fx.bundle.path().join("stdin.sock");
    let stdout_path = fx.bundle.path().join("stdout.sock");
    let stdin_listener = UnixListener::bind(&stdin_path).unwrap();
    let stdout_listener = UnixListener::bind(&stdout_path).unwrap();

    fx.service
        .create(Request::new(CreateTaskRequest {
            id: fx.task_id.clone(),
            bundle: fx.bundle_path(),
            stdin: stdin_path.display().to_string(),
            stdout: stdout_path.display().to_string(),
            ..Default::default()
        }))
        .await
        .expect("create");

    // The shim dials while start is in flight.
    let accept = async {
        let (stdin_conn, _) = stdin_listener.accept().await.unwrap();
        let (stdout_conn, _) = stdout_listener.accept().await.unwrap();
        (stdin_conn, stdout_conn)
    };
    let start = fx.service.start(Request::new(StartRequest {
        id: fx.task_id.clone(),
        exec_id: String::new(),
    }));
    let (endpoints, started) = tokio::join!(accept, start);
    let (mut manager_stdin, mut manager_stdout) = endpoints;
    let pid = started.expect("start").into_inner().pid;

    // Manager -> workload.
    let mut workload_stdin = fx.controller.take_stdin(pid).expect("stdin wired");
    manager_stdin.write_all(b"input line\n").await.unwrap();
    manager_stdin.shutdown().await.unwrap();
    let mut seen = vec![0u8; 11];
    within(workload_stdin.read_exact(&mut seen)).await.unwrap();
    assert_eq!(&seen, b"input line\n");

    // Workload -> manager, then exit.
    let mut workload_stdout = fx.controller.take_stdout(pid).expect("stdout wired");
    workload_stdout.write_all(b"hello from the box").await.unwrap();
    drop(workload_stdout);
    fx.controller.exit_process(pid, 0);

    let mut output = Vec::new();
    within(manager_stdout.read_to_end(&mut output)).await.unwrap();
    assert_eq!(output, b"hello from the box");

    let waited = within(fx.service.wait(Request::new(WaitRequest {
        id: fx.task_id.clone(),
        exec_id: String::new(),
    })))
    .await
    .unwrap()
    .into_inner();
    assert_eq!(waited.exit_status, 0);

    fx.service
        .delete(Request::new(DeleteRequest {
            id: fx.task_id.clone(),
            exec_id: String::new(),
        }))
        .await
        .expect("delete");
}

#[tokio::test]
async fn missing_endpoint_fails_the_start_but_keeps_the_exec_created() {
    let fx = fixture("t1");
    let absent = fx.bundle.path().join("absent.sock");

    fx.service
        .create(Request::new(CreateTaskRequest {
            id: fx.task_id.clone(),
            bundle: fx.bundle_path(),
            stdout: absent.display().to_string(),
            ..Default::default()
        }))
        .await
        .expect("create");

    // Nobody listens on the endpoint: the dial times out and start fails.
    let err = fx
        .service
        .start(Request::new(StartRequest {
            id: fx.task_id.clone(),
            exec_id: String::new(),
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), tonic::Code::DeadlineExceeded);

    // The exec stays Created, so a retry is possible once the endpoint
    // exists.
    let listener = UnixListener::bind(&absent).unwrap();
    let accept = async {
        let _ = listener.accept().await.unwrap();
    };
    let start = fx.service.start(Request::new(StartRequest {
        id: fx.task_id.clone(),
        exec_id: String::new(),
    }));
    let (_, started) = tokio::join!(accept, start);
    assert!(started.expect("retry start").into_inner().pid > 0);
}
