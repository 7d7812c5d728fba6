//! Sandbox-specific behaviour exercised at the task layer: host-process
//! execution inside the utility VM and VM sharing by sandbox id.

mod common;

use common::{test_config, within};
use hcslite::compute::ComputeBackend;
use hcslite::events::EventPublisher;
use hcslite::notify::NotificationDispatcher;
use hcslite::relay::StdioSet;
use hcslite::task::vm::HostProcessRequest;
use hcslite::Task;
use hcslite_shared::HcsliteError;
use hcslite_test_utils::bundle::{self, BundleOs};
use hcslite_test_utils::{MockBackend, MockController};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Harness {
    backend: Arc<dyn ComputeBackend>,
    controller: MockController,
    dispatcher: Arc<NotificationDispatcher>,
    publisher: Arc<EventPublisher>,
}

fn harness() -> Harness {
    let (backend, controller) = MockBackend::new();
    let backend: Arc<dyn ComputeBackend> = backend;
    let dispatcher = NotificationDispatcher::new();
    dispatcher.run(backend.take_notifications().unwrap());
    Harness {
        backend,
        controller,
        dispatcher,
        publisher: Arc::new(EventPublisher::discard("k8s-test")),
    }
}

async fn make_task(
    harness: &Harness,
    id: &str,
    os: BundleOs,
    annotations: &[(&str, &str)],
) -> (Arc<Task>, TempDir) {
    let dir = TempDir::new().unwrap();
    bundle::write_config(dir.path(), os, annotations);
    let task = Task::create(
        id,
        dir.path(),
        StdioSet::none(),
        Vec::new(),
        &harness.backend,
        &harness.dispatcher,
        &harness.publisher,
        &test_config(),
    )
    .await
    .expect("create task");
    (task, dir)
}

const SANDBOX_ANNOTATIONS: &[(&str, &str)] =
    &[("io.kubernetes.cri.container-type", "podsandbox")];

#[tokio::test]
async fn exec_in_host_runs_inside_the_vm() {
    let harness = harness();
    let (task, _dir) =
        make_task(&harness, "p1", BundleOs::Linux, SANDBOX_ANNOTATIONS).await;
    task.start("").await.expect("start sandbox");

    let controller = harness.controller.clone();
    let running = {
        let task = Arc::clone(&task);
        tokio::spawn(async move {
            task.exec_in_host(HostProcessRequest {
                args: vec!["ps".into()],
                timeout: Some(Duration::from_secs(5)),
                ..Default::default()
            })
            .await
        })
    };

    // First mock pid is deterministic; the sandbox init has no process of
    // its own, so the host process is the first one.
    tokio::time::sleep(Duration::from_millis(50)).await;
    controller.exit_process(1000, 17);

    let exit_code = within(running).await.unwrap().expect("host exec");
    assert_eq!(exit_code, 17);
}

#[tokio::test]
async fn exec_in_host_is_rejected_on_container_tasks() {
    let harness = harness();
    let (task, _dir) = make_task(&harness, "c1", BundleOs::Windows, &[]).await;

    let err = task
        .exec_in_host(HostProcessRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, HcsliteError::Unimplemented(_)));
}

#[tokio::test]
async fn containers_join_their_sandbox_vm_by_id() {
    let harness = harness();
    let (sandbox, _sandbox_dir) =
        make_task(&harness, "p1", BundleOs::Linux, SANDBOX_ANNOTATIONS).await;
    sandbox.start("").await.expect("start sandbox");

    let (container, _container_dir) = make_task(
        &harness,
        "c1",
        BundleOs::Linux,
        &[
            ("io.kubernetes.cri.container-type", "container"),
            ("io.kubernetes.cri.sandbox-id", "p1"),
        ],
    )
    .await;

    assert_eq!(container.sandbox_id(), Some("p1"));
}

#[tokio::test]
async fn joining_a_missing_sandbox_fails_fast() {
    let harness = harness();
    let dir = TempDir::new().unwrap();
    bundle::write_config(
        dir.path(),
        BundleOs::Linux,
        &[
            ("io.kubernetes.cri.container-type", "container"),
            ("io.kubernetes.cri.sandbox-id", "nonsuch"),
        ],
    );

    let err = Task::create(
        "c1",
        dir.path(),
        StdioSet::none(),
        Vec::new(),
        &harness.backend,
        &harness.dispatcher,
        &harness.publisher,
        &test_config(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, HcsliteError::NotFound(_)));
}
